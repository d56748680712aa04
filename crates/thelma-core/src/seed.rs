//! First-run bootstrap of a freshly provisioned environment.
//!
//! Seeding runs six numbered steps. Each step checks that the services it
//! talks to are part of the environment and is skipped (with an `info` log)
//! when they are not. With `force`, step errors are downgraded to warnings.

use crate::config::SeedConfig;
use crate::environment::Environment;
use crate::error::{Result, ThelmaError};
use crate::kube::{ForwardTarget, Kubernetes};
use crate::release::Cluster;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const ELASTICSEARCH: &str = "elasticsearch";
pub const ORCH: &str = "firecloudorch";
pub const SAM: &str = "sam";

/// Releases whose service accounts get orchestration profiles in step 2.
const PROFILE_SERVICE_ACCOUNTS: &[&str] = &[ORCH, "rawls", SAM, "leonardo", "importservice"];
/// Releases whose service accounts are authorized in Sam in step 3.
const SAM_SERVICE_ACCOUNTS: &[&str] = &["rawls", "leonardo", "importservice", SAM];

pub const SET_ADC: &str = "set-adc";
pub const USE_ADC: &str = "use-adc";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Who a seed request authenticates as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// The service account of the named release.
    ServiceAccount(String),
    /// A user impersonated through domain-wide delegation.
    User(String),
    /// The caller's application-default credentials.
    ApplicationDefault,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::ServiceAccount(r) => write!(f, "sa:{r}"),
            Identity::User(email) => write!(f, "user:{email}"),
            Identity::ApplicationDefault => f.write_str("adc"),
        }
    }
}

// ---------------------------------------------------------------------------
// SeedOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedOptions {
    pub step1_create_elasticsearch: bool,
    pub step2_register_sa_profiles: bool,
    pub step3_add_sa_sam_permissions: bool,
    pub step4_register_test_users: bool,
    pub step5_create_agora_methods_repository: bool,
    pub step6_extra_user: Vec<String>,
    /// Disable every step not explicitly enabled above.
    pub no_steps: bool,
    pub force: bool,
    /// Shortcut for `step6_extra_user += ["use-adc"]`.
    pub register_self_shortcut: bool,
}

/// Which steps will run, after `no_steps` and shortcuts are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSteps {
    pub create_elasticsearch: bool,
    pub register_sa_profiles: bool,
    pub add_sa_sam_permissions: bool,
    pub register_test_users: bool,
    pub create_agora_methods_repository: bool,
    pub extra_users: Vec<String>,
}

impl SeedOptions {
    pub fn effective(&self) -> EffectiveSteps {
        let all = !self.no_steps;
        let mut extra_users = self.step6_extra_user.clone();
        if self.register_self_shortcut {
            extra_users.push(USE_ADC.to_string());
        }
        EffectiveSteps {
            create_elasticsearch: all || self.step1_create_elasticsearch,
            register_sa_profiles: all || self.step2_register_sa_profiles,
            add_sa_sam_permissions: all || self.step3_add_sa_sam_permissions,
            register_test_users: all || self.step4_register_test_users,
            create_agora_methods_repository: all || self.step5_create_agora_methods_repository,
            extra_users,
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// HTTP operations the seeder performs against environment services.
#[async_trait]
pub trait SeedClients: Send + Sync {
    /// PUT a JSON body; non-2xx responses are errors carrying the body.
    async fn elasticsearch_put(&self, url: &str, body: &serde_json::Value) -> Result<()>;
    async fn register_profile(&self, orch_url: &str, identity: &Identity) -> Result<()>;
    async fn add_sam_sa_permissions(&self, sam_url: &str, emails: &[String]) -> Result<()>;
    async fn accept_terms_of_service(&self, sam_url: &str, identity: &Identity) -> Result<()>;
    async fn create_agora_methods_repository(
        &self,
        orch_url: &str,
        identity: &Identity,
        payload: &serde_json::Value,
    ) -> Result<()>;
    async fn unregister_user(&self, sam_url: &str, identity: &Identity) -> Result<()>;
    async fn refresh_application_default_credentials(&self) -> Result<()>;
}

#[async_trait]
pub trait Seeder: Send + Sync {
    async fn seed(&self, env: &Environment, cluster: &Cluster, opts: &SeedOptions) -> Result<()>;
    async fn unseed(&self, env: &Environment, cluster: &Cluster, opts: &SeedOptions) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SeedRunner
// ---------------------------------------------------------------------------

pub struct SeedRunner<C> {
    clients: C,
    kube: Arc<dyn Kubernetes>,
    config: SeedConfig,
    domain: String,
}

impl<C: SeedClients> SeedRunner<C> {
    pub fn new(clients: C, kube: Arc<dyn Kubernetes>, config: SeedConfig, domain: impl Into<String>) -> Self {
        Self {
            clients,
            kube,
            config,
            domain: domain.into(),
        }
    }

    pub fn release_url(&self, env: &Environment, release: &str) -> String {
        format!("https://{release}.{}.{}", env.name, self.domain)
    }

    fn service_account(&self, release: &str) -> Result<&str> {
        self.config
            .service_accounts
            .get(release)
            .map(String::as_str)
            .ok_or_else(|| ThelmaError::not_found("service account", release))
    }

    fn test_users(&self, cluster: &Cluster) -> &[String] {
        self.config
            .test_users
            .get(cluster.project_suffix())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn step1_create_elasticsearch(&self, env: &Environment) -> Result<()> {
        let Some(es) = env.release(ELASTICSEARCH) else {
            return skip(1, ELASTICSEARCH);
        };
        let target = ForwardTarget::service(&self.config.elasticsearch_service, self.config.elasticsearch_port);
        let forward = self.kube.port_forward(es, &target).await?;
        let base = forward.local_url("http");

        let result = self.create_elasticsearch_index(&base).await;
        forward.stop();
        result
    }

    async fn create_elasticsearch_index(&self, base: &str) -> Result<()> {
        let index_url = format!("{base}/{}", self.config.elasticsearch_index);
        self.clients
            .elasticsearch_put(&index_url, &serde_json::json!({}))
            .await?;
        self.clients
            .elasticsearch_put(
                &format!("{base}/_settings"),
                &serde_json::json!({ "index": { "number_of_replicas": 0 } }),
            )
            .await
    }

    async fn step2_register_sa_profiles(&self, env: &Environment) -> Result<()> {
        if !env.has_release(ORCH) {
            return skip(2, ORCH);
        }
        let orch = self.release_url(env, ORCH);
        for release in PROFILE_SERVICE_ACCOUNTS.iter().filter(|r| env.has_release(r)) {
            info!(bee = %env.name, release = %release, "registering service account profile");
            self.clients
                .register_profile(&orch, &Identity::ServiceAccount(release.to_string()))
                .await?;
        }
        Ok(())
    }

    async fn step3_add_sa_sam_permissions(&self, env: &Environment) -> Result<()> {
        if !env.has_release(SAM) {
            return skip(3, SAM);
        }
        let emails = SAM_SERVICE_ACCOUNTS
            .iter()
            .filter(|r| env.has_release(r))
            .map(|r| self.service_account(r).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        self.clients
            .add_sam_sa_permissions(&self.release_url(env, SAM), &emails)
            .await
    }

    /// Terms of service are only accepted when the BEE runs Sam.
    async fn step4_register_test_users(&self, env: &Environment, cluster: &Cluster) -> Result<()> {
        if !env.has_release(ORCH) {
            return skip(4, ORCH);
        }
        let orch = self.release_url(env, ORCH);
        let sam = env.has_release(SAM).then(|| self.release_url(env, SAM));
        if sam.is_none() {
            info!(bee = %env.name, "no {SAM} release, test users will not accept terms of service");
        }
        let users = self.test_users(cluster);
        if users.is_empty() {
            warn!(bee = %env.name, project = %cluster.project, "no test users configured for project");
        }
        for email in users {
            let id = Identity::User(email.clone());
            self.clients.register_profile(&orch, &id).await?;
            if let Some(sam) = &sam {
                self.clients.accept_terms_of_service(sam, &id).await?;
            }
        }
        Ok(())
    }

    async fn step5_create_agora_methods_repository(&self, env: &Environment) -> Result<()> {
        if !env.has_release(ORCH) {
            return skip(5, ORCH);
        }
        self.clients
            .create_agora_methods_repository(
                &self.release_url(env, ORCH),
                &Identity::ServiceAccount(ORCH.to_string()),
                &self.config.agora_methods_repository,
            )
            .await
    }

    async fn step6_extra_users(&self, env: &Environment, users: &[String]) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        if !env.has_release(ORCH) {
            return skip(6, ORCH);
        }
        let orch = self.release_url(env, ORCH);
        let sam = env.has_release(SAM).then(|| self.release_url(env, SAM));
        for user in users {
            let id = match user.as_str() {
                SET_ADC => {
                    self.clients.refresh_application_default_credentials().await?;
                    Identity::ApplicationDefault
                }
                USE_ADC => Identity::ApplicationDefault,
                email if email.contains('@') => Identity::User(email.to_string()),
                other => {
                    return Err(ThelmaError::validation(format!(
                        "extra user must be an email, {SET_ADC} or {USE_ADC}: {other}"
                    )))
                }
            };
            info!(bee = %env.name, identity = %id, "registering extra user");
            self.clients.register_profile(&orch, &id).await?;
            if let Some(sam) = &sam {
                self.clients.accept_terms_of_service(sam, &id).await?;
            }
        }
        Ok(())
    }
}

fn skip(step: u8, missing: &str) -> Result<()> {
    info!(step, "skipping seed step: {missing} is not in the environment");
    Ok(())
}

/// Apply the `force` policy to one step's result.
fn settle(step: u8, force: bool, result: Result<()>) -> Result<()> {
    match result {
        Err(e) if force => {
            warn!(step, error = %e, "seed step failed, continuing (force)");
            Ok(())
        }
        Err(e) => {
            warn!(step, error = %e, "seed step failed");
            Err(e)
        }
        Ok(()) => Ok(()),
    }
}

#[async_trait]
impl<C: SeedClients> Seeder for SeedRunner<C> {
    async fn seed(&self, env: &Environment, cluster: &Cluster, opts: &SeedOptions) -> Result<()> {
        let steps = opts.effective();
        let force = opts.force;
        info!(bee = %env.name, "seeding");

        if steps.create_elasticsearch {
            settle(1, force, self.step1_create_elasticsearch(env).await)?;
        }
        if steps.register_sa_profiles {
            settle(2, force, self.step2_register_sa_profiles(env).await)?;
        }
        if steps.add_sa_sam_permissions {
            settle(3, force, self.step3_add_sa_sam_permissions(env).await)?;
        }
        if steps.register_test_users {
            settle(4, force, self.step4_register_test_users(env, cluster).await)?;
        }
        if steps.create_agora_methods_repository {
            settle(5, force, self.step5_create_agora_methods_repository(env).await)?;
        }
        settle(6, force, self.step6_extra_users(env, &steps.extra_users).await)?;
        Ok(())
    }

    async fn unseed(&self, env: &Environment, cluster: &Cluster, opts: &SeedOptions) -> Result<()> {
        env.ensure_destroyable(opts.force)?;
        if !env.has_release(SAM) {
            info!(bee = %env.name, "nothing to unseed: {SAM} is not in the environment");
            return Ok(());
        }
        let sam = self.release_url(env, SAM);
        info!(bee = %env.name, "unseeding");

        let identities = self
            .test_users(cluster)
            .iter()
            .map(|u| Identity::User(u.clone()))
            .chain(
                PROFILE_SERVICE_ACCOUNTS
                    .iter()
                    .filter(|r| env.has_release(r))
                    .map(|r| Identity::ServiceAccount(r.to_string())),
            );
        for id in identities {
            let result = self.clients.unregister_user(&sam, &id).await;
            settle(0, opts.force, result)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Retry driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Wait before the second attempt; doubled for each later one.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Seed with retries. Only the final error is returned.
pub async fn seed_with_retry(
    seeder: &dyn Seeder,
    env: &Environment,
    cluster: &Cluster,
    opts: &SeedOptions,
    policy: RetryPolicy,
) -> Result<()> {
    let attempts = policy.attempts.max(1);
    let mut wait = policy.backoff;
    let mut attempt = 1;
    loop {
        match seeder.seed(env, cluster, opts).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                warn!(bee = %env.name, attempt, attempts, error = %e, "seed failed, retrying");
                tokio::time::sleep(wait).await;
                wait = wait.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::Release;
    use crate::testing::{CallLog, FakeKubernetes, FakeSeedClients, FakeSeeder};
    use crate::types::Lifecycle;

    fn env_with(releases: &[&str]) -> Environment {
        let mut env = Environment::new("my-bee", Lifecycle::Dynamic, "terra-qa-bees");
        env.releases = releases
            .iter()
            .map(|r| Release::app(*r, "my-bee", "terra-qa-bees"))
            .collect();
        env
    }

    fn cluster() -> Cluster {
        Cluster::new("terra-qa-bees", "broad-dsde-qa")
    }

    fn runner(log: &CallLog) -> SeedRunner<FakeSeedClients> {
        let mut config = SeedConfig::default();
        config
            .test_users
            .insert("qa".into(), vec!["hermione.owner@quality.firecloud.org".into()]);
        SeedRunner::new(
            FakeSeedClients::new(log.clone()),
            Arc::new(FakeKubernetes::new(log.clone())),
            config,
            "bee.envs-terra.bio",
        )
    }

    #[test]
    fn no_steps_keeps_only_explicit_steps() {
        let opts = SeedOptions {
            no_steps: true,
            step3_add_sa_sam_permissions: true,
            register_self_shortcut: true,
            ..Default::default()
        };
        let steps = opts.effective();
        assert!(!steps.create_elasticsearch);
        assert!(steps.add_sa_sam_permissions);
        assert!(!steps.register_test_users);
        assert_eq!(steps.extra_users, vec![USE_ADC]);

        let all = SeedOptions::default().effective();
        assert!(all.create_elasticsearch && all.create_agora_methods_repository);
    }

    #[tokio::test]
    async fn full_seed_runs_steps_in_order() {
        let log = CallLog::default();
        let env = env_with(&["elasticsearch", "firecloudorch", "sam", "rawls"]);
        runner(&log)
            .seed(&env, &cluster(), &SeedOptions::default())
            .await
            .unwrap();

        let calls = log.entries();
        let first = |p: &str| calls.iter().position(|c| c.starts_with(p)).unwrap();
        assert!(first("kube.port_forward") < first("seed.es_put"));
        assert!(log.contains("kube.port_forward_stopped"));
        assert!(log.contains("seed.es_put http://127.0.0.1:40000/ontology"));
        assert!(log.contains("seed.es_put http://127.0.0.1:40000/_settings"));
        assert!(log.contains("seed.register_profile https://firecloudorch.my-bee.bee.envs-terra.bio sa:rawls"));
        assert!(first("seed.register_profile") < first("seed.add_sam_sa_permissions"));
        assert!(log.contains("seed.accept_tos https://sam.my-bee.bee.envs-terra.bio user:hermione.owner@quality.firecloud.org"));
        assert_eq!(log.count("seed.create_agora"), 1);
    }

    #[tokio::test]
    async fn steps_skip_when_dependency_missing() {
        let log = CallLog::default();
        let env = env_with(&["sam"]);
        runner(&log)
            .seed(&env, &cluster(), &SeedOptions::default())
            .await
            .unwrap();
        assert_eq!(log.count("kube.port_forward"), 0);
        assert_eq!(log.count("seed.register_profile"), 0);
        assert_eq!(log.count("seed.add_sam_sa_permissions"), 1);
        assert_eq!(log.count("seed.create_agora"), 0);
    }

    #[tokio::test]
    async fn test_users_register_without_sam() {
        let log = CallLog::default();
        let env = env_with(&["firecloudorch"]);
        let opts = SeedOptions {
            no_steps: true,
            step4_register_test_users: true,
            ..Default::default()
        };
        runner(&log).seed(&env, &cluster(), &opts).await.unwrap();
        assert!(log.contains(
            "seed.register_profile https://firecloudorch.my-bee.bee.envs-terra.bio user:hermione.owner@quality.firecloud.org"
        ));
        assert_eq!(log.count("seed.accept_tos"), 0);
    }

    #[tokio::test]
    async fn force_downgrades_step_errors() {
        let log = CallLog::default();
        let env = env_with(&["elasticsearch", "firecloudorch", "sam"]);
        let r = runner(&log);
        r.clients
            .failures
            .inject("seed.es_put", ThelmaError::remote("elasticsearch", "400: bad index"));

        let err = r
            .seed(&env, &cluster(), &SeedOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad index"));
        assert!(log.contains("kube.port_forward_stopped"));
        assert_eq!(log.count("seed.register_profile"), 0);

        r.clients
            .failures
            .inject("seed.es_put", ThelmaError::remote("elasticsearch", "400: bad index"));
        let opts = SeedOptions {
            force: true,
            ..Default::default()
        };
        r.seed(&env, &cluster(), &opts).await.unwrap();
        assert!(log.count("seed.register_profile") > 0);
    }

    #[tokio::test]
    async fn set_adc_refreshes_credentials_first() {
        let log = CallLog::default();
        let env = env_with(&["firecloudorch"]);
        let opts = SeedOptions {
            no_steps: true,
            step6_extra_user: vec![SET_ADC.into(), "jdoe@broadinstitute.org".into()],
            ..Default::default()
        };
        runner(&log).seed(&env, &cluster(), &opts).await.unwrap();
        let calls = log.entries();
        assert_eq!(calls[0], "seed.refresh_adc");
        assert!(calls[1].ends_with(" adc"));
        assert!(calls[2].ends_with("user:jdoe@broadinstitute.org"));
    }

    #[tokio::test]
    async fn unseed_requires_dynamic_unless_forced() {
        let log = CallLog::default();
        let mut env = env_with(&["sam", "rawls"]);
        env.lifecycle = Lifecycle::Static;
        let r = runner(&log);
        let err = r
            .unseed(&env, &cluster(), &SeedOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);

        let opts = SeedOptions {
            force: true,
            ..Default::default()
        };
        r.unseed(&env, &cluster(), &opts).await.unwrap();
        assert!(log.contains("seed.unregister https://sam.my-bee.bee.envs-terra.bio user:hermione.owner@quality.firecloud.org"));
        assert!(log.contains("seed.unregister https://sam.my-bee.bee.envs-terra.bio sa:rawls"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_after_transient_failures() {
        let log = CallLog::default();
        let seeder = FakeSeeder::new(log.clone());
        seeder.failures.inject("seed", ThelmaError::remote("sam", "503"));
        seeder.failures.inject("seed", ThelmaError::remote("sam", "503"));
        let env = env_with(&[]);
        seed_with_retry(&seeder, &env, &cluster(), &SeedOptions::default(), RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(log.count("seed my-bee"), 3);

        for _ in 0..3 {
            seeder.failures.inject("seed", ThelmaError::remote("sam", "final"));
        }
        let err = seed_with_retry(&seeder, &env, &cluster(), &SeedOptions::default(), RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("final"));
    }
}
