//! Recording in-memory fakes for every collaborator trait.
//!
//! All fakes share one [`CallLog`] so tests can assert on cross-service
//! ordering. Failures are injected per operation with [`Failures::inject`]
//! and consumed one call at a time.

use crate::argocd::{ArgoCd, SyncOptions, SyncOutcome, WaitExistOptions};
use crate::bee::{Bees, BeesConfig, Collaborators};
use crate::environment::Environment;
use crate::error::{Result, ThelmaError};
use crate::kube::{ForwardTarget, Kubernetes, PodInfo, PortForward, StatefulSetInfo};
use crate::logs::{ExportOptions, Location, LogExporter};
use crate::metrics::NoopMetrics;
use crate::notify::Notifier;
use crate::pin::VersionOverrides;
use crate::release::{Cluster, Release};
use crate::seed::{Identity, RetryPolicy, SeedClients, SeedOptions, Seeder};
use crate::state::{CreateEnvironment, State, StateDocument, StateStore};
use crate::types::{Lifecycle, SyncStatus};
use async_trait::async_trait;
use chrono::{Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// CallLog / Failures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Exact match.
    pub fn contains(&self, call: &str) -> bool {
        self.0.lock().unwrap().iter().any(|c| c == call)
    }

    /// Number of calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Index of the first call starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|c| c.starts_with(prefix))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Failures(Arc<Mutex<HashMap<String, VecDeque<ThelmaError>>>>);

impl Failures {
    /// Make the next call to `op` fail with `err`. Repeated injections queue.
    pub fn inject(&self, op: &str, err: ThelmaError) {
        self.0
            .lock()
            .unwrap()
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn take(&self, op: &str) -> Result<()> {
        match self.0.lock().unwrap().get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// FakeStateStore
// ---------------------------------------------------------------------------

pub struct FakeStateStore {
    pub doc: Mutex<StateDocument>,
    pub log: CallLog,
    pub failures: Failures,
    /// Arguments of every `pin_versions` call.
    pub pinned: Mutex<Vec<(String, VersionOverrides)>>,
}

impl FakeStateStore {
    pub fn new(log: CallLog, doc: StateDocument) -> Self {
        Self {
            doc: Mutex::new(doc),
            log,
            failures: Failures::default(),
            pinned: Mutex::new(Vec::new()),
        }
    }

    fn mutate<T>(&self, op: &str, call: String, f: impl FnOnce(&mut StateDocument) -> Result<T>) -> Result<T> {
        self.log.record(call);
        self.failures.take(op)?;
        let mut doc = self.doc.lock().unwrap();
        let out = f(&mut doc)?;
        doc.generation += 1;
        Ok(out)
    }
}

#[async_trait]
impl StateStore for FakeStateStore {
    async fn reload(&self) -> Result<State> {
        self.failures.take("state.reload")?;
        Ok(self.doc.lock().unwrap().clone().into_state())
    }

    async fn create_from_template(&self, req: &CreateEnvironment) -> Result<()> {
        self.mutate(
            "state.create",
            format!("state.create {} {}", req.name, req.template),
            |d| d.create_from_template(req, Utc::now()),
        )
    }

    async fn delete_environment(&self, name: &str) -> Result<()> {
        self.mutate("state.delete", format!("state.delete {name}"), |d| {
            d.delete_environment(name)
        })
    }

    async fn pin_environment_to_terra_helmfile_ref(&self, name: &str, git_ref: &str) -> Result<()> {
        self.mutate("state.pin_ref", format!("state.pin_ref {name} {git_ref}"), |d| {
            d.pin_terra_helmfile_ref(name, git_ref)
        })
    }

    async fn pin_versions(&self, name: &str, overrides: &VersionOverrides) -> Result<VersionOverrides> {
        self.pinned
            .lock()
            .unwrap()
            .push((name.to_string(), overrides.clone()));
        self.mutate("state.pin_versions", format!("state.pin_versions {name}"), |d| {
            d.pin_versions(name, overrides)
        })
    }

    async fn unpin_versions(&self, name: &str) -> Result<VersionOverrides> {
        self.mutate("state.unpin", format!("state.unpin {name}"), |d| d.unpin_versions(name))
    }

    async fn set_offline(&self, name: &str, offline: bool) -> Result<()> {
        self.mutate(
            "state.set_offline",
            format!("state.set_offline {name} {offline}"),
            |d| d.set_offline(name, offline),
        )
    }
}

// ---------------------------------------------------------------------------
// FakeArgoCd
// ---------------------------------------------------------------------------

pub struct FakeArgoCd {
    pub log: CallLog,
    pub failures: Failures,
    /// Status reported for a release after sync; unlisted releases are healthy.
    pub statuses: Mutex<HashMap<String, SyncStatus>>,
    /// Arguments of every `sync_releases` call.
    pub sync_calls: Mutex<Vec<(Vec<String>, usize, SyncOptions)>>,
}

impl FakeArgoCd {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            failures: Failures::default(),
            statuses: Mutex::new(HashMap::new()),
            sync_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_status(&self, release: &str, status: SyncStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(release.to_string(), status);
    }
}

#[async_trait]
impl ArgoCd for FakeArgoCd {
    async fn hard_refresh(&self, app: &str) -> Result<()> {
        self.log.record(format!("argocd.hard_refresh {app}"));
        self.failures.take("argocd.hard_refresh")
    }

    async fn wait_exist(&self, app: &str, _opts: WaitExistOptions) -> Result<()> {
        self.log.record(format!("argocd.wait_exist {app}"));
        self.failures.take("argocd.wait_exist")
    }

    async fn wait_healthy(&self, app: &str, _timeout_seconds: u64) -> Result<SyncStatus> {
        self.log.record(format!("argocd.wait_healthy {app}"));
        self.failures.take("argocd.wait_healthy")?;
        Ok(SyncStatus::healthy_and_synced())
    }

    async fn sync_app(&self, app: &str, _opts: &SyncOptions) -> Result<SyncStatus> {
        self.log.record(format!("argocd.sync_app {app}"));
        self.failures.take("argocd.sync_app")?;
        Ok(SyncStatus::healthy_and_synced())
    }

    async fn sync_releases(&self, releases: &[Release], max_parallel: usize, opts: &SyncOptions) -> SyncOutcome {
        let names: Vec<String> = releases.iter().map(|r| r.name.clone()).collect();
        self.log
            .record(format!("argocd.sync_releases {}", names.join(",")));
        self.sync_calls
            .lock()
            .unwrap()
            .push((names.clone(), max_parallel, opts.clone()));

        let statuses = self.statuses.lock().unwrap();
        let mut outcome = SyncOutcome::default();
        let mut failed = Vec::new();
        for name in names {
            let status = statuses
                .get(&name)
                .copied()
                .unwrap_or_else(SyncStatus::healthy_and_synced);
            if opts.wait_healthy && !status.is_healthy() {
                failed.push(name.clone());
            }
            outcome.statuses.insert(name, status);
        }
        if let Err(e) = self.failures.take("argocd.sync_releases") {
            outcome.error = Some(e);
        } else if !failed.is_empty() {
            outcome.error = Some(ThelmaError::Partial { failed });
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// FakeKubernetes
// ---------------------------------------------------------------------------

pub const FAKE_FORWARD_PORT: u16 = 40000;

pub struct FakeKubernetes {
    pub log: CallLog,
    pub failures: Failures,
    pub stateful_sets: Mutex<Vec<StatefulSetInfo>>,
}

impl FakeKubernetes {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            failures: Failures::default(),
            stateful_sets: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Kubernetes for FakeKubernetes {
    async fn create_namespace(&self, env: &Environment) -> Result<()> {
        self.log
            .record(format!("kube.create_namespace {}", env.namespace()));
        self.failures.take("kube.create_namespace")
    }

    async fn list_stateful_sets(&self, env: &Environment) -> Result<Vec<StatefulSetInfo>> {
        self.log
            .record(format!("kube.list_stateful_sets {}", env.namespace()));
        self.failures.take("kube.list_stateful_sets")?;
        Ok(self.stateful_sets.lock().unwrap().clone())
    }

    async fn restart_stateful_set(&self, env: &Environment, name: &str) -> Result<()> {
        self.log
            .record(format!("kube.restart_stateful_set {} {name}", env.namespace()));
        self.failures.take("kube.restart_stateful_set")
    }

    async fn delete_pvc(&self, env: &Environment, name: &str) -> Result<()> {
        self.log
            .record(format!("kube.delete_pvc {} {name}", env.namespace()));
        self.failures.take("kube.delete_pvc")
    }

    async fn port_forward(&self, release: &Release, target: &ForwardTarget) -> Result<PortForward> {
        self.log.record(format!(
            "kube.port_forward {} {target}:{}",
            release.name, target.port
        ));
        self.failures.take("kube.port_forward")?;
        let log = self.log.clone();
        Ok(PortForward::new(FAKE_FORWARD_PORT, move || {
            log.record("kube.port_forward_stopped")
        }))
    }

    async fn list_pods(&self, release: &Release) -> Result<Vec<PodInfo>> {
        self.log.record(format!("kube.list_pods {}", release.name));
        self.failures.take("kube.list_pods")?;
        Ok(vec![PodInfo {
            name: format!("{}-0", release.name),
            containers: vec![format!("{}-app", release.name), "proxy".to_string()],
        }])
    }

    async fn container_logs(&self, release: &Release, pod: &str, container: &str) -> Result<Vec<u8>> {
        self.log.record(format!(
            "kube.container_logs {} {pod} {container}",
            release.name
        ));
        self.failures.take("kube.container_logs")?;
        Ok(format!("logs of {pod}/{container}\n").into_bytes())
    }
}

// ---------------------------------------------------------------------------
// FakeSeeder / FakeSeedClients
// ---------------------------------------------------------------------------

pub struct FakeSeeder {
    pub log: CallLog,
    pub failures: Failures,
}

impl FakeSeeder {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            failures: Failures::default(),
        }
    }
}

#[async_trait]
impl Seeder for FakeSeeder {
    async fn seed(&self, env: &Environment, _cluster: &Cluster, _opts: &SeedOptions) -> Result<()> {
        self.log.record(format!("seed {}", env.name));
        self.failures.take("seed")
    }

    async fn unseed(&self, env: &Environment, _cluster: &Cluster, opts: &SeedOptions) -> Result<()> {
        self.log.record(format!("unseed {}", env.name));
        env.ensure_destroyable(opts.force)?;
        self.failures.take("unseed")
    }
}

pub struct FakeSeedClients {
    pub log: CallLog,
    pub failures: Failures,
}

impl FakeSeedClients {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            failures: Failures::default(),
        }
    }
}

#[async_trait]
impl SeedClients for FakeSeedClients {
    async fn elasticsearch_put(&self, url: &str, _body: &serde_json::Value) -> Result<()> {
        self.log.record(format!("seed.es_put {url}"));
        self.failures.take("seed.es_put")
    }

    async fn register_profile(&self, orch_url: &str, identity: &Identity) -> Result<()> {
        self.log
            .record(format!("seed.register_profile {orch_url} {identity}"));
        self.failures.take("seed.register_profile")
    }

    async fn add_sam_sa_permissions(&self, sam_url: &str, emails: &[String]) -> Result<()> {
        self.log.record(format!(
            "seed.add_sam_sa_permissions {sam_url} {}",
            emails.join(",")
        ));
        self.failures.take("seed.add_sam_sa_permissions")
    }

    async fn accept_terms_of_service(&self, sam_url: &str, identity: &Identity) -> Result<()> {
        self.log.record(format!("seed.accept_tos {sam_url} {identity}"));
        self.failures.take("seed.accept_tos")
    }

    async fn create_agora_methods_repository(
        &self,
        orch_url: &str,
        identity: &Identity,
        _payload: &serde_json::Value,
    ) -> Result<()> {
        self.log
            .record(format!("seed.create_agora {orch_url} {identity}"));
        self.failures.take("seed.create_agora")
    }

    async fn unregister_user(&self, sam_url: &str, identity: &Identity) -> Result<()> {
        self.log.record(format!("seed.unregister {sam_url} {identity}"));
        self.failures.take("seed.unregister")
    }

    async fn refresh_application_default_credentials(&self) -> Result<()> {
        self.log.record("seed.refresh_adc");
        self.failures.take("seed.refresh_adc")
    }
}

// ---------------------------------------------------------------------------
// FakeLogExporter / FakeNotifier
// ---------------------------------------------------------------------------

pub struct FakeLogExporter {
    pub log: CallLog,
    pub failures: Failures,
}

impl FakeLogExporter {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            failures: Failures::default(),
        }
    }
}

#[async_trait]
impl LogExporter for FakeLogExporter {
    async fn export(&self, releases: &[Release], opts: &ExportOptions) -> Result<BTreeMap<String, Location>> {
        let names: Vec<&str> = releases.iter().map(|r| r.name.as_str()).collect();
        self.log
            .record(format!("logs.export {} upload={}", names.join(","), opts.upload));
        self.failures.take("logs.export")?;
        Ok(names
            .into_iter()
            .map(|n| (n.to_string(), format!("file:///tmp/thelma/{n}.log")))
            .collect())
    }
}

pub struct FakeNotifier {
    pub log: CallLog,
    pub failures: Failures,
    /// `(recipient, text)` of every delivered message.
    pub messages: Mutex<Vec<(String, String)>>,
}

impl FakeNotifier {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            failures: Failures::default(),
            messages: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send_direct_message(&self, email: &str, markdown: &str) -> Result<()> {
        self.log.record(format!("notify.dm {email}"));
        self.failures.take("notify.dm")?;
        self.messages
            .lock()
            .unwrap()
            .push((email.to_string(), markdown.to_string()));
        Ok(())
    }

    async fn send_devops_alert(&self, title: &str, text: &str, ok: bool) -> Result<()> {
        self.log.record(format!("notify.alert {title} ok={ok}"));
        self.failures.take("notify.alert")?;
        self.messages
            .lock()
            .unwrap()
            .push(("#devops".to_string(), text.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const OWNER: &str = "jdoe@broadinstitute.org";
pub const BEE_RELEASES: &[&str] = &["leonardo", "sam", "workspacemanager"];

fn releases_for(env: &str, names: &[&str]) -> Vec<Release> {
    names
        .iter()
        .map(|n| Release::app(*n, env, "terra-qa-bees").with_versions("1.0.0", "a1b2c3d"))
        .collect()
}

/// `dev`, the `swatomation` template and a two-hour-old `my-bee` derived
/// from it, all on `terra-qa-bees`.
pub fn fixture_document() -> StateDocument {
    let mut dev = Environment::new("dev", Lifecycle::Static, "terra-dev");
    dev.releases = releases_for("dev", BEE_RELEASES);

    let mut template = Environment::new("swatomation", Lifecycle::Template, "terra-qa-bees");
    template.releases = releases_for("swatomation", BEE_RELEASES);

    let mut bee = Environment::new("my-bee", Lifecycle::Dynamic, "terra-qa-bees");
    bee.template = "swatomation".into();
    bee.owner = OWNER.into();
    bee.created_at = Utc::now() - Duration::hours(2);
    bee.releases = releases_for("my-bee", BEE_RELEASES);

    StateDocument {
        generation: 1,
        environments: vec![dev, template, bee],
        clusters: vec![
            Cluster::new("terra-qa-bees", "broad-dsde-qa"),
            Cluster::new("terra-dev", "broad-dsde-dev"),
        ],
    }
}

// ---------------------------------------------------------------------------
// UsEastern2024
// ---------------------------------------------------------------------------

/// US Eastern time with its 2024 daylight-saving changes (EDT from March 10
/// 07:00 UTC until November 3 06:00 UTC, EST otherwise), so schedule tests
/// can cross DST without depending on the host zone.
#[derive(Debug, Clone, Copy)]
pub struct UsEastern2024;

const EST_SECS: i32 = -5 * 3600;
const EDT_SECS: i32 = -4 * 3600;

impl TimeZone for UsEastern2024 {
    type Offset = FixedOffset;

    fn from_offset(_: &FixedOffset) -> Self {
        UsEastern2024
    }

    fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
        self.offset_from_local_datetime(&local.and_time(NaiveTime::MIN))
    }

    fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
        let fits = |secs: i32| {
            let offset = FixedOffset::east_opt(secs).unwrap();
            let utc = *local - Duration::seconds(secs.into());
            (self.offset_from_utc_datetime(&utc) == offset).then_some(offset)
        };
        match (fits(EDT_SECS), fits(EST_SECS)) {
            (Some(earlier), Some(later)) => LocalResult::Ambiguous(earlier, later),
            (Some(o), None) | (None, Some(o)) => LocalResult::Single(o),
            (None, None) => LocalResult::None,
        }
    }

    fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
        self.offset_from_utc_datetime(&utc.and_time(NaiveTime::MIN))
    }

    fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
        let begin = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap().and_hms_opt(7, 0, 0).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 11, 3).unwrap().and_hms_opt(6, 0, 0).unwrap();
        let secs = if *utc >= begin && *utc < end { EDT_SECS } else { EST_SECS };
        FixedOffset::east_opt(secs).unwrap()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A [`Bees`] wired to fakes, with handles to each fake.
pub struct Harness {
    pub log: CallLog,
    pub state: Arc<FakeStateStore>,
    pub argocd: Arc<FakeArgoCd>,
    pub kube: Arc<FakeKubernetes>,
    pub seeder: Arc<FakeSeeder>,
    pub logs: Arc<FakeLogExporter>,
    pub notifier: Arc<FakeNotifier>,
    pub bees: Bees,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_document(fixture_document())
    }

    pub fn with_document(doc: StateDocument) -> Self {
        let log = CallLog::default();
        let state = Arc::new(FakeStateStore::new(log.clone(), doc));
        let argocd = Arc::new(FakeArgoCd::new(log.clone()));
        let kube = Arc::new(FakeKubernetes::new(log.clone()));
        let seeder = Arc::new(FakeSeeder::new(log.clone()));
        let logs = Arc::new(FakeLogExporter::new(log.clone()));
        let notifier = Arc::new(FakeNotifier::new(log.clone()));

        let mut config = BeesConfig::default();
        config.seed_retry = RetryPolicy {
            attempts: 3,
            backoff: std::time::Duration::ZERO,
        };

        let bees = Bees::new(
            Collaborators {
                state: state.clone(),
                argocd: argocd.clone(),
                kube: kube.clone(),
                seeder: seeder.clone(),
                logs: logs.clone(),
                notifier: notifier.clone(),
                metrics: Arc::new(NoopMetrics),
            },
            config,
        );

        Self {
            log,
            state,
            argocd,
            kube,
            seeder,
            logs,
            notifier,
            bees,
        }
    }

    pub fn environment(&self, name: &str) -> Option<Environment> {
        self.state
            .doc
            .lock()
            .unwrap()
            .environments
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
