//! Builds the BEE API from the loaded configuration.
//!
//! Nothing here talks to a remote service: clients authenticate lazily on
//! their first request, so read-only commands against a local state file
//! work offline.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use thelma_core::argocd::ArgoSyncer;
use thelma_core::bee::{Bees, BeesConfig, Collaborators};
use thelma_core::config::{Config, StateBackend, WarnLevel};
use thelma_core::hooks::CleanupHooks;
use thelma_core::logs::{ArtifactStore, LocalArtifactStore, PodLogExporter};
use thelma_core::metrics::LoggingMetrics;
use thelma_core::notify::{NoopNotifier, Notifier};
use thelma_core::seed::SeedRunner;
use thelma_core::state::{LocalStateStore, StateStore};
use thelma_remote::{
    ArgoHttpApi, EnvOrGcloudToken, GcloudIdentityTokens, GcsArtifactStore, GcsStateStore,
    HttpSeedClients, KubeClient, SherlockStateStore, SlackNotifier, StaticToken,
};
use tracing::{debug, error, warn};

use crate::root::Locations;

const GCS_TOKEN_ENV: &str = "GCS_TOKEN";

pub struct App {
    pub bees: Bees,
    pub hooks: CleanupHooks,
}

impl App {
    pub fn build(locations: &Locations) -> anyhow::Result<Self> {
        let config = Config::load(&locations.config)
            .with_context(|| format!("failed to load {}", locations.config.display()))?
            .with_env_overrides();
        report_warnings(&config)?;

        let hooks = CleanupHooks::new();
        let bees = Bees::new(collaborators(&config, locations, &hooks)?, BeesConfig::from_config(&config));
        Ok(Self { bees, hooks })
    }
}

fn report_warnings(config: &Config) -> anyhow::Result<()> {
    let mut fatal = false;
    for w in config.validate() {
        match w.level {
            WarnLevel::Error => {
                error!("config: {}", w.message);
                fatal = true;
            }
            _ => debug!("config: {}", w.message),
        }
    }
    if fatal {
        anyhow::bail!("invalid configuration");
    }
    Ok(())
}

fn collaborators(config: &Config, locations: &Locations, hooks: &CleanupHooks) -> anyhow::Result<Collaborators> {
    let state = state_store(config, locations)?;

    let argo_api = ArgoHttpApi::new(
        &config.argocd.addr,
        Arc::new(EnvOrGcloudToken::new(&config.argocd.token_env)),
    )
    .context("failed to build argocd client")?;
    let argocd = ArgoSyncer::new(Arc::new(argo_api))
        .with_healthy_poll(Duration::from_secs(config.argocd.wait_healthy_poll_seconds));

    let kube = Arc::new(KubeClient::new(config.kubernetes.clone()));
    {
        let kube = Arc::clone(&kube);
        hooks.add("stop port-forwards", move || async move {
            kube.stop_port_forwards();
            Ok::<_, thelma_core::ThelmaError>(())
        });
    }

    let seed_clients = HttpSeedClients::new(Arc::new(GcloudIdentityTokens::new(
        config.seed.service_accounts.clone(),
    )))
    .context("failed to build seed clients")?;
    let seeder = SeedRunner::new(seed_clients, kube.clone(), config.seed.clone(), &config.bee.domain);

    let local: Arc<dyn ArtifactStore> =
        Arc::new(LocalArtifactStore::new(config.artifacts_dir(&locations.home)));
    let mut logs = PodLogExporter::new(kube.clone(), local);
    if let Some(bucket) = config.artifacts.bucket.as_deref().filter(|b| !b.trim().is_empty()) {
        let gcs = GcsArtifactStore::new(bucket, Arc::new(EnvOrGcloudToken::new(GCS_TOKEN_ENV)))
            .context("failed to build artifact store")?;
        logs = logs.with_remote(Arc::new(gcs), &config.artifacts.cache_control);
    }

    Ok(Collaborators {
        state,
        argocd: Arc::new(argocd),
        kube,
        seeder: Arc::new(seeder),
        logs: Arc::new(logs),
        notifier: notifier(config)?,
        metrics: Arc::new(LoggingMetrics),
    })
}

fn state_store(config: &Config, locations: &Locations) -> anyhow::Result<Arc<dyn StateStore>> {
    match config.state.backend {
        StateBackend::Local => {
            let path = config.state_path(&locations.home);
            debug!(path = %path.display(), "using local state");
            Ok(Arc::new(
                LocalStateStore::new(path)
                    .with_stale_lock(Duration::from_secs(config.state.stale_lock_seconds)),
            ))
        }
        StateBackend::Gcs => {
            let bucket = config.state.bucket.as_deref().unwrap_or_default();
            debug!(bucket, object = %config.state.object, "using cloud storage state");
            let store = GcsStateStore::new(
                bucket,
                &config.state.object,
                Arc::new(EnvOrGcloudToken::new(GCS_TOKEN_ENV)),
            )
            .context("failed to build cloud storage client")?
            .with_stale_lock(Duration::from_secs(config.state.stale_lock_seconds));
            Ok(Arc::new(store))
        }
        StateBackend::Sherlock => {
            let store = SherlockStateStore::new(
                &config.sherlock.addr,
                Arc::new(EnvOrGcloudToken::new(&config.sherlock.token_env)),
            )
            .context("failed to build sherlock client")?;
            Ok(Arc::new(store))
        }
    }
}

/// Slack when a bot token is present in the environment, otherwise nothing.
fn notifier(config: &Config) -> anyhow::Result<Arc<dyn Notifier>> {
    let token = std::env::var(&config.slack.token_env)
        .ok()
        .filter(|t| !t.trim().is_empty());
    let Some(token) = token else {
        debug!(var = %config.slack.token_env, "no slack token, notifications disabled");
        return Ok(Arc::new(NoopNotifier));
    };
    let webhook = std::env::var(&config.slack.devops_webhook_env).ok();
    if webhook.is_none() {
        warn!(var = %config.slack.devops_webhook_env, "no devops webhook, alerts disabled");
    }
    let slack = SlackNotifier::new(Arc::new(StaticToken(token)), webhook)
        .context("failed to build slack client")?;
    Ok(Arc::new(slack))
}
