//! The BEE API: lifecycle operations over Branch Engineering Environments.
//!
//! [`Bees`] composes the state store, ArgoCD, Kubernetes, the seeder, the log
//! exporter, and the notifier. It holds no state of its own between calls;
//! every operation starts from a fresh snapshot and reloads after writing.
//!
//! Operations that can fail after doing useful work return a [`BeeOutcome`]
//! carrying both the BEE (with per-release sync statuses and exported log
//! locations) and the error. Failures that prevent the operation from
//! starting at all, such as an unknown environment, are returned as `Err`.

mod delete;
mod filter;
mod options;
mod provision;
mod schedule;

pub use delete::BulkOutcome;
pub use filter::BeeFilter;
pub use options::{
    generate_name, ApplyScheduleOptions, CreateOptions, DeleteOptions, ProvisionExistingOptions,
    ProvisionOptions, ResetOptions, StartStopOptions,
};
pub use schedule::{ScheduleFlip, ScheduleOutcome};

use crate::argocd::{environment_generator, ArgoCd, SyncOptions, SyncOutcome, WaitExistOptions, BASE_GENERATOR};
use crate::config::Config;
use crate::environment::Environment;
use crate::error::{Result, ThelmaError};
use crate::kube::Kubernetes;
use crate::lifecycle::BeeState;
use crate::logs::{Location, LogExporter};
use crate::metrics::MetricsSink;
use crate::notify::Notifier;
use crate::pin::{self, PinOptions};
use crate::release::Cluster;
use crate::seed::{RetryPolicy, Seeder};
use crate::state::{State, StateStore};
use crate::types::SyncStatus;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Bee
// ---------------------------------------------------------------------------

/// An environment plus what this run observed about it.
#[derive(Debug, Clone, PartialEq)]
pub struct Bee {
    pub environment: Environment,
    pub state: BeeState,
    /// Per-release status from the most recent sync.
    pub sync_statuses: BTreeMap<String, SyncStatus>,
    pub log_locations: BTreeMap<String, Location>,
}

impl Bee {
    pub fn new(environment: Environment, state: BeeState) -> Self {
        Self {
            environment,
            state,
            sync_statuses: BTreeMap::new(),
            log_locations: BTreeMap::new(),
        }
    }

    fn existing(environment: Environment) -> Self {
        let state = BeeState::existing(environment.offline);
        Self::new(environment, state)
    }

    pub fn name(&self) -> &str {
        &self.environment.name
    }

    fn transition(&mut self, next: BeeState) -> Result<()> {
        self.state = self.state.transition(next)?;
        debug!(bee = %self.environment.name, state = %self.state, "bee state");
        Ok(())
    }
}

/// A BEE together with the error that interrupted the operation, if any.
#[derive(Debug)]
pub struct BeeOutcome {
    pub bee: Bee,
    pub error: Option<ThelmaError>,
}

impl BeeOutcome {
    fn ok(bee: Bee) -> Self {
        Self { bee, error: None }
    }

    fn failed(bee: Bee, error: ThelmaError) -> Self {
        Self {
            bee,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<Bee> {
        match self.error {
            None => Ok(self.bee),
            Some(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration and collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BeesConfig {
    pub base_generator: String,
    pub wait_exist: WaitExistOptions,
    pub seed_retry: RetryPolicy,
    pub domain: String,
    pub default_template: String,
    pub wait_healthy_timeout_seconds: u64,
    pub start_stop_wait_healthy_timeout_seconds: u64,
    pub max_parallel: usize,
}

impl Default for BeesConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl BeesConfig {
    pub fn from_config(config: &Config) -> Self {
        let base_generator = if config.argocd.base_generator.is_empty() {
            BASE_GENERATOR.to_string()
        } else {
            config.argocd.base_generator.clone()
        };
        Self {
            base_generator,
            wait_exist: WaitExistOptions {
                timeout: Duration::from_secs(config.argocd.wait_exist_timeout_seconds),
                poll: Duration::from_secs(config.argocd.wait_exist_poll_seconds),
            },
            seed_retry: RetryPolicy {
                attempts: config.bee.seed_attempts,
                backoff: Duration::from_secs(config.bee.seed_backoff_seconds),
            },
            domain: config.bee.domain.clone(),
            default_template: config.bee.default_template.clone(),
            wait_healthy_timeout_seconds: config.bee.wait_healthy_timeout_seconds,
            start_stop_wait_healthy_timeout_seconds: config.bee.start_stop_wait_healthy_timeout_seconds,
            max_parallel: config.bee.max_parallel,
        }
    }
}

/// Every external service the BEE API talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub state: Arc<dyn StateStore>,
    pub argocd: Arc<dyn ArgoCd>,
    pub kube: Arc<dyn Kubernetes>,
    pub seeder: Arc<dyn Seeder>,
    pub logs: Arc<dyn LogExporter>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<dyn MetricsSink>,
}

// ---------------------------------------------------------------------------
// Bees
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Bees {
    c: Collaborators,
    config: BeesConfig,
}

impl Bees {
    pub fn new(collaborators: Collaborators, config: BeesConfig) -> Self {
        Self {
            c: collaborators,
            config,
        }
    }

    pub fn config(&self) -> &BeesConfig {
        &self.config
    }

    pub async fn state(&self) -> Result<State> {
        self.c.state.reload().await
    }

    /// Address of the BEE's Terra UI.
    pub fn url(&self, name: &str) -> String {
        format!("https://terraui.{name}.{}", self.config.domain)
    }

    /// Look up an environment by name. Any lifecycle is returned; callers
    /// that destroy things check [`Environment::ensure_destroyable`].
    pub async fn get(&self, name: &str) -> Result<Bee> {
        let state = self.state().await?;
        let env = state.environments().get(name)?.clone();
        Ok(Bee::existing(env))
    }

    pub async fn get_template(&self, name: &str) -> Result<Environment> {
        let state = self.state().await?;
        template_from(&state, name).cloned()
    }

    pub async fn filter_bees(&self, filter: &BeeFilter) -> Result<Vec<Bee>> {
        let state = self.state().await?;
        Ok(state
            .environments()
            .filter(|e| filter.matches(e))
            .into_iter()
            .cloned()
            .map(Bee::existing)
            .collect())
    }

    // -----------------------------------------------------------------------
    // ArgoCD building blocks
    // -----------------------------------------------------------------------

    /// Hard-refresh the base generator so it notices added or removed
    /// environments.
    pub async fn refresh_bee_generator(&self) -> Result<()> {
        debug!(app = %self.config.base_generator, "refreshing bee generator");
        self.c.argocd.hard_refresh(&self.config.base_generator).await
    }

    /// Wait for the environment's generator to appear, then sync it.
    pub async fn sync_environment_generator(&self, env: &Environment) -> Result<SyncStatus> {
        let generator = environment_generator(&env.name);
        self.c
            .argocd
            .wait_exist(&generator, self.config.wait_exist)
            .await?;
        self.c
            .argocd
            .sync_app(&generator, &SyncOptions::default())
            .await
    }

    /// Sync every release of `env` at once.
    pub async fn sync_argo_apps_in(&self, env: &Environment, opts: &SyncOptions) -> SyncOutcome {
        let parallel = env.releases.len().max(1);
        info!(bee = %env.name, releases = env.releases.len(), "syncing argo apps");
        self.c
            .argocd
            .sync_releases(&env.releases, parallel, opts)
            .await
    }

    // -----------------------------------------------------------------------
    // Pinning
    // -----------------------------------------------------------------------

    /// Pin versions and return the BEE as stored afterwards. Follow with a
    /// generator refresh and sync before syncing apps.
    pub async fn pin_versions(&self, name: &str, opts: &PinOptions) -> Result<Bee> {
        let bee = self.get(name).await?;
        let effective = pin::apply(self.c.state.as_ref(), &bee.environment, opts).await?;
        info!(bee = %name, pins = effective.len(), "pinned versions");
        self.get(name).await
    }

    pub async fn unpin_versions(&self, name: &str) -> Result<Bee> {
        let bee = self.get(name).await?;
        let removed = self.c.state.unpin_versions(&bee.environment.name).await?;
        info!(bee = %name, removed = removed.len(), "unpinned versions");
        self.get(name).await
    }
}

fn template_from<'a>(state: &'a State, name: &str) -> Result<&'a Environment> {
    let env = state
        .environments()
        .get(name)
        .map_err(|_| ThelmaError::not_found("template", name))?;
    if !env.is_template() {
        return Err(ThelmaError::Conflict(format!(
            "{name} is a {} environment, not a template",
            env.lifecycle
        )));
    }
    Ok(env)
}

fn cluster_for<'a>(state: &'a State, env: &Environment) -> Result<&'a Cluster> {
    state.clusters().get(&env.default_cluster)
}
