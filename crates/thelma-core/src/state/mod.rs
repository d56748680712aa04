//! Environment and release state.
//!
//! A [`State`] is an immutable snapshot: reads always observe one consistent
//! view, and callers must [`StateStore::reload`] after a write to see its
//! effects. Releases refer to clusters by name; lookups go through the
//! snapshot.

pub mod document;
pub mod local;

pub use document::StateDocument;
pub use local::LocalStateStore;

use crate::environment::{AutoDelete, Environment, ScheduleBegin, ScheduleEnd};
use crate::error::{Result, ThelmaError};
use crate::pin::VersionOverrides;
use crate::release::{Cluster, Release};
use async_trait::async_trait;
use std::collections::HashMap;

/// Environment whose releases supply versions of last resort.
pub const DEV_ENVIRONMENT: &str = "dev";

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Request to create a dynamic environment from a template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateEnvironment {
    pub name: String,
    pub template: String,
    pub owner: String,
    pub auto_delete: Option<AutoDelete>,
    pub offline_schedule_begin: Option<ScheduleBegin>,
    pub offline_schedule_end: Option<ScheduleEnd>,
}

/// Read/write access to the state service.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load a fresh snapshot.
    async fn reload(&self) -> Result<State>;

    /// Create a dynamic environment. Fails with `Conflict` if the name is
    /// taken (by an environment or a cluster) or the template is not a
    /// template, and `NotFound` if the template does not exist.
    async fn create_from_template(&self, req: &CreateEnvironment) -> Result<()>;

    async fn delete_environment(&self, name: &str) -> Result<()>;

    async fn pin_environment_to_terra_helmfile_ref(&self, name: &str, git_ref: &str)
        -> Result<()>;

    /// Merge `overrides` over the environment's existing pins and return the
    /// merged (effective) map.
    async fn pin_versions(&self, name: &str, overrides: &VersionOverrides)
        -> Result<VersionOverrides>;

    /// Remove all pins; returns the pins that were removed.
    async fn unpin_versions(&self, name: &str) -> Result<VersionOverrides>;

    async fn set_offline(&self, name: &str, offline: bool) -> Result<()>;
}

// ---------------------------------------------------------------------------
// State snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct State {
    environments: Vec<Environment>,
    clusters: Vec<Cluster>,
}

impl State {
    /// Build a snapshot, filling in missing release versions from each
    /// environment's template and then from the `dev` environment.
    pub fn new(mut environments: Vec<Environment>, clusters: Vec<Cluster>) -> Self {
        resolve_missing_versions(&mut environments);
        Self {
            environments,
            clusters,
        }
    }

    pub fn environments(&self) -> Environments<'_> {
        Environments { state: self }
    }

    pub fn clusters(&self) -> Clusters<'_> {
        Clusters { state: self }
    }

    pub fn releases(&self) -> Releases<'_> {
        Releases { state: self }
    }

    /// Destination cluster of a release.
    pub fn cluster_of(&self, release: &Release) -> Result<&Cluster> {
        self.clusters().get(&release.cluster)
    }
}

fn resolve_missing_versions(environments: &mut [Environment]) {
    let mut known: HashMap<(String, String), (String, Option<String>)> = HashMap::new();
    for env in environments.iter() {
        for r in &env.releases {
            known.insert(
                (env.name.clone(), r.name.clone()),
                (r.chart_version.clone(), r.app_version().map(str::to_string)),
            );
        }
    }

    let lookup = |env: &str, release: &str, pick: &dyn Fn(&(String, Option<String>)) -> Option<String>| {
        known
            .get(&(env.to_string(), release.to_string()))
            .and_then(pick)
            .filter(|v| !v.is_empty())
    };

    for env in environments.iter_mut() {
        let template = env.template.clone();
        for r in env.releases.iter_mut() {
            if r.chart_version.is_empty() {
                let pick = |v: &(String, Option<String>)| Some(v.0.clone());
                if let Some(v) = lookup(&template, &r.name, &pick)
                    .or_else(|| lookup(DEV_ENVIRONMENT, &r.name, &pick))
                {
                    r.chart_version = v;
                }
            }
            if r.app_version().is_some_and(str::is_empty) {
                let pick = |v: &(String, Option<String>)| v.1.clone();
                if let Some(v) = lookup(&template, &r.name, &pick)
                    .or_else(|| lookup(DEV_ENVIRONMENT, &r.name, &pick))
                {
                    r.set_app_version(&v);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

pub struct Environments<'a> {
    state: &'a State,
}

impl<'a> Environments<'a> {
    pub fn get(&self, name: &str) -> Result<&'a Environment> {
        self.state
            .environments
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ThelmaError::not_found("environment", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state.environments.iter().any(|e| e.name == name)
    }

    pub fn all(&self) -> Vec<&'a Environment> {
        self.state.environments.iter().collect()
    }

    pub fn filter(&self, f: impl Fn(&Environment) -> bool) -> Vec<&'a Environment> {
        self.state.environments.iter().filter(|e| f(e)).collect()
    }
}

pub struct Clusters<'a> {
    state: &'a State,
}

impl<'a> Clusters<'a> {
    pub fn get(&self, name: &str) -> Result<&'a Cluster> {
        self.state
            .clusters
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ThelmaError::not_found("cluster", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state.clusters.iter().any(|c| c.name == name)
    }

    pub fn all(&self) -> Vec<&'a Cluster> {
        self.state.clusters.iter().collect()
    }
}

pub struct Releases<'a> {
    state: &'a State,
}

impl<'a> Releases<'a> {
    /// All releases, app releases first (environment order) then cluster
    /// releases.
    pub fn all(&self) -> Vec<&'a Release> {
        self.state
            .environments
            .iter()
            .flat_map(|e| e.releases.iter())
            .chain(self.state.clusters.iter().flat_map(|c| c.releases.iter()))
            .collect()
    }

    pub fn filter(&self, f: impl Fn(&Release) -> bool) -> Vec<&'a Release> {
        self.all().into_iter().filter(|r| f(r)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
