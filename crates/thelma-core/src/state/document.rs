use super::{CreateEnvironment, State};
use crate::environment::Environment;
use crate::error::{Result, ThelmaError};
use crate::io::{atomic_write, read_optional};
use crate::paths;
use crate::pin::{merge_overrides, VersionOverrides};
use crate::release::{Cluster, Release};
use crate::types::Lifecycle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// StateDocument
// ---------------------------------------------------------------------------

/// The persisted form of all environments and clusters.
///
/// Mutations here are pure: they validate and edit the document in memory.
/// Persistence, locking and generation checks belong to the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub clusters: Vec<Cluster>,
}

impl StateDocument {
    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Load from `path`. A missing file is an empty document at generation 0.
    pub fn load(path: &Path) -> Result<Self> {
        match read_optional(path)? {
            Some(data) if !data.iter().all(u8::is_ascii_whitespace) => {
                Ok(serde_json::from_slice(&data)?)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &data)
    }

    pub fn into_state(self) -> State {
        State::new(self.environments, self.clusters)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    fn environment_mut(&mut self, name: &str) -> Result<&mut Environment> {
        self.environments
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| ThelmaError::not_found("environment", name))
    }

    fn name_taken(&self, name: &str) -> bool {
        self.environments.iter().any(|e| e.name == name)
            || self.clusters.iter().any(|c| c.name == name)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn create_from_template(&mut self, req: &CreateEnvironment, now: DateTime<Utc>) -> Result<()> {
        paths::validate_environment_name(&req.name)?;
        if self.name_taken(&req.name) {
            return Err(ThelmaError::Conflict(format!(
                "name {} is already in use",
                req.name
            )));
        }

        let template = self
            .environments
            .iter()
            .find(|e| e.name == req.template)
            .ok_or_else(|| ThelmaError::not_found("template", &req.template))?;
        if template.lifecycle != Lifecycle::Template {
            return Err(ThelmaError::Conflict(format!(
                "{} is a {} environment, not a template",
                template.name, template.lifecycle
            )));
        }

        let mut env = Environment::new(&req.name, Lifecycle::Dynamic, &template.default_cluster);
        env.template = template.name.clone();
        env.owner = req.owner.clone();
        env.created_at = now;
        env.terra_helmfile_ref = template.terra_helmfile_ref.clone();
        env.auto_delete = req.auto_delete.clone();
        env.offline_schedule_begin = req.offline_schedule_begin.clone();
        env.offline_schedule_end = req.offline_schedule_end.clone();
        env.releases = template
            .releases
            .iter()
            .filter(|r| r.is_app())
            .map(|r| {
                Release::app(&r.name, &req.name, &template.default_cluster)
                    .with_chart(&r.chart_name, &r.repo)
                    .with_versions(&r.chart_version, r.app_version().unwrap_or_default())
            })
            .collect();

        self.environments.push(env);
        Ok(())
    }

    pub fn delete_environment(&mut self, name: &str) -> Result<()> {
        let before = self.environments.len();
        self.environments.retain(|e| e.name != name);
        if self.environments.len() == before {
            return Err(ThelmaError::not_found("environment", name));
        }
        Ok(())
    }

    pub fn pin_terra_helmfile_ref(&mut self, name: &str, git_ref: &str) -> Result<()> {
        let env = self.environment_mut(name)?;
        env.terra_helmfile_ref = Some(git_ref.to_string());
        for r in env.releases.iter_mut() {
            r.terra_helmfile_ref = Some(git_ref.to_string());
        }
        Ok(())
    }

    /// Merge `overrides` into the environment's pins, apply the result to
    /// its releases, and return the effective pins.
    pub fn pin_versions(&mut self, name: &str, overrides: &VersionOverrides) -> Result<VersionOverrides> {
        let env = self.environment_mut(name)?;
        if let Some(unknown) = overrides.keys().find(|r| !env.has_release(r)) {
            return Err(ThelmaError::not_found("release", format!("{name}/{unknown}")));
        }
        let merged = merge_overrides(&env.pins, overrides);
        for r in env.releases.iter_mut() {
            if let Some(o) = merged.get(&r.name) {
                o.apply_to(r);
            }
        }
        env.pins = merged.clone();
        Ok(merged)
    }

    /// Clear all pins. Release versions are blanked so the snapshot resolves
    /// them from the template again.
    pub fn unpin_versions(&mut self, name: &str) -> Result<VersionOverrides> {
        let env = self.environment_mut(name)?;
        let removed = std::mem::take(&mut env.pins);
        for r in env.releases.iter_mut() {
            if removed.contains_key(&r.name) {
                r.chart_version.clear();
                r.set_app_version("");
                r.terra_helmfile_ref = None;
                r.firecloud_develop_ref = None;
            }
        }
        Ok(removed)
    }

    pub fn set_offline(&mut self, name: &str, offline: bool) -> Result<()> {
        self.environment_mut(name)?.offline = offline;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
