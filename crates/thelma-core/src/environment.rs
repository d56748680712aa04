use crate::error::{Result, ThelmaError};
use crate::pin::VersionOverrides;
use crate::release::Release;
use crate::types::Lifecycle;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Schedule and auto-delete settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoDelete {
    pub enabled: bool,
    pub after: DateTime<Utc>,
}

impl AutoDelete {
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.after <= now
    }
}

/// Daily stop time. Only the time-of-day (in the stored offset) matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleBegin {
    pub enabled: bool,
    pub time: DateTime<FixedOffset>,
}

/// Daily start time, optionally applied on weekends too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEnd {
    pub enabled: bool,
    pub time: DateTime<FixedOffset>,
    #[serde(default)]
    pub weekends: bool,
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub name: String,
    /// Template this environment was derived from; empty for non-dynamic.
    #[serde(default)]
    pub template: String,
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub offline: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delete: Option<AutoDelete>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_schedule_begin: Option<ScheduleBegin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_schedule_end: Option<ScheduleEnd>,
    pub default_cluster: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terra_helmfile_ref: Option<String>,
    /// Persisted version overrides, keyed by release name.
    #[serde(default, skip_serializing_if = "VersionOverrides::is_empty")]
    pub pins: VersionOverrides,
    #[serde(default)]
    pub releases: Vec<Release>,
}

impl Environment {
    pub fn new(name: impl Into<String>, lifecycle: Lifecycle, cluster: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: String::new(),
            lifecycle,
            owner: String::new(),
            offline: false,
            created_at: Utc::now(),
            auto_delete: None,
            offline_schedule_begin: None,
            offline_schedule_end: None,
            default_cluster: cluster.into(),
            terra_helmfile_ref: None,
            pins: VersionOverrides::new(),
            releases: Vec::new(),
        }
    }

    pub fn namespace(&self) -> String {
        crate::paths::namespace_for(&self.name)
    }

    pub fn is_dynamic(&self) -> bool {
        self.lifecycle == Lifecycle::Dynamic
    }

    pub fn is_template(&self) -> bool {
        self.lifecycle == Lifecycle::Template
    }

    pub fn release(&self, name: &str) -> Option<&Release> {
        self.releases.iter().find(|r| r.name == name)
    }

    pub fn has_release(&self, name: &str) -> bool {
        self.release(name).is_some()
    }

    pub fn release_names(&self) -> Vec<String> {
        self.releases.iter().map(|r| r.name.clone()).collect()
    }

    /// Destructive operations (delete, reset, unseed) are limited to dynamic
    /// environments unless forced.
    pub fn ensure_destroyable(&self, force: bool) -> Result<()> {
        if self.is_dynamic() || force {
            return Ok(());
        }
        Err(ThelmaError::Fatal(format!(
            "{} is a {} environment; destructive operations require force",
            self.name, self.lifecycle
        )))
    }

    pub fn auto_delete_due(&self, now: DateTime<Utc>) -> bool {
        self.auto_delete.as_ref().is_some_and(|a| a.due(now))
    }

    pub fn schedule_begin_enabled(&self) -> bool {
        self.offline_schedule_begin
            .as_ref()
            .is_some_and(|b| b.enabled)
    }

    pub fn schedule_end_enabled(&self) -> bool {
        self.offline_schedule_end.as_ref().is_some_and(|e| e.enabled)
    }
}
