use crate::environment::{AutoDelete, ScheduleBegin, ScheduleEnd};
use crate::paths::MAX_ENVIRONMENT_NAME_LEN;
use crate::pin::PinOptions;
use crate::seed::SeedOptions;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

/// Options shared by every operation that converges an existing BEE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionExistingOptions {
    pub wait_healthy: bool,
    pub wait_healthy_timeout_seconds: u64,
    pub notify: bool,
    /// Stop after the environment generator is synced.
    pub sync_generator_only: bool,
}

impl Default for ProvisionExistingOptions {
    fn default() -> Self {
        Self {
            wait_healthy: true,
            wait_healthy_timeout_seconds: 1800,
            notify: false,
            sync_generator_only: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionOptions {
    pub seed: bool,
    pub seed_options: SeedOptions,
    pub pin_options: PinOptions,
    pub export_logs_on_failure: bool,
    pub existing: ProvisionExistingOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Generated from the template when empty.
    pub name: String,
    /// Falls back to the configured default template when empty.
    pub template: String,
    pub owner: String,
    pub auto_delete: Option<AutoDelete>,
    pub offline_schedule_begin: Option<ScheduleBegin>,
    pub offline_schedule_end: Option<ScheduleEnd>,
    pub provision: ProvisionOptions,
}

const NAME_SUFFIX_LEN: usize = 6;
const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// `<template>-<6 random lowercase alphanumerics>`, with the template prefix
/// cut short enough to stay within the environment name limit.
pub fn generate_name(template: &str) -> String {
    let max_prefix = MAX_ENVIRONMENT_NAME_LEN - NAME_SUFFIX_LEN - 1;
    let prefix: String = template.chars().take(max_prefix).collect();
    let prefix = prefix.trim_end_matches('-');

    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
        .collect();

    if prefix.is_empty() {
        format!("bee-{suffix}")
    } else {
        format!("{prefix}-{suffix}")
    }
}

// ---------------------------------------------------------------------------
// Delete / reset
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub unseed: bool,
    pub export_logs: bool,
    pub ignore_missing: bool,
    /// Permit deleting a non-dynamic environment.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetOptions {
    pub force: bool,
    pub notify: bool,
    pub unseed: bool,
    pub seed: bool,
    pub seed_options: SeedOptions,
    pub wait_healthy_timeout_seconds: u64,
}

impl Default for ResetOptions {
    fn default() -> Self {
        Self {
            force: false,
            notify: false,
            unseed: false,
            seed: true,
            seed_options: SeedOptions::default(),
            wait_healthy_timeout_seconds: 1200,
        }
    }
}

// ---------------------------------------------------------------------------
// Start / stop / schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartStopOptions {
    pub notify: bool,
    pub sync: bool,
}

impl Default for StartStopOptions {
    fn default() -> Self {
        Self {
            notify: true,
            sync: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyScheduleOptions {
    pub dry_run: bool,
    pub start: bool,
    pub stop: bool,
    /// How far back the evaluation window reaches.
    pub from_past: Duration,
    /// BEEs created more recently than this are left alone.
    pub creation_buffer: Duration,
    pub max_parallel: usize,
    /// Evaluation time; the current time when unset.
    pub now: Option<DateTime<Utc>>,
}

impl Default for ApplyScheduleOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            start: true,
            stop: true,
            from_past: Duration::minutes(20),
            creation_buffer: Duration::minutes(20),
            max_parallel: 10,
            now: None,
        }
    }
}
