//! ArgoCD sync protocol.
//!
//! [`ArgoApi`] is the raw per-application surface (implemented over HTTP in
//! `thelma-remote`). [`ArgoSyncer`] layers the polling protocol on top of it
//! and implements [`ArgoCd`], which is what the orchestrator consumes.

use crate::error::{Result, ThelmaError};
use crate::release::Release;
use crate::types::{HealthStatus, SyncCode, SyncStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub const BASE_GENERATOR: &str = "terra-bee-generator";

const DEFAULT_HEALTHY_POLL: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

pub fn environment_generator(env: &str) -> String {
    format!("terra-{env}-generator")
}

/// Legacy configs app paired with an app release.
pub fn legacy_configs_app(release: &Release) -> Option<String> {
    release
        .environment()
        .map(|env| format!("{}-configs-{}", release.name, env))
}

// ---------------------------------------------------------------------------
// Options / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitExistOptions {
    pub timeout: Duration,
    pub poll: Duration,
}

impl Default for WaitExistOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub hard_refresh: bool,
    pub wait_healthy: bool,
    pub wait_healthy_timeout_seconds: u64,
    pub skip_legacy_configs_restart: bool,
    /// Sync even when the app already reports Synced and Healthy.
    pub sync_if_no_diff: bool,
}

/// Per-release statuses plus the aggregate failure, if any. Statuses are
/// always populated, including for failed releases.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub statuses: BTreeMap<String, SyncStatus>,
    pub error: Option<ThelmaError>,
}

impl SyncOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ArgoApi: Send + Sync {
    async fn hard_refresh(&self, app: &str) -> Result<()>;
    async fn app_exists(&self, app: &str) -> Result<bool>;
    async fn app_status(&self, app: &str) -> Result<SyncStatus>;
    /// Trigger a sync and return the status once the operation finishes.
    async fn sync(&self, app: &str) -> Result<SyncStatus>;
    /// Rolling-restart the deployments and stateful sets owned by `app`.
    async fn restart_workloads(&self, app: &str) -> Result<()>;
}

#[async_trait]
pub trait ArgoCd: Send + Sync {
    async fn hard_refresh(&self, app: &str) -> Result<()>;
    async fn wait_exist(&self, app: &str, opts: WaitExistOptions) -> Result<()>;
    async fn wait_healthy(&self, app: &str, timeout_seconds: u64) -> Result<SyncStatus>;
    async fn sync_app(&self, app: &str, opts: &SyncOptions) -> Result<SyncStatus>;
    async fn sync_releases(
        &self,
        releases: &[Release],
        max_parallel: usize,
        opts: &SyncOptions,
    ) -> SyncOutcome;
}

// ---------------------------------------------------------------------------
// ArgoSyncer
// ---------------------------------------------------------------------------

pub struct ArgoSyncer<A> {
    api: Arc<A>,
    healthy_poll: Duration,
}

impl<A> Clone for ArgoSyncer<A> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            healthy_poll: self.healthy_poll,
        }
    }
}

impl<A: ArgoApi + 'static> ArgoSyncer<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self {
            api,
            healthy_poll: DEFAULT_HEALTHY_POLL,
        }
    }

    pub fn with_healthy_poll(mut self, poll: Duration) -> Self {
        self.healthy_poll = poll;
        self
    }

    async fn poll_exist(&self, app: &str, poll: Duration) -> Result<()> {
        loop {
            if self.api.app_exists(app).await? {
                return Ok(());
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn poll_healthy(&self, app: &str) -> Result<SyncStatus> {
        loop {
            let status = self.api.app_status(app).await?;
            if status.is_healthy() {
                return Ok(status);
            }
            debug!(app = %app, %status, "waiting for healthy");
            tokio::time::sleep(self.healthy_poll).await;
        }
    }

    /// Sync without waiting for health. Returns the status and whether a
    /// sync was actually triggered.
    async fn sync_once(&self, app: &str, opts: &SyncOptions) -> Result<(SyncStatus, bool)> {
        if opts.hard_refresh {
            self.api.hard_refresh(app).await?;
        }
        if !opts.sync_if_no_diff {
            let current = self.api.app_status(app).await?;
            if current.is_synced() && current.is_healthy() {
                debug!(app = %app, "already synced and healthy, skipping");
                return Ok((current, false));
            }
        }
        debug!(app = %app, "syncing");
        Ok((self.api.sync(app).await?, true))
    }

    async fn sync_release(&self, release: &Release, opts: &SyncOptions) -> Result<SyncStatus> {
        let app = release.full_name();

        let mut configs_synced = false;
        if let Some(configs) = legacy_configs_app(release) {
            if self.api.app_exists(&configs).await? {
                let (_, synced) = self.sync_once(&configs, opts).await?;
                configs_synced = synced;
            }
        }

        let (mut status, _) = self.sync_once(&app, opts).await?;

        if configs_synced && !opts.skip_legacy_configs_restart {
            info!(app = %app, "restarting workloads after configs sync");
            self.api.restart_workloads(&app).await?;
        }

        if opts.wait_healthy {
            status = self
                .wait_healthy(&app, opts.wait_healthy_timeout_seconds)
                .await?;
        }
        Ok(status)
    }
}

#[async_trait]
impl<A: ArgoApi + 'static> ArgoCd for ArgoSyncer<A> {
    async fn hard_refresh(&self, app: &str) -> Result<()> {
        debug!(app = %app, "hard refresh");
        self.api.hard_refresh(app).await
    }

    async fn wait_exist(&self, app: &str, opts: WaitExistOptions) -> Result<()> {
        match tokio::time::timeout(opts.timeout, self.poll_exist(app, opts.poll)).await {
            Ok(r) => r,
            Err(_) => Err(ThelmaError::Timeout {
                what: format!("application {app} to exist"),
                seconds: opts.timeout.as_secs(),
            }),
        }
    }

    async fn wait_healthy(&self, app: &str, timeout_seconds: u64) -> Result<SyncStatus> {
        let timeout = Duration::from_secs(timeout_seconds);
        match tokio::time::timeout(timeout, self.poll_healthy(app)).await {
            Ok(r) => r,
            Err(_) => Err(ThelmaError::Timeout {
                what: format!("application {app} to become healthy"),
                seconds: timeout_seconds,
            }),
        }
    }

    async fn sync_app(&self, app: &str, opts: &SyncOptions) -> Result<SyncStatus> {
        let (status, _) = self.sync_once(app, opts).await?;
        if opts.wait_healthy {
            return self.wait_healthy(app, opts.wait_healthy_timeout_seconds).await;
        }
        Ok(status)
    }

    async fn sync_releases(
        &self,
        releases: &[Release],
        max_parallel: usize,
        opts: &SyncOptions,
    ) -> SyncOutcome {
        let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
        let results: Arc<Mutex<Vec<(String, SyncStatus, Option<ThelmaError>)>>> =
            Arc::new(Mutex::new(Vec::with_capacity(releases.len())));

        let mut handles = Vec::with_capacity(releases.len());
        for release in releases.iter().cloned() {
            let sem = semaphore.clone();
            let syncer = self.clone();
            let opts = opts.clone();
            let results = results.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.ok();
                let (status, err) = match syncer.sync_release(&release, &opts).await {
                    Ok(s) => (s, None),
                    Err(e) => {
                        warn!(release = %release.name, error = %e, "release sync failed");
                        let s = syncer
                            .api
                            .app_status(&release.full_name())
                            .await
                            .unwrap_or_else(|_| SyncStatus::new(HealthStatus::Unknown, SyncCode::Unknown));
                        (s, Some(e))
                    }
                };
                if let Ok(mut r) = results.lock() {
                    r.push((release.name.clone(), status, err));
                }
            }));
        }
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "release sync task failed");
            }
        }

        let collected = results
            .lock()
            .map(|mut g| std::mem::take(&mut *g))
            .unwrap_or_default();

        let mut outcome = SyncOutcome::default();
        let mut failed = Vec::new();
        for (name, status, err) in collected {
            let unhealthy = opts.wait_healthy && !status.is_healthy();
            if err.is_some() || unhealthy {
                failed.push(name.clone());
            }
            outcome.statuses.insert(name, status);
        }
        if !failed.is_empty() {
            failed.sort();
            outcome.error = Some(ThelmaError::Partial { failed });
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
