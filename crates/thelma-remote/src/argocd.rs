//! ArgoCD REST API.
//!
//! Implements the raw per-application surface; the polling protocol lives in
//! `thelma_core::argocd::ArgoSyncer`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thelma_core::argocd::ArgoApi;
use thelma_core::types::{HealthStatus, SyncCode, SyncStatus};
use thelma_core::{Result, ThelmaError};
use tracing::{debug, info};

use crate::http::{Body, HttpClient};
use crate::token::TokenProvider;

const DEFAULT_OPERATION_POLL: Duration = Duration::from_secs(5);
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Application {
    status: ApplicationStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ApplicationStatus {
    health: StatusField,
    sync: StatusField,
    operation_state: Option<OperationState>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatusField {
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct OperationState {
    phase: String,
    message: String,
    finished_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResourceTree {
    nodes: Vec<ResourceNode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResourceNode {
    kind: String,
    name: String,
    namespace: String,
    group: String,
    version: String,
}

impl ApplicationStatus {
    fn sync_status(&self) -> SyncStatus {
        SyncStatus::new(
            HealthStatus::parse(&self.health.status),
            SyncCode::parse(&self.sync.status),
        )
    }
}

/// Phase of the app's current operation: `None` while it is still running.
fn finished_phase(op: &OperationState) -> Option<&str> {
    match op.phase.as_str() {
        "Succeeded" | "Failed" | "Error" => Some(op.phase.as_str()),
        _ if op.finished_at.is_some() => Some(op.phase.as_str()),
        _ => None,
    }
}

fn restartable(node: &ResourceNode) -> bool {
    matches!(node.kind.as_str(), "Deployment" | "StatefulSet")
}

// ---------------------------------------------------------------------------
// ArgoHttpApi
// ---------------------------------------------------------------------------

pub struct ArgoHttpApi {
    http: HttpClient,
    operation_poll: Duration,
    operation_timeout: Duration,
}

impl ArgoHttpApi {
    pub fn new(addr: &str, token: Arc<dyn TokenProvider>) -> Result<Self> {
        Ok(Self::from_client(HttpClient::new("argocd", addr, token)?))
    }

    pub fn from_client(http: HttpClient) -> Self {
        Self {
            http,
            operation_poll: DEFAULT_OPERATION_POLL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_operation_poll(mut self, poll: Duration, timeout: Duration) -> Self {
        self.operation_poll = poll;
        self.operation_timeout = timeout;
        self
    }

    fn app_path(app: &str) -> String {
        format!("/api/v1/applications/{app}")
    }

    async fn get_app(&self, app: &str) -> Result<Application> {
        self.http.get(&Self::app_path(app)).await
    }

    async fn wait_operation(&self, app: &str) -> Result<SyncStatus> {
        loop {
            let current = self.get_app(app).await?;
            if let Some(op) = &current.status.operation_state {
                match finished_phase(op) {
                    Some("Succeeded") => return Ok(current.status.sync_status()),
                    Some(phase) => {
                        return Err(ThelmaError::remote(
                            "argocd",
                            format!("sync of {app} {}: {}", phase.to_lowercase(), op.message),
                        ))
                    }
                    None => debug!(app = %app, phase = %op.phase, "sync in progress"),
                }
            }
            tokio::time::sleep(self.operation_poll).await;
        }
    }
}

#[async_trait]
impl ArgoApi for ArgoHttpApi {
    async fn hard_refresh(&self, app: &str) -> Result<()> {
        let path = format!("{}?refresh=hard", Self::app_path(app));
        let _: serde_json::Value = self.http.get(&path).await?;
        Ok(())
    }

    async fn app_exists(&self, app: &str) -> Result<bool> {
        // ArgoCD answers 403 rather than 404 for apps the caller cannot see,
        // which includes apps that do not exist yet.
        match self.http.get_status(&Self::app_path(app)).await? {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(false),
            s => Err(ThelmaError::remote(
                "argocd",
                format!("GET {}: HTTP {}", Self::app_path(app), s.as_u16()),
            )),
        }
    }

    async fn app_status(&self, app: &str) -> Result<SyncStatus> {
        Ok(self.get_app(app).await?.status.sync_status())
    }

    async fn sync(&self, app: &str) -> Result<SyncStatus> {
        let path = format!("{}/sync", Self::app_path(app));
        let _: serde_json::Value = self.http.post(&path, json!({ "prune": true })).await?;
        debug!(app = %app, "sync triggered");
        match tokio::time::timeout(self.operation_timeout, self.wait_operation(app)).await {
            Ok(result) => result,
            Err(_) => Err(ThelmaError::Timeout {
                what: format!("sync operation on {app} to finish"),
                seconds: self.operation_timeout.as_secs(),
            }),
        }
    }

    async fn restart_workloads(&self, app: &str) -> Result<()> {
        let tree: ResourceTree = self
            .http
            .get(&format!("{}/resource-tree", Self::app_path(app)))
            .await?;
        for node in tree.nodes.iter().filter(|n| restartable(n)) {
            let path = format!(
                "{}/resource/actions?namespace={}&resourceName={}&group={}&version={}&kind={}",
                Self::app_path(app),
                node.namespace,
                node.name,
                node.group,
                node.version,
                node.kind
            );
            let _: serde_json::Value = self
                .http
                .json(Method::POST, &path, Body::Json(json!("restart")))
                .await?;
            info!(app = %app, kind = %node.kind, name = %node.name, "restarted");
        }
        Ok(())
    }
}
