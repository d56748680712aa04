//! Container log capture for failed operations.

use crate::error::{Result, ThelmaError};
use crate::kube::Kubernetes;
use crate::release::Release;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where an exported artifact ended up (a `file://` path or a console URL).
pub type Location = String;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Upload to the remote artifact store rather than only writing locally.
    pub upload: bool,
}

pub fn object_path(env: &str, at: DateTime<Utc>, release: &str, pod: &str, container: &str) -> String {
    format!(
        "{env}/{}/{release}/{pod}-{container}.log",
        at.format("%Y%m%dT%H%M%SZ")
    )
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(&self, object_path: &str, data: Vec<u8>, cache_control: &str) -> Result<Location>;
}

/// Writes artifacts under a local directory.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn upload(&self, object_path: &str, data: Vec<u8>, _cache_control: &str) -> Result<Location> {
        if object_path.split('/').any(|seg| seg == "..") {
            return Err(ThelmaError::validation(format!(
                "artifact path escapes the artifacts directory: {object_path}"
            )));
        }
        let path = self.root.join(object_path);
        let written = path.clone();
        tokio::task::spawn_blocking(move || crate::io::atomic_write(&path, &data))
            .await
            .map_err(|e| ThelmaError::Fatal(format!("artifact task join error: {e}")))??;
        Ok(format!("file://{}", written.display()))
    }
}

// ---------------------------------------------------------------------------
// LogExporter
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LogExporter: Send + Sync {
    /// Export logs for each release; returns one location per release that
    /// had at least one container log.
    async fn export(&self, releases: &[Release], opts: &ExportOptions) -> Result<BTreeMap<String, Location>>;
}

pub struct PodLogExporter {
    kube: Arc<dyn Kubernetes>,
    local: Arc<dyn ArtifactStore>,
    remote: Option<Arc<dyn ArtifactStore>>,
    cache_control: String,
}

impl PodLogExporter {
    pub fn new(kube: Arc<dyn Kubernetes>, local: Arc<dyn ArtifactStore>) -> Self {
        Self {
            kube,
            local,
            remote: None,
            cache_control: "no-store".to_string(),
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn ArtifactStore>, cache_control: impl Into<String>) -> Self {
        self.remote = Some(remote);
        self.cache_control = cache_control.into();
        self
    }

    async fn export_release(&self, release: &Release, at: DateTime<Utc>, opts: &ExportOptions) -> Result<Option<Location>> {
        let env = release.environment().unwrap_or(&release.cluster);
        let store = match (&self.remote, opts.upload) {
            (Some(remote), true) => remote,
            (None, true) => {
                debug!("no remote artifact store configured, writing logs locally");
                &self.local
            }
            _ => &self.local,
        };

        let mut first = None;
        for pod in self.kube.list_pods(release).await? {
            for container in &pod.containers {
                let logs = self.kube.container_logs(release, &pod.name, container).await?;
                let path = object_path(env, at, &release.name, &pod.name, container);
                let location = store.upload(&path, logs, &self.cache_control).await?;
                debug!(release = %release.name, pod = %pod.name, container = %container, %location, "exported logs");
                first.get_or_insert(location);
            }
        }
        Ok(first)
    }
}

#[async_trait]
impl LogExporter for PodLogExporter {
    async fn export(&self, releases: &[Release], opts: &ExportOptions) -> Result<BTreeMap<String, Location>> {
        let at = Utc::now();
        let mut out = BTreeMap::new();
        let mut errors = crate::error::ErrorAggregator::new();
        for release in releases {
            match self.export_release(release, at, opts).await {
                Ok(Some(location)) => {
                    out.insert(release.name.clone(), location);
                }
                Ok(None) => debug!(release = %release.name, "no pods to export logs from"),
                Err(e) => {
                    warn!(release = %release.name, error = %e, "log export failed");
                    errors.push(release.name.clone(), e);
                }
            }
        }
        if out.is_empty() {
            errors.into_result()?;
        }
        info!(releases = out.len(), "exported container logs");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CallLog, FakeKubernetes};
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn object_path_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 12, 17, 5, 0).unwrap();
        assert_eq!(
            object_path("my-bee", at, "sam", "sam-7d9f-x2", "sam-app"),
            "my-bee/20240312T170500Z/sam/sam-7d9f-x2-sam-app.log"
        );
    }

    #[tokio::test]
    async fn local_store_writes_file_url() {
        let dir = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let loc = store
            .upload("my-bee/t/sam/pod-c.log", b"hello".to_vec(), "no-store")
            .await
            .unwrap();
        assert!(loc.starts_with("file://"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("my-bee/t/sam/pod-c.log")).unwrap(),
            "hello"
        );
        assert!(store.upload("../escape.log", vec![], "").await.is_err());
    }

    #[tokio::test]
    async fn exports_each_container_of_each_pod() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let kube = Arc::new(FakeKubernetes::new(log.clone()));
        let exporter = PodLogExporter::new(kube, Arc::new(LocalArtifactStore::new(dir.path())));
        let releases = vec![
            Release::app("sam", "my-bee", "terra-qa-bees"),
            Release::app("rawls", "my-bee", "terra-qa-bees"),
        ];
        let locations = exporter
            .export(&releases, &ExportOptions::default())
            .await
            .unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(log.count("kube.container_logs"), 4);
        assert!(dir.path().join("my-bee").is_dir());
    }
}
