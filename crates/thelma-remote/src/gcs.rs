//! Cloud Storage: exported logs, and the shared state document.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::json;
use thelma_core::error::ErrorKind;
use thelma_core::logs::{ArtifactStore, Location};
use thelma_core::pin::VersionOverrides;
use thelma_core::state::{CreateEnvironment, State, StateDocument, StateStore};
use thelma_core::{Result, ThelmaError};
use tracing::{debug, warn};

use crate::http::{Body, HttpClient};
use crate::token::TokenProvider;

pub const GCS_API: &str = "https://storage.googleapis.com";
const CONSOLE: &str = "https://console.cloud.google.com/storage/browser/_details";

/// `ifGenerationMatch` value that only matches a missing object.
const NO_OBJECT: &str = "0";

pub fn console_url(bucket: &str, object: &str) -> String {
    format!("{CONSOLE}/{bucket}/{object}")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    generation: String,
    #[serde(default)]
    time_created: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

/// Object calls against one bucket of the JSON API.
struct Bucket {
    http: HttpClient,
    name: String,
}

impl Bucket {
    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&self.http.url("/"))
            .map_err(|e| ThelmaError::remote("gcs", format!("bad base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ThelmaError::remote("gcs", "base url cannot take a path"))?
            .clear()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn object_url(&self, object: &str, query: &[(&str, &str)]) -> Result<Url> {
        self.endpoint(&["storage", "v1", "b", &self.name, "o", object], query)
    }

    fn upload_url(&self, object: &str, if_generation_match: Option<&str>) -> Result<Url> {
        let mut query = vec![("uploadType", "media"), ("name", object)];
        if let Some(generation) = if_generation_match {
            query.push(("ifGenerationMatch", generation));
        }
        self.endpoint(&["upload", "storage", "v1", "b", &self.name, "o"], &query)
    }

    /// `None` when the object does not exist.
    async fn metadata(&self, object: &str) -> Result<Option<ObjectMeta>> {
        let url = self.object_url(object, &[("fields", "generation,timeCreated")])?;
        match self.http.get(url.as_str()).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn download(&self, object: &str, generation: &str) -> Result<String> {
        let url = self.object_url(object, &[("alt", "media"), ("generation", generation)])?;
        self.http.text(Method::GET, url.as_str(), Body::Empty).await
    }

    /// Create or replace `object`. With `if_generation_match`, fails with
    /// `Conflict` when the live generation differs.
    async fn upload(
        &self,
        object: &str,
        data: Vec<u8>,
        content_type: &str,
        if_generation_match: Option<&str>,
    ) -> Result<ObjectMeta> {
        let url = self.upload_url(object, if_generation_match)?;
        self.http
            .json(
                Method::POST,
                url.as_str(),
                Body::Bytes {
                    data,
                    content_type: content_type.to_string(),
                },
            )
            .await
    }

    async fn delete(&self, object: &str, if_generation_match: &str) -> Result<()> {
        let url = self.object_url(object, &[("ifGenerationMatch", if_generation_match)])?;
        let _: serde_json::Value = self.http.delete(url.as_str()).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GcsArtifactStore
// ---------------------------------------------------------------------------

/// Uploads artifacts to a Cloud Storage bucket.
pub struct GcsArtifactStore {
    bucket: Bucket,
}

impl GcsArtifactStore {
    pub fn new(bucket: impl Into<String>, token: Arc<dyn TokenProvider>) -> Result<Self> {
        Ok(Self::from_client(HttpClient::new("gcs", GCS_API, token)?, bucket))
    }

    pub fn from_client(http: HttpClient, bucket: impl Into<String>) -> Self {
        Self {
            bucket: Bucket {
                http,
                name: bucket.into(),
            },
        }
    }
}

#[async_trait]
impl ArtifactStore for GcsArtifactStore {
    async fn upload(&self, object_path: &str, data: Vec<u8>, cache_control: &str) -> Result<Location> {
        let size = data.len();
        self.bucket
            .upload(object_path, data, "text/plain; charset=utf-8", None)
            .await?;
        let _: serde_json::Value = self
            .bucket
            .http
            .patch(
                self.bucket.object_url(object_path, &[])?.as_str(),
                json!({ "cacheControl": cache_control }),
            )
            .await?;
        debug!(bucket = %self.bucket.name, object = %object_path, size, "uploaded");
        Ok(console_url(&self.bucket.name, object_path))
    }
}

// ---------------------------------------------------------------------------
// GcsStateStore
// ---------------------------------------------------------------------------

const DEFAULT_STALE_LOCK: Duration = Duration::from_secs(60);
const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(500);

/// [`StateStore`] keeping every environment in one JSON object.
///
/// A writer holds `<object>.lock`, created with `ifGenerationMatch=0`, for
/// the length of a mutation and deletes it afterwards. The document itself is
/// replaced with `ifGenerationMatch` set to the generation that was read, so
/// a writer whose lock was broken as stale fails with `Conflict` instead of
/// overwriting newer state.
pub struct GcsStateStore {
    bucket: Bucket,
    object: String,
    stale_lock: Duration,
    lock_wait: Duration,
    lock_poll: Duration,
}

impl GcsStateStore {
    pub fn new(
        bucket: impl Into<String>,
        object: impl Into<String>,
        token: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        Ok(Self::from_client(
            HttpClient::new("gcs", GCS_API, token)?,
            bucket,
            object,
        ))
    }

    pub fn from_client(http: HttpClient, bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: Bucket {
                http,
                name: bucket.into(),
            },
            object: object.into(),
            stale_lock: DEFAULT_STALE_LOCK,
            lock_wait: LOCK_WAIT,
            lock_poll: LOCK_POLL,
        }
    }

    /// Age after which someone else's lock is considered abandoned.
    pub fn with_stale_lock(mut self, stale_lock: Duration) -> Self {
        self.stale_lock = stale_lock;
        self
    }

    /// How long to wait for a live lock, and how often to check it.
    pub fn with_lock_wait(mut self, wait: Duration, poll: Duration) -> Self {
        self.lock_wait = wait;
        self.lock_poll = poll;
        self
    }

    fn lock_object(&self) -> String {
        format!("{}.lock", self.object)
    }

    /// The document and the object generation it was read at (`"0"` when
    /// nothing has been written yet).
    async fn read(&self) -> Result<(StateDocument, String)> {
        let Some(meta) = self.bucket.metadata(&self.object).await? else {
            return Ok((StateDocument::default(), NO_OBJECT.to_string()));
        };
        let text = self.bucket.download(&self.object, &meta.generation).await?;
        let doc = if text.trim().is_empty() {
            StateDocument::default()
        } else {
            serde_json::from_str(&text)?
        };
        Ok((doc, meta.generation))
    }

    /// Take the lock; returns the lock object's generation.
    async fn acquire_lock(&self) -> Result<String> {
        let lock = self.lock_object();
        let deadline = tokio::time::Instant::now() + self.lock_wait;
        loop {
            let stamp = Utc::now().to_rfc3339().into_bytes();
            match self.bucket.upload(&lock, stamp, "text/plain", Some(NO_OBJECT)).await {
                Ok(meta) => return Ok(meta.generation),
                Err(e) if e.kind() == ErrorKind::Conflict => {}
                Err(e) => return Err(e),
            }

            let mut broke_stale = false;
            if let Some(held) = self.bucket.metadata(&lock).await? {
                if is_stale(&held, self.stale_lock, Utc::now()) {
                    warn!(object = %lock, "breaking stale state lock");
                    match self.bucket.delete(&lock, &held.generation).await {
                        Ok(()) => broke_stale = true,
                        Err(e) if matches!(e.kind(), ErrorKind::Conflict | ErrorKind::NotFound) => {}
                        Err(e) => return Err(e),
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ThelmaError::Conflict(format!(
                    "state is locked by another writer (gs://{}/{lock})",
                    self.bucket.name
                )));
            }
            if !broke_stale {
                tokio::time::sleep(self.lock_poll).await;
            }
        }
    }

    async fn mutate<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut StateDocument) -> Result<T> + Send,
    {
        let lock_generation = self.acquire_lock().await?;
        let result = self.write_locked(op, f).await;
        if let Err(e) = self.bucket.delete(&self.lock_object(), &lock_generation).await {
            warn!(op, error = %e, "failed to release state lock");
        }
        result
    }

    async fn write_locked<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut StateDocument) -> Result<T>,
    {
        let (mut doc, read_at) = self.read().await?;
        let out = f(&mut doc)?;
        doc.generation += 1;
        let data = serde_json::to_vec_pretty(&doc)?;
        match self
            .bucket
            .upload(&self.object, data, "application/json", Some(&read_at))
            .await
        {
            Ok(meta) => {
                debug!(op, generation = %meta.generation, "state written");
                Ok(out)
            }
            Err(e) if e.kind() == ErrorKind::Conflict => Err(ThelmaError::Conflict(format!(
                "state changed during {op} (object generation {read_at} is no longer current)"
            ))),
            Err(e) => Err(e),
        }
    }
}

fn is_stale(lock: &ObjectMeta, stale_after: Duration, now: DateTime<Utc>) -> bool {
    lock.time_created
        .and_then(|created| (now - created).to_std().ok())
        .is_some_and(|age| age >= stale_after)
}

#[async_trait]
impl StateStore for GcsStateStore {
    async fn reload(&self) -> Result<State> {
        let (doc, _) = self.read().await?;
        Ok(doc.into_state())
    }

    async fn create_from_template(&self, req: &CreateEnvironment) -> Result<()> {
        self.mutate("create", |doc| doc.create_from_template(req, Utc::now()))
            .await
    }

    async fn delete_environment(&self, name: &str) -> Result<()> {
        self.mutate("delete", |doc| doc.delete_environment(name)).await
    }

    async fn pin_environment_to_terra_helmfile_ref(&self, name: &str, git_ref: &str) -> Result<()> {
        self.mutate("pin-ref", |doc| doc.pin_terra_helmfile_ref(name, git_ref))
            .await
    }

    async fn pin_versions(&self, name: &str, overrides: &VersionOverrides) -> Result<VersionOverrides> {
        self.mutate("pin", |doc| doc.pin_versions(name, overrides)).await
    }

    async fn unpin_versions(&self, name: &str) -> Result<VersionOverrides> {
        self.mutate("unpin", |doc| doc.unpin_versions(name)).await
    }

    async fn set_offline(&self, name: &str, offline: bool) -> Result<()> {
        self.mutate("set-offline", |doc| doc.set_offline(name, offline))
            .await
    }
}
