//! File-backed [`StateStore`].
//!
//! The whole state lives in one JSON document. Every write takes a sidecar
//! lock file, re-reads the document, applies the mutation, checks that the
//! generation on disk has not moved, and persists with an atomic rename.

use super::{CreateEnvironment, State, StateDocument, StateStore};
use crate::error::{Result, ThelmaError};
use crate::paths;
use crate::pin::VersionOverrides;
use async_trait::async_trait;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

const DEFAULT_STALE_LOCK: Duration = Duration::from_secs(60);
const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct LocalStateStore {
    path: PathBuf,
    stale_lock: Duration,
}

impl LocalStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stale_lock: DEFAULT_STALE_LOCK,
        }
    }

    /// Age after which someone else's lock file is considered abandoned.
    pub fn with_stale_lock(mut self, stale_lock: Duration) -> Self {
        self.stale_lock = stale_lock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn mutate<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StateDocument) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        let stale = self.stale_lock;
        tokio::task::spawn_blocking(move || {
            let _lock = FileLock::acquire(&paths::lock_path(&path), stale)?;
            let mut doc = StateDocument::load(&path)?;
            let expected = doc.generation;
            let out = f(&mut doc)?;

            let current = StateDocument::load(&path)?.generation;
            if current != expected {
                return Err(ThelmaError::Conflict(format!(
                    "state changed during {op} (generation {expected} -> {current})"
                )));
            }
            doc.generation = expected + 1;
            doc.save(&path)?;
            debug!(op, generation = doc.generation, "state written");
            Ok(out)
        })
        .await
        .map_err(|e| ThelmaError::Fatal(format!("state task join error: {e}")))?
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn reload(&self) -> Result<State> {
        let path = self.path.clone();
        let doc = tokio::task::spawn_blocking(move || StateDocument::load(&path))
            .await
            .map_err(|e| ThelmaError::Fatal(format!("state task join error: {e}")))??;
        Ok(doc.into_state())
    }

    async fn create_from_template(&self, req: &CreateEnvironment) -> Result<()> {
        let req = req.clone();
        self.mutate("create", move |doc| doc.create_from_template(&req, Utc::now()))
            .await
    }

    async fn delete_environment(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.mutate("delete", move |doc| doc.delete_environment(&name))
            .await
    }

    async fn pin_environment_to_terra_helmfile_ref(&self, name: &str, git_ref: &str) -> Result<()> {
        let (name, git_ref) = (name.to_string(), git_ref.to_string());
        self.mutate("pin-ref", move |doc| doc.pin_terra_helmfile_ref(&name, &git_ref))
            .await
    }

    async fn pin_versions(&self, name: &str, overrides: &VersionOverrides) -> Result<VersionOverrides> {
        let (name, overrides) = (name.to_string(), overrides.clone());
        self.mutate("pin", move |doc| doc.pin_versions(&name, &overrides))
            .await
    }

    async fn unpin_versions(&self, name: &str) -> Result<VersionOverrides> {
        let name = name.to_string();
        self.mutate("unpin", move |doc| doc.unpin_versions(&name))
            .await
    }

    async fn set_offline(&self, name: &str, offline: bool) -> Result<()> {
        let name = name.to_string();
        self.mutate("set-offline", move |doc| doc.set_offline(&name, offline))
            .await
    }
}

// ---------------------------------------------------------------------------
// FileLock
// ---------------------------------------------------------------------------

/// Exclusive lock held by creating a file. Removed on drop if still ours.
struct FileLock {
    path: PathBuf,
    token: String,
}

impl FileLock {
    fn acquire(path: &Path, stale: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + LOCK_WAIT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut f) => {
                    f.write_all(token.as_bytes())?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_age(path).is_some_and(|age| age >= stale) {
                        warn!(path = %path.display(), "breaking stale state lock");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(ThelmaError::Conflict(format!(
                            "state is locked by another process ({})",
                            path.display()
                        )));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let ours = std::fs::read_to_string(&self.path).is_ok_and(|t| t == self.token);
        if ours {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::error::ErrorKind;
    use crate::release::Release;
    use crate::types::Lifecycle;
    use tempfile::TempDir;

    fn seed(path: &Path) {
        let mut template = Environment::new("swatomation", Lifecycle::Template, "terra-qa-bees");
        template.releases =
            vec![Release::app("sam", "swatomation", "terra-qa-bees").with_versions("1.0.0", "abc")];
        StateDocument {
            generation: 0,
            environments: vec![template],
            clusters: vec![],
        }
        .save(path)
        .unwrap();
    }

    fn req(name: &str) -> CreateEnvironment {
        CreateEnvironment {
            name: name.into(),
            template: "swatomation".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn writes_bump_generation_and_reload_sees_them() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bees.json");
        seed(&path);
        let store = LocalStateStore::new(&path);

        let before = store.reload().await.unwrap();
        store.create_from_template(&req("my-bee")).await.unwrap();
        assert!(!before.environments().exists("my-bee"));
        assert!(store.reload().await.unwrap().environments().exists("my-bee"));
        assert_eq!(StateDocument::load(&path).unwrap().generation, 1);
        assert!(!paths::lock_path(&path).exists());

        store.set_offline("my-bee", true).await.unwrap();
        let state = store.reload().await.unwrap();
        assert!(state.environments().get("my-bee").unwrap().offline);
        assert_eq!(StateDocument::load(&path).unwrap().generation, 2);
    }

    #[tokio::test]
    async fn failed_mutation_leaves_document_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bees.json");
        seed(&path);
        let store = LocalStateStore::new(&path);

        let err = store.delete_environment("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(StateDocument::load(&path).unwrap().generation, 0);
    }

    #[tokio::test]
    async fn concurrent_creates_of_same_name_yield_one_conflict() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bees.json");
        seed(&path);
        let a = LocalStateStore::new(&path);
        let b = a.clone();

        let req_a = req("my-bee");
        let req_b = req("my-bee");
        let (ra, rb) = tokio::join!(
            a.create_from_template(&req_a),
            b.create_from_template(&req_b)
        );
        let oks = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
        assert_eq!(oks, 1);
        let err = ra.err().or(rb.err()).unwrap();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("bees.json.lock");
        std::fs::write(&lock, "someone-else").unwrap();
        let held = FileLock::acquire(&lock, Duration::ZERO).unwrap();
        assert_eq!(std::fs::read_to_string(&lock).unwrap(), held.token);
        drop(held);
        assert!(!lock.exists());
    }
}
