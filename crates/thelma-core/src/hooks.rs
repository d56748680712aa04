//! Post-run cleanup that must happen however a command exits.

use crate::error::{ErrorAggregator, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Registered cleanup hooks, run in reverse registration order.
#[derive(Default)]
pub struct CleanupHooks {
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl CleanupHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: Hook = Box::new(move || Box::pin(f()));
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push((name.into(), hook));
        }
    }

    /// Delete `path` on cleanup; a missing file is fine.
    pub fn remove_file(&self, path: PathBuf) {
        let name = format!("remove {}", path.display());
        self.add(name, move || async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        });
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every hook; failures are collected, never short-circuit.
    pub async fn run(&self) -> Result<()> {
        let hooks = self
            .hooks
            .lock()
            .map(|mut h| std::mem::take(&mut *h))
            .unwrap_or_default();
        let mut errors = ErrorAggregator::new();
        for (name, hook) in hooks.into_iter().rev() {
            debug!(hook = %name, "running cleanup hook");
            if let Err(e) = hook().await {
                errors.push(name, e);
            }
        }
        errors.into_result()
    }
}
