use crate::environment::Environment;
use crate::error::Result;
use crate::release::Release;
use async_trait::async_trait;
use std::fmt;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatefulSetInfo {
    pub name: String,
    /// Claims created from the stateful set's volume claim templates.
    pub pvcs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub containers: Vec<String>,
}

/// Port-forward destination inside a release's namespace, e.g.
/// `svc/elasticsearch-master:9200`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub kind: String,
    pub name: String,
    pub port: u16,
}

impl ForwardTarget {
    pub fn service(name: impl Into<String>, port: u16) -> Self {
        Self {
            kind: "svc".to_string(),
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

// ---------------------------------------------------------------------------
// PortForward
// ---------------------------------------------------------------------------

/// A running port-forward. Stopped by [`PortForward::stop`] or on drop.
pub struct PortForward {
    local_port: u16,
    stopper: Option<Box<dyn FnOnce() + Send>>,
}

impl PortForward {
    pub fn new(local_port: u16, stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            local_port,
            stopper: Some(Box::new(stop)),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn local_url(&self, scheme: &str) -> String {
        format!("{scheme}://127.0.0.1:{}", self.local_port)
    }

    pub fn stop(mut self) {
        if let Some(stop) = self.stopper.take() {
            stop();
        }
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        if let Some(stop) = self.stopper.take() {
            stop();
        }
    }
}

impl fmt::Debug for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortForward")
            .field("local_port", &self.local_port)
            .field("running", &self.stopper.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Kubernetes
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Kubernetes: Send + Sync {
    /// Create the environment's namespace on its default cluster. Idempotent.
    async fn create_namespace(&self, env: &Environment) -> Result<()>;
    async fn list_stateful_sets(&self, env: &Environment) -> Result<Vec<StatefulSetInfo>>;
    async fn restart_stateful_set(&self, env: &Environment, name: &str) -> Result<()>;
    async fn delete_pvc(&self, env: &Environment, name: &str) -> Result<()>;
    async fn port_forward(&self, release: &Release, target: &ForwardTarget) -> Result<PortForward>;
    async fn list_pods(&self, release: &Release) -> Result<Vec<PodInfo>>;
    async fn container_logs(&self, release: &Release, pod: &str, container: &str) -> Result<Vec<u8>>;
}
