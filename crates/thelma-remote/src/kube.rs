//! [`Kubernetes`] over kube-rs, with `kubectl port-forward` for tunnels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use thelma_core::config::KubernetesConfig;
use thelma_core::environment::Environment;
use thelma_core::kube::{ForwardTarget, Kubernetes, PodInfo, PortForward, StatefulSetInfo};
use thelma_core::release::Release;
use thelma_core::{Result, ThelmaError};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{from_kube, is_kube_status};
use crate::process::ForwardProcess;

const PORT_FORWARD_WAIT: Duration = Duration::from_secs(15);
const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";

type Forwards = Arc<std::sync::Mutex<HashMap<u64, ForwardProcess>>>;

pub struct KubeClient {
    config: KubernetesConfig,
    clients: Mutex<HashMap<String, Client>>,
    /// Port-forwards that have not been stopped yet, by id.
    forwards: Forwards,
    next_forward: AtomicU64,
}

impl KubeClient {
    pub fn new(config: KubernetesConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
            forwards: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_forward: AtomicU64::new(0),
        }
    }

    /// Kill every port-forward still running. Returns how many were killed.
    pub fn stop_port_forwards(&self) -> usize {
        let Ok(mut forwards) = self.forwards.lock() else {
            return 0;
        };
        let n = forwards.len();
        for (_, mut fwd) in forwards.drain() {
            fwd.kill();
        }
        if n > 0 {
            debug!(count = n, "stopped leftover port-forwards");
        }
        n
    }

    fn context(&self, cluster: &str) -> String {
        context_name(&self.config.context_prefix, cluster)
    }

    /// One client per kubeconfig context, built on first use.
    async fn client(&self, cluster: &str) -> Result<Client> {
        let context = self.context(cluster);
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&context) {
            return Ok(client.clone());
        }
        debug!(%context, "building kubernetes client");
        let kubeconfig = Kubeconfig::read().map_err(|e| ThelmaError::remote("kubernetes", e))?;
        let options = KubeConfigOptions {
            context: Some(context.clone()),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| ThelmaError::remote("kubernetes", format!("context {context}: {e}")))?;
        let client = Client::try_from(config).map_err(from_kube)?;
        clients.insert(context, client.clone());
        Ok(client)
    }

    async fn namespaced<K>(&self, cluster: &str, namespace: &str) -> Result<Api<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Ok(Api::namespaced(self.client(cluster).await?, namespace))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn context_name(prefix: &str, cluster: &str) -> String {
    format!("{prefix}{cluster}")
}

/// Claims owned by a stateful set: `<template>-<statefulset>-<ordinal>`.
fn claims_for(sts: &str, templates: &[String], claims: &[String]) -> Vec<String> {
    let prefixes: Vec<String> = templates.iter().map(|t| format!("{t}-{sts}-")).collect();
    claims
        .iter()
        .filter(|c| {
            prefixes.iter().any(|p| {
                c.strip_prefix(p.as_str())
                    .is_some_and(|ordinal| !ordinal.is_empty() && ordinal.chars().all(|ch| ch.is_ascii_digit()))
            })
        })
        .cloned()
        .collect()
}

fn restart_patch(at: &str) -> serde_json::Value {
    json!({
        "spec": {"template": {"metadata": {"annotations": {RESTARTED_AT: at}}}}
    })
}

fn port_forward_args(context: &str, namespace: &str, target: &ForwardTarget) -> Vec<String> {
    vec![
        "--context".to_string(),
        context.to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
        "port-forward".to_string(),
        target.to_string(),
        format!(":{}", target.port),
    ]
}

fn meta_name(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Kubernetes
// ---------------------------------------------------------------------------

#[async_trait]
impl Kubernetes for KubeClient {
    async fn create_namespace(&self, env: &Environment) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client(&env.default_cluster).await?);
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(env.namespace()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %env.namespace(), "namespace created");
                Ok(())
            }
            Err(e) if is_kube_status(&e, 409) => {
                debug!(namespace = %env.namespace(), "namespace already exists");
                Ok(())
            }
            Err(e) => Err(from_kube(e)),
        }
    }

    async fn list_stateful_sets(&self, env: &Environment) -> Result<Vec<StatefulSetInfo>> {
        let ns = env.namespace();
        let sts_api: Api<StatefulSet> = self.namespaced(&env.default_cluster, &ns).await?;
        let pvc_api: Api<PersistentVolumeClaim> = self.namespaced(&env.default_cluster, &ns).await?;
        let lp = ListParams::default();
        let (sets, claims) = futures::try_join!(sts_api.list(&lp), pvc_api.list(&lp)).map_err(from_kube)?;
        let claims: Vec<String> = claims.items.iter().map(|c| meta_name(&c.metadata)).collect();

        Ok(sets
            .items
            .iter()
            .map(|sts| {
                let name = meta_name(&sts.metadata);
                let templates: Vec<String> = sts
                    .spec
                    .as_ref()
                    .and_then(|s| s.volume_claim_templates.as_ref())
                    .map(|ts| ts.iter().map(|t| meta_name(&t.metadata)).collect())
                    .unwrap_or_default();
                StatefulSetInfo {
                    pvcs: claims_for(&name, &templates, &claims),
                    name,
                }
            })
            .collect())
    }

    async fn restart_stateful_set(&self, env: &Environment, name: &str) -> Result<()> {
        let api: Api<StatefulSet> = self.namespaced(&env.default_cluster, &env.namespace()).await?;
        let patch = restart_patch(&Utc::now().to_rfc3339());
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(from_kube)?;
        info!(namespace = %env.namespace(), statefulset = %name, "restarted");
        Ok(())
    }

    async fn delete_pvc(&self, env: &Environment, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = self.namespaced(&env.default_cluster, &env.namespace()).await?;
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_kube_status(&e, 404) => Ok(()),
            Err(e) => Err(from_kube(e)),
        }
    }

    async fn port_forward(&self, release: &Release, target: &ForwardTarget) -> Result<PortForward> {
        let kubectl = which::which(&self.config.kubectl).map_err(|_| {
            ThelmaError::Fatal(format!("{} not found on PATH", self.config.kubectl))
        })?;
        let mut cmd = Command::new(kubectl);
        cmd.args(port_forward_args(&self.context(&release.cluster), &release.namespace, target));
        let fwd = ForwardProcess::start(cmd, PORT_FORWARD_WAIT).await?;
        let port = fwd.local_port;
        debug!(release = %release.full_name(), %target, port, "port-forward started");

        let id = self.next_forward.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut forwards) = self.forwards.lock() {
            forwards.insert(id, fwd);
        }
        let forwards = Arc::clone(&self.forwards);
        Ok(PortForward::new(port, move || {
            if let Ok(mut forwards) = forwards.lock() {
                if let Some(mut fwd) = forwards.remove(&id) {
                    fwd.kill();
                }
            }
        }))
    }

    async fn list_pods(&self, release: &Release) -> Result<Vec<PodInfo>> {
        let api: Api<Pod> = self.namespaced(&release.cluster, &release.namespace).await?;
        let selector = format!("{}={}", self.config.instance_label, release.full_name());
        let pods = api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(from_kube)?;
        Ok(pods
            .items
            .iter()
            .map(|p| PodInfo {
                name: meta_name(&p.metadata),
                containers: p
                    .spec
                    .as_ref()
                    .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn container_logs(&self, release: &Release, pod: &str, container: &str) -> Result<Vec<u8>> {
        let api: Api<Pod> = self.namespaced(&release.cluster, &release.namespace).await?;
        let params = LogParams {
            container: Some(container.to_string()),
            timestamps: true,
            ..Default::default()
        };
        let logs = api.logs(pod, &params).await.map_err(from_kube)?;
        Ok(logs.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn claims_match_template_statefulset_ordinal() {
        let claims = names(&[
            "data-mysql-0",
            "data-mysql-1",
            "data-mysql-extra-0",
            "logs-mysql-0",
            "data-postgres-0",
        ]);
        assert_eq!(
            claims_for("mysql", &names(&["data", "logs"]), &claims),
            names(&["data-mysql-0", "data-mysql-1", "logs-mysql-0"])
        );
        assert!(claims_for("mysql", &[], &claims).is_empty());
    }

    #[test]
    fn port_forward_command_line() {
        let args = port_forward_args(
            "gke_terra-qa-bees",
            "terra-my-bee",
            &ForwardTarget::service("elasticsearch-master", 9200),
        );
        assert_eq!(
            args.join(" "),
            "--context gke_terra-qa-bees --namespace terra-my-bee port-forward svc/elasticsearch-master :9200"
        );
    }

    #[test]
    fn restart_patch_sets_annotation() {
        let patch = restart_patch("2024-03-12T10:00:00Z");
        assert_eq!(
            patch["spec"]["template"]["metadata"]["annotations"][RESTARTED_AT],
            "2024-03-12T10:00:00Z"
        );
        assert_eq!(context_name("gke_", "terra-qa-bees"), "gke_terra-qa-bees");
    }

    #[test]
    fn nothing_to_stop_without_forwards() {
        let client = KubeClient::new(KubernetesConfig::default());
        assert_eq!(client.stop_port_forwards(), 0);
    }
}
