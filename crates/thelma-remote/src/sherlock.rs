//! [`StateStore`] backed by the Sherlock state service.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thelma_core::environment::{AutoDelete, Environment, ScheduleBegin, ScheduleEnd};
use thelma_core::paths;
use thelma_core::pin::VersionOverrides;
use thelma_core::release::{Cluster, Release};
use thelma_core::state::{CreateEnvironment, State, StateStore};
use thelma_core::types::Lifecycle;
use thelma_core::{Result, ThelmaError};
use tracing::debug;

use crate::http::HttpClient;
use crate::token::TokenProvider;

const ENVIRONMENTS: &str = "/api/environments/v3";
const CLUSTERS: &str = "/api/clusters/v3";
const CHART_RELEASES: &str = "/api/chart-releases/v3";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EnvironmentV3 {
    name: String,
    template_environment: Option<String>,
    lifecycle: Option<Lifecycle>,
    owner: Option<String>,
    offline: bool,
    created_at: Option<DateTime<Utc>>,
    auto_delete: Option<AutoDeleteV3>,
    offline_schedule_begin_enabled: bool,
    offline_schedule_begin_time: Option<DateTime<FixedOffset>>,
    offline_schedule_end_enabled: bool,
    offline_schedule_end_time: Option<DateTime<FixedOffset>>,
    offline_schedule_end_weekends: bool,
    default_cluster: Option<String>,
    helmfile_ref: Option<String>,
    pins: Option<VersionOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AutoDeleteV3 {
    enabled: bool,
    after: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ClusterV3 {
    name: String,
    google_project: String,
    address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChartReleaseV3 {
    name: String,
    chart: String,
    repo: Option<String>,
    chart_version_exact: String,
    app_version_exact: String,
    cluster: String,
    environment: Option<String>,
    namespace: String,
    destination_type: String,
    helmfile_ref: Option<String>,
    firecloud_develop_ref: Option<String>,
}

impl EnvironmentV3 {
    fn into_environment(self) -> Environment {
        let lifecycle = self.lifecycle.unwrap_or(Lifecycle::Static);
        let mut env = Environment::new(self.name, lifecycle, self.default_cluster.unwrap_or_default());
        env.template = self.template_environment.unwrap_or_default();
        env.owner = self.owner.unwrap_or_default();
        env.offline = self.offline;
        if let Some(created) = self.created_at {
            env.created_at = created;
        }
        env.auto_delete = self.auto_delete.map(|a| AutoDelete {
            enabled: a.enabled,
            after: a.after,
        });
        env.offline_schedule_begin = self.offline_schedule_begin_time.map(|time| ScheduleBegin {
            enabled: self.offline_schedule_begin_enabled,
            time,
        });
        env.offline_schedule_end = self.offline_schedule_end_time.map(|time| ScheduleEnd {
            enabled: self.offline_schedule_end_enabled,
            time,
            weekends: self.offline_schedule_end_weekends,
        });
        env.terra_helmfile_ref = self.helmfile_ref;
        env.pins = self.pins.unwrap_or_default();
        env
    }
}

impl ChartReleaseV3 {
    fn into_release(self) -> Release {
        let repo = self.repo.unwrap_or_else(|| "terra-helm".to_string());
        let mut release = match self.environment.filter(|_| self.destination_type == "environment") {
            Some(env) => {
                let name = short_release_name(&self.name, &self.chart, &env);
                Release::app(name, env, &self.cluster)
                    .with_versions(&self.chart_version_exact, &self.app_version_exact)
            }
            None => {
                let name = self
                    .name
                    .strip_suffix(&format!("-{}", self.cluster))
                    .unwrap_or(&self.name)
                    .to_string();
                let mut r = Release::cluster_release(name, &self.cluster, &self.namespace);
                r.chart_version = self.chart_version_exact.clone();
                r
            }
        };
        release = release.with_chart(&self.chart, &repo);
        if !self.namespace.is_empty() {
            release.namespace = self.namespace;
        }
        release.terra_helmfile_ref = self.helmfile_ref;
        release.firecloud_develop_ref = self.firecloud_develop_ref;
        release
    }
}

/// Sherlock names chart releases `<release>-<environment>`.
fn short_release_name(full: &str, chart: &str, env: &str) -> String {
    match full.strip_suffix(&format!("-{env}")) {
        Some(short) if !short.is_empty() => short.to_string(),
        _ if !chart.is_empty() => chart.to_string(),
        _ => full.to_string(),
    }
}

fn assemble(environments: Vec<EnvironmentV3>, clusters: Vec<ClusterV3>, releases: Vec<ChartReleaseV3>) -> State {
    let mut environments: Vec<Environment> = environments
        .into_iter()
        .map(EnvironmentV3::into_environment)
        .collect();
    let mut clusters: Vec<Cluster> = clusters
        .into_iter()
        .map(|c| {
            let mut cluster = Cluster::new(c.name, c.google_project);
            cluster.address = c.address;
            cluster
        })
        .collect();

    let mut by_env: BTreeMap<String, Vec<Release>> = BTreeMap::new();
    for release in releases.into_iter().map(ChartReleaseV3::into_release) {
        match release.environment() {
            Some(env) => by_env.entry(env.to_string()).or_default().push(release),
            None => {
                if let Some(cluster) = clusters.iter_mut().find(|c| c.name == release.cluster) {
                    cluster.releases.push(release);
                }
            }
        }
    }
    for env in environments.iter_mut() {
        if let Some(releases) = by_env.remove(&env.name) {
            env.releases = releases;
        }
    }
    State::new(environments, clusters)
}

// ---------------------------------------------------------------------------
// SherlockStateStore
// ---------------------------------------------------------------------------

pub struct SherlockStateStore {
    http: HttpClient,
}

impl SherlockStateStore {
    pub fn new(addr: &str, token: Arc<dyn TokenProvider>) -> Result<Self> {
        Ok(Self::from_client(HttpClient::new("sherlock", addr, token)?))
    }

    pub fn from_client(http: HttpClient) -> Self {
        Self { http }
    }

    fn environment_path(name: &str) -> String {
        format!("{ENVIRONMENTS}/{name}")
    }
}

/// Pin endpoints always answer with a map; an empty body is a broken reply,
/// not an empty pin set.
fn pins_from(reply: Option<VersionOverrides>, what: &str, name: &str) -> Result<VersionOverrides> {
    reply.ok_or_else(|| ThelmaError::remote("sherlock", format!("{what} for {name} returned no pins")))
}

#[async_trait]
impl StateStore for SherlockStateStore {
    async fn reload(&self) -> Result<State> {
        let (environments, clusters, releases) = futures::try_join!(
            self.http.get::<Vec<EnvironmentV3>>(ENVIRONMENTS),
            self.http.get::<Vec<ClusterV3>>(CLUSTERS),
            self.http.get::<Vec<ChartReleaseV3>>(CHART_RELEASES),
        )?;
        debug!(
            environments = environments.len(),
            clusters = clusters.len(),
            releases = releases.len(),
            "loaded state from sherlock"
        );
        Ok(assemble(environments, clusters, releases))
    }

    async fn create_from_template(&self, req: &CreateEnvironment) -> Result<()> {
        paths::validate_environment_name(&req.name)?;
        let begin = req.offline_schedule_begin.as_ref();
        let end = req.offline_schedule_end.as_ref();
        let body = EnvironmentV3 {
            name: req.name.clone(),
            template_environment: Some(req.template.clone()),
            lifecycle: Some(Lifecycle::Dynamic),
            owner: Some(req.owner.clone()).filter(|o| !o.is_empty()),
            auto_delete: req.auto_delete.as_ref().map(|a| AutoDeleteV3 {
                enabled: a.enabled,
                after: a.after,
            }),
            offline_schedule_begin_enabled: begin.is_some_and(|b| b.enabled),
            offline_schedule_begin_time: begin.map(|b| b.time),
            offline_schedule_end_enabled: end.is_some_and(|e| e.enabled),
            offline_schedule_end_time: end.map(|e| e.time),
            offline_schedule_end_weekends: end.is_some_and(|e| e.weekends),
            ..Default::default()
        };
        let _: serde_json::Value = self
            .http
            .post(ENVIRONMENTS, serde_json::to_value(&body)?)
            .await?;
        Ok(())
    }

    async fn delete_environment(&self, name: &str) -> Result<()> {
        let _: serde_json::Value = self.http.delete(&Self::environment_path(name)).await?;
        Ok(())
    }

    async fn pin_environment_to_terra_helmfile_ref(&self, name: &str, git_ref: &str) -> Result<()> {
        let _: serde_json::Value = self
            .http
            .patch(&Self::environment_path(name), json!({ "helmfileRef": git_ref }))
            .await?;
        Ok(())
    }

    async fn pin_versions(&self, name: &str, overrides: &VersionOverrides) -> Result<VersionOverrides> {
        let path = format!("{}/pins", Self::environment_path(name));
        let effective: Option<VersionOverrides> =
            self.http.patch(&path, serde_json::to_value(overrides)?).await?;
        pins_from(effective, "PATCH pins", name)
    }

    async fn unpin_versions(&self, name: &str) -> Result<VersionOverrides> {
        let path = format!("{}/pins", Self::environment_path(name));
        let removed: Option<VersionOverrides> = self.http.delete(&path).await?;
        pins_from(removed, "DELETE pins", name)
    }

    async fn set_offline(&self, name: &str, offline: bool) -> Result<()> {
        let _: serde_json::Value = self
            .http
            .patch(&Self::environment_path(name), json!({ "offline": offline }))
            .await?;
        Ok(())
    }
}
