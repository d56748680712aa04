use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ReleaseKind
// ---------------------------------------------------------------------------

/// Discriminates app releases (deployed into an environment) from cluster
/// releases (deployed once per cluster).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReleaseKind {
    App {
        environment: String,
        #[serde(default, rename = "appVersion")]
        app_version: String,
    },
    Cluster,
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub name: String,
    pub chart_name: String,
    #[serde(default)]
    pub chart_version: String,
    #[serde(default)]
    pub repo: String,
    /// Name of the destination cluster; resolve through the state snapshot.
    pub cluster: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terra_helmfile_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firecloud_develop_ref: Option<String>,
    #[serde(flatten)]
    pub kind: ReleaseKind,
}

impl Release {
    pub fn app(
        name: impl Into<String>,
        environment: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let environment = environment.into();
        Self {
            chart_name: name.clone(),
            name,
            chart_version: String::new(),
            repo: "terra-helm".to_string(),
            cluster: cluster.into(),
            namespace: crate::paths::namespace_for(&environment),
            terra_helmfile_ref: None,
            firecloud_develop_ref: None,
            kind: ReleaseKind::App {
                environment,
                app_version: String::new(),
            },
        }
    }

    pub fn cluster_release(
        name: impl Into<String>,
        cluster: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            chart_name: name.clone(),
            name,
            chart_version: String::new(),
            repo: "terra-helm".to_string(),
            cluster: cluster.into(),
            namespace: namespace.into(),
            terra_helmfile_ref: None,
            firecloud_develop_ref: None,
            kind: ReleaseKind::Cluster,
        }
    }

    pub fn with_chart(mut self, chart_name: &str, repo: &str) -> Self {
        self.chart_name = chart_name.to_string();
        self.repo = repo.to_string();
        self
    }

    pub fn with_versions(mut self, chart_version: &str, app_version: &str) -> Self {
        self.chart_version = chart_version.to_string();
        self.set_app_version(app_version);
        self
    }

    pub fn is_app(&self) -> bool {
        matches!(self.kind, ReleaseKind::App { .. })
    }

    /// The environment an app release belongs to; `None` for cluster releases.
    pub fn environment(&self) -> Option<&str> {
        match &self.kind {
            ReleaseKind::App { environment, .. } => Some(environment),
            ReleaseKind::Cluster => None,
        }
    }

    /// The app version of an app release; `None` for cluster releases.
    pub fn app_version(&self) -> Option<&str> {
        match &self.kind {
            ReleaseKind::App { app_version, .. } => Some(app_version),
            ReleaseKind::Cluster => None,
        }
    }

    /// Set the app version. No-op for cluster releases.
    pub fn set_app_version(&mut self, version: &str) {
        if let ReleaseKind::App { app_version, .. } = &mut self.kind {
            *app_version = version.to_string();
        }
    }

    /// Canonical "name-in-destination" key, also the ArgoCD application name.
    pub fn full_name(&self) -> String {
        match &self.kind {
            ReleaseKind::App { environment, .. } => format!("{}-{}", self.name, environment),
            ReleaseKind::Cluster => format!("{}-{}", self.name, self.cluster),
        }
    }

    /// Chart version set, and app version set for app releases.
    pub fn has_complete_versions(&self) -> bool {
        !self.chart_version.is_empty() && self.app_version().map_or(true, |v| !v.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub releases: Vec<Release>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            project: project.into(),
            address: String::new(),
            releases: Vec::new(),
        }
    }

    /// The trailing segment of the cluster's project (`dev`, `qa`, …), used
    /// to pick test-user lists when seeding.
    pub fn project_suffix(&self) -> &str {
        self.project.rsplit('-').next().unwrap_or("")
    }
}
