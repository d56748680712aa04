use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SHERLOCK_ADDR_ENV: &str = "THELMA_SHERLOCK_ADDR";
pub const ARGOCD_ADDR_ENV: &str = "THELMA_ARGOCD_ADDR";
pub const STATE_PATH_ENV: &str = "THELMA_STATE_PATH";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// StateConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    Local,
    Sherlock,
    /// One JSON object in a Cloud Storage bucket.
    Gcs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state document; defaults to `$THELMA_HOME/state/bees.json`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Bucket holding the state object for the `gcs` backend.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_state_object")]
    pub object: String,
    #[serde(default = "default_stale_lock_seconds")]
    pub stale_lock_seconds: u64,
}

fn default_state_object() -> String {
    "thelma/state/bees.json".to_string()
}

fn default_stale_lock_seconds() -> u64 {
    60
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::Local,
            path: None,
            bucket: None,
            object: default_state_object(),
            stale_lock_seconds: default_stale_lock_seconds(),
        }
    }
}

// ---------------------------------------------------------------------------
// SherlockConfig / ArgoCdConfig / KubernetesConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SherlockConfig {
    #[serde(default)]
    pub addr: String,
    #[serde(default = "default_sherlock_token_env")]
    pub token_env: String,
}

fn default_sherlock_token_env() -> String {
    "SHERLOCK_TOKEN".to_string()
}

impl Default for SherlockConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            token_env: default_sherlock_token_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgoCdConfig {
    #[serde(default)]
    pub addr: String,
    #[serde(default = "default_argocd_token_env")]
    pub token_env: String,
    #[serde(default = "default_base_generator")]
    pub base_generator: String,
    #[serde(default = "default_wait_exist_timeout")]
    pub wait_exist_timeout_seconds: u64,
    #[serde(default = "default_wait_exist_poll")]
    pub wait_exist_poll_seconds: u64,
    #[serde(default = "default_wait_healthy_poll")]
    pub wait_healthy_poll_seconds: u64,
}

fn default_argocd_token_env() -> String {
    "ARGOCD_TOKEN".to_string()
}

fn default_base_generator() -> String {
    "terra-bee-generator".to_string()
}

fn default_wait_exist_timeout() -> u64 {
    60
}

fn default_wait_exist_poll() -> u64 {
    10
}

fn default_wait_healthy_poll() -> u64 {
    15
}

impl Default for ArgoCdConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            token_env: default_argocd_token_env(),
            base_generator: default_base_generator(),
            wait_exist_timeout_seconds: default_wait_exist_timeout(),
            wait_exist_poll_seconds: default_wait_exist_poll(),
            wait_healthy_poll_seconds: default_wait_healthy_poll(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Prepended to the cluster name to form the kubeconfig context.
    #[serde(default)]
    pub context_prefix: String,
    #[serde(default = "default_instance_label")]
    pub instance_label: String,
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
}

fn default_instance_label() -> String {
    "app.kubernetes.io/instance".to_string()
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            context_prefix: String::new(),
            instance_label: default_instance_label(),
            kubectl: default_kubectl(),
        }
    }
}

// ---------------------------------------------------------------------------
// BeeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeeConfig {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_template")]
    pub default_template: String,
    #[serde(default = "default_provision_timeout")]
    pub wait_healthy_timeout_seconds: u64,
    #[serde(default = "default_start_stop_timeout")]
    pub start_stop_wait_healthy_timeout_seconds: u64,
    #[serde(default = "default_seed_attempts")]
    pub seed_attempts: u32,
    #[serde(default = "default_seed_backoff")]
    pub seed_backoff_seconds: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_domain() -> String {
    "bee.envs-terra.bio".to_string()
}

fn default_template() -> String {
    "swatomation".to_string()
}

fn default_provision_timeout() -> u64 {
    1800
}

fn default_start_stop_timeout() -> u64 {
    1200
}

fn default_seed_attempts() -> u32 {
    3
}

fn default_seed_backoff() -> u64 {
    2
}

fn default_max_parallel() -> usize {
    10
}

impl Default for BeeConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            default_template: default_template(),
            wait_healthy_timeout_seconds: default_provision_timeout(),
            start_stop_wait_healthy_timeout_seconds: default_start_stop_timeout(),
            seed_attempts: default_seed_attempts(),
            seed_backoff_seconds: default_seed_backoff(),
            max_parallel: default_max_parallel(),
        }
    }
}

// ---------------------------------------------------------------------------
// SeedConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default = "default_es_index")]
    pub elasticsearch_index: String,
    #[serde(default = "default_es_service")]
    pub elasticsearch_service: String,
    #[serde(default = "default_es_port")]
    pub elasticsearch_port: u16,
    /// Service account email per release name.
    #[serde(default = "default_service_accounts")]
    pub service_accounts: BTreeMap<String, String>,
    /// Test users per cluster project suffix (`dev`, `qa`).
    #[serde(default)]
    pub test_users: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_agora_payload")]
    pub agora_methods_repository: serde_json::Value,
}

fn default_es_index() -> String {
    "ontology".to_string()
}

fn default_es_service() -> String {
    "elasticsearch-master".to_string()
}

fn default_es_port() -> u16 {
    9200
}

fn default_service_accounts() -> BTreeMap<String, String> {
    [
        ("firecloudorch", "firecloud-qa@broad-dsde-qa.iam.gserviceaccount.com"),
        ("rawls", "rawls-qa@broad-dsde-qa.iam.gserviceaccount.com"),
        ("sam", "sam-qa@broad-dsde-qa.iam.gserviceaccount.com"),
        ("leonardo", "leonardo-qa@broad-dsde-qa.iam.gserviceaccount.com"),
        ("importservice", "import-service-qa@broad-dsde-qa.iam.gserviceaccount.com"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_agora_payload() -> serde_json::Value {
    serde_json::json!({
        "namespace": "automationmethods",
        "name": "methods-repository",
        "synopsis": "seeded by thelma",
        "entityType": "Workflow",
    })
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            elasticsearch_index: default_es_index(),
            elasticsearch_service: default_es_service(),
            elasticsearch_port: default_es_port(),
            service_accounts: default_service_accounts(),
            test_users: BTreeMap::new(),
            agora_methods_repository: default_agora_payload(),
        }
    }
}

// ---------------------------------------------------------------------------
// SlackConfig / ArtifactsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default = "default_slack_token_env")]
    pub token_env: String,
    #[serde(default = "default_devops_webhook_env")]
    pub devops_webhook_env: String,
}

fn default_slack_token_env() -> String {
    "SLACK_TOKEN".to_string()
}

fn default_devops_webhook_env() -> String {
    "SLACK_DEVOPS_WEBHOOK".to_string()
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            token_env: default_slack_token_env(),
            devops_webhook_env: default_devops_webhook_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Local artifacts directory; defaults to `$THELMA_HOME/artifacts`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_cache_control")]
    pub cache_control: String,
}

fn default_cache_control() -> String {
    "no-store".to_string()
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            bucket: None,
            cache_control: default_cache_control(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub sherlock: SherlockConfig,
    #[serde(default)]
    pub argocd: ArgoCdConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub bee: BeeConfig,
    #[serde(default)]
    pub seed: SeedConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

impl Config {
    /// Load from `path`. A missing file yields the default config.
    pub fn load(path: &Path) -> Result<Self> {
        match crate::io::read_optional(path)? {
            Some(data) if !data.iter().all(u8::is_ascii_whitespace) => {
                Ok(serde_yaml::from_slice(&data)?)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// Apply `THELMA_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|k| std::env::var(k).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());
        if let Some(addr) = non_empty(SHERLOCK_ADDR_ENV) {
            self.sherlock.addr = addr;
        }
        if let Some(addr) = non_empty(ARGOCD_ADDR_ENV) {
            self.argocd.addr = addr;
        }
        if let Some(path) = non_empty(STATE_PATH_ENV) {
            self.state.path = Some(PathBuf::from(path));
        }
        self
    }

    pub fn state_path(&self, home: &Path) -> PathBuf {
        self.state
            .path
            .clone()
            .unwrap_or_else(|| paths::state_path(home))
    }

    pub fn artifacts_dir(&self, home: &Path) -> PathBuf {
        self.artifacts
            .dir
            .clone()
            .unwrap_or_else(|| paths::artifacts_dir(home))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.state.backend == StateBackend::Sherlock && self.sherlock.addr.trim().is_empty() {
            warnings.push(ConfigWarning::error(
                "state.backend is sherlock but sherlock.addr is not set",
            ));
        }
        if self.state.backend == StateBackend::Gcs
            && self.state.bucket.as_deref().map_or(true, |b| b.trim().is_empty())
        {
            warnings.push(ConfigWarning::error("state.backend is gcs but state.bucket is not set"));
        }
        if self.argocd.addr.trim().is_empty() {
            warnings.push(ConfigWarning::warning(
                "argocd.addr is not set; sync operations will fail",
            ));
        }
        if self.bee.seed_attempts == 0 {
            warnings.push(ConfigWarning::error("bee.seed_attempts must be at least 1"));
        }
        if self.bee.max_parallel == 0 {
            warnings.push(ConfigWarning::error("bee.max_parallel must be at least 1"));
        }
        if self.argocd.wait_exist_poll_seconds == 0 || self.argocd.wait_healthy_poll_seconds == 0 {
            warnings.push(ConfigWarning::error("argocd poll intervals must be non-zero"));
        }
        for (suffix, users) in &self.seed.test_users {
            if users.iter().any(|u| !u.contains('@')) {
                warnings.push(ConfigWarning::warning(format!(
                    "seed.test_users.{suffix} contains an entry that is not an email"
                )));
            }
        }
        if !self.seed.service_accounts.contains_key("firecloudorch") {
            warnings.push(ConfigWarning::warning(
                "seed.service_accounts has no firecloudorch entry; seed steps 2 and 5 will fail",
            ));
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
