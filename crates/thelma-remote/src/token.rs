//! Bearer tokens for the remote services.
//!
//! Tokens come from an environment variable when set, and otherwise from
//! `gcloud auth print-access-token`. The gcloud lookup runs at most once per
//! provider and only when a request actually needs a token.

use crate::process::run_capture;
use async_trait::async_trait;
use thelma_core::{Result, ThelmaError};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// A fixed token, or none at all when empty.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Reads the token from an environment variable, falling back to gcloud.
pub struct EnvOrGcloudToken {
    var: String,
    account: Option<String>,
    cached: OnceCell<String>,
}

impl EnvOrGcloudToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            account: None,
            cached: OnceCell::new(),
        }
    }

    /// Use a specific gcloud account for the fallback.
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }
}

#[async_trait]
impl TokenProvider for EnvOrGcloudToken {
    async fn token(&self) -> Result<String> {
        if let Ok(token) = std::env::var(&self.var) {
            if !token.trim().is_empty() {
                return Ok(token.trim().to_string());
            }
        }
        let token = self
            .cached
            .get_or_try_init(|| async {
                debug!(var = %self.var, "token variable unset, asking gcloud");
                gcloud_access_token(self.account.as_deref()).await
            })
            .await?;
        Ok(token.clone())
    }
}

fn gcloud() -> Result<Command> {
    let path = which::which("gcloud").map_err(|_| {
        ThelmaError::Fatal("gcloud not found on PATH; install the Google Cloud SDK or set a token variable".into())
    })?;
    Ok(Command::new(path))
}

/// `gcloud auth print-access-token [ACCOUNT]`.
pub async fn gcloud_access_token(account: Option<&str>) -> Result<String> {
    let mut cmd = gcloud()?;
    cmd.args(["auth", "print-access-token"]);
    if let Some(account) = account {
        cmd.arg(account);
    }
    let out = run_capture(cmd, "gcloud").await?;
    first_line(&out)
}

/// Access token minted by impersonating a service account.
pub async fn gcloud_impersonated_token(service_account: &str) -> Result<String> {
    let mut cmd = gcloud()?;
    cmd.args([
        "auth",
        "print-access-token",
        &format!("--impersonate-service-account={service_account}"),
    ]);
    let out = run_capture(cmd, "gcloud").await?;
    first_line(&out)
}

/// Access token from the caller's application-default credentials.
pub async fn gcloud_adc_token() -> Result<String> {
    let mut cmd = gcloud()?;
    cmd.args(["auth", "application-default", "print-access-token"]);
    let out = run_capture(cmd, "gcloud").await?;
    first_line(&out)
}

/// Interactive `gcloud auth application-default login`.
pub async fn gcloud_adc_login() -> Result<()> {
    let mut cmd = gcloud()?;
    cmd.args(["auth", "application-default", "login"]);
    let status = cmd
        .status()
        .await
        .map_err(|e| ThelmaError::remote("gcloud", e))?;
    if !status.success() {
        return Err(ThelmaError::remote(
            "gcloud",
            format!("application-default login exited with {status}"),
        ));
    }
    Ok(())
}

fn first_line(out: &str) -> Result<String> {
    out.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ThelmaError::remote("gcloud", "printed no access token"))
}
