//! JSON-over-HTTP client shared by the remote adapters.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use thelma_core::{Result, ThelmaError};
use tracing::debug;

use crate::error::{from_reqwest, from_status};
use crate::token::{StaticToken, TokenProvider};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Request payload.
#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    Bytes { data: Vec<u8>, content_type: String },
}

pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    service: String,
    token: Arc<dyn TokenProvider>,
    max_retries: u32,
    retry_base: Duration,
}

impl HttpClient {
    pub fn new(service: impl Into<String>, base_url: &str, token: Arc<dyn TokenProvider>) -> Result<Self> {
        let service = service.into();
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(concat!("thelma/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| from_reqwest(&service, e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service,
            token,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: RETRY_BASE_DELAY,
        })
    }

    /// Client for absolute URLs with no bearer token.
    pub fn anonymous(service: impl Into<String>) -> Result<Self> {
        Self::new(service, "", Arc::new(StaticToken::default()))
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = base_delay;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.json(Method::GET, path, Body::Empty).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T> {
        self.json(Method::POST, path, Body::Json(body)).await
    }

    pub async fn patch<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T> {
        self.json(Method::PATCH, path, Body::Json(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.json(Method::DELETE, path, Body::Empty).await
    }

    /// Send and decode the response as JSON. An empty body decodes as `null`.
    pub async fn json<T: DeserializeOwned>(&self, method: Method, path: &str, body: Body) -> Result<T> {
        decode(&self.text(method, path, body).await?)
    }

    /// Send with the client's token and return the raw response body.
    pub async fn text(&self, method: Method, path: &str, body: Body) -> Result<String> {
        let bearer = self.token.token().await?;
        self.send(method, path, Some(&bearer), body).await
    }

    /// Send with an explicit bearer token (`None` for no auth header) and
    /// return the raw response body.
    pub async fn send(&self, method: Method, path: &str, bearer: Option<&str>, body: Body) -> Result<String> {
        let url = self.url(path);
        let what = format!("{method} {}", path.split('?').next().unwrap_or(path));
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            let mut req = self.client.request(method.clone(), &url);
            if let Some(token) = bearer.filter(|t| !t.is_empty()) {
                req = req.bearer_auth(token);
            }
            req = match &body {
                Body::Empty => req,
                Body::Json(v) => req.json(v),
                Body::Bytes { data, content_type } => req
                    .header(reqwest::header::CONTENT_TYPE, content_type.as_str())
                    .body(data.clone()),
            };

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp
                        .text()
                        .await
                        .map_err(|e| from_reqwest(&self.service, e))?;
                    if status.is_success() {
                        return Ok(text);
                    }
                    let err = from_status(&self.service, &what, status, &text);
                    if attempt < self.max_retries && is_retryable(status) {
                        debug!(service = %self.service, %what, status = status.as_u16(), attempt, "retrying");
                        last_err = Some(err);
                        self.sleep_with_jitter(attempt).await;
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    let err = from_reqwest(&self.service, e);
                    if attempt < self.max_retries {
                        debug!(service = %self.service, %what, attempt, error = %err, "retrying");
                        last_err = Some(err);
                        self.sleep_with_jitter(attempt).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ThelmaError::remote(&self.service, format!("{what}: no attempts made"))))
    }

    /// GET `path` once and report the status. Client errors (4xx) are
    /// returned as a status rather than an error.
    pub async fn get_status(&self, path: &str) -> Result<StatusCode> {
        let bearer = self.token.token().await?;
        let mut req = self.client.get(self.url(path));
        if !bearer.is_empty() {
            req = req.bearer_auth(bearer);
        }
        let resp = req.send().await.map_err(|e| from_reqwest(&self.service, e))?;
        let status = resp.status();
        if status.is_success() || status.is_client_error() {
            return Ok(status);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(from_status(&self.service, &format!("GET {path}"), status, &body))
    }

    async fn sleep_with_jitter(&self, attempt: u32) {
        let base = self.retry_base.saturating_mul(2u32.saturating_pow(attempt));
        let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..0.3));
        tokio::time::sleep(base + jitter).await;
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    if text.trim().is_empty() {
        return Ok(serde_json::from_str("null")?);
    }
    Ok(serde_json::from_str(text)?)
}
