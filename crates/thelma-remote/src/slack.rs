use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use thelma_core::notify::Notifier;
use thelma_core::{Result, ThelmaError};
use tracing::debug;

use crate::http::{Body, HttpClient};
use crate::token::TokenProvider;

pub const SLACK_API: &str = "https://slack.com/api";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SlackResponse {
    ok: bool,
    error: Option<String>,
    user: Option<SlackUser>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SlackUser {
    id: String,
}

impl SlackResponse {
    fn check(self, method: &str) -> Result<Self> {
        if self.ok {
            return Ok(self);
        }
        Err(ThelmaError::remote(
            "slack",
            format!("{method}: {}", self.error.as_deref().unwrap_or("unknown error")),
        ))
    }
}

/// Direct messages through the Slack Web API and devops alerts through an
/// incoming webhook.
pub struct SlackNotifier {
    http: HttpClient,
    webhook: Option<String>,
}

impl SlackNotifier {
    pub fn new(token: Arc<dyn TokenProvider>, webhook: Option<String>) -> Result<Self> {
        Ok(Self::from_client(HttpClient::new("slack", SLACK_API, token)?, webhook))
    }

    pub fn from_client(http: HttpClient, webhook: Option<String>) -> Self {
        Self {
            http,
            webhook: webhook.filter(|w| !w.trim().is_empty()),
        }
    }

    async fn call(&self, method: &str, req: Method, path: &str, body: Body) -> Result<SlackResponse> {
        let resp: SlackResponse = self.http.json(req, path, body).await?;
        resp.check(method)
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send_direct_message(&self, email: &str, markdown: &str) -> Result<()> {
        let lookup = self
            .call(
                "users.lookupByEmail",
                Method::GET,
                &format!("/users.lookupByEmail?email={email}"),
                Body::Empty,
            )
            .await?;
        let user = lookup
            .user
            .ok_or_else(|| ThelmaError::not_found("slack user", email))?;
        self.call(
            "chat.postMessage",
            Method::POST,
            "/chat.postMessage",
            Body::Json(json!({ "channel": user.id, "text": markdown, "mrkdwn": true })),
        )
        .await?;
        debug!(%email, "direct message sent");
        Ok(())
    }

    async fn send_devops_alert(&self, title: &str, text: &str, ok: bool) -> Result<()> {
        let Some(webhook) = &self.webhook else {
            debug!(%title, "no devops webhook configured, alert dropped");
            return Ok(());
        };
        let color = if ok { "good" } else { "danger" };
        let body = json!({
            "attachments": [{ "color": color, "title": title, "text": text, "mrkdwn_in": ["text"] }]
        });
        self.http
            .send(Method::POST, webhook, None, Body::Json(body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::StaticToken;
    use mockito::Matcher;
    use std::time::Duration;
    use thelma_core::error::ErrorKind;

    fn notifier(server: &mockito::Server, webhook: Option<String>) -> SlackNotifier {
        let http = HttpClient::new("slack", &server.url(), Arc::new(StaticToken("xoxb".into())))
            .unwrap()
            .with_retries(0, Duration::ZERO);
        SlackNotifier::from_client(http, webhook)
    }

    #[tokio::test]
    async fn dm_looks_up_user_then_posts() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users.lookupByEmail")
            .match_query(Matcher::UrlEncoded("email".into(), "jdoe@broadinstitute.org".into()))
            .with_body(r#"{"ok": true, "user": {"id": "U123"}}"#)
            .create_async()
            .await;
        let post = server
            .mock("POST", "/chat.postMessage")
            .match_header("authorization", "Bearer xoxb")
            .match_body(Matcher::PartialJson(json!({"channel": "U123"})))
            .with_body(r#"{"ok": true}"#)
            .create_async()
            .await;
        notifier(&server, None)
            .send_direct_message("jdoe@broadinstitute.org", "*my-bee* is ready")
            .await
            .unwrap();
        post.assert_async().await;
    }

    #[tokio::test]
    async fn slack_level_errors_surface() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users.lookupByEmail")
            .match_query(Matcher::Any)
            .with_body(r#"{"ok": false, "error": "users_not_found"}"#)
            .create_async()
            .await;
        let err = notifier(&server, None)
            .send_direct_message("ghost@example.org", "hi")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Remote);
        assert!(err.to_string().contains("users_not_found"));
    }

    #[tokio::test]
    async fn alert_posts_colored_attachment_to_webhook() {
        let mut server = mockito::Server::new_async().await;
        let hook = server
            .mock("POST", "/hooks/devops")
            .match_body(Matcher::Regex(r#""color":"danger""#.into()))
            .with_body("ok")
            .create_async()
            .await;
        let webhook = format!("{}/hooks/devops", server.url());
        notifier(&server, Some(webhook))
            .send_devops_alert("schedule conflict", "my-bee", false)
            .await
            .unwrap();
        hook.assert_async().await;
    }

    #[tokio::test]
    async fn alert_without_webhook_is_dropped() {
        let server = mockito::Server::new_async().await;
        notifier(&server, Some("  ".into()))
            .send_devops_alert("t", "x", true)
            .await
            .unwrap();
    }
}
