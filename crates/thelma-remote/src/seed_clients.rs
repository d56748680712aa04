//! HTTP calls made while seeding a BEE.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use thelma_core::seed::{Identity, SeedClients, SAM};
use thelma_core::{Result, ThelmaError};
use tracing::{debug, info};

use crate::http::{Body, HttpClient};
use crate::token;

/// Mints bearer tokens for seed identities.
#[async_trait]
pub trait IdentityTokens: Send + Sync {
    async fn token(&self, identity: &Identity) -> Result<String>;
}

/// Tokens from gcloud: service accounts by impersonation, users by their
/// credentialed gcloud account, ADC from application-default credentials.
pub struct GcloudIdentityTokens {
    service_accounts: BTreeMap<String, String>,
}

impl GcloudIdentityTokens {
    pub fn new(service_accounts: BTreeMap<String, String>) -> Self {
        Self { service_accounts }
    }
}

#[async_trait]
impl IdentityTokens for GcloudIdentityTokens {
    async fn token(&self, identity: &Identity) -> Result<String> {
        match identity {
            Identity::ServiceAccount(release) => {
                let email = self
                    .service_accounts
                    .get(release)
                    .ok_or_else(|| ThelmaError::not_found("service account", release))?;
                token::gcloud_impersonated_token(email).await
            }
            Identity::User(email) => token::gcloud_access_token(Some(email)).await,
            Identity::ApplicationDefault => token::gcloud_adc_token().await,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SamUserInfo {
    user_subject_id: String,
    user_email: String,
}

pub struct HttpSeedClients {
    http: HttpClient,
    tokens: Arc<dyn IdentityTokens>,
}

impl HttpSeedClients {
    pub fn new(tokens: Arc<dyn IdentityTokens>) -> Result<Self> {
        Ok(Self::from_client(HttpClient::anonymous("seed")?, tokens))
    }

    pub fn from_client(http: HttpClient, tokens: Arc<dyn IdentityTokens>) -> Self {
        Self { http, tokens }
    }

    async fn call(&self, method: Method, url: &str, identity: &Identity, body: Body) -> Result<String> {
        let bearer = self.tokens.token(identity).await?;
        debug!(%method, %url, %identity, "seed request");
        self.http.send(method, url, Some(&bearer), body).await
    }
}

fn profile_for(identity: &Identity) -> serde_json::Value {
    let (first, last, email) = match identity {
        Identity::ServiceAccount(release) => (release.as_str(), "service-account", String::new()),
        Identity::User(email) => {
            let local = email.split('@').next().unwrap_or(email);
            (local, "user", email.clone())
        }
        Identity::ApplicationDefault => ("thelma", "adc", String::new()),
    };
    json!({
        "firstName": first,
        "lastName": last,
        "title": "None",
        "contactEmail": email,
        "institute": "Broad Institute",
        "programLocationCity": "Cambridge",
        "programLocationState": "MA",
        "programLocationCountry": "USA",
        "termsOfService": "app.terra.bio/#terms-of-service",
    })
}

#[async_trait]
impl SeedClients for HttpSeedClients {
    async fn elasticsearch_put(&self, url: &str, body: &serde_json::Value) -> Result<()> {
        self.http
            .send(Method::PUT, url, None, Body::Json(body.clone()))
            .await?;
        Ok(())
    }

    async fn register_profile(&self, orch_url: &str, identity: &Identity) -> Result<()> {
        let url = format!("{orch_url}/register/profile");
        self.call(Method::POST, &url, identity, Body::Json(profile_for(identity)))
            .await?;
        info!(%identity, "profile registered");
        Ok(())
    }

    async fn add_sam_sa_permissions(&self, sam_url: &str, emails: &[String]) -> Result<()> {
        let admin = Identity::ServiceAccount(SAM.to_string());
        for email in emails {
            let url = format!(
                "{sam_url}/api/resources/v2/cloud-extension/google/policies/google-service-account-creators/memberEmails/{email}"
            );
            self.call(Method::PUT, &url, &admin, Body::Empty).await?;
            debug!(%email, "granted sam permissions");
        }
        Ok(())
    }

    async fn accept_terms_of_service(&self, sam_url: &str, identity: &Identity) -> Result<()> {
        let url = format!("{sam_url}/api/termsOfService/v1/user/self/accept");
        self.call(Method::PUT, &url, identity, Body::Empty).await?;
        Ok(())
    }

    async fn create_agora_methods_repository(
        &self,
        orch_url: &str,
        identity: &Identity,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let url = format!("{orch_url}/api/methods");
        match self
            .call(Method::POST, &url, identity, Body::Json(payload.clone()))
            .await
        {
            Err(ThelmaError::Conflict(_)) => {
                debug!("methods repository already exists");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn unregister_user(&self, sam_url: &str, identity: &Identity) -> Result<()> {
        let info_url = format!("{sam_url}/register/user/v2/self/info");
        let info: SamUserInfo = match self.call(Method::GET, &info_url, identity, Body::Empty).await {
            Ok(text) => serde_json::from_str(&text)?,
            Err(ThelmaError::NotFound { .. }) => {
                debug!(%identity, "not registered, nothing to remove");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let url = format!("{sam_url}/api/admin/v1/user/{}", info.user_subject_id);
        self.call(
            Method::DELETE,
            &url,
            &Identity::ServiceAccount(SAM.to_string()),
            Body::Empty,
        )
        .await?;
        info!(email = %info.user_email, "user unregistered");
        Ok(())
    }

    async fn refresh_application_default_credentials(&self) -> Result<()> {
        token::gcloud_adc_login().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::time::Duration;

    struct FixedTokens;

    #[async_trait]
    impl IdentityTokens for FixedTokens {
        async fn token(&self, identity: &Identity) -> Result<String> {
            Ok(format!("token-for-{identity}"))
        }
    }

    fn clients() -> HttpSeedClients {
        let http = HttpClient::anonymous("seed")
            .unwrap()
            .with_retries(0, Duration::ZERO);
        HttpSeedClients::from_client(http, Arc::new(FixedTokens))
    }

    #[tokio::test]
    async fn profile_registration_uses_identity_token() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/register/profile")
            .match_header("authorization", "Bearer token-for-user:qa@test.firecloud.org")
            .match_body(Matcher::PartialJson(json!({"contactEmail": "qa@test.firecloud.org"})))
            .with_body("{}")
            .create_async()
            .await;
        clients()
            .register_profile(&server.url(), &Identity::User("qa@test.firecloud.org".into()))
            .await
            .unwrap();
        m.assert_async().await;
    }

    #[tokio::test]
    async fn elasticsearch_put_is_unauthenticated() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("PUT", "/ontology")
            .match_header("authorization", Matcher::Missing)
            .with_body(r#"{"acknowledged":true}"#)
            .create_async()
            .await;
        clients()
            .elasticsearch_put(&format!("{}/ontology", server.url()), &json!({}))
            .await
            .unwrap();
        m.assert_async().await;
    }

    #[tokio::test]
    async fn existing_methods_repository_is_fine() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/methods")
            .with_status(409)
            .create_async()
            .await;
        clients()
            .create_agora_methods_repository(
                &server.url(),
                &Identity::ServiceAccount("firecloudorch".into()),
                &json!({"namespace": "automationmethods"}),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unregister_looks_up_subject_then_deletes_as_sam() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/register/user/v2/self/info")
            .with_body(r#"{"userSubjectId": "1234", "userEmail": "qa@test.firecloud.org", "enabled": true}"#)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/api/admin/v1/user/1234")
            .match_header("authorization", "Bearer token-for-sa:sam")
            .create_async()
            .await;
        clients()
            .unregister_user(&server.url(), &Identity::User("qa@test.firecloud.org".into()))
            .await
            .unwrap();
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn unregister_of_unknown_user_is_a_noop() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/register/user/v2/self/info")
            .with_status(404)
            .create_async()
            .await;
        clients()
            .unregister_user(&server.url(), &Identity::ApplicationDefault)
            .await
            .unwrap();
    }
}
