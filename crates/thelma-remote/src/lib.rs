//! `thelma-remote`: adapters from the orchestrator's collaborator traits to
//! the real services.
//!
//! ```text
//! StateStore    ← SherlockStateStore   (Sherlock JSON API)
//!               ← GcsStateStore        (Cloud Storage JSON API)
//! ArgoApi       ← ArgoHttpApi          (ArgoCD REST API)
//! Kubernetes    ← KubeClient           (kube-rs + kubectl port-forward)
//! SeedClients   ← HttpSeedClients      (Elasticsearch, Orch, Sam)
//! Notifier      ← SlackNotifier        (Slack Web API + webhook)
//! ArtifactStore ← GcsArtifactStore     (Cloud Storage JSON API)
//! ```
//!
//! Every HTTP adapter goes through [`http::HttpClient`], which handles bearer
//! auth, the request timeout, and retries with jitter. Transport failures map
//! into `ThelmaError` in [`error`].

pub mod argocd;
pub mod error;
pub mod gcs;
pub mod http;
pub mod kube;
pub mod process;
pub mod seed_clients;
pub mod sherlock;
pub mod slack;
pub mod token;

pub use argocd::ArgoHttpApi;
pub use gcs::{GcsArtifactStore, GcsStateStore};
pub use http::HttpClient;
pub use kube::KubeClient;
pub use seed_clients::{GcloudIdentityTokens, HttpSeedClients};
pub use sherlock::SherlockStateStore;
pub use slack::SlackNotifier;
pub use token::{EnvOrGcloudToken, StaticToken, TokenProvider};
