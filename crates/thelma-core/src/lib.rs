pub mod argocd;
pub mod bee;
pub mod config;
pub mod environment;
pub mod error;
pub mod hooks;
pub mod io;
pub mod kube;
pub mod lifecycle;
pub mod logs;
pub mod metrics;
pub mod notify;
pub mod paths;
pub mod pin;
pub mod pool;
pub mod release;
pub mod schedule;
pub mod seed;
pub mod state;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Result, ThelmaError};
