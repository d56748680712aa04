use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThelmaError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{service}: {message}")]
    Remote { service: String, message: String },

    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("{} release(s) failed to sync: {}", failed.len(), failed.join(", "))]
    Partial { failed: Vec<String> },

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{}", display_multiple(.0))]
    Multiple(Vec<(String, ThelmaError)>),

    #[error("home directory not found: set HOME or THELMA_HOME")]
    HomeNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ThelmaError>;

/// Coarse classification of a [`ThelmaError`], used by callers that only
/// care about the category (retry decisions, exit summaries, tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Remote,
    Timeout,
    Partial,
    Fatal,
    Multiple,
    Local,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Remote => "remote",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Partial => "partial",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Multiple => "multiple",
            ErrorKind::Local => "local",
        };
        f.write_str(s)
    }
}

impl ThelmaError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ThelmaError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn remote(service: impl Into<String>, message: impl fmt::Display) -> Self {
        ThelmaError::Remote {
            service: service.into(),
            message: message.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ThelmaError::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ThelmaError::NotFound { .. } => ErrorKind::NotFound,
            ThelmaError::Conflict(_) => ErrorKind::Conflict,
            ThelmaError::Validation(_) => ErrorKind::Validation,
            ThelmaError::Remote { .. } => ErrorKind::Remote,
            ThelmaError::Timeout { .. } => ErrorKind::Timeout,
            ThelmaError::Partial { .. } => ErrorKind::Partial,
            ThelmaError::Fatal(_) | ThelmaError::InvalidTransition { .. } => ErrorKind::Fatal,
            ThelmaError::Multiple(_) => ErrorKind::Multiple,
            ThelmaError::HomeNotFound
            | ThelmaError::Io(_)
            | ThelmaError::Yaml(_)
            | ThelmaError::Json(_) => ErrorKind::Local,
        }
    }
}

fn display_multiple(errors: &[(String, ThelmaError)]) -> String {
    let mut out = format!("{} error(s) occurred:", errors.len());
    for (name, err) in errors {
        out.push_str(&format!("\n  {name}: {err}"));
    }
    out
}

/// Collects named errors and turns them into a single [`ThelmaError::Multiple`].
///
/// Used by the worker pool and by post-run hook execution.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    errors: Vec<(String, ThelmaError)>,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, err: ThelmaError) {
        self.errors.push((name.into(), err));
    }

    pub fn record<T>(&mut self, name: impl Into<String>, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.push(name, e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ThelmaError::Multiple(self.errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_lists_failed_releases() {
        let err = ThelmaError::Partial {
            failed: vec!["sam".into(), "rawls".into()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 release(s)"), "{msg}");
        assert!(msg.contains("sam, rawls"));
        assert_eq!(err.kind(), ErrorKind::Partial);
    }

    #[test]
    fn aggregator_is_ok_when_empty() {
        let agg = ErrorAggregator::new();
        assert!(agg.into_result().is_ok());
    }

    #[test]
    fn aggregator_collects_named_errors() {
        let mut agg = ErrorAggregator::new();
        let ok: Option<u32> = agg.record("first", Ok(1));
        assert_eq!(ok, Some(1));
        agg.record::<()>("second", Err(ThelmaError::Conflict("taken".into())));
        agg.push("third", ThelmaError::not_found("environment", "nope"));
        assert_eq!(agg.len(), 2);

        let err = agg.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Multiple);
        let msg = err.to_string();
        assert!(msg.contains("second: conflict: taken"), "{msg}");
        assert!(msg.contains("third: environment not found: nope"), "{msg}");
    }
}
