//! Mapping of transport errors into [`ThelmaError`].

use reqwest::StatusCode;
use thelma_core::ThelmaError;

/// Kind used for `NotFound` errors raised from HTTP 404s.
pub const REMOTE_OBJECT: &str = "remote object";

pub fn from_reqwest(service: &str, err: reqwest::Error) -> ThelmaError {
    if err.is_timeout() {
        return ThelmaError::remote(service, format!("request timed out: {err}"));
    }
    ThelmaError::remote(service, err)
}

/// Classify a non-success HTTP response.
pub fn from_status(service: &str, what: &str, status: StatusCode, body: &str) -> ThelmaError {
    let body = body.trim();
    match status {
        StatusCode::NOT_FOUND => ThelmaError::not_found(REMOTE_OBJECT, format!("{service} {what}")),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            ThelmaError::Conflict(format!("{service} {what}: {body}"))
        }
        _ if body.is_empty() => ThelmaError::remote(service, format!("{what}: HTTP {}", status.as_u16())),
        _ => ThelmaError::remote(service, format!("{what}: HTTP {}: {body}", status.as_u16())),
    }
}

pub fn from_kube(err: kube::Error) -> ThelmaError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => {
            ThelmaError::not_found(REMOTE_OBJECT, format!("kubernetes {}", resp.message))
        }
        kube::Error::Api(resp) if resp.code == 409 => ThelmaError::Conflict(resp.message),
        other => ThelmaError::remote("kubernetes", other),
    }
}

/// Whether a kube error is an HTTP `code` from the API server.
pub fn is_kube_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use thelma_core::error::ErrorKind;

    #[test]
    fn status_classification() {
        let e = from_status("sherlock", "GET /api/environments/v3/x", StatusCode::NOT_FOUND, "");
        assert_eq!(e.kind(), ErrorKind::NotFound);
        let e = from_status("sherlock", "POST /api/environments/v3", StatusCode::CONFLICT, "exists");
        assert_eq!(e.kind(), ErrorKind::Conflict);
        let e = from_status("gcs", "POST /upload", StatusCode::PRECONDITION_FAILED, "conditionNotMet");
        assert_eq!(e.kind(), ErrorKind::Conflict);
        let e = from_status("argocd", "sync", StatusCode::BAD_GATEWAY, " upstream down \n");
        assert_eq!(e.kind(), ErrorKind::Remote);
        assert_eq!(e.to_string(), "argocd: sync: HTTP 502: upstream down");
    }
}
