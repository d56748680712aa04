use crate::error::{Result, ThelmaError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const THELMA_HOME_ENV: &str = "THELMA_HOME";
pub const THELMA_DIR: &str = ".thelma";

pub const CONFIG_FILE: &str = "config.yaml";
pub const STATE_FILE: &str = "state/bees.json";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const LOCK_SUFFIX: &str = ".lock";

/// Namespace prefix for every environment's Kubernetes namespace.
pub const NAMESPACE_PREFIX: &str = "terra-";

pub const MAX_ENVIRONMENT_NAME_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Resolve the thelma home directory.
///
/// Priority:
/// 1. `THELMA_HOME` env var
/// 2. `~/.thelma`
pub fn thelma_home() -> Result<PathBuf> {
    if let Ok(p) = std::env::var(THELMA_HOME_ENV) {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }
    home::home_dir()
        .map(|h| h.join(THELMA_DIR))
        .ok_or(ThelmaError::HomeNotFound)
}

pub fn config_path(home: &Path) -> PathBuf {
    home.join(CONFIG_FILE)
}

pub fn state_path(home: &Path) -> PathBuf {
    home.join(STATE_FILE)
}

pub fn artifacts_dir(home: &Path) -> PathBuf {
    home.join(ARTIFACTS_DIR)
}

/// Sidecar lock file guarding a state document.
pub fn lock_path(state_file: &Path) -> PathBuf {
    let mut name = state_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(LOCK_SUFFIX);
    state_file.with_file_name(name)
}

pub fn namespace_for(environment: &str) -> String {
    format!("{NAMESPACE_PREFIX}{environment}")
}

// ---------------------------------------------------------------------------
// Environment name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9-]*$").unwrap())
}

pub fn validate_environment_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_ENVIRONMENT_NAME_LEN || !name_re().is_match(name) {
        return Err(ThelmaError::validation(format!(
            "invalid environment name '{name}': must match ^[a-z][a-z0-9-]*$ and be at most {MAX_ENVIRONMENT_NAME_LEN} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        for name in ["my-bee", "a", "swat-grungy-panda", "x1", "ends-with-dash-"] {
            validate_environment_name(name).unwrap_or_else(|_| panic!("expected valid: {name}"));
        }
    }

    #[test]
    fn invalid_names() {
        for name in [
            "",
            "-starts-with-dash",
            "1starts-with-digit",
            "has spaces",
            "UPPER",
            "a_b",
            "this-name-is-definitely-longer-than-32",
        ] {
            assert!(
                validate_environment_name(name).is_err(),
                "expected invalid: {name}"
            );
        }
    }

    #[test]
    fn path_helpers() {
        let home = Path::new("/tmp/thelma");
        assert_eq!(config_path(home), PathBuf::from("/tmp/thelma/config.yaml"));
        assert_eq!(
            state_path(home),
            PathBuf::from("/tmp/thelma/state/bees.json")
        );
        assert_eq!(
            lock_path(&state_path(home)),
            PathBuf::from("/tmp/thelma/state/bees.json.lock")
        );
        assert_eq!(namespace_for("my-bee"), "terra-my-bee");
    }
}
