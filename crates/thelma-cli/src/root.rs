use anyhow::Context;
use std::path::{Path, PathBuf};
use thelma_core::paths;

/// Where a command reads its configuration from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locations {
    pub home: PathBuf,
    pub config: PathBuf,
}

/// Resolve the thelma home directory and config file.
///
/// Priority for the config file:
/// 1. `--config` flag / `THELMA_CONFIG` env var (passed in as `explicit`)
/// 2. `$THELMA_HOME/config.yaml`
/// 3. `~/.thelma/config.yaml`
pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Locations> {
    let home = paths::thelma_home().context("cannot determine thelma home")?;
    Ok(locations(home, explicit))
}

fn locations(home: PathBuf, explicit: Option<&Path>) -> Locations {
    let config = match explicit {
        Some(p) => p.to_path_buf(),
        None => paths::config_path(&home),
    };
    Locations { home, config }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_config_wins() {
        let dir = TempDir::new().unwrap();
        let explicit = dir.path().join("elsewhere.yaml");
        let loc = locations(dir.path().to_path_buf(), Some(&explicit));
        assert_eq!(loc.config, explicit);
        assert_eq!(loc.home, dir.path());
    }

    #[test]
    fn config_defaults_under_home() {
        let dir = TempDir::new().unwrap();
        let loc = locations(dir.path().to_path_buf(), None);
        assert_eq!(loc.config, dir.path().join("config.yaml"));
    }
}
