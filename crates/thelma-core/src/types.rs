use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Static,
    Template,
    Dynamic,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Static => "static",
            Lifecycle::Template => "template",
            Lifecycle::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lifecycle {
    type Err = crate::error::ThelmaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(Lifecycle::Static),
            "template" => Ok(Lifecycle::Template),
            "dynamic" => Ok(Lifecycle::Dynamic),
            _ => Err(crate::error::ThelmaError::validation(format!(
                "unknown lifecycle: {s}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// HealthStatus
// ---------------------------------------------------------------------------

/// ArgoCD application health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Progressing => "Progressing",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::Suspended => "Suspended",
            HealthStatus::Missing => "Missing",
            HealthStatus::Unknown => "Unknown",
        }
    }

    /// Parse ArgoCD's health string; anything unrecognised is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "Healthy" => HealthStatus::Healthy,
            "Progressing" => HealthStatus::Progressing,
            "Degraded" => HealthStatus::Degraded,
            "Suspended" => HealthStatus::Suspended,
            "Missing" => HealthStatus::Missing,
            _ => HealthStatus::Unknown,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SyncCode
// ---------------------------------------------------------------------------

/// ArgoCD application sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncCode {
    Synced,
    OutOfSync,
    Unknown,
}

impl SyncCode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncCode::Synced => "Synced",
            SyncCode::OutOfSync => "OutOfSync",
            SyncCode::Unknown => "Unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Synced" => SyncCode::Synced,
            "OutOfSync" => SyncCode::OutOfSync,
            _ => SyncCode::Unknown,
        }
    }
}

impl fmt::Display for SyncCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health and sync status of a single ArgoCD application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub health: HealthStatus,
    pub sync: SyncCode,
}

impl SyncStatus {
    pub fn new(health: HealthStatus, sync: SyncCode) -> Self {
        Self { health, sync }
    }

    pub fn healthy_and_synced() -> Self {
        Self::new(HealthStatus::Healthy, SyncCode::Synced)
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HealthStatus::Healthy
    }

    pub fn is_synced(&self) -> bool {
        self.sync == SyncCode::Synced
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.health, self.sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn lifecycle_round_trips_through_str() {
        for l in [Lifecycle::Static, Lifecycle::Template, Lifecycle::Dynamic] {
            assert_eq!(Lifecycle::from_str(l.as_str()).unwrap(), l);
        }
        assert!(Lifecycle::from_str("ephemeral").is_err());
    }

    #[test]
    fn unknown_health_strings_map_to_unknown() {
        assert_eq!(HealthStatus::parse("Healthy"), HealthStatus::Healthy);
        assert_eq!(HealthStatus::parse("weird"), HealthStatus::Unknown);
        assert_eq!(SyncCode::parse(""), SyncCode::Unknown);
    }

    #[test]
    fn status_display() {
        let s = SyncStatus::new(HealthStatus::Degraded, SyncCode::OutOfSync);
        assert_eq!(s.to_string(), "Degraded/OutOfSync");
        assert!(!s.is_healthy());
    }
}
