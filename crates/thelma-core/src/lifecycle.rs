use crate::error::{Result, ThelmaError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// BeeState
// ---------------------------------------------------------------------------

/// Where a BEE is in its lifecycle during one orchestrator run.
///
/// A failed step leaves the BEE in an intermediate state; a later sync
/// re-enters at `GeneratorSyncing` and converges from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeeState {
    NonExistent,
    Created,
    GeneratorSyncing,
    AppsSyncing,
    Seeding,
    Ready,
    Stopped,
    Deleting,
}

impl BeeState {
    pub fn as_str(self) -> &'static str {
        match self {
            BeeState::NonExistent => "non_existent",
            BeeState::Created => "created",
            BeeState::GeneratorSyncing => "generator_syncing",
            BeeState::AppsSyncing => "apps_syncing",
            BeeState::Seeding => "seeding",
            BeeState::Ready => "ready",
            BeeState::Stopped => "stopped",
            BeeState::Deleting => "deleting",
        }
    }

    /// Starting state of an environment that already exists in state.
    pub fn existing(offline: bool) -> Self {
        if offline {
            BeeState::Stopped
        } else {
            BeeState::Ready
        }
    }

    pub fn can_transition_to(self, next: BeeState) -> bool {
        use BeeState::*;
        match (self, next) {
            (NonExistent, Created) => true,
            (Deleting, NonExistent) => true,
            (NonExistent, _) | (Deleting, _) => false,
            (_, Deleting) => true,
            // Convergence: any live state may start a sync.
            (_, GeneratorSyncing) => true,
            (GeneratorSyncing, AppsSyncing) => true,
            // Generator-only provisioning stops here.
            (GeneratorSyncing, Ready) => true,
            (AppsSyncing, Seeding) | (AppsSyncing, Ready) => true,
            (Seeding, Ready) => true,
            // An offline BEE settles back into Stopped after a sync.
            (GeneratorSyncing, Stopped) | (AppsSyncing, Stopped) | (Seeding, Stopped) => true,
            (Created, Seeding) | (Ready, Seeding) | (Stopped, Seeding) => true,
            (Ready, Stopped) | (Created, Stopped) => true,
            (Stopped, Ready) | (Stopped, Created) => true,
            (Created, Ready) => true,
            _ => false,
        }
    }

    pub fn transition(self, next: BeeState) -> Result<BeeState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ThelmaError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for BeeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BeeState::*;

    #[test]
    fn provision_path_is_legal() {
        let mut s = NonExistent;
        for next in [Created, GeneratorSyncing, AppsSyncing, Seeding, Ready, Stopped, Ready] {
            s = s.transition(next).unwrap();
        }
        assert_eq!(s, Ready);
        s = s.transition(Deleting).unwrap();
        assert_eq!(s.transition(NonExistent).unwrap(), NonExistent);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(NonExistent.transition(Ready).is_err());
        assert!(Created.transition(AppsSyncing).is_err());
        assert!(Deleting.transition(Ready).is_err());
        let err = NonExistent.transition(Seeding).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
        assert!(err.to_string().contains("non_existent"));
    }

    #[test]
    fn failed_intermediate_states_can_resync() {
        for s in [AppsSyncing, Seeding, GeneratorSyncing, Stopped] {
            assert!(s.can_transition_to(GeneratorSyncing));
        }
        assert!(AppsSyncing.can_transition_to(Stopped));
    }
}
