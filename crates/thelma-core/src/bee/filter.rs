use crate::environment::Environment;
use chrono::{DateTime, Utc};

/// Selects BEEs (dynamic environments) out of a state snapshot. Every
/// criterion that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeeFilter {
    pub template: Option<String>,
    pub owner: Option<String>,
    pub offline: Option<bool>,
    pub name_contains: Option<String>,
    /// Only BEEs whose auto-delete is enabled and due at this instant.
    pub auto_delete_due_at: Option<DateTime<Utc>>,
}

impl BeeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = Some(offline);
        self
    }

    pub fn name_contains(mut self, s: impl Into<String>) -> Self {
        self.name_contains = Some(s.into());
        self
    }

    pub fn auto_delete_due_at(mut self, now: DateTime<Utc>) -> Self {
        self.auto_delete_due_at = Some(now);
        self
    }

    pub fn matches(&self, env: &Environment) -> bool {
        env.is_dynamic()
            && self.template.as_ref().map_or(true, |t| &env.template == t)
            && self.owner.as_ref().map_or(true, |o| env.owner.eq_ignore_ascii_case(o))
            && self.offline.map_or(true, |o| env.offline == o)
            && self
                .name_contains
                .as_ref()
                .map_or(true, |s| env.name.contains(s.as_str()))
            && self.auto_delete_due_at.map_or(true, |now| env.auto_delete_due(now))
    }
}
