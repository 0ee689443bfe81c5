//! Delegation rules: standing redirections of task assignment.

use chrono::{DateTime, Utc};
use escapement_core::DelegationId;
use serde::{Deserialize, Serialize};

/// A standing delegation from one user to another.
///
/// Unlike a transfer, a delegation preserves provenance: tasks created for
/// the delegatee keep a reference to the original task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    /// Unique identifier.
    pub id: DelegationId,
    /// User delegating their tasks away.
    pub delegator: String,
    /// User receiving the tasks.
    pub delegatee: String,
    /// Restrict to one template; `None` applies to all.
    pub template_code: Option<String>,
    /// Restrict to one node key; `None` applies to all.
    pub node_key: Option<String>,
    /// Start of the validity window.
    pub starts_at: Option<DateTime<Utc>>,
    /// End of the validity window.
    pub ends_at: Option<DateTime<Utc>>,
    /// Whether the delegation is in force.
    pub enabled: bool,
    /// Optional condition expression evaluated against task variables.
    pub condition: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Delegation {
    /// Creates an enabled, unscoped delegation.
    #[must_use]
    pub fn new(delegator: impl Into<String>, delegatee: impl Into<String>) -> Self {
        Self {
            id: DelegationId::new(),
            delegator: delegator.into(),
            delegatee: delegatee.into(),
            template_code: None,
            node_key: None,
            starts_at: None,
            ends_at: None,
            enabled: true,
            condition: None,
            created_at: Utc::now(),
        }
    }

    /// Scopes the delegation to one template.
    #[must_use]
    pub fn for_template(mut self, template_code: impl Into<String>) -> Self {
        self.template_code = Some(template_code.into());
        self
    }

    /// Scopes the delegation to one node key.
    #[must_use]
    pub fn for_node(mut self, node_key: impl Into<String>) -> Self {
        self.node_key = Some(node_key.into());
        self
    }

    /// Bounds the delegation to a time window.
    #[must_use]
    pub fn between(mut self, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        self.starts_at = Some(starts_at);
        self.ends_at = Some(ends_at);
        self
    }

    /// Returns true if the delegation applies at `now` for the given
    /// template/node scope. The condition expression, if any, is
    /// evaluated separately by the caller.
    #[must_use]
    pub fn is_applicable(&self, now: DateTime<Utc>, template_code: &str, node_key: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(scope) = &self.template_code
            && scope != template_code
        {
            return false;
        }
        if let Some(scope) = &self.node_key
            && scope != node_key
        {
            return false;
        }
        if let Some(starts) = self.starts_at
            && now < starts
        {
            return false;
        }
        if let Some(ends) = self.ends_at
            && now > ends
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn unscoped_delegation_applies() {
        let delegation = Delegation::new("u1", "u2");
        assert!(delegation.is_applicable(Utc::now(), "any", "any"));
    }

    #[test]
    fn disabled_delegation_never_applies() {
        let mut delegation = Delegation::new("u1", "u2");
        delegation.enabled = false;
        assert!(!delegation.is_applicable(Utc::now(), "any", "any"));
    }

    #[test]
    fn template_scope_filters() {
        let delegation = Delegation::new("u1", "u2").for_template("expense");
        assert!(delegation.is_applicable(Utc::now(), "expense", "n1"));
        assert!(!delegation.is_applicable(Utc::now(), "leave", "n1"));
    }

    #[test]
    fn window_filters() {
        let now = Utc::now();
        let delegation =
            Delegation::new("u1", "u2").between(now - Duration::hours(1), now + Duration::hours(1));
        assert!(delegation.is_applicable(now, "t", "n"));
        assert!(!delegation.is_applicable(now + Duration::hours(2), "t", "n"));
        assert!(!delegation.is_applicable(now - Duration::hours(2), "t", "n"));
    }
}
