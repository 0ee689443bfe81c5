//! Assignment rules for auto-assigning unclaimed tasks.

use escapement_core::RuleId;
use serde::{Deserialize, Serialize};

/// How a matching rule distributes a task among its assignees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AssignMode {
    /// Assign to every listed user.
    All,
    /// Assign to the least-loaded listed user.
    Any,
    /// Assign to the top ⌈n·p/100⌉ listed users.
    Percentage { percent: u8 },
}

/// A prioritized auto-assignment rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRule {
    /// Unique identifier.
    pub id: RuleId,
    /// Human-readable name.
    pub name: String,
    /// Higher priorities are tried first.
    pub priority: i32,
    /// Whether the rule participates in assignment.
    pub enabled: bool,
    /// Condition expression over task variables; `None` always matches.
    pub expression: Option<String>,
    /// Distribution mode.
    pub mode: AssignMode,
    /// Candidate users.
    pub assignees: Vec<String>,
}

impl AssignmentRule {
    /// Creates an enabled rule.
    #[must_use]
    pub fn new(name: impl Into<String>, mode: AssignMode, assignees: Vec<String>) -> Self {
        Self {
            id: RuleId::new(),
            name: name.into(),
            priority: 0,
            enabled: true,
            expression: None,
            mode,
            assignees,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the condition expression.
    #[must_use]
    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    /// Returns how many assignees a percentage-mode rule selects.
    #[must_use]
    pub fn percentage_count(&self, percent: u8) -> usize {
        let n = self.assignees.len();
        if n == 0 {
            return 0;
        }
        // Ceiling of n * percent / 100, at least one.
        ((n * usize::from(percent)).div_ceil(100)).clamp(1, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_count_rounds_up() {
        let rule = AssignmentRule::new(
            "oncall",
            AssignMode::Percentage { percent: 50 },
            vec!["a".into(), "b".into(), "c".into()],
        );
        assert_eq!(rule.percentage_count(50), 2);
        assert_eq!(rule.percentage_count(100), 3);
        assert_eq!(rule.percentage_count(1), 1);
    }

    #[test]
    fn percentage_count_handles_empty() {
        let rule = AssignmentRule::new("none", AssignMode::All, Vec::new());
        assert_eq!(rule.percentage_count(50), 0);
    }

    #[test]
    fn mode_serde_tags() {
        let json = serde_json::to_value(AssignMode::Percentage { percent: 30 }).unwrap();
        assert_eq!(json["mode"], "percentage");
        assert_eq!(json["percent"], 30);
    }
}
