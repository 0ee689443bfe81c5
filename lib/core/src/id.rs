//! Strongly-typed ID types for domain entities.
//!
//! All IDs use ULID (Universally Unique Lexicographically Sortable Identifier)
//! format, providing both uniqueness and temporal ordering. Temporal ordering
//! matters here: rollback walks node instances in reverse completion order,
//! and sortable ids keep that cheap.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to generate a strongly-typed ID wrapper around ULID.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates a new ID with a randomly generated ULID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Creates an ID from a ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the prefix used for display formatting.
            #[must_use]
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                // Accept both the prefixed display form and a raw ULID.
                let prefix_with_underscore = concat!($prefix, "_");
                let ulid_str = s.strip_prefix(prefix_with_underscore).unwrap_or(s);

                Ulid::from_str(ulid_str)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        reason: e.to_string(),
                    })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl From<$name> for Ulid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Unique identifier for a process instance.
    ProcessId,
    "proc"
);

define_id!(
    /// Unique identifier for a process template.
    TemplateId,
    "tpl"
);

define_id!(
    /// Unique identifier for a node instance within a process.
    ///
    /// Distinct from the node *key*, which is the author-assigned name of a
    /// node within its template graph.
    NodeInstanceId,
    "ndi"
);

define_id!(
    /// Unique identifier for a task.
    TaskId,
    "task"
);

define_id!(
    /// Unique identifier for a history record.
    HistoryId,
    "hist"
);

define_id!(
    /// Unique identifier for a delegation rule.
    DelegationId,
    "dlg"
);

define_id!(
    /// Unique identifier for an assignment rule.
    RuleId,
    "rule"
);

define_id!(
    /// Unique identifier for a user.
    UserId,
    "usr"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_id_display_format() {
        let id = ProcessId::new();
        let display = id.to_string();
        assert!(display.starts_with("proc_"));
    }

    #[test]
    fn task_id_display_format() {
        let id = TaskId::new();
        assert!(id.to_string().starts_with("task_"));
    }

    #[test]
    fn parse_with_prefix() {
        let id = ProcessId::new();
        let display = id.to_string();
        let parsed: ProcessId = display.parse().expect("should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_without_prefix() {
        let ulid = Ulid::new();
        let id: NodeInstanceId = ulid.to_string().parse().expect("should parse");
        assert_eq!(id.as_ulid(), ulid);
    }

    #[test]
    fn parse_invalid_ulid() {
        let result: Result<TaskId, _> = "not_a_ulid".parse();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.id_type, "TaskId");
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let first = NodeInstanceId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = NodeInstanceId::new();
        assert!(first < second);
    }

    #[test]
    fn id_serde_roundtrip() {
        let id = ProcessId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        let parsed: ProcessId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, parsed);
    }
}
