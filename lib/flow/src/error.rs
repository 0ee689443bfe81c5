//! Error types for the flow crate.
//!
//! Errors are hand-rolled enums with layered context:
//! - `GraphError`: static template-graph validation failures
//! - `StoreError`: persistence-seam failures
//! - `ExprError`: expression evaluation failures
//!
//! Every enum maps onto the shared [`ErrorCode`] taxonomy via [`Coded`].

use escapement_core::{Coded, ErrorCode};
use std::fmt;

/// Errors from template-graph construction and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A node references a key that does not exist in the template.
    UnknownNodeKey { from: String, to: String },
    /// A node key appears more than once in the template.
    DuplicateNodeKey { key: String },
    /// The template has no start node.
    NoStartNode,
    /// The template has more than one start node.
    MultipleStartNodes { count: usize },
    /// The graph contains a directed cycle.
    CycleDetected,
    /// A node's configuration is structurally invalid.
    InvalidNodeConfig { key: String, reason: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNodeKey { from, to } => {
                write!(f, "node '{from}' references unknown node key '{to}'")
            }
            Self::DuplicateNodeKey { key } => {
                write!(f, "duplicate node key '{key}'")
            }
            Self::NoStartNode => write!(f, "template has no start node"),
            Self::MultipleStartNodes { count } => {
                write!(f, "template has {count} start nodes, expected exactly one")
            }
            Self::CycleDetected => write!(f, "template graph contains a cycle"),
            Self::InvalidNodeConfig { key, reason } => {
                write!(f, "invalid configuration for node '{key}': {reason}")
            }
        }
    }
}

impl std::error::Error for GraphError {}

impl Coded for GraphError {
    fn code(&self) -> ErrorCode {
        ErrorCode::Validation
    }
}

/// Errors from the persistence seam.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The referenced entity does not exist.
    NotFound { entity: &'static str, id: String },
    /// A concurrent update won.
    Conflict { entity: &'static str, id: String },
    /// The backing store failed.
    Backend { message: String },
}

impl StoreError {
    /// Shorthand for a not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Conflict { entity, id } => {
                write!(f, "conflicting update for {entity} {id}")
            }
            Self::Backend { message } => write!(f, "store backend error: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl Coded for StoreError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Conflict { .. } => ErrorCode::Conflict,
            Self::Backend { .. } => ErrorCode::System,
        }
    }
}

/// Errors from expression evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    /// The expression failed to parse.
    Syntax { expression: String, reason: String },
    /// The expression referenced a variable that is absent or unusable.
    UndefinedVariable { name: String },
    /// Evaluation produced a value that cannot coerce to the needed type.
    Coercion { value: String, wanted: &'static str },
    /// Evaluation failed.
    Evaluation { expression: String, reason: String },
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax { expression, reason } => {
                write!(f, "syntax error in '{expression}': {reason}")
            }
            Self::UndefinedVariable { name } => {
                write!(f, "undefined variable '{name}'")
            }
            Self::Coercion { value, wanted } => {
                write!(f, "cannot coerce {value} to {wanted}")
            }
            Self::Evaluation { expression, reason } => {
                write!(f, "failed to evaluate '{expression}': {reason}")
            }
        }
    }
}

impl std::error::Error for ExprError {}

impl Coded for ExprError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::Syntax { .. } => ErrorCode::Validation,
            _ => ErrorCode::ValidationFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_display() {
        let err = GraphError::UnknownNodeKey {
            from: "approve".to_string(),
            to: "missing".to_string(),
        };
        assert!(err.to_string().contains("unknown node key 'missing'"));
    }

    #[test]
    fn store_error_codes() {
        assert_eq!(
            StoreError::not_found("process", "proc_x").code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            StoreError::Backend {
                message: "io".to_string()
            }
            .code(),
            ErrorCode::System
        );
    }

    #[test]
    fn expr_error_codes() {
        let syntax = ExprError::Syntax {
            expression: "x >".to_string(),
            reason: "eof".to_string(),
        };
        assert_eq!(syntax.code(), ErrorCode::Validation);

        let undef = ExprError::UndefinedVariable {
            name: "y".to_string(),
        };
        assert_eq!(undef.code(), ErrorCode::ValidationFailed);
    }
}
