//! The identity-resolution seam.
//!
//! Approval nodes name roles and departments; turning those into concrete
//! user lists belongs to the surrounding platform's directory. The engine
//! consumes this trait and ships a pass-through stub, which also means
//! escalation cannot climb an org tree until a real resolver is wired in.

use async_trait::async_trait;

/// Resolves organizational references to user ids.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Expands a role into its members.
    async fn expand_role(&self, role: &str) -> Vec<String>;

    /// Expands a department into its members.
    async fn expand_department(&self, department: &str) -> Vec<String>;

    /// Computes escalation approvers for the given users, skipping
    /// `skip_levels` organizational levels.
    async fn escalate(&self, users: &[String], skip_levels: u32) -> Vec<String>;
}

/// Pass-through resolver: roles and departments expand to nothing, and
/// escalation returns the original users.
#[derive(Debug, Default, Clone)]
pub struct StubIdentityResolver;

#[async_trait]
impl IdentityResolver for StubIdentityResolver {
    async fn expand_role(&self, _role: &str) -> Vec<String> {
        Vec::new()
    }

    async fn expand_department(&self, _department: &str) -> Vec<String> {
        Vec::new()
    }

    async fn escalate(&self, users: &[String], _skip_levels: u32) -> Vec<String> {
        users.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_preserves_users_on_escalation() {
        let resolver = StubIdentityResolver;
        let users = vec!["u1".to_string(), "u2".to_string()];
        assert_eq!(resolver.escalate(&users, 2).await, users);
        assert!(resolver.expand_role("managers").await.is_empty());
    }
}
