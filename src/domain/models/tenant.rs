//! Tenant identity propagation.
//!
//! The tenant context is an immutable value created at request ingress and
//! carried explicitly through every call. It is never read from shared
//! mutable state across suspension points.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the tenant a task runs on behalf of.
///
/// Every memory write is keyed by this context; every error leaving the
/// core carries its `correlation_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    /// Owning company.
    pub company_id: String,
    /// Application within the company.
    pub app_id: String,
    /// Optional end user.
    pub user_id: Option<String>,
    /// Request correlation id, generated at ingress when absent.
    pub correlation_id: String,
}

impl TenantContext {
    pub fn new(company_id: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            company_id: company_id.into(),
            app_id: app_id.into(),
            user_id: None,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Set the end user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Carry a caller-supplied correlation id instead of the generated one.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Storage key prefix shared by every record written for this tenant.
    pub fn scope_key(&self) -> String {
        format!("{}:{}", self.company_id, self.app_id)
    }

    /// Validate the identity fields are present.
    pub fn validate(&self) -> Result<(), String> {
        if self.company_id.trim().is_empty() {
            return Err("company_id cannot be empty".to_string());
        }
        if self.app_id.trim().is_empty() {
            return Err("app_id cannot be empty".to_string());
        }
        Ok(())
    }
}

impl std::fmt::Display for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.company_id, self.app_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_key() {
        let tenant = TenantContext::new("acme", "ops");
        assert_eq!(tenant.scope_key(), "acme:ops");
    }

    #[test]
    fn test_correlation_id_generated() {
        let a = TenantContext::new("acme", "ops");
        let b = TenantContext::new("acme", "ops");
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn test_validate() {
        assert!(TenantContext::new("acme", "ops").validate().is_ok());
        assert!(TenantContext::new("", "ops").validate().is_err());
        assert!(TenantContext::new("acme", "  ").validate().is_err());
    }
}
