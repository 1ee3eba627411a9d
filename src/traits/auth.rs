//! Caller identity as seen by the lifecycle engine.
//!
//! Authentication happens upstream. The engine only asks who the caller is,
//! whether they are an operator, and which tenant they act for.

use serde::{Deserialize, Serialize};

/// The authenticated caller of an operation.
pub trait AuthContext: Send + Sync {
    /// Stable identifier of the user.
    fn user_id(&self) -> &str;

    /// Whether the caller is a platform operator.
    fn is_operator(&self) -> bool;

    /// The tenant the caller acts for, if any.
    fn current_tenant_id(&self) -> Option<&str>;

    /// Whether the caller acts for `tenant_id`.
    fn acts_for(&self, tenant_id: &str) -> bool {
        self.current_tenant_id() == Some(tenant_id)
    }
}

/// Plain caller identity, usually inserted into request extensions by the
/// authentication layer in front of the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub operator: bool,
}

impl Caller {
    /// A platform operator.
    #[must_use]
    pub fn operator(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: None,
            operator: true,
        }
    }

    /// A user acting for a tenant.
    #[must_use]
    pub fn tenant(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: Some(tenant_id.into()),
            operator: false,
        }
    }

    /// A visitor with no account, e.g. someone opening a public booking form.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            user_id: String::new(),
            tenant_id: None,
            operator: false,
        }
    }
}

impl AuthContext for Caller {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn is_operator(&self) -> bool {
        self.operator
    }

    fn current_tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_constructors() {
        let admin = Caller::operator("admin_1");
        assert!(admin.is_operator());
        assert_eq!(admin.current_tenant_id(), None);

        let owner = Caller::tenant("user_7", "tenant_7");
        assert!(!owner.is_operator());
        assert!(owner.acts_for("tenant_7"));
        assert!(!owner.acts_for("tenant_8"));

        let visitor = Caller::anonymous();
        assert!(!visitor.is_operator());
        assert!(visitor.user_id().is_empty());
    }

    #[test]
    fn test_operator_flag_defaults_to_false() {
        let caller: Caller =
            serde_json::from_str(r#"{"user_id":"u1","tenant_id":"t1"}"#).unwrap();
        assert!(!caller.is_operator());
    }
}
