// Caller Claims
// Identity and permissions attached to each incoming request

use std::collections::HashSet;

use farm_service::{SessionId, UserId};

use crate::error::{RpcError, RpcResult};

/// Claims a caller can hold. Agents authenticate with a session claim
/// instead and hold none of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    View,
    Update,
    Execute,
    Retry,
    ChangePermissions,
}

impl Permission {
    pub fn name(self) -> &'static str {
        match self {
            Permission::View => "view",
            Permission::Update => "update",
            Permission::Execute => "execute",
            Permission::Retry => "retry",
            Permission::ChangePermissions => "change-permissions",
        }
    }
}

/// Identity and claims resolved by the transport layer before a request
/// reaches a handler
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    user_id: Option<UserId>,
    session_id: Option<SessionId>,
    permissions: HashSet<Permission>,
}

impl CallerContext {
    /// Context for a user holding the given permissions
    pub fn user(user_id: UserId, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            user_id: Some(user_id),
            session_id: None,
            permissions: permissions.into_iter().collect(),
        }
    }

    /// Context for an agent session reporting execution progress
    pub fn agent(session_id: SessionId) -> Self {
        Self {
            user_id: None,
            session_id: Some(session_id),
            permissions: HashSet::new(),
        }
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Fail unless the caller holds the permission
    pub fn require(&self, permission: Permission) -> RpcResult<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(RpcError::Forbidden(format!(
                "caller lacks the {} permission",
                permission.name()
            )))
        }
    }

    /// Fail unless the caller's session claim matches the one bound to
    /// the batch being updated
    pub fn require_session(&self, bound: Option<&SessionId>) -> RpcResult<()> {
        match (self.session_id.as_ref(), bound) {
            (Some(mine), Some(bound)) if mine == bound => Ok(()),
            _ => Err(RpcError::Forbidden(
                "caller does not hold the session claim bound to this batch".to_string(),
            )),
        }
    }
}
