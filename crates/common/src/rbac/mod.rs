//! Role-based access control
//!
//! A user's effective permissions in a tenant are the union of the
//! permissions of every role assigned to them there. Any failure to load
//! that data denies.

use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Group claim that grants access to cross-tenant operations
pub const SYSTEM_ADMIN_GROUP: &str = "system-admin";

/// A `(resource, action)` pair such as `beds:write`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
        }
    }

    /// Parse `resource:action`
    pub fn parse(value: &str) -> Option<Self> {
        let (resource, action) = value.split_once(':')?;
        let permission = Self::new(resource.trim(), action.trim());
        permission.is_well_formed().then_some(permission)
    }

    pub fn is_well_formed(&self) -> bool {
        !self.resource.is_empty() && !self.action.is_empty()
    }

    fn matches(&self, resource: &str, action: &str) -> bool {
        self.is_well_formed() && self.resource == resource && self.action == action
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)
    }
}

/// A role held in a tenant together with the permissions it grants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleGrant {
    pub role: String,
    pub permissions: Vec<Permission>,
}

/// True if any granted role carries `resource:action`
pub fn can_access(grants: &[RoleGrant], resource: &str, action: &str) -> bool {
    if resource.is_empty() || action.is_empty() {
        return false;
    }
    grants
        .iter()
        .flat_map(|grant| grant.permissions.iter())
        .any(|permission| permission.matches(resource, action))
}

/// Effective permissions of one user in one tenant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    roles: BTreeSet<String>,
    permissions: BTreeSet<Permission>,
}

impl PermissionSet {
    pub fn from_grants(grants: &[RoleGrant]) -> Self {
        Self {
            roles: grants.iter().map(|g| g.role.clone()).collect(),
            permissions: grants
                .iter()
                .flat_map(|g| g.permissions.iter())
                .filter(|p| p.is_well_formed())
                .cloned()
                .collect(),
        }
    }

    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.permissions.iter().any(|p| p.matches(resource, action))
    }

    pub fn permissions(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter()
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

/// Require membership of an external group
pub fn require_group(groups: &[String], group: &str) -> Result<()> {
    if groups.iter().any(|g| g == group) {
        Ok(())
    } else {
        Err(AppError::unauthorized(format!("requires group {group}")))
    }
}

/// `GET`/`HEAD` read, everything else writes
pub fn action_for_method(method: &Method) -> &'static str {
    if method == Method::GET || method == Method::HEAD {
        "read"
    } else {
        "write"
    }
}

/// Role assignment lookup
#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn role_grants(&self, tenant_id: Uuid, user_id: Uuid) -> Result<Vec<RoleGrant>>;
}

/// Loads effective permissions, failing closed
#[derive(Clone)]
pub struct Authorizer {
    roles: Arc<dyn RoleStore>,
}

impl Authorizer {
    pub fn new(roles: Arc<dyn RoleStore>) -> Self {
        Self { roles }
    }

    /// Effective permissions; empty if the lookup fails
    pub async fn load(&self, tenant_id: Uuid, user_id: Uuid) -> PermissionSet {
        match self.roles.role_grants(tenant_id, user_id).await {
            Ok(grants) => {
                let set = PermissionSet::from_grants(&grants);
                debug!(
                    tenant_id = %tenant_id,
                    user_id = %user_id,
                    roles = grants.len(),
                    "Loaded permissions"
                );
                set
            }
            Err(e) => {
                error!(
                    tenant_id = %tenant_id,
                    user_id = %user_id,
                    error = %e,
                    "Role lookup failed; denying"
                );
                PermissionSet::default()
            }
        }
    }

    /// Single check without memoization
    pub async fn can_access(&self, tenant_id: Uuid, user_id: Uuid, resource: &str, action: &str) -> bool {
        let allowed = self.load(tenant_id, user_id).await.allows(resource, action);
        metrics::record_authorization(resource, action, allowed);
        allowed
    }
}
