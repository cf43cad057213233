//! Per-request context
//!
//! Built by the gateway pipeline once tenant and identity are known, and
//! dropped with the request. Permissions are loaded at most once per request
//! and never shared across requests or tenants.

use crate::auth::Identity;
use crate::db::models::Tenant;
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::rbac::{Authorizer, PermissionSet};
use axum::{extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct RequestContext {
    tenant: Arc<Tenant>,
    identity: Arc<Identity>,
    authorizer: Authorizer,
    permissions: Arc<OnceCell<PermissionSet>>,
}

impl RequestContext {
    pub fn new(tenant: Tenant, identity: Identity, authorizer: Authorizer) -> Self {
        Self {
            tenant: Arc::new(tenant),
            identity: Arc::new(identity),
            authorizer,
            permissions: Arc::new(OnceCell::new()),
        }
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant.id
    }

    pub fn user_id(&self) -> Uuid {
        self.identity.user_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn groups(&self) -> &[String] {
        &self.identity.groups
    }

    /// Effective permissions, loaded on first use
    pub async fn permissions(&self) -> &PermissionSet {
        self.permissions
            .get_or_init(|| self.authorizer.load(self.tenant.id, self.identity.user_id))
            .await
    }

    pub async fn can_access(&self, resource: &str, action: &str) -> bool {
        let allowed = self.permissions().await.allows(resource, action);
        metrics::record_authorization(resource, action, allowed);
        allowed
    }

    /// `Unauthorized` unless the caller holds `resource:action`
    pub async fn require(&self, resource: &str, action: &str) -> Result<()> {
        if self.can_access(resource, action).await {
            return Ok(());
        }
        warn!(
            tenant_id = %self.tenant.id,
            user_id = %self.identity.user_id,
            resource,
            action,
            "Permission denied"
        );
        Err(AppError::unauthorized(format!("missing permission {resource}:{action}")))
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .ok_or_else(|| AppError::Internal {
                message: "route has no request context".to_string(),
            })
    }
}
