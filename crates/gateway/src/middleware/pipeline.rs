//! Tenant request pipeline
//!
//! Verifies the bearer credential, resolves the tenant, establishes the
//! caller's identity and loads their permissions, then binds a schema
//! session. The session is released after the handler responds; if the
//! request future is dropped first, the session resets itself on drop.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use carehub_common::{
    errors::AppError,
    rbac::{require_group, SYSTEM_ADMIN_GROUP},
    RequestContext, TenantDb,
};
use tracing::{info_span, warn, Instrument};

use crate::AppState;

pub async fn tenant_pipeline(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    // Stateless, so a bad credential is 401 whatever the tenant
    let token = state.auth.verify_bearer(request.headers()).await?;

    let tenant = state.tenants.resolve(request.headers()).await?;
    let identity = state.auth.establish(&token, &tenant).await?;
    let ctx = RequestContext::new(tenant, identity, state.authorizer.clone());

    // Registry lookups share the pool with tenant sessions; finish them
    // before a session connection is held.
    ctx.permissions().await;

    let session = state.sessions.acquire(ctx.tenant()).await?;

    let span = info_span!("tenant_request", tenant_id = %ctx.tenant_id(), user_id = %ctx.user_id());
    let db = TenantDb::new(session);
    request.extensions_mut().insert(db.clone());
    request.extensions_mut().insert(ctx);

    let response = next.run(request).instrument(span).await;
    db.release().await;
    Ok(response)
}

/// Require a verified credential carrying the system-admin group
pub async fn system_admin(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = state.auth.verify_bearer(request.headers()).await?;
    if let Err(e) = require_group(&token.groups, SYSTEM_ADMIN_GROUP) {
        warn!(subject = %token.subject, "Admin route refused");
        return Err(e);
    }

    request.extensions_mut().insert(token);
    Ok(next.run(request).await)
}
