//! Route-level permission checks

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use carehub_common::{errors::AppError, rbac::action_for_method, RequestContext};

/// Resource guarded by a router; the action comes from the HTTP method
#[derive(Debug, Clone, Copy)]
pub struct ResourcePolicy {
    pub resource: &'static str,
}

impl ResourcePolicy {
    pub const fn new(resource: &'static str) -> Self {
        Self { resource }
    }
}

pub async fn require_permission(
    State(policy): State<ResourcePolicy>,
    ctx: RequestContext,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let action = action_for_method(request.method());
    ctx.require(policy.resource, action).await?;
    Ok(next.run(request).await)
}
