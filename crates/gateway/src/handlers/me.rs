//! Caller profile

use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use carehub_common::{errors::Result, RequestContext};

#[derive(Serialize)]
pub struct MeResponse {
    pub user_id: Uuid,
    pub email: String,
    pub tenant_id: Uuid,
    pub tenant: String,
    pub groups: Vec<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

/// Identity and effective permissions of the caller in this tenant
pub async fn me(ctx: RequestContext) -> Result<Json<MeResponse>> {
    let permissions = ctx.permissions().await;

    Ok(Json(MeResponse {
        user_id: ctx.user_id(),
        email: ctx.identity().email.clone(),
        tenant_id: ctx.tenant_id(),
        tenant: ctx.tenant().subdomain.clone(),
        groups: ctx.groups().to_vec(),
        roles: permissions.roles().map(str::to_string).collect(),
        permissions: permissions.permissions().map(ToString::to_string).collect(),
    }))
}
