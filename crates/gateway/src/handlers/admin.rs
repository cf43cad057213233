//! System administration handlers
//!
//! Reached only through the `system_admin` layer.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use carehub_common::{
    auth::VerifiedToken,
    db::models::TenantStatus,
    errors::{AppError, Result},
    events::DomainEvent,
};

/// Tenant summary; the schema name is never exposed
#[derive(Serialize)]
pub struct TenantSummary {
    pub id: Uuid,
    pub name: String,
    pub subdomain: String,
    pub status: TenantStatus,
    pub realtime_connections: usize,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct NoticeRequest {
    #[validate(length(min = 1, max = 2000))]
    pub message: String,

    #[serde(default)]
    pub severity: Option<String>,
}

#[derive(Serialize)]
pub struct NoticeResponse {
    pub delivered: usize,
}

/// Look up any tenant by id, whatever its status
pub async fn get_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<TenantSummary>> {
    let tenant = state.tenants.resolve_explicit(tenant_id).await?;

    Ok(Json(TenantSummary {
        id: tenant.id,
        status: tenant.tenant_status(),
        realtime_connections: state.events.tenant_connections(tenant.id),
        created_at: tenant.created_at.to_rfc3339(),
        updated_at: tenant.updated_at.to_rfc3339(),
        name: tenant.name,
        subdomain: tenant.subdomain,
    }))
}

/// Broadcast an operational notice to every connected tenant
pub async fn post_notice(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedToken>,
    Json(request): Json<NoticeRequest>,
) -> Result<(StatusCode, Json<NoticeResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let event = DomainEvent::new(
        "system.notice",
        None,
        serde_json::json!({
            "message": request.message,
            "severity": request.severity.unwrap_or_else(|| "info".to_string()),
        }),
    );
    let delivered = state.events.broadcast_to_all(&event);

    tracing::info!(subject = %caller.subject, delivered, "System notice broadcast");

    Ok((StatusCode::ACCEPTED, Json(NoticeResponse { delivered })))
}
