//! Bed handlers
//!
//! A minimal tenant-local resource. Rows live in the tenant schema's `beds`
//! table and are reached only through the request's bound session.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use crate::AppState;
use carehub_common::{
    errors::{AppError, Result},
    events::DomainEvent,
    RequestContext, TenantDb,
};

const BEDS_TABLE: &str = "beds";

/// Request to register a bed
#[derive(Debug, Deserialize, Validate)]
pub struct CreateBedRequest {
    #[validate(length(min = 1, max = 64))]
    pub label: String,

    #[validate(length(min = 1, max = 128))]
    pub ward: String,

    #[serde(default)]
    pub occupied: bool,
}

#[derive(Serialize)]
pub struct BedsResponse {
    pub beds: Vec<Value>,
    pub total: usize,
}

/// List beds of the caller's tenant
pub async fn list_beds(db: TenantDb) -> Result<Json<BedsResponse>> {
    let beds = db.lock().await?.fetch_rows(BEDS_TABLE).await?;

    Ok(Json(BedsResponse {
        total: beds.len(),
        beds,
    }))
}

/// Register a bed and notify the tenant's realtime clients
pub async fn create_bed(
    State(state): State<AppState>,
    ctx: RequestContext,
    db: TenantDb,
    Json(request): Json<CreateBedRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let mut row = Map::new();
    row.insert("label".to_string(), Value::from(request.label));
    row.insert("ward".to_string(), Value::from(request.ward));
    row.insert("occupied".to_string(), Value::from(request.occupied));

    let bed = db.lock().await?.insert_row(BEDS_TABLE, row).await?;

    let delivered = state.events.broadcast_to_tenant(
        ctx.tenant_id(),
        &DomainEvent::new("bed.created", Some(ctx.tenant_id()), bed.clone()),
    );

    tracing::info!(
        tenant_id = %ctx.tenant_id(),
        user_id = %ctx.user_id(),
        delivered,
        "Bed created"
    );

    Ok((StatusCode::CREATED, Json(bed)))
}
