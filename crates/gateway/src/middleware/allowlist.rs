//! Client application allow-list

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use carehub_common::errors::AppError;
use tracing::warn;

use crate::AppState;

/// Reject requests whose application id is not allowed.
///
/// An empty allow-list disables the check.
pub async fn check_application(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let tenancy = &state.config.tenancy;
    if tenancy.allowed_apps.is_empty() {
        return Ok(next.run(request).await);
    }

    let app_id = request
        .headers()
        .get(tenancy.app_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string());

    match app_id {
        Some(app_id) if tenancy.allowed_apps.contains(&app_id) => Ok(next.run(request).await),
        other => {
            warn!(app_id = ?other, "Request from unrecognized client application");
            Err(AppError::UnrecognizedClient)
        }
    }
}
