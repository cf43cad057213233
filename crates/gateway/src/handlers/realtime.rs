//! Realtime WebSocket endpoint
//!
//! `GET /ws?token=…&tenantId=…`. The token, tenant and identity are all
//! checked before the upgrade is accepted, so a refused handshake never
//! registers a connection.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;
use carehub_common::{
    errors::{AppError, Result},
    events::TenantEventBus,
};

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeParams {
    pub token: Option<String>,

    #[serde(rename = "tenantId")]
    pub tenant_id: Option<String>,
}

/// Who a socket belongs to once the handshake succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
}

/// Validate handshake parameters without touching the socket
pub async fn handshake(state: &AppState, params: &HandshakeParams) -> Result<Admission> {
    let token = params
        .token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AppError::unauthenticated("missing token"))?;

    let raw_tenant = params
        .tenant_id
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AppError::Validation {
            message: "tenantId is required".to_string(),
            field: Some("tenantId".to_string()),
        })?;

    let verified = state.auth.verify_token(token).await?;

    let tenant_id = Uuid::parse_str(raw_tenant.trim()).map_err(|_| AppError::TenantNotFound)?;
    let tenant = state.tenants.resolve_by_id(tenant_id).await?;
    let identity = state.auth.establish(&verified, &tenant).await?;

    Ok(Admission {
        tenant_id: tenant.id,
        user_id: identity.user_id,
    })
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HandshakeParams>,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let admission = match handshake(&state, &params).await {
        Ok(admission) => admission,
        Err(e) => {
            warn!(error = %e, "Realtime handshake refused");
            return Err(e);
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let events = state.events.clone();
    Ok(upgrade
        .on_upgrade(move |socket| serve_socket(socket, events, admission))
        .into_response())
}

/// Forward tenant events to the socket until either side closes
async fn serve_socket(socket: WebSocket, events: Arc<TenantEventBus>, admission: Admission) {
    let Admission { tenant_id, user_id } = admission;
    let subscription = events.register(tenant_id, user_id);
    let connection_id = subscription.id;
    let mut outbound = subscription.receiver;

    let (mut sender, mut receiver) = socket.split();
    events.mark_open(tenant_id, connection_id);
    info!(tenant_id = %tenant_id, user_id = %user_id, connection_id = %connection_id, "Realtime connection open");

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(text) => {
                    if let Err(e) = sender.send(Message::Text(text.into())).await {
                        debug!(error = %e, "Failed to send to realtime client");
                        break;
                    }
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                // Clients only listen; pings are answered by axum
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Realtime receive error");
                    break;
                }
            },
        }
    }

    events.unregister(tenant_id, connection_id);
    let clean = close_socket(&mut sender).await;
    info!(tenant_id = %tenant_id, connection_id = %connection_id, clean, "Realtime connection closed");
}

/// Send the close frame; false if the peer was already gone
async fn close_socket<S>(sender: &mut S) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match sender.close().await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "Failed to close realtime socket");
            false
        }
    }
}
