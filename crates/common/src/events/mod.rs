//! Tenant-partitioned realtime fan-out
//!
//! Connections are registered under exactly one tenant. A tenant broadcast
//! only ever walks that tenant's partition. Delivery is best-effort and
//! at-most-once: a connection whose outbound buffer is full misses the event.

use crate::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Event pushed to realtime clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,

    pub payload: serde_json::Value,

    pub emitted_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, tenant_id: Option<Uuid>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            tenant_id,
            payload,
            emitted_at: Utc::now(),
        }
    }
}

struct RealtimeConnection {
    user_id: Uuid,
    state: ConnectionState,
    sender: mpsc::Sender<String>,
}

/// Receiving half handed to the socket task
#[derive(Debug)]
pub struct Subscription {
    pub id: ConnectionId,
    pub tenant_id: Uuid,
    pub receiver: mpsc::Receiver<String>,
}

/// Registry of realtime connections, partitioned by tenant
pub struct TenantEventBus {
    partitions: RwLock<HashMap<Uuid, HashMap<ConnectionId, RealtimeConnection>>>,
    channel_capacity: usize,
}

impl TenantEventBus {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Register a connection in `Connecting` state
    pub fn register(&self, tenant_id: Uuid, user_id: Uuid) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let id = Uuid::new_v4();

        let total = {
            let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
            partitions.entry(tenant_id).or_default().insert(
                id,
                RealtimeConnection {
                    user_id,
                    state: ConnectionState::Connecting,
                    sender,
                },
            );
            count(&partitions)
        };
        metrics::set_realtime_connections(total);
        debug!(tenant_id = %tenant_id, user_id = %user_id, connection_id = %id, "Realtime connection registered");

        Subscription {
            id,
            tenant_id,
            receiver,
        }
    }

    /// Mark a connection ready to receive events
    pub fn mark_open(&self, tenant_id: Uuid, id: ConnectionId) -> bool {
        let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        match partitions.get_mut(&tenant_id).and_then(|p| p.get_mut(&id)) {
            Some(conn) => {
                conn.state = ConnectionState::Open;
                true
            }
            None => false,
        }
    }

    /// Close and remove a connection; empty partitions are dropped
    pub fn unregister(&self, tenant_id: Uuid, id: ConnectionId) {
        let total = {
            let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(partition) = partitions.get_mut(&tenant_id) {
                if let Some(mut conn) = partition.remove(&id) {
                    conn.state = ConnectionState::Closed;
                    debug!(tenant_id = %tenant_id, user_id = %conn.user_id, connection_id = %id, "Realtime connection closed");
                }
                if partition.is_empty() {
                    partitions.remove(&tenant_id);
                }
            }
            count(&partitions)
        };
        metrics::set_realtime_connections(total);
    }

    /// Deliver to every open connection of one tenant; returns the count
    pub fn broadcast_to_tenant(&self, tenant_id: Uuid, event: &DomainEvent) -> usize {
        let Some(message) = encode(event) else {
            return 0;
        };

        let partitions = self.partitions.read().unwrap_or_else(PoisonError::into_inner);
        let delivered = partitions
            .get(&tenant_id)
            .map(|partition| deliver(partition, &message))
            .unwrap_or(0);

        metrics::record_events_delivered("tenant", delivered);
        debug!(tenant_id = %tenant_id, event = %event.event_type, delivered, "Tenant broadcast");
        delivered
    }

    /// Deliver to every open connection of every tenant
    pub fn broadcast_to_all(&self, event: &DomainEvent) -> usize {
        let Some(message) = encode(event) else {
            return 0;
        };

        let partitions = self.partitions.read().unwrap_or_else(PoisonError::into_inner);
        let delivered = partitions
            .values()
            .map(|partition| deliver(partition, &message))
            .sum();

        metrics::record_events_delivered("all", delivered);
        debug!(event = %event.event_type, delivered, "System broadcast");
        delivered
    }

    pub fn connection_count(&self) -> usize {
        count(&self.partitions.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn tenant_count(&self) -> usize {
        self.partitions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn tenant_connections(&self, tenant_id: Uuid) -> usize {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
            .map_or(0, HashMap::len)
    }

    pub fn state(&self, tenant_id: Uuid, id: ConnectionId) -> Option<ConnectionState> {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
            .and_then(|p| p.get(&id))
            .map(|conn| conn.state)
    }
}

fn count(partitions: &HashMap<Uuid, HashMap<ConnectionId, RealtimeConnection>>) -> usize {
    partitions.values().map(HashMap::len).sum()
}

fn encode(event: &DomainEvent) -> Option<String> {
    serde_json::to_string(event)
        .map_err(|e| error!(error = %e, event = %event.event_type, "Failed to serialize event"))
        .ok()
}

fn deliver(partition: &HashMap<ConnectionId, RealtimeConnection>, message: &str) -> usize {
    partition
        .iter()
        .filter(|(_, conn)| conn.state == ConnectionState::Open)
        .filter(|(id, conn)| match conn.sender.try_send(message.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id = %id, "Outbound buffer full; event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        })
        .count()
}
