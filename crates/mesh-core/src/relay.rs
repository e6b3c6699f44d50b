//! Relay channel contract.
//!
//! The relay is a managed publish/subscribe service keyed by meeting id. It
//! carries two sub-protocols over one subscription:
//!
//! - **Presence**: each client tracks an identity record; subscribers observe
//!   a full snapshot on (re)subscription followed by incremental join/leave.
//! - **Broadcast**: typed events with an arbitrary JSON payload, delivered to
//!   every subscriber regardless of addressing.
//!
//! Only small control messages travel over the relay, never media.

use crate::errors::MeshError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Identity record a client publishes on the presence sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceIdentity {
    /// User identifier, unique within a meeting.
    pub user_id: String,
    /// Display name resolved from the user's profile.
    pub display_name: String,
    /// Epoch milliseconds at which the client joined.
    pub joined_at: i64,
}

impl PresenceIdentity {
    /// Create an identity stamped with the current time.
    #[must_use]
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            joined_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Events delivered on a relay subscription.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Full presence snapshot, delivered on every (re)subscription.
    PresenceSync(Vec<PresenceIdentity>),
    /// Identities that became present after subscription.
    PresenceJoin(Vec<PresenceIdentity>),
    /// Identities that stopped being present.
    PresenceLeave(Vec<PresenceIdentity>),
    /// A broadcast event published by any subscriber (including self).
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
    /// The relay connection dropped. No presence or broadcast events are
    /// delivered until `Reconnected`.
    Disconnected,
    /// The relay connection was restored. A fresh `PresenceSync` follows.
    Reconnected,
}

/// One client's channel on the relay, already bound to a meeting.
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Meeting this channel is bound to.
    fn meeting_id(&self) -> &str;

    /// Subscribe to presence and broadcast events.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RelayEvent>, MeshError>;

    /// Publish (or republish after reconnect) this client's presence record.
    async fn track(&self, identity: PresenceIdentity) -> Result<(), MeshError>;

    /// Remove this client's presence record.
    async fn untrack(&self) -> Result<(), MeshError>;

    /// Publish a broadcast event to every subscriber of the meeting.
    async fn broadcast(&self, event: &str, payload: serde_json::Value) -> Result<(), MeshError>;

    /// Drop the subscription. Further events are not delivered.
    async fn unsubscribe(&self) -> Result<(), MeshError>;
}
