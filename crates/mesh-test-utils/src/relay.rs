//! In-memory relay hub for multi-session tests.
//!
//! Models the managed relay: presence sync on subscribe, join/leave fan-out,
//! and broadcast delivery to every subscriber including the sender.
//!
//! Test controls:
//! - Disconnect/reconnect a client (events during the outage are lost)
//! - Drop every broadcast with a given event name
//! - Inject broadcasts from outside any session
//! - Inspect the broadcast log
//!
//! # Example
//!
//! ```rust,ignore
//! let hub = InMemoryRelayHub::new();
//! let channel = hub.channel("meeting-1");
//!
//! hub.drop_events("answer");
//! hub.inject("meeting-1", "offer", json!({"from": "x", "to": "alice", "negotiation_id": "n-1", "payload": ...}));
//! assert_eq!(hub.broadcast_count("offer"), 1);
//! ```

use async_trait::async_trait;
use mesh_core::errors::MeshError;
use mesh_core::relay::{PresenceIdentity, RelayChannel, RelayEvent};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One broadcast published through the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastRecord {
    pub meeting_id: String,
    /// Tracked user id of the publisher, if any (`None` for injected events).
    pub from_user: Option<String>,
    pub event: String,
    pub payload: serde_json::Value,
    /// Whether delivery was suppressed by `drop_events`.
    pub dropped: bool,
}

/// Shared in-memory relay.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRelayHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Debug, Default)]
struct HubInner {
    clients: HashMap<u64, ClientState>,
    next_client_id: u64,
    log: Vec<BroadcastRecord>,
    dropped_events: HashSet<String>,
}

#[derive(Debug)]
struct ClientState {
    meeting_id: String,
    sender: Option<mpsc::UnboundedSender<RelayEvent>>,
    identity: Option<PresenceIdentity>,
    connected: bool,
}

impl HubInner {
    fn identities(&self, meeting_id: &str) -> Vec<PresenceIdentity> {
        let mut identities: Vec<PresenceIdentity> = self
            .clients
            .values()
            .filter(|c| c.meeting_id == meeting_id)
            .filter_map(|c| c.identity.clone())
            .collect();
        identities.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        identities
    }

    /// Deliver to every connected subscriber of a meeting.
    fn fan_out(&self, meeting_id: &str, event: &RelayEvent) {
        for client in self.clients.values() {
            if client.meeting_id != meeting_id || !client.connected {
                continue;
            }
            if let Some(sender) = &client.sender {
                let _ = sender.send(event.clone());
            }
        }
    }

    fn client_for_user(&self, meeting_id: &str, user_id: &str) -> Option<u64> {
        self.clients.iter().find_map(|(id, c)| {
            let matches = c.meeting_id == meeting_id
                && c.identity.as_ref().is_some_and(|i| i.user_id == user_id);
            matches.then_some(*id)
        })
    }

    fn publish(
        &mut self,
        meeting_id: &str,
        from_user: Option<String>,
        event: &str,
        payload: serde_json::Value,
    ) {
        let dropped = self.dropped_events.contains(event);
        self.log.push(BroadcastRecord {
            meeting_id: meeting_id.to_string(),
            from_user,
            event: event.to_string(),
            payload: payload.clone(),
            dropped,
        });
        if !dropped {
            self.fan_out(
                meeting_id,
                &RelayEvent::Broadcast {
                    event: event.to_string(),
                    payload,
                },
            );
        }
    }
}

impl InMemoryRelayHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client channel bound to a meeting.
    #[must_use]
    pub fn channel(&self, meeting_id: impl Into<String>) -> InMemoryRelayChannel {
        let meeting_id = meeting_id.into();
        let mut inner = self.inner.lock().unwrap();
        inner.next_client_id += 1;
        let client_id = inner.next_client_id;
        inner.clients.insert(
            client_id,
            ClientState {
                meeting_id: meeting_id.clone(),
                sender: None,
                identity: None,
                connected: true,
            },
        );

        InMemoryRelayChannel {
            hub: self.clone(),
            client_id,
            meeting_id,
        }
    }

    /// User ids currently tracked in a meeting, sorted.
    #[must_use]
    pub fn present_users(&self, meeting_id: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .identities(meeting_id)
            .into_iter()
            .map(|i| i.user_id)
            .collect()
    }

    /// Number of clients with a live subscription in a meeting.
    #[must_use]
    pub fn subscriber_count(&self, meeting_id: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .clients
            .values()
            .filter(|c| c.meeting_id == meeting_id && c.sender.is_some())
            .count()
    }

    /// Suppress delivery of every broadcast with this event name.
    pub fn drop_events(&self, event: &str) {
        self.inner
            .lock()
            .unwrap()
            .dropped_events
            .insert(event.to_string());
    }

    /// Resume delivery of an event name.
    pub fn allow_events(&self, event: &str) {
        self.inner.lock().unwrap().dropped_events.remove(event);
    }

    /// Publish a broadcast that no session sent.
    pub fn inject(&self, meeting_id: &str, event: &str, payload: serde_json::Value) {
        self.inner
            .lock()
            .unwrap()
            .publish(meeting_id, None, event, payload);
    }

    /// Every broadcast published so far.
    #[must_use]
    pub fn broadcasts(&self) -> Vec<BroadcastRecord> {
        self.inner.lock().unwrap().log.clone()
    }

    /// Number of broadcasts published with this event name.
    #[must_use]
    pub fn broadcast_count(&self, event: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|r| r.event == event)
            .count()
    }

    /// Broadcasts of a handshake kind from one user to another.
    #[must_use]
    pub fn handshakes(&self, event: &str, from: &str, to: &str) -> Vec<BroadcastRecord> {
        self.inner
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|r| r.event == event && r.payload["from"] == from && r.payload["to"] == to)
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.inner.lock().unwrap().log.clear();
    }

    /// Drop the relay connection of the client tracking `user_id`.
    ///
    /// The client receives `Disconnected` and nothing else until reconnected.
    /// Its presence record stays in place, so other clients see no leave.
    pub fn disconnect_user(&self, meeting_id: &str, user_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let client_id = inner
            .client_for_user(meeting_id, user_id)
            .unwrap_or_else(|| panic!("no client tracking {user_id} in {meeting_id}"));
        let client = inner.clients.get_mut(&client_id).unwrap();
        client.connected = false;
        if let Some(sender) = &client.sender {
            let _ = sender.send(RelayEvent::Disconnected);
        }
    }

    /// Restore a dropped connection: `Reconnected` followed by a fresh sync.
    pub fn reconnect_user(&self, meeting_id: &str, user_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let client_id = inner
            .client_for_user(meeting_id, user_id)
            .unwrap_or_else(|| panic!("no client tracking {user_id} in {meeting_id}"));
        let snapshot = inner.identities(meeting_id);
        let client = inner.clients.get_mut(&client_id).unwrap();
        client.connected = true;
        if let Some(sender) = &client.sender {
            let _ = sender.send(RelayEvent::Reconnected);
            let _ = sender.send(RelayEvent::PresenceSync(snapshot));
        }
    }
}

/// One client's channel on the in-memory hub.
#[derive(Debug, Clone)]
pub struct InMemoryRelayChannel {
    hub: InMemoryRelayHub,
    client_id: u64,
    meeting_id: String,
}

impl InMemoryRelayChannel {
    /// Whether this client currently has a presence record.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        let inner = self.hub.inner.lock().unwrap();
        inner
            .clients
            .get(&self.client_id)
            .is_some_and(|c| c.identity.is_some())
    }

    /// Whether this client currently has a live subscription.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        let inner = self.hub.inner.lock().unwrap();
        inner
            .clients
            .get(&self.client_id)
            .is_some_and(|c| c.sender.is_some())
    }

    fn remove_presence(inner: &mut HubInner, client_id: u64) {
        let Some(client) = inner.clients.get_mut(&client_id) else {
            return;
        };
        if let Some(identity) = client.identity.take() {
            let meeting_id = client.meeting_id.clone();
            inner.fan_out(&meeting_id, &RelayEvent::PresenceLeave(vec![identity]));
        }
    }
}

#[async_trait]
impl RelayChannel for InMemoryRelayChannel {
    fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RelayEvent>, MeshError> {
        let mut inner = self.hub.inner.lock().unwrap();
        let snapshot = inner.identities(&self.meeting_id);
        let client = inner
            .clients
            .get_mut(&self.client_id)
            .ok_or_else(|| MeshError::Relay("unknown client".to_string()))?;
        if !client.connected {
            return Err(MeshError::Relay("not connected".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(RelayEvent::PresenceSync(snapshot));
        client.sender = Some(tx);
        Ok(rx)
    }

    async fn track(&self, identity: PresenceIdentity) -> Result<(), MeshError> {
        let mut inner = self.hub.inner.lock().unwrap();
        let client = inner
            .clients
            .get_mut(&self.client_id)
            .ok_or_else(|| MeshError::Relay("unknown client".to_string()))?;
        if !client.connected {
            return Err(MeshError::Relay("not connected".to_string()));
        }
        client.identity = Some(identity.clone());
        inner.fan_out(&self.meeting_id, &RelayEvent::PresenceJoin(vec![identity]));
        Ok(())
    }

    async fn untrack(&self) -> Result<(), MeshError> {
        let mut inner = self.hub.inner.lock().unwrap();
        Self::remove_presence(&mut inner, self.client_id);
        Ok(())
    }

    async fn broadcast(&self, event: &str, payload: serde_json::Value) -> Result<(), MeshError> {
        let mut inner = self.hub.inner.lock().unwrap();
        let (connected, from_user) = match inner.clients.get(&self.client_id) {
            Some(client) => (
                client.connected,
                client.identity.as_ref().map(|i| i.user_id.clone()),
            ),
            None => return Err(MeshError::Relay("unknown client".to_string())),
        };
        if !connected {
            return Err(MeshError::Relay("not connected".to_string()));
        }
        inner.publish(&self.meeting_id, from_user, event, payload);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), MeshError> {
        let mut inner = self.hub.inner.lock().unwrap();
        Self::remove_presence(&mut inner, self.client_id);
        if let Some(client) = inner.clients.get_mut(&self.client_id) {
            client.sender = None;
        }
        Ok(())
    }
}
