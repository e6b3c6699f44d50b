//! Signaling router: address-aware handshake bus over the relay broadcast.
//!
//! Every handshake message is broadcast to the whole meeting; filtering to the
//! intended recipient happens here. Messages addressed to someone else are
//! expected under broadcast delivery and are dropped silently. There are no
//! retries or acknowledgements.
//!
//! Every message carries the negotiation id minted by the initiator for one
//! offer. The responder echoes it in its answer and candidates, so a reply can
//! be matched to the exact link it belongs to rather than just its sender.

use crate::errors::MeshError;
use crate::media::{IceCandidate, SdpKind, SessionDescription};
use crate::observability::metrics;
use crate::relay::RelayChannel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace, warn};

/// Handshake message kind, carried as the relay broadcast event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeKind {
    Offer,
    Answer,
    IceCandidate,
}

impl HandshakeKind {
    /// Relay broadcast event name for this kind.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            HandshakeKind::Offer => "offer",
            HandshakeKind::Answer => "answer",
            HandshakeKind::IceCandidate => "ice-candidate",
        }
    }

    /// Parse a relay broadcast event name.
    #[must_use]
    pub fn from_event_name(event: &str) -> Option<Self> {
        match event {
            "offer" => Some(HandshakeKind::Offer),
            "answer" => Some(HandshakeKind::Answer),
            "ice-candidate" => Some(HandshakeKind::IceCandidate),
            _ => None,
        }
    }
}

/// Handshake body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandshakePayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl HandshakePayload {
    /// Whether this payload is valid for the given kind.
    #[must_use]
    pub fn matches(&self, kind: HandshakeKind) -> bool {
        matches!(
            (kind, self),
            (
                HandshakeKind::Offer,
                HandshakePayload::Description(SessionDescription {
                    kind: SdpKind::Offer,
                    ..
                })
            ) | (
                HandshakeKind::Answer,
                HandshakePayload::Description(SessionDescription {
                    kind: SdpKind::Answer,
                    ..
                })
            ) | (HandshakeKind::IceCandidate, HandshakePayload::Candidate(_))
        )
    }
}

/// A point-to-point handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub kind: HandshakeKind,
    pub from: String,
    pub to: String,
    /// Offer this message belongs to.
    pub negotiation_id: String,
    pub payload: HandshakePayload,
}

/// Relay wire body (`kind` travels as the event name).
#[derive(Debug, Serialize, Deserialize)]
struct WireHandshake {
    from: String,
    to: String,
    negotiation_id: String,
    payload: HandshakePayload,
}

/// Result of dispatching one inbound broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered to this many handlers.
    Delivered(usize),
    /// Addressed to another participant.
    NotAddressed,
    /// Event name is not a handshake kind.
    Unrecognized,
    /// Body could not be parsed or does not match the kind.
    Malformed,
}

/// Handler invoked for inbound messages of one kind addressed to self.
pub type HandshakeHandler = Box<dyn Fn(HandshakeMessage) + Send + Sync>;

/// Address-aware handshake bus.
pub struct SignalingRouter {
    self_id: String,
    relay: Arc<dyn RelayChannel>,
    handlers: Mutex<HashMap<HandshakeKind, Vec<HandshakeHandler>>>,
}

impl std::fmt::Debug for SignalingRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingRouter")
            .field("self_id", &self.self_id)
            .field("meeting_id", &self.relay.meeting_id())
            .finish_non_exhaustive()
    }
}

impl SignalingRouter {
    #[must_use]
    pub fn new(self_id: impl Into<String>, relay: Arc<dyn RelayChannel>) -> Self {
        Self {
            self_id: self_id.into(),
            relay,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Publish `{from: self, to, negotiation_id, payload}` tagged with `kind`.
    pub async fn send(
        &self,
        kind: HandshakeKind,
        to: &str,
        negotiation_id: &str,
        payload: HandshakePayload,
    ) -> Result<(), MeshError> {
        if !payload.matches(kind) {
            return Err(MeshError::Internal(format!(
                "payload does not match handshake kind {}",
                kind.event_name()
            )));
        }

        let body = serde_json::to_value(WireHandshake {
            from: self.self_id.clone(),
            to: to.to_string(),
            negotiation_id: negotiation_id.to_string(),
            payload,
        })?;

        self.relay.broadcast(kind.event_name(), body).await?;
        metrics::record_handshake_message(kind.event_name(), "sent");

        trace!(
            target: "mesh.signaling",
            kind = kind.event_name(),
            to = %to,
            "Handshake sent"
        );
        Ok(())
    }

    /// Register a handler for inbound messages of `kind` addressed to self.
    pub fn on_message<F>(&self, kind: HandshakeKind, handler: F)
    where
        F: Fn(HandshakeMessage) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Route one inbound broadcast to the registered handlers.
    pub fn dispatch(&self, event: &str, payload: &serde_json::Value) -> DispatchOutcome {
        let Some(kind) = HandshakeKind::from_event_name(event) else {
            return DispatchOutcome::Unrecognized;
        };

        let wire: WireHandshake = match serde_json::from_value(payload.clone()) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(
                    target: "mesh.signaling",
                    kind = kind.event_name(),
                    error = %e,
                    "Malformed handshake message"
                );
                metrics::record_handshake_dropped("malformed");
                return DispatchOutcome::Malformed;
            }
        };

        if wire.to != self.self_id {
            metrics::record_handshake_dropped("not_addressed");
            return DispatchOutcome::NotAddressed;
        }

        if !wire.payload.matches(kind) {
            warn!(
                target: "mesh.signaling",
                kind = kind.event_name(),
                from = %wire.from,
                "Handshake payload does not match its kind"
            );
            metrics::record_handshake_dropped("malformed");
            return DispatchOutcome::Malformed;
        }

        let message = HandshakeMessage {
            kind,
            from: wire.from,
            to: wire.to,
            negotiation_id: wire.negotiation_id,
            payload: wire.payload,
        };

        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let registered = handlers.get(&kind).map_or(&[][..], Vec::as_slice);
        for handler in registered {
            handler(message.clone());
        }

        metrics::record_handshake_message(kind.event_name(), "received");
        debug!(
            target: "mesh.signaling",
            kind = kind.event_name(),
            from = %message.from,
            handlers = registered.len(),
            "Handshake dispatched"
        );
        DispatchOutcome::Delivered(registered.len())
    }
}
