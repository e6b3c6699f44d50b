//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Request-reply uses `tokio::sync::oneshot`.

use crate::errors::{MediaAccessError, MeshError};
use crate::media::{IceCandidate, RemoteStream, SessionDescription, TrackKind, TransportState};
use crate::negotiation::NegotiationState;
use crate::presence::DiscoverySource;
use tokio::sync::oneshot;

/// Messages sent to `SessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// Enable or disable every local track of a kind.
    SetLocalTrack {
        kind: TrackKind,
        enabled: bool,
        respond_to: oneshot::Sender<()>,
    },

    /// Broadcast an ephemeral reaction to the meeting.
    SendReaction {
        emoji: String,
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },

    /// Snapshot of the session (for UI and debugging).
    GetState {
        respond_to: oneshot::Sender<SessionState>,
    },
}

/// Messages sent to `PeerLinkActor`.
#[derive(Debug)]
pub enum LinkMessage {
    /// Answer from the remote participant (initiator links only).
    RemoteAnswer { answer: SessionDescription },

    /// Network candidate from the remote participant.
    RemoteCandidate { candidate: IceCandidate },
}

/// Notification from a link to its session, tagged with the link generation.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub remote_user_id: String,
    pub generation: u64,
    pub kind: LinkEventKind,
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    /// Negotiation state changed.
    StateChanged(NegotiationState),
    /// Remote media arrived.
    StreamAttached(RemoteStream),
    /// Transport connection state changed.
    ConnectionStateChanged(TransportState),
    /// Negotiation or transport failed. The link has stopped.
    Failed { reason: String },
}

/// Which side of the offer/answer exchange a link plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Responder,
}

impl LinkRole {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LinkRole::Initiator => "initiator",
            LinkRole::Responder => "responder",
        }
    }
}

// ----------------------------------------------------------------------------
// UI-facing types
// ----------------------------------------------------------------------------

/// Connection state of a participant as shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Present in the meeting, no link yet.
    Discovered,
    /// A link exists and is negotiating or connecting.
    Connecting,
    /// Media is flowing.
    Connected,
    /// The transport lost connectivity and may recover.
    Disconnected,
    /// The link failed and will not be retried.
    Failed,
}

/// One remote participant in the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub user_id: String,
    pub display_name: String,
    /// Whether the participant was already present (sync) or arrived later (join).
    pub discovered_via: DiscoverySource,
    pub stream: Option<RemoteStream>,
    pub connection_state: ConnectionState,
}

/// Events delivered to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A remote participant became present.
    ParticipantJoined(ParticipantInfo),
    /// A remote participant left the meeting.
    ParticipantLeft { user_id: String },
    /// Remote media from a participant is available.
    StreamAttached {
        user_id: String,
        stream: RemoteStream,
    },
    /// A participant's connection state changed.
    ConnectionStateChanged {
        user_id: String,
        state: ConnectionState,
    },
    /// Connecting to a participant failed; the participant is still present.
    ParticipantFailed { user_id: String, reason: String },
    /// Ephemeral reaction from another participant.
    ReactionReceived { from: String, emoji: String },
    /// Relay connectivity changed. Existing links are unaffected.
    RelayConnectivityChanged { connected: bool },
}

/// Link summary in a session snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSummary {
    pub remote_user_id: String,
    pub role: LinkRole,
    pub generation: u64,
    pub state: NegotiationState,
}

/// Session snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub meeting_id: String,
    pub self_id: String,
    /// Roster ordered by user id.
    pub participants: Vec<ParticipantInfo>,
    /// Live links ordered by remote user id.
    pub links: Vec<LinkSummary>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub relay_connected: bool,
}

impl SessionState {
    /// Look up a participant by user id.
    #[must_use]
    pub fn participant(&self, user_id: &str) -> Option<&ParticipantInfo> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    /// Look up a link by remote user id.
    #[must_use]
    pub fn link(&self, remote_user_id: &str) -> Option<&LinkSummary> {
        self.links.iter().find(|l| l.remote_user_id == remote_user_id)
    }
}

/// Lifecycle of a session, observable through its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Acquiring media and joining presence.
    Starting,
    /// Joined and processing events.
    Active,
    /// Local media could not be acquired. Nothing was sent to the relay.
    MediaUnavailable(MediaAccessError),
    /// The relay rejected subscription or presence tracking.
    RelayUnavailable(String),
    /// Left (or cancelled) and fully torn down.
    Closed,
}

impl SessionStatus {
    /// Whether the session has stopped and released its resources.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !matches!(self, SessionStatus::Starting | SessionStatus::Active)
    }
}
