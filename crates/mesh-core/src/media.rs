//! Local media and media transport contracts.
//!
//! The local media source is shared read-only by every peer link: each link
//! attaches the same tracks. Muting is a per-track enabled flag and never
//! touches a transport.

use crate::errors::{MediaAccessError, MeshError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Returns the track kind as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// One local capture track (camera or microphone).
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    /// Create an enabled, running track.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Whether the track currently produces media (not muted, not stopped).
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.is_stopped()
    }

    /// Set the enabled flag. Has no effect on a stopped track.
    pub fn set_enabled(&self, enabled: bool) {
        if !self.is_stopped() {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    /// Release the capture device. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Local media stream: the tracks acquired from the capture devices.
#[derive(Debug)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMedia {
    #[must_use]
    pub fn new(stream_id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// Enable or disable every track of a kind. Returns the number of tracks touched.
    pub fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let mut touched = 0;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            touched += 1;
        }
        touched
    }

    /// Whether any track of a kind is enabled.
    #[must_use]
    pub fn is_kind_enabled(&self, kind: TrackKind) -> bool {
        self.tracks
            .iter()
            .any(|t| t.kind() == kind && t.is_enabled())
    }

    /// Stop every track.
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Whether every track has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }
}

/// Requested capture devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Camera/microphone access.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire local capture tracks.
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaAccessError>;
}

/// Session description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network candidate discovered by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }
}

/// Remote media delivered by a negotiated transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_ids: Vec<String>,
}

/// Connection state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local network candidate was discovered and must be sent to the peer.
    LocalCandidate(IceCandidate),
    /// Remote media arrived.
    RemoteTrack(RemoteStream),
    /// Connection state changed.
    StateChanged(TransportState),
}

/// Parameters for creating a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Network reachability hints (STUN/TURN URLs).
    pub ice_servers: Vec<String>,
}

/// One peer-to-peer media transport.
///
/// All methods are suspension points; the owning link actor sequences them.
#[async_trait]
pub trait MediaTransport: Send {
    /// Attach a local track so it is sent once the transport connects.
    async fn add_track(&mut self, track: Arc<LocalTrack>) -> Result<(), MeshError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, MeshError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, MeshError>;

    async fn set_local_description(&mut self, description: SessionDescription)
        -> Result<(), MeshError>;

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MeshError>;

    /// Apply a remote candidate. Only valid after the remote description is set.
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), MeshError>;

    /// Release all transport resources.
    async fn close(&mut self);
}

/// Creates one transport per remote participant.
pub trait TransportFactory: Send + Sync {
    /// Create a transport whose notifications are delivered on `events`.
    fn create(
        &self,
        remote_user_id: &str,
        config: &TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn MediaTransport>, MeshError>;
}
