//! Mesh error types.
//!
//! Errors are split by blast radius: media acquisition failures are fatal to
//! joining, negotiation and transport failures are local to one peer link,
//! and relay failures affect presence and signaling only. User-facing text
//! never carries internal details.

use crate::config::ConfigError;
use crate::negotiation::{NegotiationInput, NegotiationState};
use thiserror::Error;

/// Mesh error type.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Local camera/microphone could not be acquired. Fatal to joining.
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaAccessError),

    /// Relay channel operation failed (subscribe, track, broadcast).
    #[error("Relay error: {0}")]
    Relay(String),

    /// Offer/answer negotiation failed for one peer link.
    #[error("Negotiation with {remote_user_id} failed: {reason}")]
    Negotiation {
        remote_user_id: String,
        reason: String,
    },

    /// Media transport primitive reported an error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Handshake payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session has already been left or was cancelled.
    #[error("Session closed")]
    SessionClosed,

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Reasons local media cannot be acquired.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAccessError {
    /// The user or platform denied camera/microphone access.
    #[error("Permission denied")]
    PermissionDenied,

    /// No device of the requested kind exists.
    #[error("No {0} device found")]
    DeviceNotFound(String),

    /// The device exists but cannot be opened (e.g. in use elsewhere).
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Rejected negotiation state transition.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Invalid negotiation transition from {from:?} on {input:?}")]
pub struct TransitionError {
    pub from: NegotiationState,
    pub input: NegotiationInput,
}

impl MeshError {
    /// Whether this error must block entry to the meeting.
    #[must_use]
    pub fn is_fatal_to_join(&self) -> bool {
        matches!(self, MeshError::MediaAcquisition(_))
    }

    /// Returns a user-safe message (no internal details).
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            MeshError::MediaAcquisition(MediaAccessError::PermissionDenied) => {
                "Camera and microphone access was denied".to_string()
            }
            MeshError::MediaAcquisition(MediaAccessError::DeviceNotFound(kind)) => {
                format!("No {kind} was found on this device")
            }
            MeshError::MediaAcquisition(MediaAccessError::DeviceUnavailable(_)) => {
                "Your camera or microphone is in use by another application".to_string()
            }
            MeshError::Relay(_) => "Lost connection to the meeting service".to_string(),
            MeshError::Negotiation { .. } | MeshError::Transport(_) => {
                "Could not connect to this participant".to_string()
            }
            MeshError::SessionClosed => "You have left the meeting".to_string(),
            MeshError::Serialization(_) | MeshError::Config(_) | MeshError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}

impl From<ConfigError> for MeshError {
    fn from(err: ConfigError) -> Self {
        MeshError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}
