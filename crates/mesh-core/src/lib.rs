//! Meeting Mesh Core Library
//!
//! The peer connection signaling and session-membership core of a browser-style
//! video meeting client. It is responsible for:
//!
//! - Discovering which users are present in a meeting (presence join/leave/sync)
//! - Establishing one direct media transport per pair of participants
//! - Exchanging the offer/answer/candidate handshake over a broadcast relay
//! - Tearing links down cleanly when someone leaves or the session ends
//!
//! # Architecture
//!
//! The core uses an actor hierarchy:
//!
//! ```text
//! SessionActor (one per open meeting view)
//! ├── owns roster, local media, presence tracker, signaling router
//! └── supervises N PeerLinkActors
//!     └── PeerLinkActor (one per remote participant)
//!         └── owns one MediaTransport and its negotiation state
//! ```
//!
//! The relay, media source and media transport are external collaborators
//! consumed through the traits in [`relay`] and [`media`].
//!
//! # Modules
//!
//! - [`actors`] - Session coordinator and per-peer link actors
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types
//! - [`media`] - Local media and media transport contracts
//! - [`negotiation`] - Offer/answer state machine
//! - [`observability`] - Metrics
//! - [`presence`] - Roster tracking over relay presence
//! - [`relay`] - Relay channel contract
//! - [`signaling`] - Address-aware handshake routing

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod negotiation;
pub mod observability;
pub mod presence;
pub mod relay;
pub mod signaling;

pub use actors::{SessionActor, SessionDeps, SessionEvent, SessionHandle, SessionParams};
pub use config::MeshConfig;
pub use errors::MeshError;
