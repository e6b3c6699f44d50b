//! Actor model implementation for the mesh core.
//!
//! ```text
//! SessionActor (one per open meeting view)
//! ├── owns roster, local media, presence tracker, signaling router
//! └── supervises N PeerLinkActors
//!     └── PeerLinkActor (one per remote participant)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One link per remote participant**: links are keyed by remote user id
//! - **CancellationToken propagation**: the session passes child tokens to links,
//!   so leaving cancels every in-flight negotiation
//! - **Generation tags**: events from a replaced link are discarded
//! - **Negotiation ids**: answers and candidates reach only the link whose
//!   offer they reply to
//! - **Message passing**: all inter-actor communication via `tokio::sync::mpsc` channels
//!
//! # Modules
//!
//! - [`session`] - `SessionActor` per meeting view, the session coordinator
//! - [`link`] - `PeerLinkActor` per remote participant, the transport negotiator
//! - [`messages`] - Message and event types for actor communication

pub mod link;
pub mod messages;
pub mod session;

// Re-export primary types
pub use link::{LinkContext, LinkParams, PeerLinkActor, PeerLinkHandle};
pub use messages::*;
pub use session::{SessionActor, SessionDeps, SessionHandle, SessionParams, REACTION_EVENT};
