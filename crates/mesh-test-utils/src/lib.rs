//! # Mesh Test Utilities
//!
//! Fakes and fixtures for testing the mesh core without a real relay,
//! camera or media transport.
//!
//! ## Modules
//!
//! - `relay` - In-memory relay hub with presence and broadcast delivery
//! - `transport` - Scriptable fake media transport and factory with call records
//! - `media` - Fake camera/microphone source
//! - `fixtures` - Participant builders and event wait helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mesh_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let hub = InMemoryRelayHub::new();
//!
//!     let mut alice = TestParticipant::new("alice").join(&hub, "meeting-1").await;
//!     let mut bob = TestParticipant::new("bob").join(&hub, "meeting-1").await;
//!
//!     alice
//!         .wait_for_event(|e| matches!(e, SessionEvent::StreamAttached { .. }))
//!         .await;
//! }
//! ```

pub mod fixtures;
pub mod media;
pub mod relay;
pub mod transport;

// Re-export commonly used items
pub use fixtures::*;
pub use media::*;
pub use relay::*;
pub use transport::*;
