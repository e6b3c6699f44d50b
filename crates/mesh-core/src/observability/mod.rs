//! Observability for the mesh core.
//!
//! # Privacy by Default
//!
//! Session description bodies and candidate strings are never logged or used
//! as metric labels. Labels are bounded:
//! - `outcome`: completed, failed, superseded
//! - `kind`: offer, answer, ice-candidate
//! - `direction`: sent, received
//! - `reason`: not_addressed, malformed, no_link, stale, glare, overflow
//! - `action`: retried, given_up
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `mesh_peer_links_active` | Gauge | none | Live peer links in this session |
//! | `mesh_negotiations_total` | Counter | `outcome` | Negotiation results |
//! | `mesh_negotiation_duration_seconds` | Histogram | none | Link creation to connected |
//! | `mesh_handshake_messages_total` | Counter | `kind`, `direction` | Handshake traffic |
//! | `mesh_handshake_dropped_total` | Counter | `reason` | Ignored handshake messages |
//! | `mesh_link_failures_total` | Counter | `action` | Transport failures and retries |
//! | `mesh_media_acquisition_failures_total` | Counter | `reason` | Join blocked by media |
//! | `mesh_relay_connected` | Gauge | none | Relay connectivity (0/1) |

pub mod metrics;
