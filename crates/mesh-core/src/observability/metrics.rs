//! Metrics definitions for the mesh core.
//!
//! All metrics follow Prometheus naming conventions:
//! - `mesh_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! Recording is a no-op until the embedding binary installs a recorder.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ============================================================================
// Link Metrics
// ============================================================================

/// Set the number of live peer links.
///
/// Metric: `mesh_peer_links_active`
/// Labels: none
pub fn set_peer_links_active(count: usize) {
    // usize to f64 conversion is safe for realistic link counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_peer_links_active").set(count as f64);
}

/// Record a negotiation result.
///
/// Metric: `mesh_negotiations_total`
/// Labels: `outcome` (completed, failed, superseded)
pub fn record_negotiation(outcome: &str) {
    counter!("mesh_negotiations_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record time from link creation until the transport reported connected.
///
/// Metric: `mesh_negotiation_duration_seconds`
/// Labels: none
pub fn record_negotiation_duration(duration: Duration) {
    histogram!("mesh_negotiation_duration_seconds").record(duration.as_secs_f64());
}

/// Record a transport failure and what the coordinator did about it.
///
/// Metric: `mesh_link_failures_total`
/// Labels: `action` (retried, given_up)
pub fn record_link_failure(action: &str) {
    counter!("mesh_link_failures_total", "action" => action.to_string()).increment(1);
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record a handshake message sent or received.
///
/// Metric: `mesh_handshake_messages_total`
/// Labels: `kind` (offer, answer, ice-candidate), `direction` (sent, received)
///
/// Cardinality: 6
pub fn record_handshake_message(kind: &str, direction: &str) {
    counter!("mesh_handshake_messages_total",
        "kind" => kind.to_string(),
        "direction" => direction.to_string()
    )
    .increment(1);
}

/// Record a handshake message that was ignored.
///
/// Metric: `mesh_handshake_dropped_total`
/// Labels: `reason` (not_addressed, malformed, no_link, stale, glare, overflow)
///
/// `not_addressed` is expected under broadcast delivery and grows with the
/// square of the meeting size.
pub fn record_handshake_dropped(reason: &str) {
    counter!("mesh_handshake_dropped_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Record a join blocked by local media acquisition.
///
/// Metric: `mesh_media_acquisition_failures_total`
/// Labels: `reason` (permission_denied, device_not_found, device_unavailable)
pub fn record_media_acquisition_failure(reason: &str) {
    counter!("mesh_media_acquisition_failures_total", "reason" => reason.to_string())
        .increment(1);
}

/// Set relay connectivity.
///
/// Metric: `mesh_relay_connected`
/// Labels: none
pub fn set_relay_connected(connected: bool) {
    gauge!("mesh_relay_connected").set(if connected { 1.0 } else { 0.0 });
}
