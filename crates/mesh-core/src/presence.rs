//! Presence tracker: the live roster of a meeting.
//!
//! Turns relay presence traffic (sync snapshots, incremental join/leave) into
//! exactly-once discovery and removal events:
//!
//! - Every remote participant present during the session produces exactly one
//!   `Discovered` per presence lifetime, via either sync or join.
//! - `Removed` follows `Discovered` for the same identity, at most once per
//!   disappearance.
//! - A sync after a relay reconnect reconciles: identities missing from the
//!   snapshot are removed, new ones discovered, known ones left alone.

use crate::errors::MeshError;
use crate::relay::{PresenceIdentity, RelayChannel, RelayEvent};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// How a participant was first observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    /// Present in the snapshot delivered on (re)subscription.
    Sync,
    /// Observed joining after subscription.
    Join,
}

/// Membership change surfaced to the session coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// A remote participant became present.
    Discovered {
        identity: PresenceIdentity,
        source: DiscoverySource,
    },
    /// A remote participant is no longer present.
    Removed { user_id: String },
}

/// Tracks who is present in a meeting, excluding self.
#[derive(Debug)]
pub struct PresenceTracker {
    self_id: String,
    known: HashMap<String, PresenceIdentity>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            known: HashMap::new(),
        }
    }

    /// Subscribe to the meeting's presence channel, then publish the local identity.
    ///
    /// The subscription is established first so the snapshot delivered to us
    /// and the join event delivered to others cover every participant.
    pub async fn join(
        &self,
        relay: &dyn RelayChannel,
        identity: PresenceIdentity,
    ) -> Result<mpsc::UnboundedReceiver<RelayEvent>, MeshError> {
        let events = relay.subscribe().await?;
        relay.track(identity).await?;

        info!(
            target: "mesh.presence",
            meeting_id = %relay.meeting_id(),
            user_id = %self.self_id,
            "Presence tracked"
        );

        Ok(events)
    }

    /// Handle a full snapshot.
    pub fn handle_sync(&mut self, snapshot: Vec<PresenceIdentity>) -> Vec<PresenceEvent> {
        let mut present: HashMap<String, PresenceIdentity> = HashMap::new();
        for identity in snapshot {
            if identity.user_id != self.self_id {
                present.insert(identity.user_id.clone(), identity);
            }
        }

        let mut events = Vec::new();

        let mut departed: Vec<String> = self
            .known
            .keys()
            .filter(|user_id| !present.contains_key(*user_id))
            .cloned()
            .collect();
        departed.sort();
        for user_id in departed {
            self.known.remove(&user_id);
            debug!(
                target: "mesh.presence",
                user_id = %user_id,
                "Participant missing from snapshot"
            );
            events.push(PresenceEvent::Removed { user_id });
        }

        let mut arrived: Vec<PresenceIdentity> = present
            .into_values()
            .filter(|identity| !self.known.contains_key(&identity.user_id))
            .collect();
        arrived.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        for identity in arrived {
            self.known
                .insert(identity.user_id.clone(), identity.clone());
            events.push(PresenceEvent::Discovered {
                identity,
                source: DiscoverySource::Sync,
            });
        }

        events
    }

    /// Handle identities that joined after subscription.
    pub fn handle_join(&mut self, identities: Vec<PresenceIdentity>) -> Vec<PresenceEvent> {
        let mut events = Vec::new();
        for identity in identities {
            if identity.user_id == self.self_id || self.known.contains_key(&identity.user_id) {
                continue;
            }
            self.known
                .insert(identity.user_id.clone(), identity.clone());
            events.push(PresenceEvent::Discovered {
                identity,
                source: DiscoverySource::Join,
            });
        }
        events
    }

    /// Handle identities that left.
    pub fn handle_leave(&mut self, identities: Vec<PresenceIdentity>) -> Vec<PresenceEvent> {
        identities
            .into_iter()
            .filter_map(|identity| {
                self.known
                    .remove(&identity.user_id)
                    .map(|_| PresenceEvent::Removed {
                        user_id: identity.user_id,
                    })
            })
            .collect()
    }

    /// Whether a user is currently present.
    #[must_use]
    pub fn contains(&self, user_id: &str) -> bool {
        self.known.contains_key(user_id)
    }

    /// Current roster (excluding self), ordered by user id.
    #[must_use]
    pub fn roster(&self) -> Vec<PresenceIdentity> {
        let mut roster: Vec<PresenceIdentity> = self.known.values().cloned().collect();
        roster.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        roster
    }

    /// Forget every known identity (session teardown).
    pub fn clear(&mut self) {
        self.known.clear();
    }
}
