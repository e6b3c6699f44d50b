//! End-to-end session scenarios over the in-memory relay.
//!
//! Every participant runs a real `SessionActor` with fake media and fake
//! transports; the relay hub delivers presence and broadcasts between them.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::time::Duration;

use mesh_core::actors::{ConnectionState, LinkRole, SessionEvent, SessionStatus};
use mesh_core::config::{InitiatorPolicy, MeshConfig};
use mesh_core::errors::{MediaAccessError, MeshError};
use mesh_core::media::{IceCandidate, SdpKind, SessionDescription, TrackKind};
use mesh_core::negotiation::NegotiationState;
use mesh_core::presence::DiscoverySource;
use mesh_test_utils::{
    random_meeting_id, wait_until, FakeBehavior, InMemoryRelayHub, TestParticipant, TestSession,
    TransportCall, DEFAULT_WAIT,
};
use serde_json::json;

fn stream_from(user_id: &str) -> impl FnMut(&SessionEvent) -> bool + '_ {
    move |e| matches!(e, SessionEvent::StreamAttached { user_id: id, .. } if id == user_id)
}

async fn wait_connected(session: &TestSession, remote: &str) {
    session
        .wait_for_state(|s| {
            s.participant(remote).is_some_and(|p| {
                p.connection_state == ConnectionState::Connected && p.stream.is_some()
            })
                && s.link(remote)
                    .is_some_and(|l| l.state == NegotiationState::Stable)
        })
        .await;
}

/// Let in-flight relay traffic settle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"))
}

fn handshake(
    from: &str,
    to: &str,
    negotiation_id: &str,
    payload: serde_json::Value,
) -> serde_json::Value {
    json!({ "from": from, "to": to, "negotiation_id": negotiation_id, "payload": payload })
}

fn joined_via(event: &SessionEvent) -> Option<(String, DiscoverySource)> {
    match event {
        SessionEvent::ParticipantJoined(info) => Some((info.user_id.clone(), info.discovered_via)),
        _ => None,
    }
}

// ============================================================================
// Discovery and negotiation
// ============================================================================

#[tokio::test]
async fn test_newcomer_sends_exactly_one_offer() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let mut alice = TestParticipant::new("alice")
        .with_policy(InitiatorPolicy::Newcomer)
        .join(&hub, &meeting)
        .await;
    let mut bob = TestParticipant::new("bob")
        .with_policy(InitiatorPolicy::Newcomer)
        .join(&hub, &meeting)
        .await;

    // bob finds alice in the snapshot, alice sees bob join.
    let joined = bob
        .wait_for_event(|e| matches!(e, SessionEvent::ParticipantJoined(_)))
        .await;
    assert_eq!(
        joined_via(&joined),
        Some(("alice".to_string(), DiscoverySource::Sync))
    );
    let joined = alice
        .wait_for_event(|e| matches!(e, SessionEvent::ParticipantJoined(_)))
        .await;
    assert_eq!(
        joined_via(&joined),
        Some(("bob".to_string(), DiscoverySource::Join))
    );

    alice.wait_for_event(stream_from("bob")).await;
    bob.wait_for_event(stream_from("alice")).await;
    wait_connected(&alice, "bob").await;
    wait_connected(&bob, "alice").await;

    assert_eq!(hub.handshakes("offer", "bob", "alice").len(), 1);
    assert!(hub.handshakes("offer", "alice", "bob").is_empty());
    assert_eq!(hub.handshakes("answer", "alice", "bob").len(), 1);

    let alice_state = alice.handle.state().await.unwrap();
    assert_eq!(alice_state.link("bob").unwrap().role, LinkRole::Responder);
    let bob_state = bob.handle.state().await.unwrap();
    assert_eq!(bob_state.link("alice").unwrap().role, LinkRole::Initiator);
    assert_eq!(
        bob_state.participant("alice").unwrap().stream.as_ref().unwrap().stream_id,
        "alice-media"
    );
}

#[tokio::test]
async fn test_lower_id_initiates_regardless_of_join_order() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let mut bob = TestParticipant::new("bob").join(&hub, &meeting).await;
    let mut alice = TestParticipant::new("alice").join(&hub, &meeting).await;

    alice.wait_for_event(stream_from("bob")).await;
    bob.wait_for_event(stream_from("alice")).await;

    assert_eq!(hub.handshakes("offer", "alice", "bob").len(), 1);
    assert!(hub.handshakes("offer", "bob", "alice").is_empty());
    assert_eq!(alice.transports.created_count("bob"), 1);
    assert_eq!(bob.transports.created_count("alice"), 1);
}

#[tokio::test]
async fn test_participant_joined_carries_identity() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let mut alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    let _bob = TestParticipant::new("bob")
        .with_display_name("Bob B.")
        .join(&hub, &meeting)
        .await;

    let event = alice
        .wait_for_event(|e| matches!(e, SessionEvent::ParticipantJoined(_)))
        .await;
    match event {
        SessionEvent::ParticipantJoined(info) => {
            assert_eq!(info.user_id, "bob");
            assert_eq!(info.display_name, "Bob B.");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_three_participants_form_full_mesh() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    let bob = TestParticipant::new("bob").join(&hub, &meeting).await;
    let carol = TestParticipant::new("carol").join(&hub, &meeting).await;

    for (session, remotes) in [
        (&alice, ["bob", "carol"]),
        (&bob, ["alice", "carol"]),
        (&carol, ["alice", "bob"]),
    ] {
        for remote in remotes {
            wait_connected(session, remote).await;
        }
        let state = session.handle.state().await.unwrap();
        assert_eq!(state.links.len(), 2);
        assert!(state.participants.iter().all(|p| p.stream.is_some()));
    }

    // One offer per pair.
    assert_eq!(hub.broadcast_count("offer"), 3);
}

#[tokio::test]
async fn test_offer_collision_converges_on_one_link() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    // alice initiates on join events, bob on sync: both offer each other.
    let mut alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    let mut bob = TestParticipant::new("bob")
        .with_policy(InitiatorPolicy::Newcomer)
        .join(&hub, &meeting)
        .await;

    alice.wait_for_event(stream_from("bob")).await;
    bob.wait_for_event(stream_from("alice")).await;
    wait_connected(&alice, "bob").await;
    wait_connected(&bob, "alice").await;

    assert_eq!(hub.handshakes("offer", "alice", "bob").len(), 1);

    // The lower id keeps its offer; the other side answers it.
    let alice_state = alice.handle.state().await.unwrap();
    let bob_state = bob.handle.state().await.unwrap();
    assert_eq!(alice_state.link("bob").unwrap().role, LinkRole::Initiator);
    assert_eq!(bob_state.link("alice").unwrap().role, LinkRole::Responder);
    assert_eq!(hub.handshakes("answer", "bob", "alice").len(), 1);
    assert!(hub.handshakes("answer", "alice", "bob").is_empty());
    assert_eq!(alice.transports.created_count("bob"), 1);

    // bob's own initiator link was replaced by the responder.
    let bob_records = bob.transports.records_for("alice");
    assert_eq!(bob_records.len(), 2);
    assert_eq!(bob_records[0].close_count(), 1);
    assert_eq!(bob_records[1].close_count(), 0);
}

// ============================================================================
// Departure
// ============================================================================

#[tokio::test]
async fn test_departure_releases_link_and_notifies() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let mut alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    let bob = TestParticipant::new("bob").join(&hub, &meeting).await;
    wait_connected(&alice, "bob").await;

    let bob = bob.leave().await;
    alice
        .wait_for_event(|e| matches!(e, SessionEvent::ParticipantLeft { user_id } if user_id == "bob"))
        .await;

    let state = alice.handle.state().await.unwrap();
    assert!(state.participant("bob").is_none());
    assert!(state.links.is_empty());
    assert_eq!(alice.transports.latest_for("bob").unwrap().close_count(), 1);

    assert!(bob.media.all_stopped());
    assert_eq!(bob.transports.latest_for("alice").unwrap().close_count(), 1);
    assert_eq!(hub.present_users(&meeting), vec!["alice".to_string()]);
}

#[tokio::test]
async fn test_departure_during_pending_offer_ignores_late_answer() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let mut alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    hub.drop_events("answer");
    let carol = TestParticipant::new("carol").join(&hub, &meeting).await;

    alice
        .wait_for_state(|s| {
            s.link("carol")
                .is_some_and(|l| l.state == NegotiationState::HaveLocalOffer)
        })
        .await;
    carol
        .wait_for_state(|s| {
            s.link("alice")
                .is_some_and(|l| l.state == NegotiationState::Stable)
        })
        .await;
    assert_eq!(hub.handshakes("answer", "carol", "alice").len(), 1);

    let _carol = carol.leave().await;
    alice
        .wait_for_event(
            |e| matches!(e, SessionEvent::ParticipantLeft { user_id } if user_id == "carol"),
        )
        .await;

    hub.allow_events("answer");
    hub.inject(
        &meeting,
        "answer",
        handshake(
            "carol",
            "alice",
            "n-carol-late",
            serde_json::to_value(SessionDescription::answer("v=0 o=carol late")).unwrap(),
        ),
    );
    settle().await;

    let record = alice.transports.latest_for("carol").unwrap();
    assert_eq!(record.close_count(), 1);
    assert!(!record.has_call(&TransportCall::SetRemoteDescription(SdpKind::Answer)));
    assert_eq!(record.calls().last(), Some(&TransportCall::Close));

    let state = alice.handle.state().await.unwrap();
    assert!(state.participant("carol").is_none());
    assert!(state.link("carol").is_none());
    assert_eq!(alice.transports.created_count("carol"), 1);
}

// ============================================================================
// Local media
// ============================================================================

#[tokio::test]
async fn test_muting_touches_no_signaling() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    let bob = TestParticipant::new("bob").join(&hub, &meeting).await;
    wait_connected(&alice, "bob").await;
    wait_connected(&bob, "alice").await;
    settle().await;

    let before = alice.handle.state().await.unwrap().link("bob").cloned().unwrap();
    hub.clear_log();

    alice.handle.toggle_local_video(false).await.unwrap();
    alice.handle.toggle_local_audio(false).await.unwrap();
    settle().await;

    assert!(hub.broadcasts().is_empty());
    let state = alice.handle.state().await.unwrap();
    assert!(!state.video_enabled);
    assert!(!state.audio_enabled);
    assert_eq!(state.link("bob"), Some(&before));
    assert!(!alice.media.track(TrackKind::Video).unwrap().is_enabled());
    assert!(!alice.media.track(TrackKind::Audio).unwrap().is_enabled());

    alice.handle.toggle_local_video(true).await.unwrap();
    assert!(alice.media.track(TrackKind::Video).unwrap().is_enabled());
    assert_eq!(alice.transports.created_count("bob"), 1);
}

#[tokio::test]
async fn test_media_failure_blocks_join_without_relay_traffic() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let _bob = TestParticipant::new("bob").join(&hub, &meeting).await;
    hub.clear_log();

    let result = TestParticipant::new("alice")
        .with_media_failure(MediaAccessError::PermissionDenied)
        .try_join(&hub, &meeting)
        .await;
    let Err((alice, error)) = result else {
        panic!("join should fail without media");
    };

    assert!(matches!(
        error,
        MeshError::MediaAcquisition(MediaAccessError::PermissionDenied)
    ));
    assert!(error.is_fatal_to_join());
    assert_eq!(
        alice.handle.status(),
        SessionStatus::MediaUnavailable(MediaAccessError::PermissionDenied)
    );
    assert!(hub.broadcasts().is_empty());
    assert!(!alice.relay.is_subscribed());
    assert_eq!(hub.present_users(&meeting), vec!["bob".to_string()]);
    assert!(alice.transports.records().is_empty());
}

#[tokio::test]
async fn test_audio_only_session_attaches_one_track() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let alice = TestParticipant::new("alice")
        .with_constraints(mesh_core::media::MediaConstraints {
            audio: true,
            video: false,
        })
        .join(&hub, &meeting)
        .await;
    let _bob = TestParticipant::new("bob").join(&hub, &meeting).await;
    wait_connected(&alice, "bob").await;

    let record = alice.transports.latest_for("bob").unwrap();
    assert_eq!(record.tracks_attached_up_front(), vec!["alice-mic".to_string()]);
    assert!(alice.media.track(TrackKind::Video).is_none());
}

// ============================================================================
// Leaving
// ============================================================================

#[tokio::test]
async fn test_leave_is_idempotent() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    let bob = TestParticipant::new("bob").join(&hub, &meeting).await;
    wait_connected(&alice, "bob").await;

    alice.handle.leave().await.unwrap();
    alice.handle.leave().await.unwrap();

    assert_eq!(alice.handle.status(), SessionStatus::Closed);
    assert!(alice.handle.is_cancelled());
    assert!(alice.media.all_stopped());
    assert!(!alice.relay.is_subscribed());
    assert!(!alice.relay.is_tracked());
    assert_eq!(alice.transports.latest_for("bob").unwrap().close_count(), 1);
    assert!(matches!(
        alice.handle.state().await,
        Err(MeshError::SessionClosed)
    ));
    assert!(matches!(
        alice.handle.toggle_local_audio(false).await,
        Err(MeshError::SessionClosed)
    ));

    alice.task.await.unwrap();
    bob.handle.leave().await.unwrap();
}

#[tokio::test]
async fn test_leave_before_join_completes() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let alice = TestParticipant::new("alice")
        .with_media_delay(Duration::from_millis(500))
        .spawn(&hub, &meeting);
    assert_eq!(alice.handle.status(), SessionStatus::Starting);

    alice.handle.leave().await.unwrap();

    assert_eq!(alice.handle.status(), SessionStatus::Closed);
    assert!(matches!(
        alice.handle.joined().await,
        Err(MeshError::SessionClosed)
    ));
    assert_eq!(hub.subscriber_count(&meeting), 0);
    assert!(hub.present_users(&meeting).is_empty());
    assert!(hub.broadcasts().is_empty());
}

#[tokio::test]
async fn test_leave_during_negotiation_discards_in_flight_work() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let alice = TestParticipant::new("alice")
        .with_transport_behavior(FakeBehavior::default().with_delay(Duration::from_millis(200)))
        .join(&hub, &meeting)
        .await;
    let _bob = TestParticipant::new("bob").join(&hub, &meeting).await;

    alice
        .wait_for_state(|s| s.link("bob").is_some())
        .await;
    let mut alice = alice.leave().await;

    // Give the delayed transport operations time to have completed.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let record = alice.transports.latest_for("bob").unwrap();
    assert_eq!(record.close_count(), 1);
    assert_eq!(record.calls().last(), Some(&TransportCall::Close));
    assert!(hub.handshakes("offer", "alice", "bob").is_empty());
    assert_eq!(alice.handle.status(), SessionStatus::Closed);
    assert!(!alice.drain_events().iter().any(|e| matches!(
        e,
        SessionEvent::ParticipantFailed { .. } | SessionEvent::StreamAttached { .. }
    )));
}

// ============================================================================
// Handshake routing edge cases
// ============================================================================

#[tokio::test]
async fn test_misaddressed_offer_creates_no_link() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    hub.inject(
        &meeting,
        "offer",
        handshake(
            "mallory",
            "zed",
            "n-mallory",
            serde_json::to_value(SessionDescription::offer("v=0 o=mallory")).unwrap(),
        ),
    );
    hub.inject(&meeting, "offer", json!({ "unexpected": true }));
    hub.inject(&meeting, "unknown-event", json!({ "from": "x", "to": "alice" }));
    settle().await;

    assert!(alice.transports.records().is_empty());
    assert!(alice.handle.state().await.unwrap().links.is_empty());
    assert_eq!(hub.broadcast_count("answer"), 0);
}

#[tokio::test]
async fn test_candidates_before_offer_are_applied_after_it() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    for n in [1, 2] {
        hub.inject(
            &meeting,
            "ice-candidate",
            handshake("bob", "alice", "n-bob-1", serde_json::to_value(candidate(n)).unwrap()),
        );
    }
    hub.inject(
        &meeting,
        "offer",
        handshake(
            "bob",
            "alice",
            "n-bob-1",
            serde_json::to_value(SessionDescription::offer("v=0 o=bob")).unwrap(),
        ),
    );

    alice
        .wait_for_state(|s| {
            s.link("bob")
                .is_some_and(|l| l.state == NegotiationState::Stable)
        })
        .await;

    let record = alice.transports.latest_for("bob").unwrap();
    assert_eq!(
        record.applied_candidates(),
        vec![candidate(1).candidate, candidate(2).candidate]
    );
    assert_eq!(hub.handshakes("answer", "alice", "bob").len(), 1);
}

#[tokio::test]
async fn test_early_candidate_queue_is_bounded() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let config = MeshConfig {
        early_candidate_limit: 2,
        ..MeshConfig::default()
    };
    let alice = TestParticipant::new("alice")
        .with_config(config)
        .join(&hub, &meeting)
        .await;

    for n in 1..=4 {
        hub.inject(
            &meeting,
            "ice-candidate",
            handshake("bob", "alice", "n-bob-1", serde_json::to_value(candidate(n)).unwrap()),
        );
    }
    hub.inject(
        &meeting,
        "offer",
        handshake(
            "bob",
            "alice",
            "n-bob-1",
            serde_json::to_value(SessionDescription::offer("v=0 o=bob")).unwrap(),
        ),
    );

    alice
        .wait_for_state(|s| {
            s.link("bob")
                .is_some_and(|l| l.state == NegotiationState::Stable)
        })
        .await;

    let record = alice.transports.latest_for("bob").unwrap();
    assert_eq!(
        record.applied_candidates(),
        vec![candidate(1).candidate, candidate(2).candidate]
    );
}

#[tokio::test]
async fn test_early_candidates_for_another_offer_are_discarded() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    hub.inject(
        &meeting,
        "ice-candidate",
        handshake("bob", "alice", "n-bob-0", serde_json::to_value(candidate(1)).unwrap()),
    );
    hub.inject(
        &meeting,
        "ice-candidate",
        handshake("bob", "alice", "n-bob-1", serde_json::to_value(candidate(2)).unwrap()),
    );
    hub.inject(
        &meeting,
        "offer",
        handshake(
            "bob",
            "alice",
            "n-bob-1",
            serde_json::to_value(SessionDescription::offer("v=0 o=bob")).unwrap(),
        ),
    );

    alice
        .wait_for_state(|s| {
            s.link("bob")
                .is_some_and(|l| l.state == NegotiationState::Stable)
        })
        .await;

    let record = alice.transports.latest_for("bob").unwrap();
    assert_eq!(record.applied_candidates(), vec![candidate(2).candidate]);
    let answers = hub.handshakes("answer", "alice", "bob");
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].payload["negotiation_id"], "n-bob-1");
}

#[tokio::test]
async fn test_duplicate_offer_keeps_existing_link() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    let offer = handshake(
        "bob",
        "alice",
        "n-bob-1",
        serde_json::to_value(SessionDescription::offer("v=0 o=bob")).unwrap(),
    );
    hub.inject(&meeting, "offer", offer.clone());
    alice
        .wait_for_state(|s| {
            s.link("bob")
                .is_some_and(|l| l.state == NegotiationState::Stable)
        })
        .await;

    hub.inject(&meeting, "offer", offer);
    settle().await;

    assert_eq!(alice.transports.created_count("bob"), 1);
    assert_eq!(hub.handshakes("answer", "alice", "bob").len(), 1);
}

#[tokio::test]
async fn test_answer_to_closed_link_is_not_applied_to_its_replacement() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let mut alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    hub.drop_events("answer");
    let bob = TestParticipant::new("bob").join(&hub, &meeting).await;

    let first = alice
        .wait_for_state(|s| {
            s.link("bob")
                .is_some_and(|l| l.state == NegotiationState::HaveLocalOffer)
        })
        .await;
    let first_generation = first.link("bob").unwrap().generation;
    let log_hub = hub.clone();
    assert!(
        wait_until(DEFAULT_WAIT, || {
            let hub = log_hub.clone();
            async move { hub.handshakes("answer", "bob", "alice").len() == 1 }
        })
        .await
    );
    let first_answer = hub.handshakes("answer", "bob", "alice")[0].payload.clone();
    let first_negotiation = first_answer["negotiation_id"].clone();

    // bob leaves and comes back: alice offers again on a new link.
    let _bob = bob.leave().await;
    alice
        .wait_for_event(|e| matches!(e, SessionEvent::ParticipantLeft { user_id } if user_id == "bob"))
        .await;
    let _bob_again = TestParticipant::new("bob").join(&hub, &meeting).await;

    alice
        .wait_for_state(|s| {
            s.link("bob").is_some_and(|l| {
                l.generation > first_generation && l.state == NegotiationState::HaveLocalOffer
            })
        })
        .await;
    assert!(
        wait_until(DEFAULT_WAIT, || {
            let hub = log_hub.clone();
            async move { hub.handshakes("answer", "bob", "alice").len() == 2 }
        })
        .await
    );
    let second_answer = hub.handshakes("answer", "bob", "alice")[1].payload.clone();
    assert_ne!(second_answer["negotiation_id"], first_negotiation);

    // Replies to the first offer arrive late.
    hub.allow_events("answer");
    hub.inject(&meeting, "answer", first_answer);
    hub.inject(
        &meeting,
        "ice-candidate",
        json!({
            "from": "bob",
            "to": "alice",
            "negotiation_id": first_negotiation,
            "payload": serde_json::to_value(candidate(9)).unwrap(),
        }),
    );
    settle().await;

    let state = alice.handle.state().await.unwrap();
    assert_eq!(state.link("bob").unwrap().state, NegotiationState::HaveLocalOffer);
    let replacement = alice.transports.latest_for("bob").unwrap();
    assert!(!replacement.has_call(&TransportCall::SetRemoteDescription(SdpKind::Answer)));
    assert_eq!(alice.transports.created_count("bob"), 2);

    // The reply to the current offer still completes the link.
    hub.inject(&meeting, "answer", second_answer);
    wait_connected(&alice, "bob").await;
    let replacement = alice.transports.latest_for("bob").unwrap();
    assert!(!replacement
        .applied_candidates()
        .contains(&candidate(9).candidate));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_initiator_retries_once_then_reports_failure() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let mut alice = TestParticipant::new("alice")
        .with_transport_behavior_for("bob", FakeBehavior::default().failing_connection())
        .join(&hub, &meeting)
        .await;
    let _bob = TestParticipant::new("bob").join(&hub, &meeting).await;

    let event = alice
        .wait_for_event(|e| matches!(e, SessionEvent::ParticipantFailed { .. }))
        .await;
    assert!(matches!(event, SessionEvent::ParticipantFailed { user_id, .. } if user_id == "bob"));

    assert_eq!(alice.transports.created_count("bob"), 2);
    for record in alice.transports.records_for("bob") {
        assert_eq!(record.close_count(), 1);
    }

    let state = alice.handle.state().await.unwrap();
    let bob_info = state.participant("bob").unwrap();
    assert_eq!(bob_info.connection_state, ConnectionState::Failed);
    assert!(state.link("bob").is_none());

    settle().await;
    assert_eq!(alice.transports.created_count("bob"), 2);
}

#[tokio::test]
async fn test_responder_failure_is_not_retried() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let _alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    let mut zoe = TestParticipant::new("zoe")
        .with_transport_behavior_for(
            "alice",
            FakeBehavior::default().rejecting_remote_descriptions(),
        )
        .join(&hub, &meeting)
        .await;

    let event = zoe
        .wait_for_event(|e| matches!(e, SessionEvent::ParticipantFailed { .. }))
        .await;
    assert!(matches!(event, SessionEvent::ParticipantFailed { user_id, .. } if user_id == "alice"));

    settle().await;
    assert_eq!(zoe.transports.created_count("alice"), 1);
    assert!(hub.handshakes("answer", "zoe", "alice").is_empty());
    assert!(hub.handshakes("offer", "zoe", "alice").is_empty());
}

// ============================================================================
// Relay connectivity
// ============================================================================

#[tokio::test]
async fn test_reconnect_reconciles_roster() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let mut alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    let bob = TestParticipant::new("bob").join(&hub, &meeting).await;
    let carol = TestParticipant::new("carol").join(&hub, &meeting).await;
    wait_connected(&alice, "bob").await;
    wait_connected(&alice, "carol").await;
    let bob_generation = alice.handle.state().await.unwrap().link("bob").unwrap().generation;

    hub.disconnect_user(&meeting, "alice");
    alice
        .wait_for_event(|e| matches!(e, SessionEvent::RelayConnectivityChanged { connected: false }))
        .await;
    assert!(!alice.handle.state().await.unwrap().relay_connected);

    // Missed while disconnected.
    let _carol = carol.leave().await;
    let _dave = TestParticipant::new("dave").join(&hub, &meeting).await;

    hub.reconnect_user(&meeting, "alice");
    alice
        .wait_for_event(|e| matches!(e, SessionEvent::RelayConnectivityChanged { connected: true }))
        .await;
    alice
        .wait_for_event(
            |e| matches!(e, SessionEvent::ParticipantLeft { user_id } if user_id == "carol"),
        )
        .await;
    alice.wait_for_event(stream_from("dave")).await;

    let state = alice.handle.state().await.unwrap();
    let ids: Vec<&str> = state.participants.iter().map(|p| p.user_id.as_str()).collect();
    assert_eq!(ids, vec!["bob", "dave"]);
    assert_eq!(state.link("bob").unwrap().generation, bob_generation);
    assert!(state.relay_connected);
    assert_eq!(alice.transports.latest_for("carol").unwrap().close_count(), 1);
    assert!(alice.relay.is_tracked());

    bob.handle.leave().await.unwrap();
}

// ============================================================================
// Reactions
// ============================================================================

#[tokio::test]
async fn test_reactions_reach_others_but_not_sender() {
    let hub = InMemoryRelayHub::new();
    let meeting = random_meeting_id();

    let mut alice = TestParticipant::new("alice").join(&hub, &meeting).await;
    let mut bob = TestParticipant::new("bob").join(&hub, &meeting).await;
    wait_connected(&alice, "bob").await;
    alice.drain_events();

    alice.handle.send_reaction("🎉").await.unwrap();

    let event = bob
        .wait_for_event(|e| matches!(e, SessionEvent::ReactionReceived { .. }))
        .await;
    assert_eq!(
        event,
        SessionEvent::ReactionReceived {
            from: "alice".to_string(),
            emoji: "🎉".to_string(),
        }
    );

    settle().await;
    assert!(!alice
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::ReactionReceived { .. })));
}
