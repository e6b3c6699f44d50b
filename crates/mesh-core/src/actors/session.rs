//! `SessionActor` - one per open meeting view.
//!
//! The `SessionActor`:
//! - Acquires local media before touching the relay (failure is fatal to join)
//! - Joins presence and owns the roster
//! - Supervises one `PeerLinkActor` per remote participant
//! - Routes inbound handshake messages to the right link
//! - Reports participant, stream and connection changes to the UI
//!
//! # Link ownership
//!
//! Links live in a map keyed by remote user id, so there is at most one link
//! per remote participant. Replacing a link closes the old one first. Every
//! link carries a generation number and events from older generations are
//! ignored. Inbound answers and candidates are matched on the negotiation id
//! of the current link, so replies to an offer made by a closed link never
//! reach its replacement.
//!
//! # Initiator selection
//!
//! Exactly one side of a pair should send the first offer. The configured
//! [`InitiatorPolicy`] picks it; when both sides offer anyway (glare), the
//! participant with the lower user id keeps its offer and the other side
//! answers.

use crate::config::{InitiatorPolicy, MeshConfig};
use crate::errors::{MediaAccessError, MeshError};
use crate::media::{
    IceCandidate, LocalMedia, MediaConstraints, MediaSource, RemoteStream, SessionDescription,
    TrackKind, TransportConfig, TransportFactory, TransportState,
};
use crate::negotiation::NegotiationState;
use crate::observability::metrics;
use crate::presence::{DiscoverySource, PresenceEvent, PresenceTracker};
use crate::relay::{PresenceIdentity, RelayChannel, RelayEvent};
use crate::signaling::{HandshakeKind, HandshakeMessage, HandshakePayload, SignalingRouter};

use super::link::{LinkContext, LinkParams, PeerLinkActor, PeerLinkHandle};
use super::messages::{
    ConnectionState, LinkEvent, LinkEventKind, LinkRole, LinkSummary, ParticipantInfo,
    SessionEvent, SessionMessage, SessionState, SessionStatus,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Relay broadcast event carrying ephemeral reactions.
pub const REACTION_EVENT: &str = "reaction";

#[derive(Debug, Serialize, Deserialize)]
struct ReactionPayload {
    from: String,
    emoji: String,
}

/// What the local participant brings to a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub identity: PresenceIdentity,
    pub config: MeshConfig,
    pub constraints: MediaConstraints,
}

impl SessionParams {
    /// Parameters with default media constraints (camera and microphone).
    #[must_use]
    pub fn new(identity: PresenceIdentity, config: MeshConfig) -> Self {
        Self {
            identity,
            config,
            constraints: MediaConstraints::default(),
        }
    }
}

/// External collaborators consumed by a session.
#[derive(Clone)]
pub struct SessionDeps {
    /// Relay channel already bound to the meeting.
    pub relay: Arc<dyn RelayChannel>,
    pub media_source: Arc<dyn MediaSource>,
    pub transports: Arc<dyn TransportFactory>,
}

/// Handle to a `SessionActor`.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    status: watch::Receiver<SessionStatus>,
    self_id: String,
    meeting_id: String,
}

impl SessionHandle {
    #[must_use]
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    #[must_use]
    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Wait until the session has either joined or given up.
    ///
    /// # Errors
    ///
    /// `MeshError::MediaAcquisition` when local media was unavailable,
    /// `MeshError::Relay` when presence could not be joined, and
    /// `MeshError::SessionClosed` when the session was left first.
    pub async fn joined(&self) -> Result<(), MeshError> {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|s| *s != SessionStatus::Starting)
            .await
            .map(|s| s.clone())
            .unwrap_or(SessionStatus::Closed);

        match settled {
            SessionStatus::Active => Ok(()),
            SessionStatus::MediaUnavailable(e) => Err(MeshError::MediaAcquisition(e)),
            SessionStatus::RelayUnavailable(reason) => Err(MeshError::Relay(reason)),
            SessionStatus::Starting | SessionStatus::Closed => Err(MeshError::SessionClosed),
        }
    }

    /// Enable or disable local video. Never produces signaling traffic.
    pub async fn toggle_local_video(&self, enabled: bool) -> Result<(), MeshError> {
        self.set_local_track(TrackKind::Video, enabled).await
    }

    /// Enable or disable local audio. Never produces signaling traffic.
    pub async fn toggle_local_audio(&self, enabled: bool) -> Result<(), MeshError> {
        self.set_local_track(TrackKind::Audio, enabled).await
    }

    async fn set_local_track(&self, kind: TrackKind, enabled: bool) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::SetLocalTrack {
                kind,
                enabled,
                respond_to: tx,
            })
            .await
            .map_err(|_| MeshError::SessionClosed)?;

        rx.await.map_err(|_| MeshError::SessionClosed)
    }

    /// Broadcast an ephemeral reaction to everyone else in the meeting.
    pub async fn send_reaction(&self, emoji: impl Into<String>) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::SendReaction {
                emoji: emoji.into(),
                respond_to: tx,
            })
            .await
            .map_err(|_| MeshError::SessionClosed)?;

        rx.await.map_err(|_| MeshError::SessionClosed)?
    }

    /// Snapshot of roster, links and local media flags.
    pub async fn state(&self) -> Result<SessionState, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| MeshError::SessionClosed)?;

        rx.await.map_err(|_| MeshError::SessionClosed)
    }

    /// Leave the meeting and wait for teardown to finish.
    ///
    /// Safe to call repeatedly and before the session finished joining.
    pub async fn leave(&self) -> Result<(), MeshError> {
        self.cancel_token.cancel();

        let mut status = self.status.clone();
        // An error means the actor is gone, which is as left as it gets.
        let _ = status.wait_for(SessionStatus::is_finished).await;
        Ok(())
    }

    /// Check if leave has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// How a new link opens the handshake.
enum LinkOpening {
    /// Send a fresh offer.
    Offer,
    /// Answer a remote offer.
    Answer {
        negotiation_id: String,
        offer: SessionDescription,
    },
}

/// Remote candidate held until a link for its negotiation exists.
struct EarlyCandidate {
    negotiation_id: String,
    candidate: IceCandidate,
}

/// Managed link state.
struct ManagedLink {
    handle: PeerLinkHandle,
    task_handle: JoinHandle<()>,
    role: LinkRole,
    created_at: Instant,
    stream: Option<RemoteStream>,
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    /// Distinguishes repeated sessions of the same user in logs.
    session_id: Uuid,
    meeting_id: String,
    identity: PresenceIdentity,
    config: MeshConfig,
    constraints: MediaConstraints,
    deps: SessionDeps,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    status: watch::Sender<SessionStatus>,
    events: mpsc::UnboundedSender<SessionEvent>,
    router: Arc<SignalingRouter>,
    handshake_tx: mpsc::UnboundedSender<HandshakeMessage>,
    handshakes: mpsc::UnboundedReceiver<HandshakeMessage>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    presence: PresenceTracker,
    local_media: Option<Arc<LocalMedia>>,
    audio_enabled: bool,
    video_enabled: bool,
    /// Roster by user id.
    participants: HashMap<String, ParticipantInfo>,
    /// Live links by remote user id.
    links: HashMap<String, ManagedLink>,
    /// Remote candidates not matching any current link, by sender.
    early_candidates: HashMap<String, Vec<EarlyCandidate>>,
    /// Recreate attempts per participant since the last successful connection.
    retries: HashMap<String, u32>,
    next_generation: u64,
    relay_connected: bool,
    subscribed: bool,
    tracked: bool,
}

impl SessionActor {
    /// Spawn a session actor. Joining proceeds in the background; use
    /// [`SessionHandle::joined`] to wait for the outcome.
    ///
    /// Returns a handle, the UI event stream and the task join handle.
    pub fn spawn(
        params: SessionParams,
        deps: SessionDeps,
        cancel_token: CancellationToken,
    ) -> (
        SessionHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
        JoinHandle<()>,
    ) {
        let (sender, receiver) = mpsc::channel(params.config.session_mailbox.max(1));
        let (status_tx, status_rx) = watch::channel(SessionStatus::Starting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshakes) = mpsc::unbounded_channel();
        let (link_events_tx, link_events) = mpsc::unbounded_channel();

        let self_id = params.identity.user_id.clone();
        let meeting_id = deps.relay.meeting_id().to_string();
        let router = Arc::new(SignalingRouter::new(
            self_id.clone(),
            Arc::clone(&deps.relay),
        ));

        let actor = Self {
            session_id: Uuid::new_v4(),
            meeting_id: meeting_id.clone(),
            presence: PresenceTracker::new(self_id.clone()),
            identity: params.identity,
            config: params.config,
            constraints: params.constraints,
            deps,
            receiver,
            cancel_token: cancel_token.clone(),
            status: status_tx,
            events: events_tx,
            router,
            handshake_tx,
            handshakes,
            link_events_tx,
            link_events,
            local_media: None,
            audio_enabled: true,
            video_enabled: true,
            participants: HashMap::new(),
            links: HashMap::new(),
            early_candidates: HashMap::new(),
            retries: HashMap::new(),
            next_generation: 0,
            relay_connected: false,
            subscribed: false,
            tracked: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            cancel_token,
            status: status_rx,
            self_id,
            meeting_id,
        };

        (handle, events_rx, task_handle)
    }

    /// Spawn a session and wait until it has joined.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::MediaAcquisition` when the camera or microphone
    /// could not be acquired; no relay traffic has happened in that case.
    pub async fn start(
        params: SessionParams,
        deps: SessionDeps,
        cancel_token: CancellationToken,
    ) -> Result<
        (
            SessionHandle,
            mpsc::UnboundedReceiver<SessionEvent>,
            JoinHandle<()>,
        ),
        MeshError,
    > {
        let (handle, events, task_handle) = Self::spawn(params, deps, cancel_token);
        handle.joined().await?;
        Ok((handle, events, task_handle))
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "mesh.actor.session",
        fields(
            session_id = %self.session_id,
            meeting_id = %self.meeting_id,
            user_id = %self.identity.user_id
        )
    )]
    async fn run(mut self) {
        info!(
            target: "mesh.session",
            meeting_id = %self.meeting_id,
            user_id = %self.identity.user_id,
            "SessionActor started"
        );

        let mut relay_events = match self.initialize().await {
            Ok(events) => events,
            Err(e) => {
                let status = match &e {
                    MeshError::MediaAcquisition(err) => SessionStatus::MediaUnavailable(err.clone()),
                    MeshError::SessionClosed => SessionStatus::Closed,
                    other => SessionStatus::RelayUnavailable(other.to_string()),
                };
                if status == SessionStatus::Closed {
                    info!(
                        target: "mesh.session",
                        meeting_id = %self.meeting_id,
                        "Session left before joining completed"
                    );
                } else {
                    warn!(
                        target: "mesh.session",
                        meeting_id = %self.meeting_id,
                        error = %e,
                        "Session failed to join"
                    );
                }
                self.teardown().await;
                self.status.send_replace(status);
                return;
            }
        };

        self.status.send_replace(SessionStatus::Active);

        loop {
            tokio::select! {
                // Handle cancellation (leave)
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "mesh.session",
                        meeting_id = %self.meeting_id,
                        "SessionActor received cancellation signal"
                    );
                    break;
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(
                                target: "mesh.session",
                                meeting_id = %self.meeting_id,
                                "SessionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }

                // Handle relay traffic
                Some(event) = relay_events.recv() => {
                    self.handle_relay_event(event).await;
                }

                // Handle link notifications
                Some(event) = self.link_events.recv() => {
                    self.handle_link_event(event).await;
                }
            }
        }

        self.teardown().await;
        self.status.send_replace(SessionStatus::Closed);

        info!(
            target: "mesh.session",
            meeting_id = %self.meeting_id,
            user_id = %self.identity.user_id,
            "SessionActor stopped"
        );
    }

    /// Acquire media, wire signaling handlers, then join presence.
    async fn initialize(&mut self) -> Result<mpsc::UnboundedReceiver<RelayEvent>, MeshError> {
        let acquired = tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => return Err(MeshError::SessionClosed),
            result = self.deps.media_source.acquire(self.constraints) => result,
        };
        let media = match acquired {
            Ok(media) => media,
            Err(e) => {
                metrics::record_media_acquisition_failure(media_failure_reason(&e));
                return Err(e.into());
            }
        };

        media.set_kind_enabled(TrackKind::Audio, self.audio_enabled);
        media.set_kind_enabled(TrackKind::Video, self.video_enabled);
        info!(
            target: "mesh.session",
            stream_id = %media.stream_id(),
            tracks = media.tracks().len(),
            "Local media acquired"
        );
        self.local_media = Some(Arc::new(media));

        for kind in [
            HandshakeKind::Offer,
            HandshakeKind::Answer,
            HandshakeKind::IceCandidate,
        ] {
            let tx = self.handshake_tx.clone();
            self.router.on_message(kind, move |message| {
                let _ = tx.send(message);
            });
        }

        self.subscribed = true;
        self.tracked = true;
        let relay = Arc::clone(&self.deps.relay);
        let events = tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => return Err(MeshError::SessionClosed),
            result = self.presence.join(relay.as_ref(), self.identity.clone()) => result?,
        };

        self.set_relay_connected(true);
        Ok(events)
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::SetLocalTrack {
                kind,
                enabled,
                respond_to,
            } => {
                self.set_local_track(kind, enabled);
                let _ = respond_to.send(());
            }

            SessionMessage::SendReaction { emoji, respond_to } => {
                let result = self.send_reaction(emoji).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    fn set_local_track(&mut self, kind: TrackKind, enabled: bool) {
        match kind {
            TrackKind::Audio => self.audio_enabled = enabled,
            TrackKind::Video => self.video_enabled = enabled,
        }
        let touched = self
            .local_media
            .as_ref()
            .map_or(0, |media| media.set_kind_enabled(kind, enabled));

        debug!(
            target: "mesh.session",
            kind = kind.as_str(),
            enabled = enabled,
            tracks = touched,
            "Local track toggled"
        );
    }

    async fn send_reaction(&self, emoji: String) -> Result<(), MeshError> {
        let payload = serde_json::to_value(ReactionPayload {
            from: self.identity.user_id.clone(),
            emoji,
        })?;
        self.deps.relay.broadcast(REACTION_EVENT, payload).await
    }

    fn snapshot(&self) -> SessionState {
        let participants: Vec<ParticipantInfo> = self
            .presence
            .roster()
            .iter()
            .filter_map(|identity| self.participants.get(&identity.user_id).cloned())
            .collect();

        let mut links: Vec<LinkSummary> = self
            .links
            .iter()
            .map(|(user_id, managed)| LinkSummary {
                remote_user_id: user_id.clone(),
                role: managed.role,
                generation: managed.handle.generation(),
                state: managed.handle.state(),
            })
            .collect();
        links.sort_by(|a, b| a.remote_user_id.cmp(&b.remote_user_id));

        SessionState {
            meeting_id: self.meeting_id.clone(),
            self_id: self.identity.user_id.clone(),
            participants,
            links,
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            relay_connected: self.relay_connected,
        }
    }

    // ------------------------------------------------------------------------
    // Relay events
    // ------------------------------------------------------------------------

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::PresenceSync(snapshot) => {
                self.set_relay_connected(true);
                let events = self.presence.handle_sync(snapshot);
                self.apply_presence(events).await;
            }
            RelayEvent::PresenceJoin(identities) => {
                let events = self.presence.handle_join(identities);
                self.apply_presence(events).await;
            }
            RelayEvent::PresenceLeave(identities) => {
                let events = self.presence.handle_leave(identities);
                self.apply_presence(events).await;
            }
            RelayEvent::Broadcast { event, payload } => {
                self.handle_broadcast(&event, &payload).await;
            }
            RelayEvent::Disconnected => {
                self.set_relay_connected(false);
            }
            RelayEvent::Reconnected => {
                self.set_relay_connected(true);
                if let Err(e) = self.deps.relay.track(self.identity.clone()).await {
                    warn!(
                        target: "mesh.session",
                        meeting_id = %self.meeting_id,
                        error = %e,
                        "Failed to republish presence after reconnect"
                    );
                }
            }
        }
    }

    fn set_relay_connected(&mut self, connected: bool) {
        if self.relay_connected == connected {
            return;
        }
        self.relay_connected = connected;
        metrics::set_relay_connected(connected);

        if connected {
            info!(target: "mesh.session", meeting_id = %self.meeting_id, "Relay connected");
        } else {
            warn!(
                target: "mesh.session",
                meeting_id = %self.meeting_id,
                links = self.links.len(),
                "Relay disconnected, existing links keep running"
            );
        }
        self.emit(SessionEvent::RelayConnectivityChanged { connected });
    }

    async fn apply_presence(&mut self, events: Vec<PresenceEvent>) {
        for event in events {
            match event {
                PresenceEvent::Discovered { identity, source } => {
                    self.on_discovered(identity, source);
                }
                PresenceEvent::Removed { user_id } => {
                    self.on_removed(&user_id).await;
                }
            }
        }
    }

    fn on_discovered(&mut self, identity: PresenceIdentity, source: DiscoverySource) {
        let user_id = identity.user_id;
        let existing = self.links.get(&user_id);
        let has_link = existing.is_some();
        let info = ParticipantInfo {
            user_id: user_id.clone(),
            display_name: identity.display_name,
            discovered_via: source,
            stream: existing.and_then(|link| link.stream.clone()),
            connection_state: if has_link {
                ConnectionState::Connecting
            } else {
                ConnectionState::Discovered
            },
        };

        self.participants.insert(user_id.clone(), info.clone());
        self.retries.remove(&user_id);

        info!(
            target: "mesh.session",
            meeting_id = %self.meeting_id,
            remote_user_id = %user_id,
            source = ?source,
            "Participant discovered"
        );
        self.emit(SessionEvent::ParticipantJoined(info));

        if !has_link && self.should_initiate(&user_id, source) {
            self.create_link(&user_id, LinkOpening::Offer);
        }
    }

    async fn on_removed(&mut self, user_id: &str) {
        self.close_link(user_id).await;
        self.early_candidates.remove(user_id);
        self.retries.remove(user_id);

        if self.participants.remove(user_id).is_some() {
            info!(
                target: "mesh.session",
                meeting_id = %self.meeting_id,
                remote_user_id = %user_id,
                "Participant left"
            );
            self.emit(SessionEvent::ParticipantLeft {
                user_id: user_id.to_string(),
            });
        }
    }

    fn should_initiate(&self, remote_user_id: &str, source: DiscoverySource) -> bool {
        match self.config.initiator_policy {
            InitiatorPolicy::LowerIdInitiates => self.identity.user_id.as_str() < remote_user_id,
            InitiatorPolicy::Newcomer => source == DiscoverySource::Sync,
        }
    }

    async fn handle_broadcast(&mut self, event: &str, payload: &serde_json::Value) {
        if event == REACTION_EVENT {
            self.handle_reaction(payload);
            return;
        }

        self.router.dispatch(event, payload);

        // Handlers only enqueue; process in relay order.
        while let Ok(message) = self.handshakes.try_recv() {
            self.handle_handshake(message).await;
        }
    }

    fn handle_reaction(&self, payload: &serde_json::Value) {
        match serde_json::from_value::<ReactionPayload>(payload.clone()) {
            Ok(reaction) if reaction.from == self.identity.user_id => {}
            Ok(reaction) => self.emit(SessionEvent::ReactionReceived {
                from: reaction.from,
                emoji: reaction.emoji,
            }),
            Err(e) => {
                warn!(
                    target: "mesh.session",
                    error = %e,
                    "Malformed reaction"
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Handshake routing
    // ------------------------------------------------------------------------

    async fn handle_handshake(&mut self, message: HandshakeMessage) {
        let from = message.from;
        let negotiation_id = message.negotiation_id;
        match (message.kind, message.payload) {
            (HandshakeKind::Offer, HandshakePayload::Description(offer)) => {
                self.handle_offer(from, negotiation_id, offer).await;
            }
            (HandshakeKind::Answer, HandshakePayload::Description(answer)) => {
                self.handle_answer(&from, &negotiation_id, answer).await;
            }
            (HandshakeKind::IceCandidate, HandshakePayload::Candidate(candidate)) => {
                self.handle_remote_candidate(from, negotiation_id, candidate)
                    .await;
            }
            // The router only delivers payloads that match their kind.
            _ => {}
        }
    }

    async fn handle_offer(
        &mut self,
        from: String,
        negotiation_id: String,
        offer: SessionDescription,
    ) {
        let Some(existing) = self.links.get(&from) else {
            self.create_link(
                &from,
                LinkOpening::Answer {
                    negotiation_id,
                    offer,
                },
            );
            return;
        };

        if existing.handle.negotiation_id() == negotiation_id {
            debug!(
                target: "mesh.session",
                remote_user_id = %from,
                "Duplicate offer ignored"
            );
            metrics::record_handshake_dropped("stale");
            return;
        }

        let state = existing.handle.state();
        let glare = existing.role == LinkRole::Initiator
            && matches!(
                state,
                NegotiationState::New | NegotiationState::HaveLocalOffer
            );

        if glare && self.identity.user_id < from {
            info!(
                target: "mesh.session",
                remote_user_id = %from,
                "Offer collision, keeping local offer"
            );
            metrics::record_handshake_dropped("glare");
            return;
        }

        if glare {
            info!(
                target: "mesh.session",
                remote_user_id = %from,
                "Offer collision, answering remote offer"
            );
            metrics::record_negotiation("superseded");
        } else {
            debug!(
                target: "mesh.session",
                remote_user_id = %from,
                state = state.as_str(),
                "Remote renegotiation, replacing link"
            );
        }

        self.close_link(&from).await;
        self.create_link(
            &from,
            LinkOpening::Answer {
                negotiation_id,
                offer,
            },
        );
    }

    async fn handle_answer(
        &mut self,
        from: &str,
        negotiation_id: &str,
        answer: SessionDescription,
    ) {
        match self.links.get(from) {
            Some(link) if link.handle.negotiation_id() != negotiation_id => {
                debug!(
                    target: "mesh.session",
                    remote_user_id = %from,
                    generation = link.handle.generation(),
                    "Answer for another negotiation ignored"
                );
                metrics::record_handshake_dropped("stale");
            }
            Some(link) if link.role == LinkRole::Initiator => {
                if let Err(e) = link.handle.remote_answer(answer).await {
                    debug!(
                        target: "mesh.session",
                        remote_user_id = %from,
                        error = %e,
                        "Answer not delivered to link"
                    );
                }
            }
            Some(_) => {
                debug!(
                    target: "mesh.session",
                    remote_user_id = %from,
                    "Answer for a responder link ignored"
                );
                metrics::record_handshake_dropped("stale");
            }
            None => {
                debug!(
                    target: "mesh.session",
                    remote_user_id = %from,
                    "Answer with no link ignored"
                );
                metrics::record_handshake_dropped("no_link");
            }
        }
    }

    /// Deliver a candidate to the link negotiating its offer. Candidates for
    /// any other offer are held: the offer may still be on its way.
    async fn handle_remote_candidate(
        &mut self,
        from: String,
        negotiation_id: String,
        candidate: IceCandidate,
    ) {
        if let Some(link) = self
            .links
            .get(&from)
            .filter(|link| link.handle.negotiation_id() == negotiation_id)
        {
            if let Err(e) = link.handle.remote_candidate(candidate).await {
                debug!(
                    target: "mesh.session",
                    remote_user_id = %from,
                    error = %e,
                    "Candidate not delivered to link"
                );
            }
            return;
        }

        let queue = self.early_candidates.entry(from).or_default();
        if queue.len() >= self.config.early_candidate_limit {
            metrics::record_handshake_dropped("overflow");
            return;
        }
        queue.push(EarlyCandidate {
            negotiation_id,
            candidate,
        });
    }

    // ------------------------------------------------------------------------
    // Link lifecycle
    // ------------------------------------------------------------------------

    /// Create a link, replacing any existing one for the same participant.
    fn create_link(&mut self, remote_user_id: &str, opening: LinkOpening) {
        let Some(local_media) = self.local_media.clone() else {
            return;
        };
        let (role, negotiation_id, offer) = match opening {
            LinkOpening::Offer => (LinkRole::Initiator, Uuid::new_v4().to_string(), None),
            LinkOpening::Answer {
                negotiation_id,
                offer,
            } => (LinkRole::Responder, negotiation_id, Some(offer)),
        };

        if let Some(previous) = self.links.remove(remote_user_id) {
            previous.handle.close();
        }

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport_config = TransportConfig {
            ice_servers: self.config.ice_servers.clone(),
        };
        let transport = match self
            .deps
            .transports
            .create(remote_user_id, &transport_config, transport_tx)
        {
            Ok(transport) => transport,
            Err(e) => {
                self.on_link_failed(remote_user_id, role, &e.to_string());
                return;
            }
        };

        let held = self
            .early_candidates
            .remove(remote_user_id)
            .unwrap_or_default();
        let held_count = held.len();
        let early_candidates: Vec<IceCandidate> = held
            .into_iter()
            .filter(|early| early.negotiation_id == negotiation_id)
            .map(|early| early.candidate)
            .collect();
        for _ in early_candidates.len()..held_count {
            metrics::record_handshake_dropped("stale");
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let params = LinkParams {
            remote_user_id: remote_user_id.to_string(),
            role,
            generation,
            negotiation_id,
            remote_offer: offer,
            early_candidates,
            mailbox: self.config.link_mailbox,
        };
        let context = LinkContext {
            local_media,
            router: Arc::clone(&self.router),
            events: self.link_events_tx.clone(),
        };

        let (handle, task_handle) = PeerLinkActor::spawn(
            params,
            transport,
            transport_rx,
            context,
            self.cancel_token.child_token(),
        );

        self.links.insert(
            remote_user_id.to_string(),
            ManagedLink {
                handle,
                task_handle,
                role,
                created_at: Instant::now(),
                stream: None,
            },
        );
        metrics::set_peer_links_active(self.links.len());

        debug!(
            target: "mesh.session",
            remote_user_id = %remote_user_id,
            role = role.as_str(),
            generation = generation,
            "Peer link created"
        );

        if let Some(participant) = self.participants.get_mut(remote_user_id) {
            participant.stream = None;
        }
        self.set_connection_state(remote_user_id, ConnectionState::Connecting);
    }

    /// Close a link and wait briefly for its transport to be released.
    async fn close_link(&mut self, remote_user_id: &str) {
        let Some(managed) = self.links.remove(remote_user_id) else {
            return;
        };
        managed.handle.close();
        metrics::set_peer_links_active(self.links.len());

        match tokio::time::timeout(self.config.link_shutdown_timeout, managed.task_handle).await {
            Ok(Ok(())) => {
                debug!(
                    target: "mesh.session",
                    remote_user_id = %remote_user_id,
                    "Peer link closed"
                );
            }
            Ok(Err(e)) => {
                warn!(
                    target: "mesh.session",
                    remote_user_id = %remote_user_id,
                    error = ?e,
                    "Peer link task panicked"
                );
            }
            Err(_) => {
                warn!(
                    target: "mesh.session",
                    remote_user_id = %remote_user_id,
                    "Peer link close timed out"
                );
            }
        }
    }

    /// Retry an initiator link up to the configured limit, otherwise mark the
    /// participant failed.
    fn on_link_failed(&mut self, remote_user_id: &str, role: LinkRole, reason: &str) {
        if let Some(failed) = self.links.remove(remote_user_id) {
            failed.handle.close();
        }
        metrics::set_peer_links_active(self.links.len());

        if !self.presence.contains(remote_user_id) {
            debug!(
                target: "mesh.session",
                remote_user_id = %remote_user_id,
                reason = %reason,
                "Link failed for a participant no longer present"
            );
            metrics::record_link_failure("given_up");
            return;
        }

        let attempts = self.retries.entry(remote_user_id.to_string()).or_insert(0);
        if role == LinkRole::Initiator && *attempts < self.config.max_link_retries {
            *attempts += 1;
            warn!(
                target: "mesh.session",
                remote_user_id = %remote_user_id,
                attempt = *attempts,
                reason = %reason,
                "Peer link failed, recreating"
            );
            metrics::record_link_failure("retried");
            self.create_link(remote_user_id, LinkOpening::Offer);
            return;
        }

        warn!(
            target: "mesh.session",
            remote_user_id = %remote_user_id,
            role = role.as_str(),
            reason = %reason,
            "Peer link failed, giving up"
        );
        metrics::record_link_failure("given_up");
        metrics::record_negotiation("failed");

        self.set_connection_state(remote_user_id, ConnectionState::Failed);
        self.emit(SessionEvent::ParticipantFailed {
            user_id: remote_user_id.to_string(),
            reason: reason.to_string(),
        });
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        let user_id = event.remote_user_id;
        let Some(link) = self.links.get_mut(&user_id) else {
            debug!(
                target: "mesh.session",
                remote_user_id = %user_id,
                generation = event.generation,
                "Event from a closed link ignored"
            );
            return;
        };
        if link.handle.generation() != event.generation {
            debug!(
                target: "mesh.session",
                remote_user_id = %user_id,
                generation = event.generation,
                current = link.handle.generation(),
                "Event from a replaced link ignored"
            );
            return;
        }

        match event.kind {
            LinkEventKind::StateChanged(state) => {
                if state == NegotiationState::Stable {
                    metrics::record_negotiation("completed");
                    info!(
                        target: "mesh.session",
                        remote_user_id = %user_id,
                        role = link.role.as_str(),
                        "Negotiation complete"
                    );
                }
            }

            LinkEventKind::StreamAttached(stream) => {
                link.stream = Some(stream.clone());
                if let Some(participant) = self.participants.get_mut(&user_id) {
                    participant.stream = Some(stream.clone());
                }
                self.emit(SessionEvent::StreamAttached { user_id, stream });
            }

            LinkEventKind::ConnectionStateChanged(transport_state) => {
                let state = match transport_state {
                    TransportState::New | TransportState::Connecting => ConnectionState::Connecting,
                    TransportState::Connected => {
                        metrics::record_negotiation_duration(link.created_at.elapsed());
                        self.retries.remove(&user_id);
                        ConnectionState::Connected
                    }
                    TransportState::Disconnected => ConnectionState::Disconnected,
                    // Failure arrives as its own event; closing is ours.
                    TransportState::Failed | TransportState::Closed => return,
                };
                self.set_connection_state(&user_id, state);
            }

            LinkEventKind::Failed { reason } => {
                let role = link.role;
                self.on_link_failed(&user_id, role, &reason);
            }
        }
    }

    fn set_connection_state(&mut self, user_id: &str, state: ConnectionState) {
        let Some(participant) = self.participants.get_mut(user_id) else {
            return;
        };
        if participant.connection_state == state {
            return;
        }
        participant.connection_state = state;
        self.emit(SessionEvent::ConnectionStateChanged {
            user_id: user_id.to_string(),
            state,
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Close every link, release media and leave presence.
    async fn teardown(&mut self) {
        info!(
            target: "mesh.session",
            meeting_id = %self.meeting_id,
            participants = self.participants.len(),
            links = self.links.len(),
            "Performing graceful shutdown"
        );

        // Cancel all links first so they shut down concurrently
        for managed in self.links.values() {
            managed.handle.close();
        }

        for (user_id, managed) in self.links.drain() {
            match tokio::time::timeout(self.config.link_shutdown_timeout, managed.task_handle).await
            {
                Ok(Ok(())) => {
                    debug!(
                        target: "mesh.session",
                        remote_user_id = %user_id,
                        "Peer link completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "mesh.session",
                        remote_user_id = %user_id,
                        error = ?e,
                        "Peer link task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "mesh.session",
                        remote_user_id = %user_id,
                        "Peer link shutdown timed out"
                    );
                }
            }
        }
        metrics::set_peer_links_active(0);
        self.early_candidates.clear();

        if let Some(media) = &self.local_media {
            media.stop_all();
        }

        if self.tracked {
            self.tracked = false;
            if let Err(e) = self.deps.relay.untrack().await {
                warn!(
                    target: "mesh.session",
                    meeting_id = %self.meeting_id,
                    error = %e,
                    "Failed to remove presence"
                );
            }
        }
        if self.subscribed {
            self.subscribed = false;
            if let Err(e) = self.deps.relay.unsubscribe().await {
                warn!(
                    target: "mesh.session",
                    meeting_id = %self.meeting_id,
                    error = %e,
                    "Failed to unsubscribe from relay"
                );
            }
        }

        self.presence.clear();
        self.participants.clear();
        if self.relay_connected {
            self.relay_connected = false;
            metrics::set_relay_connected(false);
        }

        info!(
            target: "mesh.session",
            meeting_id = %self.meeting_id,
            "Graceful shutdown complete"
        );
    }
}

fn media_failure_reason(error: &MediaAccessError) -> &'static str {
    match error {
        MediaAccessError::PermissionDenied => "permission_denied",
        MediaAccessError::DeviceNotFound(_) => "device_not_found",
        MediaAccessError::DeviceUnavailable(_) => "device_unavailable",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_media_failure_reasons_are_bounded() {
        assert_eq!(
            media_failure_reason(&MediaAccessError::PermissionDenied),
            "permission_denied"
        );
        assert_eq!(
            media_failure_reason(&MediaAccessError::DeviceNotFound("camera".to_string())),
            "device_not_found"
        );
        assert_eq!(
            media_failure_reason(&MediaAccessError::DeviceUnavailable("busy".to_string())),
            "device_unavailable"
        );
    }

    #[test]
    fn test_reaction_wire_format() {
        let payload = serde_json::to_value(ReactionPayload {
            from: "alice".to_string(),
            emoji: "👍".to_string(),
        })
        .unwrap();
        assert_eq!(payload["from"], "alice");
        assert_eq!(payload["emoji"], "👍");
    }

    #[test]
    fn test_session_params_default_constraints() {
        let params = SessionParams::new(
            PresenceIdentity::new("alice", "Alice"),
            MeshConfig::default(),
        );
        assert_eq!(params.constraints, MediaConstraints::default());
        assert!(params.constraints.audio && params.constraints.video);
    }
}
