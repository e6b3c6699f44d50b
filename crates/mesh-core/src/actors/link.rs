//! `PeerLinkActor` - per-remote-participant transport negotiator.
//!
//! Each `PeerLinkActor`:
//! - Owns exactly one `MediaTransport` and its negotiation state
//! - Attaches every local track at construction, on both roles
//! - Sends its offer (initiator) or answers the remote offer (responder)
//! - Forwards local candidates immediately and queues remote candidates
//!   until a remote description is applied
//!
//! # Lifecycle
//!
//! 1. Spawned by the `SessionActor` with a child cancellation token
//! 2. Runs until cancelled, or until negotiation or the transport fails
//! 3. Closes its transport exactly once on exit and ends in `Closed`
//!
//! Every handshake message the link sends carries its negotiation id: minted
//! by the session for an initiator, taken from the remote offer for a
//! responder.
//!
//! Every transport await races the cancellation token, so a completion that
//! resolves after `close()` is discarded.

use crate::errors::{MeshError, TransitionError};
use crate::media::{
    IceCandidate, LocalMedia, MediaTransport, SessionDescription, TransportEvent, TransportState,
};
use crate::negotiation::{NegotiationInput, NegotiationState};
use crate::observability::metrics;
use crate::signaling::{HandshakeKind, HandshakePayload, SignalingRouter};

use super::messages::{LinkEvent, LinkEventKind, LinkMessage, LinkRole};

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handle to a `PeerLinkActor`.
#[derive(Clone, Debug)]
pub struct PeerLinkHandle {
    sender: mpsc::Sender<LinkMessage>,
    cancel_token: CancellationToken,
    state: watch::Receiver<NegotiationState>,
    remote_user_id: String,
    generation: u64,
    negotiation_id: String,
}

impl PeerLinkHandle {
    #[must_use]
    pub fn remote_user_id(&self) -> &str {
        &self.remote_user_id
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Offer this link negotiates. Answers and candidates carrying another
    /// id belong to a different link.
    #[must_use]
    pub fn negotiation_id(&self) -> &str {
        &self.negotiation_id
    }

    /// Current negotiation state. `Closed` once the actor has shut down,
    /// whether or not it failed first.
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    /// Deliver the remote answer. A no-op once the link is closed.
    pub async fn remote_answer(&self, answer: SessionDescription) -> Result<(), MeshError> {
        self.deliver(LinkMessage::RemoteAnswer { answer }).await
    }

    /// Deliver a remote candidate. A no-op once the link is closed.
    pub async fn remote_candidate(&self, candidate: IceCandidate) -> Result<(), MeshError> {
        self.deliver(LinkMessage::RemoteCandidate { candidate }).await
    }

    async fn deliver(&self, message: LinkMessage) -> Result<(), MeshError> {
        if self.cancel_token.is_cancelled() {
            return Ok(());
        }
        self.sender
            .send(message)
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))
    }

    /// Close the link. Idempotent.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the link has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Construction parameters for a link.
#[derive(Debug)]
pub struct LinkParams {
    pub remote_user_id: String,
    pub role: LinkRole,
    pub generation: u64,
    /// Offer id: fresh for an initiator, the remote offer's for a responder.
    pub negotiation_id: String,
    /// Offer that triggered a responder link.
    pub remote_offer: Option<SessionDescription>,
    /// Remote candidates that arrived before the link existed.
    pub early_candidates: Vec<IceCandidate>,
    pub mailbox: usize,
}

/// Session-owned collaborators shared by every link.
#[derive(Clone)]
pub struct LinkContext {
    pub local_media: Arc<LocalMedia>,
    pub router: Arc<SignalingRouter>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

/// The `PeerLinkActor` implementation.
pub struct PeerLinkActor {
    remote_user_id: String,
    role: LinkRole,
    generation: u64,
    negotiation_id: String,
    remote_offer: Option<SessionDescription>,
    /// Remote candidates waiting for a remote description, in arrival order.
    pending_candidates: Vec<IceCandidate>,
    transport: Box<dyn MediaTransport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    receiver: mpsc::Receiver<LinkMessage>,
    context: LinkContext,
    cancel_token: CancellationToken,
    state: watch::Sender<NegotiationState>,
    transport_closed: bool,
}

impl PeerLinkActor {
    /// Spawn a new link actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        params: LinkParams,
        transport: Box<dyn MediaTransport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        context: LinkContext,
        cancel_token: CancellationToken,
    ) -> (PeerLinkHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(params.mailbox.max(1));
        let (state_tx, state_rx) = watch::channel(NegotiationState::New);

        let actor = Self {
            remote_user_id: params.remote_user_id.clone(),
            role: params.role,
            generation: params.generation,
            negotiation_id: params.negotiation_id.clone(),
            remote_offer: params.remote_offer,
            pending_candidates: params.early_candidates,
            transport,
            transport_events,
            receiver,
            context,
            cancel_token: cancel_token.clone(),
            state: state_tx,
            transport_closed: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = PeerLinkHandle {
            sender,
            cancel_token,
            state: state_rx,
            remote_user_id: params.remote_user_id,
            generation: params.generation,
            negotiation_id: params.negotiation_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "mesh.actor.link",
        fields(
            remote_user_id = %self.remote_user_id,
            role = self.role.as_str(),
            generation = self.generation
        )
    )]
    async fn run(mut self) {
        debug!(
            target: "mesh.link",
            remote_user_id = %self.remote_user_id,
            role = self.role.as_str(),
            generation = self.generation,
            "PeerLinkActor started"
        );

        let mut running = match self.start().await {
            Ok(()) => true,
            Err(e) => {
                self.fail(&e);
                false
            }
        };

        while running {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "mesh.link",
                        remote_user_id = %self.remote_user_id,
                        "PeerLinkActor received cancellation signal"
                    );
                    running = false;
                }

                // Handle handshake input from the session
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            if let Err(e) = self.handle_message(message).await {
                                self.fail(&e);
                                running = false;
                            }
                        }
                        None => {
                            debug!(
                                target: "mesh.link",
                                remote_user_id = %self.remote_user_id,
                                "PeerLinkActor channel closed, exiting"
                            );
                            running = false;
                        }
                    }
                }

                // Handle transport notifications
                Some(event) = self.transport_events.recv() => {
                    if let Err(e) = self.handle_transport_event(event).await {
                        self.fail(&e);
                        running = false;
                    }
                }
            }
        }

        self.shutdown().await;

        info!(
            target: "mesh.link",
            remote_user_id = %self.remote_user_id,
            generation = self.generation,
            "PeerLinkActor stopped"
        );
    }

    /// Attach local media, then run the opening half of the handshake.
    async fn start(&mut self) -> Result<(), MeshError> {
        for track in self.context.local_media.tracks() {
            guarded(
                &self.cancel_token,
                self.transport.add_track(Arc::clone(track)),
            )
            .await?;
        }

        match self.role {
            LinkRole::Initiator => self.send_offer().await,
            LinkRole::Responder => {
                let offer = self.remote_offer.take().ok_or_else(|| {
                    MeshError::Internal("responder link spawned without an offer".to_string())
                })?;
                self.answer_offer(offer).await
            }
        }
    }

    async fn send_offer(&mut self) -> Result<(), MeshError> {
        let offer = guarded(&self.cancel_token, self.transport.create_offer()).await?;
        guarded(
            &self.cancel_token,
            self.transport.set_local_description(offer.clone()),
        )
        .await?;
        self.transition(NegotiationInput::LocalOffer)?;

        self.context
            .router
            .send(
                HandshakeKind::Offer,
                &self.remote_user_id,
                &self.negotiation_id,
                HandshakePayload::Description(offer),
            )
            .await
    }

    async fn answer_offer(&mut self, offer: SessionDescription) -> Result<(), MeshError> {
        guarded(
            &self.cancel_token,
            self.transport.set_remote_description(offer),
        )
        .await
        .map_err(|e| self.negotiation_error(&e))?;
        self.transition(NegotiationInput::RemoteOffer)?;
        self.flush_candidates().await;

        let answer = guarded(&self.cancel_token, self.transport.create_answer()).await?;
        guarded(
            &self.cancel_token,
            self.transport.set_local_description(answer.clone()),
        )
        .await?;
        self.transition(NegotiationInput::LocalAnswer)?;

        self.context
            .router
            .send(
                HandshakeKind::Answer,
                &self.remote_user_id,
                &self.negotiation_id,
                HandshakePayload::Description(answer),
            )
            .await
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: LinkMessage) -> Result<(), MeshError> {
        match message {
            LinkMessage::RemoteAnswer { answer } => self.handle_answer(answer).await,
            LinkMessage::RemoteCandidate { candidate } => {
                self.handle_candidate(candidate).await;
                Ok(())
            }
        }
    }

    async fn handle_answer(&mut self, answer: SessionDescription) -> Result<(), MeshError> {
        if self.current_state() != NegotiationState::HaveLocalOffer {
            debug!(
                target: "mesh.link",
                remote_user_id = %self.remote_user_id,
                state = self.current_state().as_str(),
                "Ignoring answer outside HaveLocalOffer"
            );
            metrics::record_handshake_dropped("stale");
            return Ok(());
        }

        guarded(
            &self.cancel_token,
            self.transport.set_remote_description(answer),
        )
        .await
        .map_err(|e| self.negotiation_error(&e))?;
        self.transition(NegotiationInput::RemoteAnswer)?;
        self.flush_candidates().await;
        Ok(())
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) {
        if !self.current_state().has_remote_description() {
            debug!(
                target: "mesh.link",
                remote_user_id = %self.remote_user_id,
                queued = self.pending_candidates.len() + 1,
                "Queueing remote candidate until remote description is set"
            );
            self.pending_candidates.push(candidate);
            return;
        }
        self.apply_candidate(candidate).await;
    }

    /// Apply queued remote candidates in arrival order.
    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(
                target: "mesh.link",
                remote_user_id = %self.remote_user_id,
                count = pending.len(),
                "Applying queued remote candidates"
            );
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    /// A rejected candidate does not fail the link; other candidates may still connect.
    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        if let Err(e) = guarded(
            &self.cancel_token,
            self.transport.add_ice_candidate(candidate),
        )
        .await
        {
            if !self.cancel_token.is_cancelled() {
                warn!(
                    target: "mesh.link",
                    remote_user_id = %self.remote_user_id,
                    error = %e,
                    "Remote candidate rejected"
                );
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<(), MeshError> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .context
                    .router
                    .send(
                        HandshakeKind::IceCandidate,
                        &self.remote_user_id,
                        &self.negotiation_id,
                        HandshakePayload::Candidate(candidate),
                    )
                    .await
                {
                    warn!(
                        target: "mesh.link",
                        remote_user_id = %self.remote_user_id,
                        error = %e,
                        "Failed to send local candidate"
                    );
                }
                Ok(())
            }
            TransportEvent::RemoteTrack(stream) => {
                debug!(
                    target: "mesh.link",
                    remote_user_id = %self.remote_user_id,
                    stream_id = %stream.stream_id,
                    "Remote stream attached"
                );
                self.emit(LinkEventKind::StreamAttached(stream));
                Ok(())
            }
            TransportEvent::StateChanged(state) => {
                self.emit(LinkEventKind::ConnectionStateChanged(state));
                if state == TransportState::Failed {
                    return Err(MeshError::Transport("connection failed".to_string()));
                }
                Ok(())
            }
        }
    }

    fn current_state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    fn transition(&mut self, input: NegotiationInput) -> Result<(), MeshError> {
        let from = self.current_state();
        let to = from
            .apply(input)
            .map_err(|e: TransitionError| self.negotiation_error(&MeshError::Internal(e.to_string())))?;
        self.state.send_replace(to);

        debug!(
            target: "mesh.link",
            remote_user_id = %self.remote_user_id,
            from = from.as_str(),
            to = to.as_str(),
            "Negotiation state changed"
        );
        self.emit(LinkEventKind::StateChanged(to));
        Ok(())
    }

    fn negotiation_error(&self, source: &MeshError) -> MeshError {
        match source {
            MeshError::SessionClosed => MeshError::SessionClosed,
            other => MeshError::Negotiation {
                remote_user_id: self.remote_user_id.clone(),
                reason: other.to_string(),
            },
        }
    }

    /// Move to `Failed` and report. Silent when the link was closed.
    fn fail(&mut self, error: &MeshError) {
        if self.cancel_token.is_cancelled() || self.current_state().is_terminal() {
            return;
        }

        warn!(
            target: "mesh.link",
            remote_user_id = %self.remote_user_id,
            generation = self.generation,
            state = self.current_state().as_str(),
            error = %error,
            "Peer link failed"
        );

        if let Err(e) = self.transition(NegotiationInput::Fail) {
            debug!(
                target: "mesh.link",
                remote_user_id = %self.remote_user_id,
                error = %e,
                "Failure transition rejected"
            );
            return;
        }
        self.emit(LinkEventKind::Failed {
            reason: error.to_string(),
        });
    }

    fn emit(&self, kind: LinkEventKind) {
        if self.cancel_token.is_cancelled() {
            return;
        }
        let _ = self.context.events.send(LinkEvent {
            remote_user_id: self.remote_user_id.clone(),
            generation: self.generation,
            kind,
        });
    }

    /// Release the transport exactly once.
    async fn shutdown(&mut self) {
        if !self.transport_closed {
            self.transport_closed = true;
            self.transport.close().await;
        }
        self.pending_candidates.clear();

        if self.current_state() != NegotiationState::Closed {
            // Close is legal from every state.
            let _ = self.transition(NegotiationInput::Close);
        }
    }
}

/// Await a transport operation unless the link is cancelled first.
async fn guarded<T>(
    cancel_token: &CancellationToken,
    operation: impl Future<Output = Result<T, MeshError>>,
) -> Result<T, MeshError> {
    tokio::select! {
        biased;
        () = cancel_token.cancelled() => Err(MeshError::SessionClosed),
        result = operation => result,
    }
}
