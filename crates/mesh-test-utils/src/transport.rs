//! Scriptable fake media transport.
//!
//! Every transport records the calls made on it so tests can assert ordering
//! (e.g. candidates applied only after the remote description) and that
//! `close` happened exactly once.
//!
//! Default behavior: one local candidate after each local description, and
//! once both descriptions are set the transport reports `Connecting`,
//! `Connected` and a remote stream. A remote description whose SDP contains
//! `"malformed"` is rejected. Remote candidates before a remote description
//! are rejected, like a strict browser transport.

use async_trait::async_trait;
use mesh_core::errors::MeshError;
use mesh_core::media::{
    IceCandidate, LocalTrack, MediaTransport, RemoteStream, SdpKind, SessionDescription,
    TransportConfig, TransportEvent, TransportFactory, TransportState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How a fake transport behaves.
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    /// Local candidates emitted after each local description.
    pub local_candidates: usize,
    /// Delay applied to every offer/answer/description operation.
    pub operation_delay: Option<Duration>,
    /// Report `Failed` instead of `Connected` once negotiated.
    pub fail_connection: bool,
    /// Reject every remote description.
    pub reject_remote_descriptions: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            local_candidates: 1,
            operation_delay: None,
            fail_connection: false,
            reject_remote_descriptions: false,
        }
    }
}

impl FakeBehavior {
    #[must_use]
    pub fn with_local_candidates(mut self, count: usize) -> Self {
        self.local_candidates = count;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.operation_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn failing_connection(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    #[must_use]
    pub fn rejecting_remote_descriptions(mut self) -> Self {
        self.reject_remote_descriptions = true;
        self
    }
}

/// One recorded transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    AddTrack(String),
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SdpKind),
    SetRemoteDescription(SdpKind),
    AddIceCandidate(String),
    Close,
}

/// Observable record of one fake transport.
#[derive(Debug)]
pub struct TransportRecord {
    remote_user_id: String,
    calls: Mutex<Vec<TransportCall>>,
    closes: AtomicUsize,
}

impl TransportRecord {
    fn new(remote_user_id: &str) -> Self {
        Self {
            remote_user_id: remote_user_id.to_string(),
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    fn push(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }

    #[must_use]
    pub fn remote_user_id(&self) -> &str {
        &self.remote_user_id
    }

    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    #[must_use]
    pub fn has_call(&self, call: &TransportCall) -> bool {
        self.calls.lock().unwrap().contains(call)
    }

    /// Position of the first matching call.
    #[must_use]
    pub fn position(&self, call: &TransportCall) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(|c| c == call)
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Remote candidates successfully applied, in order.
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                TransportCall::AddIceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    /// Track ids attached before any offer or answer was created.
    #[must_use]
    pub fn tracks_attached_up_front(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .take_while(|c| matches!(c, TransportCall::AddTrack(_)))
            .filter_map(|c| match c {
                TransportCall::AddTrack(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Fake transport created by [`FakeTransportFactory`].
pub struct FakeTransport {
    owner: String,
    behavior: FakeBehavior,
    record: Arc<TransportRecord>,
    events: mpsc::UnboundedSender<TransportEvent>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<Arc<LocalTrack>>,
    candidates_emitted: usize,
    negotiated: bool,
}

impl FakeTransport {
    async fn pause(&self) {
        if let Some(delay) = self.behavior.operation_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn maybe_connect(&mut self) {
        if self.negotiated || self.local.is_none() || self.remote.is_none() {
            return;
        }
        self.negotiated = true;

        self.emit(TransportEvent::StateChanged(TransportState::Connecting));
        if self.behavior.fail_connection {
            self.emit(TransportEvent::StateChanged(TransportState::Failed));
            return;
        }
        self.emit(TransportEvent::StateChanged(TransportState::Connected));

        let remote = self.record.remote_user_id();
        self.emit(TransportEvent::RemoteTrack(RemoteStream {
            stream_id: format!("{remote}-media"),
            track_ids: vec![format!("{remote}-audio"), format!("{remote}-video")],
        }));
    }

    /// Attached local tracks (shared with the local media source).
    #[must_use]
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn add_track(&mut self, track: Arc<LocalTrack>) -> Result<(), MeshError> {
        self.record.push(TransportCall::AddTrack(track.id().to_string()));
        self.tracks.push(track);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, MeshError> {
        self.pause().await;
        self.record.push(TransportCall::CreateOffer);
        Ok(SessionDescription::offer(format!(
            "v=0 o={} s=offer-to-{} tracks={}",
            self.owner,
            self.record.remote_user_id(),
            self.tracks.len()
        )))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MeshError> {
        self.pause().await;
        if self.remote.is_none() {
            return Err(MeshError::Transport("no remote offer".to_string()));
        }
        self.record.push(TransportCall::CreateAnswer);
        Ok(SessionDescription::answer(format!(
            "v=0 o={} s=answer-to-{} tracks={}",
            self.owner,
            self.record.remote_user_id(),
            self.tracks.len()
        )))
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MeshError> {
        self.pause().await;
        self.record
            .push(TransportCall::SetLocalDescription(description.kind));
        self.local = Some(description);

        for _ in 0..self.behavior.local_candidates {
            self.candidates_emitted += 1;
            let n = self.candidates_emitted;
            self.emit(TransportEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{n} 1 udp 2122260223 10.0.0.{n} {} typ host",
                50_000 + n
            ))));
        }

        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MeshError> {
        self.pause().await;
        if self.behavior.reject_remote_descriptions || description.sdp.contains("malformed") {
            return Err(MeshError::Transport(
                "failed to parse session description".to_string(),
            ));
        }
        self.record
            .push(TransportCall::SetRemoteDescription(description.kind));
        self.remote = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), MeshError> {
        if self.remote.is_none() {
            return Err(MeshError::Transport(
                "candidate before remote description".to_string(),
            ));
        }
        self.record
            .push(TransportCall::AddIceCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&mut self) {
        self.record.closes.fetch_add(1, Ordering::SeqCst);
        self.record.push(TransportCall::Close);
    }
}

/// Factory handing out [`FakeTransport`]s and keeping their records.
#[derive(Debug, Clone)]
pub struct FakeTransportFactory {
    owner: String,
    inner: Arc<Mutex<FactoryInner>>,
}

#[derive(Debug, Default)]
struct FactoryInner {
    default_behavior: FakeBehavior,
    per_remote: HashMap<String, FakeBehavior>,
    records: Vec<Arc<TransportRecord>>,
    configs: Vec<TransportConfig>,
    fail_creates: bool,
}

impl FakeTransportFactory {
    /// Factory for transports owned by `owner` (the local user id).
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            inner: Arc::new(Mutex::new(FactoryInner::default())),
        }
    }

    /// Behavior for every transport without a per-remote override.
    #[must_use]
    pub fn with_behavior(self, behavior: FakeBehavior) -> Self {
        self.inner.lock().unwrap().default_behavior = behavior;
        self
    }

    /// Behavior for transports towards one remote participant.
    #[must_use]
    pub fn with_behavior_for(self, remote_user_id: &str, behavior: FakeBehavior) -> Self {
        self.inner
            .lock()
            .unwrap()
            .per_remote
            .insert(remote_user_id.to_string(), behavior);
        self
    }

    /// Make every `create` fail.
    pub fn fail_creates(&self, fail: bool) {
        self.inner.lock().unwrap().fail_creates = fail;
    }

    /// Records of every transport created, in creation order.
    #[must_use]
    pub fn records(&self) -> Vec<Arc<TransportRecord>> {
        self.inner.lock().unwrap().records.clone()
    }

    /// Records of transports towards one remote participant.
    #[must_use]
    pub fn records_for(&self, remote_user_id: &str) -> Vec<Arc<TransportRecord>> {
        self.inner
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|r| r.remote_user_id() == remote_user_id)
            .cloned()
            .collect()
    }

    /// Most recent transport towards a remote participant.
    #[must_use]
    pub fn latest_for(&self, remote_user_id: &str) -> Option<Arc<TransportRecord>> {
        self.records_for(remote_user_id).pop()
    }

    #[must_use]
    pub fn created_count(&self, remote_user_id: &str) -> usize {
        self.records_for(remote_user_id).len()
    }

    /// Configs passed to `create`, in order.
    #[must_use]
    pub fn configs(&self) -> Vec<TransportConfig> {
        self.inner.lock().unwrap().configs.clone()
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create(
        &self,
        remote_user_id: &str,
        config: &TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn MediaTransport>, MeshError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_creates {
            return Err(MeshError::Transport(
                "transport creation refused".to_string(),
            ));
        }

        let behavior = inner
            .per_remote
            .get(remote_user_id)
            .cloned()
            .unwrap_or_else(|| inner.default_behavior.clone());
        let record = Arc::new(TransportRecord::new(remote_user_id));
        inner.records.push(Arc::clone(&record));
        inner.configs.push(config.clone());

        Ok(Box::new(FakeTransport {
            owner: self.owner.clone(),
            behavior,
            record,
            events,
            local: None,
            remote: None,
            tracks: Vec::new(),
            candidates_emitted: 0,
            negotiated: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::media::TrackKind;

    fn factory() -> FakeTransportFactory {
        FakeTransportFactory::new("alice")
    }

    fn config() -> TransportConfig {
        TransportConfig {
            ice_servers: vec!["stun:stun.example.org:3478".to_string()],
        }
    }

    #[tokio::test]
    async fn test_negotiated_transport_connects_and_delivers_stream() {
        let factory = factory();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = factory.create("bob", &config(), tx).unwrap();

        transport
            .add_track(Arc::new(LocalTrack::new("mic", TrackKind::Audio)))
            .await
            .unwrap();
        let offer = transport.create_offer().await.unwrap();
        transport.set_local_description(offer).await.unwrap();
        transport
            .set_remote_description(SessionDescription::answer("v=0 bob"))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events[0], TransportEvent::LocalCandidate(_)));
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::StateChanged(TransportState::Connected)
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, TransportEvent::RemoteTrack(s) if s.stream_id == "bob-media")));

        let record = factory.latest_for("bob").unwrap();
        assert_eq!(record.tracks_attached_up_front(), vec!["mic".to_string()]);
    }

    #[tokio::test]
    async fn test_early_candidate_is_rejected() {
        let factory = factory();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut transport = factory.create("bob", &config(), tx).unwrap();

        let result = transport
            .add_ice_candidate(IceCandidate::new("candidate:9"))
            .await;
        assert!(result.is_err());
        assert!(factory.latest_for("bob").unwrap().applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_remote_description_is_rejected() {
        let factory = factory();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut transport = factory.create("bob", &config(), tx).unwrap();

        let result = transport
            .set_remote_description(SessionDescription::offer("malformed"))
            .await;
        assert!(matches!(result, Err(MeshError::Transport(_))));
    }

    #[tokio::test]
    async fn test_failing_connection_reports_failed() {
        let factory = factory().with_behavior(FakeBehavior::default().failing_connection());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = factory.create("bob", &config(), tx).unwrap();

        transport
            .set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let answer = transport.create_answer().await.unwrap();
        transport.set_local_description(answer).await.unwrap();

        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, TransportEvent::StateChanged(TransportState::Failed)) {
                saw_failed = true;
            }
            assert!(!matches!(event, TransportEvent::RemoteTrack(_)));
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_factory_records_configs_and_refusal() {
        let factory = factory();
        let (tx, _rx) = mpsc::unbounded_channel();
        let _ = factory.create("bob", &config(), tx.clone()).unwrap();
        assert_eq!(factory.configs(), vec![config()]);

        factory.fail_creates(true);
        assert!(factory.create("carol", &config(), tx).is_err());
        assert_eq!(factory.created_count("carol"), 0);
    }
}
