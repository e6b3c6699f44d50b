//! Participant fixtures and event wait helpers.
//!
//! Provides builders for:
//! - Sessions wired to the in-memory relay, fake transports and fake media
//! - Waiting on session events and state with a bounded timeout

use crate::media::FakeMediaSource;
use crate::relay::{InMemoryRelayChannel, InMemoryRelayHub};
use crate::transport::{FakeBehavior, FakeTransportFactory};
use mesh_core::actors::{
    SessionActor, SessionDeps, SessionEvent, SessionHandle, SessionParams, SessionState,
};
use mesh_core::config::{InitiatorPolicy, MeshConfig};
use mesh_core::errors::{MediaAccessError, MeshError};
use mesh_core::media::MediaConstraints;
use mesh_core::relay::PresenceIdentity;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default bound for every wait helper.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Meeting id that no other test shares.
#[must_use]
pub fn random_meeting_id() -> String {
    format!("meeting-{}", Uuid::new_v4())
}

/// Builder for one participant's session.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    /// User id.
    pub user_id: String,
    /// Display name.
    pub display_name: String,
    /// Mesh configuration.
    pub config: MeshConfig,
    /// Requested capture devices.
    pub constraints: MediaConstraints,
    /// Default fake transport behavior.
    pub transport_behavior: FakeBehavior,
    /// Per-remote transport behavior overrides.
    pub transport_overrides: Vec<(String, FakeBehavior)>,
    /// Media acquisition failure, if any.
    pub media_failure: Option<MediaAccessError>,
    /// Media acquisition delay, if any.
    pub media_delay: Option<Duration>,
}

impl TestParticipant {
    /// Create a participant with default configuration.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            display_name: format!("User {user_id}"),
            user_id,
            config: MeshConfig::default(),
            constraints: MediaConstraints::default(),
            transport_behavior: FakeBehavior::default(),
            transport_overrides: Vec::new(),
            media_failure: None,
            media_delay: None,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the initiator policy.
    #[must_use]
    pub fn with_policy(mut self, policy: InitiatorPolicy) -> Self {
        self.config.initiator_policy = policy;
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn with_config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the requested capture devices.
    #[must_use]
    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Default behavior of every transport this participant creates.
    #[must_use]
    pub fn with_transport_behavior(mut self, behavior: FakeBehavior) -> Self {
        self.transport_behavior = behavior;
        self
    }

    /// Behavior of transports towards one remote participant.
    #[must_use]
    pub fn with_transport_behavior_for(
        mut self,
        remote_user_id: impl Into<String>,
        behavior: FakeBehavior,
    ) -> Self {
        self.transport_overrides
            .push((remote_user_id.into(), behavior));
        self
    }

    /// Fail media acquisition.
    #[must_use]
    pub fn with_media_failure(mut self, error: MediaAccessError) -> Self {
        self.media_failure = Some(error);
        self
    }

    /// Delay media acquisition.
    #[must_use]
    pub fn with_media_delay(mut self, delay: Duration) -> Self {
        self.media_delay = Some(delay);
        self
    }

    /// Spawn the session without waiting for it to join.
    #[must_use]
    pub fn spawn(self, hub: &InMemoryRelayHub, meeting_id: &str) -> TestSession {
        let relay = hub.channel(meeting_id);

        let mut media = FakeMediaSource::new(self.user_id.clone());
        if let Some(error) = self.media_failure {
            media = media.failing(error);
        }
        if let Some(delay) = self.media_delay {
            media = media.with_delay(delay);
        }

        let mut transports =
            FakeTransportFactory::new(self.user_id.clone()).with_behavior(self.transport_behavior);
        for (remote, behavior) in self.transport_overrides {
            transports = transports.with_behavior_for(&remote, behavior);
        }

        let deps = SessionDeps {
            relay: Arc::new(relay.clone()),
            media_source: Arc::new(media.clone()),
            transports: Arc::new(transports.clone()),
        };
        let mut params = SessionParams::new(
            PresenceIdentity::new(self.user_id.clone(), self.display_name),
            self.config,
        );
        params.constraints = self.constraints;

        let (handle, events, task) = SessionActor::spawn(params, deps, CancellationToken::new());

        TestSession {
            user_id: self.user_id,
            handle,
            events,
            task,
            transports,
            media,
            relay,
        }
    }

    /// Spawn the session and wait for it to join.
    ///
    /// # Errors
    ///
    /// Returns the join error (e.g. media acquisition failure).
    pub async fn try_join(
        self,
        hub: &InMemoryRelayHub,
        meeting_id: &str,
    ) -> Result<TestSession, (TestSession, MeshError)> {
        let session = self.spawn(hub, meeting_id);
        match session.handle.joined().await {
            Ok(()) => Ok(session),
            Err(e) => Err((session, e)),
        }
    }

    /// Spawn the session and wait for it to join.
    ///
    /// # Panics
    ///
    /// Panics if joining fails.
    pub async fn join(self, hub: &InMemoryRelayHub, meeting_id: &str) -> TestSession {
        let user_id = self.user_id.clone();
        match self.try_join(hub, meeting_id).await {
            Ok(session) => session,
            Err((_, e)) => panic!("{user_id} failed to join: {e}"),
        }
    }
}

/// A running session plus the fakes behind it.
pub struct TestSession {
    pub user_id: String,
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub task: JoinHandle<()>,
    pub transports: FakeTransportFactory,
    pub media: FakeMediaSource,
    pub relay: InMemoryRelayChannel,
}

impl TestSession {
    /// Next event, or `None` if nothing arrives within the default wait.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        tokio::time::timeout(DEFAULT_WAIT, self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the first event matching `predicate`, discarding others.
    ///
    /// # Panics
    ///
    /// Panics if no matching event arrives within the default wait.
    pub async fn wait_for_event<F>(&mut self, mut predicate: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        let user_id = self.user_id.clone();
        let events = &mut self.events;
        let found = tokio::time::timeout(DEFAULT_WAIT, async {
            while let Some(event) = events.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await;

        match found {
            Ok(Some(event)) => event,
            Ok(None) => panic!("{user_id}: event stream closed while waiting"),
            Err(_) => panic!("{user_id}: timed out waiting for event"),
        }
    }

    /// Poll the session state until `predicate` holds.
    ///
    /// # Panics
    ///
    /// Panics if the predicate does not hold within the default wait.
    pub async fn wait_for_state<F>(&self, predicate: F) -> SessionState
    where
        F: Fn(&SessionState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        let mut last = None;

        while tokio::time::Instant::now() < deadline {
            if let Ok(state) = self.handle.state().await {
                if predicate(&state) {
                    return state;
                }
                last = Some(state);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!(
            "{}: state condition not met within {DEFAULT_WAIT:?}, last state: {last:?}",
            self.user_id
        );
    }

    /// Every event currently queued.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Leave and wait for the actor task to finish.
    pub async fn leave(self) -> Self {
        let _ = self.handle.leave().await;
        self
    }
}

/// Poll `condition` until it returns true or `timeout` elapses.
///
/// Starts at 10ms between attempts and doubles up to 200ms. Returns whether
/// the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut delay = Duration::from_millis(10);

    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_millis(200));
    }
}
