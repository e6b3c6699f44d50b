//! Fake camera/microphone source.

use async_trait::async_trait;
use mesh_core::errors::MediaAccessError;
use mesh_core::media::{LocalMedia, LocalTrack, MediaConstraints, MediaSource, TrackKind};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Media source that hands out in-memory tracks, or a scripted error.
///
/// Every track handed out is kept so tests can check enabled/stopped flags
/// after the session has taken ownership of the media.
#[derive(Debug, Clone)]
pub struct FakeMediaSource {
    owner: String,
    inner: Arc<Mutex<MediaInner>>,
}

#[derive(Debug, Default)]
struct MediaInner {
    failure: Option<MediaAccessError>,
    delay: Option<Duration>,
    acquisitions: usize,
    tracks: Vec<Arc<LocalTrack>>,
}

impl FakeMediaSource {
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            inner: Arc::new(Mutex::new(MediaInner::default())),
        }
    }

    /// Fail every acquisition with `error`.
    #[must_use]
    pub fn failing(self, error: MediaAccessError) -> Self {
        self.inner.lock().unwrap().failure = Some(error);
        self
    }

    /// Delay every acquisition (e.g. a permission prompt).
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.inner.lock().unwrap().delay = Some(delay);
        self
    }

    #[must_use]
    pub fn acquisitions(&self) -> usize {
        self.inner.lock().unwrap().acquisitions
    }

    /// Every track handed out so far.
    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.inner.lock().unwrap().tracks.clone()
    }

    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<Arc<LocalTrack>> {
        self.tracks().into_iter().find(|t| t.kind() == kind)
    }

    /// Whether every handed-out track has been stopped.
    #[must_use]
    pub fn all_stopped(&self) -> bool {
        self.tracks().iter().all(|t| t.is_stopped())
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaAccessError> {
        let (delay, failure) = {
            let mut inner = self.inner.lock().unwrap();
            inner.acquisitions += 1;
            (inner.delay, inner.failure.clone())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new(
                format!("{}-mic", self.owner),
                TrackKind::Audio,
            )));
        }
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::new(
                format!("{}-cam", self.owner),
                TrackKind::Video,
            )));
        }

        self.inner
            .lock()
            .unwrap()
            .tracks
            .extend(tracks.iter().cloned());
        Ok(LocalMedia::new(format!("{}-local", self.owner), tracks))
    }
}
