//! Local media capability contract
//!
//! Capturing a camera or microphone is outside this crate. The capture layer is
//! consumed through [`MediaDevices`], which yields a [`MediaSource`].

use crate::error::CallError;
use crate::types::TrackKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Which kinds of media to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture audio
    pub audio: bool,
    /// Capture video
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// A captured local audio/video source
pub trait MediaSource: Send + Sync + fmt::Debug {
    /// Stable identifier of the source
    fn id(&self) -> &str;
    /// Kinds of track the source carries
    fn track_kinds(&self) -> Vec<TrackKind>;
    /// Enable or disable the audio tracks
    fn set_audio_enabled(&self, enabled: bool);
    /// Enable or disable the video tracks
    fn set_video_enabled(&self, enabled: bool);
    /// Stop capture and release the devices
    fn release(&self);
}

/// Capability that acquires local media
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire a source matching the constraints
    ///
    /// Fails with [`CallError::DeviceUnavailable`] or [`CallError::PermissionDenied`].
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<dyn MediaSource>, CallError>;
}

/// Owned handle to an acquired source that releases it exactly once
pub struct LocalMedia {
    source: Arc<dyn MediaSource>,
    kinds: Vec<TrackKind>,
    released: AtomicBool,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
}

impl LocalMedia {
    /// Take ownership of an acquired source
    ///
    /// A kind the source does not carry starts, and stays, disabled.
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        let kinds = source.track_kinds();
        Self {
            audio_enabled: AtomicBool::new(kinds.contains(&TrackKind::Audio)),
            video_enabled: AtomicBool::new(kinds.contains(&TrackKind::Video)),
            source,
            kinds,
            released: AtomicBool::new(false),
        }
    }

    /// Whether the source carries a track of this kind
    pub fn has_track(&self, kind: TrackKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Shared reference to the source, for track binding
    pub fn source(&self) -> Arc<dyn MediaSource> {
        Arc::clone(&self.source)
    }

    /// Whether audio is currently enabled
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    /// Whether video is currently enabled
    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable audio
    pub fn set_audio_enabled(&self, enabled: bool) {
        if !self.has_track(TrackKind::Audio) {
            return;
        }
        self.audio_enabled.store(enabled, Ordering::SeqCst);
        self.source.set_audio_enabled(enabled);
    }

    /// Enable or disable video
    pub fn set_video_enabled(&self, enabled: bool) {
        if !self.has_track(TrackKind::Video) {
            return;
        }
        self.video_enabled.store(enabled, Ordering::SeqCst);
        self.source.set_video_enabled(enabled);
    }

    /// Release the source; returns `false` if it was already released
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("Releasing local media source {}", self.source.id());
        self.source.release();
        true
    }

    /// Whether the source has been released
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("source", &self.source.id())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}
