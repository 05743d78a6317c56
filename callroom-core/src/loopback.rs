//! In-process media engine for headless tests and demos
//!
//! [`LoopbackConnection`] produces structurally valid SDP and one host
//! candidate per local descriptor, and behaves like a browser peer connection
//! where ordering matters: candidates are rejected until a remote descriptor
//! is installed. Every call is recorded for inspection.

use crate::connection::{
    ConnectionEvent, IceConfig, MediaConnection, MediaConnectionFactory, RemoteStream,
};
use crate::error::CallError;
use crate::media::{MediaConstraints, MediaDevices, MediaSource};
use crate::types::{ConnectionState, IceCandidate, SessionDescriptor, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

const BASE_CANDIDATE_PORT: u32 = 50000;

#[derive(Default)]
struct LoopbackState {
    tracks: Vec<TrackKind>,
    add_tracks_calls: usize,
    local: Option<SessionDescriptor>,
    remote: Option<SessionDescriptor>,
    applied: Vec<IceCandidate>,
    announced: HashSet<TrackKind>,
    version: u64,
    candidates_emitted: u32,
    ice_restarts: u32,
    close_calls: usize,
    connected: bool,
}

/// Loopback engine connection
pub struct LoopbackConnection {
    id: String,
    config: IceConfig,
    latency: Option<Duration>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Mutex<LoopbackState>,
}

impl LoopbackConnection {
    fn new(config: IceConfig, latency: Option<Duration>, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            config,
            latency,
            events,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// ICE configuration the connection was created with
    pub fn config(&self) -> &IceConfig {
        &self.config
    }

    /// Remote candidates applied so far, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Kinds of the bound local tracks
    pub fn bound_track_kinds(&self) -> Vec<TrackKind> {
        self.state.lock().tracks.clone()
    }

    /// Number of `add_tracks` calls
    pub fn add_tracks_calls(&self) -> usize {
        self.state.lock().add_tracks_calls
    }

    /// Installed local descriptor
    pub fn local_description(&self) -> Option<SessionDescriptor> {
        self.state.lock().local.clone()
    }

    /// Installed remote descriptor
    pub fn remote_description(&self) -> Option<SessionDescriptor> {
        self.state.lock().remote.clone()
    }

    /// Number of ICE restarts requested
    pub fn ice_restarts(&self) -> u32 {
        self.state.lock().ice_restarts
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().close_calls > 0
    }

    /// Number of `close` calls
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn ensure_open(&self, operation: &str) -> Result<(), CallError> {
        if self.is_closed() {
            return Err(CallError::connection(operation, "connection is closed"));
        }
        Ok(())
    }

    fn emit(&self, event: ConnectionEvent) {
        // receiver gone means the owning session was torn down
        let _ = self.events.send(event);
    }

    fn emit_local_candidate(&self, state: &mut LoopbackState) {
        let port = BASE_CANDIDATE_PORT + state.candidates_emitted;
        state.candidates_emitted += 1;
        let line = format!(
            "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
            state.candidates_emitted, port
        );
        self.emit(ConnectionEvent::LocalCandidate(IceCandidate::new(
            line,
            Some("0".to_string()),
            Some(0),
        )));
    }

    fn maybe_connected(&self, state: &mut LoopbackState) {
        if !state.connected && state.local.is_some() && state.remote.is_some() {
            state.connected = true;
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Checking));
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
        }
    }

    fn build_sdp(&self, version: u64, kinds: &[TrackKind]) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.id, version
        );
        if kinds.is_empty() {
            sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:0\r\n");
        }
        for (mid, kind) in kinds.iter().enumerate() {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\na=sendrecv\r\n",
                kind.media_name(),
                mid
            ));
        }
        sdp
    }
}

/// Media kinds announced by the `m=` lines of an SDP blob
fn media_kinds(sdp: &str) -> Vec<TrackKind> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("m="))
        .filter_map(|rest| match rest.split_whitespace().next() {
            Some("audio") => Some(TrackKind::Audio),
            Some("video") => Some(TrackKind::Video),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl MediaConnection for LoopbackConnection {
    async fn add_tracks(&self, source: Arc<dyn MediaSource>) -> Result<(), CallError> {
        self.delay().await;
        self.ensure_open("add_tracks")?;
        let mut state = self.state.lock();
        state.add_tracks_calls += 1;
        state.tracks.extend(source.track_kinds());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescriptor, CallError> {
        self.delay().await;
        self.ensure_open("create_offer")?;
        let mut state = self.state.lock();
        state.version += 1;
        Ok(SessionDescriptor::offer(self.build_sdp(state.version, &state.tracks)))
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, CallError> {
        self.delay().await;
        self.ensure_open("create_answer")?;
        let mut state = self.state.lock();
        let kinds = match &state.remote {
            Some(remote) if remote.is_offer() => media_kinds(remote.sdp()),
            _ => {
                return Err(CallError::connection(
                    "create_answer",
                    "no remote offer installed",
                ))
            }
        };
        state.version += 1;
        Ok(SessionDescriptor::answer(self.build_sdp(state.version, &kinds)))
    }

    async fn set_local_description(&self, descriptor: &SessionDescriptor) -> Result<(), CallError> {
        self.ensure_open("set_local_description")?;
        let mut state = self.state.lock();
        state.local = Some(descriptor.clone());
        self.emit_local_candidate(&mut state);
        self.maybe_connected(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, descriptor: &SessionDescriptor) -> Result<(), CallError> {
        self.delay().await;
        self.ensure_open("set_remote_description")?;
        let mut state = self.state.lock();
        state.remote = Some(descriptor.clone());
        for kind in media_kinds(descriptor.sdp()) {
            if state.announced.insert(kind) {
                self.emit(ConnectionEvent::RemoteTrack(RemoteStream {
                    id: format!("{}-{}", self.id, kind.media_name()),
                    kind,
                }));
            }
        }
        self.maybe_connected(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        self.ensure_open("add_ice_candidate")?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(CallError::connection(
                "add_ice_candidate",
                "remote description is not set",
            ));
        }
        state.applied.push(candidate.clone());
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), CallError> {
        self.ensure_open("restart_ice")?;
        let mut state = self.state.lock();
        state.ice_restarts += 1;
        self.emit_local_candidate(&mut state);
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.close_calls += 1;
        if state.close_calls == 1 {
            debug!("Loopback connection {} closed", self.id);
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Closed));
        }
    }
}

/// Factory producing [`LoopbackConnection`]s and remembering them
#[derive(Default)]
pub struct LoopbackConnectionFactory {
    latency: Option<Duration>,
    connections: Mutex<Vec<Arc<LoopbackConnection>>>,
}

impl LoopbackConnectionFactory {
    /// Factory with instant operations
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose negotiation operations each take `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// All connections created so far
    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        self.connections.lock().clone()
    }

    /// Most recently created connection
    pub fn last(&self) -> Option<Arc<LoopbackConnection>> {
        self.connections.lock().last().cloned()
    }
}

impl MediaConnectionFactory for LoopbackConnectionFactory {
    fn create(
        &self,
        config: &IceConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn MediaConnection>, CallError> {
        let connection = Arc::new(LoopbackConnection::new(config.clone(), self.latency, events));
        connection.emit(ConnectionEvent::StateChanged(ConnectionState::New));
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// Loopback capture source
#[derive(Debug)]
pub struct LoopbackMediaSource {
    id: String,
    kinds: Vec<TrackKind>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    release_count: AtomicUsize,
}

impl LoopbackMediaSource {
    /// Source carrying the kinds selected by `constraints`
    pub fn new(constraints: MediaConstraints) -> Self {
        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if constraints.video {
            kinds.push(TrackKind::Video);
        }
        Self {
            id: Uuid::new_v4().to_string(),
            kinds,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            release_count: AtomicUsize::new(0),
        }
    }

    /// Whether audio is enabled
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    /// Whether video is enabled
    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    /// Number of `release` calls
    pub fn release_count(&self) -> usize {
        self.release_count.load(Ordering::SeqCst)
    }
}

impl MediaSource for LoopbackMediaSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn track_kinds(&self) -> Vec<TrackKind> {
        self.kinds.clone()
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    fn release(&self) {
        self.release_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Loopback capture capability
#[derive(Default)]
pub struct LoopbackMediaDevices {
    failure: Option<CallError>,
    latency: Option<Duration>,
    sources: Mutex<Vec<Arc<LoopbackMediaSource>>>,
    attempts: AtomicUsize,
}

impl LoopbackMediaDevices {
    /// Devices that always succeed immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices that always fail with `error`
    pub fn failing(error: CallError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    /// Devices whose acquisition takes `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Sources handed out so far
    pub fn sources(&self) -> Vec<Arc<LoopbackMediaSource>> {
        self.sources.lock().clone()
    }

    /// Number of acquisition attempts
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for LoopbackMediaDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<dyn MediaSource>, CallError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let source = Arc::new(LoopbackMediaSource::new(constraints));
        self.sources.lock().push(Arc::clone(&source));
        Ok(source)
    }
}
