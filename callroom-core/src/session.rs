//! Peer session: one media connection to one remote participant
//!
//! The session owns the engine connection, both descriptors, the queue of
//! remote candidates that arrived before a remote descriptor, and the binding
//! of local tracks. Every operation re-checks for teardown after each await,
//! so an operation that was in flight when [`PeerSession::teardown`] ran
//! returns [`CallError::SessionEnded`] instead of a result.

use crate::connection::{
    ConnectionEvent, IceConfig, MediaConnection, MediaConnectionFactory, RemoteStream,
};
use crate::error::CallError;
use crate::media::MediaSource;
use crate::types::{ConnectionState, IceCandidate, ParticipantId, SdpType, SessionDescriptor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Negotiation phase of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Created, nothing negotiated yet
    New,
    /// Local offer installed, waiting for the answer
    Offering,
    /// Answering a remote offer
    Answering,
    /// Both descriptors installed
    Connected,
    /// Torn down
    Ended,
}

/// Notification kinds emitted by a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    /// A local candidate to forward to the remote side
    LocalCandidateProduced(IceCandidate),
    /// Remote media became renderable
    RemoteTrackAvailable(RemoteStream),
    /// Engine connectivity changed
    ConnectionStateChanged(ConnectionState),
}

/// Notification tagged with the session that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    /// Producing session
    pub session_id: Uuid,
    /// What happened
    pub kind: SessionEventKind,
}

/// What happened to a candidate handed to [`PeerSession::enqueue_remote_candidate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Handed to the connection
    Applied,
    /// Queued until the remote descriptor is installed
    Buffered,
    /// Session already ended
    Discarded,
}

struct SessionState {
    phase: SessionPhase,
    local_description: Option<SessionDescriptor>,
    remote_description: Option<SessionDescriptor>,
    pending_remote_candidates: VecDeque<IceCandidate>,
    tracks_bound: bool,
    local_source: Option<Arc<dyn MediaSource>>,
    // an offer/answer operation is running
    negotiating: bool,
    // set_remote_description is awaiting
    remote_pending: bool,
    // buffered candidates are being drained
    flushing: bool,
    awaiting_answer: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: SessionPhase::New,
            local_description: None,
            remote_description: None,
            pending_remote_candidates: VecDeque::new(),
            tracks_bound: false,
            local_source: None,
            negotiating: false,
            remote_pending: false,
            flushing: false,
            awaiting_answer: false,
        }
    }

    fn must_buffer(&self) -> bool {
        self.remote_description.is_none() || self.remote_pending || self.flushing
    }
}

struct EventForwarder(JoinHandle<()>);

impl Drop for EventForwarder {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct SessionInner {
    id: Uuid,
    remote: ParticipantId,
    connection: Arc<dyn MediaConnection>,
    state: Mutex<SessionState>,
    forwarder: Mutex<Option<EventForwarder>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.state.get_mut().phase != SessionPhase::Ended {
            self.connection.close();
        }
    }
}

/// Negotiation state for one remote participant
///
/// Clones share the same session.
#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<SessionInner>,
}

impl PeerSession {
    /// Create a session with a fresh media connection
    ///
    /// Engine notifications are forwarded to `events` until teardown.
    /// Must be called inside a tokio runtime.
    pub fn new(
        remote: ParticipantId,
        factory: &dyn MediaConnectionFactory,
        config: &IceConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, CallError> {
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        let connection = factory.create(config, conn_tx)?;
        let id = Uuid::new_v4();

        let forwarder = tokio::spawn(async move {
            while let Some(event) = conn_rx.recv().await {
                let kind = match event {
                    ConnectionEvent::LocalCandidate(c) => SessionEventKind::LocalCandidateProduced(c),
                    ConnectionEvent::RemoteTrack(s) => SessionEventKind::RemoteTrackAvailable(s),
                    ConnectionEvent::StateChanged(s) => SessionEventKind::ConnectionStateChanged(s),
                };
                if events.send(SessionEvent { session_id: id, kind }).is_err() {
                    break;
                }
            }
        });

        debug!("Created peer session {} for {}", id, remote);
        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                remote,
                connection,
                state: Mutex::new(SessionState::new()),
                forwarder: Mutex::new(Some(EventForwarder(forwarder))),
            }),
        })
    }

    /// Session identifier
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Remote participant this session negotiates with
    pub fn remote(&self) -> &ParticipantId {
        &self.inner.remote
    }

    /// Current phase
    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase
    }

    /// Whether the session has been torn down
    pub fn is_ended(&self) -> bool {
        self.phase() == SessionPhase::Ended
    }

    /// Installed local descriptor
    pub fn local_description(&self) -> Option<SessionDescriptor> {
        self.inner.state.lock().local_description.clone()
    }

    /// Installed remote descriptor
    pub fn remote_description(&self) -> Option<SessionDescriptor> {
        self.inner.state.lock().remote_description.clone()
    }

    /// Number of remote candidates waiting for the remote descriptor
    pub fn pending_candidate_count(&self) -> usize {
        self.inner.state.lock().pending_remote_candidates.len()
    }

    /// Take the buffered remote candidates, oldest first
    ///
    /// Used when the session is replaced before its remote descriptor
    /// arrived, so the candidates can move to the replacement.
    pub fn take_pending_candidates(&self) -> Vec<IceCandidate> {
        self.inner.state.lock().pending_remote_candidates.drain(..).collect()
    }

    /// Whether local tracks are bound
    pub fn tracks_bound(&self) -> bool {
        self.inner.state.lock().tracks_bound
    }

    /// Whether a local offer is waiting for its answer
    pub fn has_outstanding_offer(&self) -> bool {
        self.inner.state.lock().awaiting_answer
    }

    /// Bind the local source to the connection
    ///
    /// Returns `Ok(false)` without touching the connection when tracks are
    /// already bound.
    pub async fn attach_local_tracks(&self, source: Arc<dyn MediaSource>) -> Result<bool, CallError> {
        {
            let mut state = self.inner.state.lock();
            self.ensure_live(&state, "attach_local_tracks")?;
            if state.tracks_bound {
                debug!("Session {}: local tracks already bound", self.inner.id);
                return Ok(false);
            }
            state.tracks_bound = true;
            state.local_source = Some(Arc::clone(&source));
        }

        if let Err(e) = self.inner.connection.add_tracks(source).await {
            let mut state = self.inner.state.lock();
            if state.phase != SessionPhase::Ended {
                state.tracks_bound = false;
                state.local_source = None;
            }
            return Err(e);
        }

        self.ensure_live(&self.inner.state.lock(), "attach_local_tracks")?;
        debug!("Session {}: local tracks bound", self.inner.id);
        Ok(true)
    }

    /// Generate and install a local offer
    pub async fn create_offer(&self) -> Result<SessionDescriptor, CallError> {
        let previous = {
            let mut state = self.inner.state.lock();
            self.ensure_live(&state, "create_offer")?;
            if !state.tracks_bound {
                return Err(CallError::MediaNotReady);
            }
            self.ensure_idle_negotiation(&state)?;
            state.negotiating = true;
            state.phase
        };

        let result = self.offer_inner().await;
        self.finish_negotiation(previous, result.is_ok());
        result
    }

    async fn offer_inner(&self) -> Result<SessionDescriptor, CallError> {
        let offer = self.inner.connection.create_offer().await?;
        self.ensure_live(&self.inner.state.lock(), "create_offer")?;
        self.inner.connection.set_local_description(&offer).await?;

        let mut state = self.inner.state.lock();
        self.ensure_live(&state, "create_offer")?;
        state.local_description = Some(offer.clone());
        state.awaiting_answer = true;
        state.phase = SessionPhase::Offering;
        info!("Session {}: local offer installed", self.inner.id);
        Ok(offer)
    }

    /// Apply a remote offer and generate and install the answer
    pub async fn create_answer(&self, remote: SessionDescriptor) -> Result<SessionDescriptor, CallError> {
        if !remote.is_offer() {
            return Err(CallError::WrongDescriptorTag {
                expected: SdpType::Offer,
                actual: remote.sdp_type(),
            });
        }
        let previous = {
            let mut state = self.inner.state.lock();
            self.ensure_live(&state, "create_answer")?;
            self.ensure_idle_negotiation(&state)?;
            if state.awaiting_answer {
                return Err(CallError::InvalidState {
                    expected: "no outstanding local offer".to_string(),
                    actual: "local offer awaiting answer".to_string(),
                });
            }
            state.negotiating = true;
            let previous = state.phase;
            state.phase = SessionPhase::Answering;
            previous
        };

        let result = self.answer_inner(remote).await;
        self.finish_negotiation(previous, result.is_ok());
        result
    }

    async fn answer_inner(&self, remote: SessionDescriptor) -> Result<SessionDescriptor, CallError> {
        self.install_remote(remote).await?;

        let answer = self.inner.connection.create_answer().await?;
        self.ensure_live(&self.inner.state.lock(), "create_answer")?;
        self.inner.connection.set_local_description(&answer).await?;

        let mut state = self.inner.state.lock();
        self.ensure_live(&state, "create_answer")?;
        state.local_description = Some(answer.clone());
        state.phase = SessionPhase::Connected;
        info!("Session {}: answer installed, connected", self.inner.id);
        Ok(answer)
    }

    /// Apply the remote answer to the outstanding local offer
    ///
    /// Fails with [`CallError::UnexpectedAnswer`], leaving the session
    /// untouched, when no local offer is outstanding.
    pub async fn apply_remote_answer(&self, remote: SessionDescriptor) -> Result<(), CallError> {
        if !remote.is_answer() {
            return Err(CallError::WrongDescriptorTag {
                expected: SdpType::Answer,
                actual: remote.sdp_type(),
            });
        }
        let previous = {
            let mut state = self.inner.state.lock();
            self.ensure_live(&state, "apply_remote_answer")?;
            let offer_outstanding = state.awaiting_answer
                && state
                    .local_description
                    .as_ref()
                    .map(SessionDescriptor::is_offer)
                    .unwrap_or(false);
            if !offer_outstanding {
                return Err(CallError::UnexpectedAnswer {
                    reason: "no local offer outstanding".to_string(),
                });
            }
            if state.negotiating {
                return Err(CallError::UnexpectedAnswer {
                    reason: "another negotiation step is in flight".to_string(),
                });
            }
            state.negotiating = true;
            state.phase
        };

        let result = self.install_remote(remote).await;
        if result.is_ok() {
            let mut state = self.inner.state.lock();
            if state.phase != SessionPhase::Ended {
                state.awaiting_answer = false;
                state.phase = SessionPhase::Connected;
                info!("Session {}: remote answer applied, connected", self.inner.id);
            }
        }
        self.finish_negotiation(previous, result.is_ok());
        result
    }

    /// Hand a remote candidate to the connection, or buffer it until the
    /// remote descriptor is installed
    pub async fn enqueue_remote_candidate(&self, candidate: IceCandidate) -> CandidateDisposition {
        {
            let mut state = self.inner.state.lock();
            if state.phase == SessionPhase::Ended {
                debug!("Session {}: dropping candidate after teardown", self.inner.id);
                return CandidateDisposition::Discarded;
            }
            if state.must_buffer() {
                state.pending_remote_candidates.push_back(candidate);
                debug!(
                    "Session {}: buffered remote candidate ({} pending)",
                    self.inner.id,
                    state.pending_remote_candidates.len()
                );
                return CandidateDisposition::Buffered;
            }
        }
        self.apply_candidate(&candidate).await;
        CandidateDisposition::Applied
    }

    /// Ask the connection to restart ICE
    pub async fn restart_ice(&self) -> Result<(), CallError> {
        self.ensure_live(&self.inner.state.lock(), "restart_ice")?;
        info!("Session {}: restarting ICE", self.inner.id);
        self.inner.connection.restart_ice().await
    }

    /// Release the connection and track references
    ///
    /// Returns `false` if the session was already torn down.
    pub fn teardown(&self) -> bool {
        let source = {
            let mut state = self.inner.state.lock();
            if state.phase == SessionPhase::Ended {
                return false;
            }
            state.phase = SessionPhase::Ended;
            state.pending_remote_candidates.clear();
            state.negotiating = false;
            state.remote_pending = false;
            state.flushing = false;
            state.awaiting_answer = false;
            state.local_source.take()
        };

        drop(self.inner.forwarder.lock().take());
        self.inner.connection.close();
        drop(source);
        info!("Session {} with {} torn down", self.inner.id, self.inner.remote);
        true
    }

    async fn install_remote(&self, remote: SessionDescriptor) -> Result<(), CallError> {
        self.inner.state.lock().remote_pending = true;

        if let Err(e) = self.inner.connection.set_remote_description(&remote).await {
            self.inner.state.lock().remote_pending = false;
            return Err(e);
        }

        {
            let mut state = self.inner.state.lock();
            state.remote_pending = false;
            self.ensure_live(&state, "set_remote_description")?;
            state.remote_description = Some(remote);
            state.flushing = true;
        }
        self.flush_pending().await
    }

    /// Drain buffered candidates in arrival order. Candidates enqueued while
    /// draining join the back of the queue.
    async fn flush_pending(&self) -> Result<(), CallError> {
        let mut applied = 0usize;
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                self.ensure_live(&state, "candidate flush")?;
                match state.pending_remote_candidates.pop_front() {
                    Some(candidate) => candidate,
                    None => {
                        state.flushing = false;
                        break;
                    }
                }
            };
            self.apply_candidate(&next).await;
            applied += 1;
        }
        if applied > 0 {
            debug!("Session {}: flushed {} buffered candidates", self.inner.id, applied);
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: &IceCandidate) {
        if let Err(e) = self.inner.connection.add_ice_candidate(candidate).await {
            warn!("Session {}: failed to apply remote candidate: {}", self.inner.id, e);
        }
    }

    fn finish_negotiation(&self, previous: SessionPhase, succeeded: bool) {
        let mut state = self.inner.state.lock();
        state.negotiating = false;
        if !succeeded && state.phase != SessionPhase::Ended {
            state.phase = previous;
        }
    }

    fn ensure_idle_negotiation(&self, state: &SessionState) -> Result<(), CallError> {
        if state.negotiating {
            return Err(CallError::InvalidState {
                expected: "no negotiation in flight".to_string(),
                actual: format!("{:?} with negotiation in flight", state.phase),
            });
        }
        Ok(())
    }

    fn ensure_live(&self, state: &SessionState, operation: &str) -> Result<(), CallError> {
        if state.phase == SessionPhase::Ended {
            return Err(CallError::SessionEnded {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PeerSession")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("phase", &state.phase)
            .field("tracks_bound", &state.tracks_bound)
            .field("pending_remote_candidates", &state.pending_remote_candidates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackConnectionFactory, LoopbackMediaSource};
    use crate::media::MediaConstraints;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const HOST_A: &str = "candidate:1 1 udp 2130706431 10.0.0.1 50001 typ host";
    const HOST_B: &str = "candidate:2 1 udp 2130706431 10.0.0.1 50002 typ host";
    const HOST_C: &str = "candidate:3 1 udp 2130706431 10.0.0.1 50003 typ host";

    fn candidate(line: &str) -> IceCandidate {
        IceCandidate::new(line, Some("0".to_string()), Some(0))
    }

    fn source() -> Arc<dyn MediaSource> {
        Arc::new(LoopbackMediaSource::new(MediaConstraints::default()))
    }

    fn session(factory: &LoopbackConnectionFactory) -> (PeerSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(
            ParticipantId::from("remote"),
            factory,
            &IceConfig::default(),
            tx,
        )
        .unwrap();
        (session, rx)
    }

    /// Produce a real offer from a second session so answers have something to mirror
    async fn remote_offer(factory: &LoopbackConnectionFactory) -> SessionDescriptor {
        let (caller, _rx) = session(factory);
        caller.attach_local_tracks(source()).await.unwrap();
        caller.create_offer().await.unwrap()
    }

    #[tokio::test]
    async fn test_create_offer_requires_tracks() {
        let factory = LoopbackConnectionFactory::new();
        let (session, _rx) = session(&factory);

        let err = session.create_offer().await.unwrap_err();
        assert_eq!(err, CallError::MediaNotReady);
        assert_eq!(session.phase(), SessionPhase::New);
        assert!(session.local_description().is_none());

        assert!(assert_ok!(session.attach_local_tracks(source()).await));
        let offer = assert_ok!(session.create_offer().await);
        assert!(offer.is_offer());
        assert_eq!(session.phase(), SessionPhase::Offering);
        assert_eq!(session.local_description(), Some(offer));
        assert!(session.has_outstanding_offer());
    }

    #[tokio::test]
    async fn test_attach_local_tracks_is_idempotent() {
        let factory = LoopbackConnectionFactory::new();
        let (session, _rx) = session(&factory);
        let media = source();

        assert!(session.attach_local_tracks(Arc::clone(&media)).await.unwrap());
        assert!(!session.attach_local_tracks(Arc::clone(&media)).await.unwrap());
        assert!(session.tracks_bound());

        let connection = factory.last().unwrap();
        assert_eq!(connection.add_tracks_calls(), 1);
        assert_eq!(connection.bound_track_kinds().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_answer_without_offer_is_unexpected() {
        let factory = LoopbackConnectionFactory::new();
        let (session, _rx) = session(&factory);
        let answer = SessionDescriptor::answer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");

        let err = session.apply_remote_answer(answer).await.unwrap_err();
        assert!(matches!(err, CallError::UnexpectedAnswer { .. }));
        assert_eq!(session.phase(), SessionPhase::New);
        assert!(session.remote_description().is_none());
        assert!(factory.last().unwrap().remote_description().is_none());
    }

    #[tokio::test]
    async fn test_wrong_descriptor_tags() {
        let factory = LoopbackConnectionFactory::new();
        let (session, _rx) = session(&factory);
        let offer = remote_offer(&factory).await;

        let err = session
            .apply_remote_answer(offer.clone())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CallError::WrongDescriptorTag {
                expected: SdpType::Answer,
                actual: SdpType::Offer
            }
        );

        let answer = SessionDescriptor::answer(offer.sdp());
        let err = session.create_answer(answer).await.unwrap_err();
        assert_eq!(
            err,
            CallError::WrongDescriptorTag {
                expected: SdpType::Offer,
                actual: SdpType::Answer
            }
        );
        assert_eq!(session.phase(), SessionPhase::New);
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_answer_and_flush_in_order() {
        let factory = LoopbackConnectionFactory::new();
        let (caller, _caller_rx) = session(&factory);
        let caller_conn = factory.last().unwrap();
        let (callee, _callee_rx) = session(&factory);

        caller.attach_local_tracks(source()).await.unwrap();
        let offer = caller.create_offer().await.unwrap();

        for line in [HOST_A, HOST_B, HOST_C] {
            assert_eq!(
                caller.enqueue_remote_candidate(candidate(line)).await,
                CandidateDisposition::Buffered
            );
        }
        assert_eq!(caller.pending_candidate_count(), 3);
        assert!(caller_conn.applied_candidates().is_empty());

        callee.attach_local_tracks(source()).await.unwrap();
        let answer = callee.create_answer(offer).await.unwrap();
        assert_eq!(callee.phase(), SessionPhase::Connected);

        caller.apply_remote_answer(answer).await.unwrap();
        assert_eq!(caller.phase(), SessionPhase::Connected);
        assert_eq!(caller.pending_candidate_count(), 0);

        let applied: Vec<String> = caller_conn
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec![HOST_A, HOST_B, HOST_C]);

        assert_eq!(
            caller.enqueue_remote_candidate(IceCandidate::end_of_candidates()).await,
            CandidateDisposition::Applied
        );
        assert_eq!(caller_conn.applied_candidates().len(), 4);
    }

    #[tokio::test]
    async fn test_candidates_buffer_before_create_answer() {
        let factory = LoopbackConnectionFactory::new();
        let offer = remote_offer(&factory).await;
        let (callee, _rx) = session(&factory);
        let conn = factory.last().unwrap();

        callee.enqueue_remote_candidate(candidate(HOST_B)).await;
        callee.enqueue_remote_candidate(candidate(HOST_A)).await;
        assert!(conn.applied_candidates().is_empty());

        callee.create_answer(offer).await.unwrap();
        let applied: Vec<String> = conn
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec![HOST_B, HOST_A]);
        assert_eq!(callee.phase(), SessionPhase::Connected);
        assert!(callee.local_description().is_some());
        assert!(callee.remote_description().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_answer_is_unexpected() {
        let factory = LoopbackConnectionFactory::new();
        let (caller, _rx) = session(&factory);
        let (callee, _rx2) = session(&factory);

        caller.attach_local_tracks(source()).await.unwrap();
        let offer = caller.create_offer().await.unwrap();
        let answer = callee.create_answer(offer).await.unwrap();

        caller.apply_remote_answer(answer.clone()).await.unwrap();
        let err = assert_err!(caller.apply_remote_answer(answer).await);
        assert!(matches!(err, CallError::UnexpectedAnswer { .. }));
        assert_eq!(caller.phase(), SessionPhase::Connected);
    }

    #[tokio::test]
    async fn test_local_candidates_are_forwarded() {
        let factory = LoopbackConnectionFactory::new();
        let (caller, mut rx) = session(&factory);
        caller.attach_local_tracks(source()).await.unwrap();
        caller.create_offer().await.unwrap();

        let produced = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(event) = rx.recv().await {
                if let SessionEventKind::LocalCandidateProduced(candidate) = event.kind {
                    return Some((event.session_id, candidate));
                }
            }
            None
        })
        .await
        .unwrap();
        let (session_id, candidate) = produced.unwrap();
        assert_eq!(session_id, caller.id());
        assert!(candidate.candidate.starts_with("candidate:"));
    }

    #[tokio::test]
    async fn test_remote_tracks_announced_after_answer() {
        let factory = LoopbackConnectionFactory::new();
        let offer = remote_offer(&factory).await;
        let (callee, mut rx) = session(&factory);
        callee.create_answer(offer).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            if let SessionEventKind::RemoteTrackAvailable(stream) = event.kind {
                kinds.push(stream.kind);
            }
        }
        assert_eq!(kinds.len(), 2);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent_and_releases() {
        let factory = LoopbackConnectionFactory::new();
        let (session, _rx) = session(&factory);
        let media = Arc::new(LoopbackMediaSource::new(MediaConstraints::default()));
        session.attach_local_tracks(media.clone()).await.unwrap();
        session.enqueue_remote_candidate(candidate(HOST_A)).await;

        assert!(session.teardown());
        assert!(!session.teardown());
        assert_eq!(session.phase(), SessionPhase::Ended);
        assert_eq!(session.pending_candidate_count(), 0);
        assert!(factory.last().unwrap().is_closed());
        assert_eq!(factory.last().unwrap().close_calls(), 1);
        // the session dropped its reference to the source
        assert_eq!(Arc::strong_count(&media), 1);

        assert_eq!(
            session.enqueue_remote_candidate(candidate(HOST_B)).await,
            CandidateDisposition::Discarded
        );
        assert!(matches!(
            session.create_offer().await,
            Err(CallError::SessionEnded { .. })
        ));
    }

    #[tokio::test]
    async fn test_teardown_discards_in_flight_offer() {
        let factory = LoopbackConnectionFactory::with_latency(Duration::from_millis(100));
        let (session, _rx) = session(&factory);
        session.attach_local_tracks(source()).await.unwrap();

        let in_flight = {
            let session = session.clone();
            tokio::spawn(async move { session.create_offer().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.teardown());

        let result = in_flight.await.unwrap();
        assert!(matches!(result, Err(CallError::SessionEnded { .. })));
        assert!(session.local_description().is_none());
        assert_eq!(session.phase(), SessionPhase::Ended);
    }

    #[tokio::test]
    async fn test_candidate_during_in_flight_answer_is_buffered() {
        let factory = LoopbackConnectionFactory::new();
        let offer = remote_offer(&factory).await;
        let slow = LoopbackConnectionFactory::with_latency(Duration::from_millis(80));
        let (callee, _rx) = session(&slow);
        let conn = slow.last().unwrap();

        let answering = {
            let callee = callee.clone();
            tokio::spawn(async move { callee.create_answer(offer).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            callee.enqueue_remote_candidate(candidate(HOST_A)).await,
            CandidateDisposition::Buffered
        );

        answering.await.unwrap().unwrap();
        assert_eq!(conn.applied_candidates().len(), 1);
        assert_eq!(callee.pending_candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_renegotiation_keeps_single_track_binding() {
        let factory = LoopbackConnectionFactory::new();
        let (caller, _rx) = session(&factory);
        let caller_conn = factory.last().unwrap();
        let (callee, _rx2) = session(&factory);
        let media = source();

        caller.attach_local_tracks(Arc::clone(&media)).await.unwrap();
        let offer = caller.create_offer().await.unwrap();
        let answer = callee.create_answer(offer).await.unwrap();
        caller.apply_remote_answer(answer).await.unwrap();

        // second round on the same sessions
        assert!(!caller.attach_local_tracks(media).await.unwrap());
        let reoffer = caller.create_offer().await.unwrap();
        assert_eq!(caller.phase(), SessionPhase::Offering);
        let reanswer = callee.create_answer(reoffer).await.unwrap();
        caller.apply_remote_answer(reanswer).await.unwrap();

        assert_eq!(caller.phase(), SessionPhase::Connected);
        assert_eq!(callee.phase(), SessionPhase::Connected);
        assert_eq!(caller_conn.add_tracks_calls(), 1);
    }

    #[tokio::test]
    async fn test_answer_refused_while_offer_outstanding() {
        let factory = LoopbackConnectionFactory::new();
        let (session, _rx) = session(&factory);
        session.attach_local_tracks(source()).await.unwrap();
        session.create_offer().await.unwrap();

        let incoming = remote_offer(&factory).await;
        let err = session.create_answer(incoming).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState { .. }));
        assert_eq!(session.phase(), SessionPhase::Offering);
    }

    #[tokio::test]
    async fn test_restart_ice() {
        let factory = LoopbackConnectionFactory::new();
        let (session, _rx) = session(&factory);
        session.restart_ice().await.unwrap();
        assert_eq!(factory.last().unwrap().ice_restarts(), 1);
        session.teardown();
        assert!(session.restart_ice().await.is_err());
    }

    #[tokio::test]
    async fn test_pending_candidates_move_to_replacement() {
        let factory = LoopbackConnectionFactory::new();
        let (old, _rx) = session(&factory);
        old.enqueue_remote_candidate(candidate(HOST_A)).await;
        old.enqueue_remote_candidate(candidate(HOST_B)).await;

        let moved = old.take_pending_candidates();
        assert_eq!(old.pending_candidate_count(), 0);
        old.teardown();

        let (replacement, _rx2) = session(&factory);
        for c in moved {
            replacement.enqueue_remote_candidate(c).await;
        }
        assert_eq!(replacement.pending_candidate_count(), 2);
    }
}
