//! Call state machine
//!
//! One [`CallController`] runs per room membership as a single task. User
//! commands, inbound relay events and the results of spawned negotiation
//! steps all arrive through one queue, so descriptors and candidates are
//! never applied concurrently. Media acquisition and descriptor generation run
//! in spawned tasks tagged with the call epoch; a result whose epoch is stale
//! is discarded.

use crate::event::{CallEvent, EventBus};
use callroom_core::{
    codec, CallError, IceCandidate, IceConfig, LocalMedia, MediaConnectionFactory,
    MediaConstraints, MediaDevices, MediaSource, ParticipantId, PeerSession, RoomId, SdpType,
    SessionDescriptor, SessionEvent, SessionEventKind, TrackKind,
};
use callroom_diagnostics::{ConnectionTimeline, TimelineEvent};
use callroom_signaling::{
    MembershipChange, ParticipantInfo, RelayClient, RelayEvent, RelayMessage, RelaySubscription,
    RoomMembership,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Call state of one room membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No call; a remote participant may or may not be known
    Idle,
    /// Waiting for local media before sending an offer
    AwaitingLocalMedia,
    /// Offer sent or being generated, waiting for the answer
    Offering,
    /// Answering a remote offer
    AnsweringIncoming,
    /// Both descriptors installed on the live session
    Connected,
    /// Call ended by the user
    Ended,
}

impl CallState {
    /// Wire-style name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::AwaitingLocalMedia => "awaiting_local_media",
            CallState::Offering => "offering",
            CallState::AnsweringIncoming => "answering_incoming",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        }
    }

    /// Whether a call attempt is under way or established
    pub fn in_call(&self) -> bool {
        !matches!(self, CallState::Idle | CallState::Ended)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published after every change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatus {
    /// Current call state
    pub state: CallState,
    /// Current remote participant
    pub remote: Option<ParticipantId>,
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// User-originated requests
#[derive(Debug)]
pub(crate) enum Command {
    StartCall(Reply<()>),
    EndCall(Reply<()>),
    SetMediaEnabled {
        kind: TrackKind,
        // None flips the current value
        enabled: Option<bool>,
        reply: Reply<Option<bool>>,
    },
    RestartIce(Reply<()>),
    Leave(Reply<()>),
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum StepOutcome {
    Offer(Result<SessionDescriptor, CallError>),
    Answer(Result<SessionDescriptor, CallError>),
    RemoteAnswer(Result<(), CallError>),
}

/// Everything the controller reacts to
#[derive(Debug)]
pub(crate) enum ControllerEvent {
    Command(Command),
    Relay(RelayEvent),
    RelayClosed,
    MediaAcquired {
        epoch: u64,
        result: Result<Arc<dyn MediaSource>, CallError>,
    },
    StepCompleted {
        epoch: u64,
        session_id: Uuid,
        outcome: StepOutcome,
    },
}

/// Offer or answer held back while a negotiation step is in flight
#[derive(Debug)]
enum Deferred {
    Offer(ParticipantId, SessionDescriptor),
    Answer(ParticipantId, SessionDescriptor),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Forwards relay events into the controller queue until dropped
///
/// Dropping the pump aborts its task, which drops the subscription.
#[derive(Debug)]
pub(crate) struct RelayPump(JoinHandle<()>);

impl RelayPump {
    pub(crate) fn spawn(
        mut subscription: RelaySubscription,
        backlog: Vec<RelayEvent>,
        queue: mpsc::UnboundedSender<ControllerEvent>,
    ) -> Self {
        for event in backlog {
            let _ = queue.send(ControllerEvent::Relay(event));
        }
        Self(tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                if queue.send(ControllerEvent::Relay(event)).is_err() {
                    return;
                }
            }
            let _ = queue.send(ControllerEvent::RelayClosed);
        }))
    }
}

impl Drop for RelayPump {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Collaborators and settings for one controller
pub(crate) struct ControllerParts {
    pub(crate) room_id: RoomId,
    pub(crate) self_id: ParticipantId,
    pub(crate) relay: Arc<dyn RelayClient>,
    pub(crate) devices: Arc<dyn MediaDevices>,
    pub(crate) factory: Arc<dyn MediaConnectionFactory>,
    pub(crate) ice_config: IceConfig,
    pub(crate) constraints: MediaConstraints,
    pub(crate) events: EventBus,
    pub(crate) timeline: ConnectionTimeline,
    pub(crate) status: watch::Sender<CallStatus>,
}

/// Per-room call state machine
pub(crate) struct CallController {
    room_id: RoomId,
    self_id: ParticipantId,
    membership: RoomMembership,
    state: CallState,
    relay: Arc<dyn RelayClient>,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn MediaConnectionFactory>,
    ice_config: IceConfig,
    constraints: MediaConstraints,
    events: EventBus,
    timeline: ConnectionTimeline,
    status: watch::Sender<CallStatus>,
    queue: mpsc::UnboundedSender<ControllerEvent>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
    pump: Option<RelayPump>,

    session: Option<PeerSession>,
    local_media: Option<LocalMedia>,
    // bumped on every reset; results tagged with an older epoch are stale
    epoch: u64,
    media_pending: bool,
    step_in_flight: bool,
    pending_offer: Option<SessionDescriptor>,
    deferred: VecDeque<Deferred>,
    // remote candidates moved from a session replaced during glare
    carried_candidates: Vec<IceCandidate>,
    // local candidates wait until the local descriptor has been sent
    descriptor_sent: bool,
    outbound_candidates: Vec<IceCandidate>,
    // the live session has reached Connected at least once
    established: bool,
    // our offer survived glare; remote candidates are stale until its answer
    glare_won: bool,
}

impl CallController {
    pub(crate) fn new(
        parts: ControllerParts,
        pump: RelayPump,
        queue: mpsc::UnboundedSender<ControllerEvent>,
        session_events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let membership = RoomMembership::join(parts.room_id.clone(), parts.self_id.clone());
        Self {
            room_id: parts.room_id,
            self_id: parts.self_id,
            membership,
            state: CallState::Idle,
            relay: parts.relay,
            devices: parts.devices,
            factory: parts.factory,
            ice_config: parts.ice_config,
            constraints: parts.constraints,
            events: parts.events,
            timeline: parts.timeline,
            status: parts.status,
            queue,
            session_events,
            pump: Some(pump),
            session: None,
            local_media: None,
            epoch: 0,
            media_pending: false,
            step_in_flight: false,
            pending_offer: None,
            deferred: VecDeque::new(),
            carried_candidates: Vec::new(),
            descriptor_sent: false,
            outbound_candidates: Vec::new(),
            established: false,
            glare_won: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut queue_rx: mpsc::UnboundedReceiver<ControllerEvent>,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        info!("Call controller for {} in room {} started", self.self_id, self.room_id);
        loop {
            let flow = tokio::select! {
                event = queue_rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => Flow::Stop,
                },
                Some(event) = session_rx.recv() => {
                    self.handle_session_event(event).await;
                    Flow::Continue
                }
            };
            if flow == Flow::Stop {
                break;
            }
        }
        self.shutdown();
        info!("Call controller for {} in room {} stopped", self.self_id, self.room_id);
    }

    async fn handle(&mut self, event: ControllerEvent) -> Flow {
        match event {
            ControllerEvent::Command(command) => {
                if self.handle_command(command).await == Flow::Stop {
                    return Flow::Stop;
                }
            }
            ControllerEvent::Relay(event) => self.handle_relay_event(event).await,
            ControllerEvent::RelayClosed => {
                warn!("Relay subscription for room {} closed", self.room_id);
                self.events.emit(CallEvent::RelayError {
                    message: "relay subscription closed".to_string(),
                    code: "RELAY_CLOSED".to_string(),
                });
                self.end_call();
                return Flow::Stop;
            }
            ControllerEvent::MediaAcquired { epoch, result } => {
                self.on_media_acquired(epoch, result).await
            }
            ControllerEvent::StepCompleted {
                epoch,
                session_id,
                outcome,
            } => self.on_step_completed(epoch, session_id, outcome).await,
        }
        self.drain_deferred().await;
        Flow::Continue
    }

    // ---- commands ----

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::StartCall(reply) => {
                let result = self.start_call().await;
                let _ = reply.send(result);
            }
            Command::EndCall(reply) => {
                self.end_call();
                let _ = reply.send(Ok(()));
            }
            Command::SetMediaEnabled {
                kind,
                enabled,
                reply,
            } => {
                let _ = reply.send(Ok(self.set_media_enabled(kind, enabled)));
            }
            Command::RestartIce(reply) => {
                let result = self.restart_ice().await;
                let _ = reply.send(result);
            }
            Command::Leave(reply) => {
                self.leave().await;
                let _ = reply.send(Ok(()));
                return Flow::Stop;
            }
            Command::Shutdown => {
                self.leave().await;
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn start_call(&mut self) -> Result<(), CallError> {
        match self.state {
            CallState::Ended => Err(CallError::InvalidState {
                expected: "idle or connected".to_string(),
                actual: self.state.to_string(),
            }),
            CallState::AwaitingLocalMedia | CallState::Offering | CallState::AnsweringIncoming => {
                debug!("Room {}: call already in progress ({})", self.room_id, self.state);
                Ok(())
            }
            CallState::Connected => {
                if self.step_in_flight {
                    return Ok(());
                }
                let (session, source) = match (&self.session, &self.local_media) {
                    (Some(session), Some(media)) => (session.clone(), media.source()),
                    _ => {
                        return Err(CallError::InvalidState {
                            expected: "live session with local media".to_string(),
                            actual: "connected without a session".to_string(),
                        })
                    }
                };
                info!("Room {}: renegotiating with {}", self.room_id, session.remote());
                self.transition(CallState::Offering);
                self.spawn_offer(session, source);
                Ok(())
            }
            CallState::Idle => {
                let remote = self
                    .membership
                    .remote()
                    .cloned()
                    .ok_or(CallError::NoRemoteParticipant)?;
                info!("Room {}: starting call to {}", self.room_id, remote);
                self.transition(CallState::AwaitingLocalMedia);
                if self.local_media.is_some() {
                    self.proceed_with_media().await;
                } else {
                    self.request_media();
                }
                Ok(())
            }
        }
    }

    fn end_call(&mut self) {
        if self.state == CallState::Ended {
            return;
        }
        if self.state == CallState::Idle && self.session.is_none() && self.local_media.is_none() {
            debug!("Room {}: no call to end", self.room_id);
            return;
        }
        info!("Room {}: ending call", self.room_id);
        self.reset_call();
        self.transition(CallState::Ended);
    }

    fn set_media_enabled(&mut self, kind: TrackKind, enabled: Option<bool>) -> Option<bool> {
        let media = self.local_media.as_ref()?;
        if !media.has_track(kind) {
            debug!("Room {}: no local {} track to toggle", self.room_id, kind.media_name());
            return None;
        }
        let current = match kind {
            TrackKind::Audio => media.audio_enabled(),
            TrackKind::Video => media.video_enabled(),
        };
        let target = enabled.unwrap_or(!current);
        if target != current {
            match kind {
                TrackKind::Audio => media.set_audio_enabled(target),
                TrackKind::Video => media.set_video_enabled(target),
            }
            info!("Room {}: local {} {}", self.room_id, kind.media_name(), if target { "enabled" } else { "disabled" });
            self.events.emit(CallEvent::LocalMediaToggled {
                kind,
                enabled: target,
            });
        }
        Some(target)
    }

    async fn restart_ice(&mut self) -> Result<(), CallError> {
        match (&self.session, self.state) {
            (Some(session), CallState::Connected) => session.clone().restart_ice().await,
            _ => Err(CallError::InvalidState {
                expected: CallState::Connected.to_string(),
                actual: self.state.to_string(),
            }),
        }
    }

    async fn leave(&mut self) {
        let in_call = self.state.in_call() || self.session.is_some();
        self.reset_call();
        if in_call {
            self.transition(CallState::Ended);
        }
        self.pump = None;
        if let Err(e) = self
            .relay
            .send(RelayMessage::LeaveRoom {
                room_id: self.room_id.clone(),
            })
            .await
        {
            warn!("Room {}: leave notification failed: {}", self.room_id, e);
        }
        info!("{} left room {}", self.self_id, self.room_id);
    }

    fn shutdown(&mut self) {
        self.reset_call();
        self.pump = None;
        self.events.close();
    }

    // ---- relay events ----

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        let name = event.event_name();
        match event {
            RelayEvent::RoomJoined { .. } => debug!("Room {}: repeated join ack", self.room_id),
            RelayEvent::UserJoined {
                participant_id,
                info,
            } => self.on_participant_joined(participant_id, info),
            RelayEvent::ParticipantLeft { participant_id } => {
                self.on_participant_left(&participant_id)
            }
            RelayEvent::IncomingCall { from, offer } => {
                match codec::decode_descriptor(&offer, SdpType::Offer) {
                    Ok(offer) if self.step_in_flight => {
                        debug!("Room {}: deferring offer from {}", self.room_id, from);
                        self.deferred.push_back(Deferred::Offer(from, offer));
                    }
                    Ok(offer) => self.on_incoming_offer(from, offer).await,
                    Err(e) => self.drop_message(name, e.to_string()),
                }
            }
            RelayEvent::CallAccepted { from, answer } => {
                match codec::decode_descriptor(&answer, SdpType::Answer) {
                    Ok(answer) if self.step_in_flight => {
                        debug!("Room {}: deferring answer from {}", self.room_id, from);
                        self.deferred.push_back(Deferred::Answer(from, answer));
                    }
                    Ok(answer) => self.on_answer_received(from, answer),
                    Err(e) => self.drop_message(name, e.to_string()),
                }
            }
            RelayEvent::IceCandidate { from, candidate } => match codec::decode_candidate(&candidate) {
                Ok(candidate) => self.on_remote_candidate(from, candidate).await,
                Err(e) => self.drop_message(name, e.to_string()),
            },
            RelayEvent::Error { error, error_code } => {
                warn!("Room {}: relay error {}: {}", self.room_id, error_code, error);
                self.events.emit(CallEvent::RelayError {
                    message: error,
                    code: error_code,
                });
            }
        }
    }

    async fn drain_deferred(&mut self) {
        while !self.step_in_flight {
            match self.deferred.pop_front() {
                Some(Deferred::Offer(from, offer)) => self.on_incoming_offer(from, offer).await,
                Some(Deferred::Answer(from, answer)) => self.on_answer_received(from, answer),
                None => break,
            }
        }
    }

    fn on_participant_joined(&mut self, id: ParticipantId, info: ParticipantInfo) {
        if let MembershipChange::RemoteJoined { remote, replaced } =
            self.membership.on_participant_joined(id, info.clone())
        {
            if let Some(previous) = replaced {
                info!("Room {}: {} replaces {} as remote", self.room_id, remote, previous);
            }
            if self.session.is_some() || self.state != CallState::Idle {
                self.reset_call();
                self.transition(CallState::Idle);
            }
            self.publish_status();
            self.events.emit(CallEvent::RemoteParticipantJoined {
                participant_id: remote,
                info,
            });
        }
    }

    fn on_participant_left(&mut self, id: &ParticipantId) {
        if let MembershipChange::RemoteLeft { remote } = self.membership.on_participant_left(id) {
            info!("Room {}: remote {} left", self.room_id, remote);
            let in_call = self.state.in_call() || self.session.is_some();
            self.reset_call();
            self.publish_status();
            self.events.emit(CallEvent::RemoteParticipantLeft {
                participant_id: remote,
            });
            if in_call {
                self.transition(CallState::Ended);
            }
            self.transition(CallState::Idle);
        }
    }

    async fn on_incoming_offer(&mut self, from: ParticipantId, offer: SessionDescriptor) {
        match self.state {
            CallState::Ended => {
                self.drop_message("incoming call", "call ended; rejoin to call again".to_string())
            }
            CallState::Idle | CallState::AwaitingLocalMedia => {
                if let MembershipChange::RemoteJoined { remote, replaced } =
                    self.membership.adopt_remote(from.clone())
                {
                    if replaced.is_some() {
                        self.teardown_session();
                    }
                    let info = self
                        .membership
                        .remote_participant()
                        .map(|p| p.info.clone())
                        .unwrap_or_default();
                    self.publish_status();
                    self.events.emit(CallEvent::RemoteParticipantJoined {
                        participant_id: remote,
                        info,
                    });
                }
                self.begin_answer(from, offer).await;
            }
            CallState::Offering => {
                if !self.membership.is_remote(&from) {
                    self.drop_message("incoming call", format!("offer from non-current participant {}", from));
                    return;
                }
                if self.self_id < from {
                    info!("Room {}: glare with {}, yielding our offer", self.room_id, from);
                    if let Some(session) = &self.session {
                        let mut carried = session.take_pending_candidates();
                        carried.append(&mut self.carried_candidates);
                        self.carried_candidates = carried;
                    }
                    self.epoch += 1;
                    self.teardown_session();
                    self.begin_answer(from, offer).await;
                } else {
                    info!("Room {}: glare with {}, keeping our offer", self.room_id, from);
                    // candidates seen so far belong to the connection the remote is abandoning
                    if let Some(session) = &self.session {
                        let stale = session.take_pending_candidates();
                        if !stale.is_empty() {
                            debug!("Room {}: discarding {} candidates from {}'s yielded offer", self.room_id, stale.len(), from);
                        }
                    }
                    self.glare_won = true;
                }
            }
            CallState::AnsweringIncoming | CallState::Connected => {
                if !self.membership.is_remote(&from) {
                    self.drop_message("incoming call", format!("offer from non-current participant {}", from));
                    return;
                }
                debug!("Room {}: answering renewed offer from {}", self.room_id, from);
                self.begin_answer(from, offer).await;
            }
        }
    }

    async fn begin_answer(&mut self, from: ParticipantId, offer: SessionDescriptor) {
        if let Err(e) = self.ensure_session(&from).await {
            self.fail_call(e);
            return;
        }
        self.pending_offer = Some(offer);
        self.transition(CallState::AnsweringIncoming);
        if self.local_media.is_some() {
            self.proceed_with_media().await;
        } else {
            self.request_media();
        }
    }

    fn on_answer_received(&mut self, from: ParticipantId, answer: SessionDescriptor) {
        if self.state != CallState::Offering {
            self.drop_message("call:accepted", format!("unexpected answer in state {}", self.state));
            return;
        }
        match self.session.clone() {
            Some(session) if session.remote() == &from => {
                self.glare_won = false;
                self.spawn_remote_answer(session, answer)
            }
            _ => self.drop_message("call:accepted", format!("answer from non-current participant {}", from)),
        }
    }

    async fn on_remote_candidate(&mut self, from: ParticipantId, candidate: IceCandidate) {
        if self.state == CallState::Ended {
            debug!("Room {}: ignoring candidate after call end", self.room_id);
            return;
        }
        match self.session.clone() {
            Some(_) if self.glare_won && self.membership.is_remote(&from) => {
                debug!("Room {}: ignoring candidate for {}'s yielded offer", self.room_id, from);
            }
            Some(session) if session.remote() == &from => {
                let disposition = session.enqueue_remote_candidate(candidate).await;
                debug!("Room {}: remote candidate {:?}", self.room_id, disposition);
            }
            _ => self.drop_message(
                "peer:ice-candidate",
                format!("no session for candidate from {}", from),
            ),
        }
    }

    // ---- async step results ----

    async fn on_media_acquired(&mut self, epoch: u64, result: Result<Arc<dyn MediaSource>, CallError>) {
        if epoch != self.epoch {
            debug!("Room {}: discarding stale media result", self.room_id);
            if let Ok(source) = result {
                LocalMedia::new(source).release();
            }
            return;
        }
        self.media_pending = false;

        match result {
            Ok(source) => {
                let media = LocalMedia::new(source);
                if !matches!(self.state, CallState::AwaitingLocalMedia | CallState::AnsweringIncoming) {
                    media.release();
                    return;
                }
                let kinds = media.source().track_kinds();
                info!("Room {}: local media ready ({} tracks)", self.room_id, kinds.len());
                self.local_media = Some(media);
                self.events.emit(CallEvent::LocalMediaReady { kinds });
                self.proceed_with_media().await;
            }
            Err(e) => {
                warn!("Room {}: local media unavailable: {}", self.room_id, e);
                self.fail_call(e);
            }
        }
    }

    async fn on_step_completed(&mut self, epoch: u64, session_id: Uuid, outcome: StepOutcome) {
        let session = match &self.session {
            Some(session) if epoch == self.epoch && session.id() == session_id => session.clone(),
            _ => {
                debug!("Room {}: discarding stale step result", self.room_id);
                return;
            }
        };
        self.step_in_flight = false;
        self.timeline.record(
            session_id,
            TimelineEvent::Phase {
                phase: session.phase(),
            },
        );

        match outcome {
            StepOutcome::Offer(Ok(offer)) => {
                let to = session.remote().clone();
                let message = RelayMessage::Call {
                    to: to.clone(),
                    offer: codec::encode_descriptor(&offer),
                };
                match self.relay.send(message).await {
                    Ok(()) => {
                        info!("Room {}: offer sent to {}", self.room_id, to);
                        self.open_candidate_gate(&to).await;
                    }
                    Err(e) => self.on_step_failed(e),
                }
            }
            StepOutcome::Answer(Ok(answer)) => {
                self.pending_offer = None;
                let to = session.remote().clone();
                let message = RelayMessage::CallAccepted {
                    to: to.clone(),
                    answer: codec::encode_descriptor(&answer),
                };
                match self.relay.send(message).await {
                    Ok(()) => {
                        info!("Room {}: answer sent to {}", self.room_id, to);
                        self.transition(CallState::Connected);
                        self.open_candidate_gate(&to).await;
                    }
                    Err(e) => self.on_step_failed(e),
                }
            }
            StepOutcome::RemoteAnswer(Ok(())) => self.transition(CallState::Connected),
            StepOutcome::RemoteAnswer(Err(e)) if e.is_protocol_violation() => {
                self.drop_message("call:accepted", e.to_string())
            }
            StepOutcome::Offer(Err(e))
            | StepOutcome::Answer(Err(e))
            | StepOutcome::RemoteAnswer(Err(e)) => self.on_step_failed(e),
        }
    }

    /// A failed step ends the attempt unless the session had already connected
    fn on_step_failed(&mut self, error: CallError) {
        if matches!(error, CallError::SessionEnded { .. }) {
            debug!("Room {}: step ended with its session", self.room_id);
            return;
        }
        if self.established && !error.is_terminal() {
            warn!("Room {}: renegotiation failed: {}", self.room_id, error);
            self.pending_offer = None;
            self.transition(CallState::Connected);
            self.events.emit(CallEvent::Error { error });
        } else {
            self.fail_call(error);
        }
    }

    // ---- session events ----

    async fn handle_session_event(&mut self, event: SessionEvent) {
        let session = match &self.session {
            Some(session) if session.id() == event.session_id => session.clone(),
            _ => return,
        };
        let remote = session.remote().clone();

        match event.kind {
            SessionEventKind::LocalCandidateProduced(candidate) => {
                if self.descriptor_sent {
                    self.send_candidate(&remote, candidate).await;
                } else {
                    self.outbound_candidates.push(candidate);
                }
            }
            SessionEventKind::RemoteTrackAvailable(stream) => {
                info!("Room {}: remote {} track from {}", self.room_id, stream.kind.media_name(), remote);
                self.events.emit(CallEvent::RemoteTrackAvailable {
                    participant_id: remote,
                    stream,
                });
            }
            SessionEventKind::ConnectionStateChanged(state) => {
                debug!("Room {}: connection to {} is {:?}", self.room_id, remote, state);
                self.timeline
                    .record(event.session_id, TimelineEvent::Connection { state });
                self.events.emit(CallEvent::ConnectionStateChanged {
                    participant_id: remote,
                    state,
                });
            }
        }
    }

    // ---- helpers ----

    fn transition(&mut self, to: CallState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        if to == CallState::Connected {
            self.established = true;
        }
        info!("Room {}: call state {} -> {}", self.room_id, from, to);
        self.publish_status();
        self.events.emit(CallEvent::StateChanged { from, to });
    }

    fn publish_status(&self) {
        self.status.send_replace(CallStatus {
            state: self.state,
            remote: self.membership.remote().cloned(),
        });
    }

    fn drop_message(&self, event: &str, reason: String) {
        warn!("Room {}: dropped {}: {}", self.room_id, event, reason);
        self.events.emit(CallEvent::MessageDropped {
            event: event.to_string(),
            reason,
        });
    }

    /// Send to the relay; failures are surfaced, not retried
    async fn send(&self, message: RelayMessage) -> bool {
        let event = message.event_name();
        match self.relay.send(message).await {
            Ok(()) => true,
            Err(error) => {
                warn!("Room {}: {} not delivered: {}", self.room_id, event, error);
                self.events.emit(CallEvent::Error { error });
                false
            }
        }
    }

    async fn send_candidate(&self, to: &ParticipantId, candidate: IceCandidate) {
        self.send(RelayMessage::IceCandidate {
            to: to.clone(),
            candidate: codec::encode_candidate(&candidate),
        })
        .await;
    }

    async fn open_candidate_gate(&mut self, to: &ParticipantId) {
        self.descriptor_sent = true;
        for candidate in std::mem::take(&mut self.outbound_candidates) {
            self.send_candidate(to, candidate).await;
        }
    }

    async fn ensure_session(&mut self, remote: &ParticipantId) -> Result<PeerSession, CallError> {
        if let Some(session) = &self.session {
            if session.remote() == remote && !session.is_ended() {
                return Ok(session.clone());
            }
        }
        self.teardown_session();

        let session = PeerSession::new(
            remote.clone(),
            self.factory.as_ref(),
            &self.ice_config,
            self.session_events.clone(),
        )?;
        self.timeline.record(
            session.id(),
            TimelineEvent::SessionStarted {
                remote: remote.clone(),
            },
        );
        for candidate in std::mem::take(&mut self.carried_candidates) {
            session.enqueue_remote_candidate(candidate).await;
        }
        self.session = Some(session.clone());
        Ok(session)
    }

    fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            if session.teardown() {
                self.timeline.record(session.id(), TimelineEvent::SessionEnded);
            }
        }
        self.descriptor_sent = false;
        self.outbound_candidates.clear();
        self.established = false;
        self.glare_won = false;
    }

    /// Tear down the session, release media and invalidate in-flight work
    fn reset_call(&mut self) {
        self.epoch += 1;
        self.teardown_session();
        if let Some(media) = self.local_media.take() {
            media.release();
        }
        self.media_pending = false;
        self.step_in_flight = false;
        self.pending_offer = None;
        self.deferred.clear();
        self.carried_candidates.clear();
    }

    /// End the current attempt and return to idle
    fn fail_call(&mut self, error: CallError) {
        warn!("Room {}: call attempt failed: {}", self.room_id, error);
        self.reset_call();
        self.transition(CallState::Idle);
        self.events.emit(CallEvent::CallFailed { error });
    }

    async fn proceed_with_media(&mut self) {
        let source = match &self.local_media {
            Some(media) => media.source(),
            None => return,
        };
        match self.state {
            CallState::AwaitingLocalMedia => {
                let remote = match self.membership.remote().cloned() {
                    Some(remote) => remote,
                    None => {
                        self.fail_call(CallError::NoRemoteParticipant);
                        return;
                    }
                };
                match self.ensure_session(&remote).await {
                    Ok(session) => {
                        self.transition(CallState::Offering);
                        self.spawn_offer(session, source);
                    }
                    Err(e) => self.fail_call(e),
                }
            }
            CallState::AnsweringIncoming if !self.step_in_flight => {
                if let (Some(session), Some(offer)) = (self.session.clone(), self.pending_offer.clone()) {
                    self.spawn_answer(session, source, offer);
                }
            }
            _ => {}
        }
    }

    fn request_media(&mut self) {
        if self.media_pending {
            return;
        }
        self.media_pending = true;
        let devices = Arc::clone(&self.devices);
        let constraints = self.constraints;
        let queue = self.queue.clone();
        let epoch = self.epoch;
        debug!("Room {}: requesting local media {:?}", self.room_id, constraints);

        tokio::spawn(async move {
            let result = devices.acquire(constraints).await;
            if let Err(mpsc::error::SendError(ControllerEvent::MediaAcquired {
                result: Ok(source),
                ..
            })) = queue.send(ControllerEvent::MediaAcquired { epoch, result })
            {
                source.release();
            }
        });
    }

    fn spawn_offer(&mut self, session: PeerSession, source: Arc<dyn MediaSource>) {
        self.step_in_flight = true;
        let queue = self.queue.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let session_id = session.id();
            let result = async {
                session.attach_local_tracks(source).await?;
                session.create_offer().await
            }
            .await;
            let _ = queue.send(ControllerEvent::StepCompleted {
                epoch,
                session_id,
                outcome: StepOutcome::Offer(result),
            });
        });
    }

    fn spawn_answer(&mut self, session: PeerSession, source: Arc<dyn MediaSource>, offer: SessionDescriptor) {
        self.step_in_flight = true;
        let queue = self.queue.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let session_id = session.id();
            let result = async {
                session.attach_local_tracks(source).await?;
                session.create_answer(offer).await
            }
            .await;
            let _ = queue.send(ControllerEvent::StepCompleted {
                epoch,
                session_id,
                outcome: StepOutcome::Answer(result),
            });
        });
    }

    fn spawn_remote_answer(&mut self, session: PeerSession, answer: SessionDescriptor) {
        self.step_in_flight = true;
        let queue = self.queue.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let session_id = session.id();
            let result = session.apply_remote_answer(answer).await;
            let _ = queue.send(ControllerEvent::StepCompleted {
                epoch,
                session_id,
                outcome: StepOutcome::RemoteAnswer(result),
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_state_names() {
        assert_eq!(CallState::AwaitingLocalMedia.as_str(), "awaiting_local_media");
        assert_eq!(CallState::AnsweringIncoming.to_string(), "answering_incoming");
        assert_eq!(
            serde_json::to_value(CallState::Connected).unwrap(),
            serde_json::json!("connected")
        );
    }

    #[test]
    fn test_in_call() {
        assert!(!CallState::Idle.in_call());
        assert!(!CallState::Ended.in_call());
        assert!(CallState::AwaitingLocalMedia.in_call());
        assert!(CallState::Offering.in_call());
        assert!(CallState::AnsweringIncoming.in_call());
        assert!(CallState::Connected.in_call());
    }
}
