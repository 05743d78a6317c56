//! Room management and API

use crate::controller::{
    CallController, CallState, CallStatus, Command, ControllerEvent, ControllerParts, RelayPump,
    Reply,
};
use crate::event::{EventBus, EventStream};
use crate::{CallClient, RoomConfig};
use callroom_core::{CallError, ParticipantId, RoomId, TrackKind};
use callroom_diagnostics::ConnectionTimeline;
use callroom_signaling::{ParticipantInfo, RelayClient, RelayEvent, RelayMessage, RelaySubscription};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fluent builder for room configuration and joining
pub struct RoomBuilder {
    client: CallClient,
    room_id: String,
    relay: Option<Arc<dyn RelayClient>>,
    config: RoomConfig,
}

impl fmt::Debug for RoomBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomBuilder")
            .field("room_id", &self.room_id)
            .field("has_relay", &self.relay.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl RoomBuilder {
    pub(crate) fn new(client: &CallClient, room_id: &str) -> Self {
        Self {
            client: client.clone(),
            room_id: room_id.to_string(),
            relay: None,
            config: RoomConfig::default(),
        }
    }

    /// Relay connection used for this membership (required)
    pub fn relay(mut self, relay: Arc<dyn RelayClient>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Display name sent with the join
    pub fn display_name(mut self, name: &str) -> Self {
        self.config.participant_info.display_name = Some(name.to_string());
        self
    }

    /// Email sent with the join
    pub fn email(mut self, email: &str) -> Self {
        self.config.participant_info.email = Some(email.to_string());
        self
    }

    /// Replace the whole self-description
    pub fn participant_info(mut self, info: ParticipantInfo) -> Self {
        self.config.participant_info = info;
        self
    }

    /// Capture audio (default on)
    pub fn audio(mut self, enabled: bool) -> Self {
        self.config.audio_enabled = enabled;
        self
    }

    /// Capture video (default on)
    pub fn video(mut self, enabled: bool) -> Self {
        self.config.video_enabled = enabled;
        self
    }

    /// Replace the room configuration
    pub fn config(mut self, config: RoomConfig) -> Self {
        self.config = config;
        self
    }

    /// Join the room with the current configuration
    ///
    /// Resolves once the relay acknowledges the join with our participant id.
    pub async fn join(self) -> Result<Room, CallError> {
        let room_id = self.room_id.trim();
        if room_id.is_empty() {
            return Err(CallError::MissingConfiguration {
                field: "room_id".to_string(),
            });
        }
        if self.config.participant_info.is_empty() {
            return Err(CallError::MissingConfiguration {
                field: "participant_info".to_string(),
            });
        }
        if !self.config.audio_enabled && !self.config.video_enabled {
            return Err(CallError::InvalidConfiguration {
                reason: "at least one of audio or video must be enabled".to_string(),
            });
        }
        let relay = self.relay.ok_or_else(|| CallError::MissingConfiguration {
            field: "relay".to_string(),
        })?;
        let room_id = RoomId::new(room_id);

        let client = self.client.inner();
        let registration =
            RoomRegistration::acquire(&client.rooms, &room_id, client.config.max_rooms)?;

        let mut subscription = relay.subscribe();
        let joined = match relay
            .send(RelayMessage::JoinRoom {
                room_id: room_id.clone(),
                info: self.config.participant_info.clone(),
            })
            .await
        {
            Ok(()) => wait_for_join_ack(&mut subscription, &room_id, client.config.join_timeout).await,
            Err(e) => Err(e),
        };
        let (self_id, backlog) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                // the relay may have registered us before failing
                if let Err(leave_err) = relay
                    .send(RelayMessage::LeaveRoom {
                        room_id: room_id.clone(),
                    })
                    .await
                {
                    warn!("Leave after failed join of {} not delivered: {}", room_id, leave_err);
                }
                return Err(e);
            }
        };

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(CallStatus {
            state: CallState::Idle,
            remote: None,
        });
        let events = EventBus::default();
        let first_events = events.subscribe();
        let timeline = ConnectionTimeline::new();

        let pump = RelayPump::spawn(subscription, backlog, queue_tx.clone());
        let controller = CallController::new(
            ControllerParts {
                room_id: room_id.clone(),
                self_id: self_id.clone(),
                relay,
                devices: Arc::clone(&client.devices),
                factory: Arc::clone(&client.factory),
                ice_config: client.config.ice_config(),
                constraints: self.config.media_constraints(),
                events: events.clone(),
                timeline: timeline.clone(),
                status: status_tx,
            },
            pump,
            queue_tx.clone(),
            session_tx,
        );
        let task = tokio::spawn(controller.run(queue_rx, session_rx));

        info!("Joined room {} as {}", room_id, self_id);
        Ok(Room {
            id: room_id,
            participant_id: self_id,
            info: self.config.participant_info,
            queue: queue_tx,
            status: status_rx,
            events,
            first_events: Mutex::new(Some(first_events)),
            timeline,
            task: Some(task),
            _registration: registration,
        })
    }
}

/// Wait for our own `room:join` ack, keeping anything else for the controller
async fn wait_for_join_ack(
    subscription: &mut RelaySubscription,
    room_id: &RoomId,
    limit: Duration,
) -> Result<(ParticipantId, Vec<RelayEvent>), CallError> {
    let mut backlog = Vec::new();
    let ack = async {
        while let Some(event) = subscription.next().await {
            match event {
                RelayEvent::RoomJoined {
                    room_id: joined,
                    participant_id,
                } if &joined == room_id => return Ok(participant_id),
                RelayEvent::Error { error, error_code } => {
                    return Err(CallError::InvalidState {
                        expected: "room:join acknowledgement".to_string(),
                        actual: format!("relay error {}: {}", error_code, error),
                    })
                }
                other => backlog.push(other),
            }
        }
        Err(CallError::InvalidState {
            expected: "room:join acknowledgement".to_string(),
            actual: "relay subscription closed".to_string(),
        })
    };

    let participant_id = tokio::time::timeout(limit, ack)
        .await
        .map_err(|_| CallError::Timeout {
            operation: "room:join".to_string(),
            duration: limit,
        })??;
    Ok((participant_id, backlog))
}

/// Slot in the client's room registry, freed on drop
#[derive(Debug)]
pub(crate) struct RoomRegistration {
    rooms: Arc<DashMap<RoomId, DateTime<Utc>>>,
    room_id: RoomId,
}

impl RoomRegistration {
    pub(crate) fn acquire(
        rooms: &Arc<DashMap<RoomId, DateTime<Utc>>>,
        room_id: &RoomId,
        limit: usize,
    ) -> Result<Self, CallError> {
        match rooms.entry(room_id.clone()) {
            Entry::Occupied(_) => {
                return Err(CallError::RoomAlreadyJoined {
                    room_id: room_id.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
            }
        }
        // claimed before counting; concurrent joins cannot both fit past the limit
        if rooms.len() > limit {
            rooms.remove(room_id);
            return Err(CallError::RoomLimitExceeded { limit });
        }
        Ok(Self {
            rooms: Arc::clone(rooms),
            room_id: room_id.clone(),
        })
    }
}

impl Drop for RoomRegistration {
    fn drop(&mut self) {
        self.rooms.remove(&self.room_id);
        debug!("Room {} released", self.room_id);
    }
}

/// Membership of one room, driving at most one call at a time
///
/// Dropping the room leaves it.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    participant_id: ParticipantId,
    info: ParticipantInfo,
    queue: mpsc::UnboundedSender<ControllerEvent>,
    status: watch::Receiver<CallStatus>,
    events: EventBus,
    // subscribed before the controller started, handed to the first events() call
    first_events: Mutex<Option<EventStream>>,
    timeline: ConnectionTimeline,
    task: Option<JoinHandle<()>>,
    _registration: RoomRegistration,
}

impl Room {
    /// Get room ID
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Participant ID assigned by the relay
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Self-description sent with the join
    pub fn participant_info(&self) -> &ParticipantInfo {
        &self.info
    }

    /// Current call state
    pub fn state(&self) -> CallState {
        self.status.borrow().state
    }

    /// Current call state and remote participant
    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    /// The participant a call would be placed to
    pub fn remote_participant(&self) -> Option<ParticipantId> {
        self.status.borrow().remote.clone()
    }

    /// Subscribe to room events
    ///
    /// The first call returns a stream that starts at the join, so events from
    /// the relay backlog are not missed. Later calls see events from now on.
    pub fn events(&self) -> EventStream {
        self.first_events
            .lock()
            .take()
            .unwrap_or_else(|| self.events.subscribe())
    }

    /// Per-session negotiation and connectivity history
    pub fn connection_timeline(&self) -> &ConnectionTimeline {
        &self.timeline
    }

    /// Call the current remote participant
    ///
    /// Returns once the attempt has started. When already connected this
    /// renegotiates with a fresh offer; when an attempt is under way it does
    /// nothing.
    pub async fn start_call(&self) -> Result<(), CallError> {
        self.request(Command::StartCall).await
    }

    /// End the current call, releasing the session and local media
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(Command::EndCall).await
    }

    /// Enable or disable sending audio; `None` when no local audio track is held
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<Option<bool>, CallError> {
        self.set_media_enabled(TrackKind::Audio, Some(enabled)).await
    }

    /// Enable or disable sending video; `None` when no local video track is held
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<Option<bool>, CallError> {
        self.set_media_enabled(TrackKind::Video, Some(enabled)).await
    }

    /// Flip audio and return the new value; `None` without a local audio track
    pub async fn toggle_audio(&self) -> Result<Option<bool>, CallError> {
        self.set_media_enabled(TrackKind::Audio, None).await
    }

    /// Flip video and return the new value; `None` without a local video track
    pub async fn toggle_video(&self) -> Result<Option<bool>, CallError> {
        self.set_media_enabled(TrackKind::Video, None).await
    }

    /// Restart ICE on the connected session
    pub async fn restart_ice(&self) -> Result<(), CallError> {
        self.request(Command::RestartIce).await
    }

    /// Wait until the call reaches `state`
    pub async fn wait_for_state(&self, state: CallState, limit: Duration) -> Result<(), CallError> {
        let mut status = self.status.clone();
        let wait = async {
            loop {
                if status.borrow_and_update().state == state {
                    return Ok(());
                }
                if status.changed().await.is_err() {
                    return Err(CallError::ControllerClosed);
                }
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| CallError::Timeout {
                operation: format!("wait for {}", state),
                duration: limit,
            })?
    }

    /// Leave the room, ending any call, and wait for the controller to stop
    pub async fn leave(mut self) -> Result<(), CallError> {
        self.request(Command::Leave).await?;
        if let Some(task) = self.task.take() {
            task.await.map_err(|_| CallError::ControllerClosed)?;
        }
        info!("Left room {}", self.id);
        Ok(())
    }

    async fn set_media_enabled(
        &self,
        kind: TrackKind,
        enabled: Option<bool>,
    ) -> Result<Option<bool>, CallError> {
        self.request(|reply| Command::SetMediaEnabled {
            kind,
            enabled,
            reply,
        })
        .await
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(ControllerEvent::Command(command(tx)))
            .map_err(|_| CallError::ControllerClosed)?;
        rx.await.map_err(|_| CallError::ControllerClosed)?
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.queue.send(ControllerEvent::Command(Command::Shutdown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_rejects_duplicates_and_frees_on_drop() {
        let rooms = Arc::new(DashMap::new());
        let standup = RoomId::from("standup");

        let held = RoomRegistration::acquire(&rooms, &standup, 2).unwrap();
        let err = RoomRegistration::acquire(&rooms, &standup, 2).unwrap_err();
        assert!(matches!(err, CallError::RoomAlreadyJoined { .. }));

        drop(held);
        assert!(rooms.is_empty());
        assert!(RoomRegistration::acquire(&rooms, &standup, 2).is_ok());
    }

    #[test]
    fn test_registration_limit_holds_under_concurrent_joins() {
        let rooms = Arc::new(DashMap::new());
        let joins: Vec<_> = (0..16)
            .map(|i| {
                let rooms = Arc::clone(&rooms);
                std::thread::spawn(move || {
                    RoomRegistration::acquire(&rooms, &RoomId::new(format!("room-{}", i)), 3).ok()
                })
            })
            .collect();

        let held: Vec<RoomRegistration> = joins
            .into_iter()
            .filter_map(|join| join.join().unwrap())
            .collect();
        assert!(held.len() <= 3);
        assert_eq!(rooms.len(), held.len());

        drop(held);
        assert!(rooms.is_empty());
    }
}
