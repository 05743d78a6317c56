//! Event system for call and room events

use crate::CallState;
use callroom_core::{CallError, ConnectionState, ParticipantId, RemoteStream, TrackKind};
use callroom_signaling::ParticipantInfo;
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// Events reported by a room membership
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// The call state machine moved
    StateChanged {
        /// Previous state
        from: CallState,
        /// New state
        to: CallState,
    },
    /// A remote participant became current
    RemoteParticipantJoined {
        /// Participant ID
        participant_id: ParticipantId,
        /// Its self-description
        info: ParticipantInfo,
    },
    /// The current remote participant left
    RemoteParticipantLeft {
        /// Participant ID
        participant_id: ParticipantId,
    },
    /// Local media was acquired
    LocalMediaReady {
        /// Kinds of track captured
        kinds: Vec<TrackKind>,
    },
    /// A local track kind was enabled or disabled
    LocalMediaToggled {
        /// Toggled kind
        kind: TrackKind,
        /// Whether it is now enabled
        enabled: bool,
    },
    /// Remote media became renderable
    RemoteTrackAvailable {
        /// Owner of the media
        participant_id: ParticipantId,
        /// The stream
        stream: RemoteStream,
    },
    /// Connectivity of the media connection changed
    ConnectionStateChanged {
        /// Remote side of the connection
        participant_id: ParticipantId,
        /// New state
        state: ConnectionState,
    },
    /// An inbound relay message was discarded
    MessageDropped {
        /// Wire name of the discarded message
        event: String,
        /// Why it was discarded
        reason: String,
    },
    /// The current call attempt failed and the room returned to idle
    CallFailed {
        /// Failure
        error: CallError,
    },
    /// A non-fatal error, such as a relay send failure
    Error {
        /// The error
        error: CallError,
    },
    /// The relay reported an error
    RelayError {
        /// Error message
        message: String,
        /// Relay error code
        code: String,
    },
}

impl CallEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            CallEvent::StateChanged { .. } => "state_changed",
            CallEvent::RemoteParticipantJoined { .. } => "remote_participant_joined",
            CallEvent::RemoteParticipantLeft { .. } => "remote_participant_left",
            CallEvent::LocalMediaReady { .. } => "local_media_ready",
            CallEvent::LocalMediaToggled { .. } => "local_media_toggled",
            CallEvent::RemoteTrackAvailable { .. } => "remote_track_available",
            CallEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            CallEvent::MessageDropped { .. } => "message_dropped",
            CallEvent::CallFailed { .. } => "call_failed",
            CallEvent::Error { .. } => "error",
            CallEvent::RelayError { .. } => "relay_error",
        }
    }

    /// Check if this is a participant-related event
    pub fn is_participant_event(&self) -> bool {
        matches!(
            self,
            CallEvent::RemoteParticipantJoined { .. } | CallEvent::RemoteParticipantLeft { .. }
        )
    }

    /// Check if this is a media-related event
    pub fn is_media_event(&self) -> bool {
        matches!(
            self,
            CallEvent::LocalMediaReady { .. }
                | CallEvent::LocalMediaToggled { .. }
                | CallEvent::RemoteTrackAvailable { .. }
        )
    }

    /// Check if this is a call or connection state event
    pub fn is_state_event(&self) -> bool {
        matches!(
            self,
            CallEvent::StateChanged { .. } | CallEvent::ConnectionStateChanged { .. }
        )
    }

    /// Check if this is an error event
    pub fn is_error_event(&self) -> bool {
        matches!(
            self,
            CallEvent::MessageDropped { .. }
                | CallEvent::CallFailed { .. }
                | CallEvent::Error { .. }
                | CallEvent::RelayError { .. }
        )
    }
}

/// Fan-out of events to every open [`EventStream`]
#[derive(Debug, Clone, Default)]
pub(crate) struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<CallEvent>>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventStream::new(rx)
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        debug!("Emitting {}", event.event_type());
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Drop every subscriber so open streams end
    pub(crate) fn close(&self) {
        self.subscribers.lock().clear();
    }
}

/// Stream of room events for async iteration
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<CallEvent>,
}

impl EventStream {
    /// Create a new event stream with a receiver
    pub fn new(receiver: mpsc::UnboundedReceiver<CallEvent>) -> Self {
        Self { receiver }
    }

    /// Get the next event from the stream
    pub async fn next(&mut self) -> Option<CallEvent> {
        self.receiver.recv().await
    }

    /// Try to get the next event without blocking
    pub fn try_next(&mut self) -> Result<Option<CallEvent>, mpsc::error::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(mpsc::error::TryRecvError::Disconnected)
            }
        }
    }

    /// Close the event stream
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl Stream for EventStream {
    type Item = CallEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<CallEvent>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn joined() -> CallEvent {
        CallEvent::RemoteParticipantJoined {
            participant_id: ParticipantId::from("p2"),
            info: ParticipantInfo::with_email("p2@example.com"),
        }
    }

    fn state_changed() -> CallEvent {
        CallEvent::StateChanged {
            from: CallState::Idle,
            to: CallState::AwaitingLocalMedia,
        }
    }

    #[test]
    fn test_event_type_classification() {
        assert!(joined().is_participant_event());
        assert!(!joined().is_state_event());

        assert!(state_changed().is_state_event());
        assert!(!state_changed().is_error_event());

        let dropped = CallEvent::MessageDropped {
            event: "peer:ice-candidate".to_string(),
            reason: "missing field".to_string(),
        };
        assert!(dropped.is_error_event());
        assert_eq!(dropped.event_type(), "message_dropped");

        let toggled = CallEvent::LocalMediaToggled {
            kind: TrackKind::Audio,
            enabled: false,
        };
        assert!(toggled.is_media_event());
    }

    #[tokio::test]
    async fn test_bus_fans_out_and_prunes_closed_streams() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(joined());
        assert_eq!(first.next().await.unwrap().event_type(), "remote_participant_joined");
        assert_eq!(second.next().await.unwrap().event_type(), "remote_participant_joined");

        drop(second);
        bus.emit(state_changed());
        assert_eq!(bus.subscribers.lock().len(), 1);
        assert!(first.try_next().unwrap().is_some());

        bus.close();
        assert!(first.try_next().is_err());
    }

    #[tokio::test]
    async fn test_event_stream_ends_when_bus_closes() {
        let bus = EventBus::default();
        let stream = bus.subscribe();
        bus.emit(joined());
        bus.emit(state_changed());
        bus.close();

        let types: Vec<&str> = stream.map(|event| event.event_type()).collect().await;
        assert_eq!(types, vec!["remote_participant_joined", "state_changed"]);
    }
}
