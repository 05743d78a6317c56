//! In-process relay
//!
//! [`LoopbackRelay`] routes messages between clients connected to the same
//! hub, the way the hosted relay routes them between sockets. It is used for
//! tests and demos.

use crate::protocol::{ParticipantInfo, RelayEvent, RelayMessage};
use crate::relay::{RelayClient, RelaySubscription};
use async_trait::async_trait;
use callroom_core::{CallError, ParticipantId, RoomId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A message as the hub received it
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    /// Sending client
    pub from: ParticipantId,
    /// The message
    pub message: RelayMessage,
}

#[derive(Debug)]
struct ClientEntry {
    sender: Option<(u64, mpsc::UnboundedSender<RelayEvent>)>,
    reachable: bool,
}

#[derive(Debug, Default)]
struct RelayHub {
    clients: DashMap<ParticipantId, ClientEntry>,
    rooms: DashMap<RoomId, Vec<(ParticipantId, ParticipantInfo)>>,
    sent: Mutex<Vec<SentMessage>>,
    next_subscription: AtomicU64,
}

impl RelayHub {
    fn sender_for(&self, id: &ParticipantId) -> Result<mpsc::UnboundedSender<RelayEvent>, String> {
        let entry = self
            .clients
            .get(id)
            .ok_or_else(|| "recipient is not connected".to_string())?;
        if !entry.reachable {
            return Err("recipient is unreachable".to_string());
        }
        entry
            .sender
            .as_ref()
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| "recipient has no subscription".to_string())
    }

    fn deliver(&self, to: &ParticipantId, event: RelayEvent) -> Result<(), CallError> {
        let failed = |reason: String| CallError::RelaySendFailed {
            to: to.clone(),
            reason,
        };
        let tx = self.sender_for(to).map_err(failed)?;
        tx.send(event)
            .map_err(|_| failed("recipient subscription closed".to_string()))
    }

    fn broadcast(&self, room_id: &RoomId, exclude: &ParticipantId, event: RelayEvent) {
        let members: Vec<ParticipantId> = match self.rooms.get(room_id) {
            Some(members) => members
                .iter()
                .filter(|(id, _)| id != exclude)
                .map(|(id, _)| id.clone())
                .collect(),
            None => return,
        };

        for member in members {
            if let Err(e) = self.deliver(&member, event.clone()) {
                debug!("Broadcast to {} in {} skipped: {}", member, room_id, e);
            }
        }
    }

    fn join(&self, id: &ParticipantId, room_id: RoomId, info: ParticipantInfo) -> Result<(), CallError> {
        {
            let mut members = self.rooms.entry(room_id.clone()).or_default();
            if !members.iter().any(|(member, _)| member == id) {
                members.push((id.clone(), info.clone()));
            }
        }

        self.broadcast(
            &room_id,
            id,
            RelayEvent::UserJoined {
                participant_id: id.clone(),
                info,
            },
        );
        self.deliver(
            id,
            RelayEvent::RoomJoined {
                room_id: room_id.clone(),
                participant_id: id.clone(),
            },
        )?;

        info!("Participant {} joined room {}", id, room_id);
        Ok(())
    }

    fn leave(&self, id: &ParticipantId, room_id: &RoomId) {
        let removed = match self.rooms.get_mut(room_id) {
            Some(mut members) => {
                let before = members.len();
                members.retain(|(member, _)| member != id);
                members.len() != before
            }
            None => false,
        };

        if removed {
            self.broadcast(
                room_id,
                id,
                RelayEvent::ParticipantLeft {
                    participant_id: id.clone(),
                },
            );
            info!("Participant {} left room {}", id, room_id);
        }
    }

    fn disconnect(&self, id: &ParticipantId) {
        let room_ids: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|room| room.value().iter().any(|(member, _)| member == id))
            .map(|room| room.key().clone())
            .collect();

        for room_id in room_ids {
            self.leave(id, &room_id);
        }
        self.clients.remove(id);
    }
}

/// Hub that connects loopback clients
#[derive(Debug, Clone, Default)]
pub struct LoopbackRelay {
    hub: Arc<RelayHub>,
}

impl LoopbackRelay {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client under the given identity
    pub fn connect(&self, id: impl Into<ParticipantId>) -> LoopbackRelayClient {
        let id = id.into();
        self.hub.clients.insert(
            id.clone(),
            ClientEntry {
                sender: None,
                reachable: true,
            },
        );
        debug!("Loopback client {} connected", id);
        LoopbackRelayClient {
            id,
            hub: Arc::clone(&self.hub),
        }
    }

    /// Make a client unreachable; directed sends to it fail
    pub fn set_reachable(&self, id: &ParticipantId, reachable: bool) {
        if let Some(mut entry) = self.hub.clients.get_mut(id) {
            entry.reachable = reachable;
        }
    }

    /// Deliver a raw event to a client, bypassing routing
    pub fn inject(&self, to: &ParticipantId, event: RelayEvent) -> Result<(), CallError> {
        self.hub.deliver(to, event)
    }

    /// Every message received by the hub, in order
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.hub.sent.lock().clone()
    }

    /// Messages of one wire type, in order
    pub fn sent_by_event(&self, event_name: &str) -> Vec<SentMessage> {
        self.hub
            .sent
            .lock()
            .iter()
            .filter(|sent| sent.message.event_name() == event_name)
            .cloned()
            .collect()
    }

    /// Members of a room
    pub fn members(&self, room_id: &RoomId) -> Vec<ParticipantId> {
        self.hub
            .rooms
            .get(room_id)
            .map(|members| members.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether a client is connected
    pub fn is_connected(&self, id: &ParticipantId) -> bool {
        self.hub.clients.contains_key(id)
    }
}

/// One client's connection to a [`LoopbackRelay`]
///
/// Dropping the client disconnects it and notifies the rooms it was in.
#[derive(Debug)]
pub struct LoopbackRelayClient {
    id: ParticipantId,
    hub: Arc<RelayHub>,
}

impl LoopbackRelayClient {
    /// Identity the hub assigned to this client
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }
}

#[async_trait]
impl RelayClient for LoopbackRelayClient {
    async fn send(&self, message: RelayMessage) -> Result<(), CallError> {
        self.hub.sent.lock().push(SentMessage {
            from: self.id.clone(),
            message: message.clone(),
        });

        let result = match message {
            RelayMessage::JoinRoom { room_id, info } => self.hub.join(&self.id, room_id, info),
            RelayMessage::LeaveRoom { room_id } => {
                self.hub.leave(&self.id, &room_id);
                Ok(())
            }
            RelayMessage::Call { to, offer } => self.hub.deliver(
                &to,
                RelayEvent::IncomingCall {
                    from: self.id.clone(),
                    offer,
                },
            ),
            RelayMessage::CallAccepted { to, answer } => self.hub.deliver(
                &to,
                RelayEvent::CallAccepted {
                    from: self.id.clone(),
                    answer,
                },
            ),
            RelayMessage::IceCandidate { to, candidate } => self.hub.deliver(
                &to,
                RelayEvent::IceCandidate {
                    from: self.id.clone(),
                    candidate,
                },
            ),
        };

        if let Err(e) = &result {
            warn!("Relay send from {} failed: {}", self.id, e);
        }
        result
    }

    fn subscribe(&self) -> RelaySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.hub.next_subscription.fetch_add(1, Ordering::Relaxed);
        if let Some(mut entry) = self.hub.clients.get_mut(&self.id) {
            entry.sender = Some((generation, tx));
        }

        let hub = Arc::clone(&self.hub);
        let id = self.id.clone();
        RelaySubscription::new(rx, move || {
            if let Some(mut entry) = hub.clients.get_mut(&id) {
                if matches!(entry.sender, Some((current, _)) if current == generation) {
                    entry.sender = None;
                }
            }
        })
    }
}

impl Drop for LoopbackRelayClient {
    fn drop(&mut self) {
        self.hub.disconnect(&self.id);
        debug!("Loopback client {} disconnected", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn room() -> RoomId {
        RoomId::from("standup")
    }

    #[tokio::test]
    async fn test_join_acks_and_notifies_members() {
        let relay = LoopbackRelay::new();
        let p1 = relay.connect("p1");
        let p2 = relay.connect("p2");
        let mut p1_events = p1.subscribe();
        let mut p2_events = p2.subscribe();

        p1.send(RelayMessage::JoinRoom {
            room_id: room(),
            info: ParticipantInfo::with_email("p1@example.com"),
        })
        .await
        .unwrap();
        assert!(matches!(
            p1_events.next().await,
            Some(RelayEvent::RoomJoined { participant_id, .. }) if participant_id.as_str() == "p1"
        ));

        p2.send(RelayMessage::JoinRoom {
            room_id: room(),
            info: ParticipantInfo::with_email("p2@example.com"),
        })
        .await
        .unwrap();
        match p1_events.next().await {
            Some(RelayEvent::UserJoined { participant_id, info }) => {
                assert_eq!(participant_id.as_str(), "p2");
                assert_eq!(info.label(), "p2@example.com");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            p2_events.next().await,
            Some(RelayEvent::RoomJoined { .. })
        ));
        // the newcomer is not told about existing members
        assert!(p2_events.try_next().is_none());
        assert_eq!(relay.members(&room()).len(), 2);
    }

    #[tokio::test]
    async fn test_directed_messages_carry_sender() {
        let relay = LoopbackRelay::new();
        let p1 = relay.connect("p1");
        let p2 = relay.connect("p2");
        let mut p2_events = p2.subscribe();

        p1.send(RelayMessage::Call {
            to: ParticipantId::from("p2"),
            offer: json!({"type": "offer", "sdp": "v=0"}),
        })
        .await
        .unwrap();

        match p2_events.next().await {
            Some(RelayEvent::IncomingCall { from, offer }) => {
                assert_eq!(from.as_str(), "p1");
                assert_eq!(offer["type"], "offer");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(relay.sent_by_event("user:call").len(), 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_or_unreachable_fails() {
        let relay = LoopbackRelay::new();
        let p1 = relay.connect("p1");
        let p2 = relay.connect("p2");
        let _p2_events = p2.subscribe();

        let err = p1
            .send(RelayMessage::IceCandidate {
                to: ParticipantId::from("ghost"),
                candidate: serde_json::Value::Null,
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RELAY_SEND_FAILED");

        relay.set_reachable(&ParticipantId::from("p2"), false);
        let err = p1
            .send(RelayMessage::CallAccepted {
                to: ParticipantId::from("p2"),
                answer: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::RelaySendFailed { to, .. } if to.as_str() == "p2"));
    }

    #[tokio::test]
    async fn test_drop_broadcasts_departure() {
        let relay = LoopbackRelay::new();
        let p1 = relay.connect("p1");
        let p2 = relay.connect("p2");
        let mut p1_events = p1.subscribe();
        let _p2_events = p2.subscribe();

        for client in [&p1, &p2] {
            client
                .send(RelayMessage::JoinRoom {
                    room_id: room(),
                    info: ParticipantInfo::default(),
                })
                .await
                .unwrap();
        }
        drop(p2);

        let mut saw_left = false;
        while let Some(event) = p1_events.try_next() {
            if let RelayEvent::ParticipantLeft { participant_id } = event {
                assert_eq!(participant_id.as_str(), "p2");
                saw_left = true;
            }
        }
        assert!(saw_left);
        assert!(!relay.is_connected(&ParticipantId::from("p2")));
        assert_eq!(relay.members(&room()), vec![ParticipantId::from("p1")]);
    }

    #[tokio::test]
    async fn test_unsubscribed_client_receives_nothing() {
        let relay = LoopbackRelay::new();
        let p1 = relay.connect("p1");
        let p2 = relay.connect("p2");
        p2.subscribe().unsubscribe();

        let result = p1
            .send(RelayMessage::Call {
                to: ParticipantId::from("p2"),
                offer: json!({}),
            })
            .await;
        assert!(result.is_err());

        // a stale guard must not clear a newer subscription
        let first = p2.subscribe();
        let mut second = p2.subscribe();
        drop(first);
        relay
            .inject(
                &ParticipantId::from("p2"),
                RelayEvent::ParticipantLeft {
                    participant_id: ParticipantId::from("p3"),
                },
            )
            .unwrap();
        assert!(second.try_next().is_some());
    }
}
