//! Room membership tracking

use crate::protocol::ParticipantInfo;
use callroom_core::{ParticipantId, RoomId};
use std::collections::HashMap;
use tracing::{debug, info};

/// Participant seen in a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Relay-assigned identifier
    pub id: ParticipantId,
    /// Self-description from the join
    pub info: ParticipantInfo,
    /// When this client learned about the participant
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

/// Effect of a membership update on the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    /// A new remote participant became current
    RemoteJoined {
        /// The new remote
        remote: ParticipantId,
        /// The remote it displaced, if any
        replaced: Option<ParticipantId>,
    },
    /// The current remote participant left
    RemoteLeft {
        /// The departed remote
        remote: ParticipantId,
    },
    /// Nothing the call needs to react to
    Ignored,
}

/// One client's membership in one room: itself plus at most one current remote
#[derive(Debug, Clone)]
pub struct RoomMembership {
    room_id: RoomId,
    self_id: ParticipantId,
    participants: HashMap<ParticipantId, Participant>,
    remote: Option<ParticipantId>,
    joined_at: chrono::DateTime<chrono::Utc>,
}

impl RoomMembership {
    /// Register this client in a room; no remote is known yet
    pub fn join(room_id: RoomId, self_id: ParticipantId) -> Self {
        debug!("Membership of {} in room {} registered", self_id, room_id);
        Self {
            room_id,
            self_id,
            participants: HashMap::new(),
            remote: None,
            joined_at: chrono::Utc::now(),
        }
    }

    /// Room ID
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// This client's identifier
    pub fn self_id(&self) -> &ParticipantId {
        &self.self_id
    }

    /// Current remote participant
    pub fn remote(&self) -> Option<&ParticipantId> {
        self.remote.as_ref()
    }

    /// Details of the current remote participant
    pub fn remote_participant(&self) -> Option<&Participant> {
        self.remote.as_ref().and_then(|id| self.participants.get(id))
    }

    /// Whether `id` is the current remote
    pub fn is_remote(&self, id: &ParticipantId) -> bool {
        self.remote.as_ref() == Some(id)
    }

    /// Get participant by ID
    pub fn get_participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    /// Number of other participants seen and not yet departed
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// When this membership started
    pub fn joined_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.joined_at
    }

    /// Record a participant that joined the room
    pub fn on_participant_joined(&mut self, id: ParticipantId, info: ParticipantInfo) -> MembershipChange {
        if id == self.self_id {
            return MembershipChange::Ignored;
        }
        if self.remote.as_ref() == Some(&id) {
            debug!("Participant {} already current in room {}", id, self.room_id);
            return MembershipChange::Ignored;
        }

        self.participants.insert(
            id.clone(),
            Participant {
                id: id.clone(),
                info,
                joined_at: chrono::Utc::now(),
            },
        );
        let replaced = self.remote.replace(id.clone());
        info!("Participant {} joined room {}", id, self.room_id);
        MembershipChange::RemoteJoined {
            remote: id,
            replaced,
        }
    }

    /// Record a participant that left the room
    pub fn on_participant_left(&mut self, id: &ParticipantId) -> MembershipChange {
        self.participants.remove(id);
        if self.remote.as_ref() != Some(id) {
            debug!("Ignoring departure of non-current participant {}", id);
            return MembershipChange::Ignored;
        }
        self.remote = None;
        info!("Participant {} left room {}", id, self.room_id);
        MembershipChange::RemoteLeft { remote: id.clone() }
    }

    /// Adopt a remote learned from an inbound call rather than a join notice
    pub fn adopt_remote(&mut self, id: ParticipantId) -> MembershipChange {
        if self.remote.as_ref() == Some(&id) || id == self.self_id {
            return MembershipChange::Ignored;
        }
        self.participants.entry(id.clone()).or_insert_with(|| Participant {
            id: id.clone(),
            info: ParticipantInfo::default(),
            joined_at: chrono::Utc::now(),
        });
        let replaced = self.remote.replace(id.clone());
        MembershipChange::RemoteJoined {
            remote: id,
            replaced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership() -> RoomMembership {
        RoomMembership::join(RoomId::from("standup"), ParticipantId::from("p1"))
    }

    #[test]
    fn test_join_has_no_remote() {
        let membership = membership();
        assert_eq!(membership.room_id().as_str(), "standup");
        assert_eq!(membership.self_id().as_str(), "p1");
        assert!(membership.remote().is_none());
        assert_eq!(membership.participant_count(), 0);
    }

    #[test]
    fn test_participant_joined_and_left() {
        let mut membership = membership();
        let change = membership.on_participant_joined(
            ParticipantId::from("p2"),
            ParticipantInfo::with_email("p2@example.com"),
        );
        assert_eq!(
            change,
            MembershipChange::RemoteJoined {
                remote: ParticipantId::from("p2"),
                replaced: None
            }
        );
        assert_eq!(
            membership.remote_participant().unwrap().info.label(),
            "p2@example.com"
        );

        assert_eq!(
            membership.on_participant_left(&ParticipantId::from("p3")),
            MembershipChange::Ignored
        );
        assert!(membership.is_remote(&ParticipantId::from("p2")));

        assert_eq!(
            membership.on_participant_left(&ParticipantId::from("p2")),
            MembershipChange::RemoteLeft {
                remote: ParticipantId::from("p2")
            }
        );
        assert!(membership.remote().is_none());
    }

    #[test]
    fn test_self_and_duplicate_joins_ignored() {
        let mut membership = membership();
        assert_eq!(
            membership.on_participant_joined(ParticipantId::from("p1"), ParticipantInfo::default()),
            MembershipChange::Ignored
        );
        membership.on_participant_joined(ParticipantId::from("p2"), ParticipantInfo::default());
        assert_eq!(
            membership.on_participant_joined(ParticipantId::from("p2"), ParticipantInfo::default()),
            MembershipChange::Ignored
        );
    }

    #[test]
    fn test_new_remote_replaces_current() {
        let mut membership = membership();
        membership.on_participant_joined(ParticipantId::from("p2"), ParticipantInfo::default());
        let change =
            membership.on_participant_joined(ParticipantId::from("p3"), ParticipantInfo::default());
        assert_eq!(
            change,
            MembershipChange::RemoteJoined {
                remote: ParticipantId::from("p3"),
                replaced: Some(ParticipantId::from("p2"))
            }
        );
        // the displaced participant leaving is no longer relevant to the call
        assert_eq!(
            membership.on_participant_left(&ParticipantId::from("p2")),
            MembershipChange::Ignored
        );
        assert_eq!(membership.participant_count(), 1);
    }

    #[test]
    fn test_adopt_remote_from_incoming_call() {
        let mut membership = membership();
        assert!(matches!(
            membership.adopt_remote(ParticipantId::from("p9")),
            MembershipChange::RemoteJoined { replaced: None, .. }
        ));
        assert_eq!(
            membership.adopt_remote(ParticipantId::from("p9")),
            MembershipChange::Ignored
        );
        assert_eq!(membership.remote_participant().unwrap().info.label(), "Someone");
    }
}
