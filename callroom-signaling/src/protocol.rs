//! Relay protocol messages
//!
//! Event names follow the relay's wire vocabulary (`room:join`, `user:call`,
//! `incoming call`, ...). Negotiation payloads stay untyped JSON here; they
//! are validated by [`callroom_core::codec`] on receipt.

use callroom_core::{ParticipantId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Self-description sent when joining a room
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Contact email
    #[serde(default, alias = "Email", skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl ParticipantInfo {
    /// Info with only an email
    pub fn with_email(email: impl Into<String>) -> Self {
        Self {
            display_name: None,
            email: Some(email.into()),
        }
    }

    /// Info with only a display name
    pub fn with_display_name(name: impl Into<String>) -> Self {
        Self {
            display_name: Some(name.into()),
            email: None,
        }
    }

    /// Whether no identifying field is set
    pub fn is_empty(&self) -> bool {
        let blank = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or("").is_empty();
        blank(&self.display_name) && blank(&self.email)
    }

    /// Human-readable label
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or("Someone")
    }
}

/// Messages a client sends to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RelayMessage {
    /// Join a room
    #[serde(rename = "room:join")]
    JoinRoom {
        /// Room to join
        room_id: RoomId,
        /// Self-description
        info: ParticipantInfo,
    },
    /// Leave a room
    #[serde(rename = "room:leave")]
    LeaveRoom {
        /// Room to leave
        room_id: RoomId,
    },
    /// Send an offer to a participant
    #[serde(rename = "user:call")]
    Call {
        /// Recipient
        to: ParticipantId,
        /// Encoded offer
        offer: Value,
    },
    /// Send an answer back to the caller
    #[serde(rename = "call:accepted")]
    CallAccepted {
        /// Recipient (the caller)
        to: ParticipantId,
        /// Encoded answer
        #[serde(alias = "ans")]
        answer: Value,
    },
    /// Send a local candidate to a participant
    #[serde(rename = "peer:ice-candidate")]
    IceCandidate {
        /// Recipient
        to: ParticipantId,
        /// Encoded candidate, `null` for end-of-candidates
        candidate: Value,
    },
}

impl RelayMessage {
    /// Wire name of the message
    pub fn event_name(&self) -> &'static str {
        match self {
            RelayMessage::JoinRoom { .. } => "room:join",
            RelayMessage::LeaveRoom { .. } => "room:leave",
            RelayMessage::Call { .. } => "user:call",
            RelayMessage::CallAccepted { .. } => "call:accepted",
            RelayMessage::IceCandidate { .. } => "peer:ice-candidate",
        }
    }

    /// Recipient of a directed message
    pub fn recipient(&self) -> Option<&ParticipantId> {
        match self {
            RelayMessage::Call { to, .. }
            | RelayMessage::CallAccepted { to, .. }
            | RelayMessage::IceCandidate { to, .. } => Some(to),
            RelayMessage::JoinRoom { .. } | RelayMessage::LeaveRoom { .. } => None,
        }
    }
}

/// Events the relay delivers to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RelayEvent {
    /// Acknowledgement of a join, carrying the relay-assigned identity
    #[serde(rename = "room:join")]
    RoomJoined {
        /// Joined room
        room_id: RoomId,
        /// Identity assigned to this client
        participant_id: ParticipantId,
    },
    /// Another participant joined the room
    #[serde(rename = "user:joined")]
    UserJoined {
        /// New participant
        #[serde(alias = "id")]
        participant_id: ParticipantId,
        /// Its self-description
        #[serde(default)]
        info: ParticipantInfo,
    },
    /// An offer from another participant
    #[serde(rename = "incoming call")]
    IncomingCall {
        /// Caller
        from: ParticipantId,
        /// Encoded offer
        offer: Value,
    },
    /// An answer to an offer this client sent
    #[serde(rename = "call:accepted")]
    CallAccepted {
        /// Callee
        from: ParticipantId,
        /// Encoded answer
        #[serde(alias = "ans")]
        answer: Value,
    },
    /// A remote candidate
    #[serde(rename = "peer:ice-candidate")]
    IceCandidate {
        /// Sender
        from: ParticipantId,
        /// Encoded candidate
        candidate: Value,
    },
    /// A participant left the room
    #[serde(rename = "participant:left")]
    ParticipantLeft {
        /// Departed participant
        participant_id: ParticipantId,
    },
    /// The relay rejected a request
    #[serde(rename = "error")]
    Error {
        /// Error message
        error: String,
        /// Error code for programmatic handling
        error_code: String,
    },
}

impl RelayEvent {
    /// Wire name of the event
    pub fn event_name(&self) -> &'static str {
        match self {
            RelayEvent::RoomJoined { .. } => "room:join",
            RelayEvent::UserJoined { .. } => "user:joined",
            RelayEvent::IncomingCall { .. } => "incoming call",
            RelayEvent::CallAccepted { .. } => "call:accepted",
            RelayEvent::IceCandidate { .. } => "peer:ice-candidate",
            RelayEvent::ParticipantLeft { .. } => "participant:left",
            RelayEvent::Error { .. } => "error",
        }
    }
}
