//! Error types for callroom

use crate::types::{ParticipantId, SdpType};
use std::time::Duration;
use thiserror::Error;

/// Main error type for call negotiation operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Inbound wire data failed validation
    #[error("Malformed payload: {reason}")]
    MalformedPayload {
        /// What was wrong with the payload
        reason: String,
    },

    /// A descriptor of the wrong kind was handed to a session operation
    #[error("Wrong descriptor tag: expected {expected}, got {actual}")]
    WrongDescriptorTag {
        /// Tag the operation requires
        expected: SdpType,
        /// Tag that was supplied
        actual: SdpType,
    },

    /// An answer arrived while no local offer was outstanding
    #[error("Unexpected answer: {reason}")]
    UnexpectedAnswer {
        /// Why the answer was rejected
        reason: String,
    },

    /// Local tracks were not attached before an offer was requested
    #[error("Local media not ready: attach local tracks before creating an offer")]
    MediaNotReady,

    /// No capture device could satisfy the requested constraints
    #[error("Media device unavailable: {reason}")]
    DeviceUnavailable {
        /// Reason reported by the capability
        reason: String,
    },

    /// The user or platform refused access to the capture device
    #[error("Media permission denied: {reason}")]
    PermissionDenied {
        /// Reason reported by the capability
        reason: String,
    },

    /// The relay refused or failed to deliver a message
    #[error("Relay send to {to} failed: {reason}")]
    RelaySendFailed {
        /// Intended recipient
        to: ParticipantId,
        /// Transport-level reason
        reason: String,
    },

    /// The underlying media connection rejected an operation
    #[error("Media connection error during {operation}: {reason}")]
    Connection {
        /// Operation that failed
        operation: String,
        /// Reason for failure
        reason: String,
    },

    /// The session was torn down while the operation was in flight
    #[error("Session ended before {operation} completed")]
    SessionEnded {
        /// Operation whose result was discarded
        operation: String,
    },

    /// A call was requested before any remote participant joined
    #[error("No remote participant in room")]
    NoRemoteParticipant,

    /// Invalid state error
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Missing configuration error
    #[error("Missing required configuration: {field}")]
    MissingConfiguration {
        /// Missing configuration field
        field: String,
    },

    /// Configuration could not be parsed or is inconsistent
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Reason the configuration was rejected
        reason: String,
    },

    /// Operation timed out error
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Duration after which timeout occurred
        duration: Duration,
    },

    /// Too many concurrent room memberships
    #[error("Room limit exceeded: at most {limit} rooms")]
    RoomLimitExceeded {
        /// Configured maximum
        limit: usize,
    },

    /// The client already holds a membership for this room
    #[error("Already joined room {room_id}")]
    RoomAlreadyJoined {
        /// Room ID
        room_id: String,
    },

    /// The controller for a room has stopped
    #[error("Call controller closed")]
    ControllerClosed,
}

impl CallError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            CallError::MalformedPayload { .. } => "MALFORMED_PAYLOAD".to_string(),
            CallError::WrongDescriptorTag { .. } => "WRONG_DESCRIPTOR_TAG".to_string(),
            CallError::UnexpectedAnswer { .. } => "UNEXPECTED_ANSWER".to_string(),
            CallError::MediaNotReady => "MEDIA_NOT_READY".to_string(),
            CallError::DeviceUnavailable { .. } => "DEVICE_UNAVAILABLE".to_string(),
            CallError::PermissionDenied { .. } => "PERMISSION_DENIED".to_string(),
            CallError::RelaySendFailed { .. } => "RELAY_SEND_FAILED".to_string(),
            CallError::Connection { .. } => "CONNECTION_ERROR".to_string(),
            CallError::SessionEnded { .. } => "SESSION_ENDED".to_string(),
            CallError::NoRemoteParticipant => "NO_REMOTE_PARTICIPANT".to_string(),
            CallError::InvalidState { .. } => "INVALID_STATE".to_string(),
            CallError::MissingConfiguration { .. } => "MISSING_CONFIGURATION".to_string(),
            CallError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION".to_string(),
            CallError::Timeout { .. } => "TIMEOUT".to_string(),
            CallError::RoomLimitExceeded { .. } => "ROOM_LIMIT_EXCEEDED".to_string(),
            CallError::RoomAlreadyJoined { .. } => "ROOM_ALREADY_JOINED".to_string(),
            CallError::ControllerClosed => "CONTROLLER_CLOSED".to_string(),
        }
    }

    /// Whether the error ends the current call attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallError::DeviceUnavailable { .. } | CallError::PermissionDenied { .. }
        )
    }

    /// Whether the error is a negotiation sequence violation by the remote side
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            CallError::WrongDescriptorTag { .. } | CallError::UnexpectedAnswer { .. }
        )
    }

    pub(crate) fn connection(operation: &str, reason: impl Into<String>) -> Self {
        CallError::Connection {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        CallError::MalformedPayload {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CallError::MediaNotReady.error_code(), "MEDIA_NOT_READY");
        assert_eq!(
            CallError::malformed("missing field").error_code(),
            "MALFORMED_PAYLOAD"
        );
        let err = CallError::RelaySendFailed {
            to: ParticipantId::from("p2"),
            reason: "unknown participant".to_string(),
        };
        assert_eq!(err.error_code(), "RELAY_SEND_FAILED");
        assert_eq!(
            err.to_string(),
            "Relay send to p2 failed: unknown participant"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(CallError::PermissionDenied {
            reason: "user dismissed prompt".to_string()
        }
        .is_terminal());
        assert!(!CallError::MediaNotReady.is_terminal());

        let wrong_tag = CallError::WrongDescriptorTag {
            expected: SdpType::Offer,
            actual: SdpType::Answer,
        };
        assert!(wrong_tag.is_protocol_violation());
        assert_eq!(
            wrong_tag.to_string(),
            "Wrong descriptor tag: expected offer, got answer"
        );
        assert!(!CallError::NoRemoteParticipant.is_protocol_violation());
    }
}
