//! Identifier and negotiation value types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a call room, supplied by the user
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Create a room ID from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier the relay assigns to one connected client
///
/// Ordering is plain lexicographic byte order of the underlying string, which
/// is what the glare tie-break compares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Create a participant ID from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Session descriptor kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Proposal sent by the caller
    Offer,
    /// Response sent by the callee
    Answer,
}

impl SdpType {
    /// Wire name of the tag
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable offer or answer produced by one negotiation round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    sdp_type: SdpType,
    sdp: String,
}

impl SessionDescriptor {
    /// Create a descriptor with an explicit tag
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    /// Create an offer descriptor
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Offer, sdp)
    }

    /// Create an answer descriptor
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Answer, sdp)
    }

    /// Descriptor kind
    pub fn sdp_type(&self) -> SdpType {
        self.sdp_type
    }

    /// Opaque negotiation blob
    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    /// Whether this is an offer
    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }

    /// Whether this is an answer
    pub fn is_answer(&self) -> bool {
        self.sdp_type == SdpType::Answer
    }
}

/// A network path hint exchanged during negotiation
///
/// An empty `candidate` string is the end-of-candidates sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line, e.g. `candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host`
    pub candidate: String,
    /// Media stream identification tag the candidate belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media line the candidate belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Create a candidate bound to a media section
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, sdp_m_line_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_m_line_index,
            username_fragment: None,
        }
    }

    /// The end-of-candidates sentinel
    pub fn end_of_candidates() -> Self {
        Self {
            candidate: String::new(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    /// Whether this candidate signals the end of gathering
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl TrackKind {
    /// SDP media line name for this kind
    pub fn media_name(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// State of the underlying media connection as reported by the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, no checks yet
    New,
    /// Connectivity checks in progress
    Checking,
    /// A usable path was found
    Connected,
    /// Connectivity was lost, may recover
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Connection closed locally
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_ordering_is_lexicographic() {
        assert!(ParticipantId::from("a") < ParticipantId::from("b"));
        assert!(ParticipantId::from("P10") < ParticipantId::from("P2"));
        assert_eq!(ParticipantId::from("x").to_string(), "x");
    }

    #[test]
    fn test_descriptor_wire_shape() {
        let offer = SessionDescriptor::offer("v=0\r\n");
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0\r\n");
        assert!(offer.is_offer());
        assert!(!offer.is_answer());
    }

    #[test]
    fn test_candidate_wire_shape() {
        let candidate = IceCandidate::new(
            "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host",
            Some("0".to_string()),
            Some(0),
        );
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());

        assert!(IceCandidate::end_of_candidates().is_end_of_candidates());
        assert!(!candidate.is_end_of_candidates());
    }
}
