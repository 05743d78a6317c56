//! Validation of inbound descriptor and candidate payloads
//!
//! Relay payloads arrive as untyped JSON. Nothing reaches a [`PeerSession`]
//! until it has passed through [`decode_descriptor`] or [`decode_candidate`].
//!
//! [`PeerSession`]: crate::session::PeerSession

use crate::error::CallError;
use crate::types::{IceCandidate, SdpType, SessionDescriptor};
use serde::Deserialize;
use serde_json::Value;

const CANDIDATE_PREFIX: &str = "candidate:";
const CANDIDATE_TYPES: [&str; 4] = ["host", "srflx", "prflx", "relay"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    candidate: Option<String>,
    #[serde(default)]
    sdp_mid: Option<String>,
    #[serde(default)]
    sdp_m_line_index: Option<u16>,
    #[serde(default)]
    username_fragment: Option<String>,
}

/// Decode a descriptor payload, requiring a specific tag
///
/// A tag mismatch is reported as [`CallError::MalformedPayload`] so a replayed
/// stale message kind is dropped before it reaches the session.
pub fn decode_descriptor(raw: &Value, expected: SdpType) -> Result<SessionDescriptor, CallError> {
    let object = raw
        .as_object()
        .ok_or_else(|| CallError::malformed("descriptor payload is not an object"))?;

    let tag = match object.get("type") {
        Some(Value::String(tag)) => tag.as_str(),
        Some(_) => return Err(CallError::malformed("descriptor `type` is not a string")),
        None => return Err(CallError::malformed("descriptor is missing required field `type`")),
    };
    let sdp_type = match tag {
        "offer" => SdpType::Offer,
        "answer" => SdpType::Answer,
        other => {
            return Err(CallError::malformed(format!(
                "unsupported descriptor type `{other}`"
            )))
        }
    };
    if sdp_type != expected {
        return Err(CallError::malformed(format!(
            "expected {expected} descriptor, got {sdp_type}"
        )));
    }

    let sdp = match object.get("sdp") {
        Some(Value::String(sdp)) => sdp,
        Some(_) => return Err(CallError::malformed("descriptor `sdp` is not a string")),
        None => return Err(CallError::malformed("descriptor is missing required field `sdp`")),
    };
    validate_sdp(sdp)?;

    Ok(SessionDescriptor::new(sdp_type, sdp.clone()))
}

/// Decode a candidate payload
///
/// `null`, or an object whose `candidate` is empty, decodes to the
/// end-of-candidates sentinel.
pub fn decode_candidate(raw: &Value) -> Result<IceCandidate, CallError> {
    if raw.is_null() {
        return Ok(IceCandidate::end_of_candidates());
    }
    if !raw.is_object() {
        return Err(CallError::malformed("candidate payload is not an object"));
    }

    let wire: WireCandidate = serde_json::from_value(raw.clone())
        .map_err(|e| CallError::malformed(format!("invalid candidate payload: {e}")))?;
    let candidate = wire
        .candidate
        .ok_or_else(|| CallError::malformed("candidate is missing required field `candidate`"))?;

    if candidate.is_empty() {
        return Ok(IceCandidate {
            candidate,
            sdp_mid: wire.sdp_mid,
            sdp_m_line_index: wire.sdp_m_line_index,
            username_fragment: wire.username_fragment,
        });
    }

    validate_candidate_line(&candidate)?;
    if wire.sdp_mid.is_none() && wire.sdp_m_line_index.is_none() {
        return Err(CallError::malformed(
            "candidate carries neither `sdpMid` nor `sdpMLineIndex`",
        ));
    }

    Ok(IceCandidate {
        candidate,
        sdp_mid: wire.sdp_mid,
        sdp_m_line_index: wire.sdp_m_line_index,
        username_fragment: wire.username_fragment,
    })
}

/// Encode a descriptor for the relay
pub fn encode_descriptor(descriptor: &SessionDescriptor) -> Value {
    serde_json::json!({
        "type": descriptor.sdp_type().as_str(),
        "sdp": descriptor.sdp(),
    })
}

/// Encode a candidate for the relay; the sentinel encodes as `null`
pub fn encode_candidate(candidate: &IceCandidate) -> Value {
    if candidate.is_end_of_candidates() {
        return Value::Null;
    }
    serde_json::to_value(candidate).unwrap_or(Value::Null)
}

fn validate_sdp(sdp: &str) -> Result<(), CallError> {
    let mut lines = sdp.lines().map(str::trim_end).filter(|l| !l.is_empty());
    if lines.next() != Some("v=0") {
        return Err(CallError::malformed("sdp must start with `v=0`"));
    }
    if !lines.any(|l| l.starts_with("m=")) {
        return Err(CallError::malformed("sdp has no media section"));
    }
    Ok(())
}

/// Structural check of an `a=candidate` value:
/// `candidate:<foundation> <component> <transport> <priority> <ip> <port> typ <type> ...`
fn validate_candidate_line(line: &str) -> Result<(), CallError> {
    let body = line
        .trim()
        .strip_prefix(CANDIDATE_PREFIX)
        .ok_or_else(|| CallError::malformed("candidate line must start with `candidate:`"))?;

    let parts: Vec<&str> = body.split_whitespace().collect();
    if parts.len() < 8 {
        return Err(CallError::malformed(format!(
            "candidate line has {} fields, need at least 8",
            parts.len()
        )));
    }
    parts[1]
        .parse::<u8>()
        .map_err(|_| CallError::malformed("invalid candidate component"))?;
    parts[3]
        .parse::<u32>()
        .map_err(|_| CallError::malformed("invalid candidate priority"))?;
    parts[5]
        .parse::<u16>()
        .map_err(|_| CallError::malformed("invalid candidate port"))?;
    if parts[6] != "typ" {
        return Err(CallError::malformed("missing `typ` token in candidate"));
    }
    if !CANDIDATE_TYPES.contains(&parts[7]) {
        return Err(CallError::malformed(format!(
            "unknown candidate type `{}`",
            parts[7]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
    const HOST: &str = "candidate:842163049 1 udp 1677729535 192.168.1.20 54400 typ host generation 0";

    #[test]
    fn test_decode_descriptor_accepts_expected_tag() {
        let raw = json!({ "type": "offer", "sdp": SDP });
        let descriptor = decode_descriptor(&raw, SdpType::Offer).unwrap();
        assert!(descriptor.is_offer());
        assert_eq!(descriptor.sdp(), SDP);
    }

    #[test]
    fn test_decode_descriptor_rejects_stale_tag() {
        let raw = json!({ "type": "answer", "sdp": SDP });
        let err = decode_descriptor(&raw, SdpType::Offer).unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_PAYLOAD");
        assert!(err.to_string().contains("expected offer"));
    }

    #[test]
    fn test_decode_descriptor_rejects_structural_errors() {
        let cases = [
            json!("v=0"),
            json!({ "sdp": SDP }),
            json!({ "type": "pranswer", "sdp": SDP }),
            json!({ "type": "offer" }),
            json!({ "type": "offer", "sdp": 7 }),
            json!({ "type": "offer", "sdp": "o=- 1 1 IN IP4 0.0.0.0\r\n" }),
            json!({ "type": "offer", "sdp": "v=0\r\ns=-\r\n" }),
        ];
        for raw in cases {
            assert!(
                matches!(
                    decode_descriptor(&raw, SdpType::Offer),
                    Err(CallError::MalformedPayload { .. })
                ),
                "accepted {raw}"
            );
        }
    }

    #[test]
    fn test_decode_candidate() {
        let raw = json!({ "candidate": HOST, "sdpMid": "0", "sdpMLineIndex": 0 });
        let candidate = decode_candidate(&raw).unwrap();
        assert_eq!(candidate.candidate, HOST);
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
    }

    #[test]
    fn test_decode_candidate_passes_end_of_candidates() {
        assert!(decode_candidate(&Value::Null).unwrap().is_end_of_candidates());
        let raw = json!({ "candidate": "", "sdpMid": "0" });
        assert!(decode_candidate(&raw).unwrap().is_end_of_candidates());
    }

    #[test]
    fn test_decode_candidate_rejects_missing_field() {
        let raw = json!({ "sdpMid": "0", "sdpMLineIndex": 0 });
        let err = decode_candidate(&raw).unwrap_err();
        assert!(err.to_string().contains("`candidate`"));
    }

    #[test]
    fn test_decode_candidate_rejects_bad_lines() {
        let cases = [
            json!(42),
            json!({ "candidate": "1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0" }),
            json!({ "candidate": "candidate:1 1 udp 1 10.0.0.1", "sdpMid": "0" }),
            json!({ "candidate": "candidate:1 1 udp 1 10.0.0.1 99999 typ host", "sdpMid": "0" }),
            json!({ "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 kind host", "sdpMid": "0" }),
            json!({ "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ magic", "sdpMid": "0" }),
            json!({ "candidate": HOST }),
            json!({ "candidate": HOST, "sdpMLineIndex": "zero" }),
        ];
        for raw in cases {
            assert!(decode_candidate(&raw).is_err(), "accepted {raw}");
        }
    }

    #[test]
    fn test_encode_then_decode_candidate() {
        let candidate = IceCandidate::new(HOST, Some("1".to_string()), None);
        let decoded = decode_candidate(&encode_candidate(&candidate)).unwrap();
        assert_eq!(decoded, candidate);
        assert_eq!(encode_candidate(&IceCandidate::end_of_candidates()), Value::Null);

        let answer = SessionDescriptor::answer(SDP);
        assert_eq!(
            decode_descriptor(&encode_descriptor(&answer), SdpType::Answer).unwrap(),
            answer
        );
    }
}
