//! Configuration types and defaults

use callroom_core::{CallError, IceConfig, IceServer, MediaConstraints};
use callroom_signaling::ParticipantInfo;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// STUN servers used when none are configured
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

/// Global callroom configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Enable debug logging
    pub debug_logging: bool,
    /// Maximum number of concurrent rooms
    pub max_rooms: usize,
    /// ICE servers handed to every new media connection
    pub ice_servers: Vec<IceServer>,
    /// How long to wait for the relay to acknowledge a join
    #[serde(rename = "join_timeout_ms", with = "duration_ms")]
    pub join_timeout: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            debug_logging: false,
            max_rooms: 10,
            ice_servers: vec![IceServer::new(DEFAULT_STUN_SERVERS)],
            join_timeout: Duration::from_secs(10),
        }
    }
}

impl GlobalConfig {
    /// Load from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, CallError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CallError::InvalidConfiguration {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the client cannot run with
    pub fn validate(&self) -> Result<(), CallError> {
        if self.max_rooms == 0 {
            return Err(CallError::InvalidConfiguration {
                reason: "max_rooms must be at least 1".to_string(),
            });
        }
        if self.join_timeout.is_zero() {
            return Err(CallError::InvalidConfiguration {
                reason: "join_timeout must be non-zero".to_string(),
            });
        }
        if self.ice_servers.iter().any(|server| server.urls.is_empty()) {
            return Err(CallError::InvalidConfiguration {
                reason: "ICE server entry without URLs".to_string(),
            });
        }
        Ok(())
    }

    /// Connection configuration for new peer sessions
    pub fn ice_config(&self) -> IceConfig {
        IceConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }
}

/// Room-specific configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Capture and send audio
    pub audio_enabled: bool,
    /// Capture and send video
    pub video_enabled: bool,
    /// Self-description sent with the join
    pub participant_info: ParticipantInfo,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            participant_info: ParticipantInfo::default(),
        }
    }
}

impl RoomConfig {
    /// Constraints for local media acquisition
    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: self.audio_enabled,
            video: self.video_enabled,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GlobalConfig::default();
        assert!(!config.debug_logging);
        assert_eq!(config.max_rooms, 10);
        assert_eq!(config.join_timeout, Duration::from_secs(10));
        assert_eq!(
            config.ice_config().ice_servers[0].urls,
            vec!["stun:stun.l.google.com:19302", "stun:global.stun.twilio.com:3478"]
        );

        let room = RoomConfig::default();
        assert_eq!(room.media_constraints(), MediaConstraints::default());
        assert!(room.participant_info.is_empty());
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            GlobalConfig::from_json_str(r#"{"debug_logging": true, "join_timeout_ms": 250}"#).unwrap();
        assert!(config.debug_logging);
        assert_eq!(config.join_timeout, Duration::from_millis(250));
        assert_eq!(config.max_rooms, 10);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn test_from_json_with_turn_server() {
        let config = GlobalConfig::from_json_str(
            r#"{"ice_servers": [{"urls": ["turn:turn.example.com:3478"], "username": "u", "credential": "c"}]}"#,
        )
        .unwrap();
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("u"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = GlobalConfig::from_json_str(r#"{"max_rooms": 0}"#).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");

        let err = GlobalConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, CallError::InvalidConfiguration { .. }));

        let err = GlobalConfig::from_json_str(r#"{"ice_servers": [{"urls": []}]}"#).unwrap_err();
        assert!(matches!(err, CallError::InvalidConfiguration { .. }));
    }
}
