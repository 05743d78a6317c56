//! # Callroom - Two-Party Call Negotiation
//!
//! Callroom joins a named room through a relay channel and negotiates at most
//! one audio/video call with the other participant: local media acquisition,
//! offer/answer exchange, ICE candidate trickling with ordered buffering, and
//! deterministic resolution of simultaneous offers.
//!
//! The media engine and the relay transport are supplied by the host through
//! the [`MediaDevices`], [`MediaConnectionFactory`] and [`RelayClient`] traits.
//! In-process loopback implementations of all three ship with the crate.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use callroom::{
//!     CallClient, CallState, LoopbackConnectionFactory, LoopbackMediaDevices, LoopbackRelay,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = CallClient::init(
//!         Arc::new(LoopbackMediaDevices::new()),
//!         Arc::new(LoopbackConnectionFactory::new()),
//!     )?;
//!     let relay = LoopbackRelay::new();
//!
//!     let room = client
//!         .room("standup")
//!         .relay(Arc::new(relay.connect("alice")))
//!         .email("alice@example.com")
//!         .join()
//!         .await?;
//!
//!     // Handle events
//!     let mut events = room.events();
//!     while let Some(event) = events.next().await {
//!         println!("Room event: {:?}", event);
//!         if event.is_participant_event() {
//!             room.start_call().await?;
//!             room.wait_for_state(CallState::Connected, Duration::from_secs(5)).await?;
//!             break;
//!         }
//!     }
//!
//!     room.leave().await?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use callroom_core::{
    CallError, ConnectionState, IceCandidate, IceConfig, IceServer, LocalMedia,
    LoopbackConnectionFactory, LoopbackMediaDevices, LoopbackMediaSource, MediaConnection,
    MediaConnectionFactory, MediaConstraints, MediaDevices, MediaSource, ParticipantId,
    PeerSession, RemoteStream, RoomId, SdpType, SessionDescriptor, SessionPhase, TrackKind,
};

pub use callroom_signaling::{
    LoopbackRelay, LoopbackRelayClient, ParticipantInfo, RelayClient, RelayEvent, RelayMessage,
    RelaySubscription,
};

pub use callroom_diagnostics::{
    init_logging, ConnectionSummary, ConnectionTimeline, TimelineEntry, TimelineEvent,
};

// Public API modules
pub mod config;
mod controller;
pub mod event;
pub mod room;

// Re-export main API types
pub use config::{GlobalConfig, RoomConfig};
pub use controller::{CallState, CallStatus};
pub use event::{CallEvent, EventStream};
pub use room::{Room, RoomBuilder};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Directive installed when `debug_logging` is set
const DEBUG_DIRECTIVE: &str = "callroom=debug,callroom_core=debug,callroom_signaling=debug";

/// Main entry point for callroom
#[derive(Clone)]
pub struct CallClient {
    inner: Arc<CallClientInner>,
}

pub(crate) struct CallClientInner {
    pub(crate) config: GlobalConfig,
    pub(crate) devices: Arc<dyn MediaDevices>,
    pub(crate) factory: Arc<dyn MediaConnectionFactory>,
    pub(crate) rooms: Arc<DashMap<RoomId, DateTime<Utc>>>,
}

impl fmt::Debug for CallClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallClient")
            .field("config", &self.inner.config)
            .field("rooms", &self.inner.rooms.len())
            .finish()
    }
}

impl CallClient {
    /// Initialize with default settings
    ///
    /// # Example
    /// ```rust,no_run
    /// use callroom::{CallClient, LoopbackConnectionFactory, LoopbackMediaDevices};
    /// use std::sync::Arc;
    ///
    /// let client = CallClient::init(
    ///     Arc::new(LoopbackMediaDevices::new()),
    ///     Arc::new(LoopbackConnectionFactory::new()),
    /// )?;
    /// # Ok::<(), callroom::CallError>(())
    /// ```
    pub fn init(
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn MediaConnectionFactory>,
    ) -> Result<Self, CallError> {
        Self::init_with(GlobalConfig::default(), devices, factory)
    }

    /// Initialize with custom global configuration
    pub fn init_with(
        config: GlobalConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn MediaConnectionFactory>,
    ) -> Result<Self, CallError> {
        config.validate()?;
        if config.debug_logging {
            init_logging(DEBUG_DIRECTIVE)?;
        }
        info!(
            "Call client ready (max {} rooms, {} ICE servers)",
            config.max_rooms,
            config.ice_servers.len()
        );

        Ok(Self {
            inner: Arc::new(CallClientInner {
                config,
                devices,
                factory,
                rooms: Arc::new(DashMap::new()),
            }),
        })
    }

    /// Create a room builder for the given room ID
    pub fn room(&self, id: &str) -> RoomBuilder {
        RoomBuilder::new(self, id)
    }

    /// Global configuration in effect
    pub fn config(&self) -> &GlobalConfig {
        &self.inner.config
    }

    /// Rooms currently joined through this client
    pub fn active_rooms(&self) -> Vec<RoomId> {
        self.inner.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    pub(crate) fn inner(&self) -> &CallClientInner {
        &self.inner
    }
}
