//! # Callroom Signaling
//!
//! Relay channel contract and room membership tracking for callroom.
//! Negotiation payloads cross the relay as untyped JSON and are validated on
//! receipt by `callroom-core`.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod loopback;
pub mod membership;
pub mod protocol;
pub mod relay;

// Re-export main types
pub use loopback::{LoopbackRelay, LoopbackRelayClient, SentMessage};
pub use membership::{MembershipChange, Participant, RoomMembership};
pub use protocol::{ParticipantInfo, RelayEvent, RelayMessage};
pub use relay::{RelayClient, RelaySubscription};
