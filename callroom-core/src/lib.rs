//! # Callroom Core
//!
//! Call negotiation core for callroom: the session descriptor codec, the media
//! connection and local media contracts, and the [`PeerSession`] that owns one
//! media connection to one remote participant.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod connection;
pub mod error;
pub mod loopback;
pub mod media;
pub mod session;
pub mod types;

// Re-export main types
pub use codec::{decode_candidate, decode_descriptor, encode_candidate, encode_descriptor};
pub use connection::{
    ConnectionEvent, IceConfig, IceServer, MediaConnection, MediaConnectionFactory, RemoteStream,
};
pub use error::CallError;
pub use loopback::{
    LoopbackConnection, LoopbackConnectionFactory, LoopbackMediaDevices, LoopbackMediaSource,
};
pub use media::{LocalMedia, MediaConstraints, MediaDevices, MediaSource};
pub use session::{CandidateDisposition, PeerSession, SessionEvent, SessionEventKind, SessionPhase};
pub use types::{
    ConnectionState, IceCandidate, ParticipantId, RoomId, SdpType, SessionDescriptor, TrackKind,
};
