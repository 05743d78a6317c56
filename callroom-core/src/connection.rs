//! Underlying media connection contract
//!
//! A [`MediaConnection`] is the engine-level peer connection. It is created by
//! a [`MediaConnectionFactory`] and owned by exactly one
//! [`PeerSession`](crate::session::PeerSession).

use crate::error::CallError;
use crate::media::MediaSource;
use crate::types::{ConnectionState, IceCandidate, SessionDescriptor, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:` or `turn:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A credential-less server entry
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            username: None,
            credential: None,
        }
    }
}

/// Configuration handed to every new media connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfig {
    /// ICE servers used for candidate gathering
    pub ice_servers: Vec<IceServer>,
}

/// Renderable remote media announced by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    /// Stream identifier
    pub id: String,
    /// Kind of the track that became available
    pub kind: TrackKind,
}

/// Asynchronous notifications from a media connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A new local network path was discovered
    LocalCandidate(IceCandidate),
    /// Remote media became renderable
    RemoteTrack(RemoteStream),
    /// Connectivity state changed
    StateChanged(ConnectionState),
}

/// Engine-level peer connection
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Bind the tracks of a local source to the connection
    async fn add_tracks(&self, source: Arc<dyn MediaSource>) -> Result<(), CallError>;
    /// Generate an offer
    async fn create_offer(&self) -> Result<SessionDescriptor, CallError>;
    /// Generate an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescriptor, CallError>;
    /// Install a local descriptor
    async fn set_local_description(&self, descriptor: &SessionDescriptor) -> Result<(), CallError>;
    /// Install a remote descriptor
    async fn set_remote_description(&self, descriptor: &SessionDescriptor) -> Result<(), CallError>;
    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError>;
    /// Restart ICE gathering and checks
    async fn restart_ice(&self) -> Result<(), CallError>;
    /// Close the connection and release engine resources
    fn close(&self);
}

/// Creates media connections wired to an event channel
pub trait MediaConnectionFactory: Send + Sync {
    /// Create a connection that reports through `events`
    fn create(
        &self,
        config: &IceConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn MediaConnection>, CallError>;
}
