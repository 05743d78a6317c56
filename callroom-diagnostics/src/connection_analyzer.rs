//! Connection state analysis and diagnostics

use callroom_core::{ConnectionState, ParticipantId, SessionPhase};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default number of retained entries
pub const DEFAULT_CAPACITY: usize = 512;

/// What happened to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEvent {
    /// Session created for a remote participant
    SessionStarted {
        /// Remote participant
        remote: ParticipantId,
    },
    /// Negotiation phase reached
    Phase {
        /// New phase
        phase: SessionPhase,
    },
    /// Connectivity state reported by the media connection
    Connection {
        /// New state
        state: ConnectionState,
    },
    /// Session torn down
    SessionEnded,
}

/// One timestamped timeline entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// When the entry was recorded
    pub at: chrono::DateTime<chrono::Utc>,
    /// Session the entry belongs to
    pub session_id: Uuid,
    /// What happened
    pub event: TimelineEvent,
}

/// Summary of one session's connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    /// Session ID
    pub session_id: Uuid,
    /// Last reported connection state
    pub last_state: Option<ConnectionState>,
    /// Time from session start to the first `Connected` report
    pub time_to_connected: Option<Duration>,
    /// Number of `Disconnected` reports
    pub disconnects: usize,
    /// Whether the session was torn down
    pub ended: bool,
}

/// Shared, bounded history of session and connection changes
#[derive(Debug, Clone)]
pub struct ConnectionTimeline {
    entries: Arc<Mutex<Vec<TimelineEntry>>>,
    capacity: usize,
}

impl ConnectionTimeline {
    /// Create a timeline with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a timeline that keeps the newest `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry, evicting the oldest when full
    pub fn record(&self, session_id: Uuid, event: TimelineEvent) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.remove(0);
        }
        entries.push(TimelineEntry {
            at: chrono::Utc::now(),
            session_id,
            event,
        });
    }

    /// All retained entries, oldest first
    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.entries.lock().clone()
    }

    /// Entries of one session, oldest first
    pub fn session(&self, session_id: Uuid) -> Vec<TimelineEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Connection states reported for one session, in order
    pub fn connection_states(&self, session_id: Uuid) -> Vec<ConnectionState> {
        self.session(session_id)
            .into_iter()
            .filter_map(|entry| match entry.event {
                TimelineEvent::Connection { state } => Some(state),
                _ => None,
            })
            .collect()
    }

    /// Summarise one session
    pub fn summary(&self, session_id: Uuid) -> Option<ConnectionSummary> {
        let entries = self.session(session_id);
        let first = entries.first()?;

        let started_at = entries
            .iter()
            .find(|entry| matches!(entry.event, TimelineEvent::SessionStarted { .. }))
            .unwrap_or(first)
            .at;
        let time_to_connected = entries
            .iter()
            .find(|entry| {
                matches!(
                    entry.event,
                    TimelineEvent::Connection {
                        state: ConnectionState::Connected
                    }
                )
            })
            .and_then(|entry| (entry.at - started_at).to_std().ok());

        let mut last_state = None;
        let mut disconnects = 0;
        let mut ended = false;
        for entry in &entries {
            match entry.event {
                TimelineEvent::Connection { state } => {
                    if state == ConnectionState::Disconnected {
                        disconnects += 1;
                    }
                    last_state = Some(state);
                }
                TimelineEvent::SessionEnded => ended = true,
                _ => {}
            }
        }

        Some(ConnectionSummary {
            session_id,
            last_state,
            time_to_connected,
            disconnects,
            ended,
        })
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Export the retained entries as JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&*self.entries.lock())
    }
}

impl Default for ConnectionTimeline {
    fn default() -> Self {
        Self::new()
    }
}
