//! Session event types
//!
//! Defines every event a session publishes to its attached consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::peer::MediaStream;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Uninitialized,
    /// Cold-start pass; statistics were cleared
    Reset,
    Connecting,
    Connected,
    Disconnected,
    Error,
    /// Terminal, never left
    Terminated,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Uninitialized => write!(f, "uninitialized"),
            SessionStatus::Reset => write!(f, "reset"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::Disconnected => write!(f, "disconnected"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Event topics a consumer can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Status,
    Image,
    Stream,
    Background,
    Microphone,
    Heartbeat,
    Mute,
    Trace,
    Connected,
    Debug,
    Release,
}

impl EventKind {
    /// Topics a consumer receives unless it asks for a different set
    pub const CONSUMER_DEFAULT: &'static [EventKind] = &[
        EventKind::Status,
        EventKind::Image,
        EventKind::Stream,
        EventKind::Background,
        EventKind::Microphone,
        EventKind::Heartbeat,
        EventKind::Mute,
        EventKind::Trace,
        EventKind::Connected,
        EventKind::Debug,
    ];
}

/// Events published by a session
///
/// Serialized as `{"event": "status", "data": {...}}` for consumers that
/// forward them over a wire. The live stream handle is never serialized.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "lowercase")]
pub enum SessionEvent {
    /// Status changed
    Status {
        status: SessionStatus,
        /// Last error, set while in `error` status
        error: Option<String>,
    },

    /// The cached snapshot was replaced
    Image {
        timestamp: DateTime<Utc>,
        /// xxh64 of the image bytes
        hash: u64,
        size: usize,
    },

    /// A call produced its remote media stream
    Stream {
        call_id: String,
        #[serde(skip)]
        stream: Option<Arc<MediaStream>>,
    },

    /// Background mode toggled
    Background { enabled: bool },

    /// Microphone toggled
    Microphone { enabled: bool },

    /// Emitted once per watchdog pass
    Heartbeat { live: bool },

    /// Global mute toggled
    Mute { muted: bool },

    /// Trace line (debug mode only)
    Trace { message: String },

    /// Reachability reached or call torn down
    Connected { connected: bool },

    /// Global debug toggled
    Debug { enabled: bool },

    /// Another consumer became the background holder; release the shared sink
    Release,
}

impl SessionEvent {
    /// Topic this event is published on
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Status { .. } => EventKind::Status,
            Self::Image { .. } => EventKind::Image,
            Self::Stream { .. } => EventKind::Stream,
            Self::Background { .. } => EventKind::Background,
            Self::Microphone { .. } => EventKind::Microphone,
            Self::Heartbeat { .. } => EventKind::Heartbeat,
            Self::Mute { .. } => EventKind::Mute,
            Self::Trace { .. } => EventKind::Trace,
            Self::Connected { .. } => EventKind::Connected,
            Self::Debug { .. } => EventKind::Debug,
            Self::Release => EventKind::Release,
        }
    }
}
