use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, Result};

/// Signaling protocol used to negotiate with the camera endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignalingKind {
    /// go2rtc WebSocket API (`/api/ws?src=...`)
    #[default]
    Go2rtc,
    /// Pre-built WebSocket URL speaking the go2rtc message format
    Websocket,
    /// WHEP-style trickle ICE over HTTP
    Whep,
    /// RTSPtoWeb single-shot form POST
    Rtsptoweb,
}

impl std::fmt::Display for SignalingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingKind::Go2rtc => write!(f, "go2rtc"),
            SignalingKind::Websocket => write!(f, "websocket"),
            SignalingKind::Whep => write!(f, "whep"),
            SignalingKind::Rtsptoweb => write!(f, "rtsptoweb"),
        }
    }
}

impl std::str::FromStr for SignalingKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "go2rtc" => Ok(Self::Go2rtc),
            "websocket" | "ws" => Ok(Self::Websocket),
            "whep" => Ok(Self::Whep),
            "rtsptoweb" => Ok(Self::Rtsptoweb),
            other => Err(AppError::Config(format!("unknown signaling kind: {}", other))),
        }
    }
}

/// Consumer-supplied endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// Entity identifier of the camera
    pub entity: String,
    /// Receive audio
    pub audio: bool,
    /// Receive video
    pub video: bool,
    /// Send local microphone audio (two-way talk)
    pub microphone: bool,
    /// Force background mode on when the session is created
    pub background: bool,
    /// Signaling server base URL
    pub url: Option<String>,
    /// Signaling protocol
    pub signaling: SignalingKind,
    /// Still image URL used for the snapshot backstop
    pub snapshot_url: Option<String>,
    /// Static poster image, used when no snapshot URL is set
    pub poster: Option<String>,
    /// Expected frame rate; inferred from statistics when unset
    pub fps: Option<u32>,
    /// Collect transport statistics
    pub stats: bool,
    /// Publish trace events for this session
    pub debug: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            entity: String::new(),
            audio: true,
            video: true,
            microphone: false,
            background: false,
            url: None,
            signaling: SignalingKind::default(),
            snapshot_url: None,
            poster: None,
            fps: None,
            stats: false,
            debug: false,
        }
    }
}

impl CameraConfig {
    /// Shorthand for a config with only the entity set
    pub fn for_entity(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.entity.trim().is_empty() {
            return Err(AppError::Config("entity is required".to_string()));
        }
        if let Some(fps) = self.fps {
            if fps == 0 {
                return Err(AppError::Config("fps must be positive".to_string()));
            }
        }
        Ok(())
    }

    /// Whether any live media is requested at all
    pub fn wants_media(&self) -> bool {
        self.audio || self.video
    }
}

/// Timing policy for a session
///
/// The defaults match what the endpoints in the field tolerate well; every
/// value can be overridden when embedding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionPolicy {
    /// Upper bound for opening the signaling transport (ms)
    pub signaling_timeout_ms: u64,
    /// Deadline extension while media is live and rendered (ms)
    pub rendering_timeout_ms: u64,
    /// Cooldown after a fatal signaling/negotiation failure (ms)
    pub error_timeout_ms: u64,
    /// Upper bound for one snapshot fetch (ms)
    pub image_timeout_ms: u64,
    /// Default snapshot poll interval (ms)
    pub image_interval_ms: u64,
    /// Grace window between the last detach and termination (ms)
    pub termination_delay_ms: u64,
    /// Snapshots younger than this are not refetched (ms)
    pub snapshot_min_age_ms: u64,
    /// Deadline used in snapshot-only mode (ms)
    pub nominal_deadline_ms: u64,
    /// Lower bound for the watchdog reschedule delay (ms)
    pub min_tick_ms: u64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            signaling_timeout_ms: 10_000,
            rendering_timeout_ms: 10_000,
            error_timeout_ms: 30_000,
            image_timeout_ms: 10_000,
            image_interval_ms: 3_000,
            termination_delay_ms: 3_000,
            snapshot_min_age_ms: 300,
            nominal_deadline_ms: 1_000,
            min_tick_ms: 10,
        }
    }
}

impl SessionPolicy {
    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }

    pub fn rendering_timeout(&self) -> Duration {
        Duration::from_millis(self.rendering_timeout_ms)
    }

    pub fn error_timeout(&self) -> Duration {
        Duration::from_millis(self.error_timeout_ms)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_millis(self.image_timeout_ms)
    }

    pub fn image_interval(&self) -> Duration {
        Duration::from_millis(self.image_interval_ms)
    }

    pub fn termination_delay(&self) -> Duration {
        Duration::from_millis(self.termination_delay_ms)
    }

    pub fn snapshot_min_age(&self) -> Duration {
        Duration::from_millis(self.snapshot_min_age_ms)
    }

    pub fn nominal_deadline(&self) -> Duration {
        Duration::from_millis(self.nominal_deadline_ms)
    }

    pub fn min_tick(&self) -> Duration {
        Duration::from_millis(self.min_tick_ms)
    }
}
