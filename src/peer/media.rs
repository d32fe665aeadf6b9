//! Media stream and track abstractions
//!
//! The session never decodes or renders. It only tracks which tracks exist,
//! whether they are live, and the frame counters the media pipeline reports
//! back while presenting them.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::stats::TransportCounters;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// A local or remote media track
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// `false` once the track ended or was stopped
    fn is_live(&self) -> bool;

    /// End the track. Idempotent.
    fn stop(&self);

    fn as_any(&self) -> &dyn Any;
}

/// Decoder-side counters reported by the media pipeline
#[derive(Debug, Default)]
pub struct FrameCounters {
    frames_decoded: AtomicU64,
    frames_dropped: AtomicU64,
    freeze_ms: AtomicU64,
    frame_width: AtomicU32,
    frame_height: AtomicU32,
}

impl FrameCounters {
    pub fn add_decoded(&self, frames: u64) {
        self.frames_decoded.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, frames: u64) {
        self.frames_dropped.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn add_freeze(&self, millis: u64) {
        self.freeze_ms.fetch_add(millis, Ordering::Relaxed);
    }

    pub fn set_resolution(&self, width: u32, height: u32) {
        self.frame_width.store(width, Ordering::Relaxed);
        self.frame_height.store(height, Ordering::Relaxed);
    }

    /// Merge into transport counters read from the negotiation layer
    pub fn fill(&self, counters: &mut TransportCounters) {
        counters.frames_decoded = self.frames_decoded.load(Ordering::Relaxed);
        counters.frames_dropped = self.frames_dropped.load(Ordering::Relaxed);
        counters.freeze_duration = self.freeze_ms.load(Ordering::Relaxed) as f64 / 1000.0;
        counters.frame_width = self.frame_width.load(Ordering::Relaxed);
        counters.frame_height = self.frame_height.load(Ordering::Relaxed);
    }
}

/// Remote media stream of one call, shared read-only with every consumer
pub struct MediaStream {
    id: String,
    tracks: RwLock<Vec<Arc<dyn MediaTrack>>>,
    counters: FrameCounters,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: RwLock::new(Vec::new()),
            counters: FrameCounters::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_track(&self, track: Arc<dyn MediaTrack>) {
        let mut tracks = self.tracks.write();
        if !tracks.iter().any(|t| t.id() == track.id()) {
            tracks.push(track);
        }
    }

    pub fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks.read().clone()
    }

    pub fn has_live_track(&self) -> bool {
        self.tracks.read().iter().any(|t| t.is_live())
    }

    pub fn has_live_audio(&self) -> bool {
        self.tracks
            .read()
            .iter()
            .any(|t| t.kind() == MediaKind::Audio && t.is_live())
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in self.tracks.read().iter() {
            track.stop();
        }
    }

    /// Counters the media pipeline updates while presenting this stream
    pub fn counters(&self) -> &FrameCounters {
        &self.counters
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tracks = self.tracks.read();
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &tracks.iter().map(|t| t.id().to_string()).collect::<Vec<_>>())
            .finish()
    }
}

/// Local capture devices (microphone for two-way audio)
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn microphone(&self) -> Result<Arc<dyn MediaTrack>>;
}

/// Device provider for hosts without capture support
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMediaDevices;

#[async_trait]
impl MediaDevices for NoMediaDevices {
    async fn microphone(&self) -> Result<Arc<dyn MediaTrack>> {
        Err(AppError::Media("no microphone available".to_string()))
    }
}
