//! Negotiation layer
//!
//! [`PeerSession`] is the local end of one peer media session: it creates the
//! offer, applies the answer and remote candidates, and reports reachability,
//! local candidates and remote tracks as [`PeerEvent`]s.

pub mod config;
pub mod connection;
pub mod media;

pub use config::{PeerConfig, TurnServer};
pub use connection::{LocalAudioTrack, RemoteTrack, WebRtcMicrophone, WebRtcPeer, WebRtcPeerFactory};
pub use media::{FrameCounters, MediaDevices, MediaKind, MediaStream, MediaTrack, NoMediaDevices};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::signaling::{IceCandidate, SdpAnswer, SdpOffer};
use crate::stats::TransportCounters;

/// ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceState {
    /// Media can flow
    pub fn is_reachable(&self) -> bool {
        matches!(self, IceState::Connected | IceState::Completed)
    }

    /// Reachability was lost; the call must restart
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            IceState::Failed | IceState::Disconnected | IceState::Closed
        )
    }
}

impl std::fmt::Display for IceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IceState::New => write!(f, "new"),
            IceState::Checking => write!(f, "checking"),
            IceState::Connected => write!(f, "connected"),
            IceState::Completed => write!(f, "completed"),
            IceState::Failed => write!(f, "failed"),
            IceState::Disconnected => write!(f, "disconnected"),
            IceState::Closed => write!(f, "closed"),
        }
    }
}

/// Event raised by the negotiation layer
#[derive(Clone)]
pub enum PeerEvent {
    IceState(IceState),
    /// Local candidate to trickle; `None` when gathering completed
    LocalCandidate(Option<IceCandidate>),
    /// A remote track arrived
    Track(Arc<dyn MediaTrack>),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::IceState(state) => write!(f, "IceState({})", state),
            PeerEvent::LocalCandidate(c) => write!(f, "LocalCandidate({:?})", c),
            PeerEvent::Track(t) => write!(f, "Track({} {})", t.kind(), t.id()),
        }
    }
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Local end of one peer media session
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Add a receive-only transceiver
    async fn add_receiver(&self, kind: MediaKind) -> Result<()>;

    /// Send a local track (microphone)
    async fn add_local_track(&self, track: Arc<dyn MediaTrack>) -> Result<()>;

    /// Create the offer and install it as the local description
    async fn create_offer(&self) -> Result<SdpOffer>;

    async fn set_answer(&self, answer: &SdpAnswer) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    fn ice_state(&self) -> IceState;

    /// Transport-level counters (bytes received)
    async fn counters(&self) -> TransportCounters;

    /// Close the session. Idempotent.
    async fn close(&self);
}

/// Creates the negotiation context of a new call
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerSession>>;
}
