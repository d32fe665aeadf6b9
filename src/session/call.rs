//! One connection attempt

use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::key::EndpointKey;
use crate::peer::{IceState, MediaStream, MediaTrack, PeerSession};
use crate::signaling::SignalingTransport;

/// One connection attempt and the resources it exclusively owns
///
/// Resources are installed while the attempt is set up and all released by
/// [`Call::release`]. Once release has begun nothing new can be installed:
/// the `install_*` methods hand the resource back so the caller can close it.
pub struct Call {
    id: String,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    deadline: Mutex<Option<Instant>>,
    transport: Mutex<Option<Arc<dyn SignalingTransport>>>,
    peer: Mutex<Option<Arc<dyn PeerSession>>>,
    local_tracks: Mutex<Vec<Arc<dyn MediaTrack>>>,
    remote_stream: Mutex<Option<Arc<MediaStream>>>,
    set_up: AtomicBool,
    closing: CancellationToken,
    released: OnceCell<()>,
}

impl Call {
    /// `seq` numbers the attempts of one session so ids stay unique even
    /// when two calls start within the same second
    pub fn new(key: &EndpointKey, seq: u64) -> Self {
        let started_wall = Utc::now();
        Self {
            id: call_id(key, &started_wall, seq),
            started_at: Instant::now(),
            started_wall,
            deadline: Mutex::new(None),
            transport: Mutex::new(None),
            peer: Mutex::new(None),
            local_tracks: Mutex::new(Vec::new()),
            remote_stream: Mutex::new(None),
            set_up: AtomicBool::new(false),
            closing: CancellationToken::new(),
            released: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn started_wall(&self) -> DateTime<Utc> {
        self.started_wall
    }

    /// Time since the attempt started
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    /// Push the deadline to at least `now + by`; never moves it earlier
    pub fn extend(&self, by: Duration) {
        let target = Instant::now() + by;
        let mut deadline = self.deadline.lock();
        *deadline = Some(match *deadline {
            Some(current) if current > target => current,
            _ => target,
        });
    }

    /// Whether the deadline is unset or has passed
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) => now >= deadline,
            None => true,
        }
    }

    /// Time left until the deadline; zero when unset or passed
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline()
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn install_transport(
        &self,
        transport: Arc<dyn SignalingTransport>,
    ) -> std::result::Result<(), Arc<dyn SignalingTransport>> {
        let mut slot = self.transport.lock();
        if self.is_closing() {
            return Err(transport);
        }
        *slot = Some(transport);
        Ok(())
    }

    pub fn transport(&self) -> Option<Arc<dyn SignalingTransport>> {
        self.transport.lock().clone()
    }

    pub fn install_peer(
        &self,
        peer: Arc<dyn PeerSession>,
    ) -> std::result::Result<(), Arc<dyn PeerSession>> {
        let mut slot = self.peer.lock();
        if self.is_closing() {
            return Err(peer);
        }
        *slot = Some(peer);
        Ok(())
    }

    pub fn peer(&self) -> Option<Arc<dyn PeerSession>> {
        self.peer.lock().clone()
    }

    pub fn add_local_track(
        &self,
        track: Arc<dyn MediaTrack>,
    ) -> std::result::Result<(), Arc<dyn MediaTrack>> {
        let mut tracks = self.local_tracks.lock();
        if self.is_closing() {
            return Err(track);
        }
        tracks.push(track);
        Ok(())
    }

    pub fn local_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.local_tracks.lock().clone()
    }

    pub fn remote_stream(&self) -> Option<Arc<MediaStream>> {
        self.remote_stream.lock().clone()
    }

    /// Add a remote track, creating the stream on the first one
    ///
    /// Returns the stream when it was created by this call so the caller can
    /// announce it exactly once. Tracks arriving after release are stopped.
    pub fn add_remote_track(&self, track: Arc<dyn MediaTrack>) -> Option<Arc<MediaStream>> {
        let mut slot = self.remote_stream.lock();
        if self.is_closing() {
            track.stop();
            return None;
        }
        match slot.as_ref() {
            Some(stream) => {
                stream.add_track(track);
                None
            }
            None => {
                let stream = Arc::new(MediaStream::new(self.id.clone()));
                stream.add_track(track);
                *slot = Some(stream.clone());
                Some(stream)
            }
        }
    }

    pub fn ice_state(&self) -> IceState {
        self.peer().map(|p| p.ice_state()).unwrap_or_default()
    }

    /// Reachable and at least one remote track is live
    pub fn is_streaming(&self) -> bool {
        self.ice_state().is_reachable()
            && self
                .remote_stream()
                .map(|s| s.has_live_track())
                .unwrap_or(false)
    }

    /// A remote stream arrived and every one of its tracks has since ended
    pub fn has_lost_tracks(&self) -> bool {
        self.remote_stream()
            .map(|s| !s.has_live_track())
            .unwrap_or(false)
    }

    pub fn is_streaming_audio(&self) -> bool {
        self.remote_stream()
            .map(|s| s.has_live_audio())
            .unwrap_or(false)
    }

    /// Setup (microphone, transport open, offer) finished, with or without
    /// success
    pub fn is_set_up(&self) -> bool {
        self.set_up.load(Ordering::SeqCst)
    }

    pub fn mark_set_up(&self) {
        self.set_up.store(true, Ordering::SeqCst);
    }

    /// Release has begun
    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Cancelled when release begins
    pub fn closing_token(&self) -> CancellationToken {
        self.closing.clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.initialized()
    }

    /// Release every owned resource
    ///
    /// Concurrent and repeated invocations wait for the first one and then
    /// return; resources are closed exactly once.
    pub async fn release(&self) {
        self.released
            .get_or_init(|| async {
                self.closing.cancel();

                let transport = self.transport.lock().take();
                let peer = self.peer.lock().take();
                let local_tracks = std::mem::take(&mut *self.local_tracks.lock());
                let remote_stream = self.remote_stream.lock().take();

                if let Some(transport) = transport {
                    transport.close().await;
                }
                if let Some(peer) = peer {
                    peer.close().await;
                }
                for track in local_tracks {
                    track.stop();
                }
                if let Some(stream) = remote_stream {
                    stream.stop_all();
                }
                debug!("{}: call resources released", self.id);
            })
            .await;
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("deadline", &self.deadline())
            .field("closing", &self.is_closing())
            .finish()
    }
}

fn call_id(key: &EndpointKey, started: &DateTime<Utc>, seq: u64) -> String {
    format!(
        "{}_{:02}{:02}-{}",
        key,
        started.minute(),
        started.second(),
        seq
    )
}
