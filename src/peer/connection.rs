//! `webrtc` crate implementation of the negotiation layer

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::config::PeerConfig;
use super::media::{MediaDevices, MediaKind, MediaTrack};
use super::{IceState, PeerEvent, PeerEventSender, PeerFactory, PeerSession};
use crate::error::{AppError, Result};
use crate::signaling::{IceCandidate, SdpAnswer, SdpOffer};
use crate::stats::TransportCounters;

fn negotiation_error(what: &str, e: impl std::fmt::Display) -> AppError {
    AppError::Negotiation(format!("{}: {}", what, e))
}

type TrackList = Arc<Mutex<Vec<Arc<dyn MediaTrack>>>>;

const RTP_BUFFER: usize = 256;

fn end_remote_tracks(tracks: &Mutex<Vec<Arc<dyn MediaTrack>>>) {
    let ended = std::mem::take(&mut *tracks.lock());
    for track in ended {
        track.stop();
    }
}

/// Record an ICE transition; failed and closed connections end every
/// remote track
fn apply_ice_state(
    slot: &Mutex<IceState>,
    tracks: &Mutex<Vec<Arc<dyn MediaTrack>>>,
    events: &PeerEventSender,
    state: RTCIceConnectionState,
) {
    let Some(state) = ice_state_from(state) else {
        return;
    };
    debug!("ICE state: {}", state);
    *slot.lock() = state;
    if matches!(state, IceState::Failed | IceState::Closed) {
        end_remote_tracks(tracks);
    }
    let _ = events.send(PeerEvent::IceState(state));
}

fn ice_state_from(state: RTCIceConnectionState) -> Option<IceState> {
    match state {
        RTCIceConnectionState::New => Some(IceState::New),
        RTCIceConnectionState::Checking => Some(IceState::Checking),
        RTCIceConnectionState::Connected => Some(IceState::Connected),
        RTCIceConnectionState::Completed => Some(IceState::Completed),
        RTCIceConnectionState::Failed => Some(IceState::Failed),
        RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
        RTCIceConnectionState::Closed => Some(IceState::Closed),
        _ => None,
    }
}

/// Remote track received from the endpoint
///
/// A reader task pulls RTP off the receiver and republishes it through
/// [`RemoteTrack::subscribe`]. The track ends when the receiver stops
/// delivering, when ICE fails or closes, or when it is stopped.
pub struct RemoteTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackRemote>,
    packets: broadcast::Sender<Packet>,
    live: AtomicBool,
}

impl RemoteTrack {
    fn new(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        };
        let (packets, _) = broadcast::channel(RTP_BUFFER);
        Self {
            id: track.id(),
            kind,
            track,
            packets,
            live: AtomicBool::new(true),
        }
    }

    pub fn remote(&self) -> &Arc<TrackRemote> {
        &self.track
    }

    /// RTP packets of this track as they arrive
    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.packets.subscribe()
    }

    /// Read the next RTP packet; the track ends on EOF or a read error
    pub async fn read_rtp(&self) -> Result<Packet> {
        match self.track.read_rtp().await {
            Ok((packet, _)) => Ok(packet),
            Err(e) => {
                self.mark_ended();
                Err(AppError::Media(format!("Track {} ended: {}", self.id, e)))
            }
        }
    }

    pub fn mark_ended(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!("Remote {} track {} ended", self.kind, self.id);
        }
    }

    /// Forward RTP to subscribers until the track ends
    async fn pump(self: Arc<Self>) {
        while self.is_live() {
            match self.read_rtp().await {
                Ok(packet) => {
                    let _ = self.packets.send(packet);
                }
                Err(e) => {
                    debug!("{}", e);
                    break;
                }
            }
        }
    }
}

impl MediaTrack for RemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.mark_ended();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Local Opus track fed by the host's microphone capture
pub struct LocalAudioTrack {
    id: String,
    track: Arc<TrackLocalStaticSample>,
    live: AtomicBool,
}

impl LocalAudioTrack {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            id.clone(),
            "camview-microphone".to_string(),
        ));
        Self {
            id,
            track,
            live: AtomicBool::new(true),
        }
    }

    /// Send one encoded Opus frame
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if !self.is_live() {
            return Err(AppError::Media("microphone track stopped".to_string()));
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| AppError::Media(format!("Failed to write audio sample: {}", e)))
    }

    fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

impl MediaTrack for LocalAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Microphone provider handing out [`LocalAudioTrack`]s
///
/// The host keeps feeding samples into [`WebRtcMicrophone::current`].
#[derive(Default)]
pub struct WebRtcMicrophone {
    current: Mutex<Option<Arc<LocalAudioTrack>>>,
}

impl WebRtcMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track of the latest call, if it is still live
    pub fn current(&self) -> Option<Arc<LocalAudioTrack>> {
        self.current.lock().clone().filter(|t| t.is_live())
    }
}

#[async_trait]
impl MediaDevices for WebRtcMicrophone {
    async fn microphone(&self) -> Result<Arc<dyn MediaTrack>> {
        let track = Arc::new(LocalAudioTrack::new(format!(
            "microphone-{}",
            uuid::Uuid::new_v4()
        )));
        *self.current.lock() = Some(track.clone());
        Ok(track)
    }
}

/// Peer connection of one call
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    ice_state: Arc<Mutex<IceState>>,
    remote_tracks: TrackList,
    closed: AtomicBool,
}

impl WebRtcPeer {
    pub async fn new(config: &PeerConfig, events: PeerEventSender) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| negotiation_error("Failed to register codecs", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| negotiation_error("Failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![];
        for stun_url in &config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }
        for turn in &config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| negotiation_error("Failed to create peer connection", e))?;

        let peer = Self {
            pc: Arc::new(pc),
            ice_state: Arc::new(Mutex::new(IceState::New)),
            remote_tracks: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        };
        peer.setup_event_handlers(events);

        Ok(peer)
    }

    fn setup_event_handlers(&self, events: PeerEventSender) {
        let ice_state = self.ice_state.clone();
        let remote_tracks = self.remote_tracks.clone();
        let tx = events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                apply_ice_state(&ice_state, &remote_tracks, &tx, s);
                Box::pin(async {})
            }));

        let tx = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let candidate = match candidate {
                        Some(c) => match c.to_json() {
                            Ok(init) => Some(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }),
                            Err(e) => {
                                debug!("Dropping unserializable candidate: {}", e);
                                return;
                            }
                        },
                        None => None,
                    };
                    let _ = tx.send(PeerEvent::LocalCandidate(candidate));
                })
            }));

        let remote_tracks = self.remote_tracks.clone();
        let tx = events;
        self.pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let remote_tracks = remote_tracks.clone();
                let tx = tx.clone();
                Box::pin(async move {
                    let track = Arc::new(RemoteTrack::new(track));
                    info!("Received {} track {}", track.kind(), track.id());
                    remote_tracks.lock().push(track.clone());
                    tokio::spawn(track.clone().pump());
                    let _ = tx.send(PeerEvent::Track(track));
                })
            }));
    }

    #[cfg(test)]
    fn push_remote_track(&self, track: Arc<dyn MediaTrack>) {
        self.remote_tracks.lock().push(track);
    }
}

#[async_trait]
impl PeerSession for WebRtcPeer {
    async fn add_receiver(&self, kind: MediaKind) -> Result<()> {
        let codec_type = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        self.pc
            .add_transceiver_from_kind(codec_type, Some(init))
            .await
            .map_err(|e| negotiation_error("Failed to add transceiver", e))?;
        Ok(())
    }

    async fn add_local_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        let local = track
            .as_any()
            .downcast_ref::<LocalAudioTrack>()
            .ok_or_else(|| AppError::Media(format!("Unsupported local track {}", track.id())))?;

        let sender = self
            .pc
            .add_track(local.rtc_track())
            .await
            .map_err(|e| AppError::Media(format!("Failed to add microphone track: {}", e)))?;

        // Drain RTCP so the sender keeps flowing
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SdpOffer> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| negotiation_error("Failed to create offer", e))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| negotiation_error("Failed to set local description", e))?;
        Ok(SdpOffer::new(offer.sdp))
    }

    async fn set_answer(&self, answer: &SdpAnswer) -> Result<()> {
        let sdp = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| negotiation_error("Invalid SDP answer", e))?;
        self.pc
            .set_remote_description(sdp)
            .await
            .map_err(|e| negotiation_error("Failed to set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| negotiation_error("Failed to add ICE candidate", e))
    }

    fn ice_state(&self) -> IceState {
        *self.ice_state.lock()
    }

    async fn counters(&self) -> TransportCounters {
        let report = self.pc.get_stats().await;
        let bytes_received = report
            .reports
            .values()
            .filter_map(|r| match r {
                StatsReportType::Transport(t) => Some(t.bytes_received as u64),
                _ => None,
            })
            .sum();
        TransportCounters {
            bytes_received,
            ..Default::default()
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        end_remote_tracks(&self.remote_tracks);
        if let Err(e) = self.pc.close().await {
            debug!("Failed to close peer connection: {}", e);
        }
    }
}

/// Factory for [`WebRtcPeer`]s
#[derive(Debug, Clone, Default)]
pub struct WebRtcPeerFactory {
    config: PeerConfig,
}

impl WebRtcPeerFactory {
    pub fn new(config: PeerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerSession>> {
        Ok(Arc::new(WebRtcPeer::new(&self.config, events).await?))
    }
}
