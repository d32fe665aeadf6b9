//! Test doubles for the transport, peer, device and snapshot seams, plus a
//! scripted loopback HTTP server

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{CameraConfig, PreferenceStore, SessionPolicy, SignalingKind};
use crate::error::{AppError, Result};
use crate::peer::{
    IceState, MediaDevices, MediaKind, MediaTrack, PeerEvent, PeerEventSender, PeerFactory,
    PeerSession,
};
use crate::session::SessionContext;
use crate::signaling::{
    IceCandidate, SdpAnswer, SdpOffer, SignalingEvent, SignalingEventSender, SignalingTransport,
    TransportFactory,
};
use crate::snapshot::{SnapshotSource, SnapshotSourceFactory};
use crate::stats::TransportCounters;

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Response served for one request
#[derive(Debug, Clone)]
pub struct CannedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl CannedResponse {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

impl IntoResponse for CannedResponse {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, headers, self.body).into_response()
    }
}

/// Request as seen by [`serve_http`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    headers: HeaderMap,
    pub body: String,
}

impl RecordedRequest {
    /// Header value, name matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Default)]
struct ScriptedServer {
    responses: Mutex<VecDeque<CannedResponse>>,
    recorded: Mutex<Vec<RecordedRequest>>,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

async fn scripted_handler(
    State(server): State<Arc<ScriptedServer>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    server.recorded.lock().push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    });

    let (response, exhausted) = {
        let mut responses = server.responses.lock();
        let response = responses.pop_front();
        (response, responses.is_empty())
    };
    if exhausted {
        if let Some(done) = server.done.lock().take() {
            let _ = done.send(());
        }
    }

    match response {
        Some(response) => response.into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "no response scripted").into_response(),
    }
}

/// Serve `responses` in order from a loopback axum server
///
/// Returns the base URL and a handle resolving to the recorded requests once
/// every response was handed out.
pub async fn serve_http(
    responses: Vec<CannedResponse>,
) -> (String, JoinHandle<Vec<RecordedRequest>>) {
    let (done_tx, done_rx) = oneshot::channel();
    let server = Arc::new(ScriptedServer {
        responses: Mutex::new(responses.into()),
        recorded: Mutex::new(Vec::new()),
        done: Mutex::new(Some(done_tx)),
    });

    let app = Router::new()
        .fallback(scripted_handler)
        .with_state(server.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let handle = tokio::spawn(async move {
        let _ = done_rx.await;
        let recorded = server.recorded.lock().clone();
        recorded
    });

    (base, handle)
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

pub struct MockTrack {
    id: String,
    kind: MediaKind,
    live: AtomicBool,
}

impl MockTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            live: AtomicBool::new(true),
        }
    }
}

impl MediaTrack for MockTrack {
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
        self.live.store(false, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct MockMediaDevices;

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn microphone(&self) -> Result<Arc<dyn MediaTrack>> {
        Ok(Arc::new(MockTrack::new("mic", MediaKind::Audio)))
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Scripted snapshot source; an empty script serves `b"snapshot"`
#[derive(Default)]
pub struct MockSnapshotSource {
    results: Mutex<VecDeque<std::result::Result<Bytes, String>>>,
    delay: Mutex<Option<Duration>>,
    fetches: AtomicUsize,
}

impl MockSnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, data: &[u8]) {
        self.results
            .lock()
            .push_back(Ok(Bytes::copy_from_slice(data)));
    }

    pub fn push_err(&self, message: &str) {
        self.results.lock().push_back(Err(message.to_string()));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for MockSnapshotSource {
    async fn fetch(&self) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.results.lock().pop_front();
        match next {
            Some(Ok(data)) => Ok(data),
            Some(Err(message)) => Err(AppError::Snapshot(message)),
            None => Ok(Bytes::from_static(b"snapshot")),
        }
    }
}

/// Hands the same source to every session
pub struct MockSnapshotFactory {
    source: Arc<MockSnapshotSource>,
}

impl SnapshotSourceFactory for MockSnapshotFactory {
    fn create(&self, _config: &CameraConfig) -> Option<Arc<dyn SnapshotSource>> {
        Some(self.source.clone())
    }
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct TransportScript {
    hang_open: bool,
    reply_error: Option<String>,
}

/// Transport that answers every offer immediately
#[derive(Default)]
pub struct MockTransport {
    script: TransportScript,
    events: Option<SignalingEventSender>,
    open: AtomicBool,
    offers: Mutex<Vec<SdpOffer>>,
    candidates: Mutex<Vec<Option<IceCandidate>>>,
    closes: AtomicUsize,
}

impl MockTransport {
    fn scripted(script: TransportScript, events: SignalingEventSender) -> Self {
        Self {
            script,
            events: Some(events),
            ..Default::default()
        }
    }

    pub fn offers(&self) -> Vec<SdpOffer> {
        self.offers.lock().clone()
    }

    pub fn candidates(&self) -> Vec<Option<IceCandidate>> {
        self.candidates.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SignalingEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn open(&self, timeout: Duration) -> Result<()> {
        if self.script.hang_open {
            let _ = tokio::time::timeout(timeout, std::future::pending::<()>()).await;
            return Err(AppError::Timeout("signaling server did not respond".to_string()));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_offer(&self, offer: &SdpOffer) {
        self.offers.lock().push(offer.clone());
        match &self.script.reply_error {
            Some(message) => self.emit(SignalingEvent::Error(message.clone())),
            None => self.emit(SignalingEvent::Answer(SdpAnswer::new("v=0 mock answer"))),
        }
    }

    async fn send_candidate(&self, candidate: Option<&IceCandidate>) {
        self.candidates.lock().push(candidate.cloned());
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn kind(&self) -> SignalingKind {
        SignalingKind::Go2rtc
    }
}

#[derive(Default)]
pub struct MockTransportFactory {
    script: Mutex<TransportScript>,
    fail_create: AtomicBool,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    /// `open` never completes on its own
    pub fn hang_open(&self) {
        self.script.lock().hang_open = true;
    }

    /// Offers are answered with a signaling error
    pub fn reply_error(&self, message: &str) {
        self.script.lock().reply_error = Some(message.to_string());
    }

    /// Creation fails as for an endpoint without a usable URL
    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        _config: &CameraConfig,
        _policy: &SessionPolicy,
        events: SignalingEventSender,
    ) -> Result<Arc<dyn SignalingTransport>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(AppError::Config("Invalid signaling configuration".to_string()));
        }
        let transport = Arc::new(MockTransport::scripted(self.script.lock().clone(), events));
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// Peer that connects as soon as an answer is applied
pub struct MockPeer {
    events: Option<PeerEventSender>,
    reject_answers: bool,
    hang_offer: bool,
    ice: Mutex<IceState>,
    receivers: Mutex<Vec<MediaKind>>,
    local_tracks: AtomicUsize,
    closes: AtomicUsize,
    created_at: Instant,
}

impl Default for MockPeer {
    fn default() -> Self {
        Self {
            events: None,
            reject_answers: false,
            hang_offer: false,
            ice: Mutex::new(IceState::New),
            receivers: Mutex::new(Vec::new()),
            local_tracks: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            created_at: Instant::now(),
        }
    }
}

impl MockPeer {
    fn scripted(reject_answers: bool, hang_offer: bool, events: PeerEventSender) -> Self {
        Self {
            events: Some(events),
            reject_answers,
            hang_offer,
            ..Default::default()
        }
    }

    pub fn receivers(&self) -> Vec<MediaKind> {
        self.receivers.lock().clone()
    }

    pub fn local_track_count(&self) -> usize {
        self.local_tracks.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Force an ICE transition as the network would
    pub fn set_ice(&self, state: IceState) {
        *self.ice.lock() = state;
        self.emit(PeerEvent::IceState(state));
    }

    fn emit(&self, event: PeerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl PeerSession for MockPeer {
    async fn add_receiver(&self, kind: MediaKind) -> Result<()> {
        self.receivers.lock().push(kind);
        Ok(())
    }

    async fn add_local_track(&self, _track: Arc<dyn MediaTrack>) -> Result<()> {
        self.local_tracks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SdpOffer> {
        if self.hang_offer {
            std::future::pending::<()>().await;
        }
        self.emit(PeerEvent::LocalCandidate(Some(
            IceCandidate::new("candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host")
                .with_mid("0", 0),
        )));
        self.emit(PeerEvent::LocalCandidate(None));
        Ok(SdpOffer::new("v=0 mock offer"))
    }

    async fn set_answer(&self, _answer: &SdpAnswer) -> Result<()> {
        if self.reject_answers {
            return Err(AppError::Negotiation("bad answer".to_string()));
        }
        self.set_ice(IceState::Connected);
        for kind in self.receivers() {
            self.emit(PeerEvent::Track(Arc::new(MockTrack::new(
                format!("remote-{}", kind),
                kind,
            ))));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<()> {
        Ok(())
    }

    fn ice_state(&self) -> IceState {
        *self.ice.lock()
    }

    async fn counters(&self) -> TransportCounters {
        TransportCounters {
            bytes_received: self.created_at.elapsed().as_millis() as u64 * 100,
            ..Default::default()
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *self.ice.lock() = IceState::Closed;
        self.emit(PeerEvent::IceState(IceState::Closed));
    }
}

#[derive(Default)]
pub struct MockPeerFactory {
    reject_answers: AtomicBool,
    hang_create: AtomicBool,
    hang_offer: AtomicBool,
    created: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockPeerFactory {
    pub fn reject_answers(&self) {
        self.reject_answers.store(true, Ordering::SeqCst);
    }

    /// `create` never completes
    pub fn hang_create(&self) {
        self.hang_create.store(true, Ordering::SeqCst);
    }

    /// `create_offer` of new peers never completes
    pub fn hang_offer(&self) {
        self.hang_offer.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockPeer>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockPeer>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerSession>> {
        if self.hang_create.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let peer = Arc::new(MockPeer::scripted(
            self.reject_answers.load(Ordering::SeqCst),
            self.hang_offer.load(Ordering::SeqCst),
            events,
        ));
        self.created.lock().push(peer.clone());
        Ok(peer)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Mock collaborators wired into a [`SessionContext`]
pub struct TestHarness {
    pub transports: Arc<MockTransportFactory>,
    pub peers: Arc<MockPeerFactory>,
    pub snapshots: Arc<MockSnapshotSource>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            transports: Arc::new(MockTransportFactory::default()),
            peers: Arc::new(MockPeerFactory::default()),
            snapshots: Arc::new(MockSnapshotSource::new()),
        }
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            policy: SessionPolicy::default(),
            transports: self.transports.clone(),
            peers: self.peers.clone(),
            devices: Arc::new(MockMediaDevices),
            snapshots: Arc::new(MockSnapshotFactory {
                source: self.snapshots.clone(),
            }),
            preferences: PreferenceStore::in_memory(),
        }
    }
}
