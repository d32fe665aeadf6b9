//! Session orchestrator
//!
//! One [`SessionOrchestrator`] owns the connection lifecycle of one endpoint:
//! the watchdog that starts, extends and expires calls, the driver task of the
//! active call, the snapshot backstop, statistics and the attached consumers.
//!
//! Runtime failures never escape the public API. They surface as the `error`
//! status plus [`SessionOrchestrator::last_error`].

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::call::Call;
use super::consumers::{ConsumerHandle, ConsumerId, ConsumerRegistry};
use super::key::EndpointKey;
use super::watchdog::{next_delay, Watchdog};
use crate::config::{CameraConfig, Preference, PreferenceStore, SessionPolicy};
use crate::error::{AppError, Result};
use crate::events::{EventBus, EventKind, EventSink, SessionEvent, SessionStatus};
use crate::peer::{
    MediaDevices, MediaKind, MediaStream, PeerConfig, PeerEvent, PeerFactory, WebRtcMicrophone,
    WebRtcPeerFactory,
};
use crate::signaling::{DefaultTransportFactory, SignalingEvent, TransportFactory};
use crate::snapshot::{HttpSnapshotSourceFactory, Snapshot, SnapshotPoller, SnapshotSourceFactory};
use crate::stats::{StatisticsAggregator, StatisticsReport};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Called once when a session terminates
pub type TerminationHook = Box<dyn FnOnce(&EndpointKey) + Send>;

/// Collaborators shared by every session
#[derive(Clone)]
pub struct SessionContext {
    pub policy: SessionPolicy,
    pub transports: Arc<dyn TransportFactory>,
    pub peers: Arc<dyn PeerFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub snapshots: Arc<dyn SnapshotSourceFactory>,
    pub preferences: PreferenceStore,
}

impl SessionContext {
    /// Production collaborators: WebRTC peers, HTTP/WebSocket signaling and
    /// HTTP snapshots sharing one client
    pub fn new(preferences: PreferenceStore, peer_config: PeerConfig) -> Self {
        let client = reqwest::Client::new();
        Self {
            policy: SessionPolicy::default(),
            transports: Arc::new(DefaultTransportFactory::new(client.clone())),
            peers: Arc::new(WebRtcPeerFactory::new(peer_config)),
            devices: Arc::new(WebRtcMicrophone::new()),
            snapshots: Arc::new(HttpSnapshotSourceFactory::new(client)),
            preferences,
        }
    }

    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = devices;
        self
    }
}

/// Result of [`SessionOrchestrator::attach`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AttachOutcome {
    /// `false` when the consumer was already attached or the session is gone
    pub attached: bool,
    /// Consumers that must release the shared sink because the attaching
    /// consumer became the background holder
    pub release: Vec<ConsumerId>,
}

/// Owner of one endpoint's connection lifecycle
pub struct SessionOrchestrator {
    key: EndpointKey,
    config: CameraConfig,
    ctx: SessionContext,
    events: EventBus,
    status: RwLock<SessionStatus>,
    last_error: RwLock<Option<String>>,
    /// Call eligible to hold the live stream
    active: Mutex<Option<Arc<Call>>>,
    /// Calls whose teardown has not completed
    calls: Mutex<Vec<Arc<Call>>>,
    call_seq: AtomicU64,
    consumers: Mutex<ConsumerRegistry>,
    snapshots: SnapshotPoller,
    stats: Mutex<StatisticsAggregator>,
    watchdog: Watchdog,
    /// Second-aligned origin of the tick cadence
    epoch: Instant,
    tracing: AtomicBool,
    stats_enabled: AtomicBool,
    image_loop: Mutex<Option<JoinHandle<()>>>,
    termination: Mutex<Option<JoinHandle<()>>>,
    on_terminated: Mutex<Option<TerminationHook>>,
    throttler: LogThrottler,
}

impl SessionOrchestrator {
    /// Create a session for `config`
    ///
    /// `config.background` and `config.microphone` force the matching
    /// persisted preference on.
    pub async fn new(config: CameraConfig, ctx: SessionContext) -> Result<Arc<Self>> {
        config.validate()?;
        let key = EndpointKey::from_config(&config);

        if config.background {
            ctx.preferences
                .set(key.as_str(), Preference::Background, true)
                .await?;
        }
        if config.microphone {
            ctx.preferences
                .set(key.as_str(), Preference::Microphone, true)
                .await?;
        }

        let snapshots = SnapshotPoller::new(
            ctx.snapshots.create(&config),
            ctx.policy.image_timeout(),
            ctx.policy.snapshot_min_age(),
        );
        let stats = StatisticsAggregator::new(config.video, config.fps);
        let subsec = Duration::from_millis(Utc::now().timestamp_subsec_millis() as u64 % 1000);
        let now = Instant::now();

        info!(
            "Created session {} ({} signaling, audio={}, video={})",
            key, config.signaling, config.audio, config.video
        );

        Ok(Arc::new(Self {
            key,
            tracing: AtomicBool::new(config.debug),
            stats_enabled: AtomicBool::new(config.stats),
            config,
            ctx,
            events: EventBus::new(),
            status: RwLock::new(SessionStatus::Uninitialized),
            last_error: RwLock::new(None),
            active: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            call_seq: AtomicU64::new(0),
            consumers: Mutex::new(ConsumerRegistry::new()),
            snapshots,
            stats: Mutex::new(stats),
            watchdog: Watchdog::new(),
            epoch: now.checked_sub(subsec).unwrap_or(now),
            image_loop: Mutex::new(None),
            termination: Mutex::new(None),
            on_terminated: Mutex::new(None),
            throttler: LogThrottler::with_secs(30),
        }))
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.ctx.policy
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.status() == SessionStatus::Terminated
    }

    /// The active call is reachable and its remote stream has a live track
    pub fn is_streaming(&self) -> bool {
        self.active_call()
            .map(|call| call.is_streaming())
            .unwrap_or(false)
    }

    pub fn is_streaming_audio(&self) -> bool {
        self.active_call()
            .map(|call| call.is_streaming_audio())
            .unwrap_or(false)
    }

    /// Streaming and at least one consumer presents the stream
    pub fn is_any_consumer_rendering(&self) -> bool {
        self.is_streaming() && self.consumers.lock().any_rendering()
    }

    pub fn is_any_consumer_visible(&self) -> bool {
        self.consumers.lock().any_visible()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    pub fn background_holder(&self) -> Option<ConsumerId> {
        self.consumers.lock().background_holder()
    }

    /// Calls not yet torn down
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn active_call_id(&self) -> Option<String> {
        self.active_call().map(|call| call.id().to_string())
    }

    pub fn remote_stream(&self) -> Option<Arc<MediaStream>> {
        self.active_call().and_then(|call| call.remote_stream())
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshots.current()
    }

    pub fn statistics(&self) -> Option<StatisticsReport> {
        self.stats.lock().report().cloned()
    }

    pub fn background(&self) -> bool {
        self.ctx
            .preferences
            .get(self.key.as_str(), Preference::Background)
    }

    pub fn microphone(&self) -> bool {
        self.ctx
            .preferences
            .get(self.key.as_str(), Preference::Microphone)
    }

    pub fn is_tracing(&self) -> bool {
        self.tracing.load(Ordering::Relaxed)
    }

    /// Turn trace events on or off and tell consumers
    pub fn set_debug(&self, enabled: bool) {
        self.tracing
            .store(enabled || self.config.debug, Ordering::Relaxed);
        self.events.publish(SessionEvent::Debug { enabled });
    }

    pub fn statistics_enabled(&self) -> bool {
        self.stats_enabled.load(Ordering::Relaxed)
    }

    pub fn set_statistics_enabled(&self, enabled: bool) {
        self.stats_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Register the hook run once after termination
    pub fn on_terminated(&self, hook: TerminationHook) {
        *self.on_terminated.lock() = Some(hook);
    }

    /// Publish to every subscribed consumer
    pub(crate) fn publish(&self, event: SessionEvent) -> usize {
        self.events.publish(event)
    }

    // ---- consumers ----

    /// Attach a consumer and subscribe it to its event kinds
    ///
    /// Cancels a pending termination. Kicks the watchdog when the consumer is
    /// visible, background mode is on, or the endpoint is snapshot-only.
    pub fn attach(self: &Arc<Self>, consumer: &Arc<ConsumerHandle>, sink: EventSink) -> AttachOutcome {
        if self.is_terminated() {
            return AttachOutcome::default();
        }
        self.trace(format!("Attaching consumer {} to session", consumer.id()));
        self.cancel_termination();

        if !self.consumers.lock().insert(consumer.clone()) {
            return AttachOutcome::default();
        }

        let mut kinds = consumer.event_kinds().to_vec();
        if !kinds.contains(&EventKind::Release) {
            kinds.push(EventKind::Release);
        }
        self.events.subscribe(consumer.id(), &kinds, sink);

        if consumer.is_debug() {
            self.tracing.store(true, Ordering::Relaxed);
        }

        let background = self.background();
        let release = if !consumer.is_visible() && consumer.allows_background() && background {
            self.claim_background(consumer)
        } else {
            Vec::new()
        };

        if !self.config.wants_media() || consumer.is_visible() || background {
            self.kick();
        } else {
            self.trace("Consumer is not visible and background is off, not playing");
        }

        AttachOutcome {
            attached: true,
            release,
        }
    }

    /// Detach a consumer
    ///
    /// When the last consumer leaves, termination is scheduled after the
    /// grace delay unless background mode keeps the session alive.
    pub fn detach(self: &Arc<Self>, consumer: &ConsumerHandle) -> bool {
        let remaining = {
            let mut consumers = self.consumers.lock();
            if consumers.remove(consumer.id()).is_none() {
                drop(consumers);
                self.trace("Consumer mismatch or already detached, skipping");
                return false;
            }
            consumers.len()
        };
        self.events.unsubscribe(consumer.id());

        if remaining > 0 {
            self.trace(format!("Detached, {} consumers remaining", remaining));
        } else if self.background() {
            self.trace("Last consumer detached, session kept alive in background");
        } else {
            self.schedule_termination();
        }
        true
    }

    /// Record a visibility change of an attached consumer
    ///
    /// Becoming visible kicks the watchdog. Becoming invisible while allowed to
    /// hold the session in background claims the background slot; the returned
    /// consumers must release the shared sink. Hidden consumers that cannot
    /// hold the session should detach.
    pub fn set_visible(self: &Arc<Self>, consumer: &Arc<ConsumerHandle>, visible: bool) -> Vec<ConsumerId> {
        consumer.set_visible(visible);
        if !self.consumers.lock().contains(consumer.id()) {
            return Vec::new();
        }

        if visible {
            self.cancel_termination();
            self.kick();
            Vec::new()
        } else if consumer.allows_background() && self.background() {
            self.claim_background(consumer)
        } else {
            Vec::new()
        }
    }

    fn claim_background(&self, consumer: &ConsumerHandle) -> Vec<ConsumerId> {
        let release = self.consumers.lock().claim_background(consumer.id());
        for id in &release {
            self.events.publish_to(*id, SessionEvent::Release);
        }
        if !release.is_empty() {
            self.trace(format!(
                "Consumer {} holds the session in background, releasing {:?}",
                consumer.id(),
                release
            ));
        }
        release
    }

    fn schedule_termination(self: &Arc<Self>) {
        let delay = self.ctx.policy.termination_delay();
        let session = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            // Our own handle; dropping it detaches rather than aborts
            session.termination.lock().take();

            if !session.consumers.lock().is_empty() || session.background() {
                session.trace("Reattachment detected, termination aborted");
                return;
            }
            session.trace("Terminating session");
            session.terminate().await;
        });

        if let Some(previous) = self.termination.lock().replace(handle) {
            previous.abort();
        }
        self.trace("Termination scheduled");
    }

    fn cancel_termination(&self) {
        if let Some(pending) = self.termination.lock().take() {
            pending.abort();
            self.trace("Scheduled termination aborted");
        }
    }

    // ---- preferences ----

    /// Persist background mode
    ///
    /// Turning it on keeps the session alive without consumers; turning it off
    /// with no consumer attached schedules termination.
    pub async fn set_background(self: &Arc<Self>, enabled: bool) -> Result<()> {
        self.ctx
            .preferences
            .set(self.key.as_str(), Preference::Background, enabled)
            .await?;
        self.events.publish(SessionEvent::Background { enabled });
        info!("{}: background mode {}", self.key, if enabled { "on" } else { "off" });

        if enabled {
            self.cancel_termination();
            self.kick();
        } else if self.consumers.lock().is_empty() && !self.is_terminated() {
            self.schedule_termination();
        }
        Ok(())
    }

    /// Persist the microphone preference; a streaming call restarts so the
    /// local track setup takes effect
    pub async fn set_microphone(self: &Arc<Self>, enabled: bool) -> Result<()> {
        self.ctx
            .preferences
            .set(self.key.as_str(), Preference::Microphone, enabled)
            .await?;
        if self.is_streaming() {
            self.restart().await;
        }
        self.events.publish(SessionEvent::Microphone { enabled });
        Ok(())
    }

    // ---- watchdog ----

    /// Start the watchdog unless it is already running
    pub fn kick(self: &Arc<Self>) {
        if self.is_terminated() {
            return;
        }
        let Some(generation) = self.watchdog.arm() else {
            return;
        };
        debug!("{}: watchdog generation {} started", self.key, generation);
        let handle = tokio::spawn(run_watchdog(Arc::downgrade(self), generation));
        self.watchdog.set_handle(generation, handle);
    }

    /// Tear down the active call and run a cold watchdog pass
    pub async fn restart(self: &Arc<Self>) {
        if self.is_terminated() {
            return;
        }
        self.trace("Restarting call");
        if let Some(call) = self.active_call() {
            self.end_call(&call).await;
        }
        self.watchdog.disarm();
        self.kick();
    }

    /// One watchdog pass; returns the delay until the next one
    async fn pass(self: &Arc<Self>, cold: bool) -> Duration {
        if cold {
            self.stats.lock().reset();
            self.set_status(SessionStatus::Reset);
        }
        self.ensure_image_loop();

        let remaining = if self.config.wants_media() {
            self.drive_call().await
        } else {
            Some(self.ctx.policy.nominal_deadline())
        };

        self.events.publish(SessionEvent::Heartbeat {
            live: self.is_streaming(),
        });

        next_delay(self.epoch.elapsed(), remaining, self.ctx.policy.min_tick())
    }

    /// Start, extend or expire the active call; returns the time left until
    /// its deadline
    async fn drive_call(self: &Arc<Self>) -> Option<Duration> {
        let now = Instant::now();
        match self.active_call() {
            None => {
                if self.should_play() {
                    self.start_call().await;
                }
            }
            Some(call) if call.is_set_up() && !call.is_closing() && call.has_lost_tracks() => {
                self.trace_call(Some(&call), "Remote stream has no live tracks");
                self.end_call(&call).await;
            }
            Some(call) if call.is_expired(now) => {
                // Setup steps are bounded by their own timeouts
                if call.is_set_up() {
                    self.trace_call(Some(&call), "Watchdog timeout");
                    self.end_call(&call).await;
                }
            }
            Some(call) => {
                let keep_alive = !self.config.video
                    || self.consumers.lock().any_rendering()
                    || self.background();
                if call.is_streaming() && keep_alive {
                    call.extend(self.ctx.policy.rendering_timeout());
                    if self.statistics_enabled() {
                        self.sample_statistics(&call).await;
                    }
                }
            }
        }

        match self.active_call() {
            Some(call) => Some(call.remaining(Instant::now())),
            None if self.should_play() => Some(Duration::ZERO),
            None => None,
        }
    }

    /// Someone can see the result, or background mode wants it anyway
    fn should_play(&self) -> bool {
        self.background() || self.consumers.lock().any_visible()
    }

    // ---- calls ----

    fn active_call(&self) -> Option<Arc<Call>> {
        self.active.lock().clone()
    }

    fn is_active(&self, call: &Arc<Call>) -> bool {
        self.active
            .lock()
            .as_ref()
            .map(|active| Arc::ptr_eq(active, call))
            .unwrap_or(false)
    }

    async fn start_call(self: &Arc<Self>) {
        let previous: Vec<Arc<Call>> = self.calls.lock().clone();
        for call in previous {
            self.trace_call(
                Some(&call),
                format!("Ending call {} before starting a new one", call.id()),
            );
            self.end_call(&call).await;
        }
        if self.is_terminated() {
            return;
        }

        let seq = self.call_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let call = Arc::new(Call::new(&self.key, seq));
        call.extend(self.ctx.policy.signaling_timeout());
        *self.active.lock() = Some(call.clone());
        self.calls.lock().push(call.clone());

        info!("{}: starting call {}", self.key, call.id());
        self.trace_call(Some(&call), "Call started");
        self.set_status(SessionStatus::Connecting);

        tokio::spawn(self.clone().run_call(call));
    }

    /// Driver of one call: setup, then inbound signaling and peer events
    /// until the call is released
    async fn run_call(self: Arc<Self>, call: Arc<Call>) {
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let closing = call.closing_token();

        let setup = tokio::select! {
            _ = closing.cancelled() => {
                call.mark_set_up();
                return;
            }
            result = self.setup_call(&call, signal_tx, peer_tx) => result,
        };
        call.mark_set_up();

        if let Err(e) = setup {
            if e.is_fatal_to_call() {
                self.fail_call(&call, e.to_string()).await;
            } else {
                self.trace_call(Some(&call), format!("Call setup failed: {}", e));
            }
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = closing.cancelled() => break,
                Some(event) = signal_rx.recv() => self.on_signaling_event(&call, event).await,
                Some(event) = peer_rx.recv() => self.on_peer_event(&call, event).await,
                else => break,
            }
        }
        debug!("{}: call driver stopped", call.id());
    }

    async fn setup_call(
        &self,
        call: &Arc<Call>,
        signal_tx: mpsc::UnboundedSender<SignalingEvent>,
        peer_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<()> {
        let timeout = self.ctx.policy.signaling_timeout();

        if self.microphone() {
            self.acquire_microphone(call).await;
        }

        let transport = self.ctx.transports.create(&self.config, &self.ctx.policy, signal_tx)?;
        if let Err(transport) = call.install_transport(transport.clone()) {
            transport.close().await;
            return Ok(());
        }

        match tokio::time::timeout(timeout, transport.open(timeout)).await {
            Ok(Ok(())) if transport.is_open() => {
                self.trace_call(Some(call), format!("Opened {} signaling channel", transport.kind()));
            }
            Ok(Ok(())) => {
                return Err(AppError::Signaling("Failed to open signaling channel".to_string()));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(AppError::Timeout("Failed to open signaling channel".to_string()));
            }
        }

        let peer = match tokio::time::timeout(timeout, self.ctx.peers.create(peer_tx)).await {
            Ok(peer) => peer?,
            Err(_) => {
                return Err(AppError::Timeout("Failed to create peer connection".to_string()));
            }
        };
        if let Err(peer) = call.install_peer(peer.clone()) {
            peer.close().await;
            return Ok(());
        }

        for track in call.local_tracks() {
            if let Err(e) = peer.add_local_track(track).await {
                self.trace_call(Some(call), format!("Failed to add microphone track: {}", e));
            }
        }
        if self.config.video {
            peer.add_receiver(MediaKind::Video).await?;
        }
        if self.config.audio {
            peer.add_receiver(MediaKind::Audio).await?;
        }
        self.trace_call(Some(call), "Added transceivers");

        let offer = match tokio::time::timeout(timeout, peer.create_offer()).await {
            Ok(offer) => offer.map_err(|e| {
                AppError::Negotiation(format!("Failed to create WebRTC offer. {}", e))
            })?,
            Err(_) => {
                return Err(AppError::Timeout("Failed to create WebRTC offer".to_string()));
            }
        };

        call.extend(timeout);
        transport.send_offer(&offer).await;
        self.trace_call(Some(call), "Sent offer");
        Ok(())
    }

    async fn acquire_microphone(&self, call: &Call) {
        let timeout = self.ctx.policy.signaling_timeout();
        match tokio::time::timeout(timeout, self.ctx.devices.microphone()).await {
            Ok(Ok(track)) => {
                if let Err(track) = call.add_local_track(track) {
                    track.stop();
                }
            }
            Ok(Err(e)) => {
                self.trace_call(Some(call), format!("Failed to open microphone: {}", e));
            }
            Err(_) => {
                self.trace_call(Some(call), "Failed to open microphone: timed out");
            }
        }
    }

    async fn on_signaling_event(self: &Arc<Self>, call: &Arc<Call>, event: SignalingEvent) {
        if call.is_closing() {
            return;
        }
        match event {
            SignalingEvent::Answer(answer) => {
                self.trace_call(Some(call), "Received answer");
                let Some(peer) = call.peer() else {
                    return;
                };
                match peer.set_answer(&answer).await {
                    Ok(()) => self.trace_call(Some(call), "Remote description set"),
                    Err(e) => self.fail_call(call, e.to_string()).await,
                }
            }
            SignalingEvent::Candidate(Some(candidate)) => {
                self.trace_call(
                    Some(call),
                    format!("Received ICE candidate '{}'", candidate.candidate),
                );
                if let Some(peer) = call.peer() {
                    if let Err(e) = peer.add_ice_candidate(&candidate).await {
                        self.trace_call(Some(call), format!("Failed to add ICE candidate: {}", e));
                    }
                }
            }
            SignalingEvent::Candidate(None) => {
                self.trace_call(Some(call), "Received end of ICE candidates");
            }
            SignalingEvent::Error(message) => {
                self.trace_call(Some(call), format!("Signaling error: {}", message));
                self.fail_call(call, message).await;
            }
            SignalingEvent::Trace(message) => self.trace_call(Some(call), message),
        }
    }

    async fn on_peer_event(self: &Arc<Self>, call: &Arc<Call>, event: PeerEvent) {
        if call.is_closing() {
            return;
        }
        match event {
            PeerEvent::IceState(state) => {
                self.trace_call(Some(call), format!("ICE state: {}", state));
                if state.is_reachable() {
                    self.set_status(SessionStatus::Connected);
                    self.events
                        .publish(SessionEvent::Connected { connected: true });
                    call.extend(self.ctx.policy.rendering_timeout());
                } else if state.is_lost() {
                    self.restart_call(call).await;
                }
            }
            PeerEvent::LocalCandidate(candidate) => {
                let Some(transport) = call.transport().filter(|t| t.is_open()) else {
                    self.trace_call(Some(call), "Signaling channel closed, cannot send ICE candidate");
                    return;
                };
                match candidate {
                    Some(candidate) => {
                        call.extend(self.ctx.policy.signaling_timeout());
                        transport.send_candidate(Some(&candidate)).await;
                        self.trace_call(
                            Some(call),
                            format!("Sent ICE candidate '{}'", candidate.candidate),
                        );
                    }
                    None => {
                        transport.send_candidate(None).await;
                        self.trace_call(Some(call), "Completed gathering ICE candidates");
                    }
                }
            }
            PeerEvent::Track(track) => {
                self.trace_call(Some(call), format!("Received {} track", track.kind()));
                if let Some(stream) = call.add_remote_track(track) {
                    self.events.publish(SessionEvent::Stream {
                        call_id: call.id().to_string(),
                        stream: Some(stream),
                    });
                }
            }
        }
    }

    /// Fatal failure of the active call: `error` status, cooldown deadline,
    /// resources released now; the watchdog ends the call once the cooldown
    /// lapses
    async fn fail_call(self: &Arc<Self>, call: &Arc<Call>, message: String) {
        if call.is_closing() || !self.is_active(call) {
            return;
        }
        warn_throttled!(self.throttler, self.key.as_str(), "{}: {}", call.id(), message);
        *self.last_error.write() = Some(message.clone());
        self.trace_call(Some(call), &message);
        self.set_status(SessionStatus::Error);
        call.extend(self.ctx.policy.error_timeout());
        call.release().await;
    }

    /// Reachability was lost
    async fn restart_call(self: &Arc<Self>, call: &Arc<Call>) {
        if call.is_closing() || !self.is_active(call) {
            return;
        }
        self.trace_call(Some(call), "Restarting call");
        self.end_call(call).await;
        self.watchdog.disarm();
        self.kick();
    }

    /// Tear down `call`. Repeated and concurrent invocations are no-ops.
    async fn end_call(self: &Arc<Self>, call: &Arc<Call>) {
        if !self.calls.lock().iter().any(|c| Arc::ptr_eq(c, call)) {
            return;
        }

        self.spawn_snapshot_refresh();
        self.trace_call(Some(call), "Ending call");
        call.release().await;

        let removed = {
            let mut calls = self.calls.lock();
            let before = calls.len();
            calls.retain(|c| !Arc::ptr_eq(c, call));
            calls.len() != before
        };
        if !removed {
            return;
        }
        {
            let mut active = self.active.lock();
            if active.as_ref().map(|a| Arc::ptr_eq(a, call)).unwrap_or(false) {
                *active = None;
            }
        }

        self.set_status(SessionStatus::Disconnected);
        self.trace_call(Some(call), "Call ended");
        self.events
            .publish(SessionEvent::Connected { connected: false });
    }

    /// Tear down every call, stop all timers and enter `terminated` for good
    pub async fn terminate(self: &Arc<Self>) {
        {
            let mut status = self.status.write();
            if *status == SessionStatus::Terminated {
                return;
            }
            *status = SessionStatus::Terminated;
        }
        info!("{}: session terminated", self.key);
        self.trace("STATE terminated");
        self.events.publish(SessionEvent::Status {
            status: SessionStatus::Terminated,
            error: None,
        });

        self.cancel_termination();
        if let Some(image_loop) = self.image_loop.lock().take() {
            image_loop.abort();
        }

        {
            let _tick = self.watchdog.lock_tick().await;
            self.watchdog.shutdown();
            let calls: Vec<Arc<Call>> = self.calls.lock().clone();
            for call in calls {
                self.end_call(&call).await;
            }
        }

        let hook = self.on_terminated.lock().take();
        if let Some(hook) = hook {
            hook(&self.key);
        }
    }

    // ---- snapshots & statistics ----

    fn ensure_image_loop(self: &Arc<Self>) {
        if !self.snapshots.has_source() || self.is_terminated() {
            return;
        }
        let mut slot = self.image_loop.lock();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        *slot = Some(tokio::spawn(run_image_loop(Arc::downgrade(self))));
    }

    fn spawn_snapshot_refresh(self: &Arc<Self>) {
        if !self.snapshots.has_source() {
            return;
        }
        let session = self.clone();
        tokio::spawn(async move { session.refresh_snapshot().await });
    }

    async fn refresh_snapshot(&self) {
        if let Some(snapshot) = self.snapshots.refresh().await {
            self.stats.lock().record_image_bytes(snapshot.size());
            self.events.publish(SessionEvent::Image {
                timestamp: snapshot.timestamp(),
                hash: snapshot.hash(),
                size: snapshot.size(),
            });
        }
    }

    async fn sample_statistics(&self, call: &Call) {
        if let Some(peer) = call.peer() {
            let mut counters = peer.counters().await;
            if let Some(stream) = call.remote_stream() {
                stream.counters().fill(&mut counters);
            }
            self.stats.lock().update_counters(counters);
        }

        let mut stats = self.stats.lock();
        if let Some(report) = stats.sample(Instant::now()) {
            debug!("{}: {}", self.key, report.summary());
        }
    }

    // ---- status & tracing ----

    fn set_status(&self, status: SessionStatus) {
        {
            let mut current = self.status.write();
            if *current == status || *current == SessionStatus::Terminated {
                return;
            }
            *current = status;
        }
        self.trace(format!("STATE {}", status));

        let error = if status == SessionStatus::Error {
            self.last_error()
        } else {
            None
        };
        self.events.publish(SessionEvent::Status { status, error });
    }

    fn trace(&self, message: impl std::fmt::Display) {
        let call = self.active_call();
        self.trace_call(call.as_deref(), message);
    }

    /// `<call id or key>:<ms since call start>: <message>`
    fn trace_call(&self, call: Option<&Call>, message: impl std::fmt::Display) {
        let line = match call {
            Some(call) => format!("{}:{}: {}", call.id(), call.elapsed().as_millis(), message),
            None => format!("{}:{}: {}", self.key, Utc::now().timestamp_millis(), message),
        };
        debug!("{}", line);
        if self.is_tracing() {
            self.events.publish(SessionEvent::Trace { message: line });
        }
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("key", &self.key)
            .field("status", &self.status())
            .field("active_call", &self.active_call_id())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

/// Self-rescheduling watchdog of one generation
async fn run_watchdog(session: Weak<SessionOrchestrator>, generation: u64) {
    let mut cold = true;
    loop {
        let Some(strong) = session.upgrade() else {
            return;
        };
        let delay = {
            let _tick = strong.watchdog.lock_tick().await;
            if !strong.watchdog.is_current(generation) {
                return;
            }
            strong.pass(cold).await
        };
        cold = false;
        drop(strong);
        tokio::time::sleep(delay).await;
    }
}

/// Snapshot cadence, independent of the watchdog
async fn run_image_loop(session: Weak<SessionOrchestrator>) {
    loop {
        let Some(strong) = session.upgrade() else {
            return;
        };
        if strong.is_terminated() {
            return;
        }
        let interval = strong
            .consumers
            .lock()
            .min_poll_interval(strong.ctx.policy.image_interval());
        if interval.is_zero() {
            return;
        }
        if !strong.is_any_consumer_rendering() {
            strong.refresh_snapshot().await;
        }
        drop(strong);
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{IceState, MediaTrack};
    use crate::testing::TestHarness;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn camera() -> CameraConfig {
        let mut config = CameraConfig::for_entity("camera.door");
        config.url = Some("http://go2rtc:1984".to_string());
        config
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn statuses(events: &[SessionEvent]) -> Vec<SessionStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Status { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    async fn attached(
        session: &Arc<SessionOrchestrator>,
        consumer: ConsumerHandle,
    ) -> (Arc<ConsumerHandle>, UnboundedReceiver<SessionEvent>) {
        let consumer = Arc::new(consumer);
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(session.attach(&consumer, tx).attached);
        (consumer, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_visible_consumer_connects() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Uninitialized);

        let (_consumer, mut rx) = attached(&session, ConsumerHandle::new()).await;
        settle().await;

        let events = drain(&mut rx);
        assert_eq!(
            statuses(&events),
            vec![
                SessionStatus::Reset,
                SessionStatus::Connecting,
                SessionStatus::Connected
            ]
        );
        let streams = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Stream { stream: Some(_), .. }))
            .count();
        assert_eq!(streams, 1);
        assert!(session.is_streaming());
        assert!(session.is_streaming_audio());
        assert_eq!(harness.transports.count(), 1);
        assert_eq!(session.call_count(), 1);

        let transport = harness.transports.last().unwrap();
        assert_eq!(transport.offers().len(), 1);
        assert_eq!(
            harness.peers.last().unwrap().receivers(),
            vec![MediaKind::Video, MediaKind::Audio]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_enters_error_cooldown() {
        let harness = TestHarness::new();
        harness.transports.hang_open();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (_consumer, mut rx) = attached(&session, ConsumerHandle::new()).await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session.last_error().is_some());
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Status { status: SessionStatus::Error, error: Some(_) }
        )));
        assert_eq!(harness.transports.last().unwrap().close_count(), 1);

        // Still cooling down
        tokio::time::sleep(Duration::from_secs(27)).await;
        assert_eq!(harness.transports.count(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(harness.transports.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signaling_error_is_fatal_to_call() {
        let harness = TestHarness::new();
        harness.transports.reply_error("stream not found");
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (_consumer, _rx) = attached(&session, ConsumerHandle::new()).await;
        settle().await;

        assert_eq!(session.status(), SessionStatus::Error);
        assert_eq!(session.last_error().as_deref(), Some("stream not found"));
        assert_eq!(harness.peers.last().unwrap().close_count(), 1);
        assert!(!session.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_answer_is_fatal_to_call() {
        let harness = TestHarness::new();
        harness.peers.reject_answers();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (_consumer, _rx) = attached(&session, ConsumerHandle::new()).await;
        settle().await;

        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session.last_error().unwrap().contains("answer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_url_is_error() {
        let harness = TestHarness::new();
        harness.transports.fail_create();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (_consumer, _rx) = attached(&session, ConsumerHandle::new()).await;
        settle().await;

        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session
            .last_error()
            .unwrap()
            .contains("Invalid signaling configuration"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrendered_call_expires_and_restarts() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (_consumer, _rx) = attached(&session, ConsumerHandle::new()).await;
        settle().await;
        assert!(session.is_streaming());
        let first = session.active_call_id().unwrap();

        // Nobody renders, so the deadline runs down
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(harness.transports.count(), 2);
        assert_eq!(harness.transports.created()[0].close_count(), 1);
        assert_eq!(session.call_count(), 1);
        assert_ne!(session.active_call_id().unwrap(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rendering_keeps_call_alive() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (consumer, mut rx) = attached(&session, ConsumerHandle::new()).await;
        consumer.set_rendering(true);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(harness.transports.count(), 1);
        assert!(session.is_any_consumer_rendering());

        let heartbeats = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::Heartbeat { live: true }))
            .count();
        assert!(heartbeats >= 55);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ice_loss_restarts_with_single_call() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (consumer, mut rx) = attached(&session, ConsumerHandle::new()).await;
        consumer.set_rendering(true);
        settle().await;
        drain(&mut rx);

        harness.peers.last().unwrap().set_ice(IceState::Failed);
        settle().await;

        assert_eq!(harness.transports.count(), 2);
        assert_eq!(session.call_count(), 1);
        assert!(session.is_streaming());
        assert_eq!(
            statuses(&drain(&mut rx)),
            vec![
                SessionStatus::Disconnected,
                SessionStatus::Reset,
                SessionStatus::Connecting,
                SessionStatus::Connected
            ]
        );
        // The closed peer of the first call must not trigger another restart
        settle().await;
        assert_eq!(harness.transports.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_tracks_restart_call() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (consumer, _rx) = attached(&session, ConsumerHandle::new()).await;
        consumer.set_rendering(true);
        settle().await;

        for track in session.remote_stream().unwrap().tracks() {
            track.stop();
        }
        assert!(!session.is_streaming());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(harness.transports.count(), 2);
        assert_eq!(harness.transports.created()[0].close_count(), 1);
        assert!(session.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_detach_terminates_after_grace() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let terminated = Arc::new(AtomicBool::new(false));
        let flag = terminated.clone();
        session.on_terminated(Box::new(move |_| flag.store(true, Ordering::SeqCst)));

        let (a, _rx_a) = attached(&session, ConsumerHandle::new()).await;
        let (b, _rx_b) = attached(&session, ConsumerHandle::new()).await;
        settle().await;

        assert!(session.detach(&a));
        assert!(!session.detach(&a));
        assert!(session.detach(&b));

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert!(!session.is_terminated());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(session.is_terminated());
        assert!(terminated.load(Ordering::SeqCst));
        assert_eq!(session.call_count(), 0);
        assert_eq!(harness.transports.last().unwrap().close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_within_grace_cancels_termination() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (consumer, _rx) = attached(&session, ConsumerHandle::new()).await;
        settle().await;

        session.detach(&consumer);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let (_again, _rx2) = attached(&session, ConsumerHandle::new()).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!session.is_terminated());
        assert_eq!(session.consumer_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_keeps_session_without_consumers() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (consumer, mut rx) = attached(&session, ConsumerHandle::new()).await;
        session.set_background(true).await.unwrap();
        assert!(session.background());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::Background { enabled: true })));

        session.detach(&consumer);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!session.is_terminated());
        assert!(session.is_streaming());
        assert_eq!(harness.transports.count(), 1);

        session.set_background(false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(session.is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_holder_releases_hidden_consumers() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        session.set_background(true).await.unwrap();

        let (hidden, mut hidden_rx) =
            attached(&session, ConsumerHandle::new().visible(false)).await;
        let (holder, _holder_rx) =
            attached(&session, ConsumerHandle::new().allow_background(true)).await;

        let release = session.set_visible(&holder, false);
        assert_eq!(release, vec![hidden.id()]);
        assert_eq!(session.background_holder(), Some(holder.id()));
        assert!(drain(&mut hidden_rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::Release)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invisible_consumer_does_not_play() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (consumer, _rx) = attached(&session, ConsumerHandle::new().visible(false)).await;
        settle().await;
        assert_eq!(harness.transports.count(), 0);

        session.set_visible(&consumer, true);
        settle().await;
        assert_eq!(harness.transports.count(), 1);
        assert!(session.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_only_endpoint() {
        let harness = TestHarness::new();
        harness.snapshots.push_ok(b"jpeg");
        let mut config = camera();
        config.audio = false;
        config.video = false;
        let session = SessionOrchestrator::new(config, harness.context())
            .await
            .unwrap();
        let (_consumer, mut rx) = attached(&session, ConsumerHandle::new().visible(false)).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(harness.transports.count(), 0);
        assert_eq!(session.snapshot().unwrap().data().as_ref(), b"jpeg");
        let images = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::Image { size: 4, .. }))
            .count();
        assert_eq!(images, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_polling_pauses_while_rendering() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (consumer, _rx) = attached(
            &session,
            ConsumerHandle::new().poll_interval(Duration::from_secs(1)),
        )
        .await;
        consumer.set_rendering(true);
        settle().await;
        let fetched = harness.snapshots.fetch_count();
        assert!(fetched >= 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(harness.snapshots.fetch_count(), fetched);

        consumer.set_rendering(false);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(harness.snapshots.fetch_count() > fetched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_microphone_toggle_restarts_streaming_call() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (consumer, mut rx) = attached(&session, ConsumerHandle::new()).await;
        consumer.set_rendering(true);
        settle().await;

        session.set_microphone(true).await.unwrap();
        settle().await;

        assert!(session.microphone());
        assert_eq!(harness.transports.count(), 2);
        assert_eq!(harness.peers.last().unwrap().local_track_count(), 1);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::Microphone { enabled: true })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_is_idempotent_and_sticky() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (_consumer, mut rx) = attached(&session, ConsumerHandle::new()).await;
        settle().await;
        drain(&mut rx);

        tokio::join!(session.terminate(), session.terminate());
        session.terminate().await;

        assert_eq!(session.status(), SessionStatus::Terminated);
        assert_eq!(harness.transports.last().unwrap().close_count(), 1);
        assert_eq!(
            statuses(&drain(&mut rx)),
            vec![SessionStatus::Terminated]
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(harness.transports.count(), 1);
        let late = Arc::new(ConsumerHandle::new());
        let (tx, _late_rx) = mpsc::unbounded_channel();
        assert!(!session.attach(&late, tx).attached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debug_consumer_receives_trace() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (_consumer, mut rx) = attached(&session, ConsumerHandle::new().debug(true)).await;
        settle().await;

        let traces: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Trace { message } => Some(message),
                _ => None,
            })
            .collect();
        let started = traces
            .iter()
            .find(|m| m.ends_with(": Call started"))
            .unwrap();
        assert!(started.starts_with("camera-door-m_"));
        assert!(traces.iter().any(|m| m.ends_with(": Sent offer")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_sampled_while_streaming() {
        let harness = TestHarness::new();
        let mut config = camera();
        config.stats = true;
        config.fps = Some(25);
        let session = SessionOrchestrator::new(config, harness.context())
            .await
            .unwrap();
        let (consumer, _rx) = attached(&session, ConsumerHandle::new()).await;
        consumer.set_rendering(true);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let report = session.statistics().unwrap();
        assert!(report.bytes_per_sec > 0.0);
        assert!(report.summary().starts_with("recv: "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_idle_while_nobody_renders() {
        let harness = TestHarness::new();
        let mut config = camera();
        config.stats = true;
        let session = SessionOrchestrator::new(config, harness.context())
            .await
            .unwrap();
        let (_consumer, _rx) = attached(&session, ConsumerHandle::new()).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(session.is_streaming());
        assert!(session.statistics().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_consumer_sees_connected_and_debug() {
        let harness = TestHarness::new();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (_consumer, mut rx) = attached(&session, ConsumerHandle::new()).await;
        settle().await;
        session.set_debug(true);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Connected { connected: true })));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Debug { enabled: true })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_peer_creation_times_out() {
        let harness = TestHarness::new();
        harness.peers.hang_create();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (_consumer, _rx) = attached(&session, ConsumerHandle::new()).await;

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(session.status(), SessionStatus::Connecting);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session.last_error().unwrap().contains("peer connection"));
        assert_eq!(harness.transports.last().unwrap().close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_offer_times_out() {
        let harness = TestHarness::new();
        harness.peers.hang_offer();
        let session = SessionOrchestrator::new(camera(), harness.context())
            .await
            .unwrap();
        let (_consumer, _rx) = attached(&session, ConsumerHandle::new()).await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session.last_error().unwrap().contains("offer"));
        assert_eq!(harness.peers.last().unwrap().close_count(), 1);
        assert!(harness.transports.last().unwrap().offers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_constructor_forces_preferences() {
        let harness = TestHarness::new();
        let mut config = camera();
        config.background = true;
        config.microphone = true;
        let session = SessionOrchestrator::new(config, harness.context())
            .await
            .unwrap();
        assert!(session.background());
        assert!(session.microphone());
        assert_eq!(session.key().as_str(), "camera-door");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let harness = TestHarness::new();
        let result = SessionOrchestrator::new(CameraConfig::default(), harness.context()).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
