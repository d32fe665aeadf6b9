//! Duplex WebSocket signaling (go2rtc message format)

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::message::{IceCandidate, SdpAnswer, SdpOffer, WireMessage};
use super::{SignalingEvent, SignalingEventSender, SignalingTransport};
use crate::config::SignalingKind;
use crate::error::{AppError, Result};

/// Media section every inbound candidate is attributed to
const REMOTE_CANDIDATE_MID: &str = "0";

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

/// Signaling over one persistent WebSocket
pub struct WebSocketTransport {
    url: String,
    kind: SignalingKind,
    events: SignalingEventSender,
    connection: Mutex<Option<Connection>>,
    /// Cleared by the pump when the socket goes away
    open: Arc<AtomicBool>,
}

impl WebSocketTransport {
    pub fn new(url: String, kind: SignalingKind, events: SignalingEventSender) -> Self {
        Self {
            url,
            kind,
            events,
            connection: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn send_wire(&self, message: WireMessage, what: &str) {
        if !self.is_open() {
            let _ = self.events.send(SignalingEvent::Error(format!(
                "Cannot send {} from closed WebSocket",
                what
            )));
            return;
        }

        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                let _ = self.events.send(SignalingEvent::Error(e.to_string()));
                return;
            }
        };

        let sent = self
            .connection
            .lock()
            .as_ref()
            .map(|c| c.outbound.send(Message::Text(text.into())).is_ok())
            .unwrap_or(false);
        if !sent {
            let _ = self.events.send(SignalingEvent::Error(format!(
                "Cannot send {} from closed WebSocket",
                what
            )));
        }
    }
}

/// Translate one inbound frame; returns `false` when the channel must close
fn handle_frame(text: &str, events: &SignalingEventSender) -> bool {
    let message: WireMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(_) => {
            debug!("Ignoring signaling frame: {}", text);
            return true;
        }
    };

    match message {
        WireMessage::Answer(sdp) => {
            let _ = events.send(SignalingEvent::Answer(SdpAnswer::new(sdp)));
        }
        WireMessage::Candidate(value) => {
            let candidate = if value.is_empty() {
                None
            } else {
                Some(IceCandidate {
                    candidate: value,
                    sdp_mid: Some(REMOTE_CANDIDATE_MID.to_string()),
                    sdp_mline_index: None,
                    username_fragment: None,
                })
            };
            let _ = events.send(SignalingEvent::Candidate(candidate));
        }
        WireMessage::Error(value) => {
            if !value.is_empty() {
                let _ = events.send(SignalingEvent::Error(value));
            }
            return false;
        }
        WireMessage::Offer(_) => {
            debug!("Ignoring remote offer on signaling channel");
        }
    }
    true
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn open(&self, timeout: Duration) -> Result<()> {
        if self.connection.lock().is_some() {
            return Err(AppError::Signaling("WebSocket is already open".to_string()));
        }

        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let (stream, _) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                AppError::Timeout(format!(
                    "WebSocket connection timed out after {}ms",
                    timeout.as_millis()
                ))
            })?
            .map_err(|e| AppError::Signaling(format!("WebSocket encountered an error: {}", e)))?;

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let cancel = CancellationToken::new();
        let events = self.events.clone();
        let open = self.open.clone();
        let token = cancel.clone();

        open.store(true, Ordering::SeqCst);
        let _ = events.send(SignalingEvent::Trace(
            "WebSocket signaling channel opened".to_string(),
        ));

        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Some(message) = outbound_rx.recv() => {
                        if let Err(e) = sink.send(message).await {
                            warn!("Signaling send failed: {}", e);
                            let _ = events.send(SignalingEvent::Error(
                                "WebSocket encountered an error".to_string(),
                            ));
                            break;
                        }
                    }
                    frame = source.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if !handle_frame(text.as_str(), &events) {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("Signaling socket error: {}", e);
                            let _ = events.send(SignalingEvent::Error(
                                "WebSocket encountered an error".to_string(),
                            ));
                            break;
                        }
                    }
                }
            }
            open.store(false, Ordering::SeqCst);
            let _ = events.send(SignalingEvent::Trace(
                "WebSocket signaling channel closed".to_string(),
            ));
        });

        *self.connection.lock() = Some(Connection {
            outbound,
            cancel,
            pump,
        });
        Ok(())
    }

    async fn send_offer(&self, offer: &SdpOffer) {
        self.send_wire(WireMessage::Offer(offer.sdp.clone()), "offer");
    }

    async fn send_candidate(&self, candidate: Option<&IceCandidate>) {
        let value = candidate.map(|c| c.candidate.clone()).unwrap_or_default();
        self.send_wire(WireMessage::Candidate(value), "candidate");
    }

    async fn close(&self) {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.cancel.cancel();
            let mut pump = connection.pump;
            if tokio::time::timeout(Duration::from_secs(1), &mut pump).await.is_err() {
                pump.abort();
            }
        }
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn kind(&self) -> SignalingKind {
        self.kind
    }
}
