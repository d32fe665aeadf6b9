//! Signaling transports
//!
//! A transport exchanges the SDP offer/answer and trickled ICE candidates with
//! the remote negotiation endpoint. Inbound answers, candidates, errors and
//! trace lines are delivered as [`SignalingEvent`]s on the channel handed to
//! the transport at construction.
//!
//! Three bindings exist:
//! - [`WebSocketTransport`]: duplex JSON channel (go2rtc message format)
//! - [`WhepTransport`]: offer POST plus trickle-ICE PATCH requests
//! - [`FormPostTransport`]: single-shot form POST (RTSPtoWeb)

pub mod form_post;
pub mod message;
pub mod websocket;
pub mod whep;

pub use form_post::FormPostTransport;
pub use message::{IceCandidate, SdpAnswer, SdpOffer, WireMessage};
pub use websocket::WebSocketTransport;
pub use whep::WhepTransport;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{CameraConfig, SessionPolicy, SignalingKind};
use crate::error::{AppError, Result};

/// Inbound signaling event
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Answer(SdpAnswer),
    /// `None` marks the end of remote candidates
    Candidate(Option<IceCandidate>),
    /// Any error is fatal to the call that owns the transport
    Error(String),
    Trace(String),
}

pub type SignalingEventSender = mpsc::UnboundedSender<SignalingEvent>;

/// Signaling capability, one instance per call
///
/// `send_offer` and `send_candidate` never fail directly: failures arrive as
/// [`SignalingEvent::Error`].
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Establish reachability; must fail rather than hang past `timeout`
    async fn open(&self, timeout: Duration) -> Result<()>;

    /// Send the local offer; the answer arrives as [`SignalingEvent::Answer`]
    async fn send_offer(&self, offer: &SdpOffer);

    /// Send a local candidate, or `None` when gathering completed
    async fn send_candidate(&self, candidate: Option<&IceCandidate>);

    /// Release all resources. Safe on never-opened or closed transports.
    async fn close(&self);

    fn is_open(&self) -> bool;

    fn kind(&self) -> SignalingKind;
}

/// Creates the transport of a new call
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        config: &CameraConfig,
        policy: &SessionPolicy,
        events: SignalingEventSender,
    ) -> Result<Arc<dyn SignalingTransport>>;
}

/// Factory selecting the binding from [`CameraConfig::signaling`]
#[derive(Clone, Default)]
pub struct DefaultTransportFactory {
    client: reqwest::Client,
}

impl DefaultTransportFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        config: &CameraConfig,
        policy: &SessionPolicy,
        events: SignalingEventSender,
    ) -> Result<Arc<dyn SignalingTransport>> {
        let url = signaling_url(config)?;
        let transport: Arc<dyn SignalingTransport> = match config.signaling {
            SignalingKind::Go2rtc => Arc::new(WebSocketTransport::new(url, SignalingKind::Go2rtc, events)),
            SignalingKind::Websocket => {
                Arc::new(WebSocketTransport::new(url, SignalingKind::Websocket, events))
            }
            SignalingKind::Whep => Arc::new(WhepTransport::new(
                self.client.clone(),
                url,
                policy.signaling_timeout(),
                events,
            )),
            SignalingKind::Rtsptoweb => Arc::new(FormPostTransport::new(
                self.client.clone(),
                url,
                policy.signaling_timeout(),
                events,
            )),
        };
        Ok(transport)
    }
}

/// Derive the signaling endpoint URL for `config`
pub fn signaling_url(config: &CameraConfig) -> Result<String> {
    let url = config
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(invalid_configuration)?;

    match config.signaling {
        SignalingKind::Go2rtc => go2rtc_url(url, &config.entity),
        SignalingKind::Websocket | SignalingKind::Rtsptoweb => Ok(url.to_string()),
        SignalingKind::Whep => {
            if url.contains("/whep") {
                Ok(url.to_string())
            } else {
                Ok(format!("{}/{}/whep", url.trim_end_matches('/'), config.entity))
            }
        }
    }
}

/// `http(s)://host/` → `ws(s)://host/api/ws?src=<src>`
fn go2rtc_url(url: &str, entity: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url).map_err(|_| invalid_configuration())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid_configuration());
    }

    let src = parsed
        .query_pairs()
        .find(|(k, _)| k == "src")
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| entity.to_string());

    let base = url.split('?').next().unwrap_or(url).trim_end_matches('/');
    Ok(format!(
        "ws{}/api/ws?src={}",
        &base["http".len()..],
        urlencoding::encode(&src)
    ))
}

fn invalid_configuration() -> AppError {
    AppError::Config("Invalid signaling configuration".to_string())
}
