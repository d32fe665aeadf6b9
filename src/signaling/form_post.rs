//! Single-shot form POST signaling (RTSPtoWeb)

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::message::{IceCandidate, SdpAnswer, SdpOffer};
use super::{SignalingEvent, SignalingEventSender, SignalingTransport};
use crate::config::SignalingKind;
use crate::error::Result;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Offer as `data=<url-encoded sdp>`, answer as the url-encoded response body.
/// Candidates are not trickled.
pub struct FormPostTransport {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    events: SignalingEventSender,
    cancel: CancellationToken,
}

impl FormPostTransport {
    pub fn new(
        client: reqwest::Client,
        url: String,
        timeout: Duration,
        events: SignalingEventSender,
    ) -> Self {
        Self {
            client,
            url,
            timeout,
            events,
            cancel: CancellationToken::new(),
        }
    }

    async fn exchange(&self, sdp: &str) -> std::result::Result<String, String> {
        let body = format!("data={}", urlencoding::encode(sdp));
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(describe_error)?;

        let ok = response.status().is_success();
        let text = response.text().await.map_err(describe_error)?;
        if !ok {
            return Err(text);
        }

        urlencoding::decode(&text)
            .map(|s| s.into_owned())
            .map_err(|e| format!("Malformed answer: {}", e))
    }
}

fn describe_error(e: reqwest::Error) -> String {
    if e.is_timeout() {
        "Signaling server timeout".to_string()
    } else {
        format!("Error connecting to signaling server: {}", e)
    }
}

#[async_trait]
impl SignalingTransport for FormPostTransport {
    async fn open(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn send_offer(&self, offer: &SdpOffer) {
        if self.cancel.is_cancelled() {
            return;
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.exchange(&offer.sdp) => result,
        };

        let event = match result {
            Ok(sdp) => SignalingEvent::Answer(SdpAnswer::new(sdp)),
            Err(message) => SignalingEvent::Error(message),
        };
        let _ = self.events.send(event);
    }

    async fn send_candidate(&self, _candidate: Option<&IceCandidate>) {}

    async fn close(&self) {
        self.cancel.cancel();
    }

    fn is_open(&self) -> bool {
        true
    }

    fn kind(&self) -> SignalingKind {
        SignalingKind::Rtsptoweb
    }
}
