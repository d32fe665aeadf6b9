//! WHEP signaling: offer POST, trickle-ICE PATCH
//!
//! The offer is POSTed as `application/sdp`; a `201` response carries the
//! answer and an `E-Tag`. Local candidates are then PATCHed as
//! `application/trickle-ice-sdpfrag` fragments conditioned on that tag.
//! Candidates gathered before the answer arrives are queued and flushed in a
//! single PATCH once it does.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, ETAG, IF_MATCH};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::message::{IceCandidate, SdpAnswer, SdpOffer};
use super::{SignalingEvent, SignalingEventSender, SignalingTransport};
use crate::config::SignalingKind;
use crate::error::Result;

const SDP_CONTENT_TYPE: &str = "application/sdp";
const SDP_FRAG_CONTENT_TYPE: &str = "application/trickle-ice-sdpfrag";

/// ICE credentials and media sections of the local offer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfferData {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    /// `m=` lines without the prefix, in section order
    pub medias: Vec<String>,
}

/// Extract the first ICE ufrag/pwd and every media line from an SDP
pub fn parse_offer(sdp: &str) -> OfferData {
    let mut data = OfferData::default();
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            data.medias.push(media.to_string());
        } else if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
            if data.ice_ufrag.is_empty() {
                data.ice_ufrag = ufrag.to_string();
            }
        } else if let Some(pwd) = line.strip_prefix("a=ice-pwd:") {
            if data.ice_pwd.is_empty() {
                data.ice_pwd = pwd.to_string();
            }
        }
    }
    data
}

/// Build a trickle-ICE SDP fragment
///
/// Candidates are grouped by m-line index (missing index counts as 0). Returns
/// `None` when no candidate maps onto a media section of the offer.
pub fn generate_sdp_fragment(offer: &OfferData, candidates: &[IceCandidate]) -> Option<String> {
    let mut by_media: BTreeMap<usize, Vec<&IceCandidate>> = BTreeMap::new();
    for candidate in candidates {
        let index = candidate.sdp_mline_index.unwrap_or(0) as usize;
        by_media.entry(index).or_default().push(candidate);
    }

    let mut frag = format!(
        "a=ice-ufrag:{}\r\na=ice-pwd:{}\r\n",
        offer.ice_ufrag, offer.ice_pwd
    );
    let mut sections = 0;
    for (mid, media) in offer.medias.iter().enumerate() {
        let Some(group) = by_media.get(&mid) else {
            continue;
        };
        frag.push_str(&format!("m={}\r\na=mid:{}\r\n", media, mid));
        for candidate in group {
            frag.push_str(&format!("a={}\r\n", candidate.candidate));
        }
        sections += 1;
    }

    (sections > 0).then_some(frag)
}

#[derive(Default)]
struct WhepState {
    offer: Option<OfferData>,
    etag: Option<String>,
    answered: bool,
    pending: Vec<IceCandidate>,
    /// Server refused PATCH; keep the session on the answer's candidates
    trickle_disabled: bool,
}

/// Signaling over WHEP-style HTTP requests
pub struct WhepTransport {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    events: SignalingEventSender,
    state: Mutex<WhepState>,
    cancel: CancellationToken,
}

impl WhepTransport {
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
            state: Mutex::new(WhepState::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of candidates waiting for the answer
    pub fn pending_candidates(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }

    async fn post_offer(&self, sdp: &str) -> std::result::Result<(Option<String>, String), String> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(sdp.to_string())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(describe_error)?;

        if response.status() != StatusCode::CREATED {
            return Err(format!(
                "sendOffer bad status code {}",
                response.status().as_u16()
            ));
        }

        let etag = response
            .headers()
            .get("E-Tag")
            .or_else(|| response.headers().get(ETAG))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(describe_error)?;
        Ok((etag, body))
    }

    async fn patch_candidates(&self, candidates: Vec<IceCandidate>) {
        let (fragment, etag) = {
            let state = self.state.lock();
            if state.trickle_disabled {
                return;
            }
            let Some(offer) = state.offer.as_ref() else {
                return;
            };
            (generate_sdp_fragment(offer, &candidates), state.etag.clone())
        };
        let Some(fragment) = fragment else {
            return;
        };

        let mut request = self
            .client
            .patch(&self.url)
            .header(CONTENT_TYPE, SDP_FRAG_CONTENT_TYPE)
            .body(fragment)
            .timeout(self.timeout);
        if let Some(etag) = etag {
            request = request.header(IF_MATCH, etag);
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = request.send() => result,
        };

        match result {
            Ok(response) if response.status() == StatusCode::NO_CONTENT => {
                self.emit(SignalingEvent::Trace(format!(
                    "Sent {} candidate(s)",
                    candidates.len()
                )));
            }
            Ok(response)
                if matches!(
                    response.status(),
                    StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
                ) =>
            {
                self.state.lock().trickle_disabled = true;
                self.emit(SignalingEvent::Trace(
                    "Server does not accept trickled candidates".to_string(),
                ));
            }
            Ok(response) => {
                self.emit(SignalingEvent::Error(format!(
                    "sendCandidate bad status code {}",
                    response.status().as_u16()
                )));
            }
            Err(e) => self.emit(SignalingEvent::Error(describe_error(e))),
        }
    }
}

fn describe_error(e: reqwest::Error) -> String {
    if e.is_timeout() {
        "whep signaling server timeout".to_string()
    } else {
        format!("Error connecting to whep signaling server: {}", e)
    }
}

#[async_trait]
impl SignalingTransport for WhepTransport {
    async fn open(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn send_offer(&self, offer: &SdpOffer) {
        if self.cancel.is_cancelled() {
            return;
        }

        {
            let mut state = self.state.lock();
            state.offer = Some(parse_offer(&offer.sdp));
            state.etag = None;
            state.answered = false;
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.post_offer(&offer.sdp) => result,
        };

        match result {
            Ok((etag, sdp)) => {
                let pending = {
                    let mut state = self.state.lock();
                    state.etag = etag;
                    state.answered = true;
                    std::mem::take(&mut state.pending)
                };
                self.emit(SignalingEvent::Answer(SdpAnswer::new(sdp)));
                if !pending.is_empty() {
                    self.patch_candidates(pending).await;
                }
            }
            Err(message) => self.emit(SignalingEvent::Error(message)),
        }
    }

    async fn send_candidate(&self, candidate: Option<&IceCandidate>) {
        if self.cancel.is_cancelled() {
            return;
        }

        let batch = {
            let mut state = self.state.lock();
            if state.trickle_disabled {
                return;
            }
            match candidate {
                Some(candidate) if !state.answered => {
                    state.pending.push(candidate.clone());
                    debug!("Queued candidate until the WHEP answer arrives");
                    return;
                }
                Some(candidate) => vec![candidate.clone()],
                None if !state.answered => return,
                None => std::mem::take(&mut state.pending),
            }
        };

        if !batch.is_empty() {
            self.patch_candidates(batch).await;
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
    }

    fn is_open(&self) -> bool {
        true
    }

    fn kind(&self) -> SignalingKind {
        SignalingKind::Whep
    }
}
