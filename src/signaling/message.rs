//! Signaling types and wire messages

use serde::{Deserialize, Serialize};

/// SDP offer created by the local peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpOffer {
    pub sdp: String,
}

impl SdpOffer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// SDP answer from the remote endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpAnswer {
    pub sdp: String,
}

impl SdpAnswer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line without the `a=` prefix
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// JSON frame exchanged over the duplex WebSocket channel
///
/// `{"type": "webrtc/offer", "value": "<sdp>"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum WireMessage {
    #[serde(rename = "webrtc/offer")]
    Offer(String),
    #[serde(rename = "webrtc/answer")]
    Answer(String),
    /// Empty value marks the end of candidates
    #[serde(rename = "webrtc/candidate")]
    Candidate(String),
    #[serde(rename = "error")]
    Error(String),
}
