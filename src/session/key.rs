//! Endpoint key derivation

use serde::Serialize;

use crate::config::CameraConfig;

/// Normalized identifier of one effective endpoint configuration
///
/// Consumers whose configs map to the same key share one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EndpointKey(String);

impl EndpointKey {
    pub fn from_config(config: &CameraConfig) -> Self {
        let mut key: String = config
            .entity
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        if !config.audio {
            key.push_str("-a");
        }
        if !config.video {
            key.push_str("-v");
        }
        if !config.microphone {
            key.push_str("-m");
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EndpointKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
