//! Peer connection configuration

use serde::{Deserialize, Serialize};

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// ICE server configuration of the local peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PeerConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN servers
    pub turn_servers: Vec<TurnServer>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_servers: vec![],
        }
    }
}

impl PeerConfig {
    /// Host candidates only, for endpoints on the local network
    pub fn local_only() -> Self {
        Self {
            stun_servers: vec![],
            turn_servers: vec![],
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnServer {
    /// TURN URLs, e.g. `turn:turn.example.com:3478?transport=udp`
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl TurnServer {
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uses_public_stun() {
        let config = PeerConfig::default();
        assert_eq!(config.stun_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert!(PeerConfig::local_only().stun_servers.is_empty());
    }

    #[test]
    fn test_deserialize_turn() {
        let config: PeerConfig = serde_json::from_str(
            r#"{"turn_servers": [{"urls": ["turn:t:3478"], "username": "u", "credential": "p"}]}"#,
        )
        .unwrap();
        assert_eq!(config.stun_servers.len(), 1);
        assert_eq!(
            config.turn_servers[0],
            TurnServer::new("turn:t:3478".into(), "u".into(), "p".into())
        );
    }
}
