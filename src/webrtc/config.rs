//! ICE server configuration

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

use super::mdns::MdnsMode;

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (e.g. `stun:stun.l.google.com:19302`)
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }

    fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URL (e.g. `turn:turn.example.com:3478?transport=udp`)
    pub url: String,
    /// Username for TURN authentication
    pub username: String,
    /// Password for TURN authentication
    pub password: String,
}

impl From<&TurnServer> for IceServer {
    fn from(turn: &TurnServer) -> Self {
        IceServer::turn(turn.url.clone(), turn.username.clone(), turn.password.clone())
    }
}

/// ICE settings shared by every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs, in priority order
    pub stun_servers: Vec<String>,
    /// TURN servers
    pub turn_servers: Vec<TurnServer>,
    /// mDNS host candidate handling
    pub mdns_mode: MdnsMode,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            // Host candidates are enough on a LAN; add STUN/TURN for remote peers
            stun_servers: vec![],
            turn_servers: vec![],
            mdns_mode: MdnsMode::default(),
        }
    }
}

impl IceConfig {
    /// Flatten into an ordered server list (STUN first, then TURN)
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.stun_servers
            .iter()
            .map(IceServer::stun)
            .chain(self.turn_servers.iter().map(IceServer::from))
            .collect()
    }
}

/// Convert to webrtc-rs servers, skipping TURN entries without credentials
pub(crate) fn to_rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .filter(|server| {
            if server.is_turn() && (server.username.is_empty() || server.credential.is_empty()) {
                tracing::warn!(
                    "Skipping TURN server {:?} - credentials required but missing",
                    server.urls
                );
                return false;
            }
            !server.urls.is_empty()
        })
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers_order() {
        let config = IceConfig {
            stun_servers: vec!["stun:a:3478".into(), "stun:b:3478".into()],
            turn_servers: vec![TurnServer {
                url: "turn:t:3478".into(),
                username: "u".into(),
                password: "p".into(),
            }],
            ..Default::default()
        };

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].urls, vec!["stun:a:3478".to_string()]);
        assert_eq!(servers[2].username, "u");
        assert_eq!(servers[2].credential, "p");
    }

    #[test]
    fn test_turn_without_credentials_skipped() {
        let servers = vec![
            IceServer::stun("stun:stun.l.google.com:19302"),
            IceServer::turn("turn:turn.example.com:3478", "", ""),
        ];
        let rtc = to_rtc_ice_servers(&servers);
        assert_eq!(rtc.len(), 1);
        assert_eq!(rtc[0].urls[0], "stun:stun.l.google.com:19302");
    }
}
