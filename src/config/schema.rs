use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::http::HttpClientConfig;
use crate::manager::ConnectionManagerConfig;
use crate::p2p::DEFAULT_ANSWER_TIMEOUT_MS;
use crate::reconnect::ReconnectConfig;
use crate::webrtc::IceConfig;

/// Main bridge configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// STUN/TURN servers and mDNS handling
    pub ice: IceConfig,
    /// WHIP/WHEP HTTP timeouts
    pub http: HttpClientConfig,
    /// Backoff for WHEP reconnection
    pub reconnect: ReconnectConfig,
    pub manager: ConnectionManagerConfig,
    pub p2p: P2PSettings,
}

/// Manual P2P session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2PSettings {
    /// Deadline for the local offer/answer (ms)
    pub answer_timeout_ms: u64,
}

impl Default for P2PSettings {
    fn default() -> Self {
        Self {
            answer_timeout_ms: DEFAULT_ANSWER_TIMEOUT_MS,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        self.reconnect.validate()?;
        self.manager.validate()?;

        if self.http.request_timeout_ms == 0 || self.http.connect_timeout_ms == 0 {
            return Err(BridgeError::InvalidArgument(
                "http timeouts must be greater than 0".to_string(),
            ));
        }
        if self.p2p.answer_timeout_ms == 0 {
            return Err(BridgeError::InvalidArgument(
                "p2p.answer_timeout_ms must be greater than 0".to_string(),
            ));
        }
        for turn in &self.ice.turn_servers {
            let url = turn.url.to_ascii_lowercase();
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                return Err(BridgeError::InvalidArgument(format!(
                    "TURN server URL must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }
        Ok(())
    }

    /// Names of the top-level sections that differ from `other`
    pub fn changed_sections(&self, other: &BridgeConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.ice != other.ice {
            changed.push("ice");
        }
        if self.http != other.http {
            changed.push("http");
        }
        if self.reconnect != other.reconnect {
            changed.push("reconnect");
        }
        if self.manager != other.manager {
            changed.push("manager");
        }
        if self.p2p != other.p2p {
            changed.push("p2p");
        }
        changed
    }
}
