use serde::{Deserialize, Serialize};
use webrtc::ice::mdns::MulticastDnsMode;

/// Environment variable overriding the configured mDNS mode
pub const MDNS_MODE_ENV: &str = "WEBRTC_BRIDGE_MDNS_MODE";

/// mDNS handling for host candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MdnsMode {
    Disabled,
    /// Resolve `.local` candidates from the remote side, never gather our own.
    /// More stable for first LAN connections.
    #[default]
    QueryOnly,
    QueryAndGather,
}

impl MdnsMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "false" | "0" => Some(Self::Disabled),
            "query" | "query_only" | "query-only" => Some(Self::QueryOnly),
            "gather" | "query_and_gather" | "query-and-gather" | "on" | "true" | "1" => {
                Some(Self::QueryAndGather)
            }
            _ => None,
        }
    }

    /// Apply the environment override, if set and valid
    pub fn resolve(self) -> Self {
        std::env::var(MDNS_MODE_ENV)
            .ok()
            .and_then(|raw| Self::parse(&raw))
            .unwrap_or(self)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::QueryOnly => "query_only",
            Self::QueryAndGather => "query_and_gather",
        }
    }

    pub(crate) fn to_rtc(self) -> MulticastDnsMode {
        match self {
            Self::Disabled => MulticastDnsMode::Disabled,
            Self::QueryOnly => MulticastDnsMode::QueryOnly,
            Self::QueryAndGather => MulticastDnsMode::QueryAndGather,
        }
    }
}

pub(crate) fn mdns_host_name(peer_id: &str) -> String {
    format!("{peer_id}.local")
}
