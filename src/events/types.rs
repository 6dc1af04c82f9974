//! Bridge event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::webrtc::PeerState;

/// Bridge event enumeration
///
/// Serialized as
/// ```json
/// {
///   "event": "connection.state_changed",
///   "data": { "id": "...", "state": "connected" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum BridgeEvent {
    /// A connection record was added to the manager
    #[serde(rename = "connection.created")]
    ConnectionCreated {
        id: String,
        name: String,
        server_url: String,
    },

    #[serde(rename = "connection.removed")]
    ConnectionRemoved { id: String },

    #[serde(rename = "connection.state_changed")]
    ConnectionStateChanged { id: String, state: PeerState },

    /// An error was reported for a connection; the record is unchanged
    #[serde(rename = "connection.error")]
    ConnectionError { id: String, message: String },
}

impl BridgeEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ConnectionCreated { .. } => "connection.created",
            Self::ConnectionRemoved { .. } => "connection.removed",
            Self::ConnectionStateChanged { .. } => "connection.state_changed",
            Self::ConnectionError { .. } => "connection.error",
        }
    }

    /// Id of the connection the event refers to
    pub fn connection_id(&self) -> &str {
        match self {
            Self::ConnectionCreated { id, .. }
            | Self::ConnectionRemoved { id }
            | Self::ConnectionStateChanged { id, .. }
            | Self::ConnectionError { id, .. } => id,
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// `*` matches everything, `connection.*` a whole family.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches(".*");
            event_name.starts_with(prefix)
        } else {
            event_name == topic
        }
    }
}
