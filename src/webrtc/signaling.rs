//! Session description, ICE candidate and state types shared by every
//! signaling regime

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// SDP role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

/// SDP description; the body is treated as opaque text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line, starting with `candidate:`
    pub candidate: String,
    /// Media section identifier
    pub mid: String,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, mid: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            mid: mid.into(),
        }
    }

    /// Trickle ICE SDP fragment body: `a=<candidate>`
    pub fn to_sdp_fragment(&self) -> String {
        format!("a={}", self.candidate)
    }
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl PeerState {
    /// `Connected` or `Completed`
    pub fn is_connected(self) -> bool {
        matches!(self, PeerState::Connected | PeerState::Completed)
    }

    pub fn is_terminal(self) -> bool {
        self == PeerState::Closed
    }
}

impl Default for PeerState {
    fn default() -> Self {
        Self::New
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::New => write!(f, "new"),
            PeerState::Checking => write!(f, "checking"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Completed => write!(f, "completed"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// Kind of a received media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

/// One received RTP payload
///
/// Payloads are not depacketized; reassembly is the consumer's job.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: MediaKind,
    pub payload: Bytes,
    /// RTP timestamp
    pub timestamp: u32,
    pub sequence_number: u16,
    /// RTP marker bit (end of video frame)
    pub marker: bool,
    pub ssrc: u32,
}

/// Host log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_connected() {
        let all = [
            PeerState::New,
            PeerState::Checking,
            PeerState::Connected,
            PeerState::Completed,
            PeerState::Failed,
            PeerState::Disconnected,
            PeerState::Closed,
        ];
        for state in all {
            assert_eq!(
                state.is_connected(),
                state == PeerState::Connected || state == PeerState::Completed,
                "{}",
                state
            );
        }
    }

    #[test]
    fn test_sdp_fragment() {
        let candidate = IceCandidate::new(
            "candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host",
            "0",
        );
        assert_eq!(
            candidate.to_sdp_fragment(),
            "a=candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host"
        );
    }

    #[test]
    fn test_description_serialization() {
        let json = serde_json::to_string(&SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
    }
}
