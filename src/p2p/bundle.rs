//! Copy-pasteable offer/answer envelope
//!
//! Manual P2P signaling moves SDP through a clipboard or a chat window, so the
//! envelope is a single base64 (URL-safe, unpadded) token wrapping
//! `{"session_id": .., "type": "offer"|"answer", "sdp": ..}`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::webrtc::SdpType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalBundle {
    pub session_id: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SignalBundle {
    pub fn offer(session_id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(session_id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Parse a token produced by [`SignalBundle::encode`]
    ///
    /// Whitespace (line wrapping from chat clients) is ignored.
    pub fn decode(token: &str) -> Result<Self> {
        let compact: String = token.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "signal bundle is empty".to_string(),
            ));
        }

        let json = URL_SAFE_NO_PAD
            .decode(compact.trim_end_matches('='))
            .map_err(|e| BridgeError::InvalidArgument(format!("Invalid signal bundle: {}", e)))?;
        let bundle: SignalBundle = serde_json::from_slice(&json)
            .map_err(|e| BridgeError::InvalidArgument(format!("Invalid signal bundle: {}", e)))?;

        if bundle.session_id.is_empty() || bundle.sdp.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "signal bundle is missing its session id or SDP".to_string(),
            ));
        }
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_bundle_token_is_url_safe() {
        let bundle = SignalBundle::offer("Ab3dE6gH", "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n???>>>");
        let token = bundle.encode().unwrap();

        assert!(!token.contains('='));
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));

        // Chat clients wrap long lines
        let wrapped = format!("{}\n{}", &token[..10], &token[10..]);
        assert_eq!(SignalBundle::decode(&wrapped).unwrap(), bundle);
    }

    #[test]
    fn test_bundle_json_shape() {
        let bundle = SignalBundle::answer("session1", "v=0");
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["type"], "answer");
        assert_eq!(json["session_id"], "session1");
        assert_eq!(json["sdp"], "v=0");
    }

    #[test]
    fn test_malformed_bundles_rejected() {
        let cases = [
            String::new(),
            "   ".to_string(),
            "not base64 at all!".to_string(),
            URL_SAFE_NO_PAD.encode(b"{\"hello\":1}"),
            SignalBundle::offer("", "v=0").encode().unwrap(),
            SignalBundle::offer("abc", " ").encode().unwrap(),
        ];
        for case in cases {
            let err = SignalBundle::decode(&case).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{:?}", case);
        }
    }
}
