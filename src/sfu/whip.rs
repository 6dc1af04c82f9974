//! WHIP ingest client
//!
//! Publishes a local session to an SFU: POST offer, receive answer and
//! resource `Location`, PATCH trickled candidates, DELETE on teardown.

use std::sync::Arc;

use tracing::{info, warn};

use super::{ConnectionCallback, ErrorCallback, HttpSession, StatusPolicy};
use crate::error::{BridgeError, Result};
use crate::http::{HttpClient, HttpClientConfig, ReqwestHttpClient};
use crate::webrtc::{IceCandidate, IceCandidateCallback, PeerConnection, SdpType};

/// WHIP client configuration
#[derive(Clone, Default)]
pub struct WhipConfig {
    /// WHIP endpoint (`http://` or `https://`)
    pub url: String,
    pub bearer_token: Option<String>,
    pub on_connected: Option<ConnectionCallback>,
    pub on_disconnected: Option<ConnectionCallback>,
    pub on_error: Option<ErrorCallback>,
    /// Called for each candidate accepted by the server
    pub on_ice_candidate: Option<IceCandidateCallback>,
}

impl WhipConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// WHIP client
pub struct WhipClient {
    config: WhipConfig,
    session: HttpSession,
}

impl WhipClient {
    /// Create a client; fails on an invalid endpoint URL
    pub fn new(config: WhipConfig, http: Arc<dyn HttpClient>) -> Result<Self> {
        let session = HttpSession::new(
            "WHIP",
            StatusPolicy::Whip,
            config.url.clone(),
            config.bearer_token.clone(),
            http,
        )?;
        Ok(Self { config, session })
    }

    /// Create a client backed by [`ReqwestHttpClient`]
    pub fn with_http_config(config: WhipConfig, http_config: &HttpClientConfig) -> Result<Self> {
        Self::new(config, Arc::new(ReqwestHttpClient::new(http_config)?))
    }

    fn report_error(&self, err: &BridgeError) {
        warn!("WHIP {}: {}", self.session.url(), err);
        if let Some(ref on_error) = self.config.on_error {
            on_error(&err.to_string());
        }
    }

    /// POST the offer and return the SDP answer
    pub async fn send_offer(&self, sdp: &str) -> Result<String> {
        match self.session.post_offer(sdp).await {
            Ok(answer) => {
                if let Some(ref on_connected) = self.config.on_connected {
                    on_connected();
                }
                Ok(answer)
            }
            Err(e) => {
                if !matches!(e, BridgeError::InvalidArgument(_)) {
                    self.report_error(&e);
                }
                Err(e)
            }
        }
    }

    /// Trickle one local candidate to the resource
    pub async fn send_ice_candidate(&self, candidate: &str, mid: &str) -> Result<()> {
        let candidate = IceCandidate::new(candidate, mid);
        match self.session.patch_candidate(&candidate).await {
            Ok(()) => {
                if let Some(ref on_ice_candidate) = self.config.on_ice_candidate {
                    on_ice_candidate(candidate);
                }
                Ok(())
            }
            Err(e) => {
                if !matches!(
                    e,
                    BridgeError::InvalidArgument(_) | BridgeError::ProtocolState(_)
                ) {
                    self.report_error(&e);
                }
                Err(e)
            }
        }
    }

    /// Offer from `peer`, publish it, and apply the answer
    pub async fn publish(&self, peer: &PeerConnection) -> Result<()> {
        let offer = peer.create_offer().await?;
        let answer = self.send_offer(&offer).await?;
        if let Err(e) = peer.set_remote_description(SdpType::Answer, &answer).await {
            self.report_error(&e);
            self.disconnect().await;
            return Err(e);
        }
        info!("WHIP publishing to {}", self.session.url());
        Ok(())
    }

    /// DELETE the resource and reset; idempotent, never fails
    pub async fn disconnect(&self) {
        let Some(result) = self.session.delete_resource().await else {
            return;
        };
        if let Err(e) = result {
            self.report_error(&e);
        }
        info!("WHIP disconnected from {}", self.session.url());
        if let Some(ref on_disconnected) = self.config.on_disconnected {
            on_disconnected();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn resource_url(&self) -> Option<String> {
        self.session.resource_url()
    }

    pub fn url(&self) -> &str {
        self.session.url()
    }
}

impl Drop for WhipClient {
    fn drop(&mut self) {
        if let Some(resource_url) = self.session.take_resource() {
            self.session.delete_in_background(resource_url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sfu::testing::{response, MockSfu, ANSWER_SDP};
    use parking_lot::Mutex;
    use reqwest::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\n";

    fn counter() -> (Arc<AtomicUsize>, ConnectionCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        (
            count,
            Arc::new(move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_invalid_url_rejected() {
        let sfu = Arc::new(MockSfu::new());
        for url in ["", "sfu.example.com/whip", "ws://sfu.example.com/whip"] {
            let err = WhipClient::new(WhipConfig::new(url), sfu.clone())
                .err()
                .unwrap();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        assert!(WhipClient::new(WhipConfig::new("HTTP://sfu.example.com/whip"), sfu).is_ok());
    }

    #[tokio::test]
    async fn test_publish_handshake() {
        let sfu = Arc::new(MockSfu::new());
        let (connected, on_connected) = counter();
        let (disconnected, on_disconnected) = counter();
        let config = WhipConfig {
            bearer_token: Some("good-token".into()),
            on_connected: Some(on_connected),
            on_disconnected: Some(on_disconnected),
            ..WhipConfig::new("https://sfu.example.com/whip")
        };
        let client = WhipClient::new(config, sfu.clone()).unwrap();

        let answer = client.send_offer(OFFER).await.unwrap();
        assert_eq!(answer, ANSWER_SDP);
        assert!(client.is_connected());
        assert_eq!(
            client.resource_url().as_deref(),
            Some("https://sfu.example.com/resource/abc123")
        );
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        let posts = sfu.requests_with(Method::POST);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].url, "https://sfu.example.com/whip");
        assert_eq!(posts[0].request.body, OFFER);
        assert_eq!(
            posts[0].request.content_type.as_deref(),
            Some("application/sdp")
        );
        assert_eq!(
            posts[0].request.headers.get("Authorization").map(String::as_str),
            Some("Bearer good-token")
        );

        client
            .send_ice_candidate("candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host", "0")
            .await
            .unwrap();
        let patches = sfu.requests_with(Method::PATCH);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].url, "https://sfu.example.com/resource/abc123");
        assert_eq!(
            patches[0].request.body,
            "a=candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host"
        );
        assert_eq!(
            patches[0].request.content_type.as_deref(),
            Some("application/trickle-ice-sdpfrag")
        );

        client.disconnect().await;
        assert!(!client.is_connected());
        assert!(client.resource_url().is_none());
        let deletes = sfu.requests_with(Method::DELETE);
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].url, "https://sfu.example.com/resource/abc123");
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);

        // Second disconnect is a no-op
        client.disconnect().await;
        assert_eq!(sfu.requests_with(Method::DELETE).len(), 1);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_offer() {
        let sfu = Arc::new(MockSfu::new());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_clone = errors.clone();
        let (connected, on_connected) = counter();
        let config = WhipConfig {
            bearer_token: Some("invalid-token".into()),
            on_connected: Some(on_connected),
            on_error: Some(Arc::new(move |msg: &str| errors_clone.lock().push(msg.to_string()))),
            ..WhipConfig::new("https://sfu.example.com/whip")
        };
        let client = WhipClient::new(config, sfu.clone()).unwrap();

        let err = client.send_offer(OFFER).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(!client.is_connected());
        assert!(client.resource_url().is_none());
        assert_eq!(connected.load(Ordering::SeqCst), 0);
        assert_eq!(errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_server_error_carries_status() {
        let sfu = Arc::new(MockSfu::with_responder(|_, _, _| {
            Ok(response(503, &[], "overloaded"))
        }));
        let client = WhipClient::new(WhipConfig::new("https://sfu.example.com/whip"), sfu).unwrap();

        let err = client.send_offer(OFFER).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.status(), Some(503));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_location_is_protocol_error() {
        let sfu = Arc::new(MockSfu::with_responder(|_, _, _| {
            Ok(response(201, &[], ANSWER_SDP))
        }));
        let client = WhipClient::new(WhipConfig::new("https://sfu.example.com/whip"), sfu).unwrap();

        let err = client.send_offer(OFFER).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_relative_location_resolved() {
        let sfu = Arc::new(MockSfu::with_responder(|_, _, _| {
            Ok(response(201, &[("Location", "/whip/resource/7")], ANSWER_SDP))
        }));
        let client =
            WhipClient::new(WhipConfig::new("http://127.0.0.1:8080/whip/endpoint"), sfu).unwrap();

        client.send_offer(OFFER).await.unwrap();
        assert_eq!(
            client.resource_url().as_deref(),
            Some("http://127.0.0.1:8080/whip/resource/7")
        );
    }

    #[tokio::test]
    async fn test_candidate_preconditions() {
        let sfu = Arc::new(MockSfu::new());
        let client =
            WhipClient::new(WhipConfig::new("https://sfu.example.com/whip"), sfu.clone()).unwrap();

        let err = client
            .send_ice_candidate("candidate:1 1 udp 1 10.0.0.1 5000 typ host", "0")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolState);

        client.send_offer(OFFER).await.unwrap();
        let err = client.send_ice_candidate("", "0").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(sfu.requests_with(Method::PATCH).is_empty());
    }

    #[tokio::test]
    async fn test_delete_failure_reported_not_returned() {
        let sfu = Arc::new(MockSfu::with_responder(|method, _, _| {
            Ok(match *method {
                Method::POST => response(201, &[("Location", "/r/1")], ANSWER_SDP),
                _ => response(500, &[], ""),
            })
        }));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_clone = errors.clone();
        let (disconnected, on_disconnected) = counter();
        let config = WhipConfig {
            on_disconnected: Some(on_disconnected),
            on_error: Some(Arc::new(move |msg: &str| errors_clone.lock().push(msg.to_string()))),
            ..WhipConfig::new("https://sfu.example.com/whip")
        };
        let client = WhipClient::new(config, sfu).unwrap();

        client.send_offer(OFFER).await.unwrap();
        client.disconnect().await;

        assert!(!client.is_connected());
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    }
}
