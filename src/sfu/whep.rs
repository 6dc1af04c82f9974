//! WHEP egress client
//!
//! Pulls media from an SFU. When a frame callback is configured the client
//! owns a [`PeerConnection`] and drives it through the handshake:
//!
//! ```text
//! connect() -> create_offer -> POST offer -> apply answer
//! local candidates -> buffer until Connected, then PATCH in arrival order
//! peer Failed / transient HTTP failure -> ReconnectionManager (optional)
//! ```
//!
//! Peer events are funnelled through one ordered channel per peer so
//! candidate delivery keeps emission order across the buffering boundary.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ConnectionCallback, ErrorCallback, HttpSession, StatusPolicy};
use crate::error::{BridgeError, Result};
use crate::http::{HttpClient, HttpClientConfig, ReqwestHttpClient};
use crate::reconnect::{ReconnectConfig, ReconnectStateCallback, ReconnectionManager, RetryCallback};
use crate::webrtc::{
    FrameCallback, IceCandidate, IceServer, MdnsMode, PeerConnection, PeerConnectionConfig,
    PeerState, SdpType, StateCallback,
};

/// WHEP client configuration
#[derive(Clone, Default)]
pub struct WhepConfig {
    /// WHEP endpoint (`http://` or `https://`)
    pub url: String,
    pub bearer_token: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub mdns_mode: MdnsMode,
    pub on_connected: Option<ConnectionCallback>,
    pub on_disconnected: Option<ConnectionCallback>,
    pub on_error: Option<ErrorCallback>,
    /// Peer connection state changes
    pub on_state: Option<StateCallback>,
    pub on_video_frame: Option<FrameCallback>,
    pub on_audio_frame: Option<FrameCallback>,
    /// Retry policy for transient failures; `None` disables reconnection
    pub reconnect: Option<ReconnectConfig>,
    /// `(reconnecting, attempt)`
    pub on_reconnecting: Option<ReconnectStateCallback>,
}

impl WhepConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    fn receives_media(&self) -> bool {
        self.on_video_frame.is_some() || self.on_audio_frame.is_some()
    }
}

/// Events forwarded from the owned peer
#[derive(Debug)]
enum PeerEvent {
    Candidate(IceCandidate),
    State(PeerState),
}

struct WhepInner {
    config: WhepConfig,
    session: HttpSession,
    peer: Mutex<Option<Arc<PeerConnection>>>,
    /// Bumped for every new peer; events from older peers are ignored
    generation: AtomicU64,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    reconnect: Option<ReconnectionManager>,
    /// Set by an explicit `disconnect()`; suppresses retries
    stopped: AtomicBool,
}

impl WhepInner {
    fn report_error(&self, err: &BridgeError) {
        warn!("WHEP {}: {}", self.session.url(), err);
        if let Some(ref on_error) = self.config.on_error {
            on_error(&err.to_string());
        }
    }

    fn notify_connected(&self) {
        if let Some(ref on_connected) = self.config.on_connected {
            on_connected();
        }
    }

    async fn install_peer(self: &Arc<Self>) -> Result<Arc<PeerConnection>> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let candidate_tx = event_tx.clone();

        let peer_config = PeerConnectionConfig {
            ice_servers: self.config.ice_servers.clone(),
            mdns_mode: self.config.mdns_mode,
            on_state: Some(Arc::new(move |state| {
                let _ = event_tx.send(PeerEvent::State(state));
            })),
            on_local_ice_candidate: Some(Arc::new(move |candidate| {
                let _ = candidate_tx.send(PeerEvent::Candidate(candidate));
            })),
            on_video_frame: self.config.on_video_frame.clone(),
            on_audio_frame: self.config.on_audio_frame.clone(),
            ..Default::default()
        };

        let peer = Arc::new(PeerConnection::new(peer_config).await?);
        tokio::spawn(run_event_pump(Arc::downgrade(self), generation, event_rx));

        let previous = self.peer.lock().replace(peer.clone());
        if let Some(previous) = previous {
            previous.close().await;
        }

        debug!(
            "WHEP peer {} installed (generation {})",
            peer.peer_id(),
            generation
        );
        Ok(peer)
    }

    async fn ensure_peer(self: &Arc<Self>) -> Result<Arc<PeerConnection>> {
        let current = self.peer.lock().clone();
        match current {
            Some(peer) if !peer.is_closed() => Ok(peer),
            _ if self.config.receives_media() => self.install_peer().await,
            _ => Err(BridgeError::ProtocolState(
                "WHEP client has no peer connection (no video or audio callback configured)"
                    .to_string(),
            )),
        }
    }

    async fn connect_once(self: &Arc<Self>) -> Result<()> {
        if self.session.is_connected() {
            return Err(BridgeError::ProtocolState(
                "WHEP session already established, disconnect first".to_string(),
            ));
        }

        let peer = self.ensure_peer().await?;
        let offer = peer.create_offer().await?;
        let answer = self.session.post_offer(&offer).await?;
        if self.stopped.load(Ordering::Acquire) {
            // disconnect() ran while the offer was in flight
            self.discard_resource().await;
            return Err(BridgeError::ProtocolState(
                "WHEP client disconnected while connecting".to_string(),
            ));
        }
        self.notify_connected();

        if let Err(e) = peer.set_remote_description(SdpType::Answer, &answer).await {
            self.teardown().await;
            return Err(e);
        }

        info!("WHEP receiving from {}", self.session.url());
        Ok(())
    }

    /// DELETE the resource, close the peer and drop buffered candidates
    async fn teardown(&self) {
        self.pending_candidates.lock().clear();
        let peer = self.peer.lock().take();
        let deleted = self.session.delete_resource().await;

        if let Some(peer) = peer {
            peer.close().await;
        }

        if let Some(result) = deleted {
            if let Err(e) = result {
                self.report_error(&e);
            }
            info!("WHEP disconnected from {}", self.session.url());
            if let Some(ref on_disconnected) = self.config.on_disconnected {
                on_disconnected();
            }
        }
    }

    /// Silently release a resource created after `disconnect()`
    async fn discard_resource(&self) {
        if let Some(Err(e)) = self.session.delete_resource().await {
            debug!("WHEP discarding late resource failed: {}", e);
        }
        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            peer.close().await;
        }
    }

    fn schedule_retry(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let Some(ref reconnect) = self.reconnect else {
            return false;
        };
        if reconnect.schedule_reconnect() {
            return true;
        }
        self.report_error(&BridgeError::Network(format!(
            "giving up after {} reconnect attempts",
            reconnect.config().max_retries
        )));
        false
    }

    async fn retry(self: Arc<Self>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        info!("WHEP reconnecting to {}", self.session.url());

        self.teardown().await;
        if let Err(e) = self.connect_once().await {
            if self.stopped.load(Ordering::Acquire) {
                debug!("WHEP retry abandoned after disconnect: {}", e);
                return;
            }
            self.report_error(&e);
            if e.is_transient() {
                self.schedule_retry();
            }
        }
    }

    /// Route one local candidate: PATCH it when the session is up and
    /// nothing is queued ahead of it, otherwise buffer it
    async fn handle_local_candidate(&self, candidate: IceCandidate) {
        {
            let mut pending = self.pending_candidates.lock();
            if !self.session.is_connected() || !pending.is_empty() {
                debug!("WHEP buffering candidate ({} queued)", pending.len() + 1);
                pending.push(candidate);
                return;
            }
        }
        self.trickle(&candidate).await;
    }

    async fn trickle(&self, candidate: &IceCandidate) {
        if let Err(e) = self.session.patch_candidate(candidate).await {
            self.report_error(&e);
        }
    }

    async fn flush_candidates(&self) {
        let drained = {
            let mut pending = self.pending_candidates.lock();
            if !self.session.is_connected() {
                return;
            }
            std::mem::take(&mut *pending)
        };

        if !drained.is_empty() {
            debug!("WHEP flushing {} buffered candidates", drained.len());
        }
        for candidate in &drained {
            self.trickle(candidate).await;
        }
    }

    async fn handle_peer_state(&self, state: PeerState) {
        if let Some(ref on_state) = self.config.on_state {
            on_state(state);
        }

        if state.is_connected() {
            self.flush_candidates().await;
            if let Some(ref reconnect) = self.reconnect {
                reconnect.on_connection_success();
            }
        } else if state == PeerState::Failed {
            self.report_error(&BridgeError::Network(
                "peer connection failed".to_string(),
            ));
            self.schedule_retry();
        }
    }
}

impl Drop for WhepInner {
    fn drop(&mut self) {
        if let Some(resource_url) = self.session.take_resource() {
            self.session.delete_in_background(resource_url);
        }
    }
}

async fn run_event_pump(
    inner: Weak<WhepInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.generation.load(Ordering::Acquire) != generation {
            continue;
        }
        match event {
            PeerEvent::Candidate(candidate) => inner.handle_local_candidate(candidate).await,
            PeerEvent::State(state) => inner.handle_peer_state(state).await,
        }
    }
    debug!("WHEP event pump for generation {} stopped", generation);
}

/// WHEP client
pub struct WhepClient {
    inner: Arc<WhepInner>,
}

impl WhepClient {
    /// Create a client; the peer connection is created here when a frame
    /// callback is configured
    pub async fn new(config: WhepConfig, http: Arc<dyn HttpClient>) -> Result<Self> {
        let session = HttpSession::new(
            "WHEP",
            StatusPolicy::Whep,
            config.url.clone(),
            config.bearer_token.clone(),
            http,
        )?;

        let reconnect_config = match config.reconnect {
            Some(ref reconnect) => {
                reconnect.validate()?;
                Some(reconnect.clone())
            }
            None => None,
        };

        let inner = Arc::new_cyclic(|weak: &Weak<WhepInner>| {
            let reconnect = reconnect_config.and_then(|reconnect| {
                let weak = weak.clone();
                let on_retry: RetryCallback = Arc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        tokio::spawn(inner.retry());
                    }
                });
                ReconnectionManager::new(reconnect, on_retry, config.on_reconnecting.clone()).ok()
            });

            WhepInner {
                config,
                session,
                peer: Mutex::new(None),
                generation: AtomicU64::new(0),
                pending_candidates: Mutex::new(Vec::new()),
                reconnect,
                stopped: AtomicBool::new(false),
            }
        });

        if inner.config.receives_media() {
            inner.install_peer().await?;
        }

        Ok(Self { inner })
    }

    /// Create a client backed by [`ReqwestHttpClient`]
    pub async fn with_http_config(
        config: WhepConfig,
        http_config: &HttpClientConfig,
    ) -> Result<Self> {
        Self::new(config, Arc::new(ReqwestHttpClient::new(http_config)?)).await
    }

    /// Offer from the owned peer, POST it and apply the answer
    ///
    /// Transient failures are handed to the reconnection engine when one is
    /// configured.
    pub async fn connect(&self) -> Result<()> {
        self.inner.stopped.store(false, Ordering::Release);

        match self.inner.connect_once().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !matches!(
                    e,
                    BridgeError::InvalidArgument(_) | BridgeError::ProtocolState(_)
                ) {
                    self.inner.report_error(&e);
                }
                if e.is_transient() {
                    self.inner.schedule_retry();
                }
                Err(e)
            }
        }
    }

    /// POST an externally produced offer and return the SDP answer
    pub async fn send_offer(&self, sdp: &str) -> Result<String> {
        match self.inner.session.post_offer(sdp).await {
            Ok(answer) => {
                self.inner.notify_connected();
                Ok(answer)
            }
            Err(e) => {
                if !matches!(e, BridgeError::InvalidArgument(_)) {
                    self.inner.report_error(&e);
                }
                Err(e)
            }
        }
    }

    /// Trickle one candidate to the resource
    pub async fn send_ice_candidate(&self, candidate: &str, mid: &str) -> Result<()> {
        self.inner
            .session
            .patch_candidate(&IceCandidate::new(candidate, mid))
            .await
    }

    /// DELETE the resource and close the peer; idempotent
    pub async fn disconnect(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        if let Some(ref reconnect) = self.inner.reconnect {
            reconnect.reset();
        }
        self.inner.teardown().await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    pub fn resource_url(&self) -> Option<String> {
        self.inner.session.resource_url()
    }

    /// State of the owned peer, `None` without one
    pub fn peer_state(&self) -> Option<PeerState> {
        self.inner.peer.lock().as_ref().map(|peer| peer.state())
    }

    pub fn retry_count(&self) -> u32 {
        self.inner
            .reconnect
            .as_ref()
            .map(|reconnect| reconnect.retry_count())
            .unwrap_or(0)
    }

    pub fn url(&self) -> &str {
        self.inner.session.url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sfu::testing::{response, MockSfu, ANSWER_SDP};
    use reqwest::Method;
    use std::time::Duration;

    const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\n";

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(
            format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"),
            "0",
        )
    }

    #[tokio::test]
    async fn test_connect_without_media_callbacks_fails() {
        let sfu = Arc::new(MockSfu::new());
        let client = WhepClient::new(WhepConfig::new("https://sfu.example.com/whep"), sfu.clone())
            .await
            .unwrap();

        assert!(client.peer_state().is_none());
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolState);
        assert!(sfu.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_buffered_candidates_flushed_in_order() {
        let sfu = Arc::new(MockSfu::new());
        let client = WhepClient::new(WhepConfig::new("https://sfu.example.com/whep"), sfu.clone())
            .await
            .unwrap();

        client.inner.handle_local_candidate(candidate(1)).await;
        client.inner.handle_local_candidate(candidate(2)).await;
        assert!(sfu.requests_with(Method::PATCH).is_empty());

        client.send_offer(OFFER).await.unwrap();
        assert!(client.is_connected());
        assert!(sfu.requests_with(Method::PATCH).is_empty());

        client.inner.handle_peer_state(PeerState::Checking).await;
        assert!(sfu.requests_with(Method::PATCH).is_empty());

        client.inner.handle_peer_state(PeerState::Connected).await;
        let patches = sfu.requests_with(Method::PATCH);
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].request.body, candidate(1).to_sdp_fragment());
        assert_eq!(patches[1].request.body, candidate(2).to_sdp_fragment());
        assert!(patches
            .iter()
            .all(|p| p.url == "https://sfu.example.com/resource/abc123"));

        // Buffer is drained exactly once
        client.inner.handle_peer_state(PeerState::Completed).await;
        assert_eq!(sfu.requests_with(Method::PATCH).len(), 2);

        // Later candidates go straight out
        client.inner.handle_local_candidate(candidate(3)).await;
        let patches = sfu.requests_with(Method::PATCH);
        assert_eq!(patches.len(), 3);
        assert_eq!(patches[2].request.body, candidate(3).to_sdp_fragment());
    }

    #[tokio::test]
    async fn test_status_classification() {
        for (status, kind) in [
            (401, ErrorKind::Unauthorized),
            (403, ErrorKind::Forbidden),
            (404, ErrorKind::NotFound),
            (400, ErrorKind::Protocol),
            (500, ErrorKind::Protocol),
        ] {
            let sfu = Arc::new(MockSfu::with_responder(move |_, _, _| {
                Ok(response(status, &[], ""))
            }));
            let client = WhepClient::new(WhepConfig::new("https://sfu.example.com/whep"), sfu)
                .await
                .unwrap();

            let err = client.send_offer(OFFER).await.unwrap_err();
            assert_eq!(err.kind(), kind, "status {}", status);
            assert_eq!(err.is_transient(), status >= 500);
            assert!(!client.is_connected());
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let sfu = Arc::new(MockSfu::new());
        let disconnects = Arc::new(AtomicU64::new(0));
        let disconnects_clone = disconnects.clone();
        let config = WhepConfig {
            bearer_token: Some("token".into()),
            on_disconnected: Some(Arc::new(move || {
                disconnects_clone.fetch_add(1, Ordering::SeqCst);
            })),
            ..WhepConfig::new("https://sfu.example.com/whep")
        };
        let client = WhepClient::new(config, sfu.clone()).await.unwrap();

        assert_eq!(client.send_offer(OFFER).await.unwrap(), ANSWER_SDP);
        client.disconnect().await;
        client.disconnect().await;

        let deletes = sfu.requests_with(Method::DELETE);
        assert_eq!(deletes.len(), 1);
        assert_eq!(
            deletes[0].request.headers.get("Authorization").map(String::as_str),
            Some("Bearer token")
        );
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_creates_offer_from_owned_peer() {
        let sfu = Arc::new(MockSfu::with_responder(|_, _, _| {
            Ok(response(403, &[], "forbidden"))
        }));
        let config = WhepConfig {
            mdns_mode: MdnsMode::Disabled,
            on_video_frame: Some(Arc::new(|_| {})),
            ..WhepConfig::new("https://sfu.example.com/whep")
        };
        let client = WhepClient::new(config, sfu.clone()).await.unwrap();
        assert_eq!(client.peer_state(), Some(PeerState::New));

        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let posts = sfu.requests_with(Method::POST);
        assert_eq!(posts.len(), 1);
        assert!(posts[0].request.body.contains("m=video"));
        assert!(posts[0].request.body.contains("a=recvonly"));

        // Non-transient failures are not retried
        assert_eq!(client.retry_count(), 0);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_budget_exhausted() {
        let sfu = Arc::new(MockSfu::with_responder(|_, _, _| {
            Ok(response(503, &[], "busy"))
        }));
        let progress = Arc::new(Mutex::new(Vec::new()));
        let progress_clone = progress.clone();
        let config = WhepConfig {
            mdns_mode: MdnsMode::Disabled,
            on_video_frame: Some(Arc::new(|_| {})),
            reconnect: Some(ReconnectConfig {
                max_retries: 2,
                initial_delay_ms: 10,
                max_delay_ms: 20,
            }),
            on_reconnecting: Some(Arc::new(move |active, attempt| {
                progress_clone.lock().push((active, attempt));
            })),
            ..WhepConfig::new("https://sfu.example.com/whep")
        };
        let client = WhepClient::new(config, sfu.clone()).await.unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(err.is_transient());

        tokio::time::timeout(Duration::from_secs(10), async {
            while sfu.requests_with(Method::POST).len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sfu.requests_with(Method::POST).len(), 3);
        assert_eq!(*progress.lock(), vec![(true, 1), (true, 2)]);
        assert_eq!(client.retry_count(), 2);

        client.disconnect().await;
        assert_eq!(client.retry_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_offer_discards_late_resource() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let sfu = Arc::new(MockSfu::new().with_post_gate(gate.clone()));
        let connects = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (connects_clone, errors_clone) = (connects.clone(), errors.clone());
        let config = WhepConfig {
            mdns_mode: MdnsMode::Disabled,
            on_video_frame: Some(Arc::new(|_| {})),
            on_connected: Some(Arc::new(move || {
                connects_clone.fetch_add(1, Ordering::SeqCst);
            })),
            on_error: Some(Arc::new(move |message: &str| {
                errors_clone.lock().push(message.to_string());
            })),
            reconnect: Some(ReconnectConfig {
                max_retries: 3,
                initial_delay_ms: 10,
                max_delay_ms: 20,
            }),
            ..WhepConfig::new("https://sfu.example.com/whep")
        };
        let client = WhepClient::new(config, sfu.clone()).await.unwrap();

        let (result, ()) = tokio::join!(client.connect(), async {
            tokio::time::timeout(Duration::from_secs(10), async {
                while sfu.posts_started.load(Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
            client.disconnect().await;
            gate.add_permits(1);
        });

        assert_eq!(result.unwrap_err().kind(), ErrorKind::ProtocolState);
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert!(errors.lock().is_empty());
        assert!(!client.is_connected());
        assert!(client.peer_state().is_none());

        // The resource created after disconnect is released, no retry follows
        let deletes = sfu.requests_with(Method::DELETE);
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].url, "https://sfu.example.com/resource/abc123");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sfu.requests_with(Method::POST).len(), 1);
        assert_eq!(client.retry_count(), 0);
    }
}
