//! Manually signaled peer-to-peer sessions
//!
//! The signaling channel is the user: the host creates an offer, hands it to
//! the client out of band (see [`SignalBundle`]), and pastes back the answer.
//!
//! ```text
//! None --initialize_as_host--> Host --create_offer--> Host+Offer --set_remote_answer--> Established
//! None --initialize_as_client(id)--> Client --set_remote_offer--> Established (answer returned)
//! any  --disconnect--> Disconnected
//! ```

mod bundle;

pub use bundle::SignalBundle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::webrtc::{
    ConnectionCallback, ErrorCallback, IceCandidateCallback, IceConfig, MdnsMode,
    PeerConnection, PeerConnectionConfig, PeerState, SdpType, SessionDescription, StateCallback,
    TurnServer,
};

/// Session id length
pub const SESSION_ID_LEN: usize = 8;

/// Default deadline for the local offer/answer to be produced
pub const DEFAULT_ANSWER_TIMEOUT_MS: u64 = 5_000;

/// Called with a session id or an SDP body
pub type TextCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Generate an 8-character session id over `[0-9A-Za-z]`
pub fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

/// P2P session configuration
#[derive(Clone)]
pub struct P2PConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    pub mdns_mode: MdnsMode,
    /// Deadline for the engine to produce the local description (ms)
    pub answer_timeout_ms: u64,
    pub on_session_id: Option<TextCallback>,
    /// Local offer SDP, once created
    pub on_offer: Option<TextCallback>,
    /// Local answer SDP, once created
    pub on_answer: Option<TextCallback>,
    pub on_ice_candidate: Option<IceCandidateCallback>,
    pub on_state: Option<StateCallback>,
    pub on_connected: Option<ConnectionCallback>,
    pub on_disconnected: Option<ConnectionCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![],
            turn_servers: vec![],
            mdns_mode: MdnsMode::default(),
            answer_timeout_ms: DEFAULT_ANSWER_TIMEOUT_MS,
            on_session_id: None,
            on_offer: None,
            on_answer: None,
            on_ice_candidate: None,
            on_state: None,
            on_connected: None,
            on_disconnected: None,
            on_error: None,
        }
    }
}

impl P2PConfig {
    /// Take STUN/TURN/mDNS settings from a shared [`IceConfig`]
    pub fn from_ice(ice: &IceConfig) -> Self {
        Self {
            stun_servers: ice.stun_servers.clone(),
            turn_servers: ice.turn_servers.clone(),
            mdns_mode: ice.mdns_mode,
            ..Default::default()
        }
    }

    fn ice_config(&self) -> IceConfig {
        IceConfig {
            stun_servers: self.stun_servers.clone(),
            turn_servers: self.turn_servers.clone(),
            mdns_mode: self.mdns_mode,
        }
    }
}

/// Session role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum P2PRole {
    #[default]
    None,
    Host,
    Client,
}

#[derive(Default)]
struct SessionState {
    role: P2PRole,
    session_id: String,
    offer: Option<String>,
    answer: Option<String>,
    peer: Option<Arc<PeerConnection>>,
    disconnected: bool,
}

impl SessionState {
    fn ensure_open(&self) -> Result<()> {
        if self.disconnected {
            return Err(BridgeError::ProtocolState(
                "P2P session is disconnected".to_string(),
            ));
        }
        Ok(())
    }

    fn require_role(&self, role: P2PRole, operation: &str) -> Result<Arc<PeerConnection>> {
        self.ensure_open()?;
        if self.role != role {
            return Err(BridgeError::ProtocolState(format!(
                "{} requires role {:?}, session is {:?}",
                operation, role, self.role
            )));
        }
        self.peer.clone().ok_or_else(|| {
            BridgeError::ProtocolState("P2P session has no peer connection".to_string())
        })
    }
}

/// State reachable from peer callbacks
struct P2PShared {
    config: P2PConfig,
    /// Filled by the next local description
    latch: Mutex<Option<oneshot::Sender<SessionDescription>>>,
    connected: AtomicBool,
}

impl P2PShared {
    fn report_error(&self, err: &BridgeError) {
        warn!("P2P session: {}", err);
        if let Some(ref on_error) = self.config.on_error {
            on_error(&err.to_string());
        }
    }

    fn on_peer_state(&self, state: PeerState) {
        if let Some(ref on_state) = self.config.on_state {
            on_state(state);
        }

        if state.is_connected() {
            if !self.connected.swap(true, Ordering::AcqRel) {
                info!("P2P session connected");
                if let Some(ref on_connected) = self.config.on_connected {
                    on_connected();
                }
            }
        } else {
            self.connected.store(false, Ordering::Release);
        }
    }

    fn on_local_description(&self, description: SessionDescription) {
        match self.latch.lock().take() {
            Some(tx) => {
                let _ = tx.send(description);
            }
            None => debug!("P2P local {} with no waiter", description.sdp_type),
        }
    }
}

/// Two-party session with out-of-band SDP exchange
pub struct P2PSession {
    shared: Arc<P2PShared>,
    state: Mutex<SessionState>,
}

impl P2PSession {
    pub fn new(config: P2PConfig) -> Self {
        Self {
            shared: Arc::new(P2PShared {
                config,
                latch: Mutex::new(None),
                connected: AtomicBool::new(false),
            }),
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Generate a fresh id and report it through `on_session_id`
    pub fn generate_session_id(&self) -> String {
        let id = generate_session_id();
        if let Some(ref on_session_id) = self.shared.config.on_session_id {
            on_session_id(&id);
        }
        id
    }

    /// Take the host role and generate the session id
    pub async fn initialize_as_host(&self) -> Result<String> {
        self.claim_role(P2PRole::Host)?;
        let id = self.generate_session_id();

        match self.create_peer(false).await {
            Ok(peer) => {
                let mut state = self.state.lock();
                state.session_id = id.clone();
                state.peer = Some(peer);
            }
            Err(e) => {
                self.state.lock().role = P2PRole::None;
                return Err(e);
            }
        }

        info!("P2P session {} initialized as host", id);
        Ok(id)
    }

    /// Take the client role for a session id received from the host
    pub async fn initialize_as_client(&self, session_id: &str) -> Result<()> {
        if session_id.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "session id is empty".to_string(),
            ));
        }
        self.claim_role(P2PRole::Client)?;

        match self.create_peer(true).await {
            Ok(peer) => {
                let mut state = self.state.lock();
                state.session_id = session_id.to_string();
                state.peer = Some(peer);
            }
            Err(e) => {
                self.state.lock().role = P2PRole::None;
                return Err(e);
            }
        }

        info!("P2P session {} initialized as client", session_id);
        Ok(())
    }

    fn claim_role(&self, role: P2PRole) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.role != P2PRole::None {
            return Err(BridgeError::ProtocolState(format!(
                "P2P session already initialized as {:?}",
                state.role
            )));
        }
        state.role = role;
        Ok(())
    }

    async fn create_peer(&self, answering: bool) -> Result<Arc<PeerConnection>> {
        let config = &self.shared.config;

        let state_shared = self.shared.clone();
        let description_shared = self.shared.clone();
        let peer_config = PeerConnectionConfig {
            ice_servers: config.ice_config().ice_servers(),
            mdns_mode: config.mdns_mode,
            on_state: Some(Arc::new(move |state| state_shared.on_peer_state(state))),
            on_local_description: Some(Arc::new(move |description| {
                description_shared.on_local_description(description)
            })),
            on_local_ice_candidate: config.on_ice_candidate.clone(),
            ..Default::default()
        };

        let peer = PeerConnection::new(peer_config).await?;
        if answering {
            peer.create_answer().await?;
        }
        Ok(Arc::new(peer))
    }

    fn arm_latch(&self) -> oneshot::Receiver<SessionDescription> {
        let (tx, rx) = oneshot::channel();
        *self.shared.latch.lock() = Some(tx);
        rx
    }

    async fn wait_latch(
        &self,
        rx: oneshot::Receiver<SessionDescription>,
        what: &str,
    ) -> Result<String> {
        let deadline = Duration::from_millis(self.shared.config.answer_timeout_ms);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(description)) => Ok(description.sdp),
            Ok(Err(_)) => Err(BridgeError::ProtocolState(format!(
                "P2P session closed while waiting for the local {}",
                what
            ))),
            Err(_) => Err(BridgeError::Timeout(format!(
                "local {} not produced within {:?}",
                what, deadline
            ))),
        }
    }

    /// Host: create the offer to hand to the client
    pub async fn create_offer(&self) -> Result<String> {
        let peer = self.state.lock().require_role(P2PRole::Host, "create_offer")?;

        let rx = self.arm_latch();
        let result = match peer.create_offer().await {
            Ok(_) => self.wait_latch(rx, "offer").await,
            Err(e) => Err(e),
        };
        let offer = result.inspect_err(|e| self.shared.report_error(e))?;

        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            state.offer = Some(offer.clone());
            state.answer = None;
        }

        if let Some(ref on_offer) = self.shared.config.on_offer {
            on_offer(&offer);
        }
        Ok(offer)
    }

    /// Host: apply the answer pasted back by the client
    pub async fn set_remote_answer(&self, answer: &str) -> Result<()> {
        if answer.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("answer SDP is empty".to_string()));
        }

        let peer = {
            let state = self.state.lock();
            let peer = state.require_role(P2PRole::Host, "set_remote_answer")?;
            if state.offer.is_none() {
                return Err(BridgeError::ProtocolState(
                    "set_remote_answer before create_offer".to_string(),
                ));
            }
            peer
        };

        peer.set_remote_description(SdpType::Answer, answer)
            .await
            .inspect_err(|e| self.shared.report_error(e))?;

        self.state.lock().answer = Some(answer.to_string());
        info!("P2P remote answer applied");
        Ok(())
    }

    /// Client: apply the host's offer and return the answer to send back
    pub async fn set_remote_offer(&self, offer: &str) -> Result<String> {
        if offer.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("offer SDP is empty".to_string()));
        }
        let peer = self.state.lock().require_role(P2PRole::Client, "set_remote_offer")?;

        let rx = self.arm_latch();
        let result = match peer.set_remote_description(SdpType::Offer, offer).await {
            Ok(()) => self.wait_latch(rx, "answer").await,
            Err(e) => Err(e),
        };
        let answer = result.inspect_err(|e| self.shared.report_error(e))?;

        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            state.offer = Some(offer.to_string());
            state.answer = Some(answer.clone());
        }

        if let Some(ref on_answer) = self.shared.config.on_answer {
            on_answer(&answer);
        }
        Ok(answer)
    }

    /// Apply a candidate received out of band
    pub async fn add_remote_ice_candidate(&self, candidate: &str, mid: &str) -> Result<()> {
        let peer = {
            let state = self.state.lock();
            state.ensure_open()?;
            if state.role == P2PRole::None {
                return Err(BridgeError::ProtocolState(
                    "P2P session not initialized".to_string(),
                ));
            }
            state.peer.clone().ok_or_else(|| {
                BridgeError::ProtocolState("P2P session has no peer connection".to_string())
            })?
        };
        peer.add_ice_candidate(candidate, mid).await
    }

    /// Close the peer; idempotent and terminal
    pub async fn disconnect(&self) {
        let peer = {
            let mut state = self.state.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            state.peer.take()
        };
        self.shared.latch.lock().take();

        if let Some(peer) = peer {
            peer.close().await;
        }
        self.shared.connected.store(false, Ordering::Release);

        info!("P2P session disconnected");
        if let Some(ref on_disconnected) = self.shared.config.on_disconnected {
            on_disconnected();
        }
    }

    pub fn role(&self) -> P2PRole {
        self.state.lock().role
    }

    pub fn session_id(&self) -> Option<String> {
        let state = self.state.lock();
        (!state.session_id.is_empty()).then(|| state.session_id.clone())
    }

    pub fn local_offer(&self) -> Option<String> {
        self.state.lock().offer.clone()
    }

    pub fn answer(&self) -> Option<String> {
        self.state.lock().answer.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }

    /// Peer state, `None` before initialization or after disconnect
    pub fn peer_state(&self) -> Option<PeerState> {
        self.state.lock().peer.as_ref().map(|peer| peer.state())
    }
}
