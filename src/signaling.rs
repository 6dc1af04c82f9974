//! Message-oriented signaling over a pluggable transport
//!
//! Envelopes are JSON objects tagged by `type`:
//!
//! ```json
//! {"type":"offer","sdp":"v=0..."}
//! {"type":"answer","sdp":"v=0..."}
//! {"type":"candidate","candidate":"candidate:...","mid":"0"}
//! ```
//!
//! Inbound text frames from the transport are fed to
//! [`SignalingClient::handle_message`], which never fails: malformed input is
//! reported through `on_error`. When the transport drops its inbound sender
//! (the remote side went away) the client becomes disconnected and fires
//! `on_disconnected`.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::webrtc::{ConnectionCallback, ErrorCallback, IceCandidate, IceCandidateCallback};

/// Called with an SDP body
pub type SdpCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String, mid: String },
}

impl SignalingMessage {
    pub fn label(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let message: SignalingMessage = serde_json::from_str(raw)
            .map_err(|e| BridgeError::Protocol(format!("Invalid signaling message: {}", e)))?;

        let empty = match message {
            SignalingMessage::Offer { ref sdp } | SignalingMessage::Answer { ref sdp } => {
                sdp.trim().is_empty()
            }
            SignalingMessage::Candidate { ref candidate, .. } => candidate.trim().is_empty(),
        };
        if empty {
            return Err(BridgeError::Protocol(
                "Invalid signaling message: empty payload".to_string(),
            ));
        }
        Ok(message)
    }
}

/// Duplex text channel carrying signaling envelopes
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open the channel; inbound text frames are pushed into `inbound`
    async fn connect(&self, inbound: mpsc::UnboundedSender<String>) -> Result<()>;

    async fn send(&self, text: String) -> Result<()>;

    /// Close the channel; errors are swallowed
    async fn close(&self);
}

/// Signaling client callbacks
#[derive(Clone, Default)]
pub struct SignalingConfig {
    pub on_offer: Option<SdpCallback>,
    pub on_answer: Option<SdpCallback>,
    pub on_ice_candidate: Option<IceCandidateCallback>,
    pub on_connected: Option<ConnectionCallback>,
    pub on_disconnected: Option<ConnectionCallback>,
    pub on_error: Option<ErrorCallback>,
}

#[derive(Default)]
struct ClientState {
    connected: bool,
    offer_sent: bool,
    /// Bumped per `connect`; a pump only tears down its own connection
    generation: u64,
    inbound_task: Option<JoinHandle<()>>,
}

struct SignalingInner {
    config: SignalingConfig,
    transport: Arc<dyn SignalingTransport>,
    state: Mutex<ClientState>,
}

impl SignalingInner {
    fn report_error(&self, message: &str) {
        warn!("Signaling: {}", message);
        if let Some(ref on_error) = self.config.on_error {
            on_error(message);
        }
    }

    /// The inbound channel of connection `generation` closed
    fn on_remote_closed(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if !state.connected || state.generation != generation {
                return;
            }
            state.connected = false;
            state.offer_sent = false;
            // This is the running pump's own handle
            state.inbound_task.take();
        }

        info!("Signaling transport closed by remote");
        if let Some(ref on_disconnected) = self.config.on_disconnected {
            on_disconnected();
        }
    }

    fn handle_message(&self, raw: &str) {
        let message = match SignalingMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                self.report_error(&e.to_string());
                return;
            }
        };

        debug!("Signaling received {}", message.label());
        match message {
            SignalingMessage::Offer { sdp } => {
                if let Some(ref on_offer) = self.config.on_offer {
                    on_offer(&sdp);
                }
            }
            SignalingMessage::Answer { sdp } => {
                if let Some(ref on_answer) = self.config.on_answer {
                    on_answer(&sdp);
                }
            }
            SignalingMessage::Candidate { candidate, mid } => {
                if let Some(ref on_ice_candidate) = self.config.on_ice_candidate {
                    on_ice_candidate(IceCandidate::new(candidate, mid));
                }
            }
        }
    }
}

async fn run_inbound(
    inner: Weak<SignalingInner>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle_message(&text);
    }

    debug!("Signaling inbound channel closed");
    if let Some(inner) = inner.upgrade() {
        inner.on_remote_closed(generation);
    }
}

/// Signaling client
pub struct SignalingClient {
    inner: Arc<SignalingInner>,
}

impl SignalingClient {
    pub fn new(config: SignalingConfig, transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            inner: Arc::new(SignalingInner {
                config,
                transport,
                state: Mutex::new(ClientState::default()),
            }),
        }
    }

    /// Open the transport and start dispatching inbound messages
    pub async fn connect(&self) -> Result<()> {
        if self.inner.state.lock().connected {
            return Err(BridgeError::ProtocolState(
                "signaling client already connected".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.transport.connect(tx).await?;

        {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            let task = tokio::spawn(run_inbound(
                Arc::downgrade(&self.inner),
                state.generation,
                rx,
            ));
            state.connected = true;
            state.offer_sent = false;
            if let Some(previous) = state.inbound_task.replace(task) {
                previous.abort();
            }
        }

        info!("Signaling connected");
        if let Some(ref on_connected) = self.inner.config.on_connected {
            on_connected();
        }
        Ok(())
    }

    /// Close the transport; a no-op when not connected
    pub async fn disconnect(&self) {
        let task = {
            let mut state = self.inner.state.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.offer_sent = false;
            state.inbound_task.take()
        };

        self.inner.transport.close().await;
        if let Some(task) = task {
            task.abort();
        }

        info!("Signaling disconnected");
        if let Some(ref on_disconnected) = self.inner.config.on_disconnected {
            on_disconnected();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.inner.state.lock().connected {
            return Err(BridgeError::ProtocolState(
                "signaling client not connected".to_string(),
            ));
        }
        Ok(())
    }

    async fn send(&self, message: SignalingMessage) -> Result<()> {
        let text = message.to_json()?;
        self.inner.transport.send(text).await
    }

    /// Send the local offer; only one offer per connection
    pub async fn send_offer(&self, sdp: &str) -> Result<()> {
        if sdp.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("offer SDP is empty".to_string()));
        }
        {
            let mut state = self.inner.state.lock();
            if !state.connected {
                return Err(BridgeError::ProtocolState(
                    "signaling client not connected".to_string(),
                ));
            }
            if state.offer_sent {
                return Err(BridgeError::ProtocolState(
                    "offer already sent on this connection".to_string(),
                ));
            }
            state.offer_sent = true;
        }

        let result = self
            .send(SignalingMessage::Offer {
                sdp: sdp.to_string(),
            })
            .await;
        if result.is_err() {
            self.inner.state.lock().offer_sent = false;
        }
        result
    }

    pub async fn send_answer(&self, sdp: &str) -> Result<()> {
        if sdp.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("answer SDP is empty".to_string()));
        }
        self.ensure_connected()?;
        self.send(SignalingMessage::Answer {
            sdp: sdp.to_string(),
        })
        .await
    }

    pub async fn send_ice_candidate(&self, candidate: &str, mid: &str) -> Result<()> {
        if candidate.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "ICE candidate is empty".to_string(),
            ));
        }
        self.ensure_connected()?;
        self.send(SignalingMessage::Candidate {
            candidate: candidate.to_string(),
            mid: mid.to_string(),
        })
        .await
    }

    /// Parse and dispatch one inbound envelope
    ///
    /// Never fails; malformed input goes to `on_error`.
    pub fn handle_message(&self, raw: &str) {
        self.inner.handle_message(raw);
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(task) = self.inner.state.lock().inbound_task.take() {
            task.abort();
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`SignalingTransport`] over a plain WebSocket
///
/// Only `ws://` URLs are supported; the build carries no TLS backend for
/// tungstenite.
pub struct WebSocketTransport {
    url: String,
    sink: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sink: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    async fn read_loop(mut read: SplitStream<WsStream>, inbound: mpsc::UnboundedSender<String>) {
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if inbound.send(text.to_string()).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("Signaling WebSocket closed by peer");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("Signaling WebSocket read failed: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn connect(&self, inbound: mpsc::UnboundedSender<String>) -> Result<()> {
        if !self.url.to_ascii_lowercase().starts_with("ws://") {
            return Err(BridgeError::InvalidArgument(format!(
                "signaling URL must start with ws://, got {}",
                self.url
            )));
        }

        info!("Connecting to signaling server: {}", self.url);
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| BridgeError::Network(format!("Failed to connect to {}: {}", self.url, e)))?;

        let (write, read) = ws_stream.split();
        *self.sink.lock().await = Some(write);

        let reader = tokio::spawn(Self::read_loop(read, inbound));
        if let Some(previous) = self.reader.lock().replace(reader) {
            previous.abort();
        }
        Ok(())
    }

    async fn send(&self, text: String) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or_else(|| {
            BridgeError::ProtocolState("signaling WebSocket not connected".to_string())
        })?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| BridgeError::Network(format!("Failed to send signaling message: {}", e)))
    }

    async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}
