//! WebRTC peer connection wrapper
//!
//! [`PeerConnection`] is the single façade every signaling regime talks to.
//! Mutating operations are serialized by one async mutex; host callbacks are
//! always dispatched after that mutex has been released, so callbacks may call
//! straight back into the peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use super::config::{to_rtc_ice_servers, IceServer};
use super::mdns::{mdns_host_name, MdnsMode};
use super::signaling::{
    IceCandidate, LogLevel, MediaFrame, MediaKind, PeerState, SdpType, SessionDescription,
};
use crate::error::{BridgeError, Result};

/// Label of the data channel created so the engine always has a section to
/// negotiate, even when no media tracks are attached
pub const SENTINEL_CHANNEL_LABEL: &str = "webrtc-bridge";

pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(PeerState) + Send + Sync>;
pub type IceCandidateCallback = Arc<dyn Fn(IceCandidate) + Send + Sync>;
pub type LocalDescriptionCallback = Arc<dyn Fn(SessionDescription) + Send + Sync>;
pub type FrameCallback = Arc<dyn Fn(MediaFrame) + Send + Sync>;
/// Called when a protocol session connects or disconnects
pub type ConnectionCallback = Arc<dyn Fn() + Send + Sync>;
/// Called with a human-readable error message
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Peer connection configuration
#[derive(Clone, Default)]
pub struct PeerConnectionConfig {
    /// STUN/TURN servers, in priority order
    pub ice_servers: Vec<IceServer>,
    /// mDNS candidate handling (env override applies)
    pub mdns_mode: MdnsMode,
    pub on_log: Option<LogCallback>,
    pub on_state: Option<StateCallback>,
    pub on_local_ice_candidate: Option<IceCandidateCallback>,
    pub on_local_description: Option<LocalDescriptionCallback>,
    /// Receives video RTP payloads; adds a recvonly video transceiver
    pub on_video_frame: Option<FrameCallback>,
    /// Receives audio RTP payloads; adds a recvonly audio transceiver
    pub on_audio_frame: Option<FrameCallback>,
}

impl PeerConnectionConfig {
    pub fn with_ice_servers(ice_servers: Vec<IceServer>) -> Self {
        Self {
            ice_servers,
            ..Default::default()
        }
    }

    fn receives_media(&self) -> bool {
        self.on_video_frame.is_some() || self.on_audio_frame.is_some()
    }
}

/// State reachable from engine callbacks
struct PeerShared {
    peer_id: String,
    config: PeerConnectionConfig,
    state_tx: watch::Sender<PeerState>,
    closed: AtomicBool,
    /// Remote-originated data channels, kept alive for the peer's lifetime
    remote_channels: SyncMutex<Vec<Arc<RTCDataChannel>>>,
    /// Track reader tasks
    readers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl PeerShared {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!("Peer {}: {}", self.peer_id, message),
            LogLevel::Info => info!("Peer {}: {}", self.peer_id, message),
            LogLevel::Warn => warn!("Peer {}: {}", self.peer_id, message),
            LogLevel::Error => error!("Peer {}: {}", self.peer_id, message),
        }
        if let Some(ref on_log) = self.config.on_log {
            on_log(level, message);
        }
    }

    /// Apply a state change; `Closed` is terminal and repeats are dropped
    fn transition(&self, new_state: PeerState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if current.is_terminal() || *current == new_state {
                false
            } else {
                *current = new_state;
                true
            }
        });

        if changed {
            self.log(LogLevel::Info, &format!("connection state: {}", new_state));
            if let Some(ref on_state) = self.config.on_state {
                on_state(new_state);
            }
        }
    }

    fn emit_local_description(&self, description: SessionDescription) {
        debug!(
            "Peer {} local {} ({} bytes)",
            self.peer_id,
            description.sdp_type,
            description.sdp.len()
        );
        if let Some(ref on_local_description) = self.config.on_local_description {
            on_local_description(description);
        }
    }

    fn emit_local_candidate(&self, candidate: IceCandidate) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        debug!("Peer {} local ICE candidate: {}", self.peer_id, candidate.candidate);
        if let Some(ref on_local_ice_candidate) = self.config.on_local_ice_candidate {
            on_local_ice_candidate(candidate);
        }
    }
}

/// Negotiation bookkeeping guarded by the operation mutex
#[derive(Default)]
struct Negotiation {
    sentinel: Option<Arc<RTCDataChannel>>,
    answering: bool,
    /// A remote offer was applied before `create_answer`
    remote_offer_pending: bool,
}

/// Map webrtc-rs peer connection state onto [`PeerState`]
fn map_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Checking),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

/// Media id of a gathered candidate; webrtc-rs reports an empty mid
fn candidate_mid(init: &RTCIceCandidateInit) -> String {
    match init.sdp_mid {
        Some(ref mid) if !mid.is_empty() => mid.clone(),
        _ => init.sdp_mline_index.unwrap_or(0).to_string(),
    }
}

/// Peer connection wrapper with event handling
pub struct PeerConnection {
    pc: Arc<RTCPeerConnection>,
    shared: Arc<PeerShared>,
    negotiation: Mutex<Negotiation>,
    state_rx: watch::Receiver<PeerState>,
}

impl PeerConnection {
    /// Create a new peer connection
    pub async fn new(config: PeerConnectionConfig) -> Result<Self> {
        let peer_id = uuid::Uuid::new_v4().to_string();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| BridgeError::Internal(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            BridgeError::Internal(format!("Failed to register interceptors: {}", e))
        })?;

        let mut setting_engine = SettingEngine::default();
        let mode = config.mdns_mode.resolve().to_rtc();
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(mdns_host_name(&peer_id));
        }

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(&config.ice_servers),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            BridgeError::Internal(format!("Failed to create peer connection: {}", e))
        })?;
        let pc = Arc::new(pc);

        let (state_tx, state_rx) = watch::channel(PeerState::New);
        let shared = Arc::new(PeerShared {
            peer_id,
            config,
            state_tx,
            closed: AtomicBool::new(false),
            remote_channels: SyncMutex::new(Vec::new()),
            readers: SyncMutex::new(Vec::new()),
        });

        let peer = Self {
            pc,
            shared,
            negotiation: Mutex::new(Negotiation::default()),
            state_rx,
        };

        peer.setup_event_handlers();
        if peer.shared.config.receives_media() {
            peer.setup_receivers().await?;
        }

        peer.shared.log(
            LogLevel::Info,
            &format!(
                "created ({} ICE servers, mDNS {:?})",
                peer.shared.config.ice_servers.len(),
                mode
            ),
        );
        Ok(peer)
    }

    fn setup_event_handlers(&self) {
        let shared = self.shared.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let shared = shared.clone();
                Box::pin(async move {
                    if let Some(state) = map_state(s) {
                        shared.transition(state);
                    }
                })
            }));

        let peer_id = self.shared.peer_id.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state| {
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    debug!("[ICE] Peer {} connection state: {:?}", peer_id, state);
                })
            }));

        let shared = self.shared.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let shared = shared.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        debug!("[ICE] Peer {} gathering complete", shared.peer_id);
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let mid = candidate_mid(&init);
                            shared.emit_local_candidate(IceCandidate::new(init.candidate, mid));
                        }
                        Err(e) => {
                            shared.log(
                                LogLevel::Warn,
                                &format!("failed to serialize ICE candidate: {}", e),
                            );
                        }
                    }
                })
            }));
    }

    /// Add recvonly transceivers and forward received RTP payloads to the
    /// frame callbacks
    async fn setup_receivers(&self) -> Result<()> {
        let kinds = [
            (RTPCodecType::Video, self.shared.config.on_video_frame.is_some()),
            (RTPCodecType::Audio, self.shared.config.on_audio_frame.is_some()),
        ];
        for (kind, enabled) in kinds {
            if !enabled {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| {
                    BridgeError::Internal(format!("Failed to add {:?} transceiver: {}", kind, e))
                })?;
        }

        let shared = self.shared.clone();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let shared = shared.clone();
            Box::pin(async move {
                let (kind, sink) = match track.kind() {
                    RTPCodecType::Video => (MediaKind::Video, shared.config.on_video_frame.clone()),
                    RTPCodecType::Audio => (MediaKind::Audio, shared.config.on_audio_frame.clone()),
                    _ => return,
                };
                let Some(sink) = sink else {
                    return;
                };

                shared.log(
                    LogLevel::Info,
                    &format!("receiving {:?} track (ssrc {})", kind, track.ssrc()),
                );

                let peer_id = shared.peer_id.clone();
                let handle = tokio::spawn(async move {
                    let mut frames: u64 = 0;
                    loop {
                        match track.read_rtp().await {
                            Ok((packet, _)) => {
                                frames += 1;
                                sink(MediaFrame {
                                    kind,
                                    payload: packet.payload,
                                    timestamp: packet.header.timestamp,
                                    sequence_number: packet.header.sequence_number,
                                    marker: packet.header.marker,
                                    ssrc: packet.header.ssrc,
                                });
                            }
                            Err(e) => {
                                debug!("Peer {} {:?} track ended: {}", peer_id, kind, e);
                                break;
                            }
                        }
                    }
                    info!(
                        "Peer {} {:?} receiver stopped ({} packets)",
                        peer_id, kind, frames
                    );
                });
                shared.readers.lock().push(handle);
            })
        }));

        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BridgeError::ProtocolState(format!(
                "peer connection {} is closed",
                self.shared.peer_id
            )));
        }
        Ok(())
    }

    /// Create an offer, apply it locally and emit it via `on_local_description`
    ///
    /// Returns the offer SDP.
    pub async fn create_offer(&self) -> Result<String> {
        let description = {
            let mut negotiation = self.negotiation.lock().await;
            self.ensure_open()?;

            if negotiation.sentinel.is_none() {
                let dc = self
                    .pc
                    .create_data_channel(SENTINEL_CHANNEL_LABEL, None)
                    .await
                    .map_err(|e| {
                        BridgeError::Internal(format!("Failed to create data channel: {}", e))
                    })?;
                negotiation.sentinel = Some(dc);
            }

            let offer = self
                .pc
                .create_offer(None)
                .await
                .map_err(|e| BridgeError::Internal(format!("Failed to create offer: {}", e)))?;
            let sdp = offer.sdp.clone();

            self.pc.set_local_description(offer).await.map_err(|e| {
                BridgeError::Internal(format!("Failed to set local description: {}", e))
            })?;

            SessionDescription::offer(sdp)
        };

        let sdp = description.sdp.clone();
        self.shared.emit_local_description(description);
        Ok(sdp)
    }

    /// Mark this side as the answerer
    ///
    /// The answer is produced automatically once a remote offer is applied
    /// (immediately, if one already was) and delivered through
    /// `on_local_description`.
    pub async fn create_answer(&self) -> Result<()> {
        let description = {
            let mut negotiation = self.negotiation.lock().await;
            self.ensure_open()?;

            if !negotiation.answering {
                negotiation.answering = true;
                self.register_data_channel_handler();
            }

            if negotiation.remote_offer_pending {
                negotiation.remote_offer_pending = false;
                Some(self.generate_answer().await?)
            } else {
                None
            }
        };

        if let Some(description) = description {
            self.shared.emit_local_description(description);
        }
        Ok(())
    }

    fn register_data_channel_handler(&self) {
        let shared = self.shared.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let shared = shared.clone();
                Box::pin(async move {
                    shared.log(LogLevel::Info, &format!("data channel opened: {}", dc.label()));
                    shared.remote_channels.lock().push(dc);
                })
            }));
    }

    /// Called with the negotiation mutex held
    async fn generate_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| BridgeError::Internal(format!("Failed to create answer: {}", e)))?;
        let sdp = answer.sdp.clone();

        self.pc.set_local_description(answer).await.map_err(|e| {
            BridgeError::Internal(format!("Failed to set local description: {}", e))
        })?;

        Ok(SessionDescription::answer(sdp))
    }

    /// Apply the remote description
    pub async fn set_remote_description(&self, sdp_type: SdpType, sdp: &str) -> Result<()> {
        if sdp.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(format!(
                "remote {} SDP is empty",
                sdp_type
            )));
        }

        let answer = {
            let mut negotiation = self.negotiation.lock().await;
            self.ensure_open()?;

            let description = match sdp_type {
                SdpType::Offer => RTCSessionDescription::offer(sdp.to_string()),
                SdpType::Answer => RTCSessionDescription::answer(sdp.to_string()),
            }
            .map_err(|e| BridgeError::Protocol(format!("Invalid SDP {}: {}", sdp_type, e)))?;

            self.pc.set_remote_description(description).await.map_err(|e| {
                BridgeError::Protocol(format!("Failed to set remote {}: {}", sdp_type, e))
            })?;
            debug!("Peer {} remote {} applied", self.shared.peer_id, sdp_type);

            match sdp_type {
                SdpType::Offer if negotiation.answering => Some(self.generate_answer().await?),
                SdpType::Offer => {
                    negotiation.remote_offer_pending = true;
                    None
                }
                SdpType::Answer => None,
            }
        };

        if let Some(answer) = answer {
            self.shared.emit_local_description(answer);
        }
        Ok(())
    }

    /// Trickle a remote ICE candidate
    pub async fn add_ice_candidate(&self, candidate: &str, mid: &str) -> Result<()> {
        if candidate.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "ICE candidate is empty".to_string(),
            ));
        }

        let _negotiation = self.negotiation.lock().await;
        self.ensure_open()?;

        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: if mid.is_empty() { None } else { Some(mid.to_string()) },
            sdp_mline_index: None,
            username_fragment: None,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| BridgeError::Protocol(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    /// Get current connection state
    pub fn state(&self) -> PeerState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<PeerState> {
        self.state_rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    /// Close the connection
    ///
    /// Idempotent; engine errors are logged, never returned.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut negotiation = self.negotiation.lock().await;
        negotiation.sentinel = None;

        for handle in self.shared.readers.lock().drain(..) {
            handle.abort();
        }
        self.shared.remote_channels.lock().clear();

        if let Err(e) = self.pc.close().await {
            self.shared
                .log(LogLevel::Warn, &format!("close reported an error: {}", e));
        }
        drop(negotiation);

        self.shared.transition(PeerState::Closed);
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for handle in self.shared.readers.lock().drain(..) {
            handle.abort();
        }

        let pc = self.pc.clone();
        let peer_id = self.shared.peer_id.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = pc.close().await {
                    debug!("Peer {} close on drop failed: {}", peer_id, e);
                }
            });
        }
    }
}
