//! WebRTC peer connection layer
//!
//! Wraps webrtc-rs behind one uniform peer abstraction that every signaling
//! regime (WHIP, WHEP, manual P2P, message signaling) drives:
//!
//! ```text
//! Protocol client (WHIP / WHEP / P2P)
//!        |  create_offer / set_remote_description / add_ice_candidate
//!        v
//! PeerConnection ----> on_local_description / on_local_ice_candidate / on_state
//!        |
//!        v
//! webrtc-rs RTCPeerConnection (ICE, DTLS, SRTP)
//! ```

pub mod config;
pub mod mdns;
pub mod peer;
pub mod signaling;

pub use config::{IceConfig, IceServer, TurnServer};
pub use mdns::MdnsMode;
pub use peer::{
    ConnectionCallback, ErrorCallback, FrameCallback, IceCandidateCallback,
    LocalDescriptionCallback, LogCallback, PeerConnection, PeerConnectionConfig, StateCallback,
};
pub use signaling::{
    IceCandidate, LogLevel, MediaFrame, MediaKind, PeerState, SdpType, SessionDescription,
};
