//! webrtc-bridge - WebRTC media-control core
//!
//! Establishes, maintains and tears down WebRTC peer connections for a
//! streaming host under two signaling regimes: WHIP/WHEP against an SFU and
//! manual peer-to-peer exchange. Transient failures are retried with capped
//! exponential backoff.

pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod manager;
pub mod p2p;
pub mod reconnect;
pub mod sfu;
pub mod signaling;
pub mod webrtc;

pub use error::{BridgeError, ErrorKind, Result};
