use thiserror::Error;

/// Coarse classification of a [`BridgeError`]
///
/// Hosts branch on the kind rather than on individual variants, e.g. to decide
/// whether a failure should be handed to the reconnection engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    ProtocolState,
    ResourceExhausted,
    Network,
    Unauthorized,
    Forbidden,
    NotFound,
    /// Non-2xx responses, malformed remote SDP and expired P2P deadlines
    Protocol,
    Internal,
    Serialization,
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    ProtocolState(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol error (status {status}): {message}")]
    Http { status: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("WebRTC error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BridgeError::ProtocolState(_) => ErrorKind::ProtocolState,
            BridgeError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            BridgeError::Network(_) => ErrorKind::Network,
            BridgeError::Unauthorized(_) => ErrorKind::Unauthorized,
            BridgeError::Forbidden(_) => ErrorKind::Forbidden,
            BridgeError::NotFound(_) => ErrorKind::NotFound,
            BridgeError::Http { .. } | BridgeError::Protocol(_) | BridgeError::Timeout(_) => {
                ErrorKind::Protocol
            }
            BridgeError::Internal(_) | BridgeError::Io(_) => ErrorKind::Internal,
            BridgeError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// HTTP status carried by the error, if it came from a server response
    pub fn status(&self) -> Option<u16> {
        match self {
            BridgeError::Http { status, .. } => Some(*status),
            BridgeError::Unauthorized(_) => Some(401),
            BridgeError::Forbidden(_) => Some(403),
            _ => None,
        }
    }

    /// Whether a retry through the reconnection engine may succeed
    ///
    /// Network failures, timeouts and 5xx responses are transient. Auth
    /// failures and other 4xx responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Network(_) | BridgeError::Timeout(_) => true,
            BridgeError::Http { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, BridgeError>;
