use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures while producing or persisting the node's key pair.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to load key pair: {0}")]
    Load(String),

    #[error("failed to generate RSA key pair: {0}")]
    KeyGeneration(#[from] rsa::Error),

    #[error("failed to encode key: {0}")]
    Encoding(String),

    #[error("failed to write key file {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to sign data: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JwtError {
    #[error("token is not a three-part compact JWT")]
    InvalidFormat,

    #[error("token signature does not verify")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("invalid duration {0:?}, expected <integer>[smhd]")]
    InvalidDuration(String),

    #[error("failed to issue token: {0}")]
    Issue(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("control channel is closed")]
    ChannelClosed,
}

impl TransportError {
    /// No response at all, a 5xx, or a 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Status { status, .. } => *status >= 500 || *status == 429,
            TransportError::Decode(_) | TransportError::ChannelClosed => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Network(e) if e.is_timeout())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("node is not registered")]
    NotRegistered,

    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to issue auth token: {0}")]
    Token(#[from] JwtError),

    #[error("invalid WebSocket URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("WebSocket connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("WebSocket connect failed: {0}")]
    Connect(#[source] Box<tokio_tungstenite::tungstenite::Error>),
}

#[derive(Debug, Error)]
pub enum ConfigSyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to issue auth token: {0}")]
    Token(#[from] JwtError),

    #[error("config sync rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("total memory reported as zero")]
    NoMemory,

    #[error("no CPUs reported")]
    NoCpus,
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error(transparent)]
    Sampling(#[from] SamplingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to issue auth token: {0}")]
    Token(#[from] JwtError),
}
