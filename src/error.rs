use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the muxtun proxy
#[derive(Error, Debug)]
pub enum MuxtunError {
    // Configuration errors (fatal at startup)
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid target address: {0}")]
    InvalidTarget(String),

    // Dial errors
    #[error("proxy in backoff")]
    Backoff,

    #[error("auth failed")]
    AuthFailed,

    #[error("CONNECT failed: upstream returned {0}")]
    ConnectRejected(StatusCode),

    #[error("CONNECT timed out")]
    ConnectTimeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no healthy proxy available")]
    NoHealthyProxy,

    // Tunnel errors
    #[error("tunnel close: {0}")]
    TunnelClose(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for muxtun operations
pub type Result<T> = std::result::Result<T, MuxtunError>;

// Convert from hyper errors
impl From<hyper::Error> for MuxtunError {
    fn from(err: hyper::Error) -> Self {
        MuxtunError::Transport(err.to_string())
    }
}
