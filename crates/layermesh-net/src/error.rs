#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("message too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("node {addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("call to {addr} timed out after {after_ms} ms")]
    Timeout { addr: String, after_ms: u64 },

    #[error("connection closed by peer")]
    Closed,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse { expected: &'static str, got: String },
}

impl NetError {
    /// Connection-level failures that may succeed on another attempt.
    /// Timeouts never qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Closed)
    }

    /// The request never reached the peer.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, NetError>;
