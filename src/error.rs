use thiserror::Error;

/// Relay-wide error type
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid port: {0}")]
    InvalidPort(usize),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Disconnect-class transfer status (cable pulled, endpoint shut down)
    #[error("Transport gone")]
    TransportGone,

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Modem channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
