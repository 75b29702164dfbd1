use thiserror::Error;

/// Error types that can occur in the gateway client core.
///
/// Every outcome a caller of [`crate::GatewayClient::request`] can observe
/// is a variant here; transport and framing failures are handled internally
/// by state transitions and surface only as the typed variants below.
#[derive(Error, Debug)]
pub enum GatelinkError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A communication channel was closed unexpectedly
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// Configuration validation failed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The byte stream can no longer be trusted to be frame-aligned
    #[error("Corrupt stream: {0}")]
    CorruptStream(String),

    /// A frame declared a body larger than the configured maximum
    #[error("Oversized frame: body of {declared} bytes exceeds limit of {limit}")]
    OversizedFrame { declared: u32, limit: u32 },

    /// A request's deadline elapsed before its response arrived
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The request was cancelled before resolution
    #[error("Request cancelled")]
    Cancelled,

    /// The channel is not READY, or went down while the request was in flight
    #[error("Channel disconnected: {0}")]
    Disconnected(String),

    /// Automatic reconnection gave up after the configured attempt limit
    #[error("Reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Wire protocol violation other than the above
    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, GatelinkError>;
