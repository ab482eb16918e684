use thiserror::Error;

/// Errors surfaced by the fan-out adapter, its readers and collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FanOutError {
    #[error("no capture session bound")]
    NotBound,

    #[error("capture session already bound")]
    AlreadyBound,

    #[error("disconnect from client {client_id} without a live connection")]
    ProtocolViolation { client_id: u64 },

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("reader closed")]
    ReaderClosed,

    #[error("invalid audio format: {0}")]
    InvalidFormat(String),

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("device not available")]
    DeviceNotAvailable,
}
