use thiserror::Error;

/// All errors produced by the Facefy client.
#[derive(Error, Debug)]
pub enum FacefyError {
    /// An endpoint was constructed from an empty host or an out-of-range port.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The endpoint could not be turned into a connection request.
    #[error("Failed to create connection: {0}")]
    Setup(String),

    /// The transport failed while connecting or after the socket was open.
    #[error("Connection error: {0}")]
    Transport(String),

    /// An inbound message could not be decoded.
    #[error("Failed to process message: {0}")]
    Decode(String),

    /// A preference value could not be written to the backing store.
    #[error("Failed to persist {key}: {reason}")]
    Persistence { key: String, reason: String },

    /// A JSON document could not be parsed.
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Pass-through for any raw I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the facefy crates.
pub type Result<T> = std::result::Result<T, FacefyError>;
