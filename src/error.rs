use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GearError {
    #[error("Malformed frame: {0}")]
    Framing(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out waiting for the job server")]
    Timeout,

    #[error("Correlation key already pending: {0}")]
    DuplicateKey(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("No servers in pool")]
    EmptyPool,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Job server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<std::io::Error> for GearError {
    fn from(err: std::io::Error) -> Self {
        GearError::Io(Arc::new(err))
    }
}

impl GearError {
    /// True for errors after which the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GearError::Framing(_)
                | GearError::Io(_)
                | GearError::ConnectionLost(_)
                | GearError::ConnectionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, GearError>;
