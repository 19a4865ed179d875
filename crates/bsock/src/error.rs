//! Error types for message channels

use std::time::Duration;
use thiserror::Error;

/// Channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel closed by peer")]
    Closed,

    #[error("No message within {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS negotiation failed: {0}")]
    Tls(String),

    #[error("Certificate verification failed: {0}")]
    Certificate(String),
}

impl ChannelError {
    pub fn is_timeout(&self) -> bool {
        match self {
            ChannelError::Timeout(_) => true,
            ChannelError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Closed channels and broken pipes
    pub fn is_disconnect(&self) -> bool {
        match self {
            ChannelError::Closed => true,
            ChannelError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;
