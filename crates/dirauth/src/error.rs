//! Error types for director authentication

use bsock::ChannelError;
use thiserror::Error;

/// Authentication errors
///
/// Every variant is terminal for the handshake attempt; nothing is retried
/// inside the engine.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Credential mismatch")]
    CredentialMismatch,

    #[error("TLS policy violation: {0}")]
    TlsPolicyViolation(String),

    #[error("TLS handshake failed: {reason}")]
    TlsHandshakeFailure { reason: String, certificate: bool },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Authentication plugin unavailable: {0}")]
    PluginUnavailable(String),

    #[error("PluginAll operation nested inside PluginAll is not supported")]
    NestedOperationNotSupported,

    #[error("Authentication plugin failed: {0}")]
    Plugin(String),

    #[error("Rejected by peer: {0}")]
    Rejected(String),

    #[error("Peer busy: {0}")]
    PeerBusy(String),

    #[error("Channel error: {0}")]
    Channel(ChannelError),
}

impl AuthError {
    /// Short stable label for security log events
    pub fn category(&self) -> &'static str {
        match self {
            AuthError::MalformedMessage(_) => "malformed-message",
            AuthError::UnknownPeer(_) => "unknown-peer",
            AuthError::CredentialMismatch => "credential-mismatch",
            AuthError::TlsPolicyViolation(_) => "tls-policy",
            AuthError::TlsHandshakeFailure { .. } => "tls-handshake",
            AuthError::Timeout(_) => "timeout",
            AuthError::ProtocolViolation(_) => "protocol-violation",
            AuthError::PluginUnavailable(_) => "plugin-unavailable",
            AuthError::NestedOperationNotSupported => "nested-operation",
            AuthError::Plugin(_) => "plugin-failure",
            AuthError::Rejected(_) => "rejected",
            AuthError::PeerBusy(_) => "busy",
            AuthError::Channel(_) => "channel",
        }
    }

    /// Whether this is a certificate verification failure
    ///
    /// These get a detailed local diagnostic; the peer still only sees the
    /// generic rejection line.
    pub fn is_certificate_error(&self) -> bool {
        matches!(
            self,
            AuthError::TlsHandshakeFailure {
                certificate: true,
                ..
            }
        )
    }
}

impl From<ChannelError> for AuthError {
    fn from(err: ChannelError) -> Self {
        if err.is_timeout() {
            AuthError::Timeout(err.to_string())
        } else {
            AuthError::Channel(err)
        }
    }
}

impl From<PluginError> for AuthError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::NotRegistered(name) => AuthError::PluginUnavailable(name),
            PluginError::InvalidRegistration(msg) => AuthError::PluginUnavailable(msg),
            PluginError::Failed(msg) => AuthError::Plugin(msg),
        }
    }
}

/// Authentication plugin errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("No authentication plugin registered for {0}")]
    NotRegistered(String),

    #[error("Invalid authentication registration: {0}")]
    InvalidRegistration(String),

    #[error("Plugin failed: {0}")]
    Failed(String),
}

/// Result type for authentication operations
pub type Result<T> = std::result::Result<T, AuthError>;
