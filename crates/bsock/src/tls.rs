//! Opaque TLS capability
//!
//! Certificate and key management is not handled here; a [`TlsContext`] is
//! whatever the embedding daemon built from its configuration.

use crate::channel::MessageChannel;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt::{self, Debug};

/// Which flavour of TLS a context negotiates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsMode {
    /// X.509 certificates
    Certificate,
    /// Pre-shared key derived from the shared secret
    Psk,
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMode::Certificate => write!(f, "TLS"),
            TlsMode::Psk => write!(f, "TLS-PSK"),
        }
    }
}

/// Which end of the TLS handshake we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSide {
    Client,
    Server,
}

/// A configured TLS context able to upgrade a channel
///
/// `handshake` must either leave the channel protected or fail; callers never
/// retry and never fall back to plaintext. Certificate problems are reported
/// as [`crate::ChannelError::Certificate`] so that operators get a precise
/// local diagnostic.
#[async_trait]
pub trait TlsContext: Send + Sync + Debug {
    fn mode(&self) -> TlsMode;

    /// Run the TLS handshake over `channel`
    ///
    /// `verify_cns` is the list of acceptable peer common names when peer
    /// verification is enabled.
    async fn handshake(
        &self,
        channel: &mut dyn MessageChannel,
        side: TlsSide,
        verify_cns: Option<&[String]>,
    ) -> Result<()>;
}
