//! The duplex message channel trait

use crate::error::{ChannelError, Result};
use crate::tls::TlsMode;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;

/// A message-framed duplex channel
///
/// One `send` on one end is seen as one `recv` on the other end; the
/// payload is opaque to the channel. Line-oriented protocols include their
/// trailing newline in the payload.
#[async_trait]
pub trait MessageChannel: Send {
    /// Send one framed message
    async fn send(&mut self, msg: &[u8]) -> Result<()>;

    /// Wait for the next framed message
    async fn recv(&mut self) -> Result<Bytes>;

    /// Wait for the next message, giving up after `wait`
    async fn recv_timeout(&mut self, wait: Duration) -> Result<Bytes> {
        match tokio::time::timeout(wait, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(wait)),
        }
    }

    /// Wait for the next message, giving up at `deadline`
    async fn recv_until(&mut self, deadline: Instant) -> Result<Bytes> {
        let wait = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout_at(deadline, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(wait)),
        }
    }

    /// Turn line compression on or off
    ///
    /// Must be idempotent.
    fn set_compression(&mut self, enabled: bool);

    fn compression(&self) -> bool;

    /// Record the TLS mode now protecting the channel (`None` after TLS is dropped)
    fn set_tls(&mut self, mode: Option<TlsMode>);

    fn tls(&self) -> Option<TlsMode>;

    /// Printable peer address for logs
    fn peer(&self) -> &str;
}
