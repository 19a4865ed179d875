//! In-process channel pair

use crate::channel::MessageChannel;
use crate::error::{ChannelError, Result};
use crate::tls::TlsMode;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

/// One end of an in-memory duplex channel
///
/// Created in pairs by [`MemoryChannel::pair`]. Dropping one end closes the
/// other end's receive side.
#[derive(Debug)]
pub struct MemoryChannel {
    peer: String,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    compression: bool,
    tls: Option<TlsMode>,
}

impl MemoryChannel {
    /// Create two connected ends
    ///
    /// `left_peer` is what the left end reports as its peer address, and
    /// likewise for the right end.
    pub fn pair(left_peer: &str, right_peer: &str) -> (MemoryChannel, MemoryChannel) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        let left = MemoryChannel {
            peer: left_peer.to_string(),
            tx: left_tx,
            rx: left_rx,
            compression: false,
            tls: None,
        };
        let right = MemoryChannel {
            peer: right_peer.to_string(),
            tx: right_tx,
            rx: right_rx,
            compression: false,
            tls: None,
        };
        (left, right)
    }

    /// Take an already delivered message without waiting
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn send(&mut self, msg: &[u8]) -> Result<()> {
        trace!("{} <- {} bytes", self.peer, msg.len());
        self.tx
            .send(Bytes::copy_from_slice(msg))
            .map_err(|_| ChannelError::Closed)
    }

    async fn recv(&mut self) -> Result<Bytes> {
        let msg = self.rx.recv().await.ok_or(ChannelError::Closed)?;
        trace!("{} -> {} bytes", self.peer, msg.len());
        Ok(msg)
    }

    fn set_compression(&mut self, enabled: bool) {
        self.compression = enabled;
    }

    fn compression(&self) -> bool {
        self.compression
    }

    fn set_tls(&mut self, mode: Option<TlsMode>) {
        self.tls = mode;
    }

    fn tls(&self) -> Option<TlsMode> {
        self.tls
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pair_delivers_frames_in_order() {
        let (mut left, mut right) = MemoryChannel::pair("dir:9101", "console");
        left.send(b"first\n").await.unwrap();
        left.send(b"second").await.unwrap();

        assert_eq!(right.recv().await.unwrap(), Bytes::from_static(b"first\n"));
        assert_eq!(right.recv().await.unwrap(), Bytes::from_static(b"second"));
        assert_eq!(left.peer(), "dir:9101");
        assert_eq!(right.peer(), "console");
    }

    #[tokio::test]
    async fn test_dropped_peer_reports_closed() {
        let (left, mut right) = MemoryChannel::pair("a", "b");
        drop(left);
        assert!(matches!(right.recv().await, Err(ChannelError::Closed)));
        assert!(matches!(
            right.send(b"late").await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout_expires() {
        let (_left, mut right) = MemoryChannel::pair("a", "b");
        let err = right
            .recv_timeout(Duration::from_secs(15))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_compression_and_tls_flags() {
        let (mut left, _right) = MemoryChannel::pair("a", "b");
        assert!(!left.compression());
        left.set_compression(true);
        left.set_compression(true);
        assert!(left.compression());
        left.set_compression(false);
        assert!(!left.compression());

        left.set_tls(Some(TlsMode::Psk));
        assert_eq!(left.tls(), Some(TlsMode::Psk));
        left.set_tls(None);
        assert_eq!(left.tls(), None);
    }

    #[tokio::test]
    async fn test_try_recv() {
        let (mut left, mut right) = MemoryChannel::pair("a", "b");
        assert!(right.try_recv().is_none());
        left.send(b"x").await.unwrap();
        assert_eq!(right.try_recv(), Some(Bytes::from_static(b"x")));
    }
}
