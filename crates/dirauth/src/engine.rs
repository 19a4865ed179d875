//! Handshake entry points
//!
//! An [`AuthenticationEngine`] owns one channel and runs exactly one
//! handshake on it, as initiator or acceptor. Nothing is retried: any error
//! ends the attempt and the caller decides what to do with the connection.

use crate::client::{ClientConfig, ClientHandshake};
use crate::config::{AuthOptions, CompressionPolicy};
use crate::error::Result;
use crate::input::SecureInputSource;
use crate::messages::REJECT_BUSY;
use crate::plugin::AuthPluginRegistry;
use crate::server::ServerHandshake;
use crate::types::{IdentityResolver, NegotiatedSession};
use bsock::MessageChannel;
use std::sync::Arc;
use tracing::{debug, warn};

/// Turn compression on or off according to `policy`
///
/// Always sets the flag explicitly so the channel never keeps a stale value.
pub fn negotiate_compression(
    channel: &mut dyn MessageChannel,
    policy: &CompressionPolicy,
    remote_version: u32,
) -> bool {
    let enabled = policy.allows(remote_version);
    if !enabled {
        debug!(
            "No line compression with {} (remote version {})",
            channel.peer(),
            remote_version
        );
    }
    channel.set_compression(enabled);
    enabled
}

pub struct AuthenticationEngine<C: MessageChannel> {
    channel: C,
    options: Arc<AuthOptions>,
    plugins: AuthPluginRegistry,
}

impl<C: MessageChannel> AuthenticationEngine<C> {
    pub fn new(channel: C, options: Arc<AuthOptions>) -> Self {
        Self {
            channel,
            options,
            plugins: AuthPluginRegistry::default(),
        }
    }

    /// Use `plugins` for consoles configured with an authentication plugin
    pub fn with_plugins(mut self, plugins: AuthPluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn options(&self) -> &AuthOptions {
        &self.options
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Give the authenticated channel back to the caller
    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Authenticate to the peer described by `config`
    ///
    /// `input` answers interactive prompts; without it, an interactive
    /// request from the peer fails the handshake.
    pub async fn run_client_side(
        &mut self,
        config: &ClientConfig,
        input: Option<&mut dyn SecureInputSource>,
    ) -> Result<NegotiatedSession> {
        ClientHandshake::new(&self.options, config)?
            .run(&mut self.channel, input)
            .await
    }

    /// Authenticate an incoming peer, looking it up through `resolver`
    ///
    /// On failure the peer has been sent the generic rejection line and the
    /// deterrent delay has already elapsed.
    pub async fn run_server_side(
        &mut self,
        resolver: &dyn IdentityResolver,
    ) -> Result<NegotiatedSession> {
        ServerHandshake::new(&self.options, &self.plugins)
            .run(&mut self.channel, resolver)
            .await
    }

    /// Refuse the connection for capacity reasons
    pub async fn reject_busy(&mut self) -> Result<()> {
        warn!(
            target: "security",
            peer = self.channel.peer(),
            "Connection refused: connection limit reached"
        );
        self.channel.send(REJECT_BUSY.as_bytes()).await?;
        Ok(())
    }
}
