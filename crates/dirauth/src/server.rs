//! Acceptor side of the handshake
//!
//! Every failure goes through [`ServerHandshake::reject`]: one security log
//! event, the generic rejection line, then the deterrent delay. The peer
//! cannot tell an unknown name from a wrong password or a malformed line.

use crate::config::AuthOptions;
use crate::cram::CredentialHasher;
use crate::error::{AuthError, Result};
use crate::interactive::InteractiveSession;
use crate::messages::{
    printable, Acknowledgement, HelloKind, HelloMessage, StartTls, FD_CALLS_DIR_OK, MAX_HELLO_LEN,
    MIN_HELLO_LEN, REJECT_UNAUTHORIZED,
};
use crate::plugin::AuthPluginRegistry;
use crate::timer::AuthTimer;
use crate::tls::TlsNegotiator;
use crate::types::{
    AuthMethod, IdentityResolver, NegotiatedSession, PeerLookup, PeerResource, Secret,
    DEFAULT_CONSOLE_NAME,
};
use bsock::{MessageChannel, TlsSide};
use tracing::{debug, info, warn};

/// One acceptor handshake
pub(crate) struct ServerHandshake<'a> {
    options: &'a AuthOptions,
    plugins: &'a AuthPluginRegistry,
    timer: AuthTimer,
    /// Claimed peer name, for the security log
    claimed: Option<String>,
}

impl<'a> ServerHandshake<'a> {
    pub(crate) fn new(options: &'a AuthOptions, plugins: &'a AuthPluginRegistry) -> Self {
        Self {
            options,
            plugins,
            timer: AuthTimer::new(options.handshake_timeout()),
            claimed: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        channel: &mut dyn MessageChannel,
        resolver: &dyn IdentityResolver,
    ) -> Result<NegotiatedSession> {
        match self.authenticate(channel, resolver).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.reject(channel, &e).await;
                Err(e)
            }
        }
    }

    /// Log, send the generic line, sleep
    async fn reject(&self, channel: &mut dyn MessageChannel, err: &AuthError) {
        warn!(
            target: "security",
            peer = channel.peer(),
            name = self.claimed.as_deref().unwrap_or("<none>"),
            category = err.category(),
            "Unable to authenticate console or client: {}",
            err
        );
        // The peer may already be gone
        let _ = channel.send(REJECT_UNAUTHORIZED.as_bytes()).await;
        tokio::time::sleep(self.options.reject_delay()).await;
    }

    async fn authenticate(
        &mut self,
        channel: &mut dyn MessageChannel,
        resolver: &dyn IdentityResolver,
    ) -> Result<NegotiatedSession> {
        self.timer.start();
        let msg = channel
            .recv_until(self.timer.bound(self.options.handshake_timeout()))
            .await?;
        if msg.len() < MIN_HELLO_LEN || msg.len() >= MAX_HELLO_LEN {
            return Err(AuthError::MalformedMessage(format!(
                "Hello of invalid length {}",
                msg.len()
            )));
        }
        let line = String::from_utf8_lossy(&msg);
        debug!("Server: received {}", printable(&line));
        let hello = HelloMessage::parse(&line)?;
        self.claimed = Some(hello.name.clone());

        let lookup = match hello.kind {
            HelloKind::Calling if hello.name == DEFAULT_CONSOLE_NAME => PeerLookup::DefaultConsole,
            HelloKind::Calling => PeerLookup::Console(hello.name.clone()),
            HelloKind::FdCallsDir => PeerLookup::FileDaemon(hello.name.clone()),
            HelloKind::DirectorCalling | HelloKind::StorageCalling => {
                return Err(AuthError::MalformedMessage(format!(
                    "director Hello sent to a director: {}",
                    printable(&line)
                )))
            }
        };

        let resource = match resolver.resolve(&lookup) {
            Some(resource)
                if !matches!(lookup, PeerLookup::FileDaemon(_)) || resource.allow_fd_connections =>
            {
                resource
            }
            Some(_) => {
                debug!("Server: client {} may not open connections", hello.name);
                return self.decoy(channel, resolver, &hello).await;
            }
            None => return self.decoy(channel, resolver, &hello).await,
        };

        resource
            .tls
            .validate()
            .map_err(|e| AuthError::TlsPolicyViolation(e.to_string()))?;
        let mut negotiator = TlsNegotiator::new(&resource.tls, &resource.identity.secret);
        negotiator.set_remote(hello.tls_mask);
        negotiator.check()?;

        let mut session = self.interactive_session(&lookup, &resource, hello.version)?;
        if negotiator.early_mode(session.is_some()).is_some() {
            let starttls = StartTls {
                tls_mask: negotiator.advertised_mask(),
            };
            channel.send(starttls.to_line().as_bytes()).await?;
            negotiator.upgrade(channel, TlsSide::Server).await?;
        }

        let method = match session.as_mut() {
            Some(session) => {
                self.timer.stop();
                session.run(channel).await?;
                self.timer.start();
                AuthMethod::Interactive {
                    plugin: Some(session.plugin_name().to_string()),
                }
            }
            None => {
                let hasher =
                    CredentialHasher::new(resource.identity.secret.clone(), &self.options.name);
                let deadline = self.timer.bound(self.options.response_timeout());
                hasher
                    .server_verify(channel, negotiator.advertised_mask(), deadline)
                    .await?;
                let deadline = self.timer.bound(self.options.response_timeout());
                hasher.client_respond(channel, deadline).await?;
                AuthMethod::CramMd5
            }
        };
        // Plugin context goes away here, before TLS and acknowledgement
        drop(session);

        negotiator.handle_tls(channel, TlsSide::Server).await?;

        channel
            .send(
                Acknowledgement::director_line(self.options.protocol_version, &self.options.name)
                    .as_bytes(),
            )
            .await?;
        if hello.kind == HelloKind::FdCallsDir {
            channel.send(FD_CALLS_DIR_OK.as_bytes()).await?;
        }
        self.timer.stop();

        let peer_role = lookup.role();
        let policy = self.options.compression_for(peer_role);
        let compression = crate::engine::negotiate_compression(channel, policy, hello.version);
        let tls = negotiator.finish(channel);

        info!(
            "Server: authenticated {} {} from {} (version {}, {:?})",
            peer_role,
            hello.name,
            channel.peer(),
            hello.version,
            method
        );
        Ok(NegotiatedSession {
            peer_name: hello.name,
            peer_role,
            remote_version: hello.version,
            compression,
            tls,
            method,
        })
    }

    /// Interactive session for consoles with an authentication plugin
    fn interactive_session(
        &self,
        lookup: &PeerLookup,
        resource: &PeerResource,
        version: u32,
    ) -> Result<Option<InteractiveSession<'a>>> {
        let (PeerLookup::Console(console), Some(param)) = (lookup, resource.auth_plugin.as_deref())
        else {
            return Ok(None);
        };
        if version < self.options.interactive_min_version {
            if self.options.allow_legacy_fallback {
                debug!(
                    "Server: console {} version {} predates interactive auth, using CRAM-MD5",
                    console, version
                );
                return Ok(None);
            }
            return Err(AuthError::ProtocolViolation(format!(
                "console version {} cannot run interactive authentication",
                version
            )));
        }
        InteractiveSession::new(self.plugins, param, console, self.options.response_timeout())
            .map(Some)
    }

    /// Run a challenge nobody can answer, then fail as an unknown peer
    ///
    /// TLS policy is applied with the director's own settings, so a peer
    /// advertising TLS needs sees the same replies for known and unknown
    /// names.
    async fn decoy(
        &mut self,
        channel: &mut dyn MessageChannel,
        resolver: &dyn IdentityResolver,
        hello: &HelloMessage,
    ) -> Result<NegotiatedSession> {
        let unknown = || AuthError::UnknownPeer(hello.name.clone());
        let secret = Secret::random();
        let tls = resolver
            .resolve(&PeerLookup::DefaultConsole)
            .map(|director| director.tls)
            .unwrap_or_default();

        let mut negotiator = TlsNegotiator::new(&tls, &secret);
        negotiator.set_remote(hello.tls_mask);
        if let Err(e) = negotiator.check() {
            debug!("Server: decoy for {} stopped: {}", hello.name, e.category());
            return Err(unknown());
        }
        if negotiator.early_mode(false).is_some() {
            let starttls = StartTls {
                tls_mask: negotiator.advertised_mask(),
            };
            channel.send(starttls.to_line().as_bytes()).await?;
            if let Err(e) = negotiator.upgrade(channel, TlsSide::Server).await {
                debug!("Server: decoy for {} stopped: {}", hello.name, e.category());
                return Err(unknown());
            }
        }

        let hasher = CredentialHasher::new(secret, &self.options.name);
        let deadline = self.timer.bound(self.options.response_timeout());
        let mask = negotiator.advertised_mask();
        if let Err(e) = hasher.server_verify(channel, mask, deadline).await {
            debug!("Server: decoy challenge for {} ended: {}", hello.name, e.category());
        }
        Err(unknown())
    }
}
