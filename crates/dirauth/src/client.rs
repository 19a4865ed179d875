//! Initiator side of the handshake

use crate::config::AuthOptions;
use crate::cram::{Challenge, CredentialHasher};
use crate::error::{AuthError, Result};
use crate::input::SecureInputSource;
use crate::interactive::{parse_trigger, InteractiveClient};
use crate::messages::{
    is_rejection, printable, rejection_error, Acknowledgement, HelloKind, HelloMessage, StartTls,
    FD_CALLS_DIR_OK,
};
use crate::timer::AuthTimer;
use crate::tls::{TlsConfig, TlsNegotiator};
use crate::types::{AuthMethod, Identity, NegotiatedSession, Role, Secret, DEFAULT_CONSOLE_NAME};
use bsock::{MessageChannel, TlsSide};
use tracing::{debug, info};

/// Who we are and whom we are calling
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub identity: Identity,
    /// Name of the resource describing the peer, for reporting
    pub peer_name: String,
    pub target: Role,
    pub tls: TlsConfig,
}

impl ClientConfig {
    pub fn new(identity: Identity, peer_name: impl Into<String>, target: Role) -> Self {
        Self {
            identity,
            peer_name: peer_name.into(),
            target,
            tls: TlsConfig::default(),
        }
    }

    /// The unnamed console, authenticating with the director's password
    pub fn default_console(director: impl Into<String>, secret: impl Into<Secret>) -> Self {
        Self::new(
            Identity::new(DEFAULT_CONSOLE_NAME, Role::UserAgent, secret),
            director,
            Role::Director,
        )
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }
}

/// One initiator handshake
pub(crate) struct ClientHandshake<'a> {
    options: &'a AuthOptions,
    config: &'a ClientConfig,
    kind: HelloKind,
    hasher: CredentialHasher,
    negotiator: TlsNegotiator,
    timer: AuthTimer,
}

impl<'a> ClientHandshake<'a> {
    pub(crate) fn new(options: &'a AuthOptions, config: &'a ClientConfig) -> Result<Self> {
        let kind = HelloKind::for_roles(config.identity.role, config.target).ok_or_else(|| {
            AuthError::ProtocolViolation(format!(
                "{} cannot call a {}",
                config.identity.role, config.target
            ))
        })?;
        config
            .tls
            .validate()
            .map_err(|e| AuthError::TlsPolicyViolation(e.to_string()))?;
        Ok(Self {
            options,
            config,
            kind,
            hasher: CredentialHasher::new(config.identity.secret.clone(), &config.identity.name),
            negotiator: TlsNegotiator::new(&config.tls, &config.identity.secret),
            timer: AuthTimer::new(options.handshake_timeout()),
        })
    }

    pub(crate) async fn run(
        mut self,
        channel: &mut dyn MessageChannel,
        input: Option<&mut dyn SecureInputSource>,
    ) -> Result<NegotiatedSession> {
        match self.authenticate(channel, input).await {
            Err(AuthError::Timeout(_)) => Err(AuthError::Timeout(format!(
                "{} {} is busy or its connection limit is reached",
                self.config.target, self.config.peer_name
            ))),
            result => result,
        }
    }

    async fn authenticate(
        &mut self,
        channel: &mut dyn MessageChannel,
        input: Option<&mut dyn SecureInputSource>,
    ) -> Result<NegotiatedSession> {
        let hello = HelloMessage::new(
            self.kind,
            &self.config.identity.name,
            self.options.protocol_version,
            self.negotiator.advertised_mask(),
        );
        self.timer.start();
        debug!("Client: sending {}", hello);
        channel.send(hello.to_line().as_bytes()).await?;

        let mut line = self.next_line(channel).await?;
        let mut checked = false;
        if let Some(starttls) = StartTls::parse(&line)? {
            self.negotiator.set_remote(starttls.tls_mask);
            self.negotiator.check()?;
            checked = true;
            self.negotiator.upgrade(channel, TlsSide::Client).await?;
            line = self.next_line(channel).await?;
        }

        let method = if let Some(welcome) = parse_trigger(&line) {
            let input = input.ok_or_else(|| {
                AuthError::ProtocolViolation(
                    "interactive authentication requested but no input source available"
                        .to_string(),
                )
            })?;
            if !checked {
                self.negotiator.set_remote(0);
                self.negotiator.check()?;
            }
            // A human is typing; only the per-answer bound applies
            self.timer.stop();
            InteractiveClient::new(input, self.options.response_timeout())
                .run(channel, welcome)
                .await?;
            self.timer.start();
            AuthMethod::Interactive { plugin: None }
        } else if let Some(challenge) = Challenge::parse(&line)? {
            if !checked {
                self.negotiator.set_remote(challenge.tls_mask.unwrap_or(0));
                self.negotiator.check()?;
            }
            let deadline = self.timer.bound(self.options.response_timeout());
            self.hasher.answer(channel, &challenge, deadline).await?;
            let deadline = self.timer.bound(self.options.response_timeout());
            self.hasher
                .server_verify(channel, self.negotiator.advertised_mask(), deadline)
                .await?;
            AuthMethod::CramMd5
        } else if is_rejection(&line) {
            return Err(rejection_error(&line));
        } else {
            return Err(AuthError::ProtocolViolation(format!(
                "expected challenge, got: {}",
                printable(&line)
            )));
        };

        self.negotiator.handle_tls(channel, TlsSide::Client).await?;

        let line = self.next_line(channel).await?;
        let ack = Acknowledgement::parse(&line).map_err(|e| {
            if is_rejection(&line) {
                rejection_error(&line)
            } else {
                e
            }
        })?;
        if self.kind == HelloKind::FdCallsDir {
            let line = self.next_line(channel).await?;
            if line != FD_CALLS_DIR_OK {
                return Err(rejection_error(&line));
            }
        }
        self.timer.stop();

        let policy = self.options.compression_for(self.config.target);
        let compression = crate::engine::negotiate_compression(channel, policy, ack.version);
        let tls = self.negotiator.finish(channel);

        info!(
            "Client: authenticated to {} {} (version {}, compression {}, tls {:?})",
            self.config.target, self.config.peer_name, ack.version, compression, tls
        );
        Ok(NegotiatedSession {
            peer_name: self.config.peer_name.clone(),
            peer_role: self.config.target,
            remote_version: ack.version,
            compression,
            tls,
            method,
        })
    }

    async fn next_line(&self, channel: &mut dyn MessageChannel) -> Result<String> {
        let deadline = self.timer.bound(self.options.response_timeout());
        let msg = channel.recv_until(deadline).await?;
        Ok(String::from_utf8_lossy(&msg).into_owned())
    }
}
