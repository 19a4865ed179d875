//! TLS policy negotiation
//!
//! Each side derives its own need from configuration, advertises it as a
//! small bitmask (Hello `tlspsk=` and challenge `ssl=`), and decodes the
//! peer's. The two are combined before any credential is exchanged:
//!
//! ```text
//! bit 0-1   TLS-PSK need           0 none, 1 capable, 2/3 required
//! bit 2-3   certificate TLS need   0 none, 1 capable, 2/3 required
//! ```

use crate::config::ConfigError;
use crate::error::{AuthError, Result};
use crate::types::Secret;
use bsock::{ChannelError, MessageChannel, TlsContext, TlsMode, TlsSide};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

const NEED_MASK: u32 = 0b11;
const CERT_SHIFT: u32 = 2;

/// Need for one TLS flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsRequirement {
    NotRequired,
    /// Capable and willing, but not insisting
    Requested,
    Required,
}

impl TlsRequirement {
    pub fn bits(self) -> u32 {
        match self {
            TlsRequirement::NotRequired => 0,
            TlsRequirement::Requested => 1,
            TlsRequirement::Required => 2,
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        match bits & NEED_MASK {
            0 => TlsRequirement::NotRequired,
            1 => TlsRequirement::Requested,
            _ => TlsRequirement::Required,
        }
    }

    fn capable(self) -> bool {
        self != TlsRequirement::NotRequired
    }
}

/// TLS-related fields of a daemon or console resource
#[derive(Clone, Default)]
pub struct TlsConfig {
    pub tls_enable: bool,
    pub tls_require: bool,
    /// Use TLS only to authenticate, then continue in clear
    pub tls_authenticate: bool,
    pub tls_verify_peer: bool,
    pub tls_allowed_cns: Vec<String>,
    pub tls_psk_enable: bool,
    pub cert_ctx: Option<Arc<dyn TlsContext>>,
    pub psk_ctx: Option<Arc<dyn TlsContext>>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("tls_enable", &self.tls_enable)
            .field("tls_require", &self.tls_require)
            .field("tls_authenticate", &self.tls_authenticate)
            .field("tls_verify_peer", &self.tls_verify_peer)
            .field("tls_allowed_cns", &self.tls_allowed_cns)
            .field("tls_psk_enable", &self.tls_psk_enable)
            .field("cert_ctx", &self.cert_ctx.is_some())
            .field("psk_ctx", &self.psk_ctx.is_some())
            .finish()
    }
}

impl TlsConfig {
    /// Certificate TLS with the given context
    pub fn certificate(ctx: Arc<dyn TlsContext>, require: bool) -> Self {
        Self {
            tls_enable: true,
            tls_require: require,
            cert_ctx: Some(ctx),
            ..Default::default()
        }
    }

    /// TLS-PSK with the given context
    pub fn psk(ctx: Arc<dyn TlsContext>, require: bool) -> Self {
        Self {
            tls_require: require,
            tls_psk_enable: true,
            psk_ctx: Some(ctx),
            ..Default::default()
        }
    }

    /// Refuse settings that require TLS without any way to provide it
    ///
    /// Such a side would reject every peer after advertising no need at all.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let cert_usable = self.tls_enable && self.cert_ctx.is_some();
        let psk_usable = self.tls_psk_enable && self.psk_ctx.is_some();
        if (self.tls_require || self.tls_authenticate) && !cert_usable && !psk_usable {
            return Err(ConfigError::Invalid {
                option: "tls_require",
                reason: "TLS required but no certificate or PSK context configured".to_string(),
            });
        }
        Ok(())
    }

    fn context(&self, mode: TlsMode) -> Option<&Arc<dyn TlsContext>> {
        match mode {
            TlsMode::Certificate => self.cert_ctx.as_ref(),
            TlsMode::Psk => self.psk_ctx.as_ref(),
        }
    }
}

/// What this side can do and insists on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsLocalNeed {
    pub cert: TlsRequirement,
    pub psk: TlsRequirement,
    /// Local policy refuses a clear-text session
    pub required: bool,
}

impl TlsLocalNeed {
    /// Bitmask advertised to the peer
    pub fn advertised_mask(&self) -> u32 {
        self.psk.bits() | (self.cert.bits() << CERT_SHIFT)
    }

    /// The local need as the peer will decode it
    pub fn advertised(&self) -> TlsRemoteNeed {
        decode_remote_need(self.advertised_mask())
    }
}

/// What the peer advertised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsRemoteNeed {
    pub cert: TlsRequirement,
    pub psk: TlsRequirement,
}

impl TlsRemoteNeed {
    pub fn required(&self) -> bool {
        self.cert == TlsRequirement::Required || self.psk == TlsRequirement::Required
    }
}

/// Outcome of combining local and remote needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsDecision {
    Proceed,
    /// We require TLS and the peer cannot provide it
    RejectLocal,
    /// The peer requires TLS and we cannot provide it
    RejectRemote,
}

/// Combine resource configuration into the local need
///
/// PSK is only usable with a PSK context and a non-empty secret to derive
/// the key from.
pub fn calc_local_need(config: &TlsConfig, secret: &Secret) -> TlsLocalNeed {
    let cert_capable = config.tls_enable && config.cert_ctx.is_some();
    let psk_capable = config.tls_psk_enable && config.psk_ctx.is_some() && !secret.is_empty();

    let required = config.tls_require || config.tls_authenticate;
    // A side refusing clear text advertises that on every flavour it offers
    let need = |capable: bool| match (capable, required) {
        (false, _) => TlsRequirement::NotRequired,
        (true, true) => TlsRequirement::Required,
        (true, false) => TlsRequirement::Requested,
    };

    TlsLocalNeed {
        cert: need(cert_capable),
        psk: need(psk_capable),
        required,
    }
}

pub fn decode_remote_need(mask: u32) -> TlsRemoteNeed {
    TlsRemoteNeed {
        cert: TlsRequirement::from_bits(mask >> CERT_SHIFT),
        psk: TlsRequirement::from_bits(mask),
    }
}

/// Mode both sides can run, certificates preferred
pub fn select_mode(local: &TlsLocalNeed, remote: &TlsRemoteNeed) -> Option<TlsMode> {
    if local.cert.capable() && remote.cert.capable() {
        Some(TlsMode::Certificate)
    } else if local.psk.capable() && remote.psk.capable() {
        Some(TlsMode::Psk)
    } else {
        None
    }
}

pub fn check_requirement(local: &TlsLocalNeed, remote: &TlsRemoteNeed) -> TlsDecision {
    if select_mode(local, remote).is_some() {
        TlsDecision::Proceed
    } else if local.required {
        TlsDecision::RejectLocal
    } else if remote.required() {
        TlsDecision::RejectRemote
    } else {
        TlsDecision::Proceed
    }
}

/// Per-handshake TLS state
#[derive(Debug)]
pub struct TlsNegotiator {
    config: TlsConfig,
    local: TlsLocalNeed,
    remote: Option<TlsRemoteNeed>,
    mode: Option<TlsMode>,
    upgraded: bool,
}

impl TlsNegotiator {
    pub fn new(config: &TlsConfig, secret: &Secret) -> Self {
        Self {
            config: config.clone(),
            local: calc_local_need(config, secret),
            remote: None,
            mode: None,
            upgraded: false,
        }
    }

    pub fn local(&self) -> &TlsLocalNeed {
        &self.local
    }

    pub fn advertised_mask(&self) -> u32 {
        self.local.advertised_mask()
    }

    pub fn set_remote(&mut self, mask: u32) {
        self.remote = Some(decode_remote_need(mask));
    }

    /// Decide whether the session may continue and pick the TLS mode
    ///
    /// Must run before any credential is sent or verified.
    pub fn check(&mut self) -> Result<()> {
        let remote = self.remote.unwrap_or_else(|| decode_remote_need(0));
        match check_requirement(&self.local, &remote) {
            TlsDecision::Proceed => {
                self.mode = select_mode(&self.local, &remote);
                debug!("TLS policy: proceed, mode {:?}", self.mode);
                Ok(())
            }
            TlsDecision::RejectLocal => Err(AuthError::TlsPolicyViolation(
                "TLS required locally but not offered by peer".to_string(),
            )),
            TlsDecision::RejectRemote => Err(AuthError::TlsPolicyViolation(
                "TLS required by peer but not configured locally".to_string(),
            )),
        }
    }

    pub fn selected_mode(&self) -> Option<TlsMode> {
        self.mode
    }

    /// Mode to start before credentials are exchanged, if any
    ///
    /// PSK always starts early; certificate TLS only for interactive
    /// sessions so that prompts and answers are never sent in clear.
    pub fn early_mode(&self, interactive: bool) -> Option<TlsMode> {
        match self.mode {
            Some(TlsMode::Psk) => Some(TlsMode::Psk),
            Some(mode) if interactive => Some(mode),
            _ => None,
        }
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// Run the TLS handshake for the selected mode
    pub async fn upgrade(&mut self, channel: &mut dyn MessageChannel, side: TlsSide) -> Result<()> {
        let mode = self
            .mode
            .ok_or_else(|| AuthError::TlsPolicyViolation("no TLS mode selected".to_string()))?;
        let ctx = self.config.context(mode).cloned().ok_or_else(|| {
            AuthError::TlsPolicyViolation(format!("{} selected but not configured", mode))
        })?;

        let verify_cns = if mode == TlsMode::Certificate && self.config.tls_verify_peer {
            Some(self.config.tls_allowed_cns.as_slice())
        } else {
            None
        };

        debug!("Starting {} handshake with {} as {:?}", mode, channel.peer(), side);
        if let Err(e) = ctx.handshake(channel, side, verify_cns).await {
            let certificate = matches!(e, ChannelError::Certificate(_));
            if certificate {
                error!(
                    "TLS certificate verification with {} failed: {}",
                    channel.peer(),
                    e
                );
            }
            return Err(AuthError::TlsHandshakeFailure {
                reason: e.to_string(),
                certificate,
            });
        }

        channel.set_tls(Some(mode));
        self.upgraded = true;
        Ok(())
    }

    /// Post-credential step: upgrade unless already done
    pub async fn handle_tls(
        &mut self,
        channel: &mut dyn MessageChannel,
        side: TlsSide,
    ) -> Result<()> {
        if self.mode.is_none() || self.upgraded {
            return Ok(());
        }
        self.upgrade(channel, side).await
    }

    /// Drop TLS when it was only wanted for authentication
    ///
    /// Returns the mode still protecting the channel.
    pub fn finish(&self, channel: &mut dyn MessageChannel) -> Option<TlsMode> {
        if self.upgraded && self.config.tls_authenticate {
            debug!("Authentication done, dropping TLS with {}", channel.peer());
            channel.set_tls(None);
        }
        channel.tls()
    }
}
