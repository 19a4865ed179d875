//! Engine options
//!
//! Options are plain data: embedders fill them from whatever configuration
//! source they use (serde works for any format) and call
//! [`AuthOptions::validate`] once at startup.

use crate::types::Role;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid option {option}: {reason}")]
    Invalid { option: &'static str, reason: String },
}

/// When line compression may be turned on for a peer
///
/// Compression is used only if the peer's version is at least `min_version`
/// and not listed in `excluded_versions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionPolicy {
    pub enabled: bool,
    pub min_version: u32,
    pub excluded_versions: Vec<u32>,
}

impl CompressionPolicy {
    pub fn new(min_version: u32) -> Self {
        Self {
            enabled: true,
            min_version,
            excluded_versions: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn excluding(mut self, version: u32) -> Self {
        self.excluded_versions.push(version);
        self
    }

    pub fn allows(&self, remote_version: u32) -> bool {
        self.enabled
            && remote_version >= self.min_version
            && !self.excluded_versions.contains(&remote_version)
    }
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self::new(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthOptions {
    /// Local daemon name, used in challenges and acknowledgements
    pub name: String,
    /// Version announced in Hello and acknowledgement lines
    pub protocol_version: u32,
    /// Oldest console version able to run interactive authentication
    pub interactive_min_version: u32,
    /// Older consoles with a plugin configured use CRAM-MD5 instead of
    /// being refused
    pub allow_legacy_fallback: bool,
    pub handshake_timeout_secs: u64,
    /// Bound on a single wait for a prompt answer or confirmation
    pub response_timeout_secs: u64,
    /// Deterrent sleep on every rejection
    pub reject_delay_secs: u64,
    pub console_compression: CompressionPolicy,
    pub director_compression: CompressionPolicy,
    pub file_daemon_compression: CompressionPolicy,
    pub storage_daemon_compression: CompressionPolicy,
    /// Read hidden answers with echo on (test automation only)
    pub echo_hidden_input: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            name: "bacula-dir".to_string(),
            protocol_version: 10002,
            interactive_min_version: 100,
            allow_legacy_fallback: true,
            handshake_timeout_secs: 60,
            response_timeout_secs: 180,
            reject_delay_secs: 5,
            console_compression: CompressionPolicy::new(1),
            director_compression: CompressionPolicy::new(1),
            // 213 announced compression it could not handle
            file_daemon_compression: CompressionPolicy::new(9).excluding(213),
            storage_daemon_compression: CompressionPolicy::new(1),
            echo_hidden_input: false,
        }
    }
}

impl AuthOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid {
                option: "name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.name.len() >= crate::messages::MAX_NAME_LENGTH {
            return Err(ConfigError::Invalid {
                option: "name",
                reason: format!(
                    "longer than {} characters",
                    crate::messages::MAX_NAME_LENGTH - 1
                ),
            });
        }
        for (option, value) in [
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("response_timeout_secs", self.response_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    option,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Compression policy for a remote of the given role
    pub fn compression_for(&self, remote: Role) -> &CompressionPolicy {
        match remote {
            Role::Console | Role::UserAgent => &self.console_compression,
            Role::Director => &self.director_compression,
            Role::FileDaemon => &self.file_daemon_compression,
            Role::StorageDaemon => &self.storage_daemon_compression,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn reject_delay(&self) -> Duration {
        Duration::from_secs(self.reject_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = AuthOptions::default();
        assert_eq!(options.protocol_version, 10002);
        assert_eq!(options.handshake_timeout(), Duration::from_secs(60));
        assert_eq!(options.response_timeout(), Duration::from_secs(180));
        assert_eq!(options.reject_delay(), Duration::from_secs(5));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_compression_policy() {
        let fd = AuthOptions::default().file_daemon_compression;
        assert!(!fd.allows(8));
        assert!(fd.allows(9));
        assert!(!fd.allows(213));
        assert!(fd.allows(214));

        let console = CompressionPolicy::default();
        assert!(!console.allows(0));
        assert!(console.allows(1));
        assert!(!CompressionPolicy::disabled().allows(10002));
    }

    #[test]
    fn test_compression_for_role() {
        let options = AuthOptions::default();
        assert_eq!(options.compression_for(Role::FileDaemon).min_version, 9);
        assert_eq!(options.compression_for(Role::UserAgent).min_version, 1);
    }

    #[test]
    fn test_deserialize_partial() {
        let options: AuthOptions = serde_json::from_str(
            r#"{
                "name": "backup-dir",
                "reject_delay_secs": 2,
                "console_compression": { "enabled": false }
            }"#,
        )
        .unwrap();
        assert_eq!(options.name, "backup-dir");
        assert_eq!(options.reject_delay(), Duration::from_secs(2));
        assert_eq!(options.protocol_version, 10002);
        assert!(!options.console_compression.enabled);
        assert_eq!(options.console_compression.min_version, 1);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let options = AuthOptions {
            handshake_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(
            options.validate(),
            Err(ConfigError::Invalid {
                option: "handshake_timeout_secs",
                reason: "must be greater than zero".to_string(),
            })
        );

        let options = AuthOptions {
            name: String::new(),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
