//! CRAM-MD5 challenge/response
//!
//! The challenger sends `auth cram-md5 <nonce> ssl=<mask>`, the responder
//! answers with the unpadded base64 HMAC-MD5 of the nonce keyed by the shared
//! secret, and the challenger replies with a verdict line. Authentication is
//! mutual: each side runs the exchange once as challenger.

use crate::error::{AuthError, Result};
use crate::messages::{is_rejection, printable, rejection_error, trim_line};
use crate::types::{bash_spaces, Secret};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use bsock::MessageChannel;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::Rng;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tracing::{debug, warn};

type HmacMd5 = Hmac<Md5>;

/// Verdict sent when the answer matches
pub const AUTH_OK: &str = "1000 OK auth\n";
/// Verdict sent on a wrong or missing answer
pub const AUTH_FAILED: &str = "1999 Authorization failed.\n";

const AUTH_PREFIX: &str = "auth";
const CRAM_MD5: &str = "cram-md5";
const CRAM_MD5_COMPAT: &str = "cram-md5c";
const SSL_PREFIX: &str = "ssl=";

/// A parsed challenge line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub nonce: String,
    /// TLS need advertised by the challenger; `None` for legacy lines
    pub tls_mask: Option<u32>,
}

impl Challenge {
    /// Fresh nonce naming the local daemon
    pub fn generate(local_name: &str, tls_mask: u32) -> Self {
        let random: u32 = rand::thread_rng().gen();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            nonce: format!("<{}.{}@{}>", random, now, bash_spaces(local_name)),
            tls_mask: Some(tls_mask),
        }
    }

    pub fn to_line(&self) -> String {
        match self.tls_mask {
            Some(mask) => format!(
                "{} {} {} {}{}\n",
                AUTH_PREFIX, CRAM_MD5, self.nonce, SSL_PREFIX, mask
            ),
            None => format!("{} {} {}\n", AUTH_PREFIX, CRAM_MD5, self.nonce),
        }
    }

    /// `Ok(None)` when the line is not a CRAM-MD5 challenge at all
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let tokens: Vec<&str> = trim_line(line).split(' ').collect();
        match tokens.as_slice() {
            [AUTH_PREFIX, CRAM_MD5 | CRAM_MD5_COMPAT, rest @ ..] => {
                let (nonce, tls_mask) = match rest {
                    [nonce] => (*nonce, None),
                    [nonce, ssl] => {
                        let mask = ssl
                            .strip_prefix(SSL_PREFIX)
                            .and_then(|m| m.parse::<u32>().ok())
                            .ok_or_else(|| malformed(line))?;
                        (*nonce, Some(mask))
                    }
                    _ => return Err(malformed(line)),
                };
                if nonce.is_empty() {
                    return Err(malformed(line));
                }
                Ok(Some(Self {
                    nonce: nonce.to_string(),
                    tls_mask,
                }))
            }
            _ => Ok(None),
        }
    }
}

/// Keyed digest of a nonce as sent on the wire
pub fn digest(secret: &Secret, nonce: &str) -> Result<String> {
    let mut mac = HmacMd5::new_from_slice(secret.expose().as_bytes())
        .map_err(|e| AuthError::ProtocolViolation(format!("HMAC key error: {}", e)))?;
    mac.update(nonce.as_bytes());
    Ok(STANDARD_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// Runs both halves of the exchange for one shared secret
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    secret: Secret,
    local_name: String,
}

impl CredentialHasher {
    pub fn new(secret: Secret, local_name: &str) -> Self {
        Self {
            secret,
            local_name: local_name.to_string(),
        }
    }

    /// Challenge the peer and check its answer
    ///
    /// A late answer and a wrong answer look the same to the peer: both get
    /// [`AUTH_FAILED`]. Only the returned error tells them apart.
    pub async fn server_verify(
        &self,
        channel: &mut dyn MessageChannel,
        tls_mask: u32,
        deadline: Instant,
    ) -> Result<()> {
        let challenge = Challenge::generate(&self.local_name, tls_mask);
        debug!("Sending CRAM-MD5 challenge to {}", channel.peer());
        channel.send(challenge.to_line().as_bytes()).await?;

        let answer = match channel.recv_until(deadline).await {
            Ok(answer) => answer,
            Err(e) => {
                let _ = channel.send(AUTH_FAILED.as_bytes()).await;
                return Err(e.into());
            }
        };

        let expected = digest(&self.secret, &challenge.nonce)?;
        let answer = trim_line(std::str::from_utf8(&answer).unwrap_or_default());
        let matched: bool = answer.as_bytes().ct_eq(expected.as_bytes()).into();

        if matched {
            channel.send(AUTH_OK.as_bytes()).await?;
            debug!("CRAM-MD5 answer from {} accepted", channel.peer());
            Ok(())
        } else {
            let _ = channel.send(AUTH_FAILED.as_bytes()).await;
            Err(AuthError::CredentialMismatch)
        }
    }

    /// Wait for the peer's challenge without answering it yet
    pub async fn read_challenge(
        &self,
        channel: &mut dyn MessageChannel,
        deadline: Instant,
    ) -> Result<Challenge> {
        let line = channel.recv_until(deadline).await?;
        let line = String::from_utf8_lossy(&line);
        match Challenge::parse(&line)? {
            Some(challenge) => Ok(challenge),
            None if is_rejection(&line) => Err(rejection_error(&line)),
            None => Err(AuthError::ProtocolViolation(format!(
                "expected challenge, got: {}",
                printable(&line)
            ))),
        }
    }

    /// Answer a challenge and wait for the verdict
    pub async fn answer(
        &self,
        channel: &mut dyn MessageChannel,
        challenge: &Challenge,
        deadline: Instant,
    ) -> Result<()> {
        let response = digest(&self.secret, &challenge.nonce)?;
        channel.send(response.as_bytes()).await?;

        let verdict = channel.recv_until(deadline).await?;
        let verdict = String::from_utf8_lossy(&verdict);
        if verdict == AUTH_OK {
            Ok(())
        } else if verdict == AUTH_FAILED {
            warn!("Peer {} rejected our CRAM-MD5 answer", channel.peer());
            Err(AuthError::CredentialMismatch)
        } else {
            Err(rejection_error(&verdict))
        }
    }

    /// Read a challenge, answer it, wait for the verdict
    pub async fn client_respond(
        &self,
        channel: &mut dyn MessageChannel,
        deadline: Instant,
    ) -> Result<Challenge> {
        let challenge = self.read_challenge(channel, deadline).await?;
        self.answer(channel, &challenge, deadline).await?;
        Ok(challenge)
    }
}

fn malformed(line: &str) -> AuthError {
    AuthError::MalformedMessage(format!("invalid challenge: {}", printable(line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsock::MemoryChannel;
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_hmac_md5_known_vector() {
        // RFC 2202 test case 2
        let secret = Secret::new("Jefe");
        let encoded = digest(&secret, "what do ya want for nothing?").unwrap();
        let raw = STANDARD_NO_PAD.decode(&encoded).unwrap();
        let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(hex, "750c783e6ab0b503eaa86e310a5db738");
        assert!(!encoded.ends_with('='));
    }

    #[test]
    fn test_challenge_forms() {
        let challenge = Challenge::generate("bacula dir", 6);
        let line = challenge.to_line();
        assert!(line.starts_with("auth cram-md5 <"));
        assert!(line.ends_with("ssl=6\n"));
        assert_eq!(Challenge::parse(&line).unwrap(), Some(challenge));

        let compat = Challenge::parse("auth cram-md5c <1.2@fd> ssl=0\n")
            .unwrap()
            .unwrap();
        assert_eq!(compat.tls_mask, Some(0));

        let legacy = Challenge::parse("auth cram-md5 <1.2@fd>\n").unwrap().unwrap();
        assert_eq!(legacy.nonce, "<1.2@fd>");
        assert_eq!(legacy.tls_mask, None);

        assert_eq!(Challenge::parse("auth interactive hi\n").unwrap(), None);
        assert!(Challenge::parse("auth cram-md5 <1.2@fd> tls=1\n").is_err());
    }

    #[tokio::test]
    async fn test_matching_secrets_succeed() {
        let (mut server, mut client) = MemoryChannel::pair("client", "server");
        let verifier = CredentialHasher::new(Secret::new("s3cret"), "bacula-dir");
        let responder = CredentialHasher::new(Secret::new("s3cret"), "console");

        let (verified, responded) = tokio::join!(
            verifier.server_verify(&mut server, 0, deadline()),
            responder.client_respond(&mut client, deadline()),
        );
        verified.unwrap();
        assert_eq!(responded.unwrap().tls_mask, Some(0));
    }

    #[tokio::test]
    async fn test_one_byte_difference_is_mismatch() {
        let (mut server, mut client) = MemoryChannel::pair("client", "server");
        let verifier = CredentialHasher::new(Secret::new("s3cret"), "bacula-dir");
        let responder = CredentialHasher::new(Secret::new("s3cres"), "console");

        let (verified, responded) = tokio::join!(
            verifier.server_verify(&mut server, 0, deadline()),
            responder.client_respond(&mut client, deadline()),
        );
        assert!(matches!(verified, Err(AuthError::CredentialMismatch)));
        assert!(matches!(responded, Err(AuthError::CredentialMismatch)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_gets_same_verdict() {
        let (mut server, mut client) = MemoryChannel::pair("client", "server");
        let verifier = CredentialHasher::new(Secret::new("s3cret"), "bacula-dir");

        let result = verifier
            .server_verify(&mut server, 0, Instant::now() + Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(AuthError::Timeout(_))));

        let challenge = client.try_recv().unwrap();
        assert!(challenge.starts_with(b"auth cram-md5 "));
        assert_eq!(client.try_recv().unwrap(), AUTH_FAILED.as_bytes());
    }

    #[tokio::test]
    async fn test_rejection_instead_of_challenge() {
        let (mut server, mut client) = MemoryChannel::pair("client", "server");
        server
            .send(crate::messages::REJECT_UNAUTHORIZED.as_bytes())
            .await
            .unwrap();
        let responder = CredentialHasher::new(Secret::new("pw"), "console");
        let result = responder.read_challenge(&mut client, deadline()).await;
        assert!(matches!(result, Err(AuthError::Rejected(_))));
    }
}
