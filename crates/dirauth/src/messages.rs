//! Text lines exchanged during the handshake
//!
//! Every line is parsed against an explicit list of accepted grammars; text
//! that matches none of them is a [`AuthError::MalformedMessage`].
//!
//! ```text
//! Hello <name> calling [<version> [tlspsk=<mask>]]
//! Hello <name> fdcallsdir <version> [tlspsk=<mask>]
//! Hello Director <name> calling <version> [tlspsk=<mask>]
//! Hello SD: Bacula Director <name> calling <version> [tlspsk=<mask>]
//! <code> OK: [<version> ...]
//! <code> OK Hello [<version>]
//! starttls tlspsk=<mask>
//! ```

use crate::error::{AuthError, Result};
use crate::types::{bash_spaces, unbash_spaces, Role};
use std::fmt;

/// Hello lines shorter than this are rejected unparsed
pub const MIN_HELLO_LEN: usize = 16;
/// Longest accepted peer name
pub const MAX_NAME_LENGTH: usize = 128;
/// Hello lines at or above this length are rejected unparsed
pub const MAX_HELLO_LEN: usize = MAX_NAME_LENGTH + 15;

/// Sent to the peer on every acceptor-side failure
pub const REJECT_UNAUTHORIZED: &str = "1999 You are not authorized.\n";
/// Sent when the acceptor refuses a connection for capacity reasons
pub const REJECT_BUSY: &str = "1999 Director busy: connection limit reached.\n";
/// Prefix of rejection lines
const REJECT_CODE: &str = "1999";
/// Separate confirmation line after a fdcallsdir acknowledgement
pub const FD_CALLS_DIR_OK: &str = "OK\n";

const HELLO: &str = "Hello";
const CALLING: &str = "calling";
const FD_CALLS_DIR: &str = "fdcallsdir";
const TLSPSK_PREFIX: &str = "tlspsk=";
const STARTTLS: &str = "starttls";

/// Which Hello grammar was (or will be) used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloKind {
    /// Console (named or default) calling the director
    Calling,
    /// File daemon opening a connection to the director
    FdCallsDir,
    /// Director calling a file daemon
    DirectorCalling,
    /// Director calling a storage daemon
    StorageCalling,
}

impl HelloKind {
    /// Hello form used when `local` opens a connection to `target`
    pub fn for_roles(local: Role, target: Role) -> Option<HelloKind> {
        match (local, target) {
            (Role::Console | Role::UserAgent, Role::Director) => Some(HelloKind::Calling),
            (Role::FileDaemon, Role::Director) => Some(HelloKind::FdCallsDir),
            (Role::Director, Role::FileDaemon) => Some(HelloKind::DirectorCalling),
            (Role::Director, Role::StorageDaemon) => Some(HelloKind::StorageCalling),
            _ => None,
        }
    }
}

/// First line of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub kind: HelloKind,
    /// Peer name with spaces restored
    pub name: String,
    /// Announced protocol version, 0 when absent
    pub version: u32,
    /// Advertised TLS need bitmask, 0 when absent
    pub tls_mask: u32,
}

impl HelloMessage {
    pub fn new(kind: HelloKind, name: &str, version: u32, tls_mask: u32) -> Self {
        Self {
            kind,
            name: name.to_string(),
            version,
            tls_mask,
        }
    }

    /// Wire form, newline terminated
    pub fn to_line(&self) -> String {
        let name = bash_spaces(&self.name);
        let tail = format!("{} {}{}", self.version, TLSPSK_PREFIX, self.tls_mask);
        match self.kind {
            HelloKind::Calling => format!("{} {} {} {}\n", HELLO, name, CALLING, tail),
            HelloKind::FdCallsDir => format!("{} {} {} {}\n", HELLO, name, FD_CALLS_DIR, tail),
            HelloKind::DirectorCalling => {
                format!("{} Director {} {} {}\n", HELLO, name, CALLING, tail)
            }
            HelloKind::StorageCalling => {
                format!("{} SD: Bacula Director {} {} {}\n", HELLO, name, CALLING, tail)
            }
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = trim_line(line).split(' ').collect();
        if tokens.first() != Some(&HELLO) {
            return Err(malformed("Hello", line));
        }

        // Position of the verb decides the grammar
        let (kind, name, rest) = match tokens.as_slice() {
            [_, name, CALLING, rest @ ..] => (HelloKind::Calling, *name, rest),
            [_, name, FD_CALLS_DIR, rest @ ..] => (HelloKind::FdCallsDir, *name, rest),
            [_, "Director", name, CALLING, rest @ ..] => {
                (HelloKind::DirectorCalling, *name, rest)
            }
            [_, "SD:", "Bacula", "Director", name, CALLING, rest @ ..] => {
                (HelloKind::StorageCalling, *name, rest)
            }
            _ => return Err(malformed("Hello", line)),
        };

        if name.is_empty() || name.len() >= MAX_NAME_LENGTH {
            return Err(malformed("Hello", line));
        }

        let (version, tls_mask) = match rest {
            [] if kind == HelloKind::Calling => (0, 0),
            [version] => (parse_number(version, line)?, 0),
            [version, mask] => {
                let mask = mask
                    .strip_prefix(TLSPSK_PREFIX)
                    .ok_or_else(|| malformed("Hello", line))?;
                (parse_number(version, line)?, parse_number(mask, line)?)
            }
            _ => return Err(malformed("Hello", line)),
        };

        Ok(Self {
            kind,
            name: unbash_spaces(name),
            version,
            tls_mask,
        })
    }
}

impl fmt::Display for HelloMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Hello({:?} {} v{} tlspsk={})",
            self.kind, self.name, self.version, self.tls_mask
        )
    }
}

/// Final acknowledgement of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    /// Status code, e.g. 1000 from a director, 2000 from a file daemon
    pub code: u16,
    /// Version embedded in the line, 0 when absent
    pub version: u32,
}

impl Acknowledgement {
    /// Line sent by the director to a console or file daemon
    pub fn director_line(version: u32, name: &str) -> String {
        format!(
            "1000 OK: {} {} Version: {}\n",
            version,
            name,
            env!("CARGO_PKG_VERSION")
        )
    }

    pub fn parse(line: &str) -> Result<Self> {
        let line = trim_line(line);
        let (code, rest) = line
            .split_once(' ')
            .ok_or_else(|| malformed("acknowledgement", line))?;
        if code.len() != 4 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed("acknowledgement", line));
        }
        let code: u16 = code
            .parse()
            .map_err(|_| malformed("acknowledgement", line))?;

        let tail = if let Some(tail) = rest.strip_prefix("OK:") {
            tail
        } else if let Some(tail) = rest.strip_prefix("OK Hello") {
            tail
        } else {
            return Err(malformed("acknowledgement", line));
        };

        // Leading digits only; anything else leaves the version at 0
        let digits: String = tail
            .trim_start()
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        let version = digits.parse().unwrap_or(0);
        Ok(Self { code, version })
    }
}

/// Early TLS announcement sent by the acceptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTls {
    pub tls_mask: u32,
}

impl StartTls {
    pub fn to_line(&self) -> String {
        format!("{} {}{}\n", STARTTLS, TLSPSK_PREFIX, self.tls_mask)
    }

    /// `Ok(None)` when the line is something other than a starttls line
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = trim_line(line);
        let Some(rest) = line.strip_prefix(STARTTLS) else {
            return Ok(None);
        };
        let mask = rest
            .trim_start()
            .strip_prefix(TLSPSK_PREFIX)
            .ok_or_else(|| malformed("starttls", line))?;
        Ok(Some(Self {
            tls_mask: parse_number(mask, line)?,
        }))
    }
}

/// Whether `line` is one of the acceptor's rejection lines
pub fn is_rejection(line: &str) -> bool {
    line.starts_with(REJECT_CODE)
}

/// Map a rejection line to the matching error
pub fn rejection_error(line: &str) -> AuthError {
    if line == REJECT_BUSY {
        AuthError::PeerBusy(trim_line(line).to_string())
    } else if is_rejection(line) {
        AuthError::Rejected(trim_line(line).to_string())
    } else {
        AuthError::ProtocolViolation(format!("unexpected line: {}", printable(line)))
    }
}

/// Strip the trailing line terminator
pub fn trim_line(line: &str) -> &str {
    line.trim_end_matches(|c| c == '\n' || c == '\r')
}

/// Bounded, single-line rendition of untrusted text for logs
pub fn printable(line: &str) -> String {
    trim_line(line)
        .chars()
        .take(100)
        .map(|c| if c.is_control() { '?' } else { c })
        .collect()
}

fn parse_number(token: &str, line: &str) -> Result<u32> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed("number", line));
    }
    token.parse().map_err(|_| malformed("number", line))
}

fn malformed(what: &str, line: &str) -> AuthError {
    AuthError::MalformedMessage(format!("invalid {}: {}", what, printable(line)))
}
