//! Identities, resources and handshake results

use crate::tls::TlsConfig;
use bsock::TlsMode;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;

/// Name the default (unnamed) console announces itself with
pub const DEFAULT_CONSOLE_NAME: &str = "*UserAgent*";

/// Replacement byte for spaces in names sent on the wire
const BASHED_SPACE: char = '\u{1}';

/// Kind of daemon or program taking part in a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Director,
    Console,
    FileDaemon,
    StorageDaemon,
    UserAgent,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Director => "Director",
            Role::Console => "Console",
            Role::FileDaemon => "File daemon",
            Role::StorageDaemon => "Storage daemon",
            Role::UserAgent => "User agent",
        };
        f.write_str(name)
    }
}

/// Shared password material
///
/// Never printed: `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// A throwaway secret nobody knows
    pub fn random() -> Self {
        let secret: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        Self(secret)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A named party with its shared secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub role: Role,
    pub secret: Secret,
}

impl Identity {
    pub fn new(name: impl Into<String>, role: Role, secret: impl Into<Secret>) -> Self {
        Self {
            name: name.into(),
            role,
            secret: secret.into(),
        }
    }

    /// Name with embedded spaces replaced, as sent on the wire
    pub fn bashed_name(&self) -> String {
        bash_spaces(&self.name)
    }
}

/// Replace spaces so a name survives whitespace-separated parsing
pub fn bash_spaces(name: &str) -> String {
    name.replace(' ', &BASHED_SPACE.to_string())
}

/// Undo [`bash_spaces`]
pub fn unbash_spaces(name: &str) -> String {
    name.replace(BASHED_SPACE, " ")
}

/// What the acceptor must look up for an incoming Hello
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerLookup {
    /// The unnamed console; uses the director's own resource
    DefaultConsole,
    /// A named console resource
    Console(String),
    /// A client resource for a file daemon calling the director
    FileDaemon(String),
}

impl PeerLookup {
    pub fn name(&self) -> &str {
        match self {
            PeerLookup::DefaultConsole => DEFAULT_CONSOLE_NAME,
            PeerLookup::Console(name) | PeerLookup::FileDaemon(name) => name,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            PeerLookup::DefaultConsole => Role::UserAgent,
            PeerLookup::Console(_) => Role::Console,
            PeerLookup::FileDaemon(_) => Role::FileDaemon,
        }
    }
}

/// A resolved configuration resource for a peer
#[derive(Debug, Clone)]
pub struct PeerResource {
    pub identity: Identity,
    pub tls: TlsConfig,
    /// Authentication plugin parameter (consoles only)
    pub auth_plugin: Option<String>,
    /// Client resources only: file daemon may open the connection
    pub allow_fd_connections: bool,
}

impl PeerResource {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            tls: TlsConfig::default(),
            auth_plugin: None,
            allow_fd_connections: false,
        }
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_auth_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.auth_plugin = Some(plugin.into());
        self
    }

    pub fn allow_fd_connections(mut self, allow: bool) -> Self {
        self.allow_fd_connections = allow;
        self
    }
}

/// Resolves peers announced in a Hello to configuration resources
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, lookup: &PeerLookup) -> Option<PeerResource>;
}

impl<F> IdentityResolver for F
where
    F: Fn(&PeerLookup) -> Option<PeerResource> + Send + Sync,
{
    fn resolve(&self, lookup: &PeerLookup) -> Option<PeerResource> {
        self(lookup)
    }
}

/// In-memory resource lookup
#[derive(Debug, Clone, Default)]
pub struct ResourceTable {
    director: Option<PeerResource>,
    consoles: HashMap<String, PeerResource>,
    clients: HashMap<String, PeerResource>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resource used for the default console
    pub fn set_director(&mut self, resource: PeerResource) {
        self.director = Some(resource);
    }

    pub fn add_console(&mut self, resource: PeerResource) {
        self.consoles
            .insert(resource.identity.name.clone(), resource);
    }

    pub fn add_client(&mut self, resource: PeerResource) {
        self.clients.insert(resource.identity.name.clone(), resource);
    }
}

impl IdentityResolver for ResourceTable {
    fn resolve(&self, lookup: &PeerLookup) -> Option<PeerResource> {
        match lookup {
            PeerLookup::DefaultConsole => self.director.clone(),
            PeerLookup::Console(name) => self.consoles.get(name).cloned(),
            PeerLookup::FileDaemon(name) => self.clients.get(name).cloned(),
        }
    }
}

/// How the peer proved its identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    CramMd5,
    /// Plugin-driven prompts; the plugin name is only known on the acceptor side
    Interactive { plugin: Option<String> },
}

/// Outcome of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedSession {
    pub peer_name: String,
    pub peer_role: Role,
    /// Protocol version announced by the remote end (0 when it sent none)
    pub remote_version: u32,
    pub compression: bool,
    /// TLS mode negotiated during the handshake, if any
    pub tls: Option<TlsMode>,
    pub method: AuthMethod,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bash_round_trip() {
        let bashed = bash_spaces("Backup Console 1");
        assert!(!bashed.contains(' '));
        assert_eq!(bashed.split(' ').count(), 1);
        assert_eq!(unbash_spaces(&bashed), "Backup Console 1");
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_random_secrets_differ() {
        let a = Secret::random();
        let b = Secret::random();
        assert_eq!(a.expose().len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_resource_table_lookup() {
        let mut table = ResourceTable::new();
        table.set_director(PeerResource::new(Identity::new(
            "bacula-dir",
            Role::Director,
            "dirpw",
        )));
        table.add_console(PeerResource::new(Identity::new(
            "operator",
            Role::Console,
            "oppw",
        )));
        table.add_client(
            PeerResource::new(Identity::new("web-fd", Role::FileDaemon, "fdpw"))
                .allow_fd_connections(true),
        );

        let director = table.resolve(&PeerLookup::DefaultConsole).unwrap();
        assert_eq!(director.identity.name, "bacula-dir");
        assert!(table
            .resolve(&PeerLookup::Console("operator".to_string()))
            .is_some());
        assert!(table
            .resolve(&PeerLookup::Console("web-fd".to_string()))
            .is_none());
        let client = table
            .resolve(&PeerLookup::FileDaemon("web-fd".to_string()))
            .unwrap();
        assert!(client.allow_fd_connections);
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |lookup: &PeerLookup| match lookup {
            PeerLookup::Console(name) if name == "admin" => Some(PeerResource::new(
                Identity::new("admin", Role::Console, "pw"),
            )),
            _ => None,
        };
        assert!(resolver
            .resolve(&PeerLookup::Console("admin".to_string()))
            .is_some());
        assert!(resolver.resolve(&PeerLookup::DefaultConsole).is_none());
    }

    #[test]
    fn test_lookup_role_and_name() {
        assert_eq!(PeerLookup::DefaultConsole.name(), DEFAULT_CONSOLE_NAME);
        assert_eq!(PeerLookup::DefaultConsole.role(), Role::UserAgent);
        assert_eq!(
            PeerLookup::FileDaemon("web-fd".to_string()).role(),
            Role::FileDaemon
        );
    }
}
