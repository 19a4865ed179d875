//! Shared fixtures for handshake tests

#![allow(dead_code)]

use async_trait::async_trait;
use bsock::{ChannelError, MessageChannel, TlsContext, TlsMode, TlsSide};
use dirauth::{
    AuthEvent, AuthOptions, AuthPlugin, AuthPluginRegistry, AuthValue, AuthenticationOperation,
    AuthenticationRegister, Identity, Outcome, PeerResource, PluginContext, PluginError,
    ResourceTable, Role,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const DIRECTOR_PASSWORD: &str = "director-secret";
pub const CONSOLE_PASSWORD: &str = "console-secret";
pub const CLIENT_PASSWORD: &str = "client-secret";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn options() -> Arc<AuthOptions> {
    Arc::new(AuthOptions::default())
}

/// TLS context that only records handshakes
#[derive(Debug, Default)]
pub struct FakeTls {
    pub mode: Option<TlsMode>,
    pub reject_certificate: bool,
    pub handshakes: AtomicUsize,
}

impl FakeTls {
    pub fn certificate() -> Arc<FakeTls> {
        Arc::new(FakeTls {
            mode: Some(TlsMode::Certificate),
            ..Default::default()
        })
    }

    pub fn psk() -> Arc<FakeTls> {
        Arc::new(FakeTls {
            mode: Some(TlsMode::Psk),
            ..Default::default()
        })
    }

    pub fn bad_certificate() -> Arc<FakeTls> {
        Arc::new(FakeTls {
            mode: Some(TlsMode::Certificate),
            reject_certificate: true,
            ..Default::default()
        })
    }

    pub fn count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TlsContext for FakeTls {
    fn mode(&self) -> TlsMode {
        self.mode.unwrap_or(TlsMode::Certificate)
    }

    async fn handshake(
        &self,
        _channel: &mut dyn MessageChannel,
        _side: TlsSide,
        _verify_cns: Option<&[String]>,
    ) -> bsock::Result<()> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        if self.reject_certificate {
            return Err(ChannelError::Certificate(
                "peer certificate not signed by a trusted CA".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counts plugin contexts released
#[derive(Debug)]
pub struct DropGuard(Arc<AtomicUsize>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Collected {
    answers: Vec<String>,
    _guard: DropGuard,
}

/// Plugin asking a fixed list of questions and comparing the answers
#[derive(Debug)]
pub struct ScriptedPlugin {
    name: String,
    operations: Vec<AuthenticationOperation>,
    expected: Vec<String>,
    /// Operations handed out for `Question` events, in order
    questions: Mutex<Vec<AuthenticationOperation>>,
    pub created: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

impl ScriptedPlugin {
    pub fn new(name: &str, operations: Vec<AuthenticationOperation>, expected: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            operations,
            expected: expected.iter().map(|s| s.to_string()).collect(),
            questions: Mutex::new(Vec::new()),
            created: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Login and password prompts followed by the final check
    pub fn login(expected_user: &str, expected_password: &str) -> Self {
        Self::new(
            "scripted",
            vec![
                AuthenticationOperation::plain(1, "Login:"),
                AuthenticationOperation::hidden(2, "Password:"),
                AuthenticationOperation::authenticate(3),
            ],
            &[expected_user, expected_password],
        )
    }

    /// Answer `Question` events with these operations, then with nothing
    pub fn with_questions(self, questions: Vec<AuthenticationOperation>) -> Self {
        if let Ok(mut pending) = self.questions.lock() {
            *pending = questions.into_iter().rev().collect();
        }
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl AuthPlugin for ScriptedPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_context(&self, console: &str) -> PluginContext {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut ctx = PluginContext::new(console);
        ctx.set_state(Collected {
            answers: Vec::new(),
            _guard: DropGuard(self.released.clone()),
        });
        ctx
    }

    fn get_registration(
        &self,
        _ctx: &mut PluginContext,
        _param: &str,
    ) -> Result<AuthenticationRegister, PluginError> {
        Ok(AuthenticationRegister {
            name: self.name.clone(),
            welcome: Some("Scripted authentication".to_string()),
            operations: self.operations.clone(),
            ttl: 0,
        })
    }

    fn handle_event(&self, ctx: &mut PluginContext, event: AuthEvent) -> Outcome {
        let Some(collected) = ctx.state_mut::<Collected>() else {
            return Outcome::Error;
        };
        match event {
            AuthEvent::Question { .. } => {
                let next = self.questions.lock().ok().and_then(|mut q| q.pop());
                Outcome::Ok(next.map(AuthValue::NextOperation))
            }
            AuthEvent::Response {
                value: AuthValue::Response(answer),
                ..
            } => {
                collected.answers.push(answer);
                Outcome::Ok(None)
            }
            AuthEvent::Response { .. } => Outcome::Error,
            AuthEvent::Authenticate if collected.answers == self.expected => Outcome::Ok(None),
            AuthEvent::Authenticate => Outcome::Error,
        }
    }
}

pub fn registry(plugin: Arc<ScriptedPlugin>) -> AuthPluginRegistry {
    AuthPluginRegistry::builder().register(plugin).build()
}

/// Director resource, one named console and one file daemon client
pub fn resources() -> ResourceTable {
    let mut table = ResourceTable::new();
    table.set_director(PeerResource::new(Identity::new(
        "bacula-dir",
        Role::Director,
        DIRECTOR_PASSWORD,
    )));
    table.add_console(PeerResource::new(Identity::new(
        "Backup-Client",
        Role::Console,
        CONSOLE_PASSWORD,
    )));
    table.add_client(
        PeerResource::new(Identity::new("web-fd", Role::FileDaemon, CLIENT_PASSWORD))
            .allow_fd_connections(true),
    );
    table.add_client(PeerResource::new(Identity::new(
        "db-fd",
        Role::FileDaemon,
        CLIENT_PASSWORD,
    )));
    table
}

pub fn console(name: &str, password: &str) -> Identity {
    Identity::new(name, Role::Console, password)
}
