//! Plugin-driven interactive authentication
//!
//! After the acceptor sends `auth interactive <welcome>`, every message is a
//! frame whose first byte is an [`Opcode`]. The acceptor walks the plugin's
//! operations, sending prompts and collecting `Response` frames, then sends
//! `Finish`, asks the plugin for a verdict and confirms with `1000 OK auth`.
//!
//! ```text
//! acceptor                                initiator
//!    auth interactive Welcome\n   ---->
//!    '3' Message text\n           ---->   display
//!    '1' Login:\n                 ---->   read plain
//!                                 <----   '4' alice
//!    '2' Password:\n              ---->   read hidden
//!                                 <----   '4' ********
//!    '0'\n                        ---->   stop loop
//!    1000 OK auth\n               ---->   accepted
//! ```

use crate::cram::{AUTH_FAILED, AUTH_OK};
use crate::error::{AuthError, Result};
use crate::input::SecureInputSource;
use crate::messages::{is_rejection, printable, rejection_error, trim_line};
use crate::plugin::{
    AuthEvent, AuthPluginRegistry, AuthValue, AuthenticationOperation, AuthenticationRegister,
    OperationKind, Outcome, PluginContext,
};
use crate::types::Secret;
use bsock::MessageChannel;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Prefix of the line that starts an interactive session
pub const INTERACTIVE_TRIGGER: &str = "auth interactive";

/// Upper bound on operations a single `PluginAll` may produce
const MAX_PLUGIN_OPERATIONS: usize = 256;

/// First byte of every interactive frame
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u8)]
pub enum Opcode {
    /// '0'
    Finish = 0x30,
    /// '1'
    Plain = 0x31,
    /// '2'
    Hidden = 0x32,
    /// '3'
    Message = 0x33,
    /// '4'
    Response = 0x34,
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        self.into()
    }
}

/// Frame sent by the acceptor: opcode, text, newline
pub fn frame(opcode: Opcode, text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 2);
    buf.put_u8(opcode.as_u8());
    buf.put_slice(text.as_bytes());
    buf.put_u8(b'\n');
    buf.freeze()
}

/// Frame sent by the initiator: opcode and answer, no newline
pub fn response_frame(answer: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(answer.len() + 1);
    buf.put_u8(Opcode::Response.as_u8());
    buf.put_slice(answer.as_bytes());
    buf.freeze()
}

/// Split a frame into its opcode and payload
pub fn split_frame(msg: &[u8]) -> Result<(Opcode, &[u8])> {
    let (&first, payload) = msg
        .split_first()
        .ok_or_else(|| AuthError::MalformedMessage("empty interactive frame".to_string()))?;
    let opcode = Opcode::try_from(first).map_err(|_| {
        AuthError::ProtocolViolation(format!("unknown interactive opcode 0x{:02x}", first))
    })?;
    Ok((opcode, payload))
}

/// Welcome text of a trigger line, `None` for any other line
pub fn parse_trigger(line: &str) -> Option<&str> {
    let rest = trim_line(line).strip_prefix(INTERACTIVE_TRIGGER)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix(' ')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingTrigger,
    /// Index into the registered operations
    Looping(usize),
    AwaitingFinalConfirmation,
    Accepted,
    Rejected,
}

/// What to do with one operation after plugin indirection
enum Action {
    Skip,
    Perform(AuthenticationOperation),
    PluginAll(u32),
    Authenticate,
}

enum Step {
    Continue,
    Authenticate,
}

/// Acceptor side of one interactive authentication
///
/// Owns the plugin context, so the plugin's per-session state goes away
/// with the session on every path.
pub struct InteractiveSession<'a> {
    registry: &'a AuthPluginRegistry,
    registration: AuthenticationRegister,
    ctx: PluginContext,
    responses: BTreeMap<u32, Secret>,
    response_timeout: Duration,
    state: SessionState,
}

impl<'a> InteractiveSession<'a> {
    /// Create the plugin context and fetch the registration for `param`
    pub fn new(
        registry: &'a AuthPluginRegistry,
        param: &str,
        console: &str,
        response_timeout: Duration,
    ) -> Result<Self> {
        let mut ctx = registry.new_context(param, console)?;
        let registration = registry
            .get_registration(&mut ctx, param)
            .ok_or_else(|| AuthError::PluginUnavailable(param.to_string()))?;
        debug!(
            "Server: interactive authentication of {} with plugin {} ({} operations)",
            console,
            registration.name,
            registration.operations.len()
        );
        Ok(Self {
            registry,
            registration,
            ctx,
            responses: BTreeMap::new(),
            response_timeout,
            state: SessionState::AwaitingTrigger,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn plugin_name(&self) -> &str {
        &self.registration.name
    }

    /// Answers collected so far, by sequence id
    pub fn responses(&self) -> &BTreeMap<u32, Secret> {
        &self.responses
    }

    /// Drive the whole exchange; on error the session ends `Rejected`
    pub async fn run(&mut self, channel: &mut dyn MessageChannel) -> Result<()> {
        let result = self.drive(channel).await;
        self.state = match result {
            Ok(()) => SessionState::Accepted,
            Err(_) => SessionState::Rejected,
        };
        result
    }

    async fn drive(&mut self, channel: &mut dyn MessageChannel) -> Result<()> {
        let welcome = self.registration.welcome.clone().unwrap_or_default();
        channel
            .send(format!("{} {}\n", INTERACTIVE_TRIGGER, welcome).as_bytes())
            .await?;

        for index in 0..self.registration.operations.len() {
            self.state = SessionState::Looping(index);
            let op = self.registration.operations[index].clone();
            let step = match self.classify(op, false)? {
                Action::Skip => Step::Continue,
                Action::Perform(op) => {
                    self.perform(channel, &op).await?;
                    Step::Continue
                }
                Action::PluginAll(seq) => self.plugin_all(channel, seq).await?,
                Action::Authenticate => Step::Authenticate,
            };
            if let Step::Authenticate = step {
                break;
            }
        }

        self.state = SessionState::AwaitingFinalConfirmation;
        channel.send(&frame(Opcode::Finish, "")).await?;

        match self.dispatch(AuthEvent::Authenticate)? {
            Outcome::Ok(_) => {
                channel.send(AUTH_OK.as_bytes()).await?;
                Ok(())
            }
            outcome => {
                debug!("Server: plugin {} refused: {:?}", self.registration.name, outcome);
                let _ = channel.send(AUTH_FAILED.as_bytes()).await;
                Err(AuthError::CredentialMismatch)
            }
        }
    }

    /// Resolve `Plugin` indirection and sort the operation
    fn classify(&mut self, op: AuthenticationOperation, in_plugin_all: bool) -> Result<Action> {
        let op = if op.kind == OperationKind::Plugin {
            match self.ask(op.seq)? {
                None => return Ok(Action::Skip),
                Some(next) if next.kind == OperationKind::Plugin => {
                    return Err(AuthError::ProtocolViolation(
                        "plugin answered a Plugin operation with another Plugin operation"
                            .to_string(),
                    ))
                }
                Some(next) => next,
            }
        } else {
            op
        };

        match op.kind {
            OperationKind::PluginAll if in_plugin_all => {
                Err(AuthError::NestedOperationNotSupported)
            }
            OperationKind::PluginAll => Ok(Action::PluginAll(op.seq)),
            OperationKind::Authenticate => Ok(Action::Authenticate),
            _ => Ok(Action::Perform(op)),
        }
    }

    /// Keep asking the plugin for operations until it has none left
    async fn plugin_all(&mut self, channel: &mut dyn MessageChannel, seq: u32) -> Result<Step> {
        for _ in 0..MAX_PLUGIN_OPERATIONS {
            let Some(next) = self.ask(seq)? else {
                return Ok(Step::Continue);
            };
            match self.classify(next, true)? {
                Action::Skip => {}
                Action::Perform(op) => self.perform(channel, &op).await?,
                Action::Authenticate => return Ok(Step::Authenticate),
                Action::PluginAll(_) => return Err(AuthError::NestedOperationNotSupported),
            }
        }
        Err(AuthError::ProtocolViolation(format!(
            "plugin {} produced more than {} operations",
            self.registration.name, MAX_PLUGIN_OPERATIONS
        )))
    }

    /// Ask the plugin which operation comes next
    fn ask(&mut self, seq: u32) -> Result<Option<AuthenticationOperation>> {
        match self.dispatch(AuthEvent::Question { seq })? {
            Outcome::Ok(None) => Ok(None),
            Outcome::Ok(Some(AuthValue::NextOperation(op))) => Ok(Some(op)),
            Outcome::Ok(Some(AuthValue::Response(_))) => Err(AuthError::ProtocolViolation(
                "plugin answered a question with a response".to_string(),
            )),
            outcome => Err(self.failed(outcome)),
        }
    }

    async fn perform(
        &mut self,
        channel: &mut dyn MessageChannel,
        op: &AuthenticationOperation,
    ) -> Result<()> {
        let opcode = match op.kind {
            OperationKind::Message => {
                channel.send(&frame(Opcode::Message, op.text())).await?;
                return Ok(());
            }
            OperationKind::Plain => Opcode::Plain,
            OperationKind::Hidden => Opcode::Hidden,
            OperationKind::Authenticate => return Ok(()),
            OperationKind::Plugin | OperationKind::PluginAll => {
                return Err(AuthError::ProtocolViolation(format!(
                    "unresolved {:?} operation",
                    op.kind
                )))
            }
        };

        channel.send(&frame(opcode, op.text())).await?;
        let msg = channel.recv_timeout(self.response_timeout).await?;
        let (received, payload) = split_frame(&msg)?;
        if received != Opcode::Response {
            return Err(AuthError::ProtocolViolation(format!(
                "expected response frame, got {:?}",
                received
            )));
        }

        let answer = String::from_utf8_lossy(payload).into_owned();
        self.responses.insert(op.seq, Secret::new(answer.clone()));
        let event = AuthEvent::Response {
            seq: op.seq,
            value: AuthValue::Response(answer),
        };
        match self.dispatch(event)? {
            Outcome::Ok(_) => Ok(()),
            outcome => Err(self.failed(outcome)),
        }
    }

    fn dispatch(&mut self, event: AuthEvent) -> Result<Outcome> {
        Ok(self
            .registry
            .dispatch_event(&self.registration.name, &mut self.ctx, event)?)
    }

    fn failed(&self, outcome: Outcome) -> AuthError {
        match outcome {
            Outcome::NoPluginsLoaded => {
                AuthError::PluginUnavailable(self.registration.name.clone())
            }
            Outcome::Canceled => {
                AuthError::Plugin(format!("{} canceled authentication", self.registration.name))
            }
            _ => AuthError::Plugin(format!("{} reported an error", self.registration.name)),
        }
    }
}

/// Initiator side of an interactive authentication
pub struct InteractiveClient<'a> {
    input: &'a mut dyn SecureInputSource,
    response_timeout: Duration,
    state: SessionState,
}

impl<'a> InteractiveClient<'a> {
    pub fn new(input: &'a mut dyn SecureInputSource, response_timeout: Duration) -> Self {
        Self {
            input,
            response_timeout,
            state: SessionState::AwaitingTrigger,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Answer prompts until `Finish`, then wait for the confirmation
    pub async fn run(&mut self, channel: &mut dyn MessageChannel, welcome: &str) -> Result<()> {
        let result = self.drive(channel, welcome).await;
        self.state = match result {
            Ok(()) => SessionState::Accepted,
            Err(_) => SessionState::Rejected,
        };
        result
    }

    async fn drive(&mut self, channel: &mut dyn MessageChannel, welcome: &str) -> Result<()> {
        if welcome.len() > 2 {
            self.input.display(&format!("> {}\n", welcome)).await?;
        }

        let mut prompts = 0usize;
        loop {
            self.state = SessionState::Looping(prompts);
            let msg = channel.recv_timeout(self.response_timeout).await?;
            // The rejection line starts with the Plain opcode byte
            let line = String::from_utf8_lossy(&msg);
            if is_rejection(&line) {
                return Err(rejection_error(&line));
            }
            let (opcode, payload) = split_frame(&msg)?;
            let text = String::from_utf8_lossy(payload);
            let text = trim_line(&text);

            match opcode {
                Opcode::Finish => break,
                Opcode::Message => self.input.display(&format!("{}\n", text)).await?,
                Opcode::Plain => {
                    let answer = self.input.read_plain(text).await?;
                    channel.send(&response_frame(&answer)).await?;
                }
                Opcode::Hidden => {
                    let answer = self.input.read_hidden(text).await?;
                    channel.send(&response_frame(&answer)).await?;
                }
                Opcode::Response => {
                    return Err(AuthError::ProtocolViolation(
                        "response frame sent by acceptor".to_string(),
                    ))
                }
            }
            prompts += 1;
        }

        self.state = SessionState::AwaitingFinalConfirmation;
        let confirmation = channel.recv_timeout(self.response_timeout).await?;
        let confirmation = String::from_utf8_lossy(&confirmation);
        if confirmation == AUTH_OK {
            return Ok(());
        }
        warn!(
            "Interactive authentication with {} refused: {}",
            channel.peer(),
            printable(&confirmation)
        );
        if is_rejection(&confirmation) {
            Err(rejection_error(&confirmation))
        } else {
            Err(AuthError::Rejected(printable(&confirmation)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use crate::input::ScriptedInput;
    use crate::plugin::AuthPlugin;
    use bsock::MemoryChannel;
    use std::sync::Arc;

    /// Plain login then hidden password, checked on Authenticate
    #[derive(Debug)]
    struct Login;

    impl AuthPlugin for Login {
        fn name(&self) -> &str {
            "login"
        }

        fn get_registration(
            &self,
            ctx: &mut PluginContext,
            _param: &str,
        ) -> std::result::Result<AuthenticationRegister, PluginError> {
            ctx.set_state(Vec::<String>::new());
            Ok(AuthenticationRegister {
                name: "login".to_string(),
                welcome: Some("Welcome to login".to_string()),
                operations: vec![
                    AuthenticationOperation::message(0, "Use your LDAP account"),
                    AuthenticationOperation::plain(1, "Login:"),
                    AuthenticationOperation::hidden(2, "Password:"),
                    AuthenticationOperation::authenticate(3),
                ],
                ttl: 0,
            })
        }

        fn handle_event(&self, ctx: &mut PluginContext, event: AuthEvent) -> Outcome {
            let Some(answers) = ctx.state_mut::<Vec<String>>() else {
                return Outcome::Error;
            };
            match event {
                AuthEvent::Response {
                    value: AuthValue::Response(answer),
                    ..
                } => {
                    answers.push(answer);
                    Outcome::Ok(None)
                }
                AuthEvent::Authenticate if answers[..] == ["alice", "wonderland"] => {
                    Outcome::Ok(None)
                }
                _ => Outcome::Error,
            }
        }
    }

    fn registry() -> AuthPluginRegistry {
        AuthPluginRegistry::builder().register(Arc::new(Login)).build()
    }

    async fn run_pair(answers: [&str; 2]) -> (Result<()>, Result<()>, ScriptedInput) {
        let registry = registry();
        let (mut server, mut client) = MemoryChannel::pair("console", "director");
        let mut session =
            InteractiveSession::new(&registry, "login", "operator", Duration::from_secs(180))
                .unwrap();
        let mut input = ScriptedInput::new(answers);

        let server_side = async {
            let result = session.run(&mut server).await;
            (result, session.state())
        };
        let client_side = async {
            let trigger = client.recv().await.unwrap();
            let welcome = parse_trigger(std::str::from_utf8(&trigger).unwrap())
                .unwrap()
                .to_string();
            let mut console = InteractiveClient::new(&mut input, Duration::from_secs(180));
            let result = console.run(&mut client, &welcome).await;
            (result, console.state())
        };
        let ((server_result, server_state), (client_result, client_state)) =
            tokio::join!(server_side, client_side);

        if server_result.is_ok() {
            assert_eq!(server_state, SessionState::Accepted);
            assert_eq!(client_state, SessionState::Accepted);
        } else {
            assert_eq!(server_state, SessionState::Rejected);
            assert_eq!(client_state, SessionState::Rejected);
        }
        (server_result, client_result, input)
    }

    #[test]
    fn test_opcodes_are_ascii_digits() {
        assert_eq!(Opcode::Finish.as_u8(), b'0');
        assert_eq!(Opcode::Response.as_u8(), b'4');
        assert_eq!(&frame(Opcode::Plain, "Login:")[..], b"1Login:\n");
        assert_eq!(&response_frame("alice")[..], b"4alice");
    }

    #[test]
    fn test_split_frame() {
        let (opcode, payload) = split_frame(b"2Password:\n").unwrap();
        assert_eq!(opcode, Opcode::Hidden);
        assert_eq!(payload, b"Password:\n");
        assert!(matches!(
            split_frame(b"9oops"),
            Err(AuthError::ProtocolViolation(_))
        ));
        assert!(matches!(split_frame(b""), Err(AuthError::MalformedMessage(_))));
    }

    #[test]
    fn test_parse_trigger() {
        assert_eq!(parse_trigger("auth interactive Hello there\n"), Some("Hello there"));
        assert_eq!(parse_trigger("auth interactive \n"), Some(""));
        assert_eq!(parse_trigger("auth interactive\n"), Some(""));
        assert_eq!(parse_trigger("auth interactiveX\n"), None);
        assert_eq!(parse_trigger("auth cram-md5 <1.2@dir> ssl=0\n"), None);
    }

    #[tokio::test]
    async fn test_matching_answers_accepted() {
        let (server, client, input) = run_pair(["alice", "wonderland"]).await;
        server.unwrap();
        client.unwrap();
        assert_eq!(input.prompts(), ["Login:", "Password:"]);
        assert_eq!(
            input.displayed(),
            ["> Welcome to login\n", "Use your LDAP account\n"]
        );
    }

    #[tokio::test]
    async fn test_wrong_answer_rejected() {
        let (server, client, _) = run_pair(["alice", "looking-glass"]).await;
        assert!(matches!(server, Err(AuthError::CredentialMismatch)));
        assert!(matches!(client, Err(AuthError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_non_response_frame_is_violation() {
        let registry = registry();
        let (mut server, mut client) = MemoryChannel::pair("console", "director");
        let mut session =
            InteractiveSession::new(&registry, "login", "operator", Duration::from_secs(180))
                .unwrap();

        let client_side = async {
            // trigger, message, plain prompt
            for _ in 0..3 {
                client.recv().await.unwrap();
            }
            client.send(b"3not an answer").await.unwrap();
        };
        let (result, _) = tokio::join!(session.run(&mut server), client_side);
        assert!(matches!(result, Err(AuthError::ProtocolViolation(_))));
        assert_eq!(session.state(), SessionState::Rejected);
        assert!(session.responses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_console_times_out() {
        let registry = registry();
        let (mut server, _client) = MemoryChannel::pair("console", "director");
        let mut session =
            InteractiveSession::new(&registry, "login", "operator", Duration::from_secs(180))
                .unwrap();
        let result = session.run(&mut server).await;
        assert!(matches!(result, Err(AuthError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_unknown_plugin() {
        let registry = registry();
        let result =
            InteractiveSession::new(&registry, "radius", "operator", Duration::from_secs(180));
        assert!(matches!(result, Err(AuthError::PluginUnavailable(_))));
    }

    #[tokio::test]
    async fn test_rejection_mid_prompt_is_not_a_prompt() {
        let (mut server, mut client) = MemoryChannel::pair("console", "director");
        server.send(&frame(Opcode::Plain, "Login:")).await.unwrap();
        server
            .send(crate::messages::REJECT_UNAUTHORIZED.as_bytes())
            .await
            .unwrap();

        let mut input = ScriptedInput::new(["alice", "spare"]);
        let mut console = InteractiveClient::new(&mut input, Duration::from_secs(180));
        let result = console.run(&mut client, "").await;
        assert!(matches!(result, Err(AuthError::Rejected(_))));
        assert_eq!(console.state(), SessionState::Rejected);
        assert_eq!(input.prompts(), ["Login:"]);
        assert_eq!(input.remaining(), 1);
    }

    #[tokio::test]
    async fn test_inexact_confirmation_rejected() {
        let (mut server, mut client) = MemoryChannel::pair("console", "director");
        server.send(&frame(Opcode::Finish, "")).await.unwrap();
        server.send(b"1000 OK auth \n").await.unwrap();

        let mut input = ScriptedInput::default();
        let mut console = InteractiveClient::new(&mut input, Duration::from_secs(180));
        let result = console.run(&mut client, "").await;
        assert!(matches!(result, Err(AuthError::Rejected(_))));
        assert_eq!(console.state(), SessionState::Rejected);
    }
}
