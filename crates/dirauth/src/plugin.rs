//! Authentication plugin contract and registry
//!
//! A plugin supplies an [`AuthenticationRegister`]: a welcome text and an
//! ordered list of operations the acceptor walks through with the console.
//! Answers are routed back to the one plugin that asked; events are never
//! broadcast because they carry secrets.
//!
//! The registry is built once at startup and shared read-only between
//! handshakes.

use crate::error::PluginError;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use tracing::debug;

/// Suffix of shared-object plugin names, cut off during normalisation
const PLUGIN_FILE_SUFFIX: &str = "-dir.so";
/// Separates the plugin name from its parameters
const PLUGIN_PARAM_SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Ask the plugin for the operation to run in place of this one
    Plugin,
    /// Keep asking the plugin until it has nothing more
    PluginAll,
    /// Display only
    Message,
    /// Prompt with visible input
    Plain,
    /// Prompt with masked input
    Hidden,
    /// Final check of everything collected
    Authenticate,
}

/// One step of an interactive authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationOperation {
    pub kind: OperationKind,
    pub question: Option<String>,
    /// Correlates a response with the prompt that asked for it
    pub seq: u32,
}

impl AuthenticationOperation {
    pub fn new(kind: OperationKind, seq: u32, question: Option<&str>) -> Self {
        Self {
            kind,
            question: question.map(str::to_string),
            seq,
        }
    }

    pub fn message(seq: u32, text: &str) -> Self {
        Self::new(OperationKind::Message, seq, Some(text))
    }

    pub fn plain(seq: u32, question: &str) -> Self {
        Self::new(OperationKind::Plain, seq, Some(question))
    }

    pub fn hidden(seq: u32, question: &str) -> Self {
        Self::new(OperationKind::Hidden, seq, Some(question))
    }

    pub fn plugin(seq: u32) -> Self {
        Self::new(OperationKind::Plugin, seq, None)
    }

    pub fn plugin_all(seq: u32) -> Self {
        Self::new(OperationKind::PluginAll, seq, None)
    }

    pub fn authenticate(seq: u32) -> Self {
        Self::new(OperationKind::Authenticate, seq, None)
    }

    /// Text shown to the console, empty when there is none
    pub fn text(&self) -> &str {
        self.question.as_deref().unwrap_or("")
    }
}

/// What a plugin exposes for interactive authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationRegister {
    pub name: String,
    pub welcome: Option<String>,
    pub operations: Vec<AuthenticationOperation>,
    /// Reserved
    pub ttl: u32,
}

impl AuthenticationRegister {
    fn validate(&self) -> Result<(), PluginError> {
        if self.name.is_empty() {
            return Err(PluginError::InvalidRegistration(
                "registration without a name".to_string(),
            ));
        }
        if self.operations.is_empty() {
            return Err(PluginError::InvalidRegistration(format!(
                "{} registers no operations",
                self.name
            )));
        }
        Ok(())
    }
}

/// Value exchanged with a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthValue {
    /// An answer typed by the console user
    Response(String),
    /// The operation the plugin wants run next
    NextOperation(AuthenticationOperation),
}

/// Events delivered to a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Which operation comes next? Answered with [`AuthValue::NextOperation`],
    /// or `Outcome::Ok(None)` when there is nothing more to ask.
    Question { seq: u32 },
    /// The console answered prompt `seq`
    Response { seq: u32, value: AuthValue },
    /// Everything has been collected; accept or refuse
    Authenticate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok(Option<AuthValue>),
    Error,
    Canceled,
    NoPluginsLoaded,
}

/// Per-session plugin state
///
/// Created for one authentication attempt and dropped with it, whatever the
/// outcome.
pub struct PluginContext {
    console: String,
    state: Option<Box<dyn Any + Send>>,
}

impl PluginContext {
    pub fn new(console: &str) -> Self {
        Self {
            console: console.to_string(),
            state: None,
        }
    }

    /// Name of the console being authenticated
    pub fn console(&self) -> &str {
        &self.console
    }

    pub fn set_state<T: Any + Send>(&mut self, state: T) {
        self.state = Some(Box::new(state));
    }

    pub fn state<T: Any + Send>(&self) -> Option<&T> {
        self.state.as_ref()?.downcast_ref()
    }

    pub fn state_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.state.as_mut()?.downcast_mut()
    }
}

impl Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("console", &self.console)
            .field("has_state", &self.state.is_some())
            .finish()
    }
}

/// An interactive authentication plugin
pub trait AuthPlugin: Send + Sync + Debug {
    /// Name the plugin is registered under
    fn name(&self) -> &str;

    /// Fresh per-session context
    fn new_context(&self, console: &str) -> PluginContext {
        PluginContext::new(console)
    }

    /// Registration for the console's plugin parameter
    fn get_registration(
        &self,
        ctx: &mut PluginContext,
        param: &str,
    ) -> Result<AuthenticationRegister, PluginError>;

    fn handle_event(&self, ctx: &mut PluginContext, event: AuthEvent) -> Outcome;
}

/// Cut a plugin parameter down to the name it is registered under
///
/// `ldap-dir.so` and `ldap:url=ldap://host` both become `ldap`.
pub fn normalize_plugin_name(param: &str) -> &str {
    if let Some(pos) = param.find(PLUGIN_FILE_SUFFIX) {
        &param[..pos]
    } else if let Some(pos) = param.find(PLUGIN_PARAM_SEPARATOR) {
        &param[..pos]
    } else {
        param
    }
}

/// Read-only map of loaded plugins
#[derive(Debug, Clone, Default)]
pub struct AuthPluginRegistry {
    plugins: Arc<HashMap<String, Arc<dyn AuthPlugin>>>,
}

impl AuthPluginRegistry {
    pub fn builder() -> AuthPluginRegistryBuilder {
        AuthPluginRegistryBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Plugin handling `param`, if loaded
    pub fn lookup(&self, param: &str) -> Option<&Arc<dyn AuthPlugin>> {
        self.plugins.get(normalize_plugin_name(param))
    }

    /// Context for a session with `param`'s plugin
    pub fn new_context(&self, param: &str, console: &str) -> Result<PluginContext, PluginError> {
        self.lookup(param)
            .map(|plugin| plugin.new_context(console))
            .ok_or_else(|| PluginError::NotRegistered(param.to_string()))
    }

    /// Registration of the plugin matching `param`
    ///
    /// `None` when no such plugin is loaded or it offers no usable
    /// registration.
    pub fn get_registration(
        &self,
        ctx: &mut PluginContext,
        param: &str,
    ) -> Option<AuthenticationRegister> {
        let plugin = self.lookup(param)?;
        match plugin
            .get_registration(ctx, param)
            .and_then(|reg| reg.validate().map(|_| reg))
        {
            Ok(registration) => Some(registration),
            Err(e) => {
                debug!("Plugin {} has no usable registration: {}", plugin.name(), e);
                None
            }
        }
    }

    /// Route one event to the plugin matching `param`
    pub fn dispatch_event(
        &self,
        param: &str,
        ctx: &mut PluginContext,
        event: AuthEvent,
    ) -> Result<Outcome, PluginError> {
        if self.plugins.is_empty() {
            return Ok(Outcome::NoPluginsLoaded);
        }
        let plugin = self
            .lookup(param)
            .ok_or_else(|| PluginError::NotRegistered(param.to_string()))?;
        Ok(plugin.handle_event(ctx, event))
    }
}

#[derive(Debug, Default)]
pub struct AuthPluginRegistryBuilder {
    plugins: HashMap<String, Arc<dyn AuthPlugin>>,
}

impl AuthPluginRegistryBuilder {
    /// Add a plugin; a later plugin with the same name replaces an earlier one
    pub fn register(mut self, plugin: Arc<dyn AuthPlugin>) -> Self {
        let name = normalize_plugin_name(plugin.name()).to_string();
        debug!("Registering authentication plugin {}", name);
        self.plugins.insert(name, plugin);
        self
    }

    pub fn build(self) -> AuthPluginRegistry {
        AuthPluginRegistry {
            plugins: Arc::new(self.plugins),
        }
    }
}
