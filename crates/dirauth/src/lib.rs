//! Director authentication protocol engine
//!
//! This crate runs the mutual authentication handshake between a backup
//! director and the consoles, file daemons and storage daemons that talk to
//! it. It covers both ends of the exchange over an abstract
//! [`bsock::MessageChannel`].
//!
//! # Features
//!
//! - Hello exchange with protocol version and TLS need advertisement
//! - Mutual CRAM-MD5 challenge/response with constant-time verification
//! - TLS/TLS-PSK policy negotiation, checked before any credential is sent
//! - Interactive plugin authentication (prompts, hidden input, final verdict)
//! - Uniform rejection with a deterrent delay on the acceptor side
//!
//! # Example
//!
//! ```rust,ignore
//! use dirauth::{AuthenticationEngine, AuthOptions, ClientConfig, ResourceTable};
//! use std::sync::Arc;
//!
//! let options = Arc::new(AuthOptions::default());
//!
//! // Director side
//! let mut engine = AuthenticationEngine::new(channel, options.clone()).with_plugins(plugins);
//! let session = engine.run_server_side(&resources).await?;
//!
//! // Console side
//! let config = ClientConfig::default_console("bacula-dir", "password");
//! let mut engine = AuthenticationEngine::new(channel, options);
//! let session = engine.run_client_side(&config, Some(&mut input)).await?;
//! assert!(session.compression);
//! ```

pub mod client;
pub mod config;
pub mod cram;
pub mod engine;
pub mod error;
pub mod input;
pub mod interactive;
pub mod messages;
pub mod plugin;
mod server;
pub mod timer;
pub mod tls;
pub mod types;

pub use client::*;
pub use config::*;
pub use cram::*;
pub use engine::*;
pub use error::*;
pub use input::*;
pub use interactive::*;
pub use messages::*;
pub use plugin::*;
pub use timer::*;
pub use tls::*;
pub use types::*;
