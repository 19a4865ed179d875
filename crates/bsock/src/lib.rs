//! Message channel contract used by the director authentication engine
//!
//! The authentication code never touches sockets directly. It talks to a
//! [`MessageChannel`]: a blocking-style, message-framed duplex where every
//! `send` is delivered as exactly one `recv` on the other side. Transports
//! (TCP with length-prefixed frames, TLS wrappers, ...) live outside this
//! workspace and implement the trait.
//!
//! TLS negotiation is likewise opaque: a [`TlsContext`] is handed the channel
//! and either upgrades it or fails.
//!
//! [`MemoryChannel`] is an in-process pair useful for tests and for running
//! both ends of a handshake inside one process.

pub mod channel;
pub mod error;
pub mod memory;
pub mod tls;

pub use channel::*;
pub use error::*;
pub use memory::*;
pub use tls::*;
