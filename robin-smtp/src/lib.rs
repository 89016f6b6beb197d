//! SMTP/ESMTP/LMTP server and client halves of the Robin MTA.
//!
//! The server side covers the wire codec, the per-connection session state
//! machine, the extension dispatch registry, DoS admission controls and the
//! proxy engine. The client side is the outbound ESMTP/LMTP exchange used by
//! the relay engine and the LMTP connection pool.

pub mod auth;
pub mod client;
pub mod command;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod extensions;
pub mod listener;
pub mod proxy;
pub mod rbl;
pub mod session;
pub mod sink;
pub mod state;
pub mod tracker;
pub mod verbs;
pub mod webhook;

pub use command::Command;
pub use dispatch::Registry;
pub use listener::Listener;
pub use session::{ServerSession, SessionConfig};
pub use state::State;
