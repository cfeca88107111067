//! sessiond - protocol-agnostic TCP/UDP server session engine.
//!
//! The engine accepts stream connections and datagram packets on configured
//! endpoints, hands each to a reusable session worker, and delegates framing
//! decisions and response generation to a pluggable [`handler::PacketHandler`].
//!
//! Architecture:
//! - Listeners bind to addresses and accept connections/datagrams
//! - Session workers are reused across sessions (reuse before spawn)
//! - The session registry supports asynchronous writes into live TCP sessions
//! - A shutdown handle closes listeners and unwinds in-flight sessions

pub mod bootstrap;
pub mod config;
pub mod framing;
pub mod handler;
pub mod listener;
pub mod telemetry;

pub use bootstrap::{Server, Shutdown};
pub use config::{Config, Transport};
pub use handler::{HandlerFactory, PacketHandler, PacketLength, SessionInfo};
pub use listener::{Listener, SessionError, SessionRegistry, SharedSessionRegistry};
