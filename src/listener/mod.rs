//! Listeners, session workers, channels, and the live-session registry.

pub mod channel;

mod acceptor;
mod registry;
mod worker;

pub use acceptor::Listener;
pub use registry::{SessionRegistry, SharedSessionRegistry};
pub use worker::{CloseReason, PacketObserver, SessionError};
