//! Server assembly and lifecycle.

mod server;
mod shutdown;

pub use server::Server;
pub use shutdown::Shutdown;
