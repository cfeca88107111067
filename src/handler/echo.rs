use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::Transport;

use super::{PacketHandler, SessionInfo};

/// Echoes every packet back to the peer. The default handler for listeners
/// with no registered factory; also doubles as a wire-level smoke test.
#[derive(Default)]
pub struct EchoHandler {
    peer: Option<SocketAddr>,
    info: Option<SessionInfo>,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PacketHandler for EchoHandler {
    async fn session_started(&mut self, peer: SocketAddr, transport: Transport, text: bool) {
        self.peer = Some(peer);
        info!(%peer, ?transport, text, "echo session started");
    }

    fn set_session_info(&mut self, info: Option<SessionInfo>) {
        self.info = info;
    }

    async fn handle_packet(&mut self, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
        debug!(
            peer = ?self.peer,
            len = packet.len(),
            "echoing packet"
        );
        Ok(packet.to_vec())
    }

    async fn session_terminated(
        &mut self,
        error: Option<&crate::listener::SessionError>,
        bytes_read: u64,
        bytes_written: u64,
    ) {
        info!(
            peer = ?self.peer,
            bytes_read,
            bytes_written,
            error = error.map(|e| e.to_string()),
            "echo session terminated"
        );
    }
}
