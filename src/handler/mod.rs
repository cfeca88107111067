//! Packet handler contract.
//!
//! The engine calls into the handler, never the reverse: the handler decides
//! packet lengths in binary mode, turns framed packets into response bytes,
//! and receives the session lifecycle hooks. One handler instance serves one
//! session at a time; a [`HandlerFactory`] hands out the instance per session.

mod echo;

pub use echo::EchoHandler;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::Transport;
use crate::listener::channel::{SessionStats, TcpWriter};
use crate::listener::SessionError;

/// Answer to "what is the actual/next expected packet length, given the
/// bytes read so far?" — consulted in binary mode once the minimum packet
/// length has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLength {
    /// The packet is exactly this many bytes long. If fewer bytes were read
    /// the engine keeps reading to this length; if more were already read
    /// the current buffer is accepted as-is (logged as an inconsistency).
    Exact(usize),

    /// Read until a configured line-terminator byte (for the remainder of
    /// this packet only).
    LineTerminator,

    /// Read whatever is immediately buffered on the channel (bounded by the
    /// maximum length) and stop; a subsequent read timeout is benign.
    EndOfStream,

    /// Read until the next line-terminator byte, then ask again (for
    /// protocols with a variable-length header before the length field).
    IncrementUntilLineTerminator,

    /// Read until at least this many total bytes are present, then ask again.
    Increment(usize),
}

/// The pluggable application-side contract.
///
/// Most methods have defaults matching a passive handler; `handle_packet`
/// is the only required method for simple protocols.
#[async_trait]
pub trait PacketHandler: Send {
    /// Called once when the session starts, before any read.
    async fn session_started(&mut self, _peer: SocketAddr, _transport: Transport, _text: bool) {}

    /// The engine injects a live back-reference at session start and clears
    /// it (with `None`) at session end to break the reference cycle.
    fn set_session_info(&mut self, _info: Option<SessionInfo>) {}

    /// Used only by the session registry's external-write lookup.
    fn matches_session_id(&self, _session_id: &str) -> bool {
        false
    }

    /// Optional bytes pushed to the client before any read (stream only).
    async fn initial_packet(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Per-session minimum packet length override; `None` = server default.
    fn minimum_packet_length(&self) -> Option<usize> {
        None
    }

    /// Per-session maximum packet length override; `None` = server default.
    fn maximum_packet_length(&self) -> Option<usize> {
        None
    }

    /// Binary-mode length consultation; must be deterministic with respect
    /// to its input for a given session.
    fn actual_packet_length(&mut self, _packet: &[u8]) -> PacketLength {
        PacketLength::EndOfStream
    }

    /// The request/response step. An error is fatal to the session.
    async fn handle_packet(&mut self, packet: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Datagram response port override; `None` = the inbound source port
    /// (or the listener's configured override).
    fn response_port(&self) -> Option<u16> {
        None
    }

    /// Polled after several lifecycle points; `true` ends the session at
    /// the next safe checkpoint.
    fn terminate_session(&self) -> bool {
        false
    }

    /// Last chance to emit bytes before the channel closes.
    async fn final_packet(&mut self, _had_error: bool) -> Option<Vec<u8>> {
        None
    }

    /// Terminal notification with the session's byte counters.
    async fn session_terminated(
        &mut self,
        _error: Option<&SessionError>,
        _bytes_read: u64,
        _bytes_written: u64,
    ) {
    }
}

/// A handler shared between the session worker and the session registry.
pub type SharedHandler = Arc<Mutex<Box<dyn PacketHandler>>>;

/// Supplies the handler instance for each new session.
///
/// Returning a fresh handler per call is the normal mode; a factory may
/// instead clone one shared instance to mirror single-instance handlers
/// (the engine serializes all calls through the handler lock either way).
pub trait HandlerFactory: Send + Sync {
    fn session_handler(&self) -> SharedHandler;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn PacketHandler> + Send + Sync,
{
    fn session_handler(&self) -> SharedHandler {
        Arc::new(Mutex::new((self)()))
    }
}

/// Live back-reference handed to the handler for the duration of a session.
#[derive(Clone)]
pub struct SessionInfo {
    transport: Transport,
    peer: SocketAddr,
    local_port: u16,
    worker_id: usize,
    stats: Arc<SessionStats>,
    writer: Option<TcpWriter>,
}

impl SessionInfo {
    pub(crate) fn new(
        transport: Transport,
        peer: SocketAddr,
        local_port: u16,
        worker_id: usize,
        stats: Arc<SessionStats>,
        writer: Option<TcpWriter>,
    ) -> Self {
        Self {
            transport,
            peer,
            local_port,
            worker_id,
            stats,
            writer,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_stream(&self) -> bool {
        self.transport.is_stream()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn remote_port(&self) -> u16 {
        self.peer.port()
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Identity of the worker driving this session.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn bytes_read(&self) -> u64 {
        self.stats.bytes_read()
    }

    pub fn bytes_written(&self) -> u64 {
        self.stats.bytes_written()
    }

    /// Unread bytes currently buffered on the channel.
    pub fn available_bytes(&self) -> usize {
        self.stats.available()
    }

    /// Write bytes synchronously to the session's TCP stream. Returns false
    /// for datagram sessions, empty data, or write failure. Safe to call
    /// from outside the session loop; writes are serialized on the channel.
    pub async fn tcp_write(&self, data: &[u8]) -> bool {
        let Some(writer) = &self.writer else {
            return false;
        };
        if data.is_empty() {
            return false;
        }
        writer.write(data).await.is_ok()
    }
}
