//! Transport-neutral byte channels.
//!
//! The session read loop consumes bytes one at a time through
//! [`SessionChannel`] without knowing whether they come from a TCP stream or
//! an already-received UDP datagram. Writes go through [`TcpWriter`] (stream)
//! or [`DatagramChannel::send`] (datagram response to the peer).

use std::future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// Channel-level read failure. Packet-relative context (which byte of the
/// packet was pending) is attached one level up, in the session loop.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The deadline expired before a byte arrived.
    #[error("read timeout")]
    Timeout,

    /// The peer closed the stream, or the datagram payload is exhausted.
    #[error("end of stream")]
    Eos,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Server-initiated shutdown interrupted the read.
    #[error("server shutting down")]
    Closed,
}

/// Per-session byte counters, shared between the session loop, the write
/// paths, and the handler's live back-reference.
#[derive(Debug, Default)]
pub struct SessionStats {
    read: AtomicU64,
    written: AtomicU64,
    available: AtomicUsize,
}

impl SessionStats {
    pub fn add_read(&self, n: u64) {
        self.read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: u64) {
        self.written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub(crate) fn set_available(&self, n: usize) {
        self.available.store(n, Ordering::Relaxed);
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }
}

/// Serialized write handle to a TCP session.
///
/// Cloned into the session registry so external writes interleave safely
/// with the session loop's own responses.
#[derive(Clone)]
pub struct TcpWriter {
    inner: Arc<Mutex<OwnedWriteHalf>>,
    stats: Arc<SessionStats>,
}

impl TcpWriter {
    pub fn new(write: OwnedWriteHalf, stats: Arc<SessionStats>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(write)),
            stats,
        }
    }

    pub async fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut half = self.inner.lock().await;
        half.write_all(data).await?;
        half.flush().await?;
        self.stats.add_written(data.len() as u64);
        Ok(())
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => future::pending().await,
    }
}

/// Read side of an accepted TCP connection.
pub struct StreamChannel {
    read: OwnedReadHalf,
    buf: BytesMut,
    shutdown: watch::Receiver<bool>,
    peer: SocketAddr,
    peer_closed: bool,
    stats: Arc<SessionStats>,
}

impl StreamChannel {
    pub fn new(
        read: OwnedReadHalf,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            read,
            buf: BytesMut::with_capacity(1024),
            shutdown,
            peer,
            peer_closed: false,
            stats,
        }
    }

    fn take_buffered(&mut self) -> Option<u8> {
        if self.buf.is_empty() {
            return None;
        }
        let b = self.buf.get_u8();
        self.stats.add_read(1);
        self.stats.set_available(self.buf.len());
        Some(b)
    }

    async fn read_byte(&mut self, deadline: Option<Instant>) -> Result<u8, ReadError> {
        loop {
            if let Some(b) = self.take_buffered() {
                return Ok(b);
            }
            if self.peer_closed {
                return Err(ReadError::Eos);
            }
            tokio::select! {
                res = self.read.read_buf(&mut self.buf) => {
                    if res? == 0 {
                        self.peer_closed = true;
                        return Err(ReadError::Eos);
                    }
                }
                _ = self.shutdown.changed() => return Err(ReadError::Closed),
                _ = sleep_until_or_forever(deadline) => return Err(ReadError::Timeout),
            }
        }
    }

    /// Non-blocking fill; returns the number of buffered, unread bytes.
    fn available(&mut self) -> usize {
        loop {
            self.buf.reserve(1024);
            match self.read.try_read_buf(&mut self.buf) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(_) => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        self.stats.set_available(self.buf.len());
        self.buf.len()
    }
}

/// One received UDP datagram, presented as a bounded byte stream. Responses
/// go out through the listener's own socket so the source port the client
/// sees matches the port it sent to.
pub struct DatagramChannel {
    payload: Vec<u8>,
    pos: usize,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    stats: Arc<SessionStats>,
}

impl DatagramChannel {
    pub fn new(
        payload: Vec<u8>,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        stats: Arc<SessionStats>,
    ) -> Self {
        stats.set_available(payload.len());
        Self {
            payload,
            pos: 0,
            socket,
            peer,
            stats,
        }
    }

    fn read_byte(&mut self) -> Result<u8, ReadError> {
        if self.pos >= self.payload.len() {
            return Err(ReadError::Eos);
        }
        let b = self.payload[self.pos];
        self.pos += 1;
        self.stats.add_read(1);
        self.stats.set_available(self.payload.len() - self.pos);
        Ok(b)
    }

    fn available(&self) -> usize {
        self.payload.len() - self.pos
    }

    /// Send a response datagram to the peer address on the given port.
    pub async fn send(&self, data: &[u8], port: u16) -> std::io::Result<()> {
        let dest = SocketAddr::new(self.peer.ip(), port);
        self.socket.send_to(data, dest).await?;
        self.stats.add_written(data.len() as u64);
        Ok(())
    }
}

/// The byte source for one session.
pub enum SessionChannel {
    Stream(StreamChannel),
    Datagram(DatagramChannel),
}

impl SessionChannel {
    pub fn is_stream(&self) -> bool {
        matches!(self, SessionChannel::Stream(_))
    }

    pub fn peer(&self) -> SocketAddr {
        match self {
            SessionChannel::Stream(s) => s.peer,
            SessionChannel::Datagram(d) => d.peer,
        }
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        match self {
            SessionChannel::Stream(s) => Arc::clone(&s.stats),
            SessionChannel::Datagram(d) => Arc::clone(&d.stats),
        }
    }

    /// Read one byte, waiting at most until `deadline` (forever if `None`).
    pub async fn read_byte(&mut self, deadline: Option<Instant>) -> Result<u8, ReadError> {
        match self {
            SessionChannel::Stream(s) => s.read_byte(deadline).await,
            SessionChannel::Datagram(d) => d.read_byte(),
        }
    }

    /// Bytes readable right now without blocking.
    pub fn available(&mut self) -> usize {
        match self {
            SessionChannel::Stream(s) => s.available(),
            SessionChannel::Datagram(d) => d.available(),
        }
    }

    /// True once the underlying source can produce no further bytes.
    pub fn exhausted(&self) -> bool {
        match self {
            SessionChannel::Stream(s) => s.peer_closed && s.buf.is_empty(),
            SessionChannel::Datagram(d) => d.pos >= d.payload.len(),
        }
    }
}
