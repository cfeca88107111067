//! Session workers and the per-session read loop.
//!
//! Each worker is a persistent task with a single session slot: the acceptor
//! offers new sessions to an idle worker before spawning another one, so a
//! steady connection rate settles on a stable worker pool. The read loop
//! frames packets one byte at a time (line mode or handler-driven binary
//! mode), dispatches them to the handler, and writes responses back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{TimeoutConfig, Transport};
use crate::framing::{FramingPolicy, PatternMatcher};
use crate::handler::{PacketLength, SessionInfo, SharedHandler};
use crate::telemetry::counters;

use super::channel::{ReadError, SessionChannel, TcpWriter};
use super::registry::SharedSessionRegistry;

/// Why a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The handler requested termination, or a packet observer stopped it.
    Normal,
    /// The peer closed the connection between packets.
    PeerClosed,
    /// No first byte arrived within the idle timeout.
    IdleTimeout,
    /// The datagram payload was fully consumed.
    DatagramComplete,
    /// Server shutdown interrupted the session.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::DatagramComplete => "datagram_complete",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Session-fatal failure.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The absolute session deadline expired.
    #[error("session deadline exceeded")]
    SessionTimeout,

    /// A packet stalled mid-read past the packet timeout.
    #[error("read timeout after {at_byte} byte(s) of a packet")]
    ReadTimeout { at_byte: usize },

    /// The stream ended in the middle of a packet.
    #[error("end of stream after {at_byte} byte(s) of a packet")]
    EndOfStream { at_byte: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The handler rejected a packet; fatal to the session.
    #[error("handler error: {0}")]
    Handler(anyhow::Error),

    /// Server shutdown interrupted the session.
    #[error("server shutting down")]
    Closed,
}

/// Observes every framed packet before it reaches the handler. Returning
/// `false` ends the session through the normal termination path.
pub type PacketObserver = Arc<dyn Fn(SocketAddr, &[u8]) -> bool + Send + Sync>;

/// Everything a worker needs about its listener, shared by all workers of
/// one listener.
pub(crate) struct ListenerContext {
    pub name: String,
    pub transport: Transport,
    pub local_port: u16,
    pub policy: FramingPolicy,
    pub timeouts: TimeoutConfig,
    pub terminate_on_timeout: bool,
    pub response_port: Option<u16>,
    pub registry: SharedSessionRegistry,
    pub observers: Vec<PacketObserver>,
    pub shutdown: watch::Receiver<bool>,
}

/// One session's worth of channel, write handle, and handler, bundled for
/// hand-off to a worker.
pub(crate) struct SessionSetup {
    pub channel: SessionChannel,
    pub writer: Option<TcpWriter>,
    pub handler: SharedHandler,
}

enum Slot {
    Idle,
    Pending(Box<SessionSetup>),
    Active,
}

/// A persistent session-running task with a single hand-off slot.
pub(crate) struct SessionWorker {
    id: usize,
    slot: StdMutex<Slot>,
    notify: Notify,
}

impl SessionWorker {
    pub fn spawn(id: usize, ctx: Arc<ListenerContext>) -> Arc<Self> {
        let worker = Arc::new(Self {
            id,
            slot: StdMutex::new(Slot::Idle),
            notify: Notify::new(),
        });
        let runner = Arc::clone(&worker);
        tokio::spawn(async move {
            runner.run(ctx).await;
        });
        worker
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Offer a session to this worker; fails (returning the session back)
    /// if the worker is busy.
    pub fn try_assign(&self, setup: SessionSetup) -> Result<(), SessionSetup> {
        let mut slot = self.slot.lock().unwrap();
        if matches!(*slot, Slot::Idle) {
            *slot = Slot::Pending(Box::new(setup));
            drop(slot);
            self.notify.notify_one();
            Ok(())
        } else {
            Err(setup)
        }
    }

    fn take_pending(&self) -> Option<Box<SessionSetup>> {
        let mut slot = self.slot.lock().unwrap();
        if matches!(*slot, Slot::Pending(_)) {
            if let Slot::Pending(setup) = std::mem::replace(&mut *slot, Slot::Active) {
                return Some(setup);
            }
        }
        None
    }

    async fn run(self: Arc<Self>, ctx: Arc<ListenerContext>) {
        let mut shutdown = ctx.shutdown.clone();
        loop {
            let setup = loop {
                if let Some(setup) = self.take_pending() {
                    break setup;
                }
                if *shutdown.borrow() {
                    debug!(listener = %ctx.name, worker = self.id, "worker exiting");
                    return;
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    res = shutdown.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            };

            run_session(&ctx, self.id, *setup).await;
            *self.slot.lock().unwrap() = Slot::Idle;
        }
    }
}

/// Drive one session from start to close.
async fn run_session(ctx: &ListenerContext, worker_id: usize, setup: SessionSetup) {
    let SessionSetup {
        mut channel,
        writer,
        handler,
    } = setup;

    let peer = channel.peer();
    let stats = channel.stats();
    let transport = ctx.transport;

    counters::session_accepted(
        &ctx.name,
        if transport.is_stream() { "stream" } else { "datagram" },
    );
    debug!(
        listener = %ctx.name,
        %peer,
        worker = worker_id,
        "session started"
    );

    let registration = ctx
        .registry
        .register(Arc::clone(&handler), writer.clone())
        .await;

    {
        let info = SessionInfo::new(
            transport,
            peer,
            ctx.local_port,
            worker_id,
            Arc::clone(&stats),
            writer.clone(),
        );
        let mut h = handler.lock().await;
        h.set_session_info(Some(info));
        h.session_started(peer, transport, ctx.policy.is_text()).await;
    }

    let result = session_loop(ctx, &mut channel, &writer, &handler).await;

    {
        let mut h = handler.lock().await;
        if let Some(data) = h.final_packet(result.is_err()).await {
            drop(h);
            if let Err(e) = write_response(ctx, &channel, &writer, &handler, &data).await {
                warn!(listener = %ctx.name, %peer, error = %e, "final packet write failed");
            }
            h = handler.lock().await;
        }
        h.session_terminated(
            result.as_ref().err(),
            stats.bytes_read(),
            stats.bytes_written(),
        )
        .await;
        h.set_session_info(None);
    }

    ctx.registry.unregister(registration).await;

    match &result {
        Ok(reason) => {
            counters::session_closed(&ctx.name, reason.as_str());
            info!(
                listener = %ctx.name,
                %peer,
                worker = worker_id,
                reason = reason.as_str(),
                bytes_read = stats.bytes_read(),
                bytes_written = stats.bytes_written(),
                "session closed"
            );
        }
        Err(e) => {
            counters::session_closed(&ctx.name, "error");
            warn!(
                listener = %ctx.name,
                %peer,
                worker = worker_id,
                error = %e,
                bytes_read = stats.bytes_read(),
                bytes_written = stats.bytes_written(),
                "session failed"
            );
        }
    }
    // dropping the channel and writer closes the connection; SO_LINGER was
    // applied at accept time
}

async fn session_loop(
    ctx: &ListenerContext,
    channel: &mut SessionChannel,
    writer: &Option<TcpWriter>,
    handler: &SharedHandler,
) -> Result<CloseReason, SessionError> {
    let is_stream = channel.is_stream();
    let session_deadline = ctx.timeouts.session.map(|d| Instant::now() + d);

    let (min_len, max_len) = {
        let h = handler.lock().await;
        let max = ctx.policy.max_length(h.maximum_packet_length());
        let min = ctx.policy.min_length(h.minimum_packet_length(), max);
        (min, max)
    };

    if is_stream {
        let initial = handler.lock().await.initial_packet().await;
        if let Some(data) = initial {
            write_response(ctx, channel, writer, handler, &data).await?;
        }
    }

    let mut packet_index: u64 = 0;
    loop {
        if session_deadline.is_some_and(|d| Instant::now() >= d) {
            counters::session_timeout(&ctx.name, "session");
            return Err(SessionError::SessionTimeout);
        }
        if handler.lock().await.terminate_session() {
            return Ok(CloseReason::Normal);
        }
        if is_stream && channel.exhausted() {
            return Ok(CloseReason::PeerClosed);
        }

        if is_stream {
            if let Some(prompt) = ctx.policy.prompt(packet_index) {
                write_response(ctx, channel, writer, handler, &prompt).await?;
            }
        }

        let mut reader = PacketReader {
            channel: &mut *channel,
            policy: &ctx.policy,
            session_deadline,
            idle: ctx.timeouts.idle,
            packet: ctx.timeouts.packet,
            packet_deadline: None,
            terminate_on_timeout: ctx.terminate_on_timeout,
            min_len,
            max_len,
            is_stream,
        };

        let packet = if ctx.policy.is_text() {
            reader.read_line().await
        } else {
            reader.read_packet(handler).await
        };

        let packet = match packet {
            Ok(p) => p,
            Err(SessionError::ReadTimeout { at_byte }) => {
                if at_byte == 0 {
                    counters::session_timeout(&ctx.name, "idle");
                    return Ok(CloseReason::IdleTimeout);
                }
                counters::session_timeout(&ctx.name, "packet");
                if ctx.terminate_on_timeout {
                    return Err(SessionError::ReadTimeout { at_byte });
                }
                warn!(
                    listener = %ctx.name,
                    at_byte,
                    "packet read timed out, discarding partial packet"
                );
                continue;
            }
            Err(SessionError::EndOfStream { at_byte }) => {
                if !is_stream {
                    return Ok(CloseReason::DatagramComplete);
                }
                if at_byte == 0 {
                    return Ok(CloseReason::PeerClosed);
                }
                return Err(SessionError::EndOfStream { at_byte });
            }
            Err(SessionError::Closed) => return Ok(CloseReason::Shutdown),
            Err(e) => return Err(e),
        };

        packet_index += 1;
        counters::packet_received(&ctx.name);

        let peer = channel.peer();
        for observer in &ctx.observers {
            if !observer(peer, &packet) {
                debug!(listener = %ctx.name, %peer, "packet observer stopped session");
                return Ok(CloseReason::Normal);
            }
        }

        // empty packets (e.g. a bare terminator in line mode) are still
        // delivered; the handler decides what they mean
        let response = handler
            .lock()
            .await
            .handle_packet(&packet)
            .await
            .map_err(SessionError::Handler)?;

        if !response.is_empty() {
            write_response(ctx, channel, writer, handler, &response).await?;
            counters::response_sent(&ctx.name);
        }

        if handler.lock().await.terminate_session() {
            return Ok(CloseReason::Normal);
        }
        if !is_stream && channel.exhausted() {
            return Ok(CloseReason::DatagramComplete);
        }
    }
}

/// Route outbound bytes: TCP sessions through the serialized writer,
/// datagram sessions back out the listener socket. The datagram response
/// port precedence is handler override, then listener config, then the
/// inbound source port.
async fn write_response(
    ctx: &ListenerContext,
    channel: &SessionChannel,
    writer: &Option<TcpWriter>,
    handler: &SharedHandler,
    data: &[u8],
) -> Result<(), SessionError> {
    if data.is_empty() {
        return Ok(());
    }
    if let Some(w) = writer {
        w.write(data).await?;
        return Ok(());
    }
    if let SessionChannel::Datagram(d) = channel {
        let port = {
            let h = handler.lock().await;
            h.response_port()
                .or(ctx.response_port)
                .unwrap_or_else(|| channel.peer().port())
        };
        d.send(data, port).await?;
    }
    Ok(())
}

/// Reads one packet from the channel, byte by byte.
struct PacketReader<'a> {
    channel: &'a mut SessionChannel,
    policy: &'a FramingPolicy,
    session_deadline: Option<Instant>,
    idle: Option<Duration>,
    packet: Option<Duration>,
    /// Absolute completion deadline, fixed when the packet's first byte
    /// arrives. A slow peer cannot extend it byte by byte.
    packet_deadline: Option<Instant>,
    terminate_on_timeout: bool,
    min_len: usize,
    max_len: usize,
    is_stream: bool,
}

enum BinaryMode {
    /// Reading toward `actual_len`, then ask the handler again.
    Consult,
    /// Length is settled; read to `actual_len` and stop.
    Fixed,
    /// Read until a line-terminator byte (or the maximum).
    UntilTerminator,
    /// Read until a line-terminator byte, then re-consult the handler.
    IncrementalTerminator,
    /// Absorbing whatever was immediately available; EOS is benign.
    Drain,
}

impl PacketReader<'_> {
    /// Per-read deadline: the idle timeout applies while waiting for the
    /// packet's first byte; after that the fixed packet deadline governs.
    /// Both are capped by the session deadline.
    fn deadline(&self) -> Option<Instant> {
        let per_packet = match self.packet_deadline {
            Some(d) => Some(d),
            None => self.idle.map(|d| Instant::now() + d),
        };
        match (self.session_deadline, per_packet) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    /// A timeout that actually hit the session deadline escalates.
    fn timeout_error(&self, at_byte: usize) -> SessionError {
        if self.session_deadline.is_some_and(|d| Instant::now() >= d) {
            SessionError::SessionTimeout
        } else {
            SessionError::ReadTimeout { at_byte }
        }
    }

    async fn next_byte(&mut self, at_byte: usize) -> Result<u8, SessionError> {
        let deadline = self.deadline();
        match self.channel.read_byte(deadline).await {
            Ok(b) => {
                if self.packet_deadline.is_none() {
                    self.packet_deadline = self.packet.map(|d| Instant::now() + d);
                }
                Ok(b)
            }
            Err(ReadError::Timeout) => Err(self.timeout_error(at_byte)),
            Err(ReadError::Eos) => Err(SessionError::EndOfStream { at_byte }),
            Err(ReadError::Closed) => Err(SessionError::Closed),
            Err(ReadError::Io(e)) => Err(SessionError::Io(e)),
        }
    }

    /// Text mode: one line per packet. Ignore bytes are dropped, backspace
    /// erases (prompted sessions only), control bytes other than tab are
    /// discarded, and the terminator is omitted unless configured otherwise.
    async fn read_line(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut data: Vec<u8> = Vec::new();
        loop {
            match self.next_byte(data.len()).await {
                Ok(b) => {
                    if self.policy.is_line_terminator(b) {
                        if self.policy.include_terminator() {
                            data.push(b);
                        }
                        return Ok(data);
                    }
                    if self.policy.is_ignored(b) {
                        continue;
                    }
                    if self.policy.is_backspace(b) {
                        data.pop();
                        continue;
                    }
                    if b < 0x20 && b != b'\t' {
                        continue;
                    }
                    data.push(b);
                    if data.len() >= self.max_len {
                        return Ok(data);
                    }
                }
                Err(SessionError::ReadTimeout { at_byte }) => {
                    // an unterminated partial line, even an empty one, is
                    // still a packet when timeouts are not session-fatal
                    if !self.terminate_on_timeout {
                        return Ok(data);
                    }
                    return Err(SessionError::ReadTimeout { at_byte });
                }
                Err(SessionError::EndOfStream { at_byte }) => {
                    if !self.is_stream && at_byte > 0 {
                        // end of datagram terminates the final line
                        return Ok(data);
                    }
                    return Err(SessionError::EndOfStream { at_byte });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Binary mode: read to the minimum length, then let the handler steer
    /// (exact length, terminator, increment, or drain-what-is-available).
    /// A configured terminator pattern bypasses the handler entirely.
    async fn read_packet(&mut self, handler: &SharedHandler) -> Result<Vec<u8>, SessionError> {
        if let Some(pattern) = self.policy.terminator_pattern() {
            let mut matcher = PatternMatcher::new(pattern);
            return self.read_until_pattern(&mut matcher).await;
        }

        let mut packet: Vec<u8> = Vec::new();
        let mut actual_len = self.min_len.min(self.max_len);
        let mut mode = BinaryMode::Consult;
        let mut fail_on_eos = self.is_stream;

        loop {
            if packet.len() >= actual_len || packet.len() >= self.max_len {
                match mode {
                    BinaryMode::Consult => {
                        if packet.len() >= self.max_len {
                            return Ok(packet);
                        }
                        let declared = handler.lock().await.actual_packet_length(&packet);
                        match declared {
                            PacketLength::Exact(n) => {
                                if n <= packet.len() {
                                    if n < packet.len() {
                                        warn!(
                                            declared = n,
                                            read = packet.len(),
                                            "declared packet length is behind bytes already read"
                                        );
                                    }
                                    return Ok(packet);
                                }
                                if n > self.max_len {
                                    warn!(
                                        declared = n,
                                        max = self.max_len,
                                        "declared packet length exceeds maximum, clamping"
                                    );
                                    actual_len = self.max_len;
                                } else {
                                    actual_len = n;
                                }
                                mode = BinaryMode::Fixed;
                            }
                            PacketLength::LineTerminator => {
                                // the last byte read may already terminate it
                                if packet
                                    .last()
                                    .is_some_and(|&b| self.policy.is_line_terminator(b))
                                {
                                    if !self.policy.include_terminator() {
                                        packet.pop();
                                    }
                                    return Ok(packet);
                                }
                                actual_len = self.max_len;
                                mode = BinaryMode::UntilTerminator;
                            }
                            PacketLength::IncrementUntilLineTerminator => {
                                actual_len = self.max_len;
                                mode = BinaryMode::IncrementalTerminator;
                            }
                            PacketLength::Increment(n) => {
                                // guarantee progress even when the handler
                                // asks for a length already reached
                                actual_len = n.max(packet.len() + 1).min(self.max_len);
                            }
                            PacketLength::EndOfStream => {
                                let available = self.channel.available();
                                actual_len = (packet.len() + available).min(self.max_len);
                                fail_on_eos = false;
                                if actual_len <= packet.len() {
                                    return Ok(packet);
                                }
                                mode = BinaryMode::Drain;
                            }
                        }
                    }
                    _ => return Ok(packet),
                }
                continue;
            }

            match self.next_byte(packet.len()).await {
                Ok(b) => {
                    let seeking_terminator = matches!(
                        mode,
                        BinaryMode::UntilTerminator | BinaryMode::IncrementalTerminator
                    );
                    if seeking_terminator && self.policy.is_ignored(b) {
                        continue;
                    }
                    if seeking_terminator && self.policy.is_line_terminator(b) {
                        if matches!(mode, BinaryMode::UntilTerminator) {
                            if self.policy.include_terminator() {
                                packet.push(b);
                            }
                            return Ok(packet);
                        }
                        // incremental mode keeps the terminator: the handler
                        // re-inspects the buffer with it in place
                        packet.push(b);
                        actual_len = packet.len();
                        mode = BinaryMode::Consult;
                    } else {
                        packet.push(b);
                    }
                }
                Err(SessionError::EndOfStream { at_byte }) if !fail_on_eos => {
                    if at_byte == 0 && packet.is_empty() {
                        return Err(SessionError::EndOfStream { at_byte });
                    }
                    return Ok(packet);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_until_pattern(
        &mut self,
        matcher: &mut PatternMatcher,
    ) -> Result<Vec<u8>, SessionError> {
        let mut packet: Vec<u8> = Vec::new();
        loop {
            let b = self.next_byte(packet.len()).await?;
            packet.push(b);
            if matcher.push(b) || packet.len() >= self.max_len {
                return Ok(packet);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FramingConfig;
    use crate::handler::PacketHandler;
    use crate::listener::channel::{DatagramChannel, SessionStats, StreamChannel};
    use async_trait::async_trait;
    use tokio::net::UdpSocket;
    use tokio::sync::Mutex;

    struct LengthHandler {
        length: PacketLength,
    }

    #[async_trait]
    impl PacketHandler for LengthHandler {
        fn actual_packet_length(&mut self, _packet: &[u8]) -> PacketLength {
            self.length
        }

        async fn handle_packet(&mut self, _packet: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn shared(length: PacketLength) -> SharedHandler {
        Arc::new(Mutex::new(Box::new(LengthHandler { length }) as Box<dyn PacketHandler>))
    }

    /// Returns each scripted length in turn, repeating the last one.
    struct ScriptedHandler {
        script: Vec<PacketLength>,
        pos: usize,
    }

    #[async_trait]
    impl PacketHandler for ScriptedHandler {
        fn actual_packet_length(&mut self, _packet: &[u8]) -> PacketLength {
            let length = self.script[self.pos.min(self.script.len() - 1)];
            self.pos += 1;
            length
        }

        async fn handle_packet(&mut self, _packet: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn scripted(script: Vec<PacketLength>) -> SharedHandler {
        Arc::new(Mutex::new(
            Box::new(ScriptedHandler { script, pos: 0 }) as Box<dyn PacketHandler>
        ))
    }

    async fn datagram(payload: &[u8]) -> SessionChannel {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let stats = Arc::new(SessionStats::default());
        SessionChannel::Datagram(DatagramChannel::new(payload.to_vec(), socket, peer, stats))
    }

    fn reader<'a>(
        channel: &'a mut SessionChannel,
        policy: &'a FramingPolicy,
        min_len: usize,
        max_len: usize,
    ) -> PacketReader<'a> {
        let is_stream = channel.is_stream();
        PacketReader {
            channel,
            policy,
            session_deadline: None,
            idle: None,
            packet: None,
            packet_deadline: None,
            terminate_on_timeout: true,
            min_len,
            max_len,
            is_stream,
        }
    }

    fn text_policy() -> FramingPolicy {
        FramingPolicy::new(&FramingConfig::default(), None, false)
    }

    fn binary_policy(pattern: Option<Vec<u8>>) -> FramingPolicy {
        let framing = FramingConfig {
            text: false,
            terminator_pattern: pattern,
            ..Default::default()
        };
        FramingPolicy::new(&framing, None, false)
    }

    #[tokio::test]
    async fn test_read_line_splits_on_terminator() {
        let mut channel = datagram(b"hello\r\nworld\n").await;
        let policy = text_policy();

        let mut r = reader(&mut channel, &policy, 1, 2048);
        assert_eq!(r.read_line().await.unwrap(), b"hello");

        let mut r = reader(&mut channel, &policy, 1, 2048);
        assert_eq!(r.read_line().await.unwrap(), b"world");

        let mut r = reader(&mut channel, &policy, 1, 2048);
        assert!(matches!(
            r.read_line().await,
            Err(SessionError::EndOfStream { at_byte: 0 })
        ));
    }

    #[tokio::test]
    async fn test_read_line_returns_empty_for_bare_terminator() {
        let mut channel = datagram(b"\n").await;
        let policy = text_policy();
        let mut r = reader(&mut channel, &policy, 1, 2048);
        assert_eq!(r.read_line().await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_read_line_drops_control_bytes_keeps_tab() {
        let mut channel = datagram(b"a\x01b\tc\n").await;
        let policy = text_policy();
        let mut r = reader(&mut channel, &policy, 1, 2048);
        assert_eq!(r.read_line().await.unwrap(), b"ab\tc");
    }

    #[tokio::test]
    async fn test_read_line_partial_at_end_of_datagram() {
        let mut channel = datagram(b"no-terminator").await;
        let policy = text_policy();
        let mut r = reader(&mut channel, &policy, 1, 2048);
        assert_eq!(r.read_line().await.unwrap(), b"no-terminator");
    }

    #[tokio::test]
    async fn test_read_packet_exact_length() {
        let mut channel = datagram(b"aaaaabbbbbccccc").await;
        let policy = binary_policy(None);
        let handler = shared(PacketLength::Exact(5));

        for expected in [b"aaaaa", b"bbbbb", b"ccccc"] {
            let mut r = reader(&mut channel, &policy, 1, 1024);
            assert_eq!(r.read_packet(&handler).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_read_packet_drains_available_on_eos_sentinel() {
        let mut channel = datagram(&[0x42; 20]).await;
        let policy = binary_policy(None);
        let handler = shared(PacketLength::EndOfStream);

        let mut r = reader(&mut channel, &policy, 1, 1024);
        let packet = r.read_packet(&handler).await.unwrap();
        assert_eq!(packet.len(), 20);
    }

    #[tokio::test]
    async fn test_read_packet_exact_clamped_to_max() {
        let mut channel = datagram(&[0x01; 32]).await;
        let policy = binary_policy(None);
        let handler = shared(PacketLength::Exact(1000));

        let mut r = reader(&mut channel, &policy, 1, 8);
        let packet = r.read_packet(&handler).await.unwrap();
        assert_eq!(packet.len(), 8);
    }

    #[tokio::test]
    async fn test_read_packet_terminator_pattern() {
        let mut channel = datagram(b"payload##!rest").await;
        let policy = binary_policy(Some(b"##!".to_vec()));
        let handler = shared(PacketLength::EndOfStream);

        let mut r = reader(&mut channel, &policy, 1, 1024);
        let packet = r.read_packet(&handler).await.unwrap();
        assert_eq!(packet, b"payload##!");
    }

    #[tokio::test]
    async fn test_read_packet_line_terminator_mode() {
        let mut channel = datagram(b"ab:cdef\nxx").await;
        let policy = binary_policy(None);
        let handler = shared(PacketLength::LineTerminator);

        // consult at min length, then read to the terminator
        let mut r = reader(&mut channel, &policy, 3, 1024);
        let packet = r.read_packet(&handler).await.unwrap();
        assert_eq!(packet, b"ab:cdef");
    }

    #[tokio::test]
    async fn test_read_packet_strips_terminator_already_in_buffer() {
        // the terminator can land inside the minimum-length read; it is
        // still stripped from the returned packet
        let mut channel = datagram(b"ab\nxx").await;
        let policy = binary_policy(None);
        let handler = shared(PacketLength::LineTerminator);

        let mut r = reader(&mut channel, &policy, 3, 1024);
        assert_eq!(r.read_packet(&handler).await.unwrap(), b"ab");
    }

    #[tokio::test]
    async fn test_read_packet_terminator_mode_skips_ignore_bytes() {
        let mut channel = datagram(b"ab\rcd\nxx").await;
        let policy = binary_policy(None);
        let handler = shared(PacketLength::LineTerminator);

        let mut r = reader(&mut channel, &policy, 2, 1024);
        assert_eq!(r.read_packet(&handler).await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_read_packet_incremental_keeps_terminator() {
        // variable-length header up to the terminator, then the handler
        // sees the terminator in the buffer and settles the full length
        let mut channel = datagram(b"hdr\n2ab").await;
        let policy = binary_policy(None);
        let handler = scripted(vec![
            PacketLength::IncrementUntilLineTerminator,
            PacketLength::Exact(7),
        ]);

        let mut r = reader(&mut channel, &policy, 1, 1024);
        assert_eq!(r.read_packet(&handler).await.unwrap(), b"hdr\n2ab");
    }

    #[tokio::test]
    async fn test_read_packet_increment_extends_then_settles() {
        let mut channel = datagram(b"12345678xx").await;
        let policy = binary_policy(None);
        let handler = scripted(vec![PacketLength::Increment(4), PacketLength::Exact(8)]);

        let mut r = reader(&mut channel, &policy, 2, 1024);
        assert_eq!(r.read_packet(&handler).await.unwrap(), b"12345678");
    }

    #[tokio::test]
    async fn test_read_packet_increment_always_advances() {
        // an increment at or below the bytes already read still consumes
        // input instead of returning the same short packet forever
        let mut channel = datagram(b"abcdef").await;
        let policy = binary_policy(None);
        let handler = shared(PacketLength::Increment(1));

        let mut r = reader(&mut channel, &policy, 1, 1024);
        assert_eq!(r.read_packet(&handler).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_read_line_empty_on_non_fatal_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let peer = server.peer_addr().unwrap();
        let (read_half, _write_half) = server.into_split();
        let (_tx, rx) = watch::channel(false);
        let stats = Arc::new(SessionStats::default());
        let mut channel = SessionChannel::Stream(StreamChannel::new(read_half, peer, rx, stats));

        let policy = text_policy();
        let mut r = reader(&mut channel, &policy, 1, 2048);
        r.idle = Some(Duration::from_millis(100));
        r.terminate_on_timeout = false;

        // nothing sent: the idle timeout yields an empty packet instead of
        // an error when timeouts are not session-fatal
        assert_eq!(r.read_line().await.unwrap(), b"");
        drop(client);
    }

    #[tokio::test]
    async fn test_packet_deadline_fixed_at_first_byte() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let peer = server.peer_addr().unwrap();
        let (read_half, _write_half) = server.into_split();
        let (_tx, rx) = watch::channel(false);
        let stats = Arc::new(SessionStats::default());
        let mut channel = SessionChannel::Stream(StreamChannel::new(read_half, peer, rx, stats));

        // drip one byte at a time, each gap shorter than the packet window
        let writer = tokio::spawn(async move {
            let (_r, mut w) = client.into_split();
            for b in *b"abcdefghij" {
                if w.write_all(&[b]).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        let policy = text_policy();
        let mut r = reader(&mut channel, &policy, 1, 2048);
        r.idle = Some(Duration::from_secs(1));
        r.packet = Some(Duration::from_millis(250));

        let started = Instant::now();
        let result = r.read_line().await;
        assert!(
            matches!(result, Err(SessionError::ReadTimeout { at_byte }) if at_byte > 0),
            "expected a mid-packet timeout, got {result:?}"
        );
        // the deadline must not slide forward with each dripped byte
        assert!(started.elapsed() < Duration::from_millis(700));
        writer.abort();
    }
}
