//! Listener sockets and session dispatch.
//!
//! A [`Listener`] owns one bound socket. Stream listeners accept
//! connections; datagram listeners treat each received datagram as one
//! bounded session. Either way the resulting session is offered to an idle
//! worker first and a new worker is spawned only when all are busy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::framing::FramingPolicy;
use crate::handler::HandlerFactory;
use crate::telemetry::counters;

use super::channel::{DatagramChannel, SessionChannel, SessionStats, StreamChannel, TcpWriter};
use super::registry::SharedSessionRegistry;
use super::worker::{ListenerContext, PacketObserver, SessionSetup, SessionWorker};

enum BoundSocket {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

/// One bound listener and its worker pool.
pub struct Listener {
    name: String,
    local_addr: SocketAddr,
    linger: Duration,
    recv_buffer: usize,
    socket: BoundSocket,
    factory: Arc<dyn HandlerFactory>,
    ctx: Arc<ListenerContext>,
    workers: StdMutex<Vec<Arc<SessionWorker>>>,
    shutdown: watch::Receiver<bool>,
}

impl Listener {
    /// Bind the listener socket and prepare the worker pool (empty until
    /// the first session arrives).
    pub async fn bind(
        config: &ListenerConfig,
        factory: Arc<dyn HandlerFactory>,
        registry: SharedSessionRegistry,
        observers: Vec<PacketObserver>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let addr = config.address();
        let policy = FramingPolicy::new(
            &config.framing,
            config.prompt.clone(),
            config.auto_prompt,
        );
        let recv_buffer = policy.max_length(None);

        let socket = if config.transport.is_stream() {
            let sock = if addr.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }
            .with_context(|| format!("listener '{}': socket create failed", config.name))?;
            sock.set_reuseaddr(true)
                .with_context(|| format!("listener '{}': reuseaddr failed", config.name))?;
            sock.bind(addr)
                .with_context(|| format!("listener '{}': bind {} failed", config.name, addr))?;
            let listener = sock
                .listen(config.backlog)
                .with_context(|| format!("listener '{}': listen failed", config.name))?;
            BoundSocket::Tcp(listener)
        } else {
            let socket = UdpSocket::bind(addr)
                .await
                .with_context(|| format!("listener '{}': bind {} failed", config.name, addr))?;
            BoundSocket::Udp(Arc::new(socket))
        };

        let local_addr = match &socket {
            BoundSocket::Tcp(l) => l.local_addr()?,
            BoundSocket::Udp(s) => s.local_addr()?,
        };

        let ctx = Arc::new(ListenerContext {
            name: config.name.clone(),
            transport: config.transport,
            local_port: local_addr.port(),
            policy,
            timeouts: config.timeouts.clone(),
            terminate_on_timeout: config.terminate_on_timeout,
            response_port: config.response_port,
            registry,
            observers,
            shutdown: shutdown.clone(),
        });

        Ok(Self {
            name: config.name.clone(),
            local_addr,
            linger: config.linger,
            recv_buffer,
            socket,
            factory,
            ctx,
            workers: StdMutex::new(Vec::new()),
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Actual bound address (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of workers spawned so far.
    pub fn pool_size(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Accept sessions until shutdown.
    pub async fn run(self: Arc<Self>) {
        let transport = if self.ctx.transport.is_stream() {
            "stream"
        } else {
            "datagram"
        };
        counters::listener_started(&self.name, transport);
        info!(
            listener = %self.name,
            addr = %self.local_addr,
            transport,
            "listener started"
        );

        match &self.socket {
            BoundSocket::Tcp(listener) => self.run_stream(listener).await,
            BoundSocket::Udp(socket) => self.run_datagram(socket).await,
        }

        info!(listener = %self.name, "listener stopped");
    }

    async fn run_stream(&self, listener: &TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        // linger applies to the eventual close; set it while
                        // we still hold the unsplit stream
                        if let Err(e) = stream.set_linger(Some(self.linger)) {
                            warn!(listener = %self.name, %peer, error = %e, "set_linger failed");
                        }
                        let stats = Arc::new(SessionStats::default());
                        let (read, write) = stream.into_split();
                        let writer = TcpWriter::new(write, Arc::clone(&stats));
                        let channel = SessionChannel::Stream(StreamChannel::new(
                            read,
                            peer,
                            self.shutdown.clone(),
                            stats,
                        ));
                        self.dispatch(SessionSetup {
                            channel,
                            writer: Some(writer),
                            handler: self.factory.session_handler(),
                        });
                    }
                    Err(e) => {
                        counters::listener_accept_error(&self.name);
                        warn!(listener = %self.name, error = %e, "accept failed");
                    }
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_datagram(&self, socket: &Arc<UdpSocket>) {
        let mut shutdown = self.shutdown.clone();
        let mut buf = vec![0u8; self.recv_buffer.max(1)];
        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => match res {
                    Ok((len, peer)) => {
                        let stats = Arc::new(SessionStats::default());
                        let channel = SessionChannel::Datagram(DatagramChannel::new(
                            buf[..len].to_vec(),
                            Arc::clone(socket),
                            peer,
                            stats,
                        ));
                        self.dispatch(SessionSetup {
                            channel,
                            writer: None,
                            handler: self.factory.session_handler(),
                        });
                    }
                    Err(e) => {
                        counters::listener_accept_error(&self.name);
                        warn!(listener = %self.name, error = %e, "recv failed");
                    }
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Offer the session to an idle worker; grow the pool when all are busy.
    fn dispatch(&self, setup: SessionSetup) {
        let mut setup = setup;
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.iter() {
            match worker.try_assign(setup) {
                Ok(()) => {
                    counters::worker_reused(&self.name);
                    debug!(listener = %self.name, worker = worker.id(), "session dispatched");
                    return;
                }
                Err(returned) => setup = returned,
            }
        }

        let worker = SessionWorker::spawn(workers.len(), Arc::clone(&self.ctx));
        if worker.try_assign(setup).is_err() {
            // freshly spawned workers start idle; this cannot happen
            warn!(listener = %self.name, "dropped session: no worker slot");
            return;
        }
        counters::worker_spawned(&self.name);
        debug!(
            listener = %self.name,
            worker = worker.id(),
            pool = workers.len() + 1,
            "worker spawned"
        );
        workers.push(worker);
    }
}
