//! Server bootstrap: binds listeners, wires handlers, runs until shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::handler::{EchoHandler, HandlerFactory, PacketHandler};
use crate::listener::{Listener, PacketObserver, SessionRegistry, SharedSessionRegistry};

use super::shutdown::Shutdown;

/// The session server: a set of listeners sharing a registry and a
/// shutdown signal.
pub struct Server {
    config: Config,
    factories: HashMap<String, Arc<dyn HandlerFactory>>,
    observers: Vec<PacketObserver>,
    registry: SharedSessionRegistry,
    shutdown: Shutdown,
    listeners: Vec<Arc<Listener>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let mut factories: HashMap<String, Arc<dyn HandlerFactory>> = HashMap::new();
        let echo = || Box::new(EchoHandler::new()) as Box<dyn PacketHandler>;
        factories.insert("echo".to_string(), Arc::new(echo));

        Self {
            config,
            factories,
            observers: Vec::new(),
            registry: SessionRegistry::new(),
            shutdown: Shutdown::new(),
            listeners: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Register a handler factory under the name listeners refer to in
    /// their `handler` field.
    pub fn register_handler(&mut self, name: &str, factory: Arc<dyn HandlerFactory>) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Observe every framed packet across all listeners.
    pub fn add_observer(&mut self, observer: PacketObserver) {
        self.observers.push(observer);
    }

    /// Registry handle for server-initiated session writes.
    pub fn registry(&self) -> SharedSessionRegistry {
        Arc::clone(&self.registry)
    }

    /// Listeners bound by `start` (empty before).
    pub fn listeners(&self) -> &[Arc<Listener>] {
        &self.listeners
    }

    pub fn shutdown_handle(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Bind and start all configured listeners.
    pub async fn start(&mut self) -> Result<()> {
        for listener_config in &self.config.listeners {
            let factory = match self.factories.get(&listener_config.handler) {
                Some(f) => Arc::clone(f),
                None => bail!(
                    "listener '{}': no handler registered under '{}'",
                    listener_config.name,
                    listener_config.handler
                ),
            };

            let listener = Listener::bind(
                listener_config,
                factory,
                Arc::clone(&self.registry),
                self.observers.clone(),
                self.shutdown.subscribe(),
            )
            .await
            .with_context(|| format!("failed to start listener '{}'", listener_config.name))?;

            let listener = Arc::new(listener);
            self.tasks.push(tokio::spawn(Arc::clone(&listener).run()));
            self.listeners.push(listener);
        }

        info!(listeners = self.listeners.len(), "server started");
        Ok(())
    }

    /// Block until SIGINT or SIGTERM.
    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "sigterm handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received ctrl-c");
        }
    }

    /// Trigger shutdown and wait for listeners to stop accepting. Running
    /// sessions observe the signal on their next read.
    pub async fn stop(&mut self) {
        self.shutdown.trigger();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("server stopped");
    }

    /// Start, run until a termination signal, then stop.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.wait_for_signal().await;
        self.stop().await;
        Ok(())
    }
}
