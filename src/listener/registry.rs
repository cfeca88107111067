//! Registry of live sessions, for server-initiated writes.
//!
//! Sessions register on start and unregister on close. An external caller
//! (command dispatcher, admin surface) can push bytes to the TCP session
//! whose handler claims a given session id. Lookups scan linearly; session
//! counts are small and writes are rare.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::handler::SharedHandler;
use crate::telemetry::counters;

use super::channel::TcpWriter;

struct Entry {
    id: u64,
    handler: SharedHandler,
    writer: Option<TcpWriter>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    next_id: u64,
}

/// Shared handle to a listener group's session registry.
pub type SharedSessionRegistry = Arc<SessionRegistry>;

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> SharedSessionRegistry {
        Arc::new(Self::default())
    }

    /// Register a session; the returned token unregisters it.
    pub async fn register(&self, handler: SharedHandler, writer: Option<TcpWriter>) -> u64 {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(Entry {
            id,
            handler,
            writer,
        });
        id
    }

    pub async fn unregister(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        inner.entries.retain(|e| e.id != id);
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Write bytes to the session whose handler claims `session_id`.
    /// Returns false when no session matches, the matching session has no
    /// write path (datagram), or the write fails.
    pub async fn write_to_session(&self, session_id: &str, data: &[u8]) -> bool {
        // snapshot under the registry lock, scan without it: a session busy
        // in its handler must not stall register/unregister
        let entries: Vec<(SharedHandler, Option<TcpWriter>)> = {
            let inner = self.inner.lock().await;
            inner
                .entries
                .iter()
                .map(|e| (Arc::clone(&e.handler), e.writer.clone()))
                .collect()
        };

        let mut writer = None;
        for (handler, entry_writer) in entries {
            if handler.lock().await.matches_session_id(session_id) {
                writer = entry_writer;
                break;
            }
        }

        let Some(writer) = writer else {
            counters::registry_write(false);
            debug!(session_id, "no writable session matched");
            return false;
        };

        counters::registry_write(true);
        match writer.write(data).await {
            Ok(()) => true,
            Err(e) => {
                debug!(session_id, error = %e, "session write failed");
                false
            }
        }
    }
}
