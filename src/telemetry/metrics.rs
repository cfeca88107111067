//! Metric counters for the session engine.
//!
//! Thin helpers over the `metrics` facade; the embedding application decides
//! which recorder (if any) to install.

/// Counter helpers, keyed by listener name.
pub mod counters {
    pub fn listener_started(listener: &str, transport: &str) {
        metrics::counter!(
            "sessiond.listener.started",
            "listener" => listener.to_string(),
            "transport" => transport.to_string()
        )
        .increment(1);
    }

    pub fn listener_accept_error(listener: &str) {
        metrics::counter!(
            "sessiond.listener.accept_errors",
            "listener" => listener.to_string()
        )
        .increment(1);
    }

    pub fn session_accepted(listener: &str, transport: &str) {
        metrics::counter!(
            "sessiond.sessions.accepted",
            "listener" => listener.to_string(),
            "transport" => transport.to_string()
        )
        .increment(1);
    }

    pub fn session_closed(listener: &str, reason: &str) {
        metrics::counter!(
            "sessiond.sessions.closed",
            "listener" => listener.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn worker_spawned(listener: &str) {
        metrics::counter!(
            "sessiond.workers.spawned",
            "listener" => listener.to_string()
        )
        .increment(1);
    }

    pub fn worker_reused(listener: &str) {
        metrics::counter!(
            "sessiond.workers.reused",
            "listener" => listener.to_string()
        )
        .increment(1);
    }

    pub fn packet_received(listener: &str) {
        metrics::counter!(
            "sessiond.packets.received",
            "listener" => listener.to_string()
        )
        .increment(1);
    }

    pub fn response_sent(listener: &str) {
        metrics::counter!(
            "sessiond.responses.sent",
            "listener" => listener.to_string()
        )
        .increment(1);
    }

    pub fn session_timeout(listener: &str, kind: &str) {
        metrics::counter!(
            "sessiond.sessions.timeouts",
            "listener" => listener.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn registry_write(found: bool) {
        metrics::counter!(
            "sessiond.registry.writes",
            "result" => if found { "hit" } else { "miss" }
        )
        .increment(1);
    }
}
