//! Structured event emission for the worker queue subsystem.
//!
//! Every operationally significant change (scale up/down, shedding, plan
//! recomputation, reporter failure) flows through a [`StructuredEventSink`]
//! rather than being logged ad hoc, so a host application can choose to
//! mirror warnings/errors to an external channel without threading that
//! concern through every call site.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

/// Severity of a structured event, mirroring the originating notifier's
/// `info`/`warning`/`error`/`debug` levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Receives structured events emitted by the queue, controller, and router.
///
/// Implementations must not block or panic; a sink that needs to reach an
/// external system (webhook, chat channel) should dispatch asynchronously
/// and swallow its own delivery failures, the way the originating
/// notifier's developer-channel dispatch does.
pub trait StructuredEventSink: Send + Sync {
    fn emit(&self, severity: Severity, event_key: &str, message: &str, fields: &[(&str, String)]);
}

/// Forwards every event to `tracing`, at a level matching its severity. The
/// default sink used when a host does not need external dispatch.
pub struct TracingSink;

impl StructuredEventSink for TracingSink {
    fn emit(&self, severity: Severity, event_key: &str, message: &str, fields: &[(&str, String)]) {
        let fields_str = format_fields(fields);
        match severity {
            Severity::Debug => debug!(event = event_key, fields = %fields_str, "{message}"),
            Severity::Info => info!(event = event_key, fields = %fields_str, "{message}"),
            Severity::Warning => warn!(event = event_key, fields = %fields_str, "{message}"),
            Severity::Error => error!(event = event_key, fields = %fields_str, "{message}"),
        }
    }
}

/// Discards every event. Useful in tests that don't care about log output.
pub struct NullSink;

impl StructuredEventSink for NullSink {
    fn emit(&self, _severity: Severity, _event_key: &str, _message: &str, _fields: &[(&str, String)]) {}
}

fn format_fields(fields: &[(&str, String)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Narrow, semantically-named wrapper over a [`StructuredEventSink`] for the
/// events the worker queue and controller emit on their own behalf. Keeps
/// call sites free of repeated event-key string literals.
#[derive(Clone)]
pub struct QueueEventLogger {
    sink: Arc<dyn StructuredEventSink>,
}

impl QueueEventLogger {
    pub fn new(sink: Arc<dyn StructuredEventSink>) -> Self {
        Self { sink }
    }

    pub fn scaled_up(&self, queue: &str, from: usize, to: usize) {
        self.sink.emit(
            Severity::Info,
            "queue_scaled_up",
            &format!("queue '{queue}' scaled up {from} -> {to} workers"),
            &[("queue", queue.to_string()), ("from", from.to_string()), ("to", to.to_string())],
        );
    }

    pub fn scaled_down(&self, queue: &str, from: usize, to: usize) {
        self.sink.emit(
            Severity::Info,
            "queue_scaled_down",
            &format!("queue '{queue}' scaled down {from} -> {to} workers"),
            &[("queue", queue.to_string()), ("from", from.to_string()), ("to", to.to_string())],
        );
    }

    pub fn adaptive_plan_updated(&self, queue: &str, summary: &str) {
        self.sink.emit(
            Severity::Debug,
            "adaptive_plan_updated",
            &format!("queue '{queue}' adaptive plan updated: {summary}"),
            &[("queue", queue.to_string())],
        );
    }

    pub fn backlog_shed(&self, queue: &str, dropped: usize, backlog_before: usize) {
        self.sink.emit(
            Severity::Warning,
            "backlog_shed",
            &format!("queue '{queue}' shed {dropped} tasks (backlog was {backlog_before})"),
            &[
                ("queue", queue.to_string()),
                ("dropped", dropped.to_string()),
                ("backlog_before", backlog_before.to_string()),
            ],
        );
    }

    pub fn autoscale_ceiling_raised(&self, queue: &str, from: usize, to: usize) {
        self.sink.emit(
            Severity::Info,
            "autoscale_ceiling_raised",
            &format!("queue '{queue}' autoscale ceiling raised {from} -> {to}"),
            &[("queue", queue.to_string()), ("from", from.to_string()), ("to", to.to_string())],
        );
    }

    pub fn autoscale_ceiling_reset(&self, queue: &str, from: usize, to: usize) {
        self.sink.emit(
            Severity::Debug,
            "autoscale_ceiling_reset",
            &format!("queue '{queue}' autoscale ceiling reset {from} -> {to}"),
            &[("queue", queue.to_string()), ("from", from.to_string()), ("to", to.to_string())],
        );
    }

    pub fn task_failed(&self, queue: &str, task_name: &str, error: &str) {
        self.sink.emit(
            Severity::Warning,
            "task_failed",
            &format!("task '{task_name}' on queue '{queue}' failed: {error}"),
            &[("queue", queue.to_string()), ("task", task_name.to_string())],
        );
    }

    pub fn failover(&self, from_queue: &str, to_queue: &str, reason: &str) {
        self.sink.emit(
            Severity::Warning,
            "router_failover",
            &format!("router failing over from '{from_queue}' to '{to_queue}': {reason}"),
            &[("from", from_queue.to_string()), ("to", to_queue.to_string())],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingSink {
        events: Mutex<Vec<(Severity, String)>>,
    }

    impl StructuredEventSink for RecordingSink {
        fn emit(&self, severity: Severity, event_key: &str, _message: &str, _fields: &[(&str, String)]) {
            self.events.lock().push((severity, event_key.to_string()));
        }
    }

    #[test]
    fn logger_forwards_event_key_and_severity() {
        let sink = Arc::new(RecordingSink { events: Mutex::new(Vec::new()) });
        let logger = QueueEventLogger::new(sink.clone());
        logger.scaled_up("free", 2, 4);
        logger.backlog_shed("free", 3, 20);

        let events = sink.events.lock();
        assert_eq!(events[0], (Severity::Info, "queue_scaled_up".to_string()));
        assert_eq!(events[1], (Severity::Warning, "backlog_shed".to_string()));
    }
}
