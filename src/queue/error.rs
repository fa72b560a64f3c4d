//! Error types for the adaptive worker queue subsystem.

use thiserror::Error;

/// Result type alias used throughout the `queue` module.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors surfaced to producers by the worker queue and router.
///
/// Operational errors (scaling, shedding, reporter failures) are not
/// represented here: they are logged via [`crate::queue::events::StructuredEventSink`]
/// and never propagate to task producers, per the propagation policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// `enqueue` was called after `stop()` returned.
    #[error("queue '{0}' is stopped")]
    QueueStopped(String),

    /// The task was dropped by backlog shedding before a worker could run it.
    #[error("task shed from queue '{0}' backlog (hard limit exceeded)")]
    TaskShed(String),

    /// A router-imposed deadline elapsed before the task completed.
    #[error("task timed out after {timeout_secs:.1}s on queue '{queue}'")]
    TimedOut {
        /// Destination queue name.
        queue: String,
        /// Configured deadline, in seconds.
        timeout_secs: f64,
    },
}
