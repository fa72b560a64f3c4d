//! # adaptive-queue
//!
//! A concurrent, self-tuning task execution engine: a bounded, shedding
//! work queue backed by a dynamically-sized worker pool, an external
//! controller that periodically re-sizes that pool from observed load, and
//! a tenant-aware router that picks a destination queue per task.
//!
//! Originally the core of a moderation system's media-scan pipeline (a
//! "free" tier with a small baseline pool and one or more "accelerated"
//! tiers with larger pools), lifted out as a standalone crate. See
//! [`queue::worker_queue::WorkerQueue`] for the queue/pool itself,
//! [`queue::controller::AdaptiveController`] for the external sizing loop,
//! and [`queue::router::Router`] for tenant-to-queue dispatch.
//!
//! ## Quick example
//!
//! ```rust,ignore
//! use adaptive_queue::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let sink = Arc::new(TracingSink);
//!     let queue = WorkerQueue::new("free", WorkerQueueConfig::default(), false, None, sink);
//!     queue.start().await;
//!     queue.enqueue(Task::new(
//!         TaskMetadata::new("scan-1", TenantId(42), TaskKind::Image),
//!         Box::pin(async { /* do the scan */ }),
//!     )).unwrap();
//!     queue.stop().await;
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod queue;

pub mod prelude {
    //! Convenient re-exports of the most commonly needed types.
    pub use crate::queue::{
        AdaptiveController, AdaptivePlan, AdaptiveQueueConfig, ControllerConfig, EntitlementStore,
        Instrumentation, NullSink, QueueError, QueuePolicy, QueueSnapshot, RateTracker, Result,
        Router, RouterConfig, Severity, SlowTaskReporter, StructuredEventSink, Task, TaskKind,
        TaskMetadata, TaskRuntimeDetail, TenantId, TracingSink, WorkerQueue, WorkerQueueConfig,
    };
}

/// Returns the current version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
