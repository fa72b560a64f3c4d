//! Adaptive worker queue subsystem.
//!
//! A tenant-aware task router in front of a small set of async worker
//! pools, each capable of autoscaling either on its own (internal
//! watermark-driven rules) or under the direction of an external
//! [`controller::AdaptiveController`]. See [`worker_queue::WorkerQueue`] for
//! the core queue/pool, [`controller::AdaptiveController`] for the external
//! sizing loop, and [`router::Router`] for tenant-to-queue dispatch.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod instrumentation;
pub mod rate_tracker;
pub mod router;
pub mod snapshot;
pub mod types;
pub mod worker_queue;

pub use config::{AdaptiveQueueConfig, ControllerConfig, QueuePolicy, RouterConfig, WorkerQueueConfig};
pub use controller::AdaptiveController;
pub use error::{QueueError, Result};
pub use events::{NullSink, QueueEventLogger, Severity, StructuredEventSink, TracingSink};
pub use instrumentation::{Instrumentation, InstrumentationSnapshot, SlowTaskReporter};
pub use rate_tracker::RateTracker;
pub use router::{EntitlementStore, Router};
pub use snapshot::{merge_queue_snapshots, QueueSnapshot};
pub use types::{AdaptivePlan, BoxFuture, Task, TaskKind, TaskMetadata, TaskRuntimeDetail, TenantId};
pub use worker_queue::WorkerQueue;
