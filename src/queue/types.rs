//! Core data types shared across the adaptive worker queue subsystem.
//!
//! Mirrors the dataclasses of the originating Python implementation
//! (`TaskMetadata`, `TaskRuntimeDetail`, `AdaptivePlan`) as plain, cheaply
//! cloneable Rust value types.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Instant, SystemTime};

/// A boxed, type-erased unit of work. The queue never inspects its contents;
/// it only drives the future to completion.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The three task kinds the router distinguishes for tier selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Image,
    Video,
    Text,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::Image => "image",
            TaskKind::Video => "video",
            TaskKind::Text => "text",
        };
        f.write_str(s)
    }
}

/// Opaque tenant/guild identifier. A newtype keeps call sites from mixing up
/// tenant ids with arbitrary `u64`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(pub u64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Diagnostics captured at enqueue time. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct TaskMetadata {
    /// Human-readable name for logs and alerts.
    pub display_name: String,
    /// Source file the task was enqueued from, if known.
    pub source_file: Option<String>,
    /// Source line the task was enqueued from, if known.
    pub source_line: Option<u32>,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Task kind.
    pub kind: TaskKind,
}

impl TaskMetadata {
    pub fn new(display_name: impl Into<String>, tenant_id: TenantId, kind: TaskKind) -> Self {
        Self {
            display_name: display_name.into(),
            source_file: None,
            source_line: None,
            tenant_id,
            kind,
        }
    }

    pub fn with_source(mut self, file: impl Into<String>, line: u32) -> Self {
        self.source_file = Some(file.into());
        self.source_line = Some(line);
        self
    }

    /// Formats `file:line` if both are present.
    pub fn source_location(&self) -> Option<String> {
        match (&self.source_file, self.source_line) {
            (Some(file), Some(line)) => Some(format!("{file}:{line}")),
            _ => None,
        }
    }
}

/// A task admitted to a [`crate::queue::worker_queue::WorkerQueue`] backlog.
pub struct Task {
    pub metadata: TaskMetadata,
    pub future: BoxFuture,
}

impl Task {
    pub fn new(metadata: TaskMetadata, future: BoxFuture) -> Self {
        Self { metadata, future }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Queue occupancy/sizing state captured at one of the three points in a
/// task's lifecycle (enqueue, start, finish).
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStateSample {
    pub backlog: usize,
    pub active_workers: usize,
    pub busy_workers: usize,
    pub max_workers: usize,
    pub autoscale_max: usize,
}

/// Captured at task completion: metadata, wait/run durations, and a
/// snapshot of queue state at enqueue/start/finish. Immutable; consumed by
/// instrumentation and alert reporters. Cheap to clone and share.
#[derive(Debug, Clone)]
pub struct TaskRuntimeDetail {
    pub metadata: TaskMetadata,
    /// Time spent waiting in the backlog (start - enqueue).
    pub wait: f64,
    /// Time spent executing (completion - start).
    pub runtime: f64,
    pub enqueued_at: Instant,
    pub started_at: Instant,
    pub completed_at: Instant,
    pub started_at_wall: SystemTime,
    pub completed_at_wall: SystemTime,
    pub backlog_at_enqueue: usize,
    pub state_at_start: QueueStateSample,
    pub backlog_at_finish: usize,
}

impl TaskRuntimeDetail {
    /// Queue's advertised worker ceiling at the moment this task started.
    pub fn max_workers(&self) -> usize {
        self.state_at_start.max_workers
    }

    /// The burst ceiling in effect when this task started.
    pub fn autoscale_max(&self) -> usize {
        self.state_at_start.autoscale_max
    }
}

/// A sizing/watermark plan issued by the [`crate::queue::controller::AdaptiveController`]
/// and consumed by [`crate::queue::worker_queue::WorkerQueue::apply_plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptivePlan {
    pub target_workers: usize,
    pub baseline_workers: usize,
    pub backlog_high: Option<usize>,
    pub backlog_low: Option<usize>,
    pub backlog_hard_limit: Option<usize>,
    pub backlog_shed_to: Option<usize>,
}
