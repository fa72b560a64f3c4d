//! Per-queue wait/runtime statistics and singular-slow-task alerting.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::events::{Severity, StructuredEventSink};
use super::types::TaskRuntimeDetail;

/// Invoked for the "singular slow task" alert: a task on a queue with
/// `max_workers <= 1` and `autoscale_max <= 1` ran longer than the
/// configured threshold. Implementations typically render an
/// operator-channel message; failures must never crash the caller.
#[async_trait]
pub trait SlowTaskReporter: Send + Sync {
    async fn report(&self, detail: &TaskRuntimeDetail, queue_name: &str);
}

/// A point-in-time read of all numeric aggregates Instrumentation tracks,
/// plus the retained last/longest runtime details.
#[derive(Debug, Clone, Default)]
pub struct InstrumentationSnapshot {
    pub dropped_total: u64,
    pub tasks_completed: u64,
    pub avg_runtime: f64,
    pub avg_wait: f64,
    pub ema_runtime: f64,
    pub ema_wait: f64,
    pub last_runtime: f64,
    pub last_wait: f64,
    pub longest_runtime: f64,
    pub longest_wait: f64,
    pub last_runtime_detail: Option<Arc<TaskRuntimeDetail>>,
    pub longest_runtime_detail: Option<Arc<TaskRuntimeDetail>>,
}

struct Inner {
    dropped: u64,
    processed: u64,
    total_runtime: f64,
    total_wait: f64,
    wait_samples: u64,
    runtime_ema: Option<f64>,
    wait_ema: Option<f64>,
    last_runtime: Option<f64>,
    last_wait: Option<f64>,
    longest_runtime: f64,
    longest_wait: f64,
    last_runtime_detail: Option<Arc<TaskRuntimeDetail>>,
    longest_runtime_detail: Option<Arc<TaskRuntimeDetail>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            dropped: 0,
            processed: 0,
            total_runtime: 0.0,
            total_wait: 0.0,
            wait_samples: 0,
            runtime_ema: None,
            wait_ema: None,
            last_runtime: None,
            last_wait: None,
            longest_runtime: 0.0,
            longest_wait: 0.0,
            last_runtime_detail: None,
            longest_runtime_detail: None,
        }
    }
}

/// EMA smoothing factor applied on every sample after the bootstrap one.
const EMA_ALPHA: f64 = 0.2;

/// Maintains per-queue runtime statistics and fires slow-task alerts.
///
/// Guarded by a single internal lock (never held across an `.await`),
/// following the locking discipline used by `Instrumentation` and
/// `RateTracker` elsewhere in this subsystem: each owns its own lock and
/// never calls out while holding it.
pub struct Instrumentation {
    queue_name: Arc<str>,
    inner: Mutex<Inner>,
    reporter: Option<Arc<dyn SlowTaskReporter>>,
    singular_runtime_threshold: f64,
    sink: Arc<dyn StructuredEventSink>,
}

impl Instrumentation {
    pub fn new(
        queue_name: Arc<str>,
        reporter: Option<Arc<dyn SlowTaskReporter>>,
        singular_runtime_threshold: f64,
        sink: Arc<dyn StructuredEventSink>,
    ) -> Self {
        Self {
            queue_name,
            inner: Mutex::new(Inner::new()),
            reporter,
            singular_runtime_threshold,
            sink,
        }
    }

    /// Records a wait-duration sample: updates total, samples, EMA
    /// (bootstrapped on the first sample), and the longest-seen wait.
    pub fn record_wait(&self, wait_seconds: f64) {
        let mut inner = self.inner.lock();
        inner.last_wait = Some(wait_seconds);
        inner.total_wait += wait_seconds;
        inner.wait_samples += 1;
        inner.wait_ema = Some(match inner.wait_ema {
            None => wait_seconds,
            Some(prev) => prev * (1.0 - EMA_ALPHA) + wait_seconds * EMA_ALPHA,
        });
        if wait_seconds > inner.longest_wait {
            inner.longest_wait = wait_seconds;
        }
    }

    /// Records a completed task's runtime detail, updates aggregates, and
    /// evaluates the singular-slow-task alert policy.
    pub fn record_runtime(&self, detail: TaskRuntimeDetail) {
        let detail = Arc::new(detail);
        let runtime = detail.runtime;

        {
            let mut inner = self.inner.lock();
            inner.processed += 1;
            inner.last_runtime = Some(runtime);
            inner.total_runtime += runtime;
            inner.runtime_ema = Some(match inner.runtime_ema {
                None => runtime,
                Some(prev) => prev * (1.0 - EMA_ALPHA) + runtime * EMA_ALPHA,
            });
            if runtime > inner.longest_runtime {
                inner.longest_runtime = runtime;
            }
            inner.last_runtime_detail = Some(Arc::clone(&detail));
            if runtime >= inner.longest_runtime {
                inner.longest_runtime_detail = Some(Arc::clone(&detail));
            }
        }

        self.maybe_report_singular_task(&detail);
    }

    /// Increments the cumulative drop counter.
    pub fn record_dropped(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.inner.lock().dropped += n;
    }

    /// Returns all numeric aggregates plus the two retained details.
    pub fn snapshot(&self) -> InstrumentationSnapshot {
        let inner = self.inner.lock();
        InstrumentationSnapshot {
            dropped_total: inner.dropped,
            tasks_completed: inner.processed,
            avg_runtime: if inner.processed > 0 {
                inner.total_runtime / inner.processed as f64
            } else {
                0.0
            },
            avg_wait: if inner.wait_samples > 0 {
                inner.total_wait / inner.wait_samples as f64
            } else {
                0.0
            },
            ema_runtime: inner.runtime_ema.unwrap_or(0.0),
            ema_wait: inner.wait_ema.unwrap_or(0.0),
            last_runtime: inner.last_runtime.unwrap_or(0.0),
            last_wait: inner.last_wait.unwrap_or(0.0),
            longest_runtime: inner.longest_runtime,
            longest_wait: inner.longest_wait,
            last_runtime_detail: inner.last_runtime_detail.clone(),
            longest_runtime_detail: inner.longest_runtime_detail.clone(),
        }
    }

    /// `ema_wait` as currently observed, used by the internal autoscaler's
    /// wait-pressure check without building a full snapshot.
    pub fn wait_ema(&self) -> f64 {
        self.inner.lock().wait_ema.unwrap_or(0.0)
    }

    pub fn last_wait(&self) -> f64 {
        self.inner.lock().last_wait.unwrap_or(0.0)
    }

    fn maybe_report_singular_task(&self, detail: &Arc<TaskRuntimeDetail>) {
        let Some(reporter) = self.reporter.clone() else {
            return;
        };
        if detail.runtime < self.singular_runtime_threshold {
            return;
        }
        if !is_singular(detail) {
            return;
        }

        let detail = Arc::clone(detail);
        let queue_name = Arc::clone(&self.queue_name);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            debug!(queue = %queue_name, runtime = detail.runtime, "dispatching singular slow-task alert");
            let handle = tokio::spawn({
                let detail = Arc::clone(&detail);
                let queue_name = Arc::clone(&queue_name);
                async move { reporter.report(&detail, &queue_name).await }
            });
            if handle.await.is_err() {
                warn!(queue = %queue_name, "singular slow-task reporter panicked");
                sink.emit(
                    Severity::Error,
                    "reporter_failed",
                    "singular slow-task reporter panicked",
                    &[("queue", queue_name.to_string())],
                );
            }
        });
    }
}

fn is_singular(detail: &TaskRuntimeDetail) -> bool {
    detail.max_workers() <= 1 && detail.autoscale_max() <= 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::events::NullSink;
    use crate::queue::types::{QueueStateSample, TaskKind, TaskMetadata, TenantId};
    use std::time::{Instant, SystemTime};

    fn make_detail(runtime: f64, max_workers: usize, autoscale_max: usize) -> TaskRuntimeDetail {
        let now = Instant::now();
        TaskRuntimeDetail {
            metadata: TaskMetadata::new("scan", TenantId(1), TaskKind::Image),
            wait: 0.1,
            runtime,
            enqueued_at: now,
            started_at: now,
            completed_at: now,
            started_at_wall: SystemTime::now(),
            completed_at_wall: SystemTime::now(),
            backlog_at_enqueue: 0,
            state_at_start: QueueStateSample {
                backlog: 0,
                active_workers: 1,
                busy_workers: 1,
                max_workers,
                autoscale_max,
            },
            backlog_at_finish: 0,
        }
    }

    fn instrumentation() -> Instrumentation {
        Instrumentation::new("test".into(), None, 30.0, Arc::new(NullSink))
    }

    #[test]
    fn first_wait_sample_seeds_ema_exactly() {
        let inst = instrumentation();
        inst.record_wait(5.0);
        assert_eq!(inst.snapshot().ema_wait, 5.0);
    }

    #[test]
    fn ema_blends_subsequent_samples() {
        let inst = instrumentation();
        inst.record_wait(5.0);
        inst.record_wait(10.0);
        // 5.0*0.8 + 10.0*0.2 = 6.0
        assert!((inst.snapshot().ema_wait - 6.0).abs() < 1e-9);
    }

    #[test]
    fn record_runtime_updates_last_and_longest() {
        let inst = instrumentation();
        inst.record_runtime(make_detail(1.0, 3, 3));
        inst.record_runtime(make_detail(5.0, 3, 3));
        inst.record_runtime(make_detail(2.0, 3, 3));
        let snap = inst.snapshot();
        assert_eq!(snap.last_runtime, 2.0);
        assert_eq!(snap.longest_runtime, 5.0);
        assert_eq!(snap.tasks_completed, 3);
    }

    #[test]
    fn dropped_counter_is_cumulative() {
        let inst = instrumentation();
        inst.record_dropped(3);
        inst.record_dropped(4);
        assert_eq!(inst.snapshot().dropped_total, 7);
    }

    #[test]
    fn is_singular_requires_both_ceilings_at_most_one() {
        let single = make_detail(1.0, 1, 1);
        let multi = make_detail(1.0, 2, 2);
        assert!(is_singular(&single));
        assert!(!is_singular(&multi));
    }
}
