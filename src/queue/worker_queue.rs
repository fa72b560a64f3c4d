//! Bounded, shedding work queue backed by a dynamically-sized worker pool.
//!
//! `WorkerQueue` owns exactly one internal lock guarding its sizing and
//! watermark state; the backlog itself lives behind a second lock. Neither
//! is ever held across an `.await`, per the locking discipline shared with
//! [`super::instrumentation::Instrumentation`] and [`super::rate_tracker::RateTracker`].

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::config::WorkerQueueConfig;
use super::error::{QueueError, Result};
use super::events::QueueEventLogger;
use super::events::StructuredEventSink;
use super::instrumentation::{Instrumentation, SlowTaskReporter};
use super::rate_tracker::RateTracker;
use super::snapshot::QueueSnapshot;
use super::types::{AdaptivePlan, QueueStateSample, Task, TaskRuntimeDetail};

/// An item admitted to the backlog: either real work, or a termination
/// signal injected by `resize`/`stop` to make one worker exit.
enum QueueItem {
    Task(EnqueuedTask),
    Sentinel,
}

struct EnqueuedTask {
    task: Task,
    enqueued_at: Instant,
    backlog_at_enqueue: usize,
}

/// Sizing and watermark state guarded by `WorkerQueue::state`.
struct QueueState {
    max_workers: usize,
    baseline_workers: usize,
    autoscale_max: usize,
    pending_stops: usize,
    backlog_high: Option<usize>,
    backlog_low: Option<usize>,
    backlog_hard_limit: Option<usize>,
    backlog_shed_to: Option<usize>,
}

/// A self-contained, shedding work queue with a dynamically resizable worker
/// pool. Always used behind an `Arc`, since workers hold a clone of it for
/// their lifetime.
pub struct WorkerQueue {
    name: Arc<str>,
    config: WorkerQueueConfig,
    adaptive_mode: bool,

    state: Mutex<QueueState>,
    backlog: Mutex<VecDeque<QueueItem>>,
    notify: Notify,

    active_workers: AtomicUsize,
    busy_workers: AtomicUsize,
    next_worker_id: AtomicUsize,

    arrival_rate: RateTracker,
    completion_rate: RateTracker,
    instrumentation: Instrumentation,
    events: QueueEventLogger,

    started: AtomicBool,
    stopped: AtomicBool,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    autoscaler_handle: Mutex<Option<JoinHandle<()>>>,

    /// The ceiling as originally configured, before any adaptive bumps.
    configured_autoscale_max: usize,
    adaptive_backlog_hits: AtomicU32,
    adaptive_recovery_hits: AtomicU32,
    last_adaptive_bump: Mutex<Option<Instant>>,
    low_since: Mutex<Option<Instant>>,
    last_shed_warning: Mutex<Option<Instant>>,
    last_plan_change: Mutex<Option<(AdaptivePlan, Instant)>>,
}

impl WorkerQueue {
    pub fn new(
        name: impl Into<Arc<str>>,
        config: WorkerQueueConfig,
        adaptive_mode: bool,
        reporter: Option<Arc<dyn SlowTaskReporter>>,
        sink: Arc<dyn StructuredEventSink>,
    ) -> Arc<Self> {
        let name: Arc<str> = name.into();
        let configured_autoscale_max = config.autoscale_max.max(config.max_workers).max(1);
        let state = QueueState {
            max_workers: config.max_workers.max(1),
            baseline_workers: config.baseline_workers.max(1),
            autoscale_max: configured_autoscale_max,
            pending_stops: 0,
            backlog_high: config.backlog_high,
            backlog_low: config.backlog_low,
            backlog_hard_limit: config.backlog_hard_limit,
            backlog_shed_to: config.backlog_shed_to,
        };
        let instrumentation = Instrumentation::new(
            Arc::clone(&name),
            reporter,
            config.singular_runtime_threshold_secs,
            Arc::clone(&sink),
        );
        let arrival_rate = RateTracker::new(Duration::from_secs_f64(config.rate_window_secs));
        let completion_rate = RateTracker::new(Duration::from_secs_f64(config.rate_window_secs));

        Arc::new(Self {
            events: QueueEventLogger::new(sink),
            name,
            state: Mutex::new(state),
            backlog: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            active_workers: AtomicUsize::new(0),
            busy_workers: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            arrival_rate,
            completion_rate,
            instrumentation,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            worker_handles: Mutex::new(Vec::new()),
            autoscaler_handle: Mutex::new(None),
            configured_autoscale_max,
            adaptive_backlog_hits: AtomicU32::new(0),
            adaptive_recovery_hits: AtomicU32::new(0),
            last_adaptive_bump: Mutex::new(None),
            low_since: Mutex::new(None),
            last_shed_warning: Mutex::new(None),
            last_plan_change: Mutex::new(None),
            config,
            adaptive_mode,
        })
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Spins up the configured number of workers and, outside adaptive
    /// mode, the internal autoscaler. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let max_workers = self.state.lock().max_workers;
        for _ in 0..max_workers {
            self.spawn_worker();
        }
        if !self.adaptive_mode {
            let (autoscale_max, baseline) = {
                let state = self.state.lock();
                (state.autoscale_max, state.baseline_workers)
            };
            if autoscale_max > baseline {
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move { this.autoscaler_loop().await });
                *self.autoscaler_handle.lock() = Some(handle);
            }
        }
    }

    /// Stops accepting new work, drains running tasks to completion, and
    /// discards whatever remains in the backlog. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let max_workers = self.state.lock().max_workers;
        {
            let mut backlog = self.backlog.lock();
            for _ in 0..max_workers {
                backlog.push_front(QueueItem::Sentinel);
            }
        }
        self.notify.notify_waiters();

        if let Some(handle) = self.autoscaler_handle.lock().take() {
            handle.abort();
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.worker_handles.lock());
        for handle in handles {
            let _ = handle.await;
        }

        let remaining: Vec<QueueItem> = self.backlog.lock().drain(..).collect();
        let mut dropped = 0u64;
        for item in remaining {
            if let QueueItem::Task(enqueued) = item {
                drop(enqueued.task);
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.instrumentation.record_dropped(dropped);
        }
    }

    /// Admits a task to the backlog. Fails only if the queue has been
    /// stopped. Never blocks; shedding is the admission-control mechanism.
    pub fn enqueue(&self, task: Task) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::QueueStopped(self.name.to_string()));
        }
        self.arrival_rate.record();
        {
            let mut backlog = self.backlog.lock();
            let backlog_at_enqueue = backlog.len();
            backlog.push_back(QueueItem::Task(EnqueuedTask {
                task,
                enqueued_at: Instant::now(),
                backlog_at_enqueue,
            }));
        }
        self.notify.notify_one();
        self.shed_backlog_if_needed();
        Ok(())
    }

    /// Raises `autoscale_max` and `max_workers` to at least `n`. Never
    /// shrinks.
    pub fn ensure_capacity(self: &Arc<Self>, n: usize) {
        let (old_max, grow_by) = {
            let mut state = self.state.lock();
            if n > state.autoscale_max {
                state.autoscale_max = n;
            }
            let old_max = state.max_workers;
            let grow_by = n.saturating_sub(old_max);
            if grow_by > 0 {
                state.max_workers = n;
            }
            (old_max, grow_by)
        };
        if grow_by > 0 {
            for _ in 0..grow_by {
                self.spawn_worker();
            }
            self.events.scaled_up(&self.name, old_max, old_max + grow_by);
        }
    }

    /// Grows or shrinks the worker pool to exactly `new_max`. Shrinking
    /// injects termination sentinels and is eventually consistent: workers
    /// exit only after finishing their current task.
    pub fn resize(self: &Arc<Self>, new_max: usize, reason: &str) {
        self.resize_to(new_max, reason);
    }

    fn resize_to(self: &Arc<Self>, new_max: usize, reason: &str) {
        let old = {
            let mut state = self.state.lock();
            let old = state.max_workers;
            if new_max == old {
                return;
            }
            state.max_workers = new_max;
            if new_max < old {
                state.pending_stops += old - new_max;
            }
            old
        };

        if new_max > old {
            for _ in 0..(new_max - old) {
                self.spawn_worker();
            }
            self.events.scaled_up(&self.name, old, new_max);
        } else {
            {
                let mut backlog = self.backlog.lock();
                for _ in 0..(old - new_max) {
                    backlog.push_back(QueueItem::Sentinel);
                }
            }
            self.notify.notify_waiters();
            self.events.scaled_down(&self.name, old, new_max);
        }
        debug!(queue = %self.name, reason, old, new_max, "resized worker pool");
    }

    /// Applies a plan from the `AdaptiveController`. A no-op outside
    /// adaptive mode.
    pub fn apply_plan(self: &Arc<Self>, plan: AdaptivePlan) {
        if !self.adaptive_mode {
            debug!(queue = %self.name, "apply_plan called on a non-adaptive queue; ignoring");
            return;
        }
        let target_changed = {
            let mut state = self.state.lock();
            state.baseline_workers = plan.baseline_workers.max(1);
            state.backlog_high = plan.backlog_high;
            state.backlog_low = plan.backlog_low;
            state.backlog_hard_limit = plan.backlog_hard_limit;
            state.backlog_shed_to = plan.backlog_shed_to;
            if plan.target_workers > state.autoscale_max {
                state.autoscale_max = plan.target_workers;
            }
            state.max_workers != plan.target_workers
        };
        if target_changed {
            self.resize_to(plan.target_workers, "adaptive_plan");
        }
        *self.last_plan_change.lock() = Some((plan, Instant::now()));
        self.events.adaptive_plan_updated(
            &self.name,
            &format!(
                "target={} baseline={} high={:?} low={:?} hard_limit={:?} shed_to={:?}",
                plan.target_workers,
                plan.baseline_workers,
                plan.backlog_high,
                plan.backlog_low,
                plan.backlog_hard_limit,
                plan.backlog_shed_to
            ),
        );
    }

    /// The previously-applied plan and when it took effect, used by the
    /// controller's scale-down damping.
    pub fn last_plan_change(&self) -> Option<(AdaptivePlan, Instant)> {
        *self.last_plan_change.lock()
    }

    /// A consistent point-in-time view of counters, sizing, watermarks, and
    /// instrumentation.
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        let backlog = self.backlog.lock().len();
        let inst = self.instrumentation.snapshot();
        QueueSnapshot {
            name: Arc::clone(&self.name),
            backlog,
            active_workers: self.active_workers.load(Ordering::SeqCst),
            busy_workers: self.busy_workers.load(Ordering::SeqCst),
            max_workers: state.max_workers,
            baseline_workers: state.baseline_workers,
            autoscale_max: state.autoscale_max,
            pending_stops: state.pending_stops,
            backlog_high: state.backlog_high,
            backlog_low: state.backlog_low,
            backlog_hard_limit: state.backlog_hard_limit,
            backlog_shed_to: state.backlog_shed_to,
            dropped_total: inst.dropped_total,
            tasks_completed: inst.tasks_completed,
            avg_runtime: inst.avg_runtime,
            avg_wait: inst.avg_wait,
            ema_runtime: inst.ema_runtime,
            ema_wait: inst.ema_wait,
            last_runtime: inst.last_runtime,
            last_wait: inst.last_wait,
            longest_runtime: inst.longest_runtime,
            longest_wait: inst.longest_wait,
            last_runtime_detail: inst.last_runtime_detail,
            longest_runtime_detail: inst.longest_runtime_detail,
            check_interval: self.config.check_interval_secs,
            scale_down_grace: self.config.scale_down_grace_secs,
        }
    }

    pub fn arrival_rate_per_minute(&self) -> f64 {
        self.arrival_rate.rate_per_minute()
    }

    pub fn completion_rate_per_minute(&self) -> f64 {
        self.completion_rate.rate_per_minute()
    }

    fn state_sample(&self) -> QueueStateSample {
        let backlog = self.backlog.lock().len();
        let state = self.state.lock();
        QueueStateSample {
            backlog,
            active_workers: self.active_workers.load(Ordering::SeqCst),
            busy_workers: self.busy_workers.load(Ordering::SeqCst),
            max_workers: state.max_workers,
            autoscale_max: state.autoscale_max,
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.worker_loop(worker_id).await });
        self.worker_handles.lock().push(handle);
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        trace!(queue = %self.name, worker_id, "worker started");
        loop {
            match self.dequeue().await {
                QueueItem::Sentinel => {
                    let mut state = self.state.lock();
                    state.pending_stops = state.pending_stops.saturating_sub(1);
                    break;
                }
                QueueItem::Task(enqueued) => {
                    self.run_task(enqueued).await;
                }
            }
        }
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
        trace!(queue = %self.name, worker_id, "worker terminated");
    }

    async fn dequeue(&self) -> QueueItem {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.backlog.lock().pop_front() {
                return item;
            }
            notified.await;
        }
    }

    async fn run_task(&self, enqueued: EnqueuedTask) {
        let EnqueuedTask { task, enqueued_at, backlog_at_enqueue } = enqueued;
        let Task { metadata, future } = task;

        let started_at = Instant::now();
        let wait = started_at.duration_since(enqueued_at).as_secs_f64();
        self.instrumentation.record_wait(wait);

        self.busy_workers.fetch_add(1, Ordering::SeqCst);
        let state_at_start = self.state_sample();
        let started_at_wall = SystemTime::now();

        let outcome = AssertUnwindSafe(future).catch_unwind().await;

        self.busy_workers.fetch_sub(1, Ordering::SeqCst);
        let completed_at = Instant::now();
        let completed_at_wall = SystemTime::now();
        let runtime = completed_at.duration_since(started_at).as_secs_f64();
        self.completion_rate.record();

        if let Err(panic) = outcome {
            self.events.task_failed(&self.name, &metadata.display_name, &panic_message(&panic));
        }

        let backlog_at_finish = self.backlog.lock().len();
        let detail = TaskRuntimeDetail {
            metadata,
            wait,
            runtime,
            enqueued_at,
            started_at,
            completed_at,
            started_at_wall,
            completed_at_wall,
            backlog_at_enqueue,
            state_at_start,
            backlog_at_finish,
        };
        self.instrumentation.record_runtime(detail);
    }

    /// Drops the oldest tasks in the backlog down to the shed target when
    /// over the hard limit. Sentinels encountered are preserved in place.
    /// Called on every enqueue and every autoscaler tick.
    fn shed_backlog_if_needed(&self) {
        let (hard_limit, shed_to, backlog_high) = {
            let state = self.state.lock();
            (state.backlog_hard_limit, state.backlog_shed_to, state.backlog_high)
        };
        let Some(hard_limit) = hard_limit else { return };

        let mut backlog = self.backlog.lock();
        let current = backlog.len();
        if current <= hard_limit {
            return;
        }
        let target = shed_to.or(backlog_high).unwrap_or(hard_limit);
        let drop_n = current.saturating_sub(target);
        if drop_n == 0 {
            return;
        }

        let mut preserved_sentinels = Vec::new();
        let mut dropped = 0usize;
        while dropped < drop_n {
            match backlog.pop_front() {
                Some(QueueItem::Sentinel) => preserved_sentinels.push(QueueItem::Sentinel),
                Some(QueueItem::Task(enqueued)) => {
                    drop(enqueued.task);
                    dropped += 1;
                }
                None => break,
            }
        }
        for sentinel in preserved_sentinels.into_iter().rev() {
            backlog.push_front(sentinel);
        }
        drop(backlog);

        if dropped > 0 {
            self.instrumentation.record_dropped(dropped as u64);
            self.warn_shed(current, dropped);
        }
    }

    fn warn_shed(&self, backlog_before: usize, dropped: usize) {
        let mut last = self.last_shed_warning.lock();
        let now = Instant::now();
        let cooldown = Duration::from_secs_f64(self.config.shed_warning_cooldown_secs);
        if last.map_or(true, |t| now.duration_since(t) >= cooldown) {
            *last = Some(now);
            drop(last);
            self.events.backlog_shed(&self.name, dropped, backlog_before);
        }
    }

    /// Internal autoscaler tick loop, run only outside adaptive mode.
    async fn autoscaler_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs_f64(self.config.check_interval_secs.max(0.01)));
        interval.tick().await; // first tick fires immediately; consume it
        loop {
            interval.tick().await;
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.shed_backlog_if_needed();
            self.autoscaler_tick();
        }
    }

    fn autoscaler_tick(self: &Arc<Self>) {
        let backlog_len = self.backlog.lock().len();
        let active = self.active_workers.load(Ordering::SeqCst);
        let busy = self.busy_workers.load(Ordering::SeqCst);
        let (max_workers, autoscale_max, backlog_high, backlog_low, baseline) = {
            let state = self.state.lock();
            (state.max_workers, state.autoscale_max, state.backlog_high, state.backlog_low, state.baseline_workers)
        };
        let wait_signal = self.instrumentation.wait_ema().max(self.instrumentation.last_wait());

        let mut scaled_up = false;
        if let Some(high) = backlog_high {
            if backlog_len >= high && active < autoscale_max {
                self.resize_to(autoscale_max, "backlog_high");
                scaled_up = true;
            }
        }
        if !scaled_up
            && backlog_len > 0
            && wait_signal >= self.config.slow_wait_threshold_secs
            && max_workers < autoscale_max
        {
            self.resize_to(autoscale_max, "wait_pressure");
            scaled_up = true;
        }
        if !scaled_up {
            self.maybe_bump_ceiling(backlog_len, backlog_high, busy, active);
        }
        self.maybe_scale_down(backlog_len, backlog_low, baseline, max_workers);
        self.maybe_reset_ceiling(backlog_len, backlog_low);
    }

    fn maybe_bump_ceiling(self: &Arc<Self>, backlog_len: usize, backlog_high: Option<usize>, busy: usize, active: usize) {
        let sustained = backlog_high.is_some_and(|h| backlog_len >= h) && active > 0 && busy >= active;
        if !sustained {
            self.adaptive_backlog_hits.store(0, Ordering::SeqCst);
            return;
        }
        let hits = self.adaptive_backlog_hits.fetch_add(1, Ordering::SeqCst) + 1;
        if hits < self.config.hit_threshold {
            return;
        }
        let now = Instant::now();
        let mut last_bump = self.last_adaptive_bump.lock();
        let cooldown = Duration::from_secs_f64(self.config.adaptive_bump_cooldown_secs);
        if !last_bump.map_or(true, |t| now.duration_since(t) >= cooldown) {
            return;
        }
        *last_bump = Some(now);
        drop(last_bump);
        self.adaptive_backlog_hits.store(0, Ordering::SeqCst);

        let (old, new_ceiling) = {
            let mut state = self.state.lock();
            let ceiling = self
                .config
                .adaptive_ceiling
                .unwrap_or_else(|| self.default_adaptive_ceiling(state.baseline_workers));
            let old = state.autoscale_max;
            let new_ceiling = (old + self.config.adaptive_step).min(ceiling);
            state.autoscale_max = new_ceiling;
            (old, new_ceiling)
        };
        if new_ceiling > old {
            self.resize_to(new_ceiling, "adaptive_bump");
            self.events.autoscale_ceiling_raised(&self.name, old, new_ceiling);
        }
    }

    fn default_adaptive_ceiling(&self, baseline_workers: usize) -> usize {
        (self.configured_autoscale_max + baseline_workers).max(self.configured_autoscale_max + 2)
    }

    fn maybe_scale_down(self: &Arc<Self>, backlog_len: usize, backlog_low: Option<usize>, baseline: usize, max_workers: usize) {
        let low = backlog_low.unwrap_or(0);
        let below_low = backlog_len <= low;
        if below_low && max_workers > baseline {
            let now = Instant::now();
            let mut low_since = self.low_since.lock();
            let started = *low_since.get_or_insert(now);
            let grace = Duration::from_secs_f64(self.config.scale_down_grace_secs);
            if now.duration_since(started) >= grace {
                *low_since = None;
                drop(low_since);
                self.resize_to(baseline, "scale_down");
            }
        } else {
            *self.low_since.lock() = None;
        }
    }

    fn maybe_reset_ceiling(self: &Arc<Self>, backlog_len: usize, backlog_low: Option<usize>) {
        let threshold = backlog_low.unwrap_or(0).max(1);
        let currently_bumped = self.state.lock().autoscale_max > self.configured_autoscale_max;
        if !currently_bumped {
            self.adaptive_recovery_hits.store(0, Ordering::SeqCst);
            return;
        }
        if backlog_len > threshold {
            self.adaptive_recovery_hits.store(0, Ordering::SeqCst);
            return;
        }
        let hits = self.adaptive_recovery_hits.fetch_add(1, Ordering::SeqCst) + 1;
        if hits < self.config.reset_hits {
            return;
        }
        self.adaptive_recovery_hits.store(0, Ordering::SeqCst);
        let (old, new) = {
            let mut state = self.state.lock();
            let old = state.autoscale_max;
            let new = self.configured_autoscale_max.max(state.max_workers);
            state.autoscale_max = new;
            (old, new)
        };
        if new != old {
            self.events.autoscale_ceiling_reset(&self.name, old, new);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::events::NullSink;
    use crate::queue::types::{TaskKind, TaskMetadata, TenantId};
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    fn test_config() -> WorkerQueueConfig {
        WorkerQueueConfig {
            baseline_workers: 1,
            max_workers: 1,
            autoscale_max: 1,
            ..WorkerQueueConfig::default()
        }
    }

    fn make_task(name: &str, body: impl std::future::Future<Output = ()> + Send + 'static) -> Task {
        Task::new(
            TaskMetadata::new(name, TenantId(1), TaskKind::Image),
            Box::pin(body),
        )
    }

    #[tokio::test]
    async fn fifo_order_under_light_load() {
        let queue = WorkerQueue::new("fifo", test_config(), false, None, Arc::new(NullSink));
        queue.start().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["A", "B", "C"] {
            let order = Arc::clone(&order);
            queue
                .enqueue(make_task(label, async move {
                    sleep(Duration::from_millis(10)).await;
                    order.lock().push(label);
                }))
                .unwrap();
        }

        sleep(Duration::from_millis(100)).await;
        queue.stop().await;

        assert_eq!(*order.lock(), vec!["A", "B", "C"]);
        let snap = queue.snapshot();
        assert_eq!(snap.dropped_total, 0);
        assert_eq!(snap.tasks_completed, 3);
    }

    #[tokio::test]
    async fn hard_limit_sheds_oldest_first() {
        let (block_tx, block_rx) = oneshot::channel::<()>();
        let block_rx = Arc::new(Mutex::new(Some(block_rx)));

        let mut config = test_config();
        config.backlog_hard_limit = Some(5);
        config.backlog_shed_to = Some(3);
        let queue = WorkerQueue::new("shed", config, false, None, Arc::new(NullSink));
        queue.start().await;

        // Occupy the single worker so nothing drains while we enqueue.
        queue
            .enqueue(make_task("blocker", async move {
                let rx = block_rx.lock().take().unwrap();
                let _ = rx.await;
            }))
            .unwrap();
        sleep(Duration::from_millis(20)).await;

        for i in 1..=10 {
            queue.enqueue(make_task(&format!("T{i}"), async {})).unwrap();
        }

        // Shedding only fires once backlog exceeds the hard limit of 5: T6
        // pushes it to 6, dropping T1-T3 down to shed_to=3; T9 pushes it to
        // 6 again, dropping T4-T6. T10 lands at backlog 4, under the hard
        // limit, so it's never shed. Retained: T7, T8, T9, T10.
        let snap = queue.snapshot();
        assert_eq!(snap.backlog, 4);
        assert_eq!(snap.dropped_total, 6);

        let _ = block_tx.send(());
        queue.stop().await;
    }

    #[tokio::test]
    async fn ensure_capacity_raises_ceiling_and_pool_without_shrinking() {
        let queue = WorkerQueue::new("capacity", test_config(), false, None, Arc::new(NullSink));
        queue.start().await;
        queue.ensure_capacity(4);

        let snap = queue.snapshot();
        assert_eq!(snap.max_workers, 4);
        assert_eq!(snap.autoscale_max, 4);

        queue.ensure_capacity(2); // must never shrink
        assert_eq!(queue.snapshot().max_workers, 4);

        queue.stop().await;
    }

    #[tokio::test]
    async fn stop_discards_remaining_backlog_without_running_it() {
        let ran = Arc::new(StdAtomicU32::new(0));
        let (block_tx, block_rx) = oneshot::channel::<()>();

        let queue = WorkerQueue::new("stop-drain", test_config(), false, None, Arc::new(NullSink));
        queue.start().await;

        queue
            .enqueue(make_task("blocker", async move {
                let _ = block_rx.await;
            }))
            .unwrap();
        sleep(Duration::from_millis(20)).await;

        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            queue
                .enqueue(make_task("never-runs", async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        let _ = block_tx.send(());
        queue.stop().await;

        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn enqueue_after_stop_is_rejected() {
        let queue = WorkerQueue::new("stopped", test_config(), false, None, Arc::new(NullSink));
        queue.start().await;
        queue.stop().await;

        let err = queue.enqueue(make_task("late", async {})).unwrap_err();
        assert_eq!(err, QueueError::QueueStopped("stopped".to_string()));
    }

    #[tokio::test]
    async fn apply_plan_is_noop_outside_adaptive_mode() {
        let queue = WorkerQueue::new("non-adaptive", test_config(), false, None, Arc::new(NullSink));
        queue.start().await;
        queue.apply_plan(AdaptivePlan {
            target_workers: 5,
            baseline_workers: 1,
            backlog_high: None,
            backlog_low: None,
            backlog_hard_limit: None,
            backlog_shed_to: None,
        });
        assert_eq!(queue.snapshot().max_workers, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn apply_plan_resizes_in_adaptive_mode() {
        let queue = WorkerQueue::new("adaptive", test_config(), true, None, Arc::new(NullSink));
        queue.start().await;
        queue.apply_plan(AdaptivePlan {
            target_workers: 3,
            baseline_workers: 2,
            backlog_high: Some(10),
            backlog_low: Some(2),
            backlog_hard_limit: Some(30),
            backlog_shed_to: Some(15),
        });
        sleep(Duration::from_millis(10)).await;
        let snap = queue.snapshot();
        assert_eq!(snap.max_workers, 3);
        assert_eq!(snap.baseline_workers, 2);
        assert_eq!(snap.backlog_hard_limit, Some(30));
        queue.stop().await;
    }
}
