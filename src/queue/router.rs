//! Tenant-aware task routing across a free/accelerated queue tier.
//!
//! Mirrors the moderation cog's `add_to_queue`: an entitlement check, a
//! grace window for newly-onboarded tenants, a sticky failover onto the
//! accelerated tier when the free queue looks overloaded, then kind-based
//! queue selection and (for accelerated video tasks) a deadline wrap.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use super::config::RouterConfig;
use super::error::Result;
use super::events::QueueEventLogger;
use super::types::{Task, TaskKind, TenantId};
use super::worker_queue::WorkerQueue;

/// Tenant entitlement and onboarding lookup. Implementations back this with
/// whatever account/billing store the host application already has; the
/// router only needs two yes/no-shaped questions answered.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Whether this tenant currently has an accelerated-tier entitlement.
    async fn is_accelerated(&self, tenant_id: TenantId) -> bool;

    /// When this tenant first onboarded, if known. Backs the bootstrap-grace
    /// failover so brand-new tenants don't land on a possibly-overloaded
    /// free tier during their first minutes.
    async fn joined_at(&self, tenant_id: TenantId) -> Option<SystemTime>;
}

/// Routes tasks to one of four queues (free / accelerated / accelerated-text
/// / video) based on tenant entitlement, onboarding recency, and the free
/// queue's current load.
pub struct Router {
    free_queue: Arc<WorkerQueue>,
    accelerated_queue: Arc<WorkerQueue>,
    accelerated_text_queue: Arc<WorkerQueue>,
    video_queue: Arc<WorkerQueue>,
    entitlement: Arc<dyn EntitlementStore>,
    config: RouterConfig,
    events: QueueEventLogger,
    last_failover: Mutex<Option<Instant>>,
}

impl Router {
    pub fn new(
        free_queue: Arc<WorkerQueue>,
        accelerated_queue: Arc<WorkerQueue>,
        accelerated_text_queue: Arc<WorkerQueue>,
        video_queue: Arc<WorkerQueue>,
        entitlement: Arc<dyn EntitlementStore>,
        config: RouterConfig,
        events: QueueEventLogger,
    ) -> Self {
        Self {
            free_queue,
            accelerated_queue,
            accelerated_text_queue,
            video_queue,
            entitlement,
            config,
            events,
            last_failover: Mutex::new(None),
        }
    }

    /// Decides the destination queue for `task` and enqueues it there.
    ///
    /// Decision order: entitlement, then bootstrap grace, then free-queue
    /// overload failover, then kind-based tier selection. Accelerated video
    /// tasks are additionally wrapped in a deadline before being handed to
    /// the queue.
    pub async fn submit(&self, task: Task) -> Result<()> {
        let tenant_id = task.metadata.tenant_id;
        let kind = task.metadata.kind;

        let mut accelerated = self.entitlement.is_accelerated(tenant_id).await;
        if !accelerated && self.is_new_tenant(tenant_id).await {
            accelerated = true;
        }

        let mut failover = false;
        if !accelerated && self.free_queue_overloaded() {
            accelerated = true;
            failover = true;
        }

        let queue = self.select_queue(kind, accelerated);
        if failover {
            self.events.failover(self.free_queue.name(), queue.name(), "free queue overloaded");
        }

        let task = if kind == TaskKind::Video && accelerated {
            self.wrap_with_video_deadline(task, Arc::clone(&queue))
        } else {
            task
        };

        queue.enqueue(task)
    }

    async fn is_new_tenant(&self, tenant_id: TenantId) -> bool {
        let Some(joined_at) = self.entitlement.joined_at(tenant_id).await else {
            return false;
        };
        match SystemTime::now().duration_since(joined_at) {
            Ok(elapsed) => elapsed.as_secs_f64() <= self.config.bootstrap_grace_secs,
            // joined_at is in the future (clock skew): treat as freshly onboarded.
            Err(_) => true,
        }
    }

    fn select_queue(&self, kind: TaskKind, accelerated: bool) -> Arc<WorkerQueue> {
        match (kind, accelerated) {
            (TaskKind::Video, true) => Arc::clone(&self.video_queue),
            (TaskKind::Text, true) => Arc::clone(&self.accelerated_text_queue),
            (_, true) => Arc::clone(&self.accelerated_queue),
            (_, false) => Arc::clone(&self.free_queue),
        }
    }

    /// Free-queue overload heuristic: backlog pressure, hard-limit pressure,
    /// or wait pressure. Sticky for `failover_cooldown_secs` once tripped, so
    /// a burst of tenants don't each re-evaluate the same transient spike.
    fn free_queue_overloaded(&self) -> bool {
        {
            let last = self.last_failover.lock();
            if let Some(at) = *last {
                if at.elapsed() < Duration::from_secs_f64(self.config.failover_cooldown_secs) {
                    return true;
                }
            }
        }

        let snapshot = self.free_queue.snapshot();

        let backlog_high = snapshot.backlog_high.unwrap_or_else(|| {
            (snapshot.baseline_workers * self.config.overload_backlog_high_fallback_multiplier)
                .max(self.config.overload_backlog_high_fallback_floor)
        });
        let backlog_pressure = snapshot.backlog
            >= (((backlog_high as f64) * self.config.overload_backlog_high_multiplier) as usize)
                .max(backlog_high + snapshot.max_workers);

        let hard_limit_pressure = snapshot.backlog_hard_limit.is_some_and(|limit| {
            let margin = self.config.overload_hard_limit_margin.max(snapshot.max_workers);
            snapshot.backlog >= limit.saturating_sub(margin)
        });

        let wait_signal = snapshot.wait_signal();
        let runtime_signal = snapshot.runtime_signal();
        let wait_pressure = wait_signal
            >= (self.config.overload_wait_runtime_multiplier * runtime_signal)
                .max(self.config.overload_wait_floor_secs);

        let overloaded = backlog_pressure || hard_limit_pressure || wait_pressure;
        if overloaded {
            *self.last_failover.lock() = Some(Instant::now());
        }
        overloaded
    }

    /// Wraps `task`'s future in a deadline. On timeout the inner future is
    /// dropped (cancelling it) and the timeout is logged; the task is never
    /// retried or re-enqueued.
    fn wrap_with_video_deadline(&self, task: Task, queue: Arc<WorkerQueue>) -> Task {
        let timeout_secs = self.config.video_task_timeout();
        let timeout = Duration::from_secs_f64(timeout_secs);
        let display_name = task.metadata.display_name.clone();
        let metadata = task.metadata.clone();
        let events = self.events.clone();
        let inner = task.future;

        let wrapped = Box::pin(async move {
            if tokio::time::timeout(timeout, inner).await.is_err() {
                warn!(queue = %queue.name(), task = %display_name, timeout_secs, "video task timed out");
                events.task_failed(
                    queue.name(),
                    &display_name,
                    &format!("timed out after {timeout_secs:.1}s"),
                );
            }
        });

        Task::new(metadata, wrapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::config::WorkerQueueConfig;
    use crate::queue::events::NullSink;
    use crate::queue::types::TaskMetadata;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration as StdDuration;

    struct StaticEntitlement {
        accelerated: bool,
        joined_at: Option<SystemTime>,
    }

    #[async_trait]
    impl EntitlementStore for StaticEntitlement {
        async fn is_accelerated(&self, _tenant_id: TenantId) -> bool {
            self.accelerated
        }

        async fn joined_at(&self, _tenant_id: TenantId) -> Option<SystemTime> {
            self.joined_at
        }
    }

    fn make_router(entitlement: StaticEntitlement) -> Router {
        let sink = Arc::new(NullSink);
        let free = WorkerQueue::new("free", WorkerQueueConfig::default(), true, None, sink.clone());
        let accelerated = WorkerQueue::new("accelerated", WorkerQueueConfig::default(), true, None, sink.clone());
        let accelerated_text =
            WorkerQueue::new("accelerated_text", WorkerQueueConfig::default(), true, None, sink.clone());
        let video = WorkerQueue::new("video", WorkerQueueConfig::default(), true, None, sink.clone());
        Router::new(
            free,
            accelerated,
            accelerated_text,
            video,
            Arc::new(entitlement),
            RouterConfig::default(),
            QueueEventLogger::new(sink),
        )
    }

    fn noop_task(kind: TaskKind) -> Task {
        Task::new(
            TaskMetadata::new("t", TenantId(1), kind),
            Box::pin(async {}),
        )
    }

    #[test]
    fn select_queue_routes_by_kind_and_acceleration() {
        let router = make_router(StaticEntitlement { accelerated: false, joined_at: None });
        assert_eq!(router.select_queue(TaskKind::Image, false).name().as_ref(), "free");
        assert_eq!(router.select_queue(TaskKind::Image, true).name().as_ref(), "accelerated");
        assert_eq!(router.select_queue(TaskKind::Text, true).name().as_ref(), "accelerated_text");
        assert_eq!(router.select_queue(TaskKind::Video, true).name().as_ref(), "video");
        // Non-accelerated video/text still land on the free queue.
        assert_eq!(router.select_queue(TaskKind::Video, false).name().as_ref(), "free");
    }

    #[tokio::test]
    async fn entitled_tenant_is_routed_to_accelerated_tier() {
        let router = make_router(StaticEntitlement { accelerated: true, joined_at: None });
        router.free_queue.start().await;
        router.accelerated_queue.start().await;
        router.submit(noop_task(TaskKind::Image)).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(router.accelerated_queue.snapshot().tasks_completed, 1);
        assert_eq!(router.free_queue.snapshot().tasks_completed, 0);
        router.free_queue.stop().await;
        router.accelerated_queue.stop().await;
    }

    #[tokio::test]
    async fn brand_new_tenant_gets_bootstrap_grace() {
        let router = make_router(StaticEntitlement { accelerated: false, joined_at: Some(SystemTime::now()) });
        router.free_queue.start().await;
        router.accelerated_queue.start().await;
        router.submit(noop_task(TaskKind::Image)).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(router.accelerated_queue.snapshot().tasks_completed, 1);
        router.free_queue.stop().await;
        router.accelerated_queue.stop().await;
    }

    #[tokio::test]
    async fn stale_tenant_without_entitlement_stays_on_free_queue() {
        let old_join = SystemTime::now() - StdDuration::from_secs(3600);
        let router = make_router(StaticEntitlement { accelerated: false, joined_at: Some(old_join) });
        router.free_queue.start().await;
        router.submit(noop_task(TaskKind::Image)).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(router.free_queue.snapshot().tasks_completed, 1);
        router.free_queue.stop().await;
    }

    #[tokio::test]
    async fn overloaded_free_queue_fails_over_and_stays_sticky() {
        let router = make_router(StaticEntitlement { accelerated: false, joined_at: None });
        // Seed the sticky cache directly, as if overload had just been detected.
        *router.last_failover.lock() = Some(Instant::now());
        assert!(router.free_queue_overloaded());

        let still_sticky = AtomicBool::new(false);
        // A second check within the cooldown window must short-circuit true
        // without re-evaluating the free queue's snapshot at all.
        if router.free_queue_overloaded() {
            still_sticky.store(true, Ordering::SeqCst);
        }
        assert!(still_sticky.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn video_task_that_exceeds_deadline_is_logged_and_dropped() {
        let mut config = RouterConfig::default();
        config.video_task_timeout_secs = Some(0.01);
        let router = {
            let sink = Arc::new(NullSink);
            let free = WorkerQueue::new("free", WorkerQueueConfig::default(), true, None, sink.clone());
            let accelerated = WorkerQueue::new("accelerated", WorkerQueueConfig::default(), true, None, sink.clone());
            let accelerated_text =
                WorkerQueue::new("accelerated_text", WorkerQueueConfig::default(), true, None, sink.clone());
            let video = WorkerQueue::new("video", WorkerQueueConfig::default(), true, None, sink.clone());
            Router::new(
                free,
                accelerated,
                accelerated_text,
                video,
                Arc::new(StaticEntitlement { accelerated: true, joined_at: None }),
                config,
                QueueEventLogger::new(sink),
            )
        };
        router.video_queue.start().await;

        let task = Task::new(
            TaskMetadata::new("slow-video", TenantId(1), TaskKind::Video),
            Box::pin(async {
                tokio::time::sleep(StdDuration::from_secs(5)).await;
            }),
        );
        router.submit(task).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        // The wrapped future resolves promptly (timeout fires) even though
        // the inner future sleeps for 5s.
        assert_eq!(router.video_queue.snapshot().tasks_completed, 1);
        router.video_queue.stop().await;
    }
}
