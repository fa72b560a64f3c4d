//! Periodic control loop that reads per-queue metrics and issues new
//! sizing/watermark plans to one or more [`WorkerQueue`]s in adaptive mode.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use super::config::{ControllerConfig, QueuePolicy};
use super::snapshot::QueueSnapshot;
use super::types::AdaptivePlan;
use super::worker_queue::WorkerQueue;

struct ManagedQueue {
    queue: Arc<WorkerQueue>,
    policy: QueuePolicy,
    last_plan: Mutex<Option<(AdaptivePlan, Instant)>>,
}

/// Owns sizing for one or more `(queue, policy)` pairs. Not responsible for
/// task submission: that is the [`super::router::Router`]'s job.
pub struct AdaptiveController {
    queues: Vec<ManagedQueue>,
    tick_interval: Duration,
    scale_down_cooldown: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptiveController {
    pub fn new(config: ControllerConfig, queues: Vec<(Arc<WorkerQueue>, QueuePolicy)>) -> Arc<Self> {
        Arc::new(Self {
            queues: queues
                .into_iter()
                .map(|(queue, policy)| ManagedQueue { queue, policy, last_plan: Mutex::new(None) })
                .collect(),
            tick_interval: Duration::from_secs_f64(config.tick_interval_secs.max(0.01)),
            scale_down_cooldown: Duration::from_secs_f64(config.scale_down_cooldown_secs),
            handle: Mutex::new(None),
        })
    }

    /// Launches the control task after one initial `tick_interval` of
    /// warm-up, so rate trackers have samples before the first plan.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { this.run().await }));
    }

    /// Cancels the control task. Already-applied plans remain in effect on
    /// the queues.
    pub async fn stop(self: &Arc<Self>) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn run(self: Arc<Self>) {
        tokio::time::sleep(self.tick_interval).await;
        loop {
            tokio::time::sleep(self.tick_interval).await;
            let now = Instant::now();
            for entry in &self.queues {
                let snapshot = entry.queue.snapshot();
                let plan = build_plan(
                    &snapshot,
                    entry.queue.arrival_rate_per_minute(),
                    entry.queue.completion_rate_per_minute(),
                    &entry.policy,
                );
                self.apply_plan_if_needed(entry, plan, now);
            }
        }
    }

    fn apply_plan_if_needed(&self, entry: &ManagedQueue, plan: AdaptivePlan, now: Instant) {
        let mut last_plan = entry.last_plan.lock();

        let applied = match *last_plan {
            Some((ref previous, last_change_at)) => {
                if *previous == plan {
                    return;
                }
                let scaling_down = plan.target_workers < previous.target_workers;
                if scaling_down && now.duration_since(last_change_at) < self.scale_down_cooldown {
                    AdaptivePlan {
                        target_workers: previous.target_workers,
                        baseline_workers: plan.baseline_workers.max(previous.baseline_workers),
                        ..plan
                    }
                } else {
                    plan
                }
            }
            None => plan,
        };

        debug!(queue = %entry.queue.name(), ?applied, "adaptive controller applying plan");
        entry.queue.apply_plan(applied);
        *last_plan = Some((applied, now));
    }
}

/// Pure computation of a new plan from a queue's current snapshot and rates,
/// per the queue's policy. Free of side effects so it can be tested without
/// spinning up a queue or a clock.
pub fn build_plan(snapshot: &QueueSnapshot, arrival_rate: f64, completion_rate: f64, policy: &QueuePolicy) -> AdaptivePlan {
    let backlog = snapshot.backlog;

    let raw_runtime = if snapshot.ema_runtime > 0.0 { snapshot.ema_runtime } else { snapshot.avg_runtime };
    let runtime = if raw_runtime <= 0.0 { policy.min_runtime_secs } else { raw_runtime.max(policy.min_runtime_secs) };
    let mut per_worker_capacity = if runtime > 0.0 { 60.0 / runtime } else { 60.0 / policy.min_runtime_secs };

    let busy_workers = snapshot.busy_workers.max(1) as f64;
    if completion_rate > 0.0 {
        let observed_capacity = completion_rate / busy_workers;
        per_worker_capacity = per_worker_capacity.max(observed_capacity);
    }

    let wait_signal = snapshot.ema_wait.max(snapshot.avg_wait).max(snapshot.last_wait);

    let mut bias = policy.provision_bias;
    if wait_signal >= policy.wait_threshold_secs || backlog > policy.backlog_soft_limit {
        bias = bias.max(policy.recovery_bias);
    }

    let demand_workers = if per_worker_capacity > 0.0 {
        ((arrival_rate * bias) / per_worker_capacity).ceil() as i64
    } else {
        0
    };

    let backlog_source: i64 = if policy.maintain_backlog {
        backlog as i64 - policy.backlog_target as i64
    } else {
        backlog as i64
    };
    let backlog_excess = backlog_source.max(0);
    let catchup_batch = policy.catchup_batch.max(1);
    let backlog_pressure = (backlog_excess as f64 / catchup_batch as f64).ceil() as i64;

    let mut target_workers = (policy.min_workers as i64).max(demand_workers + backlog_pressure);
    if arrival_rate <= 0.1 && backlog <= policy.backlog_target {
        target_workers = policy.min_workers as i64; // idle-drain rule
    }
    target_workers = target_workers.min(policy.max_workers as i64).max(0);
    let target_workers = target_workers as usize;

    let baseline_workers = target_workers.min(policy.min_workers).max(1);

    let dynamic_high = policy
        .backlog_soft_limit
        .max(policy.backlog_target)
        .max(target_workers * catchup_batch);
    let backlog_high = if policy.maintain_backlog { dynamic_high } else { dynamic_high.max(catchup_batch) };

    let backlog_low = if policy.backlog_low > 0 {
        Some(policy.backlog_low.min(backlog_high.saturating_sub(catchup_batch)))
    } else if !policy.maintain_backlog {
        Some(0)
    } else {
        None
    };

    let backlog_hard_limit = (backlog_high * 2).max(backlog_high + catchup_batch);
    let backlog_shed_to = policy.backlog_target.max(backlog_high);

    AdaptivePlan {
        target_workers,
        baseline_workers,
        backlog_high: Some(backlog_high),
        backlog_low,
        backlog_hard_limit: Some(backlog_hard_limit),
        backlog_shed_to: Some(backlog_shed_to),
    }
}
