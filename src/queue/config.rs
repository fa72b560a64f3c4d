//! Configuration surface for the adaptive worker queue subsystem.
//!
//! Mirrors the layered-defaults style of `crate::config::Config`: one
//! struct-of-structs, `#[serde(default)]` throughout, loadable from TOML.

use serde::{Deserialize, Serialize};

/// Top-level configuration for one deployment of the subsystem: the
/// internal-autoscaler and watermark defaults for a queue, the adaptive
/// controller's tick behavior, and the router's overload/failover tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveQueueConfig {
    pub worker_queue: WorkerQueueConfig,
    pub controller: ControllerConfig,
    pub router: RouterConfig,
}

impl Default for AdaptiveQueueConfig {
    fn default() -> Self {
        Self {
            worker_queue: WorkerQueueConfig::default(),
            controller: ControllerConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

/// Defaults applied when constructing a `WorkerQueue` directly (non-adaptive
/// mode) or as the seed policy an `AdaptiveController` later overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerQueueConfig {
    pub baseline_workers: usize,
    pub max_workers: usize,
    pub autoscale_max: usize,
    pub backlog_high: Option<usize>,
    pub backlog_low: Option<usize>,
    pub backlog_hard_limit: Option<usize>,
    pub backlog_shed_to: Option<usize>,

    /// Internal autoscaler tick period, seconds. Only used when
    /// `adaptive_mode` is false.
    pub check_interval_secs: f64,
    /// Wait-pressure threshold that triggers an internal scale-up.
    pub slow_wait_threshold_secs: f64,
    /// Consecutive over-threshold ticks required before bumping the burst
    /// ceiling.
    pub hit_threshold: u32,
    /// Consecutive low-backlog ticks required to reset a bumped ceiling.
    pub reset_hits: u32,
    /// Amount `autoscale_max` grows by on a sustained-pressure bump.
    pub adaptive_step: usize,
    /// Absolute ceiling a bump may never exceed.
    pub adaptive_ceiling: Option<usize>,
    /// Minimum time between successive ceiling bumps, seconds.
    pub adaptive_bump_cooldown_secs: f64,
    /// Minimum time the backlog must stay low before scaling down to
    /// baseline, seconds.
    pub scale_down_grace_secs: f64,
    /// RateTracker window for arrival/completion rates, seconds (floored to
    /// 30 by `RateTracker` itself).
    pub rate_window_secs: f64,
    /// Slow-task alert threshold, seconds.
    pub singular_runtime_threshold_secs: f64,
    /// Minimum time between repeated shedding warnings for the same event
    /// key, seconds.
    pub shed_warning_cooldown_secs: f64,
}

impl Default for WorkerQueueConfig {
    fn default() -> Self {
        Self {
            baseline_workers: 1,
            max_workers: 1,
            autoscale_max: 1,
            backlog_high: None,
            backlog_low: None,
            backlog_hard_limit: None,
            backlog_shed_to: None,
            check_interval_secs: 2.0,
            slow_wait_threshold_secs: 10.0,
            hit_threshold: 4,
            reset_hits: 12,
            adaptive_step: 1,
            adaptive_ceiling: None,
            adaptive_bump_cooldown_secs: 30.0,
            scale_down_grace_secs: 60.0,
            rate_window_secs: 180.0,
            singular_runtime_threshold_secs: 30.0,
            shed_warning_cooldown_secs: 30.0,
        }
    }
}

/// Per-queue sizing policy consumed by the `AdaptiveController`'s control
/// loop (spec §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub min_runtime_secs: f64,
    pub provision_bias: f64,
    pub recovery_bias: f64,
    pub wait_threshold_secs: f64,
    pub backlog_soft_limit: usize,
    pub backlog_low: usize,
    pub backlog_target: usize,
    pub maintain_backlog: bool,
    pub catchup_batch: usize,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            min_runtime_secs: 1.0,
            provision_bias: 1.0,
            recovery_bias: 1.5,
            wait_threshold_secs: 10.0,
            backlog_soft_limit: 10,
            backlog_low: 2,
            backlog_target: 0,
            maintain_backlog: false,
            catchup_batch: 5,
        }
    }
}

/// Controller-wide tuning: tick cadence and scale-down damping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_interval_secs: f64,
    pub scale_down_cooldown_secs: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 2.0,
            scale_down_cooldown_secs: 15.0,
        }
    }
}

/// Router tuning: failover stickiness and the free-queue-overloaded
/// heuristic's constants, exposed as config per the spec's redesign note
/// rather than hard-coded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub failover_cooldown_secs: f64,
    pub bootstrap_grace_secs: f64,
    /// Multiplier applied to `backlog_high` in the overload backlog check.
    pub overload_backlog_high_multiplier: f64,
    /// Minimum margin subtracted from `backlog_hard_limit` in the overload
    /// hard-limit check; the actual margin is `max(this, max_workers)`.
    pub overload_hard_limit_margin: usize,
    /// Multiplier applied to `runtime_signal` in the overload wait check.
    pub overload_wait_runtime_multiplier: f64,
    /// Minimum absolute wait-signal floor in the overload wait check.
    pub overload_wait_floor_secs: f64,
    /// Deadline applied to accelerated video tasks, seconds. `None` derives
    /// it from `video_wall_clock_limit_secs` via the formula in
    /// `video_task_timeout_secs`.
    pub video_task_timeout_secs: Option<f64>,
    /// Upstream wall-clock limit used to derive the default video timeout
    /// when `video_task_timeout_secs` is unset.
    pub video_wall_clock_limit_secs: f64,
    /// Fallback multiplier for the free queue's `backlog_high` watermark
    /// when the queue hasn't set one, used by the overload heuristic.
    pub overload_backlog_high_fallback_multiplier: usize,
    /// Floor applied alongside the fallback multiplier above.
    pub overload_backlog_high_fallback_floor: usize,
}

impl RouterConfig {
    /// Effective video-task deadline: the configured override, or
    /// `clamp(video_wall_clock_limit_secs + 30, 90, 240)`.
    pub fn video_task_timeout(&self) -> f64 {
        self.video_task_timeout_secs.unwrap_or_else(|| {
            (self.video_wall_clock_limit_secs + 30.0).clamp(90.0, 240.0)
        })
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            failover_cooldown_secs: 30.0,
            bootstrap_grace_secs: 30.0 * 60.0,
            overload_backlog_high_multiplier: 1.25,
            overload_hard_limit_margin: 5,
            overload_wait_runtime_multiplier: 3.0,
            overload_wait_floor_secs: 10.0,
            video_task_timeout_secs: None,
            video_wall_clock_limit_secs: 105.0,
            overload_backlog_high_fallback_multiplier: 3,
            overload_backlog_high_fallback_floor: 12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_timeout_defaults_are_clamped_into_range() {
        let mut cfg = RouterConfig::default();
        cfg.video_wall_clock_limit_secs = 0.0;
        assert_eq!(cfg.video_task_timeout(), 90.0);
        cfg.video_wall_clock_limit_secs = 1000.0;
        assert_eq!(cfg.video_task_timeout(), 240.0);
        cfg.video_wall_clock_limit_secs = 75.0;
        assert_eq!(cfg.video_task_timeout(), 105.0);
    }

    #[test]
    fn explicit_video_timeout_overrides_formula() {
        let mut cfg = RouterConfig::default();
        cfg.video_task_timeout_secs = Some(150.0);
        assert_eq!(cfg.video_task_timeout(), 150.0);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let cfg = AdaptiveQueueConfig::default();
        let text = toml::to_string(&cfg).expect("serialize");
        let parsed: AdaptiveQueueConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(parsed.worker_queue.baseline_workers, cfg.worker_queue.baseline_workers);
        assert_eq!(parsed.router.failover_cooldown_secs, cfg.router.failover_cooldown_secs);
    }
}
