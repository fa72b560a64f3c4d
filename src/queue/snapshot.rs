//! Immutable point-in-time view of a worker queue, used by monitors and the
//! adaptive controller without holding any queue lock.

use std::sync::Arc;

use super::types::TaskRuntimeDetail;

/// A consistent read of one queue's sizing, backlog, and timing state.
///
/// Built from [`crate::queue::worker_queue::WorkerQueue::snapshot`]; never
/// mutated after construction.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub name: Arc<str>,
    pub backlog: usize,
    pub active_workers: usize,
    pub busy_workers: usize,
    pub max_workers: usize,
    pub baseline_workers: usize,
    pub autoscale_max: usize,
    pub pending_stops: usize,
    pub backlog_high: Option<usize>,
    pub backlog_low: Option<usize>,
    pub backlog_hard_limit: Option<usize>,
    pub backlog_shed_to: Option<usize>,
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
    pub check_interval: f64,
    pub scale_down_grace: f64,
}

impl QueueSnapshot {
    /// Current usable worker capacity.
    pub fn capacity(&self) -> usize {
        self.max_workers.max(self.baseline_workers)
    }

    /// `backlog / backlog_high`, or `0.0` when no high watermark is set.
    pub fn backlog_ratio(&self) -> f64 {
        match self.backlog_high {
            Some(high) if high > 0 => self.backlog as f64 / high as f64,
            _ => 0.0,
        }
    }

    /// Backlog above the high watermark (or above capacity, if unset).
    pub fn backlog_excess(&self) -> usize {
        match self.backlog_high {
            Some(high) if high > 0 => self.backlog.saturating_sub(high),
            _ => self.backlog.saturating_sub(self.capacity()),
        }
    }

    /// A representative runtime: the first positive value among
    /// avg/ema/last/longest runtime.
    pub fn runtime_signal(&self) -> f64 {
        first_positive([
            self.avg_runtime,
            self.ema_runtime,
            self.last_runtime,
            self.longest_runtime,
        ])
    }

    /// Peak wait time seen, across avg/ema/last/longest.
    pub fn wait_signal(&self) -> f64 {
        max_positive([self.avg_wait, self.ema_wait, self.last_wait, self.longest_wait])
    }

    /// Whether waiting tasks are taking disproportionately long relative to
    /// the runtime signal, or (absent a runtime signal) in absolute terms.
    pub fn wait_pressure(&self) -> bool {
        let runtime = self.runtime_signal();
        if runtime > 0.0 {
            let checks = [
                (self.avg_wait, (runtime * 2.0).max(5.0)),
                (self.last_wait, (runtime * 2.5).max(10.0)),
                (self.longest_wait, (runtime * 3.0).max(15.0)),
            ];
            checks.into_iter().any(|(value, threshold)| value >= threshold)
        } else {
            self.wait_signal() >= 10.0
        }
    }

    /// True once backlog has fallen back within acceptable bounds.
    pub fn backlog_recovered(&self) -> bool {
        if self.backlog == 0 {
            return true;
        }
        if let Some(low) = self.backlog_low {
            if self.backlog <= low {
                return true;
            }
        }
        self.backlog <= self.baseline_workers
    }
}

fn first_positive(values: impl IntoIterator<Item = f64>) -> f64 {
    values.into_iter().find(|&v| v > 0.0).unwrap_or(0.0)
}

fn max_positive(values: impl IntoIterator<Item = f64>) -> f64 {
    values.into_iter().fold(0.0, f64::max)
}

fn weighted_average(pairs: &[(f64, u64)]) -> f64 {
    let (mut total_value, mut total_weight) = (0.0, 0u64);
    let mut fallback = Vec::new();
    for &(value, weight) in pairs {
        fallback.push(value);
        if weight > 0 {
            total_value += value * weight as f64;
            total_weight += weight;
        }
    }
    if total_weight > 0 {
        total_value / total_weight as f64
    } else if !fallback.is_empty() {
        fallback.iter().sum::<f64>() / fallback.len() as f64
    } else {
        0.0
    }
}

fn detail_timestamp(detail: &TaskRuntimeDetail) -> std::time::SystemTime {
    detail.completed_at_wall
}

/// Combines several queue snapshots (e.g. the free/accelerated tiers) into
/// one aggregated view under `name`. Counters sum; rates are weighted by
/// `tasks_completed`; retained details pick the most recent / longest.
///
/// # Panics
/// Panics if `snapshots` is empty (callers always aggregate over at least
/// one queue).
pub fn merge_queue_snapshots(name: impl Into<Arc<str>>, snapshots: &[QueueSnapshot]) -> QueueSnapshot {
    assert!(!snapshots.is_empty(), "merge_queue_snapshots requires at least one snapshot");
    let name = name.into();
    if snapshots.len() == 1 {
        let mut only = snapshots[0].clone();
        only.name = name;
        return only;
    }

    let sum_usize = |f: fn(&QueueSnapshot) -> usize| snapshots.iter().map(f).sum::<usize>();
    let sum_u64 = |f: fn(&QueueSnapshot) -> u64| snapshots.iter().map(f).sum::<u64>();
    let sum_optional = |f: fn(&QueueSnapshot) -> Option<usize>| -> Option<usize> {
        let values: Vec<usize> = snapshots.iter().filter_map(f).collect();
        if values.is_empty() { None } else { Some(values.into_iter().sum()) }
    };

    let tasks_completed = sum_u64(|s| s.tasks_completed);
    let avg_runtime = weighted_average(
        &snapshots.iter().map(|s| (s.avg_runtime, s.tasks_completed)).collect::<Vec<_>>(),
    );
    let avg_wait = weighted_average(
        &snapshots.iter().map(|s| (s.avg_wait, s.tasks_completed)).collect::<Vec<_>>(),
    );
    let ema_runtime = weighted_average(
        &snapshots.iter().map(|s| (s.ema_runtime, s.tasks_completed)).collect::<Vec<_>>(),
    );
    let ema_wait = weighted_average(
        &snapshots.iter().map(|s| (s.ema_wait, s.tasks_completed)).collect::<Vec<_>>(),
    );

    let last_detail = snapshots
        .iter()
        .filter_map(|s| s.last_runtime_detail.clone())
        .max_by_key(detail_timestamp);
    let longest_detail = snapshots
        .iter()
        .filter(|s| s.longest_runtime_detail.is_some())
        .max_by(|a, b| a.longest_runtime.total_cmp(&b.longest_runtime))
        .and_then(|s| s.longest_runtime_detail.clone());

    let longest_runtime = snapshots.iter().map(|s| s.longest_runtime).fold(0.0, f64::max);
    let longest_wait = snapshots.iter().map(|s| s.longest_wait).fold(0.0, f64::max);
    let last_runtime = last_detail
        .as_ref()
        .map(|d| d.runtime)
        .unwrap_or_else(|| snapshots.iter().map(|s| s.last_runtime).fold(0.0, f64::max));
    let last_wait = last_detail
        .as_ref()
        .map(|d| d.wait)
        .unwrap_or_else(|| snapshots.iter().map(|s| s.last_wait).fold(0.0, f64::max));

    QueueSnapshot {
        name,
        backlog: sum_usize(|s| s.backlog),
        active_workers: sum_usize(|s| s.active_workers),
        busy_workers: sum_usize(|s| s.busy_workers),
        max_workers: sum_usize(|s| s.max_workers),
        baseline_workers: sum_usize(|s| s.baseline_workers),
        autoscale_max: sum_usize(|s| s.autoscale_max),
        pending_stops: sum_usize(|s| s.pending_stops),
        backlog_high: sum_optional(|s| s.backlog_high),
        backlog_low: sum_optional(|s| s.backlog_low),
        backlog_hard_limit: sum_optional(|s| s.backlog_hard_limit),
        backlog_shed_to: sum_optional(|s| s.backlog_shed_to),
        dropped_total: sum_u64(|s| s.dropped_total),
        tasks_completed,
        avg_runtime,
        avg_wait,
        ema_runtime,
        ema_wait,
        last_runtime,
        last_wait,
        longest_runtime,
        longest_wait,
        last_runtime_detail: last_detail,
        longest_runtime_detail: longest_detail,
        check_interval: snapshots.iter().map(|s| s.check_interval).fold(0.0, f64::max),
        scale_down_grace: snapshots.iter().map(|s| s.scale_down_grace).fold(0.0, f64::max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(name: &str) -> QueueSnapshot {
        QueueSnapshot {
            name: name.into(),
            backlog: 0,
            active_workers: 1,
            busy_workers: 0,
            max_workers: 1,
            baseline_workers: 1,
            autoscale_max: 1,
            pending_stops: 0,
            backlog_high: Some(10),
            backlog_low: Some(2),
            backlog_hard_limit: None,
            backlog_shed_to: None,
            dropped_total: 0,
            tasks_completed: 0,
            avg_runtime: 0.0,
            avg_wait: 0.0,
            ema_runtime: 0.0,
            ema_wait: 0.0,
            last_runtime: 0.0,
            last_wait: 0.0,
            longest_runtime: 0.0,
            longest_wait: 0.0,
            last_runtime_detail: None,
            longest_runtime_detail: None,
            check_interval: 5.0,
            scale_down_grace: 60.0,
        }
    }

    #[test]
    fn backlog_excess_uses_high_watermark_when_set() {
        let mut s = base("q");
        s.backlog = 15;
        assert_eq!(s.backlog_excess(), 5);
    }

    #[test]
    fn backlog_excess_falls_back_to_capacity_without_watermark() {
        let mut s = base("q");
        s.backlog_high = None;
        s.backlog = 4;
        s.max_workers = 2;
        s.baseline_workers = 1;
        assert_eq!(s.backlog_excess(), 2);
    }

    #[test]
    fn wait_pressure_true_when_no_runtime_signal_and_absolute_wait_high() {
        let mut s = base("q");
        s.last_wait = 12.0;
        assert!(s.wait_pressure());
    }

    #[test]
    fn wait_pressure_compares_against_runtime_scaled_thresholds() {
        let mut s = base("q");
        s.avg_runtime = 2.0;
        s.avg_wait = 4.5; // below max(5.0, 4.0) = 5.0
        s.last_wait = 6.0; // below max(10.0, 5.0) = 10.0
        s.longest_wait = 7.0; // below max(15.0, 6.0) = 15.0
        assert!(!s.wait_pressure());
        s.avg_wait = 5.5;
        assert!(s.wait_pressure());
    }

    #[test]
    fn backlog_recovered_checks_low_watermark_then_baseline() {
        let mut s = base("q");
        s.backlog = 2;
        assert!(s.backlog_recovered());
        s.backlog_low = None;
        s.backlog = 1;
        s.baseline_workers = 1;
        assert!(s.backlog_recovered());
        s.backlog = 3;
        assert!(!s.backlog_recovered());
    }

    #[test]
    fn merge_of_single_snapshot_renames_only() {
        let merged = merge_queue_snapshots("combined", &[base("q1")]);
        assert_eq!(&*merged.name, "combined");
        assert_eq!(merged.backlog, 0);
    }

    #[test]
    fn merge_sums_counters_and_weight_averages_rates() {
        let mut a = base("a");
        a.tasks_completed = 10;
        a.avg_runtime = 2.0;
        a.backlog = 3;
        let mut b = base("b");
        b.tasks_completed = 30;
        b.avg_runtime = 6.0;
        b.backlog = 7;

        let merged = merge_queue_snapshots("combined", &[a, b]);
        assert_eq!(merged.tasks_completed, 40);
        assert_eq!(merged.backlog, 10);
        // weighted: (2*10 + 6*30) / 40 = 5.0
        assert!((merged.avg_runtime - 5.0).abs() < 1e-9);
    }
}
