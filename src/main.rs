//! adaptive-queue-demo
//!
//! A runnable demonstration of the adaptive worker queue subsystem: wires a
//! free tier (internal autoscaler) and an accelerated tier (external
//! `AdaptiveController`) behind a `Router`, drives a synthetic load
//! generator against them, and prints periodic queue snapshots. Stands in
//! for the surrounding chat-platform event loop that would otherwise
//! produce moderation-scan tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use adaptive_queue::prelude::*;
use adaptive_queue::queue::events::QueueEventLogger;
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Drives a synthetic moderation-scan workload through the adaptive queue
/// subsystem.
#[derive(Parser, Debug)]
#[command(name = "adaptive-queue-demo", version, about)]
struct Args {
    /// How long to run the load generator, in seconds.
    #[arg(long, default_value_t = 20)]
    duration_secs: u64,

    /// Average arrival rate, tasks per second, across all tenants.
    #[arg(long, default_value_t = 8.0)]
    arrival_per_sec: f64,

    /// Number of distinct tenants to simulate.
    #[arg(long, default_value_t = 6)]
    tenants: u64,

    /// Tenant id (1-indexed) that holds an accelerated-tier entitlement.
    #[arg(long, default_value_t = 1)]
    entitled_tenant: u64,

    /// Verbosity: 0 = warn, 1 = info, 2 = debug, 3+ = trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// A static entitlement store for the demo: one tenant is permanently
/// entitled, everyone else is not, and nobody is newly onboarded. A
/// production host would back this with its account/billing store.
struct DemoEntitlementStore {
    entitled_tenant: TenantId,
}

#[async_trait]
impl EntitlementStore for DemoEntitlementStore {
    async fn is_accelerated(&self, tenant_id: TenantId) -> bool {
        tenant_id == self.entitled_tenant
    }

    async fn joined_at(&self, _tenant_id: TenantId) -> Option<SystemTime> {
        None
    }
}

/// Logs singular slow-task alerts via `tracing`, the way a real reporter
/// would render an operator-channel message.
struct LoggingSlowTaskReporter;

#[async_trait]
impl SlowTaskReporter for LoggingSlowTaskReporter {
    async fn report(&self, detail: &TaskRuntimeDetail, queue_name: &str) {
        tracing::warn!(
            queue = queue_name,
            task = %detail.metadata.display_name,
            runtime = detail.runtime,
            "singular slow task"
        );
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let sink: Arc<dyn StructuredEventSink> = Arc::new(TracingSink);
    let reporter: Arc<dyn SlowTaskReporter> = Arc::new(LoggingSlowTaskReporter);

    let free_queue = WorkerQueue::new(
        "free",
        WorkerQueueConfig {
            baseline_workers: 2,
            max_workers: 2,
            autoscale_max: 6,
            backlog_high: Some(15),
            backlog_low: Some(3),
            backlog_hard_limit: Some(40),
            backlog_shed_to: Some(20),
            ..WorkerQueueConfig::default()
        },
        false,
        Some(Arc::clone(&reporter)),
        Arc::clone(&sink),
    );

    let accelerated_queue = WorkerQueue::new(
        "accelerated",
        WorkerQueueConfig { baseline_workers: 2, max_workers: 2, ..WorkerQueueConfig::default() },
        true,
        Some(Arc::clone(&reporter)),
        Arc::clone(&sink),
    );
    let accelerated_text_queue = WorkerQueue::new(
        "accelerated_text",
        WorkerQueueConfig { baseline_workers: 1, max_workers: 1, ..WorkerQueueConfig::default() },
        true,
        Some(Arc::clone(&reporter)),
        Arc::clone(&sink),
    );
    let video_queue = WorkerQueue::new(
        "video",
        WorkerQueueConfig { baseline_workers: 1, max_workers: 1, ..WorkerQueueConfig::default() },
        true,
        Some(Arc::clone(&reporter)),
        Arc::clone(&sink),
    );

    free_queue.start().await;
    accelerated_queue.start().await;
    accelerated_text_queue.start().await;
    video_queue.start().await;

    let controller = AdaptiveController::new(
        ControllerConfig::default(),
        vec![
            (Arc::clone(&accelerated_queue), QueuePolicy { min_workers: 2, max_workers: 16, ..QueuePolicy::default() }),
            (Arc::clone(&accelerated_text_queue), QueuePolicy { min_workers: 1, max_workers: 8, ..QueuePolicy::default() }),
            (Arc::clone(&video_queue), QueuePolicy {
                min_workers: 1,
                max_workers: 8,
                min_runtime_secs: 3.0,
                ..QueuePolicy::default()
            }),
        ],
    );
    controller.start();

    let entitlement = Arc::new(DemoEntitlementStore { entitled_tenant: TenantId(args.entitled_tenant) });
    let router = Arc::new(Router::new(
        Arc::clone(&free_queue),
        Arc::clone(&accelerated_queue),
        Arc::clone(&accelerated_text_queue),
        Arc::clone(&video_queue),
        entitlement,
        RouterConfig::default(),
        QueueEventLogger::new(Arc::clone(&sink)),
    ));

    let completed = Arc::new(AtomicU64::new(0));
    let load_handle = tokio::spawn(generate_load(Arc::clone(&router), args.arrival_per_sec, args.tenants, Arc::clone(&completed)));

    let report_handle = tokio::spawn(report_metrics(
        Arc::clone(&free_queue),
        Arc::clone(&accelerated_queue),
        Arc::clone(&completed),
    ));

    tokio::time::sleep(Duration::from_secs(args.duration_secs)).await;

    load_handle.abort();
    report_handle.abort();
    controller.stop().await;
    free_queue.stop().await;
    accelerated_queue.stop().await;
    accelerated_text_queue.stop().await;
    video_queue.stop().await;

    println!("completed {} tasks in {}s", completed.load(Ordering::Relaxed), args.duration_secs);
}

/// Generates a synthetic workload: image/video/text tasks for a rotating
/// set of tenants, each taking a random 10-200ms to "scan".
async fn generate_load(router: Arc<Router>, arrival_per_sec: f64, tenants: u64, completed: Arc<AtomicU64>) {
    let mean_interval = Duration::from_secs_f64(1.0 / arrival_per_sec.max(0.01));
    loop {
        tokio::time::sleep(mean_interval).await;
        let (tenant_id, kind, runtime) = {
            let mut rng = rand::thread_rng();
            let tenant_id = TenantId(rng.gen_range(1..=tenants));
            let kind = match rng.gen_range(0..3) {
                0 => TaskKind::Image,
                1 => TaskKind::Video,
                _ => TaskKind::Text,
            };
            let runtime = Duration::from_millis(rng.gen_range(10..200));
            (tenant_id, kind, runtime)
        };

        let completed = Arc::clone(&completed);
        let task = Task::new(
            TaskMetadata::new(format!("scan-{kind}"), tenant_id, kind),
            Box::pin(async move {
                tokio::time::sleep(runtime).await;
                completed.fetch_add(1, Ordering::Relaxed);
            }),
        );
        if let Err(err) = router.submit(task).await {
            tracing::warn!(error = %err, "dropped task submission");
        }
    }
}

/// Prints a one-line snapshot of the free and accelerated tiers every few
/// seconds, the way an operator dashboard would poll `queue.metrics()`.
async fn report_metrics(free: Arc<WorkerQueue>, accelerated: Arc<WorkerQueue>, completed: Arc<AtomicU64>) {
    let mut interval = tokio::time::interval(Duration::from_secs(3));
    loop {
        interval.tick().await;
        let f = free.snapshot();
        let a = accelerated.snapshot();
        println!(
            "free: workers={} backlog={} dropped={} | accelerated: workers={} backlog={} | completed={}",
            f.max_workers,
            f.backlog,
            f.dropped_total,
            a.max_workers,
            a.backlog,
            completed.load(Ordering::Relaxed),
        );
    }
}

fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbosity >= 3))
        .with(env_filter)
        .init();
}
