//! tickpool: run interval-driven task handlers on a local worker pool.
//!
//! Ships three demo handlers, one per delivery mode:
//! - `heartbeat`: fire-and-forget, pinned to no particular worker
//! - `probe`: waits for one result with a timeout
//! - `batch`: fans a small batch out and waits for all of it
//!
//! # Usage
//!
//! ```bash
//! # All demo handlers, default pool size
//! tickpool
//!
//! # From a config file
//! tickpool --config tickpool.toml
//!
//! # Via environment variables
//! TICKPOOL_WORKERS=2 TICKPOOL_TASKS=heartbeat,batch RUST_LOG=debug tickpool
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use tickpool_scheduler::{
    Completion, HandlerRegistry, LocalPool, Scheduler, SchedulerConfig, TaskContext, TaskHandler, TimerId,
    TimerResult, WorkItem,
};
use tracing::info;

/// Interval-driven task scheduler backed by a local worker pool.
#[derive(Parser, Debug)]
#[command(name = "tickpool", version, about)]
struct Cli {
    /// Path to a TOML config file. Without one, every demo handler runs.
    #[arg(long, env = "TICKPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Worker count override (0 = available parallelism).
    #[arg(long)]
    workers: Option<usize>,

    /// Interval in seconds between metrics log lines (0 = disabled).
    #[arg(long, env = "TICKPOOL_METRICS_INTERVAL", default_value_t = 30)]
    metrics_interval: u64,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<SchedulerConfig> {
        let mut config = match &self.config {
            Some(path) => SchedulerConfig::from_file(path)?,
            None => {
                let mut config = SchedulerConfig {
                    tasks: DEMO_HANDLERS.iter().map(|s| s.to_string()).collect(),
                    ..Default::default()
                };
                config.apply_env_overrides();
                config.validate()?;
                config
            }
        };
        if let Some(workers) = self.workers {
            config.pool.workers = workers;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!(?cli, "starting tickpool");

    let config = cli.load_config()?;
    let registry = Arc::new(demo_registry()?);
    let workers = config.pool.resolved_workers();
    let pool = Arc::new(LocalPool::spawn(workers, Arc::clone(&registry)));

    let mut scheduler = Scheduler::new(pool.clone());
    let timers = scheduler.register_from_config(&registry, &config);
    info!(workers, timers = timers.len(), "pool and timers ready");

    let stop = scheduler.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        stop.shutdown();
    });

    // Periodic metrics reporter.
    if cli.metrics_interval > 0 {
        let metrics = scheduler.metrics_handle();
        let every = Duration::from_secs(cli.metrics_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Ok(snapshot) = metrics.read().map(|m| m.clone()) else {
                    continue;
                };
                for (handler, m) in &snapshot.handlers {
                    info!(
                        handler = %handler,
                        fired = m.ticks_fired,
                        skipped = m.skipped_total(),
                        submitted = m.submissions_total(),
                        failures = m.tick_failures,
                        dropped = m.dropped_fires,
                        "handler metrics"
                    );
                }
            }
        });
    }

    // Run the scheduler (blocks until shutdown).
    scheduler.run().await;
    pool.shutdown().await;

    info!("tickpool exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}

// ── Demo handlers ───────────────────────────────────────────────────

const DEMO_HANDLERS: [&str; 3] = ["heartbeat", "probe", "batch"];

fn demo_registry() -> anyhow::Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(Heartbeat::default()))?;
    registry.register(Arc::new(Probe))?;
    registry.register(Arc::new(Batch))?;
    Ok(registry)
}

/// Fire-and-forget: counts beats on whichever worker is free.
#[derive(Default)]
struct Heartbeat {
    beats: AtomicU64,
}

#[async_trait]
impl TaskHandler for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn tick_interval_ms(&self) -> i64 {
        1000
    }

    fn allow_submit_when_no_idle_worker(&self) -> bool {
        true
    }

    fn max_queued_tasks(&self) -> usize {
        16
    }

    fn on_tick(&self, _timer_id: TimerId, ctx: &TaskContext) -> anyhow::Result<Option<TimerResult>> {
        Ok(Some(TimerResult::fire_and_forget(json!({ "tick": ctx.tick }))))
    }

    async fn on_work(&self, item: &WorkItem, payload: Value) -> anyhow::Result<Value> {
        let beat = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(json!({ "beat": beat, "task_id": item.task_id, "sent": payload }))
    }

    fn on_finish(&self, _ctx: &TaskContext, _original: &Value, completion: Completion) -> anyhow::Result<()> {
        tracing::debug!(worker_id = ?completion.worker_id(), "heartbeat acknowledged");
        Ok(())
    }
}

/// Wait-one: asks worker 0 for a timestamp, tolerating a slow answer.
struct Probe;

#[async_trait]
impl TaskHandler for Probe {
    fn name(&self) -> &str {
        "probe"
    }

    fn tick_interval_ms(&self) -> i64 {
        5000
    }

    fn allow_submit_when_no_idle_worker(&self) -> bool {
        false
    }

    fn max_queued_tasks(&self) -> usize {
        0
    }

    fn on_tick(&self, _timer_id: TimerId, ctx: &TaskContext) -> anyhow::Result<Option<TimerResult>> {
        let result = TimerResult::wait_one(json!({ "probe": ctx.tick }), 1.0).with_target_worker_id(0);
        Ok(Some(result))
    }

    async fn on_work(&self, _item: &WorkItem, _payload: Value) -> anyhow::Result<Value> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!(chrono::Utc::now().to_rfc3339()))
    }

    fn on_finish(&self, _ctx: &TaskContext, _original: &Value, completion: Completion) -> anyhow::Result<()> {
        if let Completion::WaitOne { result, .. } = completion {
            match result.into_value() {
                Some(at) => info!(%at, "probe answered"),
                None => tracing::warn!("probe timed out"),
            }
        }
        Ok(())
    }
}

/// Wait-many: squares a handful of numbers in parallel.
struct Batch;

#[async_trait]
impl TaskHandler for Batch {
    fn name(&self) -> &str {
        "batch"
    }

    fn tick_interval_ms(&self) -> i64 {
        3000
    }

    fn allow_submit_when_no_idle_worker(&self) -> bool {
        false
    }

    fn max_queued_tasks(&self) -> usize {
        4
    }

    fn on_tick(&self, _timer_id: TimerId, ctx: &TaskContext) -> anyhow::Result<Option<TimerResult>> {
        if ctx.stats.idle_worker_count < 2 {
            return Ok(None);
        }
        let items: Vec<Value> = (1..=5).map(|n| json!(n + ctx.tick)).collect();
        Ok(Some(TimerResult::wait_many(Value::Array(items), 0.5)))
    }

    async fn on_work(&self, _item: &WorkItem, payload: Value) -> anyhow::Result<Value> {
        let n = payload
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("expected a number, got {}", payload))?;
        Ok(json!(n * n))
    }

    fn on_finish(&self, _ctx: &TaskContext, original: &Value, completion: Completion) -> anyhow::Result<()> {
        if let Completion::WaitMany { results } = completion {
            let submitted = original.as_array().map_or(0, Vec::len);
            info!(submitted, completed = results.len(), "batch finished");
        }
        Ok(())
    }
}
