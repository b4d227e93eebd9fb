//! Interval-driven task scheduler that hands work to a worker pool.
//!
//! Each [`TaskHandler`] gets a recurring timer. On every fire the scheduler
//! checks pool capacity, asks the handler what to do via `on_tick`, and
//! submits the returned [`TimerResult`] in one of three modes:
//! fire-and-forget, wait for one result, or fan a batch out and wait for all.
//! Results come back through `on_finish`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tickpool_scheduler::{HandlerRegistry, LocalPool, Scheduler, SchedulerConfig};
//!
//! # async fn demo(registry: HandlerRegistry) -> anyhow::Result<()> {
//! let config = SchedulerConfig::from_file("tickpool.toml")?;
//! let registry = Arc::new(registry);
//! let pool = Arc::new(LocalPool::spawn(config.pool.resolved_workers(), Arc::clone(&registry)));
//!
//! let mut scheduler = Scheduler::new(pool.clone());
//! scheduler.register_from_config(&registry, &config);
//! scheduler.run().await;
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod timer_result;

pub use config::{HandlerOverride, PoolConfig, SchedulerConfig};
pub use dispatcher::{validate_batch, Dispatcher, PendingFinish};
pub use error::{ConfigurationError, DispatchError, PoolError, TaskError, TickError};
pub use handler::{Completion, HandlerRegistry, TaskContext, TaskHandler, TimerId};
pub use metrics::{HandlerMetrics, SchedulerMetrics};
pub use pool::{
    CompletionCallback, LocalPool, PoolStats, TaskDescriptor, WaitOutcome, WorkItem, WorkerPool, WorkerStats,
};
pub use scheduler::{check_admission, Scheduler, ShutdownHandle, SkipReason, TickOutcome, TimerState};
pub use timer_result::{Delivery, DispatchMode, TimerResult, WorkerTarget, DEFAULT_TIMEOUT_SECS, MAX_BATCH_ITEMS};
