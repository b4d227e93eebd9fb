use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::dispatcher::{Dispatcher, PendingFinish};
use crate::error::ConfigurationError;
use crate::handler::{HandlerRegistry, TaskHandler, TimerId};
use crate::metrics::SchedulerMetrics;
use crate::pool::WorkerPool;

/// Lifecycle of a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Firing at its interval. Holds for the life of the process.
    Scheduled,
    /// Stopped at scheduler shutdown. Terminal.
    Cancelled,
}

pub(super) struct Timer {
    pub(super) id: TimerId,
    pub(super) handler: Arc<dyn TaskHandler>,
    pub(super) period: Duration,
    pub(super) state: TimerState,
    /// Fires so far, skipped ones included.
    pub(super) fires: u64,
}

/// The tick scheduler. Fires each registered handler's timer, checks pool
/// capacity, and hands whatever `on_tick` returns to the [`Dispatcher`].
pub struct Scheduler {
    pub(super) dispatcher: Dispatcher,
    /// Fire-and-forget completions coming back from pool workers.
    pub(super) completions: mpsc::UnboundedReceiver<PendingFinish>,
    pub(super) timers: Vec<Timer>,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    pub(super) shutdown: Arc<watch::Sender<bool>>,
}

/// Cloneable handle that stops a running [`Scheduler`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        info!("Scheduler shutdown requested");
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Scheduler {
    /// Create a scheduler submitting to `pool`.
    pub fn new(pool: Arc<dyn WorkerPool>) -> Self {
        let metrics = Arc::new(RwLock::new(SchedulerMetrics::default()));
        let (dispatcher, completions) = Dispatcher::new(pool);
        let (shutdown, _) = watch::channel(false);
        Self {
            dispatcher: dispatcher.with_metrics(Arc::clone(&metrics)),
            completions,
            timers: Vec::new(),
            metrics,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Register a handler and create its recurring timer.
    ///
    /// A negative interval is rejected and leaves every other registration
    /// untouched. An interval of 0 fires every millisecond.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<TimerId, ConfigurationError> {
        let interval_ms = handler.tick_interval_ms();
        if interval_ms < 0 {
            error!(
                handler = %handler.name(),
                interval_ms,
                "tick interval must be at least 0ms, handler not scheduled"
            );
            return Err(ConfigurationError::NegativeInterval {
                handler: handler.name().to_string(),
                interval_ms,
            });
        }

        let id = self.timers.len() as TimerId + 1;
        let period = Duration::from_millis(interval_ms.max(1) as u64);
        info!(handler = %handler.name(), timer_id = id, interval_ms, "Registered task handler");
        self.timers.push(Timer {
            id,
            handler,
            period,
            state: TimerState::Scheduled,
            fires: 0,
        });
        Ok(id)
    }

    /// Register every handler named in `config.tasks`, in order, with its
    /// configured overrides applied.
    ///
    /// Names missing from `registry` and handlers that fail registration are
    /// logged and skipped.
    pub fn register_from_config(&mut self, registry: &HandlerRegistry, config: &SchedulerConfig) -> Vec<TimerId> {
        let mut ids = Vec::with_capacity(config.tasks.len());
        for name in &config.tasks {
            let Some(handler) = registry.get(name) else {
                warn!(handler = %name, "task handler {} not found, skipping", name);
                continue;
            };
            match self.register(config.apply_to(Arc::clone(handler))) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(handler = %name, error = %e, "task handler {} not scheduled", name),
            }
        }
        ids
    }

    pub fn timer_ids(&self) -> Vec<TimerId> {
        self.timers.iter().map(|t| t.id).collect()
    }

    pub fn timer_state(&self, timer_id: TimerId) -> Option<TimerState> {
        self.timer(timer_id).map(|t| t.state)
    }

    /// Effective period of a timer, after clamping 0 to 1ms.
    pub fn timer_period(&self, timer_id: TimerId) -> Option<Duration> {
        self.timer(timer_id).map(|t| t.period)
    }

    /// Name of the handler behind a timer.
    pub fn handler_name(&self, timer_id: TimerId) -> Option<&str> {
        self.timer(timer_id).map(|t| t.handler.name())
    }

    pub fn pool(&self) -> &Arc<dyn WorkerPool> {
        self.dispatcher.pool()
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.read().map(|m| m.clone()).unwrap_or_default()
    }

    /// Get an Arc to the metrics (for external reads without cloning).
    pub fn metrics_handle(&self) -> Arc<RwLock<SchedulerMetrics>> {
        Arc::clone(&self.metrics)
    }

    /// Signal the scheduler to stop.
    pub fn shutdown(&self) {
        self.shutdown_handle().shutdown();
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    pub(super) fn timer(&self, timer_id: TimerId) -> Option<&Timer> {
        self.timers.iter().find(|t| t.id == timer_id)
    }

    pub(super) fn record(&self, f: impl FnOnce(&mut SchedulerMetrics)) {
        if let Ok(mut m) = self.metrics.write() {
            f(&mut m);
        }
    }
}
