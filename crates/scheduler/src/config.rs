use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigurationError;
use crate::handler::{Completion, TaskContext, TaskHandler, TimerId};
use crate::pool::WorkItem;
use crate::timer_result::TimerResult;

// ── Top-level config ────────────────────────────────────────────────

/// Scheduler configuration, parsed from `tickpool.toml`.
///
/// ```toml
/// tasks = ["report", "cleanup"]
///
/// [pool]
/// workers = 4
///
/// [handlers.cleanup]
/// tick_interval_ms = 5000
/// max_queued_tasks = 10
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Handler names to schedule, in registration order.
    #[serde(default)]
    pub tasks: Vec<String>,

    /// Settings for the bundled local pool.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Per-handler overrides of the handler's own cadence and thresholds.
    #[serde(default)]
    pub handlers: HashMap<String, HandlerOverride>,
}

// ── Section configs ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of pool workers. 0 = available parallelism.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    4
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

impl PoolConfig {
    /// Resolve worker count (0 means use available parallelism).
    pub fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.workers
        }
    }
}

/// Overrides for one handler. Unset fields keep the handler's own value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerOverride {
    pub tick_interval_ms: Option<i64>,
    pub allow_submit_when_no_idle_worker: Option<bool>,
    pub max_queued_tasks: Option<usize>,
}

impl HandlerOverride {
    pub fn is_empty(&self) -> bool {
        self == &HandlerOverride::default()
    }
}

// ── Loading & Validation ────────────────────────────────────────────

impl SchedulerConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigurationError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Apply environment variable overrides.
    ///
    /// - `TICKPOOL_WORKERS` -> `pool.workers`
    /// - `TICKPOOL_TASKS` (comma-separated) -> `tasks`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TICKPOOL_WORKERS") {
            if let Ok(workers) = v.trim().parse::<usize>() {
                self.pool.workers = workers;
            }
        }
        if let Some(v) = lookup("TICKPOOL_TASKS") {
            self.tasks = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Some(blank) = self.tasks.iter().position(|name| name.trim().is_empty()) {
            return Err(ConfigurationError::Invalid(format!(
                "tasks[{blank}] is an empty handler name"
            )));
        }
        for (name, ov) in &self.handlers {
            if let Some(interval_ms) = ov.tick_interval_ms.filter(|ms| *ms < 0) {
                return Err(ConfigurationError::NegativeInterval {
                    handler: name.clone(),
                    interval_ms,
                });
            }
        }
        Ok(())
    }

    /// Wrap `handler` with its configured overrides, if any.
    pub fn apply_to(&self, handler: Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler> {
        match self.handlers.get(handler.name()) {
            Some(ov) if !ov.is_empty() => Arc::new(Overridden {
                inner: handler,
                overrides: ov.clone(),
            }),
            _ => handler,
        }
    }
}

/// A handler whose cadence and thresholds come partly from config.
struct Overridden {
    inner: Arc<dyn TaskHandler>,
    overrides: HandlerOverride,
}

#[async_trait]
impl TaskHandler for Overridden {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn tick_interval_ms(&self) -> i64 {
        self.overrides
            .tick_interval_ms
            .unwrap_or_else(|| self.inner.tick_interval_ms())
    }

    fn allow_submit_when_no_idle_worker(&self) -> bool {
        self.overrides
            .allow_submit_when_no_idle_worker
            .unwrap_or_else(|| self.inner.allow_submit_when_no_idle_worker())
    }

    fn max_queued_tasks(&self) -> usize {
        self.overrides
            .max_queued_tasks
            .unwrap_or_else(|| self.inner.max_queued_tasks())
    }

    fn on_tick(&self, timer_id: TimerId, ctx: &TaskContext) -> anyhow::Result<Option<TimerResult>> {
        self.inner.on_tick(timer_id, ctx)
    }

    async fn on_work(&self, item: &WorkItem, payload: Value) -> anyhow::Result<Value> {
        self.inner.on_work(item, payload).await
    }

    fn on_finish(&self, ctx: &TaskContext, original: &Value, completion: Completion) -> anyhow::Result<()> {
        self.inner.on_finish(ctx, original, completion)
    }
}
