use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ConfigurationError;
use crate::pool::{PoolStats, WaitOutcome, WorkItem};
use crate::timer_result::{DispatchMode, TimerResult, WorkerTarget};

/// Identifier of a registered recurring timer.
pub type TimerId = u64;

/// Ambient information handed to `on_tick` and `on_finish`.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Name of the handler that owns the timer.
    pub handler: String,
    pub timer_id: TimerId,
    /// 1-based count of fires for this timer, skipped fires included.
    pub tick: u64,
    pub fired_at: DateTime<Utc>,
    /// Pool snapshot the admission check was made against.
    pub stats: PoolStats,
}

/// What came back from the pool, shaped by the submission mode.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Whatever `on_work` returned, and the worker that ran it.
    FireAndForget { result: Value, worker_id: usize },
    /// The result or a timeout marker, and the target that was requested.
    WaitOne { result: WaitOutcome, target: WorkerTarget },
    /// Results of the items that finished in time. Timed-out items are
    /// absent, so positions do not line up with the submitted sequence.
    WaitMany { results: Vec<Value> },
}

impl Completion {
    pub fn mode(&self) -> DispatchMode {
        match self {
            Completion::FireAndForget { .. } => DispatchMode::FireAndForget,
            Completion::WaitOne { .. } => DispatchMode::WaitOne,
            Completion::WaitMany { .. } => DispatchMode::WaitMany,
        }
    }

    /// Worker id reported to the handler: the executing worker for
    /// fire-and-forget, the requested target for wait-one, none for batches.
    pub fn worker_id(&self) -> Option<i64> {
        match self {
            Completion::FireAndForget { worker_id, .. } => Some(*worker_id as i64),
            Completion::WaitOne { target, .. } => Some(target.id()),
            Completion::WaitMany { .. } => None,
        }
    }
}

/// A recurring task type.
///
/// `on_tick` and `on_finish` run on the scheduler loop and must return
/// quickly. `on_work` runs on a pool worker and is where slow work belongs.
/// An `on_tick` that outlasts its own interval makes the scheduler drop the
/// next fire.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Identity used to route work items back to this handler and in logs.
    fn name(&self) -> &str;

    /// Timer period in milliseconds. Negative values are rejected at
    /// registration; 0 fires as often as the timer resolution allows.
    fn tick_interval_ms(&self) -> i64;

    /// Whether a tick may submit while the pool has no idle worker.
    fn allow_submit_when_no_idle_worker(&self) -> bool;

    /// Skip ticks while more than this many tasks are queued. 0 = unlimited.
    fn max_queued_tasks(&self) -> usize;

    /// Decide what, if anything, to submit on this tick.
    fn on_tick(&self, timer_id: TimerId, ctx: &TaskContext) -> anyhow::Result<Option<TimerResult>>;

    /// Process one work item on a pool worker.
    async fn on_work(&self, item: &WorkItem, payload: Value) -> anyhow::Result<Value>;

    /// Receive the outcome of a submission. Never called for items whose
    /// `on_work` failed.
    fn on_finish(&self, ctx: &TaskContext, original: &Value, completion: Completion) -> anyhow::Result<()>;
}

/// Registry of handlers (name -> handler).
///
/// Built during startup, read-only afterwards. Iteration follows
/// registration order.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    order: Vec<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), ConfigurationError> {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(ConfigurationError::DuplicateHandler(name));
        }
        self.order.push(name.clone());
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(name)
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TaskHandler>> {
        self.order.iter().filter_map(|name| self.handlers.get(name))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
