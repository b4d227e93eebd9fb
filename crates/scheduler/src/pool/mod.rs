//! Worker pool boundary.
//!
//! The scheduler only talks to a pool through [`WorkerPool`]. [`LocalPool`]
//! is the bundled in-process implementation running workers as tokio tasks.

mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PoolError;
use crate::timer_result::WorkerTarget;

pub use local::LocalPool;

/// One unit of work as shipped to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Name of the handler whose `on_work` processes the payload.
    pub handler: String,
    pub payload: Value,
}

impl TaskDescriptor {
    pub fn new(handler: impl Into<String>, payload: Value) -> Self {
        Self {
            handler: handler.into(),
            payload,
        }
    }
}

/// Handed to `on_work` alongside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    /// Pool-assigned, unique per pool.
    pub task_id: u64,
    /// Worker executing the item.
    pub worker_id: usize,
}

/// Pool load as reported by the pool itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub idle_worker_count: usize,
    pub queued_task_count: usize,
}

/// Point-in-time snapshot used by the admission check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub idle_worker_count: usize,
    pub queued_task_count: usize,
    /// Whether the submitting context is itself saturated.
    pub current_worker_busy: bool,
}

/// Result of a blocking single submission.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Completed(Value),
    /// No result arrived before the timeout. Also reported when the item's
    /// `on_work` failed, since a failed item never produces a result.
    TimedOut,
}

impl WaitOutcome {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, WaitOutcome::TimedOut)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            WaitOutcome::Completed(v) => Some(v),
            WaitOutcome::TimedOut => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            WaitOutcome::Completed(v) => Some(v),
            WaitOutcome::TimedOut => None,
        }
    }
}

/// Invoked by the pool with `(worker_id, result)` when an async item finishes.
pub type CompletionCallback = Box<dyn FnOnce(usize, Value) + Send + 'static>;

/// The execution substrate the scheduler submits work to.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Queue an item without waiting. `on_complete` fires later, or never if
    /// the item fails.
    fn submit_async(
        &self,
        task: TaskDescriptor,
        target: WorkerTarget,
        on_complete: CompletionCallback,
    ) -> Result<(), PoolError>;

    /// Queue an item and wait up to `timeout` for its result.
    async fn submit_blocking(
        &self,
        task: TaskDescriptor,
        timeout: Duration,
        target: WorkerTarget,
    ) -> Result<WaitOutcome, PoolError>;

    /// Queue every item on any free worker and wait up to `timeout` for each.
    /// Items that do not finish in time are left out of the result. An error
    /// partway through queueing may leave earlier items running unobserved.
    async fn submit_blocking_many(
        &self,
        tasks: Vec<TaskDescriptor>,
        timeout: Duration,
    ) -> Result<Vec<Value>, PoolError>;

    fn stats(&self) -> WorkerStats;

    fn is_calling_context_busy(&self) -> bool;

    /// Fresh admission snapshot. Never cached.
    fn snapshot(&self) -> PoolStats {
        let stats = self.stats();
        PoolStats {
            idle_worker_count: stats.idle_worker_count,
            queued_task_count: stats.queued_task_count,
            current_worker_busy: self.is_calling_context_busy(),
        }
    }
}

/// Blanket implementation so `Arc<dyn WorkerPool>` can be used directly.
#[async_trait]
impl<T: WorkerPool + ?Sized> WorkerPool for Arc<T> {
    fn submit_async(
        &self,
        task: TaskDescriptor,
        target: WorkerTarget,
        on_complete: CompletionCallback,
    ) -> Result<(), PoolError> {
        (**self).submit_async(task, target, on_complete)
    }

    async fn submit_blocking(
        &self,
        task: TaskDescriptor,
        timeout: Duration,
        target: WorkerTarget,
    ) -> Result<WaitOutcome, PoolError> {
        (**self).submit_blocking(task, timeout, target).await
    }

    async fn submit_blocking_many(
        &self,
        tasks: Vec<TaskDescriptor>,
        timeout: Duration,
    ) -> Result<Vec<Value>, PoolError> {
        (**self).submit_blocking_many(tasks, timeout).await
    }

    fn stats(&self) -> WorkerStats {
        (**self).stats()
    }

    fn is_calling_context_busy(&self) -> bool {
        (**self).is_calling_context_busy()
    }
}
