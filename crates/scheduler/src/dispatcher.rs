//! Translates a [`TimerResult`] into one pool submission and routes the
//! outcome to the handler's `on_finish`.
//!
//! Blocking modes finish inline. Fire-and-forget completions arrive on a
//! worker and are sent back over a channel so `on_finish` still runs on the
//! scheduler loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{panic_message, DispatchError, TaskError};
use crate::handler::{Completion, TaskContext, TaskHandler};
use crate::metrics::SchedulerMetrics;
use crate::pool::{TaskDescriptor, WorkerPool};
use crate::timer_result::{Delivery, DispatchMode, TimerResult, MAX_BATCH_ITEMS};

/// A completion waiting to be handed to `on_finish`.
pub struct PendingFinish {
    pub handler: Arc<dyn TaskHandler>,
    pub ctx: TaskContext,
    pub original: Value,
    pub completion: Completion,
}

impl PendingFinish {
    /// Call `on_finish`, logging any error or panic. Returns whether it succeeded.
    pub fn deliver(self) -> bool {
        let handler = self.handler;
        let name = handler.name().to_string();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            handler.on_finish(&self.ctx, &self.original, self.completion)
        }));
        let message = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        warn!(handler = %name, timer_id = self.ctx.timer_id, error = %message, "on_finish failed");
        false
    }
}

/// Check a batch payload and borrow its items.
///
/// Emptiness and size are checked before shape, so an empty mapping reports
/// as empty.
pub fn validate_batch(payload: &Value) -> Result<&[Value], TaskError> {
    let len = match payload {
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        _ => return Err(TaskError::NotASequence),
    };
    if len == 0 {
        return Err(TaskError::EmptyBatch);
    }
    if len > MAX_BATCH_ITEMS {
        return Err(TaskError::BatchTooLarge(len));
    }
    match payload {
        Value::Array(items) => Ok(items.as_slice()),
        _ => Err(TaskError::MappingBatch),
    }
}

pub struct Dispatcher {
    pool: Arc<dyn WorkerPool>,
    completions: mpsc::UnboundedSender<PendingFinish>,
    /// Where inline `on_finish` failures are counted.
    metrics: Option<Arc<RwLock<SchedulerMetrics>>>,
}

impl Dispatcher {
    /// Create a dispatcher and the receiving end of its completion channel.
    /// Whoever owns the receiver must call [`PendingFinish::deliver`] on
    /// every item.
    pub fn new(pool: Arc<dyn WorkerPool>) -> (Self, mpsc::UnboundedReceiver<PendingFinish>) {
        let (completions, rx) = mpsc::unbounded_channel();
        (
            Self {
                pool,
                completions,
                metrics: None,
            },
            rx,
        )
    }

    pub fn with_metrics(mut self, metrics: Arc<RwLock<SchedulerMetrics>>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn pool(&self) -> &Arc<dyn WorkerPool> {
        &self.pool
    }

    /// Submit `result` on behalf of `handler`.
    ///
    /// `WaitOne` and `WaitMany` suspend until the pool answers or the timeout
    /// elapses, then call `on_finish` before returning. An `on_finish` failure
    /// is logged, not returned.
    pub async fn submit(
        &self,
        handler: &Arc<dyn TaskHandler>,
        ctx: &TaskContext,
        result: TimerResult,
    ) -> Result<DispatchMode, DispatchError> {
        let name = handler.name().to_string();
        let (payload, delivery) = result.into_parts();
        let mode = delivery.mode();

        match delivery {
            Delivery::FireAndForget { target } => {
                let tx = self.completions.clone();
                let owner = Arc::clone(handler);
                let finish_ctx = ctx.clone();
                let original = payload.clone();
                self.pool.submit_async(
                    TaskDescriptor::new(name.as_str(), payload),
                    target,
                    Box::new(move |worker_id, result| {
                        let pending = PendingFinish {
                            handler: owner,
                            ctx: finish_ctx,
                            original,
                            completion: Completion::FireAndForget { result, worker_id },
                        };
                        if tx.send(pending).is_err() {
                            debug!("completion dropped, scheduler is gone");
                        }
                    }),
                )?;
                debug!(handler = %name, target = %target, "submitted fire-and-forget");
            }
            Delivery::WaitOne { timeout, target } => {
                let descriptor = TaskDescriptor::new(name.as_str(), payload.clone());
                let outcome = self.pool.submit_blocking(descriptor, timeout, target).await?;
                debug!(handler = %name, target = %target, timed_out = outcome.is_timed_out(), "wait-one returned");
                self.finish(PendingFinish {
                    handler: Arc::clone(handler),
                    ctx: ctx.clone(),
                    original: payload,
                    completion: Completion::WaitOne { result: outcome, target },
                });
            }
            Delivery::WaitMany { timeout } => {
                let descriptors: Vec<TaskDescriptor> = validate_batch(&payload)?
                    .iter()
                    .map(|item| TaskDescriptor::new(name.as_str(), item.clone()))
                    .collect();
                let submitted = descriptors.len();
                let results = self.pool.submit_blocking_many(descriptors, timeout).await?;
                debug!(handler = %name, submitted, completed = results.len(), "wait-many returned");
                self.finish(PendingFinish {
                    handler: Arc::clone(handler),
                    ctx: ctx.clone(),
                    original: payload,
                    completion: Completion::WaitMany { results },
                });
            }
        }

        Ok(mode)
    }

    fn finish(&self, pending: PendingFinish) {
        let name = pending.handler.name().to_string();
        if pending.deliver() {
            return;
        }
        if let Some(metrics) = &self.metrics {
            if let Ok(mut m) = metrics.write() {
                m.record_finish_failure(&name);
            }
        }
    }
}
