use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{panic_message, PoolError};
use crate::handler::HandlerRegistry;
use crate::timer_result::WorkerTarget;

use super::{CompletionCallback, TaskDescriptor, WaitOutcome, WorkItem, WorkerPool, WorkerStats};

/// How a finished job reports back.
enum Reply {
    Callback(CompletionCallback),
    Wait(oneshot::Sender<Value>),
}

struct Job {
    task_id: u64,
    task: TaskDescriptor,
    reply: Reply,
}

struct WorkerSlot {
    tx: mpsc::UnboundedSender<Job>,
    busy: AtomicBool,
    /// Jobs accepted for this worker but not yet started.
    queued: AtomicUsize,
}

/// In-process worker pool: a fixed set of tokio tasks, each with its own
/// FIFO queue, executing `on_work` of the handler named in each descriptor.
///
/// `on_work` failures and panics are logged and swallowed here; the item's
/// reply is dropped so no completion is ever reported for it.
pub struct LocalPool {
    slots: Vec<Arc<WorkerSlot>>,
    next_task_id: AtomicU64,
    caller_busy: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalPool {
    /// Spawn `workers` workers (at least one). Must be called inside a tokio runtime.
    pub fn spawn(workers: usize, registry: Arc<HandlerRegistry>) -> Self {
        let workers = workers.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut slots = Vec::with_capacity(workers);
        let mut joins = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let slot = Arc::new(WorkerSlot {
                tx,
                busy: AtomicBool::new(false),
                queued: AtomicUsize::new(0),
            });
            let worker_slot = Arc::clone(&slot);
            let reg = Arc::clone(&registry);
            let shutdown = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, worker_slot, reg, rx, shutdown).await;
            }));
            slots.push(slot);
        }

        info!(workers, handlers = registry.len(), "local worker pool started");

        Self {
            slots,
            next_task_id: AtomicU64::new(1),
            caller_busy: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            joins: Mutex::new(joins),
        }
    }

    pub fn workers(&self) -> usize {
        self.slots.len()
    }

    /// Busy flag of one worker, `None` for an unknown id.
    pub fn is_worker_busy(&self, worker_id: usize) -> Option<bool> {
        self.slots
            .get(worker_id)
            .map(|slot| slot.busy.load(Ordering::SeqCst))
    }

    /// Mark the submitting context as saturated (or not). While set, every
    /// tick is skipped by the admission check.
    pub fn set_caller_busy(&self, busy: bool) {
        self.caller_busy.store(busy, Ordering::SeqCst);
    }

    /// Shared handle to the caller-busy flag for hosts that toggle it elsewhere.
    pub fn caller_busy_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.caller_busy)
    }

    /// Stop taking jobs and wait for workers to finish their current one.
    /// Jobs still queued are dropped.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let joins = self
            .joins
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        for (worker_id, join) in joins.into_iter().enumerate() {
            if let Err(e) = join.await {
                warn!(worker_id, error = %e, "worker task did not stop cleanly");
            }
        }
        info!("local worker pool stopped");
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Resolve a routing hint to a worker index.
    fn route(&self, target: WorkerTarget) -> Result<usize, PoolError> {
        match target {
            WorkerTarget::Worker(id) if id < self.slots.len() => Ok(id),
            WorkerTarget::Worker(id) => Err(PoolError::UnknownWorker {
                worker_id: id as i64,
                workers: self.slots.len(),
            }),
            WorkerTarget::Any => {
                let idle = self.slots.iter().position(|slot| {
                    !slot.busy.load(Ordering::SeqCst) && slot.queued.load(Ordering::SeqCst) == 0
                });
                if let Some(idx) = idle {
                    return Ok(idx);
                }
                // Nobody idle: shortest queue wins, lowest id on ties.
                self.slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.queued.load(Ordering::SeqCst))
                    .map(|(idx, _)| idx)
                    .ok_or(PoolError::Closed)
            }
        }
    }

    fn enqueue(&self, target: WorkerTarget, task: TaskDescriptor, reply: Reply) -> Result<(), PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::Closed);
        }
        let idx = self.route(target)?;
        let slot = &self.slots[idx];
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);

        slot.queued.fetch_add(1, Ordering::SeqCst);
        if slot.tx.send(Job { task_id, task, reply }).is_err() {
            slot.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::Closed);
        }
        debug!(task_id, worker_id = idx, "work item queued");
        Ok(())
    }

    fn enqueue_wait(&self, target: WorkerTarget, task: TaskDescriptor) -> Result<oneshot::Receiver<Value>, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(target, task, Reply::Wait(tx))?;
        Ok(rx)
    }
}

#[async_trait]
impl WorkerPool for LocalPool {
    fn submit_async(
        &self,
        task: TaskDescriptor,
        target: WorkerTarget,
        on_complete: CompletionCallback,
    ) -> Result<(), PoolError> {
        self.enqueue(target, task, Reply::Callback(on_complete))
    }

    async fn submit_blocking(
        &self,
        task: TaskDescriptor,
        timeout: Duration,
        target: WorkerTarget,
    ) -> Result<WaitOutcome, PoolError> {
        let rx = self.enqueue_wait(target, task)?;
        Ok(await_reply(rx, timeout).await.map_or(WaitOutcome::TimedOut, WaitOutcome::Completed))
    }

    async fn submit_blocking_many(
        &self,
        tasks: Vec<TaskDescriptor>,
        timeout: Duration,
    ) -> Result<Vec<Value>, PoolError> {
        // A closed pool takes no part of a batch.
        if self.is_shut_down() {
            return Err(PoolError::Closed);
        }
        let mut receivers = Vec::with_capacity(tasks.len());
        for task in tasks {
            receivers.push(self.enqueue_wait(WorkerTarget::Any, task)?);
        }
        let replies = join_all(receivers.into_iter().map(|rx| await_reply(rx, timeout))).await;
        Ok(replies.into_iter().flatten().collect())
    }

    fn stats(&self) -> WorkerStats {
        let idle = self
            .slots
            .iter()
            .filter(|slot| !slot.busy.load(Ordering::SeqCst))
            .count();
        let queued = self
            .slots
            .iter()
            .map(|slot| slot.queued.load(Ordering::SeqCst))
            .sum();
        WorkerStats {
            idle_worker_count: idle,
            queued_task_count: queued,
        }
    }

    fn is_calling_context_busy(&self) -> bool {
        self.caller_busy.load(Ordering::SeqCst)
    }
}

/// `None` when the timeout fires first or the worker dropped the reply.
async fn await_reply(rx: oneshot::Receiver<Value>, timeout: Duration) -> Option<Value> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(_)) | Err(_) => None,
    }
}

async fn worker_loop(
    worker_id: usize,
    slot: Arc<WorkerSlot>,
    registry: Arc<HandlerRegistry>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let job = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        slot.busy.store(true, Ordering::SeqCst);
        slot.queued.fetch_sub(1, Ordering::SeqCst);
        run_job(worker_id, &registry, job).await;
        slot.busy.store(false, Ordering::SeqCst);
    }
    debug!(worker_id, "worker stopped");
}

async fn run_job(worker_id: usize, registry: &HandlerRegistry, job: Job) {
    let name = job.task.handler;
    let Some(handler) = registry.get(&name).cloned() else {
        error!(handler = %name, worker_id, "handler {} is not registered with the pool", name);
        return;
    };

    let item = WorkItem {
        task_id: job.task_id,
        worker_id,
    };
    let outcome = AssertUnwindSafe(handler.on_work(&item, job.task.payload))
        .catch_unwind()
        .await;

    let message = match outcome {
        Ok(Ok(value)) => {
            match job.reply {
                Reply::Callback(on_complete) => on_complete(worker_id, value),
                Reply::Wait(tx) => {
                    // The waiter may have timed out already.
                    let _ = tx.send(value);
                }
            }
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(panic) => panic_message(panic.as_ref()),
    };
    error!(handler = %name, worker_id, task_id = item.task_id, "handler {} processing failed: {}", name, message);
}
