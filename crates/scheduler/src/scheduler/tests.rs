use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::error::{ConfigurationError, PoolError};
use crate::handler::{Completion, HandlerRegistry, TaskContext, TaskHandler, TimerId};
use crate::pool::{CompletionCallback, PoolStats, TaskDescriptor, WaitOutcome, WorkItem, WorkerPool, WorkerStats};
use crate::timer_result::{DispatchMode, TimerResult, WorkerTarget};

use super::execution::next_deadline;
use super::{check_admission, Scheduler, SkipReason, TickOutcome, TimerState};

/// Mock pool with settable load that records every submission.
#[derive(Default)]
struct RecordingPool {
    stats: Mutex<WorkerStats>,
    caller_busy: AtomicBool,
    async_calls: Mutex<Vec<(TaskDescriptor, WorkerTarget)>>,
    blocking_calls: AtomicUsize,
    /// Invoke async callbacks straight away with this worker id.
    complete_async_on: Option<usize>,
    /// How long a blocking submission takes to answer.
    blocking_delay: Duration,
    reject: bool,
}

impl RecordingPool {
    fn with_load(idle: usize, queued: usize) -> Self {
        let pool = Self::default();
        pool.set_load(idle, queued);
        pool
    }

    fn set_load(&self, idle: usize, queued: usize) {
        *self.stats.lock().unwrap() = WorkerStats {
            idle_worker_count: idle,
            queued_task_count: queued,
        };
    }

    fn async_submissions(&self) -> Vec<(TaskDescriptor, WorkerTarget)> {
        self.async_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerPool for RecordingPool {
    fn submit_async(
        &self,
        task: TaskDescriptor,
        target: WorkerTarget,
        on_complete: CompletionCallback,
    ) -> Result<(), PoolError> {
        if self.reject {
            return Err(PoolError::Rejected("pool is draining".into()));
        }
        let payload = task.payload.clone();
        self.async_calls.lock().unwrap().push((task, target));
        if let Some(worker_id) = self.complete_async_on {
            on_complete(worker_id, json!({ "echo": payload }));
        }
        Ok(())
    }

    async fn submit_blocking(
        &self,
        task: TaskDescriptor,
        _timeout: Duration,
        _target: WorkerTarget,
    ) -> Result<WaitOutcome, PoolError> {
        self.blocking_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.blocking_delay).await;
        Ok(WaitOutcome::Completed(task.payload))
    }

    async fn submit_blocking_many(
        &self,
        tasks: Vec<TaskDescriptor>,
        _timeout: Duration,
    ) -> Result<Vec<Value>, PoolError> {
        self.blocking_calls.fetch_add(1, Ordering::SeqCst);
        Ok(tasks.into_iter().map(|t| t.payload).collect())
    }

    fn stats(&self) -> WorkerStats {
        *self.stats.lock().unwrap()
    }

    fn is_calling_context_busy(&self) -> bool {
        self.caller_busy.load(Ordering::SeqCst)
    }
}

enum Step {
    Submit(TimerResult),
    Fail(&'static str),
    Panic,
}

/// Handler that plays back a script of `on_tick` decisions, then declines.
struct ScriptedHandler {
    name: &'static str,
    interval_ms: i64,
    allow_no_idle: bool,
    max_queued: usize,
    script: Mutex<VecDeque<Step>>,
    ticks: AtomicUsize,
    contexts: Mutex<Vec<TaskContext>>,
    finished: Mutex<Vec<(Value, Completion)>>,
}

impl ScriptedHandler {
    fn new(name: &'static str, interval_ms: i64) -> Self {
        Self {
            name,
            interval_ms,
            allow_no_idle: false,
            max_queued: 0,
            script: Mutex::new(VecDeque::new()),
            ticks: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
        }
    }

    fn allow_no_idle(mut self) -> Self {
        self.allow_no_idle = true;
        self
    }

    fn max_queued(mut self, max: usize) -> Self {
        self.max_queued = max;
        self
    }

    fn then(self, step: Step) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    fn ticks(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn tick_interval_ms(&self) -> i64 {
        self.interval_ms
    }

    fn allow_submit_when_no_idle_worker(&self) -> bool {
        self.allow_no_idle
    }

    fn max_queued_tasks(&self) -> usize {
        self.max_queued
    }

    fn on_tick(&self, _timer_id: TimerId, ctx: &TaskContext) -> anyhow::Result<Option<TimerResult>> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(ctx.clone());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            None => Ok(None),
            Some(Step::Submit(result)) => Ok(Some(result)),
            Some(Step::Fail(msg)) => anyhow::bail!(msg),
            Some(Step::Panic) => panic!("tick exploded"),
        }
    }

    async fn on_work(&self, _item: &WorkItem, payload: Value) -> anyhow::Result<Value> {
        Ok(payload)
    }

    fn on_finish(&self, _ctx: &TaskContext, original: &Value, completion: Completion) -> anyhow::Result<()> {
        self.finished.lock().unwrap().push((original.clone(), completion));
        Ok(())
    }
}

fn setup(pool: RecordingPool, handler: ScriptedHandler) -> (Arc<RecordingPool>, Arc<ScriptedHandler>, Scheduler, TimerId) {
    let pool = Arc::new(pool);
    let handler = Arc::new(handler);
    let mut scheduler = Scheduler::new(pool.clone());
    let id = scheduler.register(handler.clone()).unwrap();
    (pool, handler, scheduler, id)
}

// ── Admission ───────────────────────────────────────────────────────

#[test]
fn admission_rules_short_circuit_in_order() {
    let strict = ScriptedHandler::new("strict", 10).max_queued(2);
    let lenient = ScriptedHandler::new("lenient", 10).allow_no_idle().max_queued(2);
    let everything_wrong = PoolStats {
        idle_worker_count: 0,
        queued_task_count: 3,
        current_worker_busy: true,
    };

    assert_eq!(check_admission(&strict, &everything_wrong), Err(SkipReason::NoIdleWorker));
    assert_eq!(check_admission(&lenient, &everything_wrong), Err(SkipReason::QueueFull));

    let busy_only = PoolStats {
        idle_worker_count: 1,
        queued_task_count: 2,
        current_worker_busy: true,
    };
    assert_eq!(check_admission(&strict, &busy_only), Err(SkipReason::CallerBusy));

    let fine = PoolStats {
        current_worker_busy: false,
        ..busy_only
    };
    assert_eq!(check_admission(&strict, &fine), Ok(()));
}

#[test]
fn unlimited_queue_never_skips_for_depth() {
    let handler = ScriptedHandler::new("h", 10);
    let stats = PoolStats {
        idle_worker_count: 1,
        queued_task_count: 10_000,
        current_worker_busy: false,
    };
    assert_eq!(check_admission(&handler, &stats), Ok(()));
}

#[tokio::test]
async fn no_idle_worker_skips_without_calling_on_tick() {
    let (pool, handler, mut scheduler, id) = setup(
        RecordingPool::with_load(0, 0),
        ScriptedHandler::new("h", 100).then(Step::Submit(TimerResult::fire_and_forget(json!(1)))),
    );

    assert_eq!(scheduler.fire(id).await, TickOutcome::Skipped(SkipReason::NoIdleWorker));
    assert_eq!(handler.ticks(), 0);
    assert!(pool.async_submissions().is_empty());

    let metrics = scheduler.metrics();
    let m = metrics.get("h").unwrap();
    assert_eq!(m.ticks_fired, 1);
    assert_eq!(m.skipped[&SkipReason::NoIdleWorker], 1);
}

#[tokio::test]
async fn queue_over_limit_skips_even_with_idle_workers() {
    let (pool, handler, mut scheduler, id) = setup(
        RecordingPool::with_load(5, 3),
        ScriptedHandler::new("h", 100).max_queued(2),
    );
    assert_eq!(scheduler.fire(id).await, TickOutcome::Skipped(SkipReason::QueueFull));

    pool.set_load(5, 2);
    assert_eq!(scheduler.fire(id).await, TickOutcome::Declined);
    assert_eq!(handler.ticks(), 1);
}

#[tokio::test]
async fn busy_caller_skips() {
    let pool = RecordingPool::with_load(1, 0);
    pool.caller_busy.store(true, Ordering::SeqCst);
    let (_pool, _handler, mut scheduler, id) = setup(pool, ScriptedHandler::new("h", 100));

    assert_eq!(scheduler.fire(id).await, TickOutcome::Skipped(SkipReason::CallerBusy));
}

#[tokio::test]
async fn admission_uses_a_fresh_snapshot_each_tick() {
    let (pool, handler, mut scheduler, id) = setup(RecordingPool::with_load(0, 0), ScriptedHandler::new("h", 100));

    assert!(matches!(scheduler.fire(id).await, TickOutcome::Skipped(_)));
    pool.set_load(2, 0);
    assert_eq!(scheduler.fire(id).await, TickOutcome::Declined);

    let contexts = handler.contexts.lock().unwrap();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].tick, 2, "skipped fires still count");
    assert_eq!(contexts[0].stats.idle_worker_count, 2);
}

// ── Dispatch from ticks ─────────────────────────────────────────────

#[tokio::test]
async fn fire_and_forget_without_idle_worker_when_allowed() {
    let (pool, _handler, mut scheduler, id) = setup(
        RecordingPool::with_load(0, 0),
        ScriptedHandler::new("h", 100)
            .allow_no_idle()
            .then(Step::Submit(TimerResult::fire_and_forget(json!({"x": 1})))),
    );

    assert_eq!(scheduler.fire(id).await, TickOutcome::Submitted(DispatchMode::FireAndForget));

    let calls = pool.async_submissions();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, TaskDescriptor::new("h", json!({"x": 1})));
    assert_eq!(calls[0].1.id(), -1);
}

#[tokio::test]
async fn wait_modes_finish_inline() {
    let (pool, handler, mut scheduler, id) = setup(
        RecordingPool::with_load(1, 0),
        ScriptedHandler::new("h", 100)
            .then(Step::Submit(TimerResult::wait_one(json!("one"), 1.0)))
            .then(Step::Submit(TimerResult::wait_many(json!(["a", "b"]), 1.0))),
    );

    assert_eq!(scheduler.fire(id).await, TickOutcome::Submitted(DispatchMode::WaitOne));
    assert_eq!(scheduler.fire(id).await, TickOutcome::Submitted(DispatchMode::WaitMany));
    assert_eq!(pool.blocking_calls.load(Ordering::SeqCst), 2);

    let finished = handler.finished.lock().unwrap();
    assert_eq!(finished.len(), 2);
    assert_eq!(finished[1], (json!(["a", "b"]), Completion::WaitMany { results: vec![json!("a"), json!("b")] }));

    let metrics = scheduler.metrics();
    assert_eq!(metrics.get("h").unwrap().submissions_total(), 2);
}

// ── Failures ────────────────────────────────────────────────────────

#[tokio::test]
async fn on_tick_error_is_caught_and_timer_keeps_firing() {
    let (pool, _handler, mut scheduler, id) = setup(
        RecordingPool::with_load(1, 0),
        ScriptedHandler::new("h", 100)
            .then(Step::Fail("database unreachable"))
            .then(Step::Submit(TimerResult::fire_and_forget(json!(2)))),
    );

    let outcome = scheduler.fire(id).await;
    assert_eq!(outcome, TickOutcome::Failed("on_tick failed: database unreachable".into()));
    assert_eq!(scheduler.timer_state(id), Some(TimerState::Scheduled));

    assert_eq!(scheduler.fire(id).await, TickOutcome::Submitted(DispatchMode::FireAndForget));
    assert_eq!(pool.async_submissions().len(), 1);

    let metrics = scheduler.metrics();
    let m = metrics.get("h").unwrap();
    assert_eq!(m.tick_failures, 1);
    assert_eq!(m.last_error.as_deref(), Some("on_tick failed: database unreachable"));
}

#[tokio::test(start_paused = true)]
async fn run_loop_keeps_ticking_after_a_failed_tick() {
    let pool = RecordingPool {
        complete_async_on: Some(0),
        ..RecordingPool::with_load(1, 0)
    };
    let (pool, handler, scheduler, id) = setup(
        pool,
        ScriptedHandler::new("h", 100)
            .then(Step::Fail("database unreachable"))
            .then(Step::Submit(TimerResult::fire_and_forget(json!(2)))),
    );
    let stop = scheduler.shutdown_handle();

    let task = tokio::spawn(async move {
        let mut scheduler = scheduler;
        scheduler.run().await;
        scheduler
    });
    // Fails at 100, submits at 200.
    tokio::time::sleep(Duration::from_millis(250)).await;
    stop.shutdown();
    let scheduler = task.await.unwrap();

    assert_eq!(handler.ticks(), 2);
    assert_eq!(pool.async_submissions().len(), 1);
    assert_eq!(handler.finished.lock().unwrap().len(), 1);

    let metrics = scheduler.metrics();
    let m = metrics.get("h").unwrap();
    assert_eq!(m.tick_failures, 1);
    assert_eq!(m.submissions[&DispatchMode::FireAndForget], 1);
    assert_eq!(m.dropped_fires, 0);
    assert_eq!(scheduler.timer_state(id), Some(TimerState::Cancelled));
}

#[tokio::test]
async fn on_tick_panic_is_caught() {
    let (_pool, _handler, mut scheduler, id) = setup(
        RecordingPool::with_load(1, 0),
        ScriptedHandler::new("h", 100).then(Step::Panic),
    );

    let TickOutcome::Failed(message) = scheduler.fire(id).await else {
        panic!("expected a failed tick");
    };
    assert!(message.contains("tick exploded"), "got {message}");
    assert_eq!(scheduler.fire(id).await, TickOutcome::Declined);
}

#[tokio::test]
async fn invalid_batch_fails_the_tick_only() {
    let (pool, handler, mut scheduler, id) = setup(
        RecordingPool::with_load(1, 0),
        ScriptedHandler::new("h", 100).then(Step::Submit(TimerResult::wait_many(json!([]), 1.0))),
    );

    assert_eq!(
        scheduler.fire(id).await,
        TickOutcome::Failed("task error: submitted data is empty".into())
    );
    assert_eq!(pool.blocking_calls.load(Ordering::SeqCst), 0);
    assert!(handler.finished.lock().unwrap().is_empty());
}

#[tokio::test]
async fn pool_rejection_fails_the_tick_only() {
    let pool = RecordingPool {
        reject: true,
        ..RecordingPool::with_load(1, 0)
    };
    let (_pool, _handler, mut scheduler, id) = setup(
        pool,
        ScriptedHandler::new("h", 100).then(Step::Submit(TimerResult::fire_and_forget(json!(1)))),
    );

    let TickOutcome::Failed(message) = scheduler.fire(id).await else {
        panic!("expected a failed tick");
    };
    assert!(message.starts_with("pool error"), "got {message}");
    assert_eq!(scheduler.timer_state(id), Some(TimerState::Scheduled));
}

// ── Registration ────────────────────────────────────────────────────

#[test]
fn negative_interval_is_rejected_zero_is_accepted() {
    let mut scheduler = Scheduler::new(Arc::new(RecordingPool::default()));

    let err = scheduler.register(Arc::new(ScriptedHandler::new("neg", -5))).unwrap_err();
    assert!(matches!(err, ConfigurationError::NegativeInterval { interval_ms: -5, .. }));
    assert!(scheduler.timer_ids().is_empty());

    let id = scheduler.register(Arc::new(ScriptedHandler::new("zero", 0))).unwrap();
    assert_eq!(scheduler.timer_period(id), Some(Duration::from_millis(1)));
    assert_eq!(scheduler.handler_name(id), Some("zero"));
}

#[test]
fn register_from_config_skips_unknown_and_applies_overrides() {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ScriptedHandler::new("report", 1000))).unwrap();
    registry.register(Arc::new(ScriptedHandler::new("cleanup", 1000))).unwrap();

    let config = SchedulerConfig::from_toml(
        r#"
tasks = ["cleanup", "missing", "report"]

[handlers.cleanup]
tick_interval_ms = 250
"#,
    )
    .unwrap();

    let mut scheduler = Scheduler::new(Arc::new(RecordingPool::default()));
    let ids = scheduler.register_from_config(&registry, &config);

    assert_eq!(ids.len(), 2);
    assert_eq!(scheduler.handler_name(ids[0]), Some("cleanup"));
    assert_eq!(scheduler.timer_period(ids[0]), Some(Duration::from_millis(250)));
    assert_eq!(scheduler.timer_period(ids[1]), Some(Duration::from_millis(1000)));
}

#[tokio::test]
async fn unknown_timer_is_inactive() {
    let mut scheduler = Scheduler::new(Arc::new(RecordingPool::default()));
    assert_eq!(scheduler.fire(42).await, TickOutcome::Inactive);
}

// ── Run loop ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn run_fires_on_interval_until_shutdown() {
    let (_pool, handler, scheduler, id) = setup(RecordingPool::with_load(2, 0), ScriptedHandler::new("ticker", 100));
    let stop = scheduler.shutdown_handle();

    let task = tokio::spawn(async move {
        let mut scheduler = scheduler;
        scheduler.run().await;
        scheduler
    });
    tokio::time::sleep(Duration::from_millis(350)).await;
    stop.shutdown();
    let mut scheduler = task.await.unwrap();

    assert_eq!(handler.ticks(), 3);
    assert_eq!(scheduler.timer_state(id), Some(TimerState::Cancelled));
    assert_eq!(scheduler.fire(id).await, TickOutcome::Inactive);
}

#[tokio::test(start_paused = true)]
async fn shutdown_before_run_returns_immediately() {
    let (_pool, handler, mut scheduler, id) = setup(RecordingPool::with_load(1, 0), ScriptedHandler::new("h", 10));
    scheduler.shutdown();
    scheduler.run().await;

    assert_eq!(handler.ticks(), 0);
    assert_eq!(scheduler.timer_state(id), Some(TimerState::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn overrunning_tick_drops_missed_fires() {
    let pool = RecordingPool {
        blocking_delay: Duration::from_millis(250),
        ..RecordingPool::with_load(1, 0)
    };
    let (_pool, handler, scheduler, _id) = setup(
        pool,
        ScriptedHandler::new("slow", 100).then(Step::Submit(TimerResult::wait_one(json!(1), 1.0))),
    );
    let stop = scheduler.shutdown_handle();

    let task = tokio::spawn(async move {
        let mut scheduler = scheduler;
        scheduler.run().await;
        scheduler
    });
    // Fires at 100 (blocks until 350), 200 and 300 are dropped, next at 400.
    tokio::time::sleep(Duration::from_millis(450)).await;
    stop.shutdown();
    let scheduler = task.await.unwrap();

    assert_eq!(handler.ticks(), 2);
    assert_eq!(scheduler.metrics().get("slow").unwrap().dropped_fires, 2);
}

#[tokio::test(start_paused = true)]
async fn fire_and_forget_completion_reaches_on_finish() {
    let pool = RecordingPool {
        complete_async_on: Some(3),
        ..RecordingPool::with_load(4, 0)
    };
    let (_pool, handler, scheduler, _id) = setup(
        pool,
        ScriptedHandler::new("h", 100).then(Step::Submit(TimerResult::fire_and_forget(json!("job")))),
    );
    let stop = scheduler.shutdown_handle();

    let task = tokio::spawn(async move {
        let mut scheduler = scheduler;
        scheduler.run().await;
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    stop.shutdown();
    task.await.unwrap();

    let finished = handler.finished.lock().unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(
        finished[0],
        (
            json!("job"),
            Completion::FireAndForget {
                result: json!({"echo": "job"}),
                worker_id: 3
            }
        )
    );
}

#[tokio::test]
async fn manual_fire_delivers_completions_on_drain() {
    let pool = RecordingPool {
        complete_async_on: Some(1),
        ..RecordingPool::with_load(2, 0)
    };
    let (_pool, handler, mut scheduler, id) = setup(
        pool,
        ScriptedHandler::new("h", 100)
            .then(Step::Submit(TimerResult::fire_and_forget(json!("a"))))
            .then(Step::Submit(TimerResult::fire_and_forget(json!("b")))),
    );

    assert_eq!(scheduler.fire(id).await, TickOutcome::Submitted(DispatchMode::FireAndForget));
    assert_eq!(scheduler.fire(id).await, TickOutcome::Submitted(DispatchMode::FireAndForget));
    assert!(handler.finished.lock().unwrap().is_empty());

    assert_eq!(scheduler.drain_completions(), 2);
    assert_eq!(scheduler.drain_completions(), 0);

    let finished = handler.finished.lock().unwrap();
    let originals: Vec<&Value> = finished.iter().map(|(original, _)| original).collect();
    assert_eq!(originals, vec![&json!("a"), &json!("b")]);
    assert_eq!(finished[1].1.worker_id(), Some(1));
    assert_eq!(scheduler.timer_state(id), Some(TimerState::Scheduled));
}

#[test]
fn next_deadline_skips_whole_periods() {
    let base = Instant::now();
    let period = Duration::from_millis(100);

    assert_eq!(next_deadline(base, period, base), (base + period, 0));
    assert_eq!(next_deadline(base, period, base + period), (base + period, 0));
    assert_eq!(
        next_deadline(base, period, base + Duration::from_millis(250)),
        (base + Duration::from_millis(300), 2)
    );
    assert_eq!(
        next_deadline(base, period, base + Duration::from_millis(300)),
        (base + Duration::from_millis(300), 2)
    );
}
