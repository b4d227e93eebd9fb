use thiserror::Error;

use crate::timer_result::MAX_BATCH_ITEMS;

/// Invalid handler registration or scheduler configuration.
///
/// Fatal to the registration it concerns only; other handlers keep running.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("handler {handler}: tick interval must be at least 0ms, got {interval_ms}ms")]
    NegativeInterval { handler: String, interval_ms: i64 },

    #[error("duplicate handler: {0}")]
    DuplicateHandler(String),

    #[error("config error: {0}")]
    Invalid(String),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-side mistakes in a batch (`WaitMany`) submission.
///
/// Raised before the pool is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("submitted data is empty")]
    EmptyBatch,

    #[error("submitted data exceeds {}", MAX_BATCH_ITEMS)]
    BatchTooLarge(usize),

    #[error("submitted data must be a sequence, not a mapping")]
    MappingBatch,

    #[error("submitted data must be a sequence")]
    NotASequence,
}

/// Failure talking to the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,

    #[error("unknown worker id {worker_id} (pool has {workers} workers)")]
    UnknownWorker { worker_id: i64, workers: usize },

    #[error("submission rejected: {0}")]
    Rejected(String),
}

/// Anything [`Dispatcher::submit`](crate::Dispatcher::submit) can fail with.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task error: {0}")]
    Task(#[from] TaskError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Why a single tick failed. Caught by the scheduler's tick guard.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("on_tick failed: {0}")]
    Handler(anyhow::Error),

    #[error("on_tick panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Render a caught panic payload as text for logging.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
