use std::fmt;

use serde::{Deserialize, Serialize};

use crate::handler::TaskHandler;
use crate::pool::PoolStats;

/// Why a tick was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No idle worker and the handler does not allow queueing behind busy ones.
    NoIdleWorker,
    /// More tasks queued than the handler's `max_queued_tasks`.
    QueueFull,
    /// The submitting context reported itself saturated.
    CallerBusy,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::NoIdleWorker => "no_idle_worker",
            SkipReason::QueueFull => "queue_full",
            SkipReason::CallerBusy => "caller_busy",
        };
        f.write_str(reason)
    }
}

/// Decide whether `handler` may run a tick against `stats`.
///
/// Rules short-circuit in order: idle workers, queue depth, caller saturation.
pub fn check_admission(handler: &dyn TaskHandler, stats: &PoolStats) -> Result<(), SkipReason> {
    if !handler.allow_submit_when_no_idle_worker() && stats.idle_worker_count == 0 {
        return Err(SkipReason::NoIdleWorker);
    }

    let max_queued = handler.max_queued_tasks();
    if max_queued > 0 && stats.queued_task_count > max_queued {
        return Err(SkipReason::QueueFull);
    }

    if stats.current_worker_busy {
        return Err(SkipReason::CallerBusy);
    }

    Ok(())
}
