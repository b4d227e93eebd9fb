use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::dispatcher::PendingFinish;
use crate::error::{panic_message, TickError};
use crate::handler::{TaskContext, TaskHandler, TimerId};
use crate::timer_result::DispatchMode;

use super::admission::{check_admission, SkipReason};
use super::core::TimerState;
use super::Scheduler;

/// What a single timer fire amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Admission check failed; `on_tick` was not called.
    Skipped(SkipReason),
    /// `on_tick` returned nothing to submit.
    Declined,
    Submitted(DispatchMode),
    /// `on_tick` or the submission failed. The timer keeps firing.
    Failed(String),
    /// Unknown or cancelled timer.
    Inactive,
}

impl Scheduler {
    /// Fire one timer now: admission check, `on_tick`, dispatch.
    ///
    /// Every failure is caught here, logged with the handler's name and
    /// recorded in metrics. The timer stays scheduled either way.
    ///
    /// Fire-and-forget results arrive later. Hosts that drive ticks through
    /// `fire` instead of [`run`](Self::run) call
    /// [`drain_completions`](Self::drain_completions) to hand them to `on_finish`.
    pub async fn fire(&mut self, timer_id: TimerId) -> TickOutcome {
        let Some(timer) = self
            .timers
            .iter_mut()
            .find(|t| t.id == timer_id && t.state == TimerState::Scheduled)
        else {
            return TickOutcome::Inactive;
        };
        timer.fires += 1;
        let tick = timer.fires;
        let handler = Arc::clone(&timer.handler);
        let name = handler.name().to_string();
        self.record(|m| m.record_fired(&name));

        let stats = self.dispatcher.pool().snapshot();
        if let Err(reason) = check_admission(handler.as_ref(), &stats) {
            debug!(handler = %name, timer_id, reason = %reason, "tick skipped");
            self.record(|m| m.record_skip(&name, reason));
            return TickOutcome::Skipped(reason);
        }

        let ctx = TaskContext {
            handler: name.clone(),
            timer_id,
            tick,
            fired_at: Utc::now(),
            stats,
        };
        let started = Instant::now();
        let result = self.run_tick(&handler, &ctx).await;
        let elapsed = started.elapsed();

        match result {
            Ok(None) => {
                self.record(|m| m.record_declined(&name, elapsed));
                TickOutcome::Declined
            }
            Ok(Some(mode)) => {
                self.record(|m| m.record_submission(&name, mode, elapsed));
                TickOutcome::Submitted(mode)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(handler = %name, timer_id, error = %message, "{} failed, {}", name, message);
                self.record(|m| m.record_tick_failure(&name, &message, elapsed));
                TickOutcome::Failed(message)
            }
        }
    }

    async fn run_tick(&self, handler: &Arc<dyn TaskHandler>, ctx: &TaskContext) -> Result<Option<DispatchMode>, TickError> {
        let decision = catch_unwind(AssertUnwindSafe(|| handler.on_tick(ctx.timer_id, ctx)));
        let result = match decision {
            Ok(Ok(Some(result))) => result,
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(e)) => return Err(TickError::Handler(e)),
            Err(panic) => return Err(TickError::Panicked(panic_message(panic.as_ref()))),
        };
        let mode = self.dispatcher.submit(handler, ctx, result).await?;
        Ok(Some(mode))
    }

    /// Run the timer loop. Returns once shutdown is signaled, with every
    /// timer cancelled.
    ///
    /// Each timer first fires one period after the loop starts. A tick that
    /// runs past the next deadline drops the fires it missed instead of
    /// replaying them back to back.
    pub async fn run(&mut self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let start = Instant::now();
        let mut deadlines: BinaryHeap<Reverse<(Instant, TimerId)>> = self
            .timers
            .iter()
            .filter(|t| t.state == TimerState::Scheduled)
            .map(|t| Reverse((start + t.period, t.id)))
            .collect();

        info!("Scheduler starting with {} timers", deadlines.len());

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let next = deadlines.peek().map(|Reverse((at, _))| *at);

            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(pending) = self.completions.recv() => self.deliver(pending),
                _ = sleep_until_next(next) => {
                    let Some(Reverse((deadline, timer_id))) = deadlines.pop() else {
                        continue;
                    };
                    self.fire(timer_id).await;

                    let Some(period) = self.timer(timer_id).map(|t| t.period) else {
                        continue;
                    };
                    let (next_at, dropped) = next_deadline(deadline, period, Instant::now());
                    if dropped > 0 {
                        if let Some(name) = self.handler_name(timer_id).map(str::to_string) {
                            warn!(handler = %name, timer_id, dropped, "tick overran its interval, dropping missed fires");
                            self.record(|m| m.record_dropped(&name, dropped));
                        }
                    }
                    deadlines.push(Reverse((next_at, timer_id)));
                }
            }
        }

        self.stop();
    }

    fn deliver(&self, pending: PendingFinish) {
        let name = pending.handler.name().to_string();
        if !pending.deliver() {
            self.record(|m| m.record_finish_failure(&name));
        }
    }

    /// Deliver every fire-and-forget completion that has already arrived.
    /// Returns how many were handed to `on_finish`.
    pub fn drain_completions(&mut self) -> usize {
        let mut drained = 0usize;
        while let Ok(pending) = self.completions.try_recv() {
            self.deliver(pending);
            drained += 1;
        }
        drained
    }

    /// Cancel every timer and hand out completions that already arrived.
    fn stop(&mut self) {
        for timer in &mut self.timers {
            timer.state = TimerState::Cancelled;
        }
        let drained = self.drain_completions();
        info!(timers = self.timers.len(), drained, "Scheduler stopped");
    }
}

async fn sleep_until_next(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Earliest `deadline + k * period` (k >= 1) not already behind `now`,
/// and how many fires were skipped to get there.
pub(super) fn next_deadline(deadline: Instant, period: Duration, now: Instant) -> (Instant, u64) {
    let behind = now.saturating_duration_since(deadline);
    if behind <= period {
        return (deadline + period, 0);
    }
    let period_nanos = period.as_nanos().max(1);
    let steps = behind.as_nanos().div_ceil(period_nanos);
    let advance = u64::try_from(steps * period_nanos).unwrap_or(u64::MAX);
    let dropped = u64::try_from(steps - 1).unwrap_or(u64::MAX);
    (deadline + Duration::from_nanos(advance), dropped)
}
