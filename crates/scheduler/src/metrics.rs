use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scheduler::SkipReason;
use crate::timer_result::DispatchMode;

/// Counters for one handler's timer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HandlerMetrics {
    /// Timer fires, whether or not they were admitted.
    pub ticks_fired: u64,
    /// Fires that passed the admission check and reached `on_tick`.
    pub ticks_admitted: u64,
    /// Fires skipped by the admission check, by reason.
    pub skipped: HashMap<SkipReason, u64>,
    /// `on_tick` returned nothing to submit.
    pub declined: u64,
    /// Successful submissions by mode.
    pub submissions: HashMap<DispatchMode, u64>,
    /// `on_tick` errors, panics and rejected submissions.
    pub tick_failures: u64,
    /// `on_finish` errors and panics.
    pub finish_failures: u64,
    /// Fires lost because a previous tick overran the period.
    pub dropped_fires: u64,
    pub last_error: Option<String>,
    pub last_fired: Option<DateTime<Utc>>,
    /// Average wall time of a full tick (`on_tick` plus any blocking wait).
    pub avg_tick_duration: Duration,
}

/// Scheduler operational metrics, keyed by handler name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    pub handlers: HashMap<String, HandlerMetrics>,
}

impl SchedulerMetrics {
    fn entry(&mut self, handler: &str) -> &mut HandlerMetrics {
        self.handlers.entry(handler.to_string()).or_default()
    }

    pub fn get(&self, handler: &str) -> Option<&HandlerMetrics> {
        self.handlers.get(handler)
    }

    pub fn record_fired(&mut self, handler: &str) {
        let m = self.entry(handler);
        m.ticks_fired += 1;
        m.last_fired = Some(Utc::now());
    }

    pub fn record_skip(&mut self, handler: &str, reason: SkipReason) {
        *self.entry(handler).skipped.entry(reason).or_default() += 1;
    }

    pub fn record_declined(&mut self, handler: &str, duration: Duration) {
        let m = self.entry(handler);
        m.declined += 1;
        m.record_admitted(duration);
    }

    pub fn record_submission(&mut self, handler: &str, mode: DispatchMode, duration: Duration) {
        let m = self.entry(handler);
        *m.submissions.entry(mode).or_default() += 1;
        m.record_admitted(duration);
    }

    pub fn record_tick_failure(&mut self, handler: &str, error: &str, duration: Duration) {
        let m = self.entry(handler);
        m.tick_failures += 1;
        m.last_error = Some(error.to_string());
        m.record_admitted(duration);
    }

    pub fn record_finish_failure(&mut self, handler: &str) {
        self.entry(handler).finish_failures += 1;
    }

    pub fn record_dropped(&mut self, handler: &str, count: u64) {
        self.entry(handler).dropped_fires += count;
    }

    /// Total fires lost to overruns across all handlers.
    pub fn dropped_fires(&self) -> u64 {
        self.handlers.values().map(|m| m.dropped_fires).sum()
    }
}

impl HandlerMetrics {
    pub fn skipped_total(&self) -> u64 {
        self.skipped.values().sum()
    }

    pub fn submissions_total(&self) -> u64 {
        self.submissions.values().sum()
    }

    fn record_admitted(&mut self, duration: Duration) {
        self.ticks_admitted += 1;
        let count = self.ticks_admitted;

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.avg_tick_duration = if count == 1 {
            duration
        } else {
            let prev_nanos = self.avg_tick_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }
}
