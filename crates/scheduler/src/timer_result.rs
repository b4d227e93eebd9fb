use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on the number of items in a single `WaitMany` batch.
pub const MAX_BATCH_ITEMS: usize = 1000;

/// Timeout applied to blocking submissions when none is given.
pub const DEFAULT_TIMEOUT_SECS: f64 = 0.5;

/// Where the pool should run a submitted work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkerTarget {
    /// Let the pool pick an idle worker (raw id `-1`).
    #[default]
    Any,
    /// Pin the item to one worker.
    Worker(usize),
}

impl WorkerTarget {
    /// Build a target from a raw worker id. Anything below `-1` clamps to `-1`.
    pub fn from_id(id: i64) -> Self {
        if id < 0 {
            WorkerTarget::Any
        } else {
            WorkerTarget::Worker(id as usize)
        }
    }

    /// Raw worker id, `-1` meaning "any idle worker".
    pub fn id(&self) -> i64 {
        match self {
            WorkerTarget::Any => -1,
            WorkerTarget::Worker(id) => *id as i64,
        }
    }
}

impl fmt::Display for WorkerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// The three submission modes, without their parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    FireAndForget,
    WaitOne,
    WaitMany,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchMode::FireAndForget => "fire_and_forget",
            DispatchMode::WaitOne => "wait_one",
            DispatchMode::WaitMany => "wait_many",
        };
        f.write_str(name)
    }
}

/// How a [`TimerResult`] is delivered. Each variant carries only the
/// parameters that mean something for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delivery {
    /// Non-blocking; completion arrives later (or never).
    FireAndForget { target: WorkerTarget },
    /// Await one result or the timeout.
    WaitOne { timeout: Duration, target: WorkerTarget },
    /// Fan the payload sequence out item by item and await all of them.
    WaitMany { timeout: Duration },
}

impl Delivery {
    pub fn mode(&self) -> DispatchMode {
        match self {
            Delivery::FireAndForget { .. } => DispatchMode::FireAndForget,
            Delivery::WaitOne { .. } => DispatchMode::WaitOne,
            Delivery::WaitMany { .. } => DispatchMode::WaitMany,
        }
    }
}

/// Decision returned by [`TaskHandler::on_tick`](crate::TaskHandler::on_tick):
/// what to submit and how.
///
/// Switching mode replaces the previous one, so exactly one mode is ever
/// active:
///
/// ```
/// use serde_json::json;
/// use tickpool_scheduler::{DispatchMode, TimerResult};
///
/// let mut result = TimerResult::fire_and_forget(json!({"x": 1}));
/// result.set_wait_one(json!({"x": 2}), 1.5, -1);
/// assert_eq!(result.mode(), DispatchMode::WaitOne);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TimerResult {
    payload: Value,
    delivery: Delivery,
}

impl Default for TimerResult {
    fn default() -> Self {
        Self {
            payload: Value::Null,
            delivery: Delivery::FireAndForget {
                target: WorkerTarget::Any,
            },
        }
    }
}

impl TimerResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire-and-forget on any idle worker.
    pub fn fire_and_forget(payload: impl Into<Value>) -> Self {
        let mut result = Self::new();
        result.set_fire_and_forget(payload, WorkerTarget::Any.id());
        result
    }

    /// Blocking single submission on any idle worker.
    pub fn wait_one(payload: impl Into<Value>, timeout_secs: f64) -> Self {
        let mut result = Self::new();
        result.set_wait_one(payload, timeout_secs, WorkerTarget::Any.id());
        result
    }

    /// Blocking batch submission. `payload` must be a sequence of
    /// 1..=[`MAX_BATCH_ITEMS`] items; this is checked at dispatch.
    pub fn wait_many(payload: impl Into<Value>, timeout_secs: f64) -> Self {
        let mut result = Self::new();
        result.set_wait_many(payload, timeout_secs);
        result
    }

    pub fn set_fire_and_forget(&mut self, payload: impl Into<Value>, target_worker_id: i64) -> &mut Self {
        self.payload = payload.into();
        self.delivery = Delivery::FireAndForget {
            target: WorkerTarget::from_id(target_worker_id),
        };
        self
    }

    pub fn set_wait_one(
        &mut self,
        payload: impl Into<Value>,
        timeout_secs: f64,
        target_worker_id: i64,
    ) -> &mut Self {
        self.payload = payload.into();
        self.delivery = Delivery::WaitOne {
            timeout: clamp_timeout(timeout_secs),
            target: WorkerTarget::from_id(target_worker_id),
        };
        self
    }

    pub fn set_wait_many(&mut self, payload: impl Into<Value>, timeout_secs: f64) -> &mut Self {
        self.payload = payload.into();
        self.delivery = Delivery::WaitMany {
            timeout: clamp_timeout(timeout_secs),
        };
        self
    }

    /// Re-target the current submission. Ignored for `WaitMany`, whose items
    /// always go to whichever worker is free.
    pub fn set_target_worker_id(&mut self, target_worker_id: i64) -> &mut Self {
        let new_target = WorkerTarget::from_id(target_worker_id);
        match &mut self.delivery {
            Delivery::FireAndForget { target } | Delivery::WaitOne { target, .. } => {
                *target = new_target
            }
            Delivery::WaitMany { .. } => {}
        }
        self
    }

    /// Change the timeout of a blocking submission. Ignored for `FireAndForget`.
    pub fn set_timeout(&mut self, timeout_secs: f64) -> &mut Self {
        let new_timeout = clamp_timeout(timeout_secs);
        match &mut self.delivery {
            Delivery::WaitOne { timeout, .. } | Delivery::WaitMany { timeout } => {
                *timeout = new_timeout
            }
            Delivery::FireAndForget { .. } => {}
        }
        self
    }

    pub fn with_target_worker_id(mut self, target_worker_id: i64) -> Self {
        self.set_target_worker_id(target_worker_id);
        self
    }

    pub fn with_timeout(mut self, timeout_secs: f64) -> Self {
        self.set_timeout(timeout_secs);
        self
    }

    pub fn mode(&self) -> DispatchMode {
        self.delivery.mode()
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Timeout of the active mode; the default for `FireAndForget`.
    pub fn timeout(&self) -> Duration {
        match self.delivery {
            Delivery::WaitOne { timeout, .. } | Delivery::WaitMany { timeout } => timeout,
            Delivery::FireAndForget { .. } => clamp_timeout(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn timeout_secs(&self) -> f64 {
        self.timeout().as_secs_f64()
    }

    /// Requested worker; `Any` for `WaitMany`.
    pub fn target(&self) -> WorkerTarget {
        match self.delivery {
            Delivery::FireAndForget { target } | Delivery::WaitOne { target, .. } => target,
            Delivery::WaitMany { .. } => WorkerTarget::Any,
        }
    }

    pub fn target_worker_id(&self) -> i64 {
        self.target().id()
    }

    pub fn into_parts(self) -> (Value, Delivery) {
        (self.payload, self.delivery)
    }
}

/// Negative and NaN timeouts become zero.
fn clamp_timeout(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
