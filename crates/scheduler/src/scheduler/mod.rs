//! Tick scheduler -- owns one recurring timer per registered handler and
//! drives them from a single cooperative loop.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, registration, accessors and shutdown handle
//! - `admission`: per-tick pool capacity check
//! - `execution`: single-tick execution and the main timer loop

mod admission;
mod core;
mod execution;
#[cfg(test)]
mod tests;

pub use self::admission::{check_admission, SkipReason};
pub use self::core::{Scheduler, ShutdownHandle, TimerState};
pub use self::execution::TickOutcome;
