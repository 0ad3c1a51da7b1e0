//! Polling gates ("barriers").
//!
//! A barrier decides, from its own state and the current time, whether a
//! fetch of one dataset may be attempted now. The coordinator owns one
//! barrier per dataset and reports every attempt's outcome back through
//! [`Barrier::success`] or [`Barrier::fail`].
//!
//! Two strategies are provided:
//!
//! - [`IntervalBarrier`]: admits once a minimum interval has elapsed since the
//!   last success. Used for the slow-moving historical series.
//! - [`WindowBarrier`]: admits only during an allowed range of minutes of the
//!   hour, with bounded retries, a cooldown after repeated failure and a
//!   sticky force flag. Used for the live measure.

mod interval;
mod window;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

pub use interval::IntervalBarrier;
pub use window::WindowBarrier;

/// Outcome of evaluating a barrier at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    /// A forced update was requested; every other rule is bypassed
    Forced,
    /// A previous attempt failed and the retry budget is not exhausted
    Retrying { failures: u32, max_retries: u32 },
    /// No rule blocks the attempt
    Ready,
    /// Too many failures; attempts are banned until `until`
    CooldownActive { until: DateTime<Utc> },
    /// Current minute of the hour is outside the allowed window
    WindowClosed { minute: u32, start: u32, end: u32 },
    /// Last success is younger than the minimum age
    TooRecent { age: TimeDelta, min_age: TimeDelta },
    /// Minimum interval since the last success has not elapsed
    IntervalNotElapsed { elapsed: TimeDelta, interval: TimeDelta },
}

impl BarrierState {
    /// Whether a fetch may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Forced | Self::Retrying { .. } | Self::Ready)
    }

    /// Stable upper-case name, used in attributes and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Forced => "FORCED",
            Self::Retrying { .. } => "RETRYING",
            Self::Ready => "READY",
            Self::CooldownActive { .. } => "COOLDOWN_BARRIER_ACTIVE",
            Self::WindowClosed { .. } => "UPDATE_WINDOW_CLOSED",
            Self::TooRecent { .. } => "TOO_RECENT",
            Self::IntervalNotElapsed { .. } => "INTERVAL_NOT_ELAPSED",
        }
    }
}

impl fmt::Display for BarrierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => write!(f, "forced"),
            Self::Retrying {
                failures,
                max_retries,
            } => write!(f, "retrying ({failures}/{max_retries} failures)"),
            Self::Ready => write!(f, "no blockers"),
            Self::CooldownActive { until } => {
                write!(f, "cooldown barrier is active (until {until})")
            }
            Self::WindowClosed { minute, start, end } => write!(
                f,
                "update window is closed (minute {minute}, window {start}-{end})"
            ),
            Self::TooRecent { age, min_age } => write!(
                f,
                "last success is too recent ({} seconds, min: {} seconds)",
                age.num_seconds(),
                min_age.num_seconds()
            ),
            Self::IntervalNotElapsed { elapsed, interval } => write!(
                f,
                "interval not elapsed ({} of {} seconds)",
                elapsed.num_seconds(),
                interval.num_seconds()
            ),
        }
    }
}

/// Serializable snapshot of a barrier's configuration and state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BarrierAttributes {
    Interval {
        min_interval_secs: i64,
        last_success: DateTime<Utc>,
        state: &'static str,
    },
    Window {
        update_window_interval: (u32, u32),
        max_age_secs: i64,
        max_retries: u32,
        delay_interval: (u64, u64),
        cooldown: DateTime<Utc>,
        forced: bool,
        last_success: DateTime<Utc>,
        retry: u32,
        state: &'static str,
    },
}

/// A polling gate for one dataset.
///
/// `check` may perform housekeeping on the barrier's own state before
/// deciding; `state` evaluates the same rules without mutating anything.
pub trait Barrier: Send + fmt::Debug {
    /// Decide whether an attempt is allowed at `now`.
    fn check(&mut self, now: DateTime<Utc>) -> BarrierState;

    /// Evaluate the rules at `now` without housekeeping.
    fn state(&self, now: DateTime<Utc>) -> BarrierState;

    /// Record a successful attempt.
    fn success(&mut self, now: DateTime<Utc>);

    /// Record a failed attempt.
    fn fail(&mut self, now: DateTime<Utc>);

    /// Request that the next check bypasses the regular rules.
    fn force_next(&mut self);

    /// Diagnostic view of configuration and state.
    fn attributes(&self, now: DateTime<Utc>) -> BarrierAttributes;

    /// Pause to take before an admitted attempt.
    fn delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Shorthand for `check(now).is_allowed()`.
    fn allowed(&mut self, now: DateTime<Utc>) -> bool {
        self.check(now).is_allowed()
    }
}
