//! Minimum-interval gate.

use chrono::{DateTime, TimeDelta, Utc};

use super::{Barrier, BarrierAttributes, BarrierState};
use crate::utils::epoch;
use crate::utils::log::Logger;

/// Admits an attempt once `min_interval` has passed since the last success.
///
/// Failures are not penalized: a failed attempt leaves `last_success`
/// untouched, so the gate stays open and the next tick tries again.
#[derive(Debug, Clone)]
pub struct IntervalBarrier {
    min_interval: TimeDelta,
    last_success: DateTime<Utc>,
    log: Logger,
}

impl IntervalBarrier {
    pub fn new(min_interval: TimeDelta, log: Logger) -> Self {
        Self {
            min_interval,
            last_success: epoch(),
            log,
        }
    }

    pub fn min_interval(&self) -> TimeDelta {
        self.min_interval
    }

    pub fn last_success(&self) -> DateTime<Utc> {
        self.last_success
    }
}

impl Barrier for IntervalBarrier {
    fn check(&mut self, now: DateTime<Utc>) -> BarrierState {
        let state = self.state(now);
        if state.is_allowed() {
            self.log.debug("Execution allowed: interval elapsed");
        } else {
            self.log.debug(&format!("Execution denied: {state}"));
        }
        state
    }

    fn state(&self, now: DateTime<Utc>) -> BarrierState {
        let elapsed = now - self.last_success;
        if elapsed < self.min_interval {
            return BarrierState::IntervalNotElapsed {
                elapsed,
                interval: self.min_interval,
            };
        }

        BarrierState::Ready
    }

    fn success(&mut self, now: DateTime<Utc>) {
        self.last_success = now;
        self.log.debug("Success registered");
    }

    fn fail(&mut self, _now: DateTime<Utc>) {
        self.log.debug("Fail registered (not penalized)");
    }

    fn force_next(&mut self) {
        self.log.debug("Force request ignored: interval barrier");
    }

    fn attributes(&self, now: DateTime<Utc>) -> BarrierAttributes {
        BarrierAttributes::Interval {
            min_interval_secs: self.min_interval.num_seconds(),
            last_success: self.last_success,
            state: self.state(now).name(),
        }
    }
}
