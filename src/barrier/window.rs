//! Time-of-hour window gate with bounded retries and cooldown.
//!
//! ## Rules
//!
//! Evaluated in order, first match wins:
//!
//! 1. Failures at or above `max_retries` with the cooldown expired are
//!    forgotten (housekeeping, `check` only).
//! 2. Force flag set: **FORCED** (admit, even during cooldown).
//! 3. `now < cooldown_until`: **COOLDOWN_BARRIER_ACTIVE** (deny).
//! 4. `0 < failures < max_retries`: **RETRYING** (admit, window ignored).
//! 5. Minute of the hour outside `[start, end]`: **UPDATE_WINDOW_CLOSED** (deny).
//! 6. Last success not older than `(end - start)` minutes: **TOO_RECENT** (deny).
//! 7. Otherwise **READY** (admit).
//!
//! Reaching `max_retries` failures sets a cooldown of `max_age / 2`.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, TimeDelta, Timelike, Utc};

use super::{Barrier, BarrierAttributes, BarrierState};
use crate::utils::epoch;
use crate::utils::log::Logger;

/// Gate for datasets the upstream only serves during part of each hour.
#[derive(Debug, Clone)]
pub struct WindowBarrier {
    // Configuration
    window_start: u32,
    window_end: u32,
    max_retries: u32,
    max_age: TimeDelta,
    delay_min_secs: u64,
    delay_max_secs: u64,
    utc_offset: Option<FixedOffset>,

    // State
    force_next: bool,
    failures: u32,
    last_success: DateTime<Utc>,
    cooldown_until: DateTime<Utc>,

    log: Logger,
}

impl WindowBarrier {
    /// Create a barrier open during minutes `window.0..=window.1` of each
    /// local hour.
    pub fn new(window: (u32, u32), max_retries: u32, max_age: TimeDelta, log: Logger) -> Self {
        Self {
            window_start: window.0,
            window_end: window.1,
            max_retries,
            max_age,
            delay_min_secs: 0,
            delay_max_secs: 0,
            utc_offset: None,
            force_next: false,
            failures: 0,
            last_success: epoch(),
            cooldown_until: epoch(),
            log,
        }
    }

    /// Sleep a random amount between `min_secs` and `max_secs` before each
    /// admitted attempt.
    pub fn with_delay(mut self, min_secs: u64, max_secs: u64) -> Self {
        self.delay_min_secs = min_secs;
        self.delay_max_secs = max_secs.max(min_secs);
        self
    }

    /// Evaluate the window in a fixed offset instead of the local timezone.
    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = Some(offset);
        self
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_forced(&self) -> bool {
        self.force_next
    }

    pub fn last_success(&self) -> DateTime<Utc> {
        self.last_success
    }

    pub fn cooldown_until(&self) -> DateTime<Utc> {
        self.cooldown_until
    }

    /// Minimum age of the last success before a regular attempt.
    pub fn min_age(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.window_end) - i64::from(self.window_start))
    }

    fn minute_of_hour(&self, now: DateTime<Utc>) -> u32 {
        match self.utc_offset {
            Some(offset) => now.with_timezone(&offset).minute(),
            None => now.with_timezone(&Local).minute(),
        }
    }
}

impl Barrier for WindowBarrier {
    fn check(&mut self, now: DateTime<Utc>) -> BarrierState {
        if self.failures >= self.max_retries && now >= self.cooldown_until {
            if self.failures > 0 {
                self.log.debug("cooldown barrier reached, resetting failures");
            }
            self.failures = 0;
        }

        let state = self.state(now);
        if state.is_allowed() {
            self.log.debug(&format!("Execution allowed: {state}"));
        } else {
            self.log.debug(&format!("Execution denied: {state}"));
        }
        state
    }

    fn state(&self, now: DateTime<Utc>) -> BarrierState {
        if self.force_next {
            return BarrierState::Forced;
        }

        if now < self.cooldown_until {
            return BarrierState::CooldownActive {
                until: self.cooldown_until,
            };
        }

        if self.failures > 0 && self.failures < self.max_retries {
            return BarrierState::Retrying {
                failures: self.failures,
                max_retries: self.max_retries,
            };
        }

        let minute = self.minute_of_hour(now);
        if minute < self.window_start || minute > self.window_end {
            return BarrierState::WindowClosed {
                minute,
                start: self.window_start,
                end: self.window_end,
            };
        }

        let age = now - self.last_success;
        let min_age = self.min_age();
        if age <= min_age {
            return BarrierState::TooRecent { age, min_age };
        }

        BarrierState::Ready
    }

    fn success(&mut self, now: DateTime<Utc>) {
        self.force_next = false;
        self.failures = 0;
        self.last_success = now;

        self.log.debug("Success registered");
    }

    fn fail(&mut self, now: DateTime<Utc>) {
        self.failures = self.failures.saturating_add(1);
        self.log.debug(&format!(
            "Fail registered ({}/{})",
            self.failures, self.max_retries
        ));

        if self.failures >= self.max_retries {
            self.force_next = false;
            self.cooldown_until = now
                .checked_add_signed(self.max_age / 2)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);

            self.log.debug(&format!(
                "Max failures reached, setup cooldown barrier until {}",
                self.cooldown_until
            ));
        }
    }

    fn force_next(&mut self) {
        self.force_next = true;
        self.log.debug("Next execution forced");
    }

    fn attributes(&self, now: DateTime<Utc>) -> BarrierAttributes {
        BarrierAttributes::Window {
            update_window_interval: (self.window_start, self.window_end),
            max_age_secs: self.max_age.num_seconds(),
            max_retries: self.max_retries,
            delay_interval: (self.delay_min_secs, self.delay_max_secs),
            cooldown: self.cooldown_until,
            forced: self.force_next,
            last_success: self.last_success,
            retry: self.failures,
            state: self.state(now).name(),
        }
    }

    fn delay(&self) -> Duration {
        if self.delay_max_secs == 0 {
            return Duration::ZERO;
        }

        let tenths = fastrand::u64(
            self.delay_min_secs.saturating_mul(10)..=self.delay_max_secs.saturating_mul(10),
        );
        let delay = Duration::from_millis(tenths.saturating_mul(100));
        self.log
            .debug(&format!("Random delay: {:.1} seconds", delay.as_secs_f64()));
        delay
    }
}
