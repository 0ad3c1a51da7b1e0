//! Consumers of the coordinator's snapshot.
//!
//! A consumer declares which datasets it needs; the union of all declared
//! interests decides what the next tick fetches. Behaviour is composed from
//! small capabilities at the call site rather than inherited:
//!
//! - [`CoordinatorListener`]: receives every published snapshot (push).
//! - [`RestoreFn`]: yields a value kept from a previous run, if any.
//!   [`AccumulatedReading`] uses it to decide whether it needs a forced fetch.
//! - [`HistoricalSink`]: receives new historical readings.
//!   [`HistoricalFeed`] bridges a listener to a sink.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use super::Published;
use crate::models::{DatasetKind, HistoricalReading, HistoricalSeries};
use crate::utils::log::Logger;

/// Handle returned on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

/// Push interface for snapshot publications.
pub trait CoordinatorListener: Send + Sync {
    fn on_publish(&self, update: &Published);
}

struct Registration {
    interest: DatasetKind,
    listener: Option<Arc<dyn CoordinatorListener>>,
}

/// Bookkeeping of registered consumers and queued force requests.
#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    next_id: u64,
    entries: BTreeMap<ConsumerId, Registration>,
    pending_force: DatasetKind,
}

impl ConsumerRegistry {
    pub(crate) fn register(
        &mut self,
        interest: DatasetKind,
        listener: Option<Arc<dyn CoordinatorListener>>,
    ) -> ConsumerId {
        self.next_id += 1;
        let id = ConsumerId(self.next_id);
        self.entries.insert(id, Registration { interest, listener });
        id
    }

    pub(crate) fn unregister(&mut self, id: ConsumerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Union of every registered interest.
    pub(crate) fn requested(&self) -> DatasetKind {
        self.entries
            .values()
            .map(|registration| registration.interest)
            .collect()
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn CoordinatorListener>> {
        self.entries
            .values()
            .filter_map(|registration| registration.listener.clone())
            .collect()
    }

    pub(crate) fn queue_force(&mut self, kinds: DatasetKind) {
        self.pending_force |= kinds;
    }

    pub(crate) fn take_forced(&mut self) -> DatasetKind {
        std::mem::take(&mut self.pending_force)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Produces a value kept from a previous run.
pub type RestoreFn = Box<dyn Fn() -> Option<f64> + Send + Sync>;

/// Latest accumulated meter reading.
///
/// Starts from whatever the restore function yields. A reading that could
/// not be restored has nothing to show until the next allowed window, so
/// the owner should force a measure fetch when [`needs_bootstrap`] is true.
///
/// [`needs_bootstrap`]: AccumulatedReading::needs_bootstrap
pub struct AccumulatedReading {
    state: Mutex<ReadingState>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReadingState {
    accumulated: Option<f64>,
    last_power: Option<f64>,
}

impl AccumulatedReading {
    pub fn restore(restore: RestoreFn, log: &Logger) -> Self {
        let accumulated = restore();
        match accumulated {
            Some(value) => log.debug(&format!("restore state: got {value} kWh")),
            None => log.debug("restore state: no previous state"),
        }

        Self {
            state: Mutex::new(ReadingState {
                accumulated,
                last_power: None,
            }),
        }
    }

    pub fn needs_bootstrap(&self) -> bool {
        self.read().accumulated.is_none()
    }

    /// Accumulated energy in kWh.
    pub fn value(&self) -> Option<f64> {
        self.read().accumulated
    }

    /// Last instantaneous power reading in W.
    pub fn last_power(&self) -> Option<f64> {
        self.read().last_power
    }

    fn read(&self) -> ReadingState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CoordinatorListener for AccumulatedReading {
    fn on_publish(&self, update: &Published) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = update.snapshot.measure_accumulated {
            state.accumulated = Some(value);
        }
        if let Some(power) = update.snapshot.measure_instant {
            state.last_power = Some(power);
        }
    }
}

/// Destination for historical readings, e.g. a time-series store.
pub trait HistoricalSink: Send + Sync {
    fn write(&self, kind: DatasetKind, readings: &[HistoricalReading]);
}

/// Forwards readings of one historical series to a sink, once each.
///
/// Only readings ending after the last forwarded one are written, so
/// republishing an unchanged snapshot writes nothing.
pub struct HistoricalFeed<S> {
    kind: DatasetKind,
    sink: S,
    last_end: Mutex<Option<DateTime<Utc>>>,
    log: Logger,
}

impl<S: HistoricalSink> HistoricalFeed<S> {
    /// Feed of the consumption series.
    pub fn consumption(sink: S, log: Logger) -> Self {
        Self::new(DatasetKind::HISTORICAL_CONSUMPTION, sink, log)
    }

    /// Feed of the generation series.
    pub fn generation(sink: S, log: Logger) -> Self {
        Self::new(DatasetKind::HISTORICAL_GENERATION, sink, log)
    }

    fn new(kind: DatasetKind, sink: S, log: Logger) -> Self {
        Self {
            kind,
            sink,
            last_end: Mutex::new(None),
            log,
        }
    }

    /// Dataset this feed needs.
    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn series<'a>(&self, update: &'a Published) -> &'a HistoricalSeries {
        if self.kind == DatasetKind::HISTORICAL_GENERATION {
            &update.snapshot.historical_generation
        } else {
            &update.snapshot.historical_consumption
        }
    }
}

impl<S: HistoricalSink> CoordinatorListener for HistoricalFeed<S> {
    fn on_publish(&self, update: &Published) {
        if !update.updated.intersects(self.kind) {
            return;
        }

        let mut last_end = self.last_end.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh: Vec<HistoricalReading> = self
            .series(update)
            .historical
            .iter()
            .filter(|reading| last_end.is_none_or(|end| reading.end > end))
            .cloned()
            .collect();

        if fresh.is_empty() {
            return;
        }

        *last_end = fresh.iter().map(|reading| reading.end).max();
        self.log
            .debug(&format!("forwarding {} new readings", fresh.len()));
        self.sink.write(self.kind, &fresh);
    }
}
