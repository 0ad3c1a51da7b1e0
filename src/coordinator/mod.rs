// src/coordinator/mod.rs

//! Refresh orchestration.
//!
//! Once per tick the [`Coordinator`]:
//!
//! 1. Computes the datasets requested by registered consumers
//! 2. Asks each dataset's barrier whether a fetch is allowed now
//! 3. Fetches the admitted datasets one after another
//! 4. Merges results into the shared snapshot and reports the outcome back
//!    to the barrier
//! 5. Publishes the snapshot to every consumer
//!
//! A failure only affects its own dataset: the snapshot keeps the last good
//! value and the other datasets of the same tick are still fetched.

mod consumer;
mod fetch;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;

use crate::api::HttpMeterApi;
use crate::barrier::BarrierAttributes;
use crate::error::{FetchError, Result};
use crate::models::{BarrierMap, Config, CoordinatorConfig, DatasetKind, Snapshot};
use crate::utils::epoch;
use crate::utils::log::Logger;

pub use consumer::{
    AccumulatedReading, ConsumerId, CoordinatorListener, HistoricalFeed, HistoricalSink,
    RestoreFn,
};
pub use fetch::{ApiFetcher, Fetcher, HISTORICAL_PERIOD_DAYS, fetch_guarded};

use consumer::ConsumerRegistry;

/// What consumers receive after every tick.
#[derive(Debug, Clone)]
pub struct Published {
    /// Last known value of every dataset
    pub snapshot: Arc<Snapshot>,
    /// True if something was updated, or nothing was requested
    pub last_tick_succeeded: bool,
    /// Datasets refreshed during this tick
    pub updated: DatasetKind,
    /// Instant the tick was evaluated at
    pub published_at: DateTime<Utc>,
}

impl Published {
    fn initial() -> Self {
        Self {
            snapshot: Arc::new(Snapshot::default()),
            last_tick_succeeded: true,
            updated: DatasetKind::NONE,
            published_at: epoch(),
        }
    }
}

/// State written only by the tick holder.
struct TickState {
    barriers: BarrierMap,
    snapshot: Snapshot,
}

/// Polls the upstream on behalf of registered consumers.
pub struct Coordinator {
    /// Held for a whole tick; serializes scheduled and on-demand refreshes
    tick_state: tokio::sync::Mutex<TickState>,
    consumers: Mutex<ConsumerRegistry>,
    published: watch::Sender<Arc<Published>>,
    fetcher: Arc<dyn Fetcher>,
    tick_interval: Duration,
    fetch_timeout: Duration,
    wakeup: Notify,
    log: Logger,
}

impl Coordinator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        barriers: BarrierMap,
        settings: &CoordinatorConfig,
        log: Logger,
    ) -> Self {
        let (published, _) = watch::channel(Arc::new(Published::initial()));

        Self {
            tick_state: tokio::sync::Mutex::new(TickState {
                barriers,
                snapshot: Snapshot::default(),
            }),
            consumers: Mutex::new(ConsumerRegistry::default()),
            published,
            fetcher,
            tick_interval: Duration::from_secs(settings.tick_interval_secs),
            fetch_timeout: Duration::from_secs(settings.fetch_timeout_secs),
            wakeup: Notify::new(),
            log,
        }
    }

    /// Build a coordinator talking to the configured HTTP API.
    pub fn from_config(config: &Config, log: &Logger) -> Result<Self> {
        config.validate()?;

        let api = HttpMeterApi::new(&config.api, log.child("api"))?;
        let barriers = config.build_barriers(log)?;

        Ok(Self::new(
            Arc::new(ApiFetcher::new(api)),
            barriers,
            &config.coordinator,
            log.child("coordinator"),
        ))
    }

    fn registry(&self) -> MutexGuard<'_, ConsumerRegistry> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a consumer that polls [`latest`](Self::latest) or a
    /// [`subscribe`](Self::subscribe) receiver.
    pub fn register_consumer(&self, interest: DatasetKind) -> ConsumerId {
        let id = self.registry().register(interest, None);
        self.log
            .debug(&format!("{id} registered, interested in {interest}"));
        id
    }

    /// Register a consumer that is called after every tick.
    pub fn register_listener(
        &self,
        interest: DatasetKind,
        listener: Arc<dyn CoordinatorListener>,
    ) -> ConsumerId {
        let id = self.registry().register(interest, Some(listener));
        self.log
            .debug(&format!("{id} registered as listener, interested in {interest}"));
        id
    }

    /// Remove a consumer; its interest no longer counts from the next tick.
    pub fn unregister_consumer(&self, id: ConsumerId) -> bool {
        let mut registry = self.registry();
        let removed = registry.unregister(id);
        if removed {
            self.log
                .debug(&format!("{id} unregistered, {} left", registry.len()));
        }
        removed
    }

    /// Bypass the regular rules of these datasets' barriers on the next
    /// tick, and run that tick as soon as possible.
    pub fn force_refresh(&self, kinds: DatasetKind) {
        self.registry().queue_force(kinds);
        self.log.debug(&format!("forced refresh queued for {kinds}"));
        self.wakeup.notify_one();
    }

    /// Run a tick as soon as possible, without bypassing any barrier.
    pub fn request_refresh(&self) {
        self.wakeup.notify_one();
    }

    /// Receiver always holding the most recent publication.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Published>> {
        self.published.subscribe()
    }

    pub fn latest(&self) -> Arc<Published> {
        self.published.borrow().clone()
    }

    /// Diagnostic view of every barrier, keyed by dataset name.
    pub async fn barrier_attributes(
        &self,
        now: DateTime<Utc>,
    ) -> BTreeMap<&'static str, BarrierAttributes> {
        let state = self.tick_state.lock().await;
        state
            .barriers
            .iter()
            .map(|(kind, barrier)| (kind.name(), barrier.attributes(now)))
            .collect()
    }

    pub async fn tick(&self) -> Arc<Published> {
        self.tick_at(Utc::now()).await
    }

    /// Run one refresh cycle evaluated at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Arc<Published> {
        let mut guard = self.tick_state.lock().await;
        let TickState { barriers, snapshot } = &mut *guard;

        let (requested, forced) = {
            let mut registry = self.registry();
            (registry.requested(), registry.take_forced())
        };

        for kind in forced.iter() {
            match barriers.get_mut(&kind) {
                Some(barrier) => barrier.force_next(),
                None => self.log.debug(&format!(
                    "{}: force ignored, no policy defined",
                    kind.name()
                )),
            }
        }

        let mut updated = DatasetKind::NONE;
        for kind in requested.iter() {
            let name = kind.name();
            let Some(barrier) = barriers.get_mut(&kind) else {
                self.log
                    .debug(&format!("{name}: skipped, no policy defined"));
                continue;
            };

            let gate = barrier.check(now);
            if !gate.is_allowed() {
                self.log.debug(&format!("{name}: skipped, {gate}"));
                continue;
            }

            let delay = barrier.delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            self.log.debug(&format!("{name}: fetching ({gate})"));
            let outcome = fetch_guarded(self.fetcher.as_ref(), kind, now, self.fetch_timeout)
                .await
                .and_then(|patch| {
                    if patch.kind() == kind {
                        Ok(patch)
                    } else {
                        Err(FetchError::unclassified(format!(
                            "fetch returned {} data",
                            patch.kind().name()
                        )))
                    }
                });

            match outcome {
                Ok(patch) => {
                    snapshot.merge(patch);
                    barrier.success(now);
                    updated |= kind;
                    self.log.debug(&format!("{name}: updated"));
                }
                Err(err) => {
                    self.report_failure(kind, &err);
                    barrier.fail(now);
                }
            }
        }

        let published = Arc::new(Published {
            snapshot: Arc::new(snapshot.clone()),
            last_tick_succeeded: !updated.is_empty() || requested.is_empty(),
            updated,
            published_at: now,
        });

        if !updated.is_empty() {
            self.log.info(&format!("Tick updated {updated}"));
        } else if !published.last_tick_succeeded {
            self.log
                .debug(&format!("Tick updated nothing (requested {requested})"));
        }

        self.published.send_replace(published.clone());
        let listeners = self.registry().listeners();
        for listener in listeners {
            listener.on_publish(&published);
        }

        published
    }

    fn report_failure(&self, kind: DatasetKind, err: &FetchError) {
        let name = kind.name();
        match err {
            FetchError::Transport(_) | FetchError::Protocol { .. } => {
                self.log.warn(&format!("{name}: fetch failed: {err}"));
            }
            FetchError::Decoding(_) => {
                self.log.error(&format!(
                    "{name}: unexpected upstream answer, the API format may have changed: {err}"
                ));
            }
            FetchError::Unclassified(_) => {
                self.log
                    .error(&format!("{name}: fetch failed, this is a bug: {err}"));
            }
        }
    }

    /// Tick on a fixed interval and on demand until `shutdown` resolves.
    ///
    /// Shutdown is only observed between ticks; a tick in progress finishes.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        self.log.info(&format!(
            "Polling every {} seconds",
            self.tick_interval.as_secs()
        ));

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    self.log.info("Shutdown requested, stopping");
                    break;
                }
                _ = interval.tick() => {}
                _ = self.wakeup.notified() => {
                    self.log.debug("Refresh requested");
                }
            }

            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{FixedOffset, TimeDelta, TimeZone};

    use crate::barrier::{IntervalBarrier, WindowBarrier};
    use crate::models::{HistoricalSeries, Measure, SnapshotPatch};

    enum Outcome {
        Fail(FetchError),
        Panic,
    }

    /// Succeeds unless an outcome was scripted for the dataset.
    #[derive(Default)]
    struct ScriptedFetcher {
        scripted: Mutex<HashMap<DatasetKind, VecDeque<Outcome>>>,
        calls: Mutex<Vec<DatasetKind>>,
    }

    impl ScriptedFetcher {
        fn script(self, kind: DatasetKind, outcomes: Vec<Outcome>) -> Self {
            for outcome in outcomes {
                self.push(kind, outcome);
            }
            self
        }

        fn push(&self, kind: DatasetKind, outcome: Outcome) {
            self.scripted
                .lock()
                .unwrap()
                .entry(kind)
                .or_default()
                .push_back(outcome);
        }

        fn calls(&self) -> Vec<DatasetKind> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            kind: DatasetKind,
            _now: DateTime<Utc>,
        ) -> std::result::Result<SnapshotPatch, FetchError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(kind);
                calls.len() as f64
            };
            let outcome = self
                .scripted
                .lock()
                .unwrap()
                .get_mut(&kind)
                .and_then(VecDeque::pop_front);

            match outcome {
                Some(Outcome::Fail(err)) => Err(err),
                Some(Outcome::Panic) => panic!("fetch of {kind} exploded"),
                None => Ok(patch_for(kind, call)),
            }
        }
    }

    fn patch_for(kind: DatasetKind, value: f64) -> SnapshotPatch {
        let series = HistoricalSeries {
            accumulated: Some(value),
            ..HistoricalSeries::default()
        };
        match kind {
            DatasetKind::MEASURE => SnapshotPatch::Measure(Measure {
                accumulate: value,
                instant: value,
            }),
            DatasetKind::HISTORICAL_CONSUMPTION => SnapshotPatch::HistoricalConsumption(series),
            DatasetKind::HISTORICAL_GENERATION => SnapshotPatch::HistoricalGeneration(series),
            _ => SnapshotPatch::HistoricalPowerDemand(vec![]),
        }
    }

    /// Measure gated by a 50-59 UTC window, consumption by a 6 h interval.
    fn barriers() -> BarrierMap {
        let mut barriers = BarrierMap::new();
        barriers.insert(
            DatasetKind::MEASURE,
            Box::new(
                WindowBarrier::new((50, 59), 3, TimeDelta::seconds(3000), Logger::default())
                    .with_utc_offset(FixedOffset::east_opt(0).unwrap()),
            ),
        );
        barriers.insert(
            DatasetKind::HISTORICAL_CONSUMPTION,
            Box::new(IntervalBarrier::new(TimeDelta::hours(6), Logger::default())),
        );
        barriers
    }

    fn coordinator(fetcher: ScriptedFetcher) -> (Coordinator, Arc<ScriptedFetcher>) {
        let fetcher = Arc::new(fetcher);
        let settings = CoordinatorConfig {
            tick_interval_secs: 30,
            fetch_timeout_secs: 5,
        };
        let coordinator = Coordinator::new(
            fetcher.clone(),
            barriers(),
            &settings,
            Logger::new("meterpoll::coordinator"),
        );
        (coordinator, fetcher)
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, hour, minute, 0).unwrap()
    }

    async fn measure_retries(coordinator: &Coordinator, now: DateTime<Utc>) -> (u32, &'static str) {
        let attributes = coordinator.barrier_attributes(now).await;
        match &attributes["measure"] {
            BarrierAttributes::Window { retry, state, .. } => (*retry, *state),
            other => panic!("unexpected attributes: {other:?}"),
        }
    }

    #[derive(Default)]
    struct CountingListener {
        seen: Mutex<Vec<DatasetKind>>,
    }

    impl CoordinatorListener for CountingListener {
        fn on_publish(&self, update: &Published) {
            self.seen.lock().unwrap().push(update.updated);
        }
    }

    #[tokio::test]
    async fn test_nothing_requested_is_a_success() {
        let (coordinator, fetcher) = coordinator(ScriptedFetcher::default());

        let published = coordinator.tick_at(at(12, 55)).await;
        assert!(published.last_tick_succeeded);
        assert!(published.updated.is_empty());
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_dataset() {
        let (coordinator, fetcher) = coordinator(ScriptedFetcher::default().script(
            DatasetKind::MEASURE,
            vec![
                Outcome::Fail(FetchError::transport("connection reset")),
                Outcome::Fail(FetchError::transport("connection reset")),
            ],
        ));
        coordinator.register_consumer(DatasetKind::MEASURE | DatasetKind::HISTORICAL_CONSUMPTION);

        let now = at(12, 55);
        let published = coordinator.tick_at(now).await;

        assert_eq!(
            fetcher.calls(),
            vec![DatasetKind::MEASURE, DatasetKind::HISTORICAL_CONSUMPTION]
        );
        assert_eq!(published.updated, DatasetKind::HISTORICAL_CONSUMPTION);
        assert!(published.last_tick_succeeded);
        assert_eq!(published.snapshot.measure_accumulated, None);
        assert_eq!(published.snapshot.historical_consumption.accumulated, Some(2.0));
        assert_eq!(measure_retries(&coordinator, now).await, (1, "RETRYING"));

        let later = at(12, 56);
        let before = coordinator.barrier_attributes(later).await["historical_consumption"].clone();
        assert_eq!(
            before,
            BarrierAttributes::Interval {
                min_interval_secs: 6 * 3600,
                last_success: now,
                state: "INTERVAL_NOT_ELAPSED",
            }
        );

        coordinator.tick_at(later).await;
        assert_eq!(fetcher.calls().len(), 3);
        assert_eq!(measure_retries(&coordinator, later).await, (2, "RETRYING"));
        let after = coordinator.barrier_attributes(later).await["historical_consumption"].clone();
        assert_eq!(after, before);
    }

    /// Tracks how many fetches overlap.
    #[derive(Default)]
    struct OverlapFetcher {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for OverlapFetcher {
        async fn fetch(
            &self,
            kind: DatasetKind,
            _now: DateTime<Utc>,
        ) -> std::result::Result<SnapshotPatch, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(20)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(patch_for(kind, call as f64))
        }
    }

    #[tokio::test]
    async fn test_concurrent_ticks_are_serialized() {
        let fetcher = Arc::new(OverlapFetcher::default());
        let settings = CoordinatorConfig {
            tick_interval_secs: 30,
            fetch_timeout_secs: 5,
        };
        let coordinator = Coordinator::new(
            fetcher.clone(),
            barriers(),
            &settings,
            Logger::new("meterpoll::coordinator"),
        );
        coordinator.register_consumer(DatasetKind::HISTORICAL_CONSUMPTION);

        // Seven hours apart, so the interval barrier admits both ticks.
        let (scheduled, on_demand) =
            tokio::join!(coordinator.tick_at(at(6, 0)), coordinator.tick_at(at(13, 0)));

        assert_eq!(scheduled.updated, DatasetKind::HISTORICAL_CONSUMPTION);
        assert_eq!(on_demand.updated, DatasetKind::HISTORICAL_CONSUMPTION);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_dataset_keeps_last_good_value() {
        let (coordinator, fetcher) = coordinator(ScriptedFetcher::default());
        coordinator.register_consumer(DatasetKind::HISTORICAL_CONSUMPTION);

        let first = coordinator.tick_at(at(6, 0)).await;
        assert_eq!(first.snapshot.historical_consumption.accumulated, Some(1.0));

        fetcher.push(
            DatasetKind::HISTORICAL_CONSUMPTION,
            Outcome::Fail(FetchError::decoding("missing field `historical`")),
        );
        let second = coordinator.tick_at(at(13, 0)).await;
        assert_eq!(fetcher.calls().len(), 2);
        assert!(!second.last_tick_succeeded);
        assert_eq!(second.snapshot.historical_consumption.accumulated, Some(1.0));
    }

    #[tokio::test]
    async fn test_repeated_failures_reach_cooldown() {
        let failures = (0..3)
            .map(|_| Outcome::Fail(FetchError::protocol(Some(503), "busy")))
            .collect();
        let (coordinator, fetcher) =
            coordinator(ScriptedFetcher::default().script(DatasetKind::MEASURE, failures));
        coordinator.register_consumer(DatasetKind::MEASURE);

        let now = at(12, 55);
        for _ in 0..4 {
            let published = coordinator.tick_at(now).await;
            assert!(!published.last_tick_succeeded);
        }

        assert_eq!(fetcher.calls().len(), 3);
        let (_, state) = measure_retries(&coordinator, now).await;
        assert_eq!(state, "COOLDOWN_BARRIER_ACTIVE");
    }

    #[tokio::test]
    async fn test_panicking_fetch_does_not_abort_tick() {
        let (coordinator, fetcher) = coordinator(
            ScriptedFetcher::default().script(DatasetKind::MEASURE, vec![Outcome::Panic]),
        );
        coordinator.register_consumer(DatasetKind::MEASURE | DatasetKind::HISTORICAL_CONSUMPTION);

        let now = at(12, 55);
        let published = coordinator.tick_at(now).await;

        assert_eq!(fetcher.calls().len(), 2);
        assert_eq!(published.updated, DatasetKind::HISTORICAL_CONSUMPTION);
        assert_eq!(measure_retries(&coordinator, now).await, (1, "RETRYING"));
    }

    #[tokio::test]
    async fn test_forced_refresh_bypasses_closed_window_once() {
        let (coordinator, fetcher) = coordinator(ScriptedFetcher::default());
        coordinator.register_consumer(DatasetKind::MEASURE);

        let now = at(12, 10);
        let published = coordinator.tick_at(now).await;
        assert!(!published.last_tick_succeeded);
        assert!(fetcher.calls().is_empty());

        coordinator.force_refresh(DatasetKind::MEASURE);
        let published = coordinator.tick_at(now).await;
        assert_eq!(published.updated, DatasetKind::MEASURE);
        assert_eq!(published.snapshot.measure_accumulated, Some(1.0));

        coordinator.tick_at(now).await;
        assert_eq!(fetcher.calls(), vec![DatasetKind::MEASURE]);
    }

    #[tokio::test]
    async fn test_dataset_without_policy_is_skipped() {
        let (coordinator, fetcher) = coordinator(ScriptedFetcher::default());
        coordinator.register_consumer(DatasetKind::HISTORICAL_POWER_DEMAND);
        coordinator.force_refresh(DatasetKind::HISTORICAL_POWER_DEMAND);

        let published = coordinator.tick_at(at(12, 55)).await;
        assert!(fetcher.calls().is_empty());
        assert!(!published.last_tick_succeeded);
    }

    #[tokio::test]
    async fn test_unregistered_interest_is_dropped() {
        let (coordinator, fetcher) = coordinator(ScriptedFetcher::default());
        let id = coordinator.register_consumer(DatasetKind::HISTORICAL_CONSUMPTION);
        assert!(coordinator.unregister_consumer(id));
        assert!(!coordinator.unregister_consumer(id));

        let published = coordinator.tick_at(at(12, 55)).await;
        assert!(fetcher.calls().is_empty());
        assert!(published.last_tick_succeeded);
    }

    #[tokio::test]
    async fn test_listeners_and_subscribers_see_publication() {
        let (coordinator, _) = coordinator(ScriptedFetcher::default());
        let listener = Arc::new(CountingListener::default());
        coordinator.register_listener(DatasetKind::HISTORICAL_CONSUMPTION, listener.clone());
        let mut receiver = coordinator.subscribe();

        coordinator.tick_at(at(12, 0)).await;

        assert!(receiver.has_changed().unwrap());
        let latest = receiver.borrow_and_update().clone();
        assert_eq!(latest.updated, DatasetKind::HISTORICAL_CONSUMPTION);
        assert_eq!(latest.published_at, at(12, 0));
        assert_eq!(coordinator.latest().updated, latest.updated);
        assert_eq!(
            *listener.seen.lock().unwrap(),
            vec![DatasetKind::HISTORICAL_CONSUMPTION]
        );
    }

    #[tokio::test]
    async fn test_run_ticks_until_shutdown() {
        let (coordinator, fetcher) = coordinator(ScriptedFetcher::default());
        let coordinator = Arc::new(coordinator);
        coordinator.register_consumer(DatasetKind::HISTORICAL_CONSUMPTION);
        let mut receiver = coordinator.subscribe();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let runner = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .run(async {
                        let _ = stopped.await;
                    })
                    .await;
            })
        };

        tokio::time::timeout(Duration::from_secs(5), receiver.changed())
            .await
            .unwrap()
            .unwrap();
        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(fetcher.calls(), vec![DatasetKind::HISTORICAL_CONSUMPTION]);
    }
}
