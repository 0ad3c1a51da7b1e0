//! Per-dataset fetch functions.
//!
//! A [`Fetcher`] turns "fetch dataset X now" into the snapshot fields for X,
//! or a classified [`FetchError`]. [`ApiFetcher`] is the production one,
//! backed by a [`MeterApi`]. [`fetch_guarded`] is what the coordinator
//! actually calls: it bounds the attempt with a timeout and converts a
//! panicking fetch into an error instead of tearing down the tick.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta, Utc};
use futures::FutureExt;

use crate::api::MeterApi;
use crate::error::FetchError;
use crate::models::{DatasetKind, SnapshotPatch};

/// Days of history requested for consumption and generation.
pub const HISTORICAL_PERIOD_DAYS: i64 = 7;

/// Produces snapshot fields for a single dataset.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, kind: DatasetKind, now: DateTime<Utc>)
    -> Result<SnapshotPatch, FetchError>;
}

/// Fetcher backed by the upstream API client.
#[derive(Debug, Clone)]
pub struct ApiFetcher<A> {
    api: A,
}

impl<A: MeterApi> ApiFetcher<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    async fn fetch_measure(&self) -> Result<SnapshotPatch, FetchError> {
        let measure = self.api.get_measure().await?;
        Ok(SnapshotPatch::Measure(measure))
    }

    async fn fetch_historical_consumption(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SnapshotPatch, FetchError> {
        let (start, end) = historical_range(now);
        let series = self.api.get_historical_consumption(start, end).await?;
        Ok(SnapshotPatch::HistoricalConsumption(series))
    }

    async fn fetch_historical_generation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SnapshotPatch, FetchError> {
        let (start, end) = historical_range(now);
        let series = self.api.get_historical_generation(start, end).await?;
        Ok(SnapshotPatch::HistoricalGeneration(series))
    }

    async fn fetch_historical_power_demand(&self) -> Result<SnapshotPatch, FetchError> {
        let peaks = self.api.get_historical_power_demand().await?;
        Ok(SnapshotPatch::HistoricalPowerDemand(peaks))
    }
}

#[async_trait]
impl<A: MeterApi> Fetcher for ApiFetcher<A> {
    async fn fetch(
        &self,
        kind: DatasetKind,
        now: DateTime<Utc>,
    ) -> Result<SnapshotPatch, FetchError> {
        match kind {
            DatasetKind::MEASURE => self.fetch_measure().await,
            DatasetKind::HISTORICAL_CONSUMPTION => self.fetch_historical_consumption(now).await,
            DatasetKind::HISTORICAL_GENERATION => self.fetch_historical_generation(now).await,
            DatasetKind::HISTORICAL_POWER_DEMAND => self.fetch_historical_power_demand().await,
            other => Err(FetchError::unclassified(format!(
                "no fetch function for dataset {other}"
            ))),
        }
    }
}

/// Local calendar dates covering the last [`HISTORICAL_PERIOD_DAYS`].
fn historical_range(now: DateTime<Utc>) -> (chrono::NaiveDate, chrono::NaiveDate) {
    let end = now.with_timezone(&Local).date_naive();
    let start = end - TimeDelta::days(HISTORICAL_PERIOD_DAYS);
    (start, end)
}

/// Fetch one dataset with a timeout, converting panics into errors.
///
/// A timeout is reported as a transport error and a panic as an
/// unclassified error; both count as a failed attempt.
pub async fn fetch_guarded(
    fetcher: &dyn Fetcher,
    kind: DatasetKind,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Result<SnapshotPatch, FetchError> {
    let attempt = AssertUnwindSafe(fetcher.fetch(kind, now)).catch_unwind();

    match tokio::time::timeout(timeout, attempt).await {
        Err(_) => Err(FetchError::transport(format!(
            "timed out after {:.1} seconds",
            timeout.as_secs_f64()
        ))),
        Ok(Err(panic)) => Err(FetchError::unclassified(format!(
            "fetch panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Ok(Ok(result)) => result,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
