//! Boundary with the upstream metering API.
//!
//! The poller only needs the four calls below. Authentication, sessions and
//! the exact wire format belong to the implementation; [`HttpMeterApi`] is a
//! plain JSON-over-HTTP one.

mod http;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::FetchError;
use crate::models::{HistoricalSeries, Measure, PowerDemandPeak};

pub use http::HttpMeterApi;

/// Upstream metering API client.
#[async_trait]
pub trait MeterApi: Send + Sync {
    /// Live reading of the meter.
    async fn get_measure(&self) -> Result<Measure, FetchError>;

    /// Consumption series between two dates, inclusive.
    async fn get_historical_consumption(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HistoricalSeries, FetchError>;

    /// Generation series between two dates, inclusive.
    async fn get_historical_generation(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HistoricalSeries, FetchError>;

    /// Every power demand peak the upstream keeps.
    async fn get_historical_power_demand(&self) -> Result<Vec<PowerDemandPeak>, FetchError>;
}
