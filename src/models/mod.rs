// src/models/mod.rs

//! Domain models for the poller.
//!
//! Datasets, the merged snapshot and the configuration structures.

mod config;
mod dataset;
mod snapshot;

// Re-export all public types
pub use config::{
    ApiConfig, BarrierMap, BarrierPolicy, Config, CoordinatorConfig, LoggingConfig,
};
pub use dataset::DatasetKind;
pub use snapshot::{
    HistoricalReading, HistoricalSeries, Measure, PowerDemandPeak, Snapshot, SnapshotPatch,
};
