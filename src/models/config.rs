//! Application configuration structures.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{FixedOffset, TimeDelta};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::barrier::{Barrier, IntervalBarrier, WindowBarrier};
use crate::error::{AppError, Result};
use crate::models::DatasetKind;
use crate::utils::log::Logger;

/// Longest duration accepted for any barrier setting (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

/// Barriers keyed by the dataset they gate.
pub type BarrierMap = BTreeMap<DatasetKind, Box<dyn Barrier>>;

/// Root application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Tick scheduling settings
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Upstream API client settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Barrier policy per dataset name. A dataset without an entry is
    /// never fetched.
    #[serde(default = "defaults::barriers")]
    pub barriers: BTreeMap<String, BarrierPolicy>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.tick_interval_secs == 0 {
            return Err(AppError::validation(
                "coordinator.tick_interval_secs must be > 0",
            ));
        }
        if self.coordinator.fetch_timeout_secs == 0 {
            return Err(AppError::validation(
                "coordinator.fetch_timeout_secs must be > 0",
            ));
        }
        if self.api.timeout_secs == 0 {
            return Err(AppError::validation("api.timeout_secs must be > 0"));
        }
        if self.api.user_agent.trim().is_empty() {
            return Err(AppError::validation("api.user_agent is empty"));
        }
        Url::parse(&self.api.base_url)
            .map_err(|e| AppError::validation(format!("api.base_url is invalid: {e}")))?;

        for (name, policy) in &self.barriers {
            dataset_for(name)?;
            policy.validate(name)?;
        }
        Ok(())
    }

    /// Build one barrier per configured dataset.
    pub fn build_barriers(&self, log: &Logger) -> Result<BarrierMap> {
        let barrier_log = log.child("barrier");
        let mut barriers = BarrierMap::new();

        for (name, policy) in &self.barriers {
            let kind = dataset_for(name)?;
            policy.validate(name)?;
            barriers.insert(kind, policy.build(name, barrier_log.child(kind.name()))?);
        }
        Ok(barriers)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            barriers: defaults::barriers(),
        }
    }
}

fn dataset_for(name: &str) -> Result<DatasetKind> {
    DatasetKind::from_name(name)
        .filter(|kind| kind.is_single())
        .ok_or_else(|| AppError::validation(format!("barriers.{name}: unknown dataset")))
}

/// Tick scheduling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Seconds between scheduled ticks
    #[serde(default = "defaults::tick_interval")]
    pub tick_interval_secs: u64,

    /// Upper bound for a single dataset fetch
    #[serde(default = "defaults::fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: defaults::tick_interval(),
            fetch_timeout_secs: defaults::fetch_timeout(),
        }
    }
}

/// Upstream API client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL every endpoint is resolved against
    #[serde(default = "defaults::base_url")]
    pub base_url: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::api_timeout")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::base_url(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::api_timeout(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter when `RUST_LOG` is unset
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

/// Gate strategy and parameters for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BarrierPolicy {
    /// Minimum interval between successes
    Interval { min_interval_secs: u64 },

    /// Allowed minutes of the hour with retries and cooldown
    Window {
        #[serde(default = "defaults::window_start")]
        window_start_minute: u32,
        #[serde(default = "defaults::window_end")]
        window_end_minute: u32,
        #[serde(default = "defaults::max_retries")]
        max_retries: u32,
        #[serde(default = "defaults::max_age")]
        max_age_secs: u64,
        #[serde(default)]
        delay_min_secs: u64,
        #[serde(default)]
        delay_max_secs: u64,
        /// Evaluate the window at this UTC offset instead of local time
        #[serde(default)]
        utc_offset_minutes: Option<i32>,
    },
}

impl BarrierPolicy {
    fn validate(&self, name: &str) -> Result<()> {
        match self {
            Self::Interval { min_interval_secs } => {
                if *min_interval_secs == 0 {
                    return Err(AppError::validation(format!(
                        "barriers.{name}.min_interval_secs must be > 0"
                    )));
                }
                check_duration(name, "min_interval_secs", *min_interval_secs)?;
            }
            Self::Window {
                window_start_minute,
                window_end_minute,
                max_retries,
                max_age_secs,
                delay_min_secs,
                delay_max_secs,
                utc_offset_minutes,
            } => {
                if *window_end_minute > 59 || window_start_minute > window_end_minute {
                    return Err(AppError::validation(format!(
                        "barriers.{name}: window must satisfy start <= end <= 59"
                    )));
                }
                if *max_retries == 0 {
                    return Err(AppError::validation(format!(
                        "barriers.{name}.max_retries must be > 0"
                    )));
                }
                if *max_age_secs == 0 {
                    return Err(AppError::validation(format!(
                        "barriers.{name}.max_age_secs must be > 0"
                    )));
                }
                check_duration(name, "max_age_secs", *max_age_secs)?;
                check_duration(name, "delay_max_secs", *delay_max_secs)?;
                if delay_min_secs > delay_max_secs {
                    return Err(AppError::validation(format!(
                        "barriers.{name}: delay_min_secs must be <= delay_max_secs"
                    )));
                }
                if let Some(minutes) = utc_offset_minutes {
                    utc_offset(*minutes).ok_or_else(|| {
                        AppError::validation(format!(
                            "barriers.{name}.utc_offset_minutes is out of range"
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }

    fn build(&self, name: &str, log: Logger) -> Result<Box<dyn Barrier>> {
        let barrier: Box<dyn Barrier> = match self {
            Self::Interval { min_interval_secs } => Box::new(IntervalBarrier::new(
                secs(name, *min_interval_secs)?,
                log,
            )),
            Self::Window {
                window_start_minute,
                window_end_minute,
                max_retries,
                max_age_secs,
                delay_min_secs,
                delay_max_secs,
                utc_offset_minutes,
            } => {
                let mut barrier = WindowBarrier::new(
                    (*window_start_minute, *window_end_minute),
                    *max_retries,
                    secs(name, *max_age_secs)?,
                    log,
                )
                .with_delay(*delay_min_secs, *delay_max_secs);

                if let Some(offset) = utc_offset_minutes.and_then(utc_offset) {
                    barrier = barrier.with_utc_offset(offset);
                }
                Box::new(barrier)
            }
        };
        Ok(barrier)
    }
}

fn check_duration(name: &str, field: &str, value: u64) -> Result<()> {
    if value > MAX_DURATION_SECS {
        return Err(AppError::validation(format!(
            "barriers.{name}.{field} must be <= {MAX_DURATION_SECS}"
        )));
    }
    Ok(())
}

fn secs(name: &str, value: u64) -> Result<TimeDelta> {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| {
            AppError::validation(format!("barriers.{name}: {value} seconds is out of range"))
        })
}

fn utc_offset(minutes: i32) -> Option<FixedOffset> {
    minutes.checked_mul(60).and_then(FixedOffset::east_opt)
}

mod defaults {
    use std::collections::BTreeMap;

    use super::BarrierPolicy;

    // Coordinator defaults
    pub fn tick_interval() -> u64 {
        30
    }
    pub fn fetch_timeout() -> u64 {
        30
    }

    // API defaults
    pub fn base_url() -> String {
        "http://127.0.0.1:8080/".into()
    }
    pub fn user_agent() -> String {
        concat!("meterpoll/", env!("CARGO_PKG_VERSION")).into()
    }
    pub fn api_timeout() -> u64 {
        20
    }

    // Logging defaults
    pub fn log_level() -> String {
        "info".into()
    }

    // Window barrier defaults
    pub fn window_start() -> u32 {
        50
    }
    pub fn window_end() -> u32 {
        59
    }
    pub fn max_retries() -> u32 {
        3
    }
    pub fn max_age() -> u64 {
        60 * 50
    }

    pub fn barriers() -> BTreeMap<String, BarrierPolicy> {
        let mut barriers = BTreeMap::new();
        barriers.insert(
            "measure".to_string(),
            BarrierPolicy::Window {
                window_start_minute: window_start(),
                window_end_minute: window_end(),
                max_retries: max_retries(),
                max_age_secs: max_age(),
                delay_min_secs: 0,
                delay_max_secs: 0,
                utc_offset_minutes: None,
            },
        );
        barriers.insert(
            "historical_consumption".to_string(),
            BarrierPolicy::Interval {
                min_interval_secs: 6 * 3600,
            },
        );
        barriers.insert(
            "historical_generation".to_string(),
            BarrierPolicy::Interval {
                min_interval_secs: 6 * 3600,
            },
        );
        barriers.insert(
            "historical_power_demand".to_string(),
            BarrierPolicy::Interval {
                min_interval_secs: 36 * 3600,
            },
        );
        barriers
    }
}
