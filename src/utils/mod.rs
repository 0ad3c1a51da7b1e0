//! Utility functions and helpers.

pub mod http;
pub mod log;

use chrono::{DateTime, Utc};

/// The Unix epoch, used as "never" for timestamps.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}
