// src/lib.rs

//! meterpoll library
//!
//! Gated polling of a rate-limited metering API. A [`coordinator::Coordinator`]
//! refreshes the datasets its consumers ask for, each one behind its own
//! [`barrier::Barrier`], and publishes the merged snapshot after every tick.

pub mod api;
pub mod barrier;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod models;
pub mod utils;
