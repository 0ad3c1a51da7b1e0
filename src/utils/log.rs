// src/utils/log.rs

//! Injectable logging handle.
//!
//! Components never reach for a global logger name. They receive a
//! [`Logger`] from whoever constructs them and log through it, so every line
//! carries the target of the component that emitted it
//! (`meterpoll::barrier::measure`, `meterpoll::coordinator`, ...). Output
//! goes through the `log` facade; the binary decides where it ends up.

use std::sync::Arc;

use log::Level;

/// Root target used when no other is given.
pub const ROOT_TARGET: &str = "meterpoll";

/// Cheap, cloneable logging handle bound to a target.
#[derive(Debug, Clone)]
pub struct Logger {
    target: Arc<str>,
}

impl Logger {
    /// Create a logger for the given target.
    pub fn new(target: impl AsRef<str>) -> Self {
        Self {
            target: Arc::from(target.as_ref()),
        }
    }

    /// Derive a logger for a sub-component (`parent::name`).
    pub fn child(&self, name: &str) -> Self {
        Self::new(format!("{}::{}", self.target, name))
    }

    /// Target this logger writes to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Check if a log level would be displayed
    pub fn enabled(&self, level: Level) -> bool {
        log::log_enabled!(target: self.target(), level)
    }

    fn emit(&self, level: Level, message: &str) {
        log::log!(target: self.target(), level, "{}", message);
    }

    /// Log a debug message
    pub fn debug(&self, message: &str) {
        self.emit(Level::Debug, message);
    }

    /// Log an info message
    pub fn info(&self, message: &str) {
        self.emit(Level::Info, message);
    }

    /// Log a warning message
    pub fn warn(&self, message: &str) {
        self.emit(Level::Warn, message);
    }

    /// Log an error message
    pub fn error(&self, message: &str) {
        self.emit(Level::Error, message);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(ROOT_TARGET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_target() {
        let root = Logger::default();
        let barrier = root.child("barrier").child("measure");
        assert_eq!(barrier.target(), "meterpoll::barrier::measure");
        assert_eq!(root.target(), ROOT_TARGET);
    }
}
