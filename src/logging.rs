// Logger handle passed to every component of hibinit-agent
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

/// Component-scoped logging handle.
///
/// Constructed once by [`init`] and cloned into each component. The component
/// name becomes the `log` target, so `RUST_LOG=hibinit::watch=debug` works.
#[derive(Debug, Clone)]
pub struct Logger {
    target: String,
}

impl Logger {
    /// Logger without any backend setup, used by tests and library callers
    /// who install their own `log` implementation.
    pub fn new(component: &str) -> Self {
        Self {
            target: format!("hibinit::{}", component),
        }
    }

    /// Derive a logger for a sub-component
    pub fn scoped(&self, component: &str) -> Self {
        Self {
            target: format!("{}::{}", self.target, component),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        log::info!(target: &self.target, "{}", args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        log::warn!(target: &self.target, "{}", args);
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        log::error!(target: &self.target, "{}", args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        log::debug!(target: &self.target, "{}", args);
    }
}

/// Install the env_logger backend and return the root logger.
/// `RUST_LOG` overrides the level chosen by `verbose`.
pub fn init(verbose: bool) -> Logger {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .try_init();
    Logger::new("agent")
}

// Logging macros
#[macro_export]
macro_rules! info {
    ($log:expr, $($arg:tt)*) => {
        $log.info(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($log:expr, $($arg:tt)*) => {
        $log.warn(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($log:expr, $($arg:tt)*) => {
        $log.error(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($log:expr, $($arg:tt)*) => {
        $log.debug(format_args!($($arg)*))
    };
}
