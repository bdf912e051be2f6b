// Rewind - EVM State Time Machine
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Logging configuration for Rewind components
//!
//! Provides centralized logging setup with:
//! - Colorful console output with structured formatting
//! - Daily-rolling file logging under the system temp directory
//! - Environment variable support (RUST_LOG, REWIND_LOG_FILE)

use eyre::Result;
use std::{env, fs, path::PathBuf, sync::Once};
use tracing::Level;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::LocalTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::env::{flag_enabled, REWIND_LOG_FILE};

/// Initialize logging for a Rewind component
///
/// This function sets up:
/// - Pretty console logging with timestamps, targets and source locations
/// - File logging with daily rotation unless `REWIND_LOG_FILE` disables it
/// - `RUST_LOG` filtering, defaulting to INFO
///
/// # Arguments
/// * `component_name` - Name of the component (e.g., "rewind-engine")
/// * `enable_file_logging` - Whether to enable file logging
///
/// # Examples
/// ```rust,no_run
/// use rewind_common::logging;
///
/// fn main() -> eyre::Result<()> {
///     logging::init_logging("rewind", true)?;
///     tracing::info!("time machine started");
///     Ok(())
/// }
/// ```
pub fn init_logging(component_name: &str, enable_file_logging: bool) -> Result<()> {
    let env_filter = default_filter("info")?;

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(LocalTime::rfc_3339())
        .with_ansi(true)
        .pretty();

    let enable_file_logging = enable_file_logging && flag_enabled(REWIND_LOG_FILE, true);

    if enable_file_logging {
        let log_dir = create_log_directory(component_name)?;

        let file_appender = rolling::daily(&log_dir, format!("{component_name}.log"));
        let (non_blocking_appender, guard) = non_blocking(file_appender);

        // The worker must outlive every log call of the process.
        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_timer(LocalTime::rfc_3339())
            .with_ansi(false)
            .with_writer(non_blocking_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer.with_filter(filter_for_console()))
            .with(file_layer)
            .try_init()
            .map_err(|e| eyre::eyre!("Failed to initialize tracing subscriber: {e}"))?;

        tracing::info!(
            component = component_name,
            log_dir = %log_dir.display(),
            "Logging initialized with console and file output"
        );
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()
            .map_err(|e| eyre::eyre!("Failed to initialize tracing subscriber: {e}"))?;

        tracing::info!(component = component_name, "Logging initialized with console output only");
    }

    Ok(())
}

fn default_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| eyre::eyre!("Failed to create environment filter: {e}"))
}

/// Create log directory in system temp folder
fn create_log_directory(component_name: &str) -> Result<PathBuf> {
    let log_dir = env::temp_dir().join("rewind-logs").join(component_name);
    fs::create_dir_all(&log_dir)?;
    Ok(log_dir)
}

/// Console output hides HTTP client chatter from the RPC transport
fn filter_for_console() -> EnvFilter {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Initialize simple logging (console only, compact formatting)
///
/// # Arguments
/// * `level` - The default log level to use
pub fn init_simple_logging(level: Level) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter(level.as_str())?)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to initialize simple logging: {e}"))?;

    Ok(())
}

static TEST_LOGGING_INIT: Once = Once::new();

/// Safe logging initialization for tests - can be called multiple times
///
/// Console-only, INFO by default unless `default_level` or `RUST_LOG` says otherwise.
///
/// # Usage
/// ```rust
/// use rewind_common::logging;
///
/// logging::ensure_test_logging(None);
/// tracing::info!("logging is ready");
/// ```
pub fn ensure_test_logging(default_level: Option<Level>) {
    TEST_LOGGING_INIT.call_once(|| {
        // A subscriber installed elsewhere is fine for tests.
        let _ = init_simple_logging(default_level.unwrap_or(Level::INFO));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, warn};

    #[test]
    fn test_logging_functions_work() {
        ensure_test_logging(None);

        info!("Test info message");
        warn!("Test warning message");
        debug!("Test debug message");
    }

    #[test]
    fn test_log_directory_creation() {
        let log_dir = create_log_directory("test-component").unwrap();
        assert!(log_dir.exists());
        assert!(log_dir.to_string_lossy().contains("rewind-logs"));
        assert!(log_dir.to_string_lossy().contains("test-component"));
    }

    #[test]
    fn test_repeated_initialization_does_not_panic() {
        ensure_test_logging(None);

        // Either call may fail because a subscriber is already installed.
        let _ = init_logging("test-rewind-1", false);
        let _ = init_logging("test-rewind-2", false);

        info!("Test logging after init attempts");
    }
}
