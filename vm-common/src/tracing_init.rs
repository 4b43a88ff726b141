//! Tracing initialization for the snapshot tooling
//!
//! The core only emits `tracing` events and spans; whichever binary or test
//! harness embeds it decides where they go by calling one of these.

use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vm_core::error::{Result, VmError};

/// Output format selected through `RUST_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    Compact,
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            "pretty" | "" => Ok(LogFormat::Pretty),
            other => Err(VmError::Config(format!(
                "unknown RUST_LOG_FORMAT '{}' (expected json, compact or pretty)",
                other
            ))),
        }
    }
}

/// Initialize the tracing subscriber with environment-based configuration
///
/// Uses standard RUST_LOG environment variable for filtering:
/// - `RUST_LOG=debug` - Set global level
/// - `RUST_LOG=vm_snapshot=debug,vm_provider=info` - Set per-crate levels
///
/// Uses RUST_LOG_FORMAT for output format (optional):
/// - `json` - JSON formatted output
/// - `pretty` - Pretty formatted output (default)
/// - `compact` - Compact single-line output
pub fn init() -> Result<()> {
    init_with_defaults("info")
}

/// Initialize with a default filter if RUST_LOG is not set
pub fn init_with_defaults(default_filter: &str) -> Result<()> {
    let format = std::env::var("RUST_LOG_FORMAT")
        .ok()
        .map(|raw| raw.parse::<LogFormat>())
        .transpose()?
        .unwrap_or_default();

    init_with(format, default_filter)
}

/// Initialize with an explicit format
pub fn init_with(format: LogFormat, default_filter: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Json => registry.with(fmt::layer().with_ansi(false).json()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
    };

    result.map_err(|e| VmError::Config(format!("Failed to initialize tracing: {}", e)))?;
    tracing::debug!(?format, default_filter, "tracing initialized");
    Ok(())
}

/// Initialize for tests: debug level, captured by the test harness.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_for_testing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
