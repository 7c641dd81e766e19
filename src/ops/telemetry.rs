use anyhow::{Context, Result};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

use crate::config::TelemetryConfig;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Build the filter for `level`, falling back to `info` when it does not parse.
pub fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize JSON logging with a reloadable level.
///
/// Fails when a global subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<LogHandle> {
    let (filter_layer, handle) = reload::Layer::new(level_filter(&config.log_level));
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// Swap the active filter, e.g. `"meshcast=debug"`.
pub fn set_level(handle: &LogHandle, level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level {level:?}"))?;
    handle
        .modify(|current| *current = filter)
        .context("failed to reload log filter")?;
    tracing::info!(level, "log level changed");
    Ok(())
}
