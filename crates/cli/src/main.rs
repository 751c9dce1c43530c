//! Switchboard entry point.
//!
//! This binary is the composition root for the entire system. Responsibilities:
//!
//! 1. **Parse configuration**: load the JSON file named by the first argument
//!    (default `switchboard.json`) and validate it.
//! 2. **Wire observability**: configure `tracing-subscriber` with an `EnvFilter`,
//!    a JSON or pretty formatter, and, when an endpoint is configured, an
//!    OpenTelemetry OTLP exporter. All spans and events emitted by every crate
//!    in the workspace flow through this subscriber.
//! 3. **Construct infrastructure**: HTTP adapters, file store, and question
//!    bank, injected into the orchestrator's gateway and background jobs.
//! 4. **Run** the listener and jobs until Ctrl-C, then drain them.

mod app;
mod config;
mod telemetry;

use std::path::PathBuf;

use crate::config::{SwitchboardConfig, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = SwitchboardConfig::load(&path)?;

    let telemetry = telemetry::init(&config.telemetry)?;
    tracing::info!(config = %path.display(), "Configuration loaded");

    let result = app::run(config).await;
    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "Switchboard failed");
    }
    telemetry.shutdown();
    result
}
