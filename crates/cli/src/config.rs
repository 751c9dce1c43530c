//! Runtime configuration.
//!
//! One JSON file, every field optional. Values are checked once at load time;
//! the service never starts with an invalid configuration.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use orchestrator::{EvaluationConfig, ExecutorConfig, PublicationConfig, StakeRefreshConfig};
use routing::scoring::DEFAULT_USAGE_TIME_CONSTANT;
use routing::{RateLimitConfig, SwitchboardError};
use worker_client::WorkerEndpoint;

/// Used when no path is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "switchboard.json";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set.
    pub filter: String,
    /// OTLP gRPC endpoint. Spans are exported only when set.
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: "info".into(),
            otlp_endpoint: None,
            service_name: "switchboard".into(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub listen_addr: String,
    /// Directory for persisted score, usage, and weight state.
    pub state_dir: PathBuf,
    /// JSON array of evaluation questions.
    pub questions_path: PathBuf,
    pub workers: Vec<WorkerEndpoint>,
    /// Caller stake listing. Without it every identified caller gets the no-stake budget.
    pub caller_stake_url: Option<String>,
    /// Delegated stake per worker. Without it every trust score is zero.
    pub worker_trust_url: Option<String>,
    /// Where published weights are pushed.
    pub weight_sink_url: Option<String>,
    /// Key presented on evaluation calls to workers whose endpoint has no key.
    pub evaluation_api_key: Option<String>,
    pub usage_time_constant_secs: u64,
    pub connect_timeout_secs: u64,
    pub rate_limit: RateLimitConfig,
    pub executor: ExecutorConfig,
    pub evaluation: EvaluationConfig,
    pub publication: PublicationConfig,
    pub stake_refresh: StakeRefreshConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            state_dir: PathBuf::from("state"),
            questions_path: PathBuf::from("questions.json"),
            workers: Vec::new(),
            caller_stake_url: None,
            worker_trust_url: None,
            weight_sink_url: None,
            evaluation_api_key: None,
            usage_time_constant_secs: DEFAULT_USAGE_TIME_CONSTANT.as_secs(),
            connect_timeout_secs: 10,
            rate_limit: RateLimitConfig::default(),
            executor: ExecutorConfig::default(),
            evaluation: EvaluationConfig::default(),
            publication: PublicationConfig::default(),
            stake_refresh: StakeRefreshConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

fn invalid(message: impl Into<String>) -> SwitchboardError {
    SwitchboardError::Configuration {
        message: message.into(),
    }
}

impl SwitchboardConfig {
    /// Reads, parses, and validates the file at `path`.
    ///
    /// # Errors
    ///
    /// [`SwitchboardError::Configuration`] if the file cannot be read or
    /// parsed, or if [`validate`](Self::validate) rejects it.
    pub fn load(path: &Path) -> Result<Self, SwitchboardError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read '{}': {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| invalid(format!("cannot parse '{}': {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the service cannot run with.
    ///
    /// # Errors
    ///
    /// [`SwitchboardError::Configuration`] naming the first offending field.
    pub fn validate(&self) -> Result<(), SwitchboardError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| invalid(format!("listen_addr '{}': {e}", self.listen_addr)))?;

        let rl = &self.rate_limit;
        for (name, value) in [
            ("rate_limit.system_rpm_capacity", rl.system_rpm_capacity),
            ("rate_limit.anonymous_rpm", rl.anonymous_rpm),
            ("rate_limit.no_stake_rpm", rl.no_stake_rpm),
        ] {
            if value == 0 {
                return Err(invalid(format!("{name} must be positive")));
            }
        }
        for (name, value) in [
            ("rate_limit.window_secs", rl.window_secs),
            ("evaluation.interval_secs", self.evaluation.interval_secs),
            ("evaluation.call_timeout_secs", self.evaluation.call_timeout_secs),
            ("publication.interval_secs", self.publication.interval_secs),
            ("stake_refresh.interval_secs", self.stake_refresh.interval_secs),
            ("usage_time_constant_secs", self.usage_time_constant_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(format!("{name} must be positive")));
            }
        }
        if self.evaluation.window_size == 0 {
            return Err(invalid("evaluation.window_size must be positive"));
        }
        let workflow_timeout = self.executor.workflow_timeout_secs;
        if !(workflow_timeout.is_finite() && workflow_timeout > 0.0) {
            return Err(invalid("executor.workflow_timeout_secs must be positive"));
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.base_url.trim().is_empty() {
                return Err(invalid(format!("worker '{}' has an empty base_url", worker.identity)));
            }
            if !seen.insert(&worker.identity) {
                return Err(invalid(format!("worker '{}' is listed twice", worker.identity)));
            }
        }
        for (name, url) in [
            ("caller_stake_url", &self.caller_stake_url),
            ("worker_trust_url", &self.worker_trust_url),
            ("weight_sink_url", &self.weight_sink_url),
        ] {
            if url.as_deref().is_some_and(|u| u.trim().is_empty()) {
                return Err(invalid(format!("{name} must not be empty when set")));
            }
        }
        Ok(())
    }

    pub fn usage_time_constant(&self) -> Duration {
        Duration::from_secs(self.usage_time_constant_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
