//! Run settings (ambient config layer).
//!
//! Env vars with sane defaults, `.ok()`/`unwrap_or` instead of hard
//! failures, extended with a `from_toml` path since a multi-product
//! harvester run is naturally config-file-driven, plus an explicit
//! `validate()` since a malformed budget or lane count should fail the run
//! before any network call is made, not mid-round.

use crate::fetch::{Lane, LaneConfig};
use crate::round::ConvergenceConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read config file {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    pub database_dir: String,
    pub run_id_prefix: String,
    pub convergence: ConvergenceConfig,
    pub lane_concurrency: HashMap<String, usize>,
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
    pub events_ndjson_path: Option<String>,
    pub metrics_port: Option<u16>,
    pub api_port: u16,
    pub denied_hosts: Vec<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        RunSettings {
            database_dir: "./data".to_string(),
            run_id_prefix: "run".to_string(),
            convergence: ConvergenceConfig::default(),
            lane_concurrency: HashMap::from([
                ("search".to_string(), 4),
                ("fetch".to_string(), 6),
                ("parse".to_string(), 4),
                ("llm".to_string(), 2),
            ]),
            fetch_timeout_secs: 20,
            user_agent: "convergence-engine/0.1".to_string(),
            events_ndjson_path: None,
            metrics_port: Some(9090),
            api_port: 8080,
            denied_hosts: Vec::new(),
        }
    }
}

impl RunSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let mut settings = RunSettings::default();

        if let Ok(v) = std::env::var("CE_DATABASE_DIR") {
            settings.database_dir = v;
        }
        if let Ok(v) = std::env::var("CE_RUN_ID_PREFIX") {
            settings.run_id_prefix = v;
        }
        if let Ok(v) = std::env::var("CE_FETCH_TIMEOUT_SECS") {
            settings.fetch_timeout_secs = v.parse().unwrap_or(settings.fetch_timeout_secs);
        }
        if let Ok(v) = std::env::var("CE_USER_AGENT") {
            settings.user_agent = v;
        }
        if let Ok(v) = std::env::var("CE_EVENTS_NDJSON_PATH") {
            settings.events_ndjson_path = Some(v);
        }
        if let Ok(v) = std::env::var("CE_METRICS_PORT") {
            settings.metrics_port = v.parse().ok();
        }
        if let Ok(v) = std::env::var("CE_API_PORT") {
            settings.api_port = v.parse().unwrap_or(settings.api_port);
        }
        if let Ok(v) = std::env::var("CE_MAX_ROUNDS") {
            settings.convergence.max_rounds = v.parse().unwrap_or(settings.convergence.max_rounds);
        }
        if let Ok(v) = std::env::var("CE_DENIED_HOSTS") {
            settings.denied_hosts = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let settings: RunSettings = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.convergence.max_rounds == 0 {
            return Err(ConfigError::Invalid("convergence.max_rounds must be >= 1".into()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid("fetch_timeout_secs must be >= 1".into()));
        }
        if self.lane_concurrency.values().any(|&c| c == 0) {
            return Err(ConfigError::Invalid("every lane concurrency must be >= 1".into()));
        }
        if self.api_port == 0 {
            return Err(ConfigError::Invalid("api_port must be nonzero".into()));
        }
        Ok(())
    }

    /// Build the [`LaneConfig`] map FS needs from the flattened settings.
    pub fn lane_configs(&self) -> HashMap<Lane, LaneConfig> {
        let lookup = |name: &str, default: usize| -> usize { self.lane_concurrency.get(name).copied().unwrap_or(default) };
        HashMap::from([
            (Lane::Search, LaneConfig { concurrency: lookup("search", 4), token_budget: u64::MAX }),
            (Lane::Fetch, LaneConfig { concurrency: lookup("fetch", 6), token_budget: u64::MAX }),
            (Lane::Parse, LaneConfig { concurrency: lookup("parse", 4), token_budget: u64::MAX }),
            (Lane::Llm, LaneConfig { concurrency: lookup("llm", 2), token_budget: self.convergence.per_run_token_cap }),
        ])
    }
}
