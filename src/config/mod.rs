//! Configuration loading for the backfill service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `BACKFILL_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "BACKFILL_";
const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `BACKFILL_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    pub profile: String,
    pub api_bind_addr: String,
    pub log_level: String,
    pub log_format: String,
    /// Absent means jobs and downtime records live in memory only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_executor_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_executor_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_gateway_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_gateway_token: Option<String>,
    pub github_api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
    /// Events path such as `repos/acme/app` or `orgs/acme`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_events_scope: Option<String>,
    pub engine: EngineConfig,
    pub downtime: DowntimeConfig,
    pub retry: RetryConfig,
}

/// Backfill engine knobs (`BACKFILL_ENGINE_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct EngineConfig {
    pub max_concurrent_jobs: usize,
    pub processor_tick_seconds: u64,
    pub clock_skew_seconds: i64,
    pub partial_completion_quota: f64,
    pub default_batch_size: u32,
    pub default_delay_ms: u64,
    pub default_timeout_ms: u64,
    pub max_recorded_events: usize,
}

/// Downtime detection knobs (`BACKFILL_DOWNTIME_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DowntimeConfig {
    pub health_check_seconds: u64,
    pub grace_period_seconds: u64,
    pub auto_backfill: bool,
    pub system_user_id: String,
}

/// Default retry policy for new jobs (`BACKFILL_RETRY_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: None,
            db_max_connections: 10,
            db_acquire_timeout_ms: 5_000,
            operator_tokens: Vec::new(),
            workflow_executor_url: None,
            workflow_executor_token: None,
            connector_gateway_url: None,
            connector_gateway_token: None,
            github_api_base: default_github_api_base(),
            github_token: None,
            github_events_scope: None,
            engine: EngineConfig::default(),
            downtime: DowntimeConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            processor_tick_seconds: 10,
            clock_skew_seconds: 60,
            partial_completion_quota: 0.5,
            default_batch_size: 100,
            default_delay_ms: 1_000,
            default_timeout_ms: 30_000,
            max_recorded_events: 1_000,
        }
    }
}

impl Default for DowntimeConfig {
    fn default() -> Self {
        Self {
            health_check_seconds: 30,
            grace_period_seconds: 300,
            auto_backfill: true,
            system_user_id: "system".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    fn is_dev_profile(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec![REDACTED.to_string()];
        }
        for secret in [
            &mut config.workflow_executor_token,
            &mut config.connector_gateway_token,
            &mut config.github_token,
            &mut config.database_url,
        ] {
            if secret.is_some() {
                *secret = Some(REDACTED.to_string());
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }
        if !self.is_dev_profile() && self.workflow_executor_url.is_none() {
            return Err(ConfigError::MissingWorkflowExecutorUrl);
        }

        self.engine.validate()?;
        self.retry.validate()?;

        if let Err(source) = self.bind_addr() {
            return Err(ConfigError::InvalidBindAddr {
                value: self.api_bind_addr.clone(),
                source,
            });
        }
        Ok(())
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.max_concurrent_jobs) {
            return Err(ConfigError::InvalidMaxConcurrentJobs {
                value: self.max_concurrent_jobs,
            });
        }
        if !(1..=300).contains(&self.processor_tick_seconds) {
            return Err(ConfigError::InvalidProcessorTick {
                value: self.processor_tick_seconds,
            });
        }
        if !(0.0..=1.0).contains(&self.partial_completion_quota) {
            return Err(ConfigError::InvalidCompletionQuota {
                value: self.partial_completion_quota,
            });
        }
        if self.default_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        Ok(())
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier {
                value: self.backoff_multiplier,
            });
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidRetryBounds {
                initial: self.initial_delay_ms,
                max: self.max_delay_ms,
            });
        }
        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid value '{value}' for BACKFILL_{key}")]
    InvalidValue { key: String, value: String },
    #[error(
        "no operator tokens configured; set BACKFILL_OPERATOR_TOKEN or BACKFILL_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("workflow executor URL is missing; set BACKFILL_WORKFLOW_EXECUTOR_URL")]
    MissingWorkflowExecutorUrl,
    #[error("max concurrent jobs must be between 1 and 100, got {value}")]
    InvalidMaxConcurrentJobs { value: usize },
    #[error("job processor tick must be between 1 and 300 seconds, got {value}")]
    InvalidProcessorTick { value: u64 },
    #[error("partial completion quota must be between 0.0 and 1.0, got {value}")]
    InvalidCompletionQuota { value: f64 },
    #[error("default batch size must be at least 1")]
    InvalidBatchSize,
    #[error("retry backoff multiplier must be at least 1.0, got {value}")]
    InvalidBackoffMultiplier { value: f64 },
    #[error("retry initial delay ({initial} ms) cannot exceed max delay ({max} ms)")]
    InvalidRetryBounds { initial: u64, max: u64 },
}

/// Loads configuration using layered `.env` files and `BACKFILL_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

/// Prefix-stripped key/value pairs collected from all layers.
struct Layered(BTreeMap<String, String>);

impl Layered {
    fn string(&mut self, key: &str) -> Option<String> {
        self.0
            .remove(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T: FromStr>(&mut self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.string(key) {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }

    fn list(&mut self, key: &str) -> Option<Vec<String>> {
        self.string(key).map(|value| {
            value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let config = self.load_unvalidated()?;
        config.validate()?;
        Ok(config)
    }

    /// Layers `.env` files and the process environment without validating.
    pub fn load_unvalidated(&self) -> Result<AppConfig, ConfigError> {
        let (mut values, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                values.insert(stripped.to_string(), value);
            }
        }
        let mut layered = Layered(values);

        let defaults = AppConfig::default();
        let engine_defaults = EngineConfig::default();
        let downtime_defaults = DowntimeConfig::default();
        let retry_defaults = RetryConfig::default();

        let operator_tokens = layered
            .list("OPERATOR_TOKENS")
            .or_else(|| layered.string("OPERATOR_TOKEN").map(|token| vec![token]))
            .unwrap_or_default();

        let engine = EngineConfig {
            max_concurrent_jobs: layered.parsed(
                "ENGINE_MAX_CONCURRENT_JOBS",
                engine_defaults.max_concurrent_jobs,
            )?,
            processor_tick_seconds: layered.parsed(
                "ENGINE_PROCESSOR_TICK_SECONDS",
                engine_defaults.processor_tick_seconds,
            )?,
            clock_skew_seconds: layered
                .parsed("ENGINE_CLOCK_SKEW_SECONDS", engine_defaults.clock_skew_seconds)?,
            partial_completion_quota: layered.parsed(
                "ENGINE_PARTIAL_COMPLETION_QUOTA",
                engine_defaults.partial_completion_quota,
            )?,
            default_batch_size: layered
                .parsed("ENGINE_DEFAULT_BATCH_SIZE", engine_defaults.default_batch_size)?,
            default_delay_ms: layered
                .parsed("ENGINE_DEFAULT_DELAY_MS", engine_defaults.default_delay_ms)?,
            default_timeout_ms: layered
                .parsed("ENGINE_DEFAULT_TIMEOUT_MS", engine_defaults.default_timeout_ms)?,
            max_recorded_events: layered.parsed(
                "ENGINE_MAX_RECORDED_EVENTS",
                engine_defaults.max_recorded_events,
            )?,
        };

        let downtime = DowntimeConfig {
            health_check_seconds: layered.parsed(
                "DOWNTIME_HEALTH_CHECK_SECONDS",
                downtime_defaults.health_check_seconds,
            )?,
            grace_period_seconds: layered.parsed(
                "DOWNTIME_GRACE_PERIOD_SECONDS",
                downtime_defaults.grace_period_seconds,
            )?,
            auto_backfill: layered
                .parsed("DOWNTIME_AUTO_BACKFILL", downtime_defaults.auto_backfill)?,
            system_user_id: layered
                .string("DOWNTIME_SYSTEM_USER_ID")
                .unwrap_or(downtime_defaults.system_user_id),
        };

        let retry = RetryConfig {
            max_retries: layered.parsed("RETRY_MAX_RETRIES", retry_defaults.max_retries)?,
            backoff_multiplier: layered
                .parsed("RETRY_BACKOFF_MULTIPLIER", retry_defaults.backoff_multiplier)?,
            initial_delay_ms: layered
                .parsed("RETRY_INITIAL_DELAY_MS", retry_defaults.initial_delay_ms)?,
            max_delay_ms: layered.parsed("RETRY_MAX_DELAY_MS", retry_defaults.max_delay_ms)?,
        };

        Ok(AppConfig {
            profile: layered.string("PROFILE").unwrap_or(profile_hint),
            api_bind_addr: layered
                .string("API_BIND_ADDR")
                .unwrap_or(defaults.api_bind_addr),
            log_level: layered.string("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: layered.string("LOG_FORMAT").unwrap_or(defaults.log_format),
            database_url: layered.string("DATABASE_URL"),
            db_max_connections: layered
                .parsed("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            db_acquire_timeout_ms: layered
                .parsed("DB_ACQUIRE_TIMEOUT_MS", defaults.db_acquire_timeout_ms)?,
            operator_tokens,
            workflow_executor_url: layered.string("WORKFLOW_EXECUTOR_URL"),
            workflow_executor_token: layered.string("WORKFLOW_EXECUTOR_TOKEN"),
            connector_gateway_url: layered.string("CONNECTOR_GATEWAY_URL"),
            connector_gateway_token: layered.string("CONNECTOR_GATEWAY_TOKEN"),
            github_api_base: layered
                .string("GITHUB_API_BASE")
                .unwrap_or(defaults.github_api_base),
            github_token: layered.string("GITHUB_TOKEN"),
            github_events_scope: layered.string("GITHUB_EVENTS_SCOPE"),
            engine,
            downtime,
            retry,
        })
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        AppConfig {
            operator_tokens: vec!["op".to_string()],
            ..AppConfig::default()
        }
    }

    #[test]
    fn defaults_validate_with_a_token() {
        assert!(valid().validate().is_ok());
        assert!(matches!(
            AppConfig::default().validate(),
            Err(ConfigError::MissingOperatorTokens)
        ));
    }

    #[test]
    fn engine_bounds_are_enforced() {
        let mut config = valid();
        config.engine.max_concurrent_jobs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMaxConcurrentJobs { value: 0 })
        ));

        let mut config = valid();
        config.engine.partial_completion_quota = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCompletionQuota { .. })
        ));

        let mut config = valid();
        config.engine.processor_tick_seconds = 301;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProcessorTick { value: 301 })
        ));
    }

    #[test]
    fn retry_bounds_are_enforced() {
        let mut config = valid();
        config.retry.initial_delay_ms = 90_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRetryBounds { .. })
        ));

        let mut config = valid();
        config.retry.backoff_multiplier = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBackoffMultiplier { .. })
        ));
    }

    #[test]
    fn executor_url_required_outside_dev_profiles() {
        let mut config = valid();
        config.profile = "production".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingWorkflowExecutorUrl)
        ));
        config.workflow_executor_url = Some("http://executor".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn redaction_hides_secrets() {
        let mut config = valid();
        config.github_token = Some("ghp_secret".to_string());
        config.workflow_executor_token = Some("exec_secret".to_string());
        config.database_url = Some("postgres://user:pw@db/backfill".to_string());

        let json = config.redacted_json().unwrap();
        assert!(!json.contains("ghp_secret"));
        assert!(!json.contains("exec_secret"));
        assert!(!json.contains("pw@db"));
        assert!(!json.contains("\"op\""));
        assert!(json.contains(REDACTED));
    }
}
