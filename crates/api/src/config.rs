//! Environment-driven configuration.
//!
//! Every struct exposes `from_env()`; parsing goes through a lookup
//! function so the same code is testable without touching the process
//! environment.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use bulkedit_pipeline::retry::BackoffConfig;
use bulkedit_pipeline::PipelineConfig;

use crate::auth::jwt::JwtConfig;
use crate::ws::HeartbeatConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Read `var`, or `default` when it is unset.
fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Read a required, non-empty `var`.
fn required(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<String, ConfigError> {
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(var))
}

fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// HTTP server, identity and WebSocket settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    pub jwt: JwtConfig,
    /// Outbound queue bound per WebSocket connection (default: `64`).
    pub ws_queue_capacity: usize,
    pub heartbeat: HeartbeatConfig,
}

impl ServerConfig {
    /// | Env Var                      | Default                 |
    /// |------------------------------|-------------------------|
    /// | `HOST`                       | `0.0.0.0`               |
    /// | `PORT`                       | `3000`                  |
    /// | `CORS_ORIGINS`               | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`       | `30`                    |
    /// | `JWT_SECRET`                 | required                |
    /// | `WS_QUEUE_CAPACITY`          | `64`                    |
    /// | `WS_HEARTBEAT_INTERVAL_SECS` | `30`                    |
    /// | `WS_HEARTBEAT_TIMEOUT_SECS`  | `90`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let cors_origins: Vec<String> = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let ws_queue_capacity: usize = parse_or(&lookup, "WS_QUEUE_CAPACITY", 64)?;
        if ws_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                var: "WS_QUEUE_CAPACITY",
                reason: "must be at least 1".into(),
            });
        }

        let interval_secs: u64 = parse_or(&lookup, "WS_HEARTBEAT_INTERVAL_SECS", 30)?;
        let timeout_secs: u64 = parse_or(&lookup, "WS_HEARTBEAT_TIMEOUT_SECS", 90)?;
        if interval_secs == 0 || timeout_secs <= interval_secs {
            return Err(ConfigError::Invalid {
                var: "WS_HEARTBEAT_TIMEOUT_SECS",
                reason: "must exceed a non-zero heartbeat interval".into(),
            });
        }

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "PORT", 3000)?,
            cors_origins,
            request_timeout_secs: parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 30)?,
            jwt: JwtConfig {
                secret: required(&lookup, "JWT_SECRET")?,
            },
            ws_queue_capacity,
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(interval_secs),
                timeout: Duration::from_secs(timeout_secs),
            },
        })
    }
}

/// Postgres connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            url: required(&lookup, "DATABASE_URL")?,
            max_connections: parse_or(
                &lookup,
                "DB_MAX_CONNECTIONS",
                bulkedit_db::DEFAULT_MAX_CONNECTIONS,
            )?,
        })
    }
}

/// Downstream service, pipeline and dispatcher settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub downstream_base_url: String,
    pub downstream_token: String,
    /// Per-request timeout for downstream writes.
    pub downstream_timeout: Duration,
    pub rate_limit_per_minute: u32,
    pub pipeline: PipelineConfig,
    /// Claim-wait fallback when no enqueue notification arrives.
    pub poll_interval: Duration,
    /// Terminal jobs kept by the retention sweep.
    pub retention_count: i64,
    pub retention_interval: Duration,
}

impl EngineConfig {
    /// | Env Var                        | Default  |
    /// |--------------------------------|----------|
    /// | `DOWNSTREAM_BASE_URL`          | required |
    /// | `DOWNSTREAM_API_TOKEN`         | required |
    /// | `RATE_LIMIT_PER_MINUTE`        | `60`     |
    /// | `UPDATE_MAX_RETRIES`           | `3`      |
    /// | `UPDATE_INITIAL_BACKOFF_MS`    | `500`    |
    /// | `RATE_LIMIT_DEFAULT_WAIT_SECS` | `5`      |
    /// | `CHECKPOINT_EVERY_ROWS`        | `5`      |
    /// | `DISPATCH_POLL_INTERVAL_MS`    | `1000`   |
    /// | `JOB_RETENTION_COUNT`          | `100`    |
    /// | `JOB_RETENTION_INTERVAL_SECS`  | `3600`   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = PipelineConfig::default();

        let rate_limit_per_minute: u32 = parse_or(&lookup, "RATE_LIMIT_PER_MINUTE", 60)?;
        if !(bulkedit_pipeline::rate_limit::MIN_PER_MINUTE
            ..=bulkedit_pipeline::rate_limit::MAX_PER_MINUTE)
            .contains(&rate_limit_per_minute)
        {
            return Err(ConfigError::Invalid {
                var: "RATE_LIMIT_PER_MINUTE",
                reason: format!("{rate_limit_per_minute} is outside 10..=10000"),
            });
        }

        let checkpoint_every: u32 = parse_or(&lookup, "CHECKPOINT_EVERY_ROWS", defaults.checkpoint_every)?;
        if checkpoint_every == 0 {
            return Err(ConfigError::Invalid {
                var: "CHECKPOINT_EVERY_ROWS",
                reason: "must be at least 1".into(),
            });
        }

        let backoff = BackoffConfig {
            initial_delay: Duration::from_millis(parse_or(&lookup, "UPDATE_INITIAL_BACKOFF_MS", 500)?),
            ..defaults.backoff.clone()
        };

        let pipeline = PipelineConfig {
            max_retries: parse_or(&lookup, "UPDATE_MAX_RETRIES", defaults.max_retries)?,
            backoff,
            default_rate_limit_wait: Duration::from_secs(parse_or(
                &lookup,
                "RATE_LIMIT_DEFAULT_WAIT_SECS",
                defaults.default_rate_limit_wait.as_secs(),
            )?),
            checkpoint_every,
            ..defaults
        };

        Ok(Self {
            downstream_base_url: required(&lookup, "DOWNSTREAM_BASE_URL")?,
            downstream_token: required(&lookup, "DOWNSTREAM_API_TOKEN")?,
            downstream_timeout: Duration::from_secs(30),
            rate_limit_per_minute,
            pipeline,
            poll_interval: Duration::from_millis(parse_or(&lookup, "DISPATCH_POLL_INTERVAL_MS", 1000)?),
            retention_count: parse_or(&lookup, "JOB_RETENTION_COUNT", 100)?,
            retention_interval: Duration::from_secs(parse_or(&lookup, "JOB_RETENTION_INTERVAL_SECS", 3600)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn server_defaults_apply() {
        let config = ServerConfig::from_lookup(env(&[("JWT_SECRET", "s3cret")])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.cors_origins, vec!["http://localhost:5173"]);
        assert_eq!(config.ws_queue_capacity, 64);
        assert_eq!(config.heartbeat.interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat.timeout, Duration::from_secs(90));
    }

    #[test]
    fn missing_jwt_secret_is_reported() {
        assert_matches!(
            ServerConfig::from_lookup(env(&[])),
            Err(ConfigError::Missing("JWT_SECRET"))
        );
    }

    #[test]
    fn malformed_port_is_invalid() {
        assert_matches!(
            ServerConfig::from_lookup(env(&[("JWT_SECRET", "s"), ("PORT", "http")])),
            Err(ConfigError::Invalid { var: "PORT", .. })
        );
    }

    #[test]
    fn heartbeat_timeout_must_exceed_interval() {
        let result = ServerConfig::from_lookup(env(&[
            ("JWT_SECRET", "s"),
            ("WS_HEARTBEAT_INTERVAL_SECS", "30"),
            ("WS_HEARTBEAT_TIMEOUT_SECS", "30"),
        ]));
        assert_matches!(result, Err(ConfigError::Invalid { .. }));
    }

    #[test]
    fn engine_reads_pipeline_tunables() {
        let config = EngineConfig::from_lookup(env(&[
            ("DOWNSTREAM_BASE_URL", "https://tasks.example.com/api"),
            ("DOWNSTREAM_API_TOKEN", "tok"),
            ("RATE_LIMIT_PER_MINUTE", "120"),
            ("UPDATE_MAX_RETRIES", "5"),
            ("CHECKPOINT_EVERY_ROWS", "10"),
        ]))
        .unwrap();

        assert_eq!(config.rate_limit_per_minute, 120);
        assert_eq!(config.pipeline.max_retries, 5);
        assert_eq!(config.pipeline.checkpoint_every, 10);
        assert_eq!(config.pipeline.backoff.initial_delay, Duration::from_millis(500));
        assert_eq!(config.retention_count, 100);
    }

    #[test]
    fn rate_limit_outside_range_is_rejected() {
        for rpm in ["9", "10001"] {
            let result = EngineConfig::from_lookup(env(&[
                ("DOWNSTREAM_BASE_URL", "https://tasks.example.com"),
                ("DOWNSTREAM_API_TOKEN", "tok"),
                ("RATE_LIMIT_PER_MINUTE", rpm),
            ]));
            assert_matches!(result, Err(ConfigError::Invalid { var: "RATE_LIMIT_PER_MINUTE", .. }));
        }
    }

    #[test]
    fn database_url_is_required() {
        assert_matches!(
            DatabaseConfig::from_lookup(env(&[])),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
        let config = DatabaseConfig::from_lookup(env(&[("DATABASE_URL", "postgres://x")])).unwrap();
        assert_eq!(config.max_connections, 20);
    }
}
