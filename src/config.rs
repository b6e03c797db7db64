//! Runtime configuration parsed from environment variables.
//!
//! Every knob has a default except the backend base URL. Unparseable numeric
//! values fall back to their defaults, matching how the rest of the stack
//! reads tuning variables. Interval knobs treat `0` as unparseable.

use std::time::Duration;

use crate::net::relay::{
    DEFAULT_HEARTBEAT, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_OUTBOUND_QUEUE_CAPACITY, DEFAULT_RECONNECT_BASE,
    DEFAULT_RECONNECT_MAX, RelayTuning,
};
use crate::net::types::Role;

pub const DEFAULT_ROSTER_PATH: &str = "/api/buses";
pub const DEFAULT_TOKEN_PATH: &str = "/api/relay/token";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {var}")]
    MissingVar { var: &'static str },
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("unknown role '{0}' (expected 'admin' or 'student')")]
    UnknownRole(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Backend origin, without trailing slash.
    pub api_base_url: String,
    /// Bearer token for REST calls, if the backend requires one.
    pub api_token: Option<String>,
    pub role: Role,
    pub roster_path: String,
    pub token_path: String,
    pub poll_interval: Duration,
    pub http_timeout: Duration,
    pub relay: RelayTuning,
}

impl RelayConfig {
    /// Defaults for everything but the base URL and role.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBaseUrl`] unless the URL is `http(s)://`.
    pub fn new(api_base_url: &str, role: Role) -> Result<Self, ConfigError> {
        Ok(Self {
            api_base_url: normalize_base_url(api_base_url)?,
            api_token: None,
            role,
            roster_path: DEFAULT_ROSTER_PATH.to_owned(),
            token_path: DEFAULT_TOKEN_PATH.to_owned(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            relay: RelayTuning::default(),
        })
    }

    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `BUSRELAY_API_BASE_URL`
    ///
    /// Optional:
    /// - `BUSRELAY_ROLE`: `admin` (default) or `student`
    /// - everything read by [`with_env_overrides`](Self::with_env_overrides)
    ///
    /// # Errors
    ///
    /// Fails when the base URL is missing or malformed, or the role is unknown.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("BUSRELAY_API_BASE_URL")
            .map_err(|_| ConfigError::MissingVar { var: "BUSRELAY_API_BASE_URL" })?;
        let role = match std::env::var("BUSRELAY_ROLE") {
            Ok(raw) => raw.parse::<Role>()?,
            Err(_) => Role::Admin,
        };
        Ok(Self::new(&base_url, role)?.with_env_overrides())
    }

    /// Overlay the optional environment knobs onto `self`.
    ///
    /// - `BUSRELAY_API_TOKEN`: bearer token for REST calls
    /// - `BUSRELAY_ROSTER_PATH`: default `/api/buses`
    /// - `BUSRELAY_TOKEN_PATH`: default `/api/relay/token`
    /// - `BUSRELAY_POLL_INTERVAL_SECS`: default 30
    /// - `BUSRELAY_HTTP_TIMEOUT_SECS`: default 10
    /// - `BUSRELAY_HEARTBEAT_SECS`: default 25
    /// - `BUSRELAY_RECONNECT_BASE_MS`: default 1000
    /// - `BUSRELAY_RECONNECT_MAX_MS`: default 30000
    /// - `BUSRELAY_RECONNECT_MAX_ATTEMPTS`: default 10
    /// - `BUSRELAY_OUTBOUND_QUEUE_CAPACITY`: default 50
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(token) = std::env::var("BUSRELAY_API_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
        {
            self.api_token = Some(token);
        }
        if let Ok(path) = std::env::var("BUSRELAY_ROSTER_PATH") {
            self.roster_path = path;
        }
        if let Ok(path) = std::env::var("BUSRELAY_TOKEN_PATH") {
            self.token_path = path;
        }
        self.poll_interval = env_secs("BUSRELAY_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS);
        self.http_timeout = env_secs("BUSRELAY_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS);
        self.relay = RelayTuning {
            heartbeat: env_secs("BUSRELAY_HEARTBEAT_SECS", DEFAULT_HEARTBEAT.as_secs()),
            reconnect_base: Duration::from_millis(env_parse(
                "BUSRELAY_RECONNECT_BASE_MS",
                duration_ms(DEFAULT_RECONNECT_BASE),
            )),
            reconnect_max: Duration::from_millis(env_parse(
                "BUSRELAY_RECONNECT_MAX_MS",
                duration_ms(DEFAULT_RECONNECT_MAX),
            )),
            max_reconnect_attempts: env_parse("BUSRELAY_RECONNECT_MAX_ATTEMPTS", DEFAULT_MAX_RECONNECT_ATTEMPTS),
            queue_capacity: env_parse("BUSRELAY_OUTBOUND_QUEUE_CAPACITY", DEFAULT_OUTBOUND_QUEUE_CAPACITY),
        };
        self
    }
}

fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.to_owned())
    } else {
        Err(ConfigError::InvalidBaseUrl(raw.to_owned()))
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Non-zero whole seconds; `0` falls back to `default` like any other bad value.
fn env_secs(key: &str, default: u64) -> Duration {
    match env_parse(key, default) {
        0 => Duration::from_secs(default),
        secs => Duration::from_secs(secs),
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
