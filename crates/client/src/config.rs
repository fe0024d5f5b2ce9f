use std::str::FromStr;
use std::time::Duration;

use crate::reconnect::ReconnectConfig;

/// Default interval between simulated progress events.
const DEFAULT_SIMULATION_TICK_MS: u64 = 500;

/// Client configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the audit HTTP API (default: `http://localhost:3000`).
    pub api_url: String,
    /// Event channel endpoint (default: `ws://localhost:3000/ws`).
    pub ws_url: String,
    /// Retry policy for the event channel.
    pub reconnect: ReconnectConfig,
    /// Interval between simulated progress events when the channel is
    /// unavailable.
    pub simulation_tick: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000".into(),
            ws_url: "ws://localhost:3000/ws".into(),
            reconnect: ReconnectConfig::default(),
            simulation_tick: Duration::from_millis(DEFAULT_SIMULATION_TICK_MS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                            | Default                  |
    /// |------------------------------------|--------------------------|
    /// | `SITESCOPE_API_URL`                | `http://localhost:3000`  |
    /// | `SITESCOPE_WS_URL`                 | `ws://localhost:3000/ws` |
    /// | `SITESCOPE_AUTO_RECONNECT`         | `true`                   |
    /// | `SITESCOPE_MAX_RECONNECT_ATTEMPTS` | `5`                      |
    /// | `SITESCOPE_RECONNECT_DELAY_MS`     | `3000`                   |
    /// | `SITESCOPE_BACKOFF_MULTIPLIER`     | `1.0`                    |
    /// | `SITESCOPE_MAX_RECONNECT_DELAY_MS` | `30000`                  |
    /// | `SITESCOPE_CONNECT_TIMEOUT_MS`     | reconnect delay          |
    /// | `SITESCOPE_SIMULATION_TICK_MS`     | `500`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let reconnect_defaults = defaults.reconnect;

        let api_url = lookup("SITESCOPE_API_URL").unwrap_or(defaults.api_url);
        let ws_url = lookup("SITESCOPE_WS_URL").unwrap_or(defaults.ws_url);

        let auto_reconnect = parse_or(
            &lookup,
            "SITESCOPE_AUTO_RECONNECT",
            reconnect_defaults.auto_reconnect,
        )?;
        let max_attempts = parse_or(
            &lookup,
            "SITESCOPE_MAX_RECONNECT_ATTEMPTS",
            reconnect_defaults.max_attempts,
        )?;
        let reconnect_delay_ms = parse_or(
            &lookup,
            "SITESCOPE_RECONNECT_DELAY_MS",
            reconnect_defaults.initial_delay.as_millis() as u64,
        )?;
        let multiplier: f64 = parse_or(
            &lookup,
            "SITESCOPE_BACKOFF_MULTIPLIER",
            reconnect_defaults.multiplier,
        )?;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                var: "SITESCOPE_BACKOFF_MULTIPLIER",
                value: multiplier.to_string(),
            });
        }
        let max_delay_ms = parse_or(
            &lookup,
            "SITESCOPE_MAX_RECONNECT_DELAY_MS",
            reconnect_defaults.max_delay.as_millis() as u64,
        )?;
        let connect_timeout_ms = parse_or(
            &lookup,
            "SITESCOPE_CONNECT_TIMEOUT_MS",
            reconnect_delay_ms.max(1),
        )?;
        if connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                var: "SITESCOPE_CONNECT_TIMEOUT_MS",
                value: connect_timeout_ms.to_string(),
            });
        }
        let tick_ms = parse_or(
            &lookup,
            "SITESCOPE_SIMULATION_TICK_MS",
            DEFAULT_SIMULATION_TICK_MS,
        )?;

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            ws_url,
            reconnect: ReconnectConfig {
                auto_reconnect,
                max_attempts,
                initial_delay: Duration::from_millis(reconnect_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms.max(reconnect_delay_ms)),
                multiplier,
                connect_timeout: Duration::from_millis(connect_timeout_ms),
            },
            simulation_tick: Duration::from_millis(tick_ms),
        })
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

/// Errors raised while loading [`ClientConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held a value of the wrong type or range.
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}
