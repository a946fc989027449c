use std::env;
use std::time::Duration;

use conductor_client::{
    ConductorClientConfig, DEFAULT_BASE_URL, DEFAULT_REQUEST_ATTEMPTS, DEFAULT_TIMEOUT_MS,
};
use thiserror::Error;

use crate::cli::GlobalArgs;

pub const DEFAULT_RUNS_POLL_MS: u64 = 3_000;
pub const DEFAULT_STATS_POLL_MS: u64 = 5_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub base_url: String,
    pub session_token: Option<String>,
    pub request_timeout_ms: u64,
    pub request_attempts: usize,
    pub runs_poll_interval: Duration,
    pub stats_poll_interval: Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid CONDUCTOR_REQUEST_TIMEOUT_MS: {0}")]
    InvalidRequestTimeoutMs(String),
    #[error("invalid CONDUCTOR_REQUEST_ATTEMPTS: {0}")]
    InvalidRequestAttempts(String),
    #[error("invalid CONDUCTOR_RUNS_POLL_MS: {0}")]
    InvalidRunsPollMs(String),
    #[error("invalid CONDUCTOR_STATS_POLL_MS: {0}")]
    InvalidStatsPollMs(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup("CONDUCTOR_BASE_URL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let session_token = lookup("CONDUCTOR_SESSION_TOKEN")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let request_timeout_ms = parse_positive(
            lookup("CONDUCTOR_REQUEST_TIMEOUT_MS"),
            DEFAULT_TIMEOUT_MS,
        )
        .map_err(ConfigError::InvalidRequestTimeoutMs)?;
        let request_attempts = parse_positive(
            lookup("CONDUCTOR_REQUEST_ATTEMPTS"),
            DEFAULT_REQUEST_ATTEMPTS as u64,
        )
        .and_then(|value| usize::try_from(value).map_err(|error| error.to_string()))
        .map_err(ConfigError::InvalidRequestAttempts)?;
        let runs_poll_ms = parse_positive(lookup("CONDUCTOR_RUNS_POLL_MS"), DEFAULT_RUNS_POLL_MS)
            .map_err(ConfigError::InvalidRunsPollMs)?;
        let stats_poll_ms =
            parse_positive(lookup("CONDUCTOR_STATS_POLL_MS"), DEFAULT_STATS_POLL_MS)
                .map_err(ConfigError::InvalidStatsPollMs)?;

        Ok(Self {
            base_url,
            session_token,
            request_timeout_ms,
            request_attempts,
            runs_poll_interval: Duration::from_millis(runs_poll_ms),
            stats_poll_interval: Duration::from_millis(stats_poll_ms),
        })
    }

    /// Command-line flags win over environment values.
    #[must_use]
    pub fn with_overrides(mut self, args: &GlobalArgs) -> Self {
        if let Some(base_url) = args
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            self.base_url = base_url.to_string();
        }
        if let Some(token) = args.token.clone() {
            self.session_token = Some(token);
        }
        if let Some(timeout_ms) = args.timeout_ms.filter(|value| *value > 0) {
            self.request_timeout_ms = timeout_ms;
        }
        self
    }

    #[must_use]
    pub fn client_config(&self) -> ConductorClientConfig {
        ConductorClientConfig {
            timeout_ms: self.request_timeout_ms,
            request_attempts: self.request_attempts,
            ..ConductorClientConfig::new(self.base_url.clone())
        }
        .with_session_token(self.session_token.clone())
    }
}

fn parse_positive(raw: Option<String>, default: u64) -> Result<u64, String> {
    let Some(raw) = raw.map(|value| value.trim().to_string()) else {
        return Ok(default);
    };
    if raw.is_empty() {
        return Ok(default);
    }
    match raw.parse::<u64>() {
        Ok(0) => Err("must be greater than zero".to_string()),
        Ok(value) => Ok(value),
        Err(error) => Err(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(values: &HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        |key| values.get(key).map(ToString::to_string)
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let values = HashMap::new();
        let config = Config::from_lookup(lookup(&values)).expect("config");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.session_token, None);
        assert_eq!(config.request_timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.request_attempts, DEFAULT_REQUEST_ATTEMPTS);
        assert_eq!(config.runs_poll_interval, Duration::from_millis(3_000));
        assert_eq!(config.stats_poll_interval, Duration::from_millis(5_000));
    }

    #[test]
    fn env_values_are_parsed_and_trimmed() {
        let values = HashMap::from([
            ("CONDUCTOR_BASE_URL", " http://127.0.0.1:9000/v1/ "),
            ("CONDUCTOR_SESSION_TOKEN", " tok-1 "),
            ("CONDUCTOR_REQUEST_TIMEOUT_MS", "2500"),
            ("CONDUCTOR_REQUEST_ATTEMPTS", "3"),
            ("CONDUCTOR_RUNS_POLL_MS", "1000"),
        ]);
        let config = Config::from_lookup(lookup(&values)).expect("config");
        assert_eq!(config.base_url, "http://127.0.0.1:9000/v1/");
        assert_eq!(config.session_token.as_deref(), Some("tok-1"));
        assert_eq!(config.request_timeout_ms, 2_500);
        assert_eq!(config.request_attempts, 3);
        assert_eq!(config.runs_poll_interval, Duration::from_millis(1_000));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let values = HashMap::from([("CONDUCTOR_RUNS_POLL_MS", "soon")]);
        let error = Config::from_lookup(lookup(&values)).expect_err("invalid poll interval");
        assert!(matches!(error, ConfigError::InvalidRunsPollMs(_)));
        assert!(error.to_string().starts_with("invalid CONDUCTOR_RUNS_POLL_MS"));

        let values = HashMap::from([("CONDUCTOR_REQUEST_ATTEMPTS", "0")]);
        let error = Config::from_lookup(lookup(&values)).expect_err("zero attempts");
        assert_eq!(
            error,
            ConfigError::InvalidRequestAttempts("must be greater than zero".to_string())
        );
    }

    #[test]
    fn flags_override_env() {
        let values = HashMap::from([("CONDUCTOR_SESSION_TOKEN", "from-env")]);
        let config = Config::from_lookup(lookup(&values))
            .expect("config")
            .with_overrides(&GlobalArgs {
                base_url: Some("http://10.0.0.2:8745/v1".to_string()),
                token: Some("from-flag".to_string()),
                timeout_ms: Some(900),
            });
        assert_eq!(config.base_url, "http://10.0.0.2:8745/v1");
        assert_eq!(config.session_token.as_deref(), Some("from-flag"));
        assert_eq!(config.request_timeout_ms, 900);

        let client = config.client_config();
        assert_eq!(client.session_token.as_deref(), Some("from-flag"));
        assert_eq!(client.timeout_ms, 900);
    }
}
