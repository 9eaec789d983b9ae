use calllink_core::SessionConfig;
use secrecy::{ExposeSecret, SecretString};
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    /// Root of the call REST routes, e.g. `http://localhost:8000/api/calls`.
    pub api_url: String,
    pub signaling_url: String,
    pub api_token: Option<SecretString>,
    pub create_timeout: Duration,
    pub end_timeout: Duration,
    pub ring_timeout: Duration,
    pub turn_timeout: Duration,
    pub max_remote_errors: u32,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_url = std::env::var("CALL_API_URL")
            .map_err(|_| ConfigError::MissingVar("CALL_API_URL".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let signaling_url = match std::env::var("SIGNALING_URL") {
            Ok(url) => url,
            Err(_) => signaling_url_for(&api_url)?,
        };

        let api_token = std::env::var("API_TOKEN")
            .ok()
            .filter(|token| !token.is_empty())
            .map(SecretString::from);

        let defaults = SessionConfig::default();
        let create_timeout = secs_var("CREATE_CALL_TIMEOUT_SECS", defaults.create_timeout)?;
        let end_timeout = secs_var("END_CALL_TIMEOUT_SECS", defaults.end_timeout)?;
        let ring_timeout = secs_var("RING_TIMEOUT_SECS", defaults.ring_timeout)?;
        let turn_timeout = secs_var("TURN_TIMEOUT_SECS", defaults.turn_timeout)?;
        let max_remote_errors = parse_var("MAX_REMOTE_ERRORS", defaults.max_remote_errors)?;
        if max_remote_errors == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_REMOTE_ERRORS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let reconnect_attempts = parse_var("RECONNECT_ATTEMPTS", defaults.reconnect_attempts)?;
        let reconnect_delay = Duration::from_millis(parse_var(
            "RECONNECT_DELAY_MS",
            defaults.reconnect_delay.as_millis() as u64,
        )?);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            api_url,
            signaling_url,
            api_token,
            create_timeout,
            end_timeout,
            ring_timeout,
            turn_timeout,
            max_remote_errors,
            reconnect_attempts,
            reconnect_delay,
            log_level,
        })
    }

    /// A copy of the bearer token, for the REST client and the transport.
    pub fn token(&self) -> Option<SecretString> {
        self.api_token
            .as_ref()
            .map(|token| SecretString::from(token.expose_secret().to_owned()))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            create_timeout: self.create_timeout,
            end_timeout: self.end_timeout,
            ring_timeout: self.ring_timeout,
            turn_timeout: self.turn_timeout,
            max_remote_errors: self.max_remote_errors,
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: self.reconnect_delay,
            ..SessionConfig::new(self.signaling_url.clone())
        }
    }
}

/// `http(s)://host/api/calls` → `ws(s)://host/api/calls/ws`.
fn signaling_url_for(api_url: &str) -> Result<String, ConfigError> {
    let ws = if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ConfigError::InvalidValue(
            "CALL_API_URL".to_string(),
            format!("'{api_url}' is not an http(s) URL"),
        ));
    };
    Ok(format!("{ws}/ws"))
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = parse_var(name, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be at least 1 second".to_string(),
        ));
    }
    Ok(Duration::from_secs(secs))
}
