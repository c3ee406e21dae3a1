use roomlink_core::{ReconnectPolicy, SessionConfig};
use secrecy::SecretString;
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
    pub server_url: String,
    pub api_key: String,
    pub api_secret: SecretString,
    pub room_name: String,
    pub participant_identity: String,
    pub participant_name: String,
    pub heartbeat_interval: Duration,
    /// Three missed heartbeats' worth of silence.
    pub idle_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// `0` retries forever.
    pub max_reconnect_attempts: u32,
    pub token_ttl: Duration,
    pub connect_timeout: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let server_url = string_var("ROOM_SERVER_URL", Some("ws://localhost:7880"))?;
        if !(server_url.starts_with("ws://") || server_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "ROOM_SERVER_URL".to_string(),
                format!("'{server_url}' must start with ws:// or wss://"),
            ));
        }
        let server_url = server_url.trim_end_matches('/').to_string();

        let api_key = string_var("ROOM_API_KEY", None)?;
        let api_secret = SecretString::from(string_var("ROOM_API_SECRET", None)?);

        let room_name = string_var("ROOM_NAME", Some("test-room"))?;
        let participant_identity = string_var("PARTICIPANT_IDENTITY", Some("local-agent"))?;
        let participant_name = string_var("PARTICIPANT_NAME", Some(&participant_identity))?;

        let heartbeat_interval = Duration::from_secs(positive_var("HEARTBEAT_INTERVAL_SECS", 30)?);
        let idle_timeout = heartbeat_interval.checked_mul(3).ok_or_else(|| {
            ConfigError::InvalidValue(
                "HEARTBEAT_INTERVAL_SECS".to_string(),
                "too large".to_string(),
            )
        })?;
        let reconnect_base_delay =
            Duration::from_secs(positive_var("RECONNECT_BASE_DELAY_SECS", 5)?);
        let reconnect_max_delay =
            Duration::from_secs(positive_var("RECONNECT_MAX_DELAY_SECS", 30)?);
        if reconnect_max_delay < reconnect_base_delay {
            return Err(ConfigError::InvalidValue(
                "RECONNECT_MAX_DELAY_SECS".to_string(),
                "must not be smaller than RECONNECT_BASE_DELAY_SECS".to_string(),
            ));
        }
        let max_reconnect_attempts = number_var::<u32>("MAX_RECONNECT_ATTEMPTS", 10)?;
        let token_ttl_secs = positive_var("TOKEN_TTL_HOURS", 6)?
            .checked_mul(60 * 60)
            .ok_or_else(|| {
                ConfigError::InvalidValue("TOKEN_TTL_HOURS".to_string(), "too large".to_string())
            })?;
        let token_ttl = Duration::from_secs(token_ttl_secs);
        let connect_timeout = Duration::from_secs(positive_var("CONNECT_TIMEOUT_SECS", 10)?);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            server_url,
            api_key,
            api_secret,
            room_name,
            participant_identity,
            participant_name,
            heartbeat_interval,
            idle_timeout,
            reconnect_base_delay,
            reconnect_max_delay,
            max_reconnect_attempts,
            token_ttl,
            connect_timeout,
            log_level,
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            max_attempts: self.max_reconnect_attempts,
            jitter: true,
        }
    }

    /// The session parameters derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        let mut session = SessionConfig::new(
            self.server_url.clone(),
            self.room_name.clone(),
            self.participant_identity.clone(),
        );
        session.token_ttl = self.token_ttl;
        session.connect_timeout = self.connect_timeout;
        session.heartbeat_interval = self.heartbeat_interval;
        session.idle_timeout = self.idle_timeout;
        session.reconnect = self.reconnect_policy();
        session
    }
}

fn string_var(name: &str, default: Option<&str>) -> Result<String, ConfigError> {
    let value = match (std::env::var(name), default) {
        (Ok(value), _) => value,
        (Err(_), Some(default)) => default.to_string(),
        (Err(_), None) => return Err(ConfigError::MissingVar(name.to_string())),
    };
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must not be empty".to_string(),
        ));
    }
    Ok(value)
}

fn number_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}

fn positive_var(name: &str, default: u64) -> Result<u64, ConfigError> {
    let value = number_var::<u64>(name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::env;

    const VARS: [&str; 13] = [
        "ROOM_SERVER_URL",
        "ROOM_API_KEY",
        "ROOM_API_SECRET",
        "ROOM_NAME",
        "PARTICIPANT_IDENTITY",
        "PARTICIPANT_NAME",
        "HEARTBEAT_INTERVAL_SECS",
        "RECONNECT_BASE_DELAY_SECS",
        "RECONNECT_MAX_DELAY_SECS",
        "MAX_RECONNECT_ATTEMPTS",
        "TOKEN_TTL_HOURS",
        "CONNECT_TIMEOUT_SECS",
        "RUST_LOG",
    ];

    fn clear_env_vars() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    fn set_minimal_env() {
        unsafe {
            env::set_var("ROOM_API_KEY", "devkey");
            env::set_var("ROOM_API_SECRET", "devsecret");
        }
    }

    fn expect_invalid(var_name: &str) {
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, var_name),
            other => panic!("Expected InvalidValue for {var_name}, got {other:?}"),
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_defaults() {
        clear_env_vars();
        set_minimal_env();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.server_url, "ws://localhost:7880");
        assert_eq!(config.api_key, "devkey");
        assert_eq!(config.api_secret.expose_secret(), "devsecret");
        assert_eq!(config.room_name, "test-room");
        assert_eq!(config.participant_identity, "local-agent");
        assert_eq!(config.participant_name, "local-agent");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_base_delay, Duration::from_secs(5));
        assert_eq!(config.reconnect_max_delay, Duration::from_secs(30));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.token_ttl, Duration::from_secs(6 * 3600));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("ROOM_SERVER_URL", "wss://rooms.example.com/");
            env::set_var("ROOM_NAME", "standup");
            env::set_var("PARTICIPANT_IDENTITY", "bot-7");
            env::set_var("PARTICIPANT_NAME", "Standup Bot");
            env::set_var("HEARTBEAT_INTERVAL_SECS", "15");
            env::set_var("RECONNECT_BASE_DELAY_SECS", "2");
            env::set_var("RECONNECT_MAX_DELAY_SECS", "60");
            env::set_var("MAX_RECONNECT_ATTEMPTS", "0");
            env::set_var("TOKEN_TTL_HOURS", "1");
            env::set_var("CONNECT_TIMEOUT_SECS", "3");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.server_url, "wss://rooms.example.com");
        assert_eq!(config.room_name, "standup");
        assert_eq!(config.participant_identity, "bot-7");
        assert_eq!(config.participant_name, "Standup Bot");
        assert_eq!(config.max_reconnect_attempts, 0);
        assert_eq!(config.token_ttl, Duration::from_secs(3600));
        assert_eq!(config.log_level, Level::DEBUG);

        let session = config.session_config();
        assert_eq!(session.endpoint, "wss://rooms.example.com");
        assert_eq!(session.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(session.idle_timeout, Duration::from_secs(45));
        assert_eq!(session.connect_timeout, Duration::from_secs(3));
        assert_eq!(session.reconnect.base_delay, Duration::from_secs(2));
        assert_eq!(session.reconnect.max_delay, Duration::from_secs(60));
        assert_eq!(session.reconnect.max_attempts, 0);
        assert!(session.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_config_missing_secret() {
        clear_env_vars();
        unsafe {
            env::set_var("ROOM_API_KEY", "devkey");
        }

        match Config::from_env().unwrap_err() {
            ConfigError::MissingVar(var) => assert_eq!(var, "ROOM_API_SECRET"),
            other => panic!("Expected MissingVar, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_config_empty_values_rejected() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("ROOM_API_SECRET", "   ");
        }
        expect_invalid("ROOM_API_SECRET");

        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("ROOM_NAME", "");
        }
        expect_invalid("ROOM_NAME");
    }

    #[test]
    #[serial]
    fn test_config_invalid_server_url() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("ROOM_SERVER_URL", "http://localhost:7880");
        }
        expect_invalid("ROOM_SERVER_URL");
    }

    #[test]
    #[serial]
    fn test_config_invalid_numbers() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("HEARTBEAT_INTERVAL_SECS", "0");
        }
        expect_invalid("HEARTBEAT_INTERVAL_SECS");

        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("MAX_RECONNECT_ATTEMPTS", "-1");
        }
        expect_invalid("MAX_RECONNECT_ATTEMPTS");

        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("RECONNECT_BASE_DELAY_SECS", "40");
        }
        expect_invalid("RECONNECT_MAX_DELAY_SECS");
    }

    #[test]
    #[serial]
    fn test_config_overflowing_durations_rejected() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("TOKEN_TTL_HOURS", "18446744073709551");
        }
        expect_invalid("TOKEN_TTL_HOURS");

        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("HEARTBEAT_INTERVAL_SECS", "9223372036854775807");
        }
        expect_invalid("HEARTBEAT_INTERVAL_SECS");
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }
        expect_invalid("RUST_LOG");
    }
}
