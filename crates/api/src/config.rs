//! Application configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Hard ceiling on a message history page
pub const MAX_MESSAGE_PAGE_LIMIT: u32 = 100;

/// Minimum accepted length for the token signing secret
const MIN_SECRET_LEN: usize = 32;

/// Which store backs the rooms, messages and polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            _ => Err(ConfigError::Invalid("STORE_BACKEND")),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub cors_allowed_origins: Vec<String>,

    // Storage
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,

    // Real-time
    pub ws_send_buffer: usize,
    pub poll_sweep_interval_secs: u64,
    pub message_page_limit: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let store_backend = match env::var("STORE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => StoreBackend::Postgres,
        };

        let database_url = env::var("DATABASE_URL").ok().filter(|u| !u.is_empty());
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::WeakSecret(
                "JWT_SECRET must be at least 32 characters",
            ));
        }

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),

            store_backend,
            database_url,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10),

            jwt_secret,

            ws_send_buffer: parse_or("WS_SEND_BUFFER", 64usize).max(1),
            poll_sweep_interval_secs: parse_or("POLL_SWEEP_INTERVAL_SECS", 60u64).max(1),
            message_page_limit: parse_or("MESSAGE_PAGE_LIMIT", 50u32)
                .clamp(1, MAX_MESSAGE_PAGE_LIMIT),
        })
    }

    pub fn poll_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.poll_sweep_interval_secs)
    }

    /// Configuration for tests and local runs against the in-memory store
    pub fn for_memory(jwt_secret: &str) -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            cors_allowed_origins: Vec::new(),
            store_backend: StoreBackend::Memory,
            database_url: None,
            database_max_connections: 1,
            jwt_secret: jwt_secret.to_string(),
            ws_send_buffer: 64,
            poll_sweep_interval_secs: 60,
            message_page_limit: 50,
        }
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "STORE_BACKEND",
        "DATABASE_URL",
        "JWT_SECRET",
        "WS_SEND_BUFFER",
        "MESSAGE_PAGE_LIMIT",
        "CORS_ALLOWED_ORIGINS",
        "POLL_SWEEP_INTERVAL_SECS",
    ];

    fn cleanup_config() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    fn set_secret() {
        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );
    }

    #[test]
    #[serial]
    fn test_postgres_requires_database_url() {
        cleanup_config();
        set_secret();

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("DATABASE_URL"))));

        env::set_var("DATABASE_URL", "postgres://test");
        let config = Config::from_env().unwrap();
        assert_eq!(config.store_backend, StoreBackend::Postgres);
        assert_eq!(config.database_max_connections, 10);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_memory_backend_defaults() {
        cleanup_config();
        set_secret();
        env::set_var("STORE_BACKEND", "memory");

        let config = Config::from_env().unwrap();
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert!(config.database_url.is_none());
        assert_eq!(config.ws_send_buffer, 64);
        assert_eq!(config.message_page_limit, 50);
        assert_eq!(config.poll_sweep_interval(), Duration::from_secs(60));
        assert!(config.cors_allowed_origins.is_empty());

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_weak_secret_rejected() {
        cleanup_config();
        env::set_var("STORE_BACKEND", "memory");
        env::set_var("JWT_SECRET", "short");

        assert!(matches!(Config::from_env(), Err(ConfigError::WeakSecret(_))));

        env::remove_var("JWT_SECRET");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("JWT_SECRET"))
        ));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_overrides_and_clamping() {
        cleanup_config();
        set_secret();
        env::set_var("STORE_BACKEND", "memory");
        env::set_var("MESSAGE_PAGE_LIMIT", "500");
        env::set_var("WS_SEND_BUFFER", "not-a-number");
        env::set_var("CORS_ALLOWED_ORIGINS", "https://a.example, https://b.example,");

        let config = Config::from_env().unwrap();
        assert_eq!(config.message_page_limit, MAX_MESSAGE_PAGE_LIMIT);
        assert_eq!(config.ws_send_buffer, 64);
        assert_eq!(
            config.cors_allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );

        env::set_var("STORE_BACKEND", "redis");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("STORE_BACKEND"))
        ));

        cleanup_config();
    }
}
