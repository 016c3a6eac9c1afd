//! API server configuration

use std::env;
use std::fmt::Display;
use std::str::FromStr;

/// Runtime configuration loaded from the environment
#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub razorpay_webhook_secret: String,
    pub bind_address: String,
    /// Bearer token for `/api/admin/*`; the admin routes are hidden when unset
    pub admin_api_token: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub require_order_match: bool,
    pub run_migrations: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
            razorpay_webhook_secret: required("RAZORPAY_WEBHOOK_SECRET")?,
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            admin_api_token: optional("ADMIN_API_TOKEN"),
            alert_webhook_url: optional("ALERT_WEBHOOK_URL"),
            require_order_match: parse_bool_or("REQUIRE_ORDER_MATCH", false)?,
            run_migrations: parse_bool_or("RUN_MIGRATIONS", true)?,
        })
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_max_connections", &self.database_max_connections)
            .field("bind_address", &self.bind_address)
            .field("admin_api_token", &self.admin_api_token.as_ref().map(|_| "[REDACTED]"))
            .field("alert_webhook_url", &self.alert_webhook_url.is_some())
            .field("require_order_match", &self.require_order_match)
            .field("run_migrations", &self.run_migrations)
            .finish_non_exhaustive()
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match optional(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        None => {
            tracing::debug!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

fn parse_bool_or(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            key,
            message: format!("expected a boolean, got {:?}", v),
        }),
    }
}
