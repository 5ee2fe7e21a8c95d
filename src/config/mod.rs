use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod cors;
pub mod security;

pub use cors::create_cors_layer;
pub use security::security_headers;

const DEFAULT_ADMISSION_API_URL: &str = "http://localhost:3001";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key}='{value}' is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub db_max_connections: u32,
    pub db_lock_timeout: Duration,
    pub duplicate_scan_window: chrono::Duration,
    /// Multi-admission purchases made at or after this instant get
    /// individual tickets.
    pub individual_cutover: DateTime<Utc>,
    pub production: bool,
    pub cors_allowed_origins: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let database_url = vars
            .get("DATABASE_URL")
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let individual_cutover = match vars.get("INDIVIDUAL_TICKETS_CUTOVER") {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| invalid("INDIVIDUAL_TICKETS_CUTOVER", &raw, e))?,
            None => DateTime::<Utc>::MIN_UTC,
        };
        let window_secs: i64 = vars.parse("DUPLICATE_SCAN_WINDOW_SECS", 5)?;
        if window_secs < 0 {
            return Err(invalid(
                "DUPLICATE_SCAN_WINDOW_SECS",
                &window_secs.to_string(),
                "must not be negative",
            ));
        }

        Ok(Self {
            database_url,
            bind_addr: vars.parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3001)))?,
            db_max_connections: vars.parse("DB_MAX_CONNECTIONS", 5)?,
            db_lock_timeout: Duration::from_millis(vars.parse("DB_LOCK_TIMEOUT_MS", 3000)?),
            duplicate_scan_window: chrono::Duration::seconds(window_secs),
            individual_cutover,
            production: vars
                .get("RUST_ENV")
                .is_some_and(|v| v.eq_ignore_ascii_case("production")),
            cors_allowed_origins: vars.get("CORS_ALLOWED_ORIGINS"),
        })
    }
}

/// Door device settings for the `scanner` binary.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub api_url: String,
    pub scanner_id: String,
    pub local_window: Duration,
    pub max_retries: usize,
    pub request_timeout: Duration,
}

impl ScannerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        Ok(Self {
            api_url: vars
                .get("ADMISSION_API_URL")
                .unwrap_or_else(|| DEFAULT_ADMISSION_API_URL.to_string()),
            scanner_id: vars
                .get("SCANNER_ID")
                .ok_or(ConfigError::Missing("SCANNER_ID"))?,
            local_window: Duration::from_millis(vars.parse("SCAN_LOCAL_WINDOW_MS", 1500)?),
            max_retries: vars.parse("SCAN_MAX_RETRIES", 3)?,
            request_timeout: Duration::from_millis(vars.parse("SCAN_REQUEST_TIMEOUT_MS", 5000)?),
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Blank values count as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e| invalid(key, &raw, e)),
            None => Ok(default),
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
