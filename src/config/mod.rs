//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString to keep
//! credentials out of logs.

use std::time::Duration;

use secrecy::SecretString;

use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::telemetry::TelemetryConfig;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    /// Reported as `service.name`. Lets several workers share a collector.
    pub service_name: String,
    pub log_level: String,
    /// Extra lease time on top of each execution timeout.
    pub lease_margin: Duration,
    /// Clear the lease holder when recording a failure.
    pub release_on_failure: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = EngineConfig::default();
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "compensator".to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            lease_margin: match std::env::var("COMPENSATION_LEASE_MARGIN_SECS").ok() {
                Some(raw) => Duration::from_secs(parse_var("COMPENSATION_LEASE_MARGIN_SECS", &raw)?),
                None => defaults.lease_margin,
            },
            release_on_failure: match std::env::var("COMPENSATION_RELEASE_ON_FAILURE").ok() {
                Some(raw) => parse_bool("COMPENSATION_RELEASE_ON_FAILURE", &raw)?,
                None => defaults.release_on_failure,
            },
        })
    }

    /// Telemetry settings derived from this configuration.
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: self.service_name.clone(),
            log_level: self.log_level.clone(),
        }
    }

    /// Engine settings derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            lease_margin: self.lease_margin,
            release_on_failure: self.release_on_failure,
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parse_var(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={raw:?} is not a number: {e}")))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{name}={raw:?} is not a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleans_accept_common_spellings() {
        assert!(parse_bool("X", "TRUE").unwrap());
        assert!(parse_bool("X", " 1 ").unwrap());
        assert!(!parse_bool("X", "off").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn numbers_must_be_unsigned() {
        assert_eq!(parse_var("X", "12").unwrap(), 12);
        assert!(parse_var("X", "-3").is_err());
    }
}
