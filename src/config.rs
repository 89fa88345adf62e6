use std::env;

use crate::engine::dispatch::DispatchPolicy;
use crate::error::AppError;

const MAX_OFFER_TIMEOUT_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}, expected compact or json")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub event_buffer_size: usize,
    pub default_radius_km: f64,
    pub max_assignment_attempts: u32,
    pub offer_timeout_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: parse_or_default("LOG_FORMAT", LogFormat::Compact)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            default_radius_km: parse_or_default("DEFAULT_RADIUS_KM", 5.0)?,
            max_assignment_attempts: parse_or_default("MAX_ASSIGNMENT_ATTEMPTS", 3)?,
            offer_timeout_secs: parse_or_default("OFFER_TIMEOUT_SECS", 60)?,
            sweep_interval_ms: parse_or_default("SWEEP_INTERVAL_MS", 5000)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !(self.default_radius_km.is_finite() && self.default_radius_km > 0.0) {
            return Err(invalid("DEFAULT_RADIUS_KM", "must be > 0"));
        }
        if self.max_assignment_attempts == 0 {
            return Err(invalid("MAX_ASSIGNMENT_ATTEMPTS", "must be > 0"));
        }
        if self.offer_timeout_secs == 0 || self.offer_timeout_secs > MAX_OFFER_TIMEOUT_SECS {
            return Err(invalid("OFFER_TIMEOUT_SECS", "must be between 1 and 86400"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(invalid("SWEEP_INTERVAL_MS", "must be > 0"));
        }
        if self.event_buffer_size == 0 {
            return Err(invalid("EVENT_BUFFER_SIZE", "must be > 0"));
        }
        Ok(())
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            default_radius_km: self.default_radius_km,
            max_assignment_attempts: self.max_assignment_attempts,
            offer_timeout: chrono::Duration::seconds(
                self.offer_timeout_secs.min(MAX_OFFER_TIMEOUT_SECS) as i64,
            ),
        }
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms)
    }
}

fn invalid(key: &str, reason: &str) -> AppError {
    AppError::Internal(format!("invalid {key}: {reason}"))
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
