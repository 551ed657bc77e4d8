use std::env;

use rust_decimal::Decimal;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub order_expiry_secs: u64,
    pub commission_fee: Decimal,
    pub require_proof_of_delivery: bool,
    pub publish_retry_attempts: u32,
    pub publish_backoff_ms: u64,
    pub route_speed_mps: f64,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            order_expiry_secs: parse_or_default("ORDER_EXPIRY_SECS", 120)?,
            commission_fee: parse_or_default("COMMISSION_FEE", Decimal::new(500, 2))?,
            require_proof_of_delivery: parse_or_default("REQUIRE_PROOF_OF_DELIVERY", false)?,
            publish_retry_attempts: parse_or_default("PUBLISH_RETRY_ATTEMPTS", 4)?,
            publish_backoff_ms: parse_or_default("PUBLISH_BACKOFF_MS", 50)?,
            route_speed_mps: parse_or_default("ROUTE_SPEED_MPS", 8.0)?,
        })
    }
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
