use std::time::Duration;

use crate::endpoint::{parse_endpoints, Endpoint};
use crate::error::ConfigError;
use crate::subscription::StartPosition;

/// Subscriber configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Candidate broker endpoints, in connection order (`RNAME`).
    pub endpoints: Vec<Endpoint>,
    /// Channel to consume (`TOPIC_NAME`).
    pub channel_name: String,
    pub start_position: StartPosition,
    /// 0 quiet, 1 rate summaries, 2 adds sequence ids, 3 adds full events.
    pub log_level: u8,
    /// Events per rate report.
    pub report_count: u64,
    pub username: String,
    pub password: Option<String>,
    /// Prompt on the terminal when no password is configured.
    pub prompt_for_password: bool,
    /// Broker-side selector expression.
    pub selector: Option<String>,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    /// 0 retries forever.
    pub reconnect_attempts: u32,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let rname = var("RNAME").ok_or(ConfigError::Missing("RNAME"))?;
        let channel_name = var("TOPIC_NAME").ok_or(ConfigError::Missing("TOPIC_NAME"))?;

        let start_position = match var("START_EID") {
            Some(raw) => raw.parse::<StartPosition>().map_err(|reason| ConfigError::Invalid {
                name: "START_EID",
                value: raw.clone(),
                reason,
            })?,
            None => StartPosition::Latest,
        };

        let log_level: u8 = parse_or("LOG_LEVEL", var("LOG_LEVEL"), 1)?;
        if log_level > 3 {
            return Err(invalid("LOG_LEVEL", log_level, "must be between 0 and 3"));
        }

        let report_count: u64 = parse_or("REPORT_COUNT", var("REPORT_COUNT"), 1000)?;
        if report_count == 0 {
            return Err(invalid("REPORT_COUNT", report_count, "must be greater than 0"));
        }

        let prompt_for_password = var("PASS_PASSWORD_IN_CONSOLE")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            endpoints: parse_endpoints(&rname)?,
            channel_name,
            start_position,
            log_level,
            report_count,
            username: var("UM_USERNAME").unwrap_or_else(|| "subscriber".to_string()),
            password: var("UM_PASSWORD"),
            prompt_for_password,
            selector: var("SELECTOR"),
            connect_timeout: Duration::from_secs(parse_or(
                "CONNECT_TIMEOUT_SECS",
                var("CONNECT_TIMEOUT_SECS"),
                30,
            )?),
            reconnect_delay: Duration::from_millis(parse_or(
                "RECONNECT_DELAY_MS",
                var("RECONNECT_DELAY_MS"),
                2000,
            )?),
            reconnect_attempts: parse_or("RECONNECT_ATTEMPTS", var("RECONNECT_ATTEMPTS"), 0)?,
        })
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn invalid(name: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
