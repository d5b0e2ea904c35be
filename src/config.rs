//! Core configuration
//!
//! Timing and backend settings for the call core. SIP settings live in
//! `sip::SipConfig`.

use std::time::Duration;

use thiserror::Error;

use crate::media::MixMode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Base URL of the record-storage backend
    pub api_url: String,

    /// Bearer token for the backend
    pub api_token: Option<String>,

    /// How long an outbound call may ring before it is abandoned
    pub ringing_timeout: Duration,

    /// Period of the reconciliation loop
    pub reconcile_interval: Duration,

    /// Recorder chunk period
    pub chunk_interval: Duration,

    pub mix_mode: MixMode,

    /// Explicit display name for the local party
    pub display_name: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000".to_string(),
            api_token: None,
            ringing_timeout: Duration::from_secs(35),
            reconcile_interval: Duration::from_secs(2),
            chunk_interval: Duration::from_millis(1000),
            mix_mode: MixMode::Mono,
            display_name: None,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            api_url: std::env::var("API_URL").unwrap_or(defaults.api_url),
            api_token: std::env::var("API_TOKEN").ok().filter(|t| !t.is_empty()),
            ringing_timeout: env_duration("CALL_RINGING_TIMEOUT_SECS", Duration::from_secs)?
                .unwrap_or(defaults.ringing_timeout),
            reconcile_interval: env_duration("CALL_RECONCILE_INTERVAL_SECS", Duration::from_secs)?
                .unwrap_or(defaults.reconcile_interval),
            chunk_interval: env_duration("RECORDING_CHUNK_INTERVAL_MS", Duration::from_millis)?
                .unwrap_or(defaults.chunk_interval),
            mix_mode: defaults.mix_mode,
            display_name: std::env::var("CALL_DISPLAY_NAME").ok(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.is_empty() {
            return Err(ConfigError::Invalid("API URL is required".to_string()));
        }
        if self.ringing_timeout.is_zero()
            || self.reconcile_interval.is_zero()
            || self.chunk_interval.is_zero()
        {
            return Err(ConfigError::Invalid("timer intervals must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn env_duration(
    name: &'static str,
    unit: fn(u64) -> Duration,
) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|value| Some(unit(value)))
            .map_err(|_| ConfigError::Invalid(format!("{} must be a whole number, got {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ringing_timeout, Duration::from_secs(35));
        assert_eq!(config.reconcile_interval, Duration::from_secs(2));
        assert_eq!(config.chunk_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let config = CoreConfig {
            chunk_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
