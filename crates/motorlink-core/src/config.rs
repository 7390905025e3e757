//! Device link and polling configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::keys;

/// Configuration error.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Poll period `{0}` must be greater than zero")]
    ZeroPeriod(&'static str),
    #[error("Error threshold must be at least 1")]
    ZeroThreshold,
    #[error("Parameter set `{0}` is empty")]
    EmptyParameterSet(&'static str),
    #[error("Combined request rate {rate:.2}/s exceeds the configured ceiling {max:.2}/s")]
    RateTooHigh { rate: f64, max: f64 },
    #[error("Parameter `{0}` clashes with a control message name")]
    ReservedKey(String),
}

/// Configuration of one device link and the loops polling it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Device address.
    pub address: String,
    /// Device port.
    pub port: u16,
    /// Low-priority poll period (P1) in milliseconds.
    pub low_priority_period_ms: u64,
    /// High-priority poll period (P2) in milliseconds.
    pub high_priority_period_ms: u64,
    /// Parameters requested by the low-priority poller.
    pub low_priority_params: Vec<String>,
    /// Parameters requested by the high-priority poller.
    pub high_priority_params: Vec<String>,
    /// Network adapter used for link-layer bring-up.
    pub adapter: String,
    /// Consecutive driver errors before the link is declared lost.
    pub error_threshold: u32,
    /// Highest combined request rate the device sustains, if known.
    pub max_request_rate: Option<f64>,
    /// Per-observer telemetry buffer, in events.
    pub broadcast_capacity: usize,
    /// Per-observer outbound queue, in messages.
    pub outbound_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: "169.254.0.1".to_string(),
            port: 18385,
            low_priority_period_ms: 300,
            high_priority_period_ms: 80,
            low_priority_params: vec![
                keys::VOLTAGE_LOGIC.to_string(),
                "motor_temperature".to_string(),
                "status_word".to_string(),
            ],
            high_priority_params: vec![
                keys::ACTUAL_POSITION.to_string(),
                keys::ACTUAL_VELOCITY.to_string(),
                keys::PHASE_CURRENT.to_string(),
            ],
            adapter: "eth0".to_string(),
            error_threshold: 5,
            max_request_rate: None,
            broadcast_capacity: 256,
            outbound_capacity: 64,
        }
    }
}

impl LinkConfig {
    /// Low-priority poll period.
    #[must_use]
    pub const fn low_priority_period(&self) -> Duration {
        Duration::from_millis(self.low_priority_period_ms)
    }

    /// High-priority poll period.
    #[must_use]
    pub const fn high_priority_period(&self) -> Duration {
        Duration::from_millis(self.high_priority_period_ms)
    }

    /// Key identifying the physical device this config points at.
    #[must_use]
    pub fn device_key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Steady-state requests per second of both pollers together.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn request_rate(&self) -> f64 {
        1000.0 / self.low_priority_period_ms as f64 + 1000.0 / self.high_priority_period_ms as f64
    }

    /// Check the configuration for values the supervisor cannot run with.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low_priority_period_ms == 0 {
            return Err(ConfigError::ZeroPeriod("low_priority_period_ms"));
        }
        if self.high_priority_period_ms == 0 {
            return Err(ConfigError::ZeroPeriod("high_priority_period_ms"));
        }
        if self.error_threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        if self.low_priority_params.is_empty() {
            return Err(ConfigError::EmptyParameterSet("low_priority_params"));
        }
        if self.high_priority_params.is_empty() {
            return Err(ConfigError::EmptyParameterSet("high_priority_params"));
        }
        if let Some(key) = self
            .low_priority_params
            .iter()
            .chain(&self.high_priority_params)
            .find(|key| keys::is_reserved(key))
        {
            return Err(ConfigError::ReservedKey(key.clone()));
        }
        if let Some(max) = self.max_request_rate {
            let rate = self.request_rate();
            if rate > max {
                return Err(ConfigError::RateTooHigh { rate, max });
            }
        }
        Ok(())
    }
}
