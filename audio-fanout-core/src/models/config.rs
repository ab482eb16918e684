use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::FanOutError;

/// Configuration for a fan-out adapter and its default pump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
    /// Bytes requested from the capture source per pump read (default: 3200,
    /// 100ms of 16kHz 16-bit mono).
    pub pump_read_size: usize,

    /// Sleep between pump polls while the source has no data (default: 10ms).
    pub pump_idle_interval_ms: u64,

    /// Name given to the pump worker thread.
    pub pump_thread_name: String,
}

impl FanOutConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.pump_read_size == 0 {
            return Err("pump read size must be positive".into());
        }
        if self.pump_idle_interval_ms == 0 {
            return Err("pump idle interval must be positive".into());
        }
        if self.pump_thread_name.trim().is_empty() {
            return Err("pump thread name must not be empty".into());
        }
        Ok(())
    }

    pub fn pump_idle_interval(&self) -> Duration {
        Duration::from_millis(self.pump_idle_interval_ms)
    }

    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, FanOutError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| FanOutError::ConfigurationFailed(format!("failed to parse config: {}", e)))?;
        config.validate().map_err(FanOutError::ConfigurationFailed)?;
        Ok(config)
    }
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            pump_read_size: 3200,
            pump_idle_interval_ms: 10,
            pump_thread_name: "audio-fanout-pump".into(),
        }
    }
}
