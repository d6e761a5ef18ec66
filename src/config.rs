//! Metering session configuration
//!
//! Loaded from TOML or built in code. Every value is checked by
//! [`MeterConfig::validate`] before the first packet is metered.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MeterError, Result};

/// Configuration for a metering session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Idle timeout (seconds). A flow expires once this long has passed
    /// since its last packet. Zero expires at every evaluation.
    pub idle_timeout: u64,

    /// Active timeout (seconds). A flow expires once this long has passed
    /// since its first packet, whatever its activity. Zero disables it.
    pub active_timeout: u64,

    /// Compute packet size / inter-arrival statistics and TCP flag counters
    pub statistics: bool,

    /// Expire TCP flows on FIN in both directions or RST in either
    pub tcp_teardown: bool,

    /// Periodic sweep cadence on the packet clock (milliseconds, 0 = every packet)
    pub sweep_interval_ms: u64,

    /// Depth of the record channel between the meter and the consumer
    pub channel_capacity: usize,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            idle_timeout: 120,       // 2 minutes
            active_timeout: 1800,    // 30 minutes
            statistics: false,
            tcp_teardown: false,
            sweep_interval_ms: 1000, // 1 second of capture time
            channel_capacity: 1024,
        }
    }
}

impl MeterConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: MeterConfig = toml::from_str(&content)
            .map_err(|e| MeterError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the meter cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(MeterError::Config(
                "channel_capacity must be greater than zero".into(),
            ));
        }
        if self.idle_timeout.checked_mul(1000).is_none() {
            return Err(MeterError::Config(format!(
                "idle_timeout {} is out of range",
                self.idle_timeout
            )));
        }
        if self.active_timeout.checked_mul(1000).is_none() {
            return Err(MeterError::Config(format!(
                "active_timeout {} is out of range",
                self.active_timeout
            )));
        }
        Ok(())
    }

    /// Idle timeout in milliseconds
    pub fn idle_timeout_ms(&self) -> u64 {
        self.idle_timeout.saturating_mul(1000)
    }

    /// Active timeout in milliseconds
    pub fn active_timeout_ms(&self) -> u64 {
        self.active_timeout.saturating_mul(1000)
    }
}
