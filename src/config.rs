//! Runtime configuration.
//!
//! Every knob has a default matching the deployed behaviour of the device
//! fleet; a YAML file only needs to name what it changes:
//!
//! ```yaml
//! protocol:
//!   ack_timeout_ms: 5000
//!   send_attempts: 3
//! control:
//!   tick_interval_secs: 600
//! bridge:
//!   topic_prefix: "signal/tc/"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SignalError};

/// Top-level configuration for the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub protocol: ProtocolConfig,
    pub control: ControlConfig,
    pub bridge: BridgeConfig,
}

impl Config {
    /// Parse a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml_ng::from_str(text)
            .map_err(|e| SignalError::Config { details: format!("invalid YAML: {e}") })
    }

    /// Load a YAML file from disk.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SignalError::Config {
            details: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_yaml(&text)
    }
}

/// Socket lifecycle knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on a single TCP connect attempt.
    pub connect_timeout_ms: u64,
    /// How often the health check scans for dead or missing connections.
    pub health_check_interval_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { connect_timeout_ms: 3_000, health_check_interval_secs: 60 }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Send/retry budget for the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Wait for a command acknowledgement (0F80/0F81, NAK).
    pub ack_timeout_ms: u64,
    /// Wait for a parameter readback (5FC0, merged 5FC4+5FC5). Devices take
    /// noticeably longer to assemble these than to ack.
    pub readback_timeout_ms: u64,
    /// Attempts per logical send before giving up.
    pub send_attempts: u32,
    /// Delay between attempts.
    pub retry_pacing_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            readback_timeout_ms: 16_000,
            send_attempts: 3,
            retry_pacing_ms: 100,
        }
    }
}

impl ProtocolConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn readback_timeout(&self) -> Duration {
        Duration::from_millis(self.readback_timeout_ms)
    }

    pub fn retry_pacing(&self) -> Duration {
        Duration::from_millis(self.retry_pacing_ms)
    }
}

/// Adaptive-control scheduler knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Period between threshold evaluation sweeps.
    pub tick_interval_secs: u64,
    /// Whole-handshake attempts per device before the time-of-day fallback.
    pub handshake_attempts: u32,
    /// Delay between consecutive devices in one trigger pass.
    pub device_pacing_ms: u64,
    /// Delay between consecutive handshake steps on one device.
    pub step_pacing_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 600,
            handshake_attempts: 3,
            device_pacing_ms: 100,
            step_pacing_ms: 100,
        }
    }
}

impl ControlConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn device_pacing(&self) -> Duration {
        Duration::from_millis(self.device_pacing_ms)
    }

    pub fn step_pacing(&self) -> Duration {
        Duration::from_millis(self.step_pacing_ms)
    }
}

/// Pub/sub bridge knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Outbound events for device X go to `<topic_prefix>X`.
    pub topic_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { topic_prefix: "signal/tc/".to_string() }
    }
}
