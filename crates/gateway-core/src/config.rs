//! Process-state configuration (§6 "Process state") and load/validate
//! helpers, following the teacher's `state::Config`/`StreamingConfig` split
//! between static settings and validated sub-blocks.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::tuning::Mode;

/// NR2 (post-decode noise reduction) settings, patched via `UpdateConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nr2Config {
    pub enabled: bool,
    pub strength: f32,
    pub floor: f32,
    pub adapt_rate: f32,
}

impl Default for Nr2Config {
    fn default() -> Self {
        Self {
            enabled: false,
            strength: 0.5,
            floor: -20.0,
            adapt_rate: 0.1,
        }
    }
}

/// A single rig-daemon/rig-link configuration block, shared shape for
/// flrig/rigctl/serial/tci per §6.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RigConfig {
    pub enabled: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub baudrate: Option<u32>,
    pub vfo: Option<String>,
    pub sync_to_rig: bool,
    pub sync_from_rig: bool,
}

/// Selects which rig-control variant is currently active, per §6
/// `radioControlType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioControlType {
    None,
    Flrig,
    Rigctl,
    Serial,
    Tci,
}

impl Default for RadioControlType {
    fn default() -> Self {
        RadioControlType::None
    }
}

/// Bounded-channel / debounce configuration for the Fan-out Hub (§4.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutConfig {
    pub subscriber_channel_capacity: usize,
    pub on_demand_disconnect_debounce_ms: u64,
    pub connect_on_demand: bool,
    pub stay_connected: bool,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            subscriber_channel_capacity: crate::protocol_constants::SUBSCRIBER_CHANNEL_CAPACITY,
            on_demand_disconnect_debounce_ms:
                crate::protocol_constants::ON_DEMAND_DISCONNECT_DEBOUNCE_MS,
            connect_on_demand: false,
            stay_connected: true,
        }
    }
}

impl FanoutConfig {
    /// Rejects degenerate configuration, following `StreamingConfig::validate()`.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.subscriber_channel_capacity == 0 {
            return Err(GatewayError::Internal(
                "subscriber_channel_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// The full recognized configuration record (§6 "Process state"). The core
/// reads this on start and patches it via `UpdateConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub password: Option<String>,

    pub frequency: i64,
    pub mode: Mode,
    pub bandwidth_low: Option<i64>,
    pub bandwidth_high: Option<i64>,

    pub output_mode: String,
    pub audio_device: Option<String>,
    pub resample_enabled: bool,
    pub resample_output_rate: Option<u32>,
    pub output_channels: u16,

    pub nr2: Nr2Config,

    pub fifo_path: Option<String>,
    pub udp_host: Option<String>,
    pub udp_port: Option<u16>,

    pub port_audio_enabled: bool,
    pub fifo_enabled: bool,
    pub udp_enabled: bool,

    pub volume: f32,
    pub left_channel_enabled: bool,
    pub right_channel_enabled: bool,

    pub radio_control_type: RadioControlType,
    pub flrig: RigConfig,
    pub rigctl: RigConfig,
    pub serial: RigConfig,
    pub tci: RigConfig,
    pub tci_auto_start: bool,

    pub frequency_locked: bool,
    pub mode_locked: bool,

    pub auto_connect: bool,
    #[serde(flatten)]
    pub fanout: FanoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8080,
            ssl: false,
            password: None,
            frequency: 14_074_000,
            mode: Mode::Usb,
            bandwidth_low: Some(50),
            bandwidth_high: Some(2700),
            output_mode: "portaudio".into(),
            audio_device: None,
            resample_enabled: false,
            resample_output_rate: None,
            output_channels: 2,
            nr2: Nr2Config::default(),
            fifo_path: None,
            udp_host: None,
            udp_port: None,
            port_audio_enabled: false,
            fifo_enabled: false,
            udp_enabled: false,
            volume: 1.0,
            left_channel_enabled: true,
            right_channel_enabled: true,
            radio_control_type: RadioControlType::None,
            flrig: RigConfig::default(),
            rigctl: RigConfig::default(),
            serial: RigConfig::default(),
            tci: RigConfig::default(),
            tci_auto_start: false,
            frequency_locked: false,
            mode_locked: false,
            auto_connect: false,
            fanout: FanoutConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file, falling back to defaults if
    /// no path is given, following `ServerConfig::load`.
    pub fn load(path: Option<&Path>) -> GatewayResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Internal(format!("reading config: {e}")))?;
        let config: Config = serde_yaml::from_str(&text)
            .map_err(|e| GatewayError::Internal(format!("parsing config: {e}")))?;
        config.fanout.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_fanout_validation() {
        assert!(Config::default().fanout.validate().is_ok());
    }

    #[test]
    fn zero_capacity_fanout_fails_validation() {
        let mut cfg = FanoutConfig::default();
        cfg.subscriber_channel_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_with_no_path_returns_defaults() {
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.frequency, 14_074_000);
    }
}
