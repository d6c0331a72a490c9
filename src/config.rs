// src/config.rs

//! Configuration for the bridge.
//!
//! Deserialized from a TOML file when one exists; every field has a
//! sensible default, so the binary runs with no configuration at all.
//! There is deliberately no command-line surface; the file is the only
//! knob.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Where the configuration is looked for.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/evdi-vnc.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub device: DeviceConfig,
    pub performance: PerformanceConfig,
}

/// Viewer-facing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port the RFB server listens on.
    pub port: u16,
    /// Desktop name advertised to viewers.
    pub desktop_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 5900,
            desktop_name: "evdi-vnc".to_string(),
        }
    }
}

/// Device-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Buffers registered per mode; the device round-robins writes across
    /// them. Clamped to at least 1.
    pub buffer_count: usize,
    /// Bounded wait for one poll of the device event channel, per loop
    /// iteration, in milliseconds.
    pub poll_timeout_ms: u16,
    /// Bounded wait per poll while blocking for the first mode at startup.
    /// Only affects how quickly that wait notices a shutdown request.
    pub startup_poll_timeout_ms: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            buffer_count: 1,
            poll_timeout_ms: 1,
            startup_poll_timeout_ms: 50,
        }
    }
}

impl DeviceConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.poll_timeout_ms))
    }

    pub fn startup_poll_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.startup_poll_timeout_ms))
    }
}

/// Loop pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Minimum slice handed to the viewer transport each frame, even when
    /// the device side has already overrun the frame budget.
    pub min_transport_slice_ms: u16,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        PerformanceConfig {
            min_transport_slice_ms: 1,
        }
    }
}

impl PerformanceConfig {
    pub fn min_transport_slice(&self) -> Duration {
        Duration::from_millis(u64::from(self.min_transport_slice_ms))
    }
}

impl Config {
    /// Load from the default path; an absent file is the normal case and
    /// yields defaults, a malformed file is reported and ignored.
    pub fn load_or_default() -> Self {
        Self::load_from(Path::new(DEFAULT_CONFIG_PATH))
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => {
                    info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "Ignoring malformed configuration {}: {}",
                        path.display(),
                        e
                    );
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }
}
