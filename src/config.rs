//! # Configuration Module
//!
//! Read-only view of the settings the app persists between runs, plus the
//! link and scheduler tunables. Nothing in this crate writes configuration.

use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::{
    controls::{LevelerModel, MoverModel},
    error::{RemoteError, Result},
};

/// Persisted settings
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct RemoteConfig {
    /// Remembered device
    #[serde(default)]
    pub device: DeviceConfig,
    /// Control surface preferences
    #[serde(default)]
    pub control: ControlConfig,
    /// Link and scheduler tunables
    #[serde(default)]
    pub link: LinkConfig,
}

/// Remembered device
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Address of the last selected device
    #[serde(default)]
    pub address: Option<String>,
    /// Display name of the last selected device
    #[serde(default)]
    pub name: Option<String>,
    /// Connect to `address` as soon as it is discovered
    #[serde(default)]
    pub auto_connect: bool,
}

/// Control surface preferences
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ControlConfig {
    /// Mover hardware variant
    #[serde(default)]
    pub mover_model: MoverModel,
    /// Leveler hardware variant
    #[serde(default)]
    pub leveler_model: LevelerModel,
    /// Start the leveler in expert mode
    #[serde(default)]
    pub expert_mode: bool,
}

/// Link and scheduler tunables
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Delay before a failed or dropped connection is retried
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// How long a scan session runs before stopping on its own
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,

    /// Command scheduler period
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Ticks a neutral command keeps being repeated after the last input
    #[serde(default = "default_stop_resend_count")]
    pub stop_resend_count: u8,

    /// Send leveling commands on every tick regardless of the resend counter
    #[serde(default = "default_leveling_always_send")]
    pub leveling_always_send: bool,
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

fn default_scan_timeout_ms() -> u64 {
    10_000
}

fn default_tick_interval_ms() -> u64 {
    200
}

fn default_stop_resend_count() -> u8 {
    10
}

fn default_leveling_always_send() -> bool {
    true
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            scan_timeout_ms: default_scan_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            stop_resend_count: default_stop_resend_count(),
            leveling_always_send: default_leveling_always_send(),
        }
    }
}

impl LinkConfig {
    /// Reconnect delay as a [`Duration`]
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Scan timeout as a [`Duration`]
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Tick period as a [`Duration`]
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl RemoteConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rvremote::config::RemoteConfig;
    ///
    /// let config = RemoteConfig::load("rvremote.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from a TOML string
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::ConfigParse`] on malformed TOML and
    /// [`RemoteError::Config`] if validation fails.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Config`] if a tunable is zero or auto-connect is
    /// enabled without a remembered address.
    pub fn validate(&self) -> Result<()> {
        if self.link.tick_interval_ms == 0 {
            return Err(RemoteError::Config(
                "link.tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.link.stop_resend_count == 0 {
            return Err(RemoteError::Config(
                "link.stop_resend_count must be greater than zero".to_string(),
            ));
        }
        if self.link.reconnect_delay_ms == 0 {
            return Err(RemoteError::Config(
                "link.reconnect_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.device.auto_connect
            && self.device.address.as_deref().is_none_or(str::is_empty)
        {
            return Err(RemoteError::Config(
                "device.auto_connect requires device.address".to_string(),
            ));
        }
        Ok(())
    }

    /// Address to connect to on discovery, if auto-connect is enabled
    #[must_use]
    pub fn auto_connect(&self) -> Option<&str> {
        if self.device.auto_connect {
            self.device.address.as_deref()
        } else {
            None
        }
    }
}
