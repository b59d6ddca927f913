//! Control-plane configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{NetsmbError, Result};

/// Default number of non-reserved handle ids.
pub const DEFAULT_MAX_HANDLES: u32 = 1024;
/// Largest handle table the registry accepts.
pub const MAX_HANDLES_LIMIT: u32 = 65535;
/// Process name the notifier singleton must carry.
pub const DEFAULT_NOTIFIER_NAME: &str = "mc_notifier";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultichannelConfig {
    pub enabled: bool,
    /// Usable channels per session, main included.
    pub max_channels: u32,
    /// Distinct server interfaces whose RSS sub-channel entries may be paired.
    pub max_rss_interfaces: u32,
    pub ignored_client_nics: Vec<u64>,
    pub ignored_server_nics: Vec<u64>,
    /// Echo one alternate channel per interface notification.
    pub echo_idle_channels: bool,
}

impl Default for MultichannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_channels: 8,
            max_rss_interfaces: 4,
            ignored_client_nics: Vec::new(),
            ignored_server_nics: Vec::new(),
            echo_idle_channels: true,
        }
    }
}

impl MultichannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_channels(mut self, max: u32) -> Self {
        self.max_channels = max;
        self
    }

    pub fn with_max_rss_interfaces(mut self, max: u32) -> Self {
        self.max_rss_interfaces = max;
        self
    }

    pub fn with_ignored_client_nic(mut self, index: u64) -> Self {
        self.ignored_client_nics.push(index);
        self
    }

    pub fn with_ignored_server_nic(mut self, index: u64) -> Self {
        self.ignored_server_nics.push(index);
        self
    }

    pub fn with_echo_idle_channels(mut self, echo: bool) -> Self {
        self.echo_idle_channels = echo;
        self
    }

    pub fn is_client_ignored(&self, index: u64) -> bool {
        self.ignored_client_nics.contains(&index)
    }

    pub fn is_server_ignored(&self, index: u64) -> bool {
        self.ignored_server_nics.contains(&index)
    }
}

/// Top-level configuration consumed when the registry is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetsmbConfig {
    /// Highest valid handle id; id 0 is the reserved bootstrap id.
    pub max_handles: u32,
    /// Expected name of the notifier process.
    pub notifier_process_name: String,
    pub multichannel: MultichannelConfig,
}

impl Default for NetsmbConfig {
    fn default() -> Self {
        Self {
            max_handles: DEFAULT_MAX_HANDLES,
            notifier_process_name: DEFAULT_NOTIFIER_NAME.to_string(),
            multichannel: MultichannelConfig::default(),
        }
    }
}

impl NetsmbConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_handles(mut self, max: u32) -> Self {
        self.max_handles = max;
        self
    }

    pub fn with_notifier_process_name(mut self, name: &str) -> Self {
        self.notifier_process_name = name.to_string();
        self
    }

    pub fn with_multichannel(mut self, multichannel: MultichannelConfig) -> Self {
        self.multichannel = multichannel;
        self
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: NetsmbConfig =
            serde_json::from_str(json).map_err(|e| NetsmbError::Config {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| NetsmbError::Config {
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_handles == 0 {
            return Err(NetsmbError::Config {
                reason: "max_handles must be at least 1".to_string(),
            });
        }
        if self.max_handles > MAX_HANDLES_LIMIT {
            return Err(NetsmbError::Config {
                reason: format!(
                    "max_handles {} exceeds limit {}",
                    self.max_handles, MAX_HANDLES_LIMIT
                ),
            });
        }
        if self.multichannel.max_channels == 0 {
            return Err(NetsmbError::Config {
                reason: "multichannel.max_channels must be at least 1".to_string(),
            });
        }
        if self.notifier_process_name.trim().is_empty() {
            return Err(NetsmbError::Config {
                reason: "notifier_process_name is empty".to_string(),
            });
        }
        Ok(())
    }
}
