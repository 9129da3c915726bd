//! Configuration management for portald
//!
//! Handles loading, validation, and saving of the JSON configuration file.
//! Configuration is stored at `~/.config/portald/config.json`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::combo::{self, ComboSettings};
use crate::device::{DeviceIdentity, PORTAL_PRODUCT_ID, PORTAL_VENDOR_ID};

// ============================================================================
// Constants
// ============================================================================

/// Directory under the XDG config and data dirs
const CONFIG_DIR: &str = "portald";

/// Config file inside `CONFIG_DIR`
const CONFIG_FILE: &str = "config.json";

/// Default dump file name
const DUMP_FILE: &str = "figure_dump.bin";

/// Most buttons a combo can hold (one bit each in the mask)
const MAX_COMBO_KEYS: usize = 32;

// ============================================================================
// Device Configuration
// ============================================================================

/// Identity of the emulated peripheral
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,

    #[serde(default = "default_product_id")]
    pub product_id: u16,
}

fn default_vendor_id() -> u16 { PORTAL_VENDOR_ID }
fn default_product_id() -> u16 { PORTAL_PRODUCT_ID }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: PORTAL_VENDOR_ID,
            product_id: PORTAL_PRODUCT_ID,
        }
    }
}

impl DeviceConfig {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.vendor_id, self.product_id)
    }
}

// ============================================================================
// Combo Configuration
// ============================================================================

/// Toggle combo settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboConfig {
    /// evdev key codes that must be held together (default: L3 + R3 + START)
    #[serde(default = "default_combo_keys")]
    pub keys: Vec<u16>,

    /// Button sampling period in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Wait after a match before toggling, in milliseconds
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

fn default_combo_keys() -> Vec<u16> { combo::keys::DEFAULT_COMBO.to_vec() }
fn default_poll_interval() -> u64 { combo::DEFAULT_POLL_INTERVAL_MS }
fn default_debounce() -> u64 { combo::DEFAULT_DEBOUNCE_MS }

impl Default for ComboConfig {
    fn default() -> Self {
        Self {
            keys: default_combo_keys(),
            poll_interval_ms: combo::DEFAULT_POLL_INTERVAL_MS,
            debounce_ms: combo::DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl ComboConfig {
    /// Drop duplicate keys, cap the key count and keep polling non-zero
    pub fn validate(&mut self) {
        let mut seen = Vec::with_capacity(self.keys.len());
        self.keys.retain(|key| {
            if seen.contains(key) {
                false
            } else {
                seen.push(*key);
                true
            }
        });
        self.keys.truncate(MAX_COMBO_KEYS);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
    }

    /// Monitor settings, one mask bit per key
    pub fn settings(&self) -> ComboSettings {
        ComboSettings {
            mask: combo::combo_mask(self.keys.len()),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// portald configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Figure dump file
    #[serde(default = "default_dump_path")]
    pub dump_path: PathBuf,

    /// Emulated peripheral identity
    #[serde(default)]
    pub device: DeviceConfig,

    /// Toggle combo
    #[serde(default)]
    pub combo: ComboConfig,

    /// Whether emulation is active right after start
    #[serde(default = "default_true")]
    pub start_enabled: bool,

    /// evdev device sampled for the combo (e.g. /dev/input/event4)
    #[serde(default)]
    pub input_device: Option<PathBuf>,

    /// Where this config was loaded from
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

fn default_true() -> bool { true }

fn default_dump_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CONFIG_DIR)
        .join(DUMP_FILE)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dump_path: default_dump_path(),
            device: DeviceConfig::default(),
            combo: ComboConfig::default(),
            start_enabled: true,
            input_device: None,
            config_path: None,
        }
    }
}

impl Config {
    /// `~/.config/portald`
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR))
    }

    /// `~/.config/portald/config.json`
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load from `~/.config/portald/config.json`
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_config_path() {
            Some(path) => Self::load(&path),
            None => {
                tracing::warn!("Could not determine config directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load and validate a config file
    ///
    /// A missing file yields the defaults, remembering `path` for `save()`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let contents = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        let mut config: Config =
            serde_json::from_str(&contents).map_err(ConfigError::ParseError)?;

        config.validate()?;
        config.config_path = Some(path.to_path_buf());

        tracing::info!(
            path = %path.display(),
            dump = %config.dump_path.display(),
            device = %config.device.identity(),
            combo_keys = config.combo.keys.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate and clamp values
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.dump_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError("dump_path is empty".to_string()));
        }
        self.combo.validate();
        Ok(())
    }

    /// Write the config back as pretty JSON
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = match &self.config_path {
            Some(p) => p.clone(),
            None => Self::default_config_path()
                .ok_or_else(|| ConfigError::ValidationError("No config path".to_string()))?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::IoError)?;
        }

        let contents = serde_json::to_string_pretty(self).map_err(ConfigError::ParseError)?;
        fs::write(&path, contents).map_err(ConfigError::IoError)?;

        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Load the default config, writing it out on first run
    pub fn create_default_if_missing() -> Result<Self, ConfigError> {
        let config = Self::load_default()?;

        if let Some(path) = &config.config_path {
            if !path.exists() {
                config.save()?;
                tracing::info!(path = %path.display(), "Created default configuration file");
            }
        }

        Ok(config)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Config load/save failure
#[derive(Debug)]
pub enum ConfigError {
    /// Reading or writing the file failed
    IoError(std::io::Error),
    /// Malformed JSON
    ParseError(serde_json::Error),
    /// Validation error
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "I/O error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Parse error: {}", e),
            ConfigError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(e) => Some(e),
            ConfigError::ValidationError(_) => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.start_enabled);
        assert_eq!(config.device.identity(), DeviceIdentity::portal());
        assert!(config.dump_path.ends_with("portald/figure_dump.bin"));
        assert!(config.input_device.is_none());
    }

    #[test]
    fn test_combo_defaults() {
        let combo = ComboConfig::default();
        assert_eq!(combo.keys, vec![0x13d, 0x13e, 0x13b]);
        assert_eq!(combo.poll_interval_ms, 50);
        assert_eq!(combo.debounce_ms, 200);

        let settings = combo.settings();
        assert_eq!(settings.mask, 0b111);
        assert_eq!(settings.debounce, Duration::from_millis(200));
    }

    #[test]
    fn test_combo_validation() {
        let mut combo = ComboConfig {
            keys: vec![0x13b, 0x13b, 0x13d],
            poll_interval_ms: 0,
            debounce_ms: 0,
        };

        combo.validate();
        assert_eq!(combo.keys, vec![0x13b, 0x13d]);
        assert_eq!(combo.poll_interval_ms, 1);
        assert_eq!(combo.settings().mask, 0b11);
    }

    #[test]
    fn test_combo_key_cap() {
        let mut combo = ComboConfig {
            keys: (0..40).collect(),
            ..ComboConfig::default()
        };
        combo.validate();
        assert_eq!(combo.keys.len(), 32);
        assert_eq!(combo.settings().mask, u32::MAX);
    }

    #[test]
    fn test_config_json_parsing() {
        let json = r#"{
            "dump_path": "/tmp/portal/dump.bin",
            "device": { "vendor_id": 4660 },
            "combo": { "keys": [304, 305] },
            "start_enabled": false
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.dump_path, PathBuf::from("/tmp/portal/dump.bin"));
        assert_eq!(config.device.vendor_id, 0x1234);
        // Defaults fill in missing fields
        assert_eq!(config.device.product_id, PORTAL_PRODUCT_ID);
        assert_eq!(config.combo.keys, vec![304, 305]);
        assert_eq!(config.combo.debounce_ms, 200);
        assert!(!config.start_enabled);
    }

    #[test]
    fn test_config_json_minimal() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.start_enabled);
        assert_eq!(config.combo.poll_interval_ms, 50);
        assert_eq!(config.device.identity(), DeviceIdentity::portal());
    }

    #[test]
    fn test_empty_dump_path_rejected() {
        let mut config = Config {
            dump_path: PathBuf::new(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_load_missing_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
        assert!(config.start_enabled);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");

        let mut config = Config::load(&path).unwrap();
        config.start_enabled = false;
        config.combo.keys = vec![0x130];
        config.save().unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert!(!reloaded.start_enabled);
        assert_eq!(reloaded.combo.keys, vec![0x130]);
    }

    #[test]
    fn test_parse_error_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::ParseError(_))));
    }
}
