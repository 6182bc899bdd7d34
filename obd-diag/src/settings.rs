//! Persistent settings

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use obd_detect::SerialConfig;
use obd_engine::EngineConfig;
use serde::{Deserialize, Serialize};

const APP_DIR: &str = "obd-diag";
const SETTINGS_FILE: &str = "settings.json";

/// Settings stored between runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Engine timings and thresholds
    pub engine: EngineConfig,
    /// Serial transport options
    pub serial: SerialConfig,
    /// Default scan window in seconds
    pub scan_window_secs: u64,
    /// Last device a connection reached ready on.
    /// Only used as a default when no device is given.
    pub last_device: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            serial: SerialConfig::default(),
            scan_window_secs: 8,
            last_device: None,
        }
    }
}

/// `$XDG_CONFIG_HOME/obd-diag` when absolute, else `~/.config/obd-diag`
fn config_dir_from(xdg_config: Option<String>, home: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(xdg_config) = xdg_config {
        let path = PathBuf::from(xdg_config);
        if path.is_absolute() {
            return Some(path.join(APP_DIR));
        }
    }
    home.map(|h| h.join(".config").join(APP_DIR))
}

impl Settings {
    pub fn default_path() -> Option<PathBuf> {
        config_dir_from(std::env::var("XDG_CONFIG_HOME").ok(), dirs::home_dir())
            .map(|dir| dir.join(SETTINGS_FILE))
    }

    /// Load from `path`, falling back to defaults if the file is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dir_prefers_absolute_xdg() {
        let dir = config_dir_from(Some("/tmp/xdg".into()), Some(PathBuf::from("/home/u")));
        assert_eq!(dir, Some(PathBuf::from("/tmp/xdg/obd-diag")));

        let dir = config_dir_from(Some("relative".into()), Some(PathBuf::from("/home/u")));
        assert_eq!(dir, Some(PathBuf::from("/home/u/.config/obd-diag")));

        assert_eq!(config_dir_from(None, None), None);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"last_device": "/dev/rfcomm0", "engine": {"connect": {"max_attempts": 5}}}"#)
                .unwrap();
        assert_eq!(settings.last_device.as_deref(), Some("/dev/rfcomm0"));
        assert_eq!(settings.engine.connect.max_attempts, 5);
        assert_eq!(settings.engine.connect.strategy_timeouts_ms, vec![15_000, 20_000, 30_000]);
        assert_eq!(settings.serial.baud_rate, 38_400);
        assert_eq!(settings.scan_window_secs, 8);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("obd-diag-test-{}", std::process::id()))
            .join(SETTINGS_FILE);
        let settings = Settings {
            last_device: Some("00:1D:A5:68:98:8B".into()),
            ..Default::default()
        };
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.last_device, settings.last_device);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_missing_file_is_default() {
        let path = std::env::temp_dir().join("obd-diag-does-not-exist.json");
        let settings = Settings::load_from(&path).unwrap();
        assert!(settings.last_device.is_none());
    }
}
