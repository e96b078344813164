//! CLI configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/speedprobe/config.toml`
//! - Windows: `%APPDATA%/speedprobe/config.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use speedprobe_transfer::{RepeatConfig, TransferConfig, WindowPolicy};

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Payload size for uploads when none is given on the command line.
    #[serde(default = "default_upload_size")]
    pub upload_size: u64,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub repeat: RepeatSettings,
}

/// `[repeat]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatSettings {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,

    /// Let the running iteration finish when the window closes.
    #[serde(default)]
    pub finish_in_flight: bool,

    #[serde(default)]
    pub stop_on_error: bool,

    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

fn default_upload_size() -> u64 {
    10_000_000
}

fn default_window_ms() -> u64 {
    10_000
}

fn default_report_interval_ms() -> u64 {
    1_000
}

fn default_error_backoff_ms() -> u64 {
    250
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upload_size: default_upload_size(),
            transfer: TransferConfig::default(),
            repeat: RepeatSettings::default(),
        }
    }
}

impl Default for RepeatSettings {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            report_interval_ms: default_report_interval_ms(),
            finish_in_flight: false,
            stop_on_error: false,
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl RepeatSettings {
    pub fn to_repeat_config(&self) -> RepeatConfig {
        RepeatConfig {
            window: Duration::from_millis(self.window_ms),
            report_interval: Duration::from_millis(self.report_interval_ms),
            policy: if self.finish_in_flight {
                WindowPolicy::FinishInFlight
            } else {
                WindowPolicy::StopInFlight
            },
            stop_on_error: self.stop_on_error,
            error_backoff: Duration::from_millis(self.error_backoff_ms),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or from the default location.
    ///
    /// A missing file at the default location is created with defaults; a
    /// missing explicit path is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let path = config_path();
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    let config = Config::default();
                    config.save_to(&path)?;
                    Ok(config)
                }
            }
        }
    }

    fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.transfer.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("speedprobe").join("config.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("speedprobe")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use speedprobe_transfer::UploadStorage;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.upload_size, 10_000_000);
        assert_eq!(config.transfer, TransferConfig::default());
        assert_eq!(config.repeat.window_ms, 10_000);
        assert!(!config.repeat.finish_in_flight);
    }

    #[test]
    fn config_partial_toml() {
        let toml_str = r#"
upload_size = 2000000

[transfer]
upload_storage = "temp_file"

[repeat]
finish_in_flight = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.upload_size, 2_000_000);
        assert_eq!(config.transfer.upload_storage, UploadStorage::TempFile);
        assert_eq!(config.transfer.socket_timeout_ms, 10_000);

        let repeat = config.repeat.to_repeat_config();
        assert_eq!(repeat.policy, WindowPolicy::FinishInFlight);
        assert_eq!(repeat.report_interval, Duration::from_secs(1));
    }

    #[test]
    fn config_path_not_empty() {
        assert!(config_path().to_string_lossy().contains("speedprobe"));
    }

    #[test]
    fn config_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let mut config = Config {
            upload_size: 42,
            ..Config::default()
        };
        config.transfer.set_proxy("proxy.local:3128").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.upload_size, 42);
        assert_eq!(loaded.transfer, config.transfer);
    }

    #[test]
    fn load_rejects_invalid_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[transfer]\nupload_chunk_size = 0\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());

        assert!(Config::load(Some(&tmp.path().join("missing.toml"))).is_err());
    }
}
