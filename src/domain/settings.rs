use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where and how tracing output is written. See `infrastructure::logging`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Filter directive such as `info` or `gatt_coordinator=debug`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub console_logging_enabled: bool,
    pub ansi_colors: bool,
    pub file_logging_enabled: bool,
    pub log_dir: String,
    pub file_name_prefix: String,
    /// One of `minutely`, `hourly`, `daily` or `never`.
    pub rotation: String,
    pub show_target: bool,
    pub show_file_line: bool,
    pub show_thread_ids: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_logging_enabled: true,
            ansi_colors: true,
            file_logging_enabled: false,
            log_dir: "logs".to_string(),
            file_name_prefix: "gatt_coordinator".to_string(),
            rotation: "daily".to_string(),
            show_target: true,
            show_file_line: false,
            show_thread_ids: false,
        }
    }
}

/// Reconnect and write pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
    /// Pause after each acknowledged write before the next one is issued.
    pub write_settle_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            backoff_initial_ms: 1_000,
            backoff_multiplier: 2.0,
            backoff_max_ms: 60_000,
            write_settle_ms: 100,
        }
    }
}

impl ConnectionSettings {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn write_settle(&self) -> Duration {
        Duration::from_millis(self.write_settle_ms)
    }
}

/// Which physical device to talk to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub address: Option<u64>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_settings: LogSettings,
    pub connection: ConnectionSettings,
    pub device: DeviceSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit path, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("GattCoordinator");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn set_device_address(&mut self, address: u64) -> anyhow::Result<()> {
        if self.settings.device.address != Some(address) {
            self.settings.device.address = Some(address);
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("gatt_coordinator_{}_{}.json", name, std::process::id()));
        path
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let path = temp_path("partial");
        fs::write(&path, r#"{ "connection": { "backoff_max_ms": 5000 } }"#).unwrap();

        let service = SettingsService::with_path(path.clone());
        let connection = &service.get().connection;
        assert_eq!(connection.backoff_max(), Duration::from_secs(5));
        assert_eq!(connection.backoff_initial(), Duration::from_secs(1));
        assert_eq!(connection.backoff_multiplier, 2.0);
        assert_eq!(service.get().log_settings, LogSettings::default());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_missing_file_falls_back_and_save_round_trips() {
        let path = temp_path("missing");
        let _ = fs::remove_file(&path);

        let mut service = SettingsService::with_path(path.clone());
        assert_eq!(service.get().device.address, None);

        service.set_device_address(0xA4C1_3800_1234).unwrap();
        let reloaded = SettingsService::with_path(path.clone());
        assert_eq!(reloaded.get().device.address, Some(0xA4C1_3800_1234));

        let _ = fs::remove_file(path);
    }
}
