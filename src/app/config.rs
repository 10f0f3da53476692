use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::warn;

use crate::app::error::AppError;

pub const DATA_DIR_ENV: &str = "ALTHEA_DATA_DIR";

pub const ANISETTE_HOST: &str = "127.0.0.1";
pub const ANISETTE_PORT: u16 = 6969;
pub const ANISETTE_URL: &str = "http://127.0.0.1:6969";
pub const ALTERNATE_SOCKET_ADDRESS: &str = "127.0.0.1:27015";
pub const SOCKET_ADDRESS_ENV: &str = "USBMUXD_SOCKET_ADDRESS";
pub const ANISETTE_SERVER_ENV: &str = "ALTSERVER_ANISETTE_SERVER";

pub const DEVICE_ID_PROGRAM: &str = "idevice_id";
pub const DEVICE_INFO_PROGRAM: &str = "ideviceinfo";
pub const DEVICE_PAIR_PROGRAM: &str = "idevicepair";
pub const WIFI_SYNC_PROGRAM: &str = "pymobiledevice3";

pub const CREDENTIAL_SERVICE: &str = "althea";
pub const CREDENTIAL_ACCOUNT_KEY: &str = "apple_id";
pub const CREDENTIAL_SECRET_KEY: &str = "password";

pub const MINIMUM_SUPPORTED_VERSION: &str = "15.0";

/// Bounded waits for every external probe and short-lived command.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    pub discovery: Duration,
    pub version_probe: Duration,
    pub pair_validate: Duration,
    pub pair: Duration,
    pub wifi_sync: Duration,
    pub anisette_probe: Duration,
    pub netmuxd_probe: Duration,
    pub host_restart: Duration,
    pub helper_exit: Duration,
    pub terminate_grace: Duration,
    pub readiness_poll_interval: Duration,
    /// Deadline for a service to become ready after it is spawned.
    pub service_start: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            discovery: Duration::from_secs(5),
            version_probe: Duration::from_secs(4),
            pair_validate: Duration::from_secs(2),
            pair: Duration::from_secs(30),
            wifi_sync: Duration::from_secs(20),
            anisette_probe: Duration::from_millis(750),
            netmuxd_probe: Duration::from_millis(500),
            host_restart: Duration::from_secs(6),
            helper_exit: Duration::from_secs(10),
            terminate_grace: Duration::from_secs(3),
            readiness_poll_interval: Duration::from_millis(200),
            service_start: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub data_dir: PathBuf,
}

impl AppPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn resolve() -> Self {
        if let Ok(path) = std::env::var(DATA_DIR_ENV) {
            if !path.trim().is_empty() {
                return Self::new(path);
            }
        }
        let base = dirs::data_dir().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local").join("share")
        });
        Self::new(base.join("althea"))
    }

    pub fn altserver(&self) -> PathBuf {
        self.data_dir.join("AltServer")
    }

    pub fn anisette_server(&self) -> PathBuf {
        self.data_dir.join("anisette-server")
    }

    pub fn netmuxd(&self) -> PathBuf {
        self.data_dir.join("netmuxd")
    }

    pub fn altstore_ipa(&self) -> PathBuf {
        self.data_dir.join("AltStore.ipa")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("althea.log")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    #[default]
    WindowAndTray,
    TrayOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Settings {
    #[serde(default)]
    pub startup_mode: StartupMode,
    /// Keys written by other versions are carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub fn load_settings(paths: &AppPaths) -> Settings {
    load_settings_from_path(&paths.settings_file())
}

pub fn save_settings(paths: &AppPaths, settings: &Settings) -> Result<(), AppError> {
    save_settings_to_path(settings, &paths.settings_file())
}

pub fn load_settings_from_path(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read settings; using defaults");
            return Settings::default();
        }
    };
    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to parse settings; using defaults");
            return Settings::default();
        }
    };
    merge_settings(&value)
}

fn merge_settings(value: &serde_json::Value) -> Settings {
    let Some(object) = value.as_object() else {
        return Settings::default();
    };
    let mut settings = Settings::default();
    if let Some(mode) = object
        .get("startup_mode")
        .and_then(|mode| serde_json::from_value::<StartupMode>(mode.clone()).ok())
    {
        settings.startup_mode = mode;
    }
    for (key, item) in object {
        if key != "startup_mode" {
            settings.extra.insert(key.clone(), item.clone());
        }
    }
    settings
}

pub fn save_settings_to_path(settings: &Settings, path: &Path) -> Result<(), AppError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|err| AppError::system(format!("Failed to create settings dir: {err}"), ""))?;
    let payload = serde_json::to_string_pretty(settings)
        .map_err(|err| AppError::system(format!("Failed to serialize settings: {err}"), ""))?;
    let mut temp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::system(format!("Failed to create temp settings: {err}"), ""))?;
    temp.write_all(payload.as_bytes())
        .map_err(|err| AppError::system(format!("Failed to write settings: {err}"), ""))?;
    temp.persist(path)
        .map_err(|err| AppError::system(format!("Failed to replace settings: {err}"), ""))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().expect("tmp");
        let settings = load_settings_from_path(&tmp.path().join("config.json"));
        assert_eq!(settings.startup_mode, StartupMode::WindowAndTray);
    }

    #[test]
    fn merges_defaults_under_partial_document() {
        let value = serde_json::json!({ "theme": "dark" });
        let settings = merge_settings(&value);
        assert_eq!(settings.startup_mode, StartupMode::WindowAndTray);
        assert_eq!(settings.extra.get("theme").and_then(|v| v.as_str()), Some("dark"));
    }

    #[test]
    fn invalid_mode_falls_back_to_default() {
        let value = serde_json::json!({ "startup_mode": "fullscreen" });
        assert_eq!(merge_settings(&value).startup_mode, StartupMode::WindowAndTray);
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let tmp = TempDir::new().expect("tmp");
        let path = tmp.path().join("config.json");
        fs::write(&path, "{not json").expect("write");
        assert_eq!(load_settings_from_path(&path), Settings::default());
    }

    #[test]
    fn save_then_load_keeps_mode_and_extra_keys() {
        let tmp = TempDir::new().expect("tmp");
        let path = tmp.path().join("nested").join("config.json");
        let mut settings = Settings {
            startup_mode: StartupMode::TrayOnly,
            ..Settings::default()
        };
        settings
            .extra
            .insert("window_x".to_string(), serde_json::json!(120));
        save_settings_to_path(&settings, &path).expect("save");

        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"tray_only\""));
        let loaded = load_settings_from_path(&path);
        assert_eq!(loaded, settings);
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1, "temp file should have been renamed away");
    }

    #[test]
    fn paths_derive_from_data_dir() {
        let paths = AppPaths::new("/opt/althea");
        assert_eq!(paths.altserver(), PathBuf::from("/opt/althea/AltServer"));
        assert_eq!(paths.log_file(), PathBuf::from("/opt/althea/althea.log"));
        assert_eq!(paths.settings_file(), PathBuf::from("/opt/althea/config.json"));
    }
}
