use crate::database::{Database, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{fs, path::{Path, PathBuf}};
use tracing::warn;
use uuid::Uuid;

/* ------------------------------- bootstrap ------------------------------- */

/// Process-level settings read from `settings.json` before the store is opened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub download_directory: String,
    /// Empty means `<config dir>/clip-harvester/harvester.db`.
    pub database_path: String,
    pub debug_logs: bool,
    /// Hand retrievals to the connected client first; otherwise fetch directly.
    pub delegate_to_client: bool,
    pub confirm_delay_ms: u64,
    pub delegation_timeout_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            download_directory: default_download_dir().to_string_lossy().to_string(),
            database_path: String::new(),
            debug_logs: false,
            delegate_to_client: true,
            confirm_delay_ms: 5_000,
            delegation_timeout_ms: 10_000,
            stop_grace_ms: 2_000,
        }
    }
}

/// Where we store settings.json:
///   ~/Library/Application Support/clip-harvester/settings.json (macOS)
///   ~/.config/clip-harvester/settings.json (Linux)
pub fn app_support_dir() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| dirs::home_dir().unwrap_or_default());
    base.join("clip-harvester")
}

fn settings_json_path() -> PathBuf {
    app_support_dir().join("settings.json")
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/"))
        .join("clip-harvester")
}

fn dir_is_writable(p: &Path) -> bool {
    if !p.is_dir() {
        return false;
    }
    let test = p.join(format!(".writecheck-{}.tmp", Uuid::new_v4()));
    match fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&test)
    {
        Ok(_) => {
            let _ = fs::remove_file(test);
            true
        }
        Err(_) => false,
    }
}

/// Validate a candidate directory. If invalid, return the default download dir (and try to create it).
fn validated_download_dir(candidate: &str) -> String {
    let mut path = PathBuf::from(candidate.trim());

    if path.as_os_str().is_empty() || !path.is_absolute() {
        path = default_download_dir();
    }

    if !path.exists() && fs::create_dir_all(&path).is_err() {
        path = default_download_dir();
        let _ = fs::create_dir_all(&path);
    }

    if !dir_is_writable(&path) {
        let d = default_download_dir();
        let _ = fs::create_dir_all(&d);
        return d.to_string_lossy().to_string();
    }

    path.to_string_lossy().to_string()
}

impl AppSettings {
    pub fn database_path(&self) -> Option<PathBuf> {
        let p = self.database_path.trim();
        (!p.is_empty()).then(|| PathBuf::from(p))
    }
}

/// Load settings from JSON, validate the download path, and persist any fixups.
pub fn load_settings() -> AppSettings {
    load_settings_from(&settings_json_path())
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let mut settings = match fs::read_to_string(path) {
        Ok(s) => serde_json::from_str::<AppSettings>(&s).unwrap_or_else(|e| {
            warn!("settings.json unreadable ({e}); using defaults");
            AppSettings::default()
        }),
        Err(_) => AppSettings::default(),
    };

    settings.download_directory = validated_download_dir(&settings.download_directory);

    // Persist the clean copy (also migrates any old/invalid file)
    let _ = fs::write(
        path,
        serde_json::to_string_pretty(&settings).unwrap_or_else(|_| "{}".into()),
    );

    settings
}

/// Save settings back to JSON, validating the download directory on the way.
pub fn save_settings(settings: &AppSettings) -> Result<(), String> {
    save_settings_to(&settings_json_path(), settings)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create settings dir: {e}"))?;
    }

    let to_write = AppSettings {
        download_directory: validated_download_dir(&settings.download_directory),
        ..settings.clone()
    };

    let body = serde_json::to_string_pretty(&to_write)
        .map_err(|e| format!("Failed to serialize settings: {e}"))?;
    fs::write(path, body).map_err(|e| format!("Failed to write settings.json: {e}"))?;
    Ok(())
}

/* ------------------------------ queue config ----------------------------- */

pub const KEY_AUTO_DOWNLOAD: &str = "autoDownload";
pub const KEY_CHECK_INTERVAL_MS: &str = "checkIntervalMs";
pub const KEY_LAST_CHECK_TIME: &str = "lastCheckTime";
pub const KEY_MIN_DELAY_MS: &str = "minDelayMs";
pub const KEY_MAX_DELAY_MS: &str = "maxDelayMs";

pub const MIN_CHECK_INTERVAL_MS: u64 = 60_000;

/// Runtime settings bag kept in the store's settings table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub auto_download: bool,
    pub check_interval_ms: u64,
    /// Epoch milliseconds of the last discovery pass.
    pub last_check_time: Option<i64>,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            auto_download: true,
            check_interval_ms: 3_600_000,
            last_check_time: None,
            min_delay_ms: 20_000,
            max_delay_ms: 30_000,
        }
    }
}

pub fn validate_check_interval(ms: u64) -> StoreResult<()> {
    if ms < MIN_CHECK_INTERVAL_MS {
        return Err(StoreError::InvalidArgument(format!(
            "check interval must be at least {MIN_CHECK_INTERVAL_MS} ms (received: {ms})"
        )));
    }
    Ok(())
}

pub fn validate_delays(min_ms: u64, max_ms: u64) -> StoreResult<()> {
    if min_ms > max_ms {
        return Err(StoreError::InvalidArgument(format!(
            "minDelayMs ({min_ms}) must not exceed maxDelayMs ({max_ms})"
        )));
    }
    Ok(())
}

impl QueueConfig {
    /// Read every key, falling back per key to the default on a missing or
    /// mistyped value. Invalid stored combinations are replaced by defaults.
    pub fn load(db: &Database) -> StoreResult<Self> {
        let d = QueueConfig::default();
        let mut cfg = QueueConfig {
            auto_download: typed_or_default(db, KEY_AUTO_DOWNLOAD, d.auto_download)?,
            check_interval_ms: typed_or_default(db, KEY_CHECK_INTERVAL_MS, d.check_interval_ms)?,
            last_check_time: typed_or_default(db, KEY_LAST_CHECK_TIME, d.last_check_time)?,
            min_delay_ms: typed_or_default(db, KEY_MIN_DELAY_MS, d.min_delay_ms)?,
            max_delay_ms: typed_or_default(db, KEY_MAX_DELAY_MS, d.max_delay_ms)?,
        };
        if validate_check_interval(cfg.check_interval_ms).is_err() {
            warn!("stored check interval {} too small; using default", cfg.check_interval_ms);
            cfg.check_interval_ms = d.check_interval_ms;
        }
        if validate_delays(cfg.min_delay_ms, cfg.max_delay_ms).is_err() {
            warn!(
                "stored delays {}..{} invalid; using defaults",
                cfg.min_delay_ms, cfg.max_delay_ms
            );
            cfg.min_delay_ms = d.min_delay_ms;
            cfg.max_delay_ms = d.max_delay_ms;
        }
        Ok(cfg)
    }

    /// Persist every key.
    pub fn save(&self, db: &Database) -> StoreResult<()> {
        db.save_setting(KEY_AUTO_DOWNLOAD, &json!(self.auto_download))?;
        db.save_setting(KEY_CHECK_INTERVAL_MS, &json!(self.check_interval_ms))?;
        db.save_setting(KEY_LAST_CHECK_TIME, &json!(self.last_check_time))?;
        db.save_setting(KEY_MIN_DELAY_MS, &json!(self.min_delay_ms))?;
        db.save_setting(KEY_MAX_DELAY_MS, &json!(self.max_delay_ms))?;
        Ok(())
    }
}

fn typed_or_default<T: serde::de::DeserializeOwned>(db: &Database, key: &str, default: T) -> StoreResult<T> {
    match db.get_setting(key, serde_json::Value::Null)? {
        serde_json::Value::Null => Ok(default),
        v => Ok(serde_json::from_value(v).unwrap_or_else(|e| {
            warn!("setting {key} has unexpected type ({e}); using default");
            default
        })),
    }
}
