use serde_json::Value;

use crate::settings::AppSettings;

pub async fn load_settings() -> Result<Value, String> {
    let settings = crate::settings::load_settings();
    Ok(serde_json::json!({ "settings": settings }))
}

/// Persist process settings. Only `debug_logs` applies live; the rest is read
/// at the next start.
pub async fn save_settings(settings: AppSettings) -> Result<Value, String> {
    crate::settings::save_settings(&settings)?;

    crate::logging::set_file_logging_enabled(settings.debug_logs);
    tracing::info!("settings saved; debug_logs now {}", settings.debug_logs);

    Ok(serde_json::json!({ "restartRequired": true }))
}
