use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::database::{self, Item};
use crate::download::{DelegationOutcome, TaskToken};
use crate::settings::{
    validate_check_interval, validate_delays, KEY_AUTO_DOWNLOAD, KEY_CHECK_INTERVAL_MS, KEY_MAX_DELAY_MS,
    KEY_MIN_DELAY_MS,
};
use crate::AppState;

pub async fn enqueue(app: &AppState, items: Vec<Item>) -> Result<Value, String> {
    let report = app.manager.enqueue(items).await.map_err(|e| e.to_string())?;
    serde_json::to_value(report).map_err(|e| e.to_string())
}

pub async fn get_status(app: &AppState) -> Result<Value, String> {
    let status = app.manager.status().await;
    let check_interval_ms = app.config.lock().await.check_interval_ms;
    let mut v = serde_json::to_value(status).map_err(|e| e.to_string())?;
    if let Some(obj) = v.as_object_mut() {
        obj.insert("checkIntervalMs".into(), json!(check_interval_ms));
        obj.insert("schedulerRunning".into(), json!(app.scheduler.is_running()));
    }
    Ok(v)
}

pub async fn stop(app: &AppState) -> Result<Value, String> {
    let report = app.manager.stop();
    serde_json::to_value(report).map_err(|e| e.to_string())
}

/// Flip auto mode. The in-memory flag only changes once the store has it.
pub async fn toggle_auto_mode(app: &AppState) -> Result<Value, String> {
    let mut cfg = app.config.lock().await;
    let next = !cfg.auto_download;

    database::blocking(&app.db, move |db| db.save_setting(KEY_AUTO_DOWNLOAD, &json!(next)))
        .await
        .map_err(|e| {
            warn!("auto mode not saved: {e}");
            format!("failed to save auto mode: {e}")
        })?;
    cfg.auto_download = next;
    app.manager.set_auto_download(next);

    let mut stopped = None;
    if next {
        app.scheduler.start();
    } else {
        app.scheduler.stop();
        if app.manager.is_processing() {
            stopped = Some(app.manager.stop());
        }
    }
    info!("auto mode {}", if next { "on" } else { "off" });
    Ok(json!({ "autoDownload": next, "stopped": stopped }))
}

/// Ask for a discovery scan now, whether or not auto mode is on.
pub async fn check_now(app: &AppState) -> Result<Value, String> {
    let at = app.scheduler.check_now().await;
    Ok(json!({ "lastCheckTime": at }))
}

pub async fn set_check_interval(app: &AppState, interval_ms: u64) -> Result<Value, String> {
    validate_check_interval(interval_ms).map_err(|e| e.to_string())?;
    let mut cfg = app.config.lock().await;
    database::blocking(&app.db, move |db| db.save_setting(KEY_CHECK_INTERVAL_MS, &json!(interval_ms)))
        .await
        .map_err(|e| e.to_string())?;
    cfg.check_interval_ms = interval_ms;
    // Only restarts the clock if it is running.
    app.scheduler.restart(Duration::from_millis(interval_ms));
    Ok(json!({ "checkIntervalMs": interval_ms }))
}

pub async fn set_delays(app: &AppState, min_delay_ms: u64, max_delay_ms: u64) -> Result<Value, String> {
    validate_delays(min_delay_ms, max_delay_ms).map_err(|e| e.to_string())?;
    let mut cfg = app.config.lock().await;
    database::blocking(&app.db, move |db| {
        db.save_setting(KEY_MIN_DELAY_MS, &json!(min_delay_ms))?;
        db.save_setting(KEY_MAX_DELAY_MS, &json!(max_delay_ms))
    })
    .await
    .map_err(|e| e.to_string())?;
    cfg.min_delay_ms = min_delay_ms;
    cfg.max_delay_ms = max_delay_ms;
    app.manager
        .update_pacing(Duration::from_millis(min_delay_ms), Duration::from_millis(max_delay_ms));
    Ok(json!({ "minDelayMs": min_delay_ms, "maxDelayMs": max_delay_ms }))
}

pub async fn delegation_result(
    app: &AppState,
    token: TaskToken,
    success: bool,
    aborted: bool,
    filename_hint: Option<String>,
) -> Result<Value, String> {
    let gateway = app
        .gateway
        .as_ref()
        .ok_or_else(|| "delegation is disabled".to_string())?;
    let resolved = gateway.resolve(
        token,
        DelegationOutcome {
            success,
            aborted,
            filename_hint,
        },
    );
    Ok(json!({ "resolved": resolved }))
}

pub async fn cancel_task(app: &AppState, token: TaskToken) -> Result<Value, String> {
    Ok(json!({ "cancelled": app.manager.cancel_task(token) }))
}
