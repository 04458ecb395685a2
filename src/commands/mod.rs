pub mod control;
pub mod event;
pub mod library;
pub mod log;
pub mod settings_cmd;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::database::{Item, ItemFilter, Source, SourceFilter};
use crate::download::TaskToken;
use crate::settings::AppSettings;
use crate::AppState;

/// One line of the control protocol, tagged by `action`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    #[serde(alias = "addToQueue")]
    Enqueue { items: Vec<Item> },
    GetStatus,
    #[serde(alias = "stopDownloads")]
    Stop,
    ToggleAutoMode,
    CheckNow,
    SetCheckInterval { interval_ms: u64 },
    SetDelays { min_delay_ms: u64, max_delay_ms: u64 },
    DelegationResult {
        token: TaskToken,
        #[serde(default)]
        success: bool,
        #[serde(default)]
        aborted: bool,
        #[serde(default)]
        filename_hint: Option<String>,
    },
    CancelTask { token: TaskToken },
    SourcesReceived { sources: Vec<Source> },
    GetAllSources {
        #[serde(default)]
        filter: SourceFilter,
    },
    ToggleSource { source_id: String },
    DeleteSource { source_id: String },
    GetSourceItems {
        source_id: String,
        #[serde(default)]
        filter: ItemFilter,
    },
    GetStats,
    GetAllRetrievedItems,
    DeleteItem {
        item_id: String,
        #[serde(default)]
        delete_file: bool,
    },
    GetSettings,
    SaveSettings { settings: AppSettings },
    ClientLog {
        level: String,
        message: String,
        #[serde(default)]
        context: Option<Value>,
    },
}

pub async fn dispatch(app: &AppState, request: Request) -> Value {
    let result = match request {
        Request::Enqueue { items } => control::enqueue(app, items).await,
        Request::GetStatus => control::get_status(app).await,
        Request::Stop => control::stop(app).await,
        Request::ToggleAutoMode => control::toggle_auto_mode(app).await,
        Request::CheckNow => control::check_now(app).await,
        Request::SetCheckInterval { interval_ms } => control::set_check_interval(app, interval_ms).await,
        Request::SetDelays {
            min_delay_ms,
            max_delay_ms,
        } => control::set_delays(app, min_delay_ms, max_delay_ms).await,
        Request::DelegationResult {
            token,
            success,
            aborted,
            filename_hint,
        } => control::delegation_result(app, token, success, aborted, filename_hint).await,
        Request::CancelTask { token } => control::cancel_task(app, token).await,
        Request::SourcesReceived { sources } => library::sources_received(app, sources).await,
        Request::GetAllSources { filter } => library::get_all_sources(app, filter).await,
        Request::ToggleSource { source_id } => library::toggle_source(app, source_id).await,
        Request::DeleteSource { source_id } => library::delete_source(app, source_id).await,
        Request::GetSourceItems { source_id, filter } => library::get_source_items(app, source_id, filter).await,
        Request::GetStats => library::get_stats(app).await,
        Request::GetAllRetrievedItems => library::get_all_retrieved_items(app).await,
        Request::DeleteItem { item_id, delete_file } => library::delete_item(app, item_id, delete_file).await,
        Request::GetSettings => settings_cmd::load_settings().await,
        Request::SaveSettings { settings } => settings_cmd::save_settings(settings).await,
        Request::ClientLog {
            level,
            message,
            context,
        } => log::client_log(level, message, context).await,
    };
    envelope(result)
}

/// Parse and run one protocol line, echoing its `id` (if any) in the reply.
pub async fn handle_line(app: &AppState, line: &str) -> Value {
    let raw: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return envelope(Err(format!("invalid JSON: {e}"))),
    };
    let id = raw.get("id").cloned();
    let mut reply = match serde_json::from_value::<Request>(raw) {
        Ok(request) => {
            debug!("request: {request:?}");
            dispatch(app, request).await
        }
        Err(e) => envelope(Err(format!("invalid request: {e}"))),
    };
    if let (Some(id), Some(obj)) = (id, reply.as_object_mut()) {
        obj.insert("id".into(), id);
    }
    reply
}

/// `{"success": true, ...fields}` or `{"success": false, "error": "..."}`.
fn envelope(result: Result<Value, String>) -> Value {
    match result {
        Ok(Value::Object(fields)) => {
            let mut out = Map::with_capacity(fields.len() + 1);
            out.insert("success".into(), Value::Bool(true));
            out.extend(fields);
            Value::Object(out)
        }
        Ok(Value::Null) => json!({ "success": true }),
        Ok(other) => json!({ "success": true, "data": other }),
        Err(error) => json!({ "success": false, "error": error }),
    }
}

#[cfg(test)]
mod tests;
