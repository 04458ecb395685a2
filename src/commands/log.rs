use serde_json::Value;

/// Forward a collaborator's log line into our own log under target `client`.
pub async fn client_log(level: String, message: String, context: Option<Value>) -> Result<Value, String> {
    let ctx_str = context
        .as_ref()
        .and_then(|v| serde_json::to_string(v).ok())
        .unwrap_or_else(|| "{}".to_string());

    match level.to_lowercase().as_str() {
        "error" => tracing::error!(target: "client", context=%ctx_str, "{message}"),
        "warn" | "warning" => tracing::warn!(target: "client", context=%ctx_str, "{message}"),
        "debug" => tracing::debug!(target: "client", context=%ctx_str, "{message}"),
        "trace" => tracing::trace!(target: "client", context=%ctx_str, "{message}"),
        "info" | "log" => tracing::info!(target: "client", context=%ctx_str, "{message}"),
        other => tracing::info!(target: "client", level=%other, context=%ctx_str, "{message}"),
    }
    Ok(Value::Null)
}
