use std::fs;
use std::path::Path;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::database::{self, ItemFilter, Source, SourceFilter};
use crate::AppState;

/// Store freshly discovered sources. Known sources keep their `enabled` flag.
pub async fn sources_received(app: &AppState, sources: Vec<Source>) -> Result<Value, String> {
    let saved = database::blocking(&app.db, move |db| {
        let mut merged = Vec::with_capacity(sources.len());
        for mut source in sources {
            if let Some(existing) = db.get_source(source.id.trim())? {
                source.enabled = existing.enabled;
            }
            merged.push(source);
        }
        db.upsert_sources(&merged)
    })
    .await
    .map_err(|e| e.to_string())?;
    Ok(json!({ "saved": saved.len() }))
}

pub async fn get_all_sources(app: &AppState, filter: SourceFilter) -> Result<Value, String> {
    let sources = database::blocking(&app.db, move |db| db.list_sources(filter))
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "sources": sources }))
}

pub async fn toggle_source(app: &AppState, source_id: String) -> Result<Value, String> {
    let id = source_id.clone();
    let source = database::blocking(&app.db, move |db| db.toggle_source_enabled(&id))
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("source not found: {source_id}"))?;
    Ok(json!({ "source": source }))
}

pub async fn delete_source(app: &AppState, source_id: String) -> Result<Value, String> {
    let id = source_id.clone();
    let deleted = database::blocking(&app.db, move |db| db.delete_source(&id))
        .await
        .map_err(|e| e.to_string())?;
    if deleted {
        info!("deleted source {source_id} and its items");
    }
    Ok(json!({ "deleted": deleted }))
}

pub async fn get_source_items(app: &AppState, source_id: String, filter: ItemFilter) -> Result<Value, String> {
    let items = database::blocking(&app.db, move |db| db.list_items_by_source(&source_id, filter))
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "items": items }))
}

pub async fn get_stats(app: &AppState) -> Result<Value, String> {
    let stats = database::blocking(&app.db, |db| db.compute_stats())
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "stats": stats }))
}

pub async fn get_all_retrieved_items(app: &AppState) -> Result<Value, String> {
    let items = database::blocking(&app.db, |db| db.list_all_retrieved_items())
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "items": items }))
}

/// Remove an item record; with `delete_file`, also its file in the download
/// directory. The record goes first; the file is removed best-effort.
pub async fn delete_item(app: &AppState, item_id: String, delete_file: bool) -> Result<Value, String> {
    let id = item_id.clone();
    let item = database::blocking(&app.db, move |db| db.get_item(&id))
        .await
        .map_err(|e| e.to_string())?;
    let Some(item) = item else {
        return Ok(json!({ "deleted": false }));
    };

    let deleted = database::blocking(&app.db, move |db| db.delete_item(&item_id))
        .await
        .map_err(|e| e.to_string())?;

    let mut file_removed = false;
    if deleted && delete_file {
        if let Some(name) = item.filename.as_deref().and_then(|n| Path::new(n).file_name()) {
            let path = app.download_dir.join(name);
            match fs::remove_file(&path) {
                Ok(()) => file_removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not delete {}: {e}", path.display()),
            }
        }
    }
    Ok(json!({ "deleted": deleted, "fileRemoved": file_removed }))
}
