use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Source id given to items whose owner is not known.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// How many times an operation is re-run after a transient connection failure.
const TRANSIENT_RETRIES: u32 = 1;

/* --------------------------------- errors --------------------------------- */

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database connection was closed or invalidated")]
    ConnectionLost,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store task failed: {0}")]
    TaskJoin(String),
}

impl StoreError {
    /// Connection-state failures that a fresh connection can recover from.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionLost => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/* ----------------------------- enums & models ----------------------------- */

fn unknown_source() -> String {
    UNKNOWN_SOURCE.to_string()
}

fn default_true() -> bool {
    true
}

/// A discovered content unit, tracked from pending to retrieved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    #[serde(default = "unknown_source")]
    pub source_id: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub cover_url: String,
    /// Seconds.
    #[serde(default)]
    pub duration: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retrieved: bool,
    #[serde(default)]
    pub retrieved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default = "Utc::now")]
    pub first_seen_at: DateTime<Utc>,
}

impl Item {
    pub fn new(id: impl Into<String>, source_id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Item {
            id: id.into(),
            source_id: source_id.into(),
            author: String::new(),
            title: title.into(),
            url: url.into(),
            cover_url: String::new(),
            duration: 0,
            created_at: now,
            retrieved: false,
            retrieved_at: None,
            filename: None,
            first_seen_at: now,
        }
    }

    /// Validate the id and fill in display defaults before the record is written.
    fn normalized(&self) -> StoreResult<Item> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(StoreError::InvalidArgument("item id must be a non-empty string".into()));
        }
        let mut item = self.clone();
        item.id = id.to_string();
        if item.source_id.trim().is_empty() {
            item.source_id = unknown_source();
        }
        if item.author.trim().is_empty() {
            item.author = "Unknown author".into();
        }
        if item.title.trim().is_empty() {
            item.title = "Untitled".into();
        }
        Ok(item)
    }
}

/// The owner of a set of items; disabled sources are skipped by discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Cached; `list_sources` recomputes it from the items table.
    #[serde(default)]
    pub item_count: i64,
}

impl Source {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Source {
            id: id.into(),
            name: name.into(),
            avatar: String::new(),
            enabled: true,
            added_at: Utc::now(),
            last_checked_at: None,
            item_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ItemFilter {
    #[default]
    All,
    RetrievedOnly,
    PendingOnly,
}

impl ItemFilter {
    fn clause(self) -> &'static str {
        match self {
            ItemFilter::All => "",
            ItemFilter::RetrievedOnly => " AND retrieved = 1",
            ItemFilter::PendingOnly => " AND retrieved = 0",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceFilter {
    pub enabled_only: bool,
    pub with_item_count: bool,
}

impl Default for SourceFilter {
    fn default() -> Self {
        SourceFilter {
            enabled_only: false,
            with_item_count: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub name: String,
    pub enabled: bool,
    pub total_items: u64,
    pub retrieved_items: u64,
    pub pending_items: u64,
}

/// Aggregate counters. `retrieved_items + pending_items == total_items` always holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_sources: u64,
    pub enabled_sources: u64,
    pub total_items: u64,
    pub retrieved_items: u64,
    pub pending_items: u64,
    pub per_source: BTreeMap<String, SourceStats>,
}

/* ------------------------------ row mapping ------------------------------ */

const ITEM_COLUMNS: &str = "id, source_id, author, title, url, cover_url, duration, created_at, retrieved, retrieved_at, filename, first_seen_at";

fn item_from_row(row: &Row) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        source_id: row.get(1)?,
        author: row.get(2)?,
        title: row.get(3)?,
        url: row.get(4)?,
        cover_url: row.get(5)?,
        duration: row.get(6)?,
        created_at: row.get(7)?,
        retrieved: row.get(8)?,
        retrieved_at: row.get(9)?,
        filename: row.get(10)?,
        first_seen_at: row.get(11)?,
    })
}

const SOURCE_COLUMNS: &str = "id, name, avatar, enabled, added_at, last_checked_at, item_count";

fn source_from_row(row: &Row) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        avatar: row.get(2)?,
        enabled: row.get(3)?,
        added_at: row.get(4)?,
        last_checked_at: row.get(5)?,
        item_count: row.get(6)?,
    })
}

fn select_item(conn: &Connection, id: &str) -> rusqlite::Result<Option<Item>> {
    conn.query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
        [id],
        item_from_row,
    )
    .optional()
}

fn select_source(conn: &Connection, id: &str) -> rusqlite::Result<Option<Source>> {
    conn.query_row(
        &format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1"),
        [id],
        source_from_row,
    )
    .optional()
}

fn write_item(tx: &Transaction, item: &Item) -> rusqlite::Result<()> {
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO items ({ITEM_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            item.id,
            item.source_id,
            item.author,
            item.title,
            item.url,
            item.cover_url,
            item.duration,
            item.created_at,
            item.retrieved,
            item.retrieved_at,
            item.filename,
            item.first_seen_at,
        ],
    )?;
    Ok(())
}

/// Setting keys are trimmed; an all-whitespace key is treated as missing.
fn normalize_key(key: &str) -> Option<&str> {
    let k = key.trim();
    (!k.is_empty()).then_some(k)
}

/* -------------------------------- database -------------------------------- */

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Durable store for items, sources and settings.
///
/// One shared connection sits behind a mutex. Every public operation goes
/// through [`Database::run`], which reopens the connection and retries once
/// when SQLite reports that the connection went away.
pub struct Database {
    location: Location,
    conn: Mutex<Option<Connection>>,
    reconnects: AtomicU32,
}

impl Database {
    /// Open the database at its default location in the user's config dir.
    pub fn open_default() -> StoreResult<Self> {
        Self::open(Self::default_db_path()?)
    }

    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database {
            location: Location::File(path),
            conn: Mutex::new(None),
            reconnects: AtomicU32::new(0),
        };
        db.run(|_| Ok(()))?;
        Ok(db)
    }

    /// In-memory database. A reconnect starts from an empty schema.
    pub fn open_in_memory() -> StoreResult<Self> {
        let db = Database {
            location: Location::Memory,
            conn: Mutex::new(None),
            reconnects: AtomicU32::new(0),
        };
        db.run(|_| Ok(()))?;
        Ok(db)
    }

    pub fn default_db_path() -> StoreResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StoreError::InvalidArgument("could not find config directory".into()))?;
        let app_config_dir = config_dir.join("clip-harvester");
        std::fs::create_dir_all(&app_config_dir)?;
        Ok(app_config_dir.join("harvester.db"))
    }

    /// Number of times the connection was discarded and reopened.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Drop the current connection; the next operation opens a new one.
    pub fn invalidate_connection(&self) {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = guard.take() {
            if let Err((_, e)) = conn.close() {
                warn!("closing sqlite connection failed: {e}");
            }
        }
    }

    fn connect(&self) -> StoreResult<Connection> {
        let conn = match &self.location {
            Location::File(path) => {
                let conn = Connection::open(path)?;
                conn.execute_batch("PRAGMA journal_mode=WAL;")?;
                conn
            }
            Location::Memory => Connection::open_in_memory()?,
        };
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_tables(&conn)?;
        debug!("sqlite connection opened ({:?})", self.location);
        Ok(conn)
    }

    /// Run `op` against the shared connection, reconnecting once on a transient failure.
    ///
    /// The mutex is held for the whole call, including a reconnect, so a caller
    /// waiting on it observes either the old connection or the new one.
    pub(crate) fn run<T>(&self, mut op: impl FnMut(&mut Connection) -> StoreResult<T>) -> StoreResult<T> {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut attempt = 0;
        loop {
            if guard.is_none() {
                *guard = Some(self.connect()?);
            }
            let Some(conn) = guard.as_mut() else {
                return Err(StoreError::ConnectionLost);
            };
            match op(conn) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < TRANSIENT_RETRIES => {
                    attempt += 1;
                    warn!("store operation failed ({err}); reopening connection and retrying (attempt {attempt})");
                    if let Some(stale) = guard.take() {
                        let _ = stale.close();
                    }
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /* ------------------------------- items ------------------------------- */

    /// Insert or replace an item.
    ///
    /// With `preserve_completed_status`, an already retrieved record keeps its
    /// `retrieved` flag, timestamp and filename whatever the incoming values.
    /// A brand-new item bumps the cached count of its (known) source.
    pub fn upsert_item(&self, item: &Item, preserve_completed_status: bool) -> StoreResult<Item> {
        let incoming = item.normalized()?;
        self.run(|conn| {
            let tx = conn.transaction()?;
            let existing = select_item(&tx, &incoming.id)?;
            let mut record = incoming.clone();
            match &existing {
                Some(prev) => {
                    record.first_seen_at = prev.first_seen_at;
                    if preserve_completed_status && prev.retrieved {
                        record.retrieved = true;
                        record.retrieved_at = prev.retrieved_at;
                        record.filename = prev.filename.clone();
                    }
                }
                None if record.source_id != UNKNOWN_SOURCE => {
                    tx.execute(
                        "UPDATE sources SET item_count = item_count + 1 WHERE id = ?1",
                        [&record.source_id],
                    )?;
                }
                None => {}
            }
            write_item(&tx, &record)?;
            tx.commit()?;
            Ok(record)
        })
    }

    pub fn upsert_items(&self, items: &[Item], preserve_completed_status: bool) -> StoreResult<Vec<Item>> {
        items
            .iter()
            .map(|item| self.upsert_item(item, preserve_completed_status))
            .collect()
    }

    pub fn get_item(&self, id: &str) -> StoreResult<Option<Item>> {
        self.run(|conn| Ok(select_item(conn, id)?))
    }

    pub fn is_item_retrieved(&self, id: &str) -> StoreResult<bool> {
        Ok(self.get_item(id)?.map(|i| i.retrieved).unwrap_or(false))
    }

    /// Items of a source, newest creation time first.
    pub fn list_items_by_source(&self, source_id: &str, filter: ItemFilter) -> StoreResult<Vec<Item>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM items
                  WHERE source_id = ?1{}
                  ORDER BY created_at DESC, id",
                filter.clause()
            ))?;
            let rows = stmt.query_map([source_id], item_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }

    /// Every retrieved item, most recently retrieved first.
    pub fn list_all_retrieved_items(&self) -> StoreResult<Vec<Item>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM items
                  WHERE retrieved = 1
                  ORDER BY retrieved_at DESC, id"
            ))?;
            let rows = stmt.query_map([], item_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }

    /// Returns `None` (and writes nothing) when the item does not exist.
    pub fn mark_item_retrieved(&self, id: &str, filename: &str) -> StoreResult<Option<Item>> {
        self.run(|conn| {
            let tx = conn.transaction()?;
            let Some(mut item) = select_item(&tx, id)? else {
                return Ok(None);
            };
            item.retrieved = true;
            item.retrieved_at = Some(Utc::now());
            item.filename = Some(filename.to_string());
            write_item(&tx, &item)?;
            tx.commit()?;
            Ok(Some(item))
        })
    }

    pub fn delete_item(&self, id: &str) -> StoreResult<bool> {
        self.run(|conn| Ok(conn.execute("DELETE FROM items WHERE id = ?1", [id])? > 0))
    }

    pub fn delete_items_by_source(&self, source_id: &str) -> StoreResult<usize> {
        self.run(|conn| Ok(conn.execute("DELETE FROM items WHERE source_id = ?1", [source_id])?))
    }

    /* ------------------------------ sources ------------------------------ */

    /// Insert or update a source. `added_at` and the cached item count of an
    /// existing row are kept.
    pub fn upsert_source(&self, source: &Source) -> StoreResult<Source> {
        let id = source.id.trim();
        if id.is_empty() {
            return Err(StoreError::InvalidArgument("source id must be a non-empty string".into()));
        }
        let name = if source.name.trim().is_empty() { "Unknown source" } else { source.name.as_str() };
        self.run(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO sources (id, name, avatar, enabled, added_at, last_checked_at, item_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    avatar = excluded.avatar,
                    enabled = excluded.enabled,
                    last_checked_at = COALESCE(excluded.last_checked_at, sources.last_checked_at)",
                params![
                    id,
                    name,
                    source.avatar,
                    source.enabled,
                    source.added_at,
                    source.last_checked_at,
                    source.item_count,
                ],
            )?;
            let stored = select_source(&tx, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            tx.commit()?;
            Ok(stored)
        })
    }

    /// Batch upsert; entries that fail validation are logged and skipped.
    pub fn upsert_sources(&self, sources: &[Source]) -> StoreResult<Vec<Source>> {
        let mut saved = Vec::with_capacity(sources.len());
        for source in sources {
            match self.upsert_source(source) {
                Ok(s) => saved.push(s),
                Err(StoreError::InvalidArgument(msg)) => {
                    warn!("skipping source {:?}: {msg}", source.name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(saved)
    }

    pub fn get_source(&self, id: &str) -> StoreResult<Option<Source>> {
        self.run(|conn| Ok(select_source(conn, id)?))
    }

    /// Sources, most recently added first.
    pub fn list_sources(&self, filter: SourceFilter) -> StoreResult<Vec<Source>> {
        let count_expr = if filter.with_item_count {
            "(SELECT COUNT(*) FROM items i WHERE i.source_id = s.id)"
        } else {
            "s.item_count"
        };
        let where_clause = if filter.enabled_only { "WHERE s.enabled = 1" } else { "" };
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT s.id, s.name, s.avatar, s.enabled, s.added_at, s.last_checked_at, {count_expr}
                   FROM sources s
                   {where_clause}
                  ORDER BY s.added_at DESC, s.id"
            ))?;
            let rows = stmt.query_map([], source_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }

    pub fn toggle_source_enabled(&self, id: &str) -> StoreResult<Option<Source>> {
        self.run(|conn| {
            let tx = conn.transaction()?;
            let n = tx.execute("UPDATE sources SET enabled = NOT enabled WHERE id = ?1", [id])?;
            if n == 0 {
                return Ok(None);
            }
            let source = select_source(&tx, id)?;
            tx.commit()?;
            Ok(source)
        })
    }

    /// Stamp `last_checked_at` with the current time.
    pub fn touch_source_checked(&self, id: &str) -> StoreResult<Option<Source>> {
        self.run(|conn| {
            let tx = conn.transaction()?;
            let n = tx.execute(
                "UPDATE sources SET last_checked_at = ?1 WHERE id = ?2",
                params![Utc::now(), id],
            )?;
            if n == 0 {
                return Ok(None);
            }
            let source = select_source(&tx, id)?;
            tx.commit()?;
            Ok(source)
        })
    }

    /// Delete a source and, first, every item it owns.
    pub fn delete_source(&self, id: &str) -> StoreResult<bool> {
        self.run(|conn| {
            let tx = conn.transaction()?;
            let items = tx.execute("DELETE FROM items WHERE source_id = ?1", [id])?;
            let n = tx.execute("DELETE FROM sources WHERE id = ?1", [id])?;
            tx.commit()?;
            info!("deleted source {id} ({items} items)");
            Ok(n > 0)
        })
    }

    /* ------------------------------ settings ----------------------------- */

    fn setting_value(&self, key: &str) -> StoreResult<Option<Value>> {
        self.run(|conn| {
            let raw: Option<String> = conn
                .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| r.get(0))
                .optional()?;
            Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
        })
    }

    /// Read a setting; a blank key or a missing row yields `default`.
    pub fn get_setting(&self, key: &str, default: Value) -> StoreResult<Value> {
        let Some(key) = normalize_key(key) else {
            return Ok(default);
        };
        Ok(self.setting_value(key)?.unwrap_or(default))
    }

    /// Typed variant of [`Database::get_setting`].
    pub fn get_setting_as<T: DeserializeOwned>(&self, key: &str, default: T) -> StoreResult<T> {
        let Some(key) = normalize_key(key) else {
            return Ok(default);
        };
        match self.setting_value(key)? {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(default),
        }
    }

    /// Fails with `InvalidArgument` for a blank key, before touching storage.
    pub fn save_setting(&self, key: &str, value: &Value) -> StoreResult<()> {
        let Some(key) = normalize_key(key) else {
            return Err(StoreError::InvalidArgument(format!(
                "setting key must be a non-empty string (received: {key:?})"
            )));
        };
        let body = serde_json::to_string(value)?;
        self.run(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, body.as_str()],
            )?;
            Ok(())
        })?;
        debug!("setting saved: {key} = {body}");
        Ok(())
    }

    /* ------------------------------- stats ------------------------------- */

    /// Aggregate counters read inside a single transaction.
    pub fn compute_stats(&self) -> StoreResult<Stats> {
        self.run(|conn| {
            let tx = conn.transaction()?;
            let mut stats = Stats::default();

            let (total, retrieved): (i64, i64) = tx.query_row(
                "SELECT COUNT(*), COALESCE(SUM(retrieved), 0) FROM items",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            stats.total_items = total as u64;
            stats.retrieved_items = retrieved as u64;
            stats.pending_items = (total - retrieved) as u64;

            let mut per_source_counts: BTreeMap<String, (u64, u64)> = BTreeMap::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT source_id, COUNT(*), COALESCE(SUM(retrieved), 0) FROM items GROUP BY source_id",
                )?;
                let rows = stmt.query_map([], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
                })?;
                for r in rows {
                    let (id, t, d) = r?;
                    per_source_counts.insert(id, (t as u64, d as u64));
                }
            }

            {
                let mut stmt = tx.prepare("SELECT id, name, enabled FROM sources")?;
                let rows = stmt.query_map([], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, bool>(2)?))
                })?;
                for r in rows {
                    let (id, name, enabled) = r?;
                    stats.total_sources += 1;
                    if enabled {
                        stats.enabled_sources += 1;
                    }
                    let (t, d) = per_source_counts.get(&id).copied().unwrap_or((0, 0));
                    stats.per_source.insert(
                        id,
                        SourceStats {
                            name,
                            enabled,
                            total_items: t,
                            retrieved_items: d,
                            pending_items: t - d,
                        },
                    );
                }
            }

            tx.commit()?;
            Ok(stats)
        })
    }
}

/// Run a store call on tokio's blocking pool.
pub async fn blocking<T, F>(db: &Arc<Database>, f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| StoreError::TaskJoin(e.to_string()))?
}

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            avatar TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1,
            added_at TEXT NOT NULL,
            last_checked_at TEXT,
            item_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            author TEXT NOT NULL,
            title TEXT NOT NULL,
            url TEXT NOT NULL,
            cover_url TEXT NOT NULL DEFAULT '',
            duration INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            retrieved INTEGER NOT NULL DEFAULT 0,
            retrieved_at TEXT,
            filename TEXT,
            first_seen_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_items_source ON items(source_id);
        CREATE INDEX IF NOT EXISTS idx_items_retrieved ON items(retrieved);
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )
}
