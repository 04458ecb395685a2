use super::*;
use chrono::Duration;
use serde_json::json;
use std::cell::Cell;
use tempfile::tempdir;

fn item(id: &str, source: &str) -> Item {
    Item::new(id, source, format!("title {id}"), format!("https://cdn.example/{id}.mp4"))
}

#[test]
fn test_create_new_database_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("harvester.db");

    let db = Database::open(&path).unwrap();
    assert!(path.exists());
    assert!(db.get_item("missing").unwrap().is_none());
}

#[test]
fn test_upsert_and_get_item() {
    let db = Database::open_in_memory().unwrap();
    let saved = db.upsert_item(&item("1", "alice"), false).unwrap();

    let loaded = db.get_item("1").unwrap().unwrap();
    assert_eq!(loaded, saved);
    assert_eq!(loaded.author, "Unknown author");
    assert!(!db.is_item_retrieved("1").unwrap());
    assert!(!db.is_item_retrieved("nope").unwrap());
}

#[test]
fn test_upsert_rejects_blank_id() {
    let db = Database::open_in_memory().unwrap();
    let err = db.upsert_item(&item("   ", "alice"), false).unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));
}

#[test]
fn test_upsert_fills_unknown_source() {
    let db = Database::open_in_memory().unwrap();
    let saved = db.upsert_item(&item("1", ""), false).unwrap();
    assert_eq!(saved.source_id, UNKNOWN_SOURCE);
}

#[test]
fn test_preserve_completed_status_keeps_retrieval_fields() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_item(&item("1", "alice"), true).unwrap();
    let done = db.mark_item_retrieved("1", "alice_clip_1.mp4").unwrap().unwrap();
    assert!(done.retrieved);

    let mut rediscovered = item("1", "alice");
    rediscovered.title = "new title".into();
    rediscovered.retrieved = false;
    rediscovered.filename = None;
    let stored = db.upsert_item(&rediscovered, true).unwrap();

    assert!(stored.retrieved);
    assert_eq!(stored.retrieved_at, done.retrieved_at);
    assert_eq!(stored.filename.as_deref(), Some("alice_clip_1.mp4"));
    assert_eq!(stored.title, "new title");
    assert_eq!(db.get_item("1").unwrap().unwrap(), stored);
}

#[test]
fn test_upsert_without_preserve_overwrites_status() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_item(&item("1", "alice"), false).unwrap();
    db.mark_item_retrieved("1", "f.mp4").unwrap();

    let stored = db.upsert_item(&item("1", "alice"), false).unwrap();
    assert!(!stored.retrieved);
    assert!(stored.filename.is_none());
}

#[test]
fn test_first_seen_is_kept_across_upserts() {
    let db = Database::open_in_memory().unwrap();
    let first = db.upsert_item(&item("1", "alice"), true).unwrap();

    let mut again = item("1", "alice");
    again.first_seen_at = first.first_seen_at + Duration::days(3);
    let stored = db.upsert_item(&again, true).unwrap();
    assert_eq!(stored.first_seen_at, first.first_seen_at);
}

#[test]
fn test_new_item_bumps_cached_source_count_once() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_source(&Source::new("alice", "Alice")).unwrap();

    db.upsert_item(&item("1", "alice"), true).unwrap();
    db.upsert_item(&item("1", "alice"), true).unwrap();
    db.upsert_item(&item("2", "alice"), true).unwrap();

    let cached = db
        .list_sources(SourceFilter { enabled_only: false, with_item_count: false })
        .unwrap();
    assert_eq!(cached[0].item_count, 2);
}

#[test]
fn test_mark_missing_item_returns_none() {
    let db = Database::open_in_memory().unwrap();
    assert!(db.mark_item_retrieved("ghost", "x.mp4").unwrap().is_none());
    assert!(db.get_item("ghost").unwrap().is_none());
}

#[test]
fn test_list_items_by_source_orders_and_filters() {
    let db = Database::open_in_memory().unwrap();
    let now = Utc::now();
    for (i, id) in ["a", "b", "c"].iter().enumerate() {
        let mut it = item(id, "alice");
        it.created_at = now - Duration::hours(i as i64);
        db.upsert_item(&it, true).unwrap();
    }
    db.upsert_item(&item("other", "bob"), true).unwrap();
    db.mark_item_retrieved("b", "b.mp4").unwrap();

    let all: Vec<String> = db
        .list_items_by_source("alice", ItemFilter::All)
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(all, vec!["a", "b", "c"]);

    let done = db.list_items_by_source("alice", ItemFilter::RetrievedOnly).unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, "b");

    let pending: Vec<String> = db
        .list_items_by_source("alice", ItemFilter::PendingOnly)
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(pending, vec!["a", "c"]);
}

#[test]
fn test_list_all_retrieved_newest_first() {
    let db = Database::open_in_memory().unwrap();
    let older = Utc::now() - Duration::days(1);
    let mut a = item("a", "alice");
    a.retrieved = true;
    a.retrieved_at = Some(older);
    db.upsert_item(&a, false).unwrap();
    db.upsert_item(&item("b", "alice"), false).unwrap();
    db.upsert_item(&item("c", "alice"), false).unwrap();
    db.mark_item_retrieved("b", "b.mp4").unwrap();

    let ids: Vec<String> = db
        .list_all_retrieved_items()
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(ids, vec!["b", "a"]);
}

#[test]
fn test_delete_item_and_by_source() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_item(&item("1", "alice"), false).unwrap();
    db.upsert_item(&item("2", "alice"), false).unwrap();
    db.upsert_item(&item("3", "bob"), false).unwrap();

    assert!(db.delete_item("3").unwrap());
    assert!(!db.delete_item("3").unwrap());
    assert_eq!(db.delete_items_by_source("alice").unwrap(), 2);
    assert_eq!(db.compute_stats().unwrap().total_items, 0);
}

#[test]
fn test_delete_source_cascades_to_items() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_source(&Source::new("alice", "Alice")).unwrap();
    db.upsert_source(&Source::new("bob", "Bob")).unwrap();
    db.upsert_item(&item("1", "alice"), false).unwrap();
    db.upsert_item(&item("2", "alice"), false).unwrap();
    db.upsert_item(&item("3", "bob"), false).unwrap();

    assert!(db.delete_source("alice").unwrap());
    assert!(db.get_source("alice").unwrap().is_none());
    assert!(db.get_item("1").unwrap().is_none());
    assert!(db.get_item("2").unwrap().is_none());
    assert!(db.get_item("3").unwrap().is_some());
}

#[test]
fn test_upsert_source_keeps_added_at_and_defaults_name() {
    let db = Database::open_in_memory().unwrap();
    let first = db.upsert_source(&Source::new("alice", "")).unwrap();
    assert_eq!(first.name, "Unknown source");

    let mut renamed = Source::new("alice", "Alice");
    renamed.added_at = first.added_at + Duration::days(10);
    let stored = db.upsert_source(&renamed).unwrap();
    assert_eq!(stored.name, "Alice");
    assert_eq!(stored.added_at, first.added_at);
}

#[test]
fn test_upsert_sources_skips_invalid_entries() {
    let db = Database::open_in_memory().unwrap();
    let saved = db
        .upsert_sources(&[Source::new("", "nobody"), Source::new("alice", "Alice")])
        .unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].id, "alice");
}

#[test]
fn test_list_sources_counts_and_filters() {
    let db = Database::open_in_memory().unwrap();
    let mut alice = Source::new("alice", "Alice");
    alice.added_at = Utc::now() - Duration::days(2);
    db.upsert_source(&alice).unwrap();
    db.upsert_source(&Source::new("bob", "Bob")).unwrap();
    db.upsert_item(&item("1", "alice"), false).unwrap();
    db.upsert_item(&item("2", "alice"), false).unwrap();

    let all = db.list_sources(SourceFilter::default()).unwrap();
    assert_eq!(all.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["bob", "alice"]);
    assert_eq!(all[1].item_count, 2);

    let toggled = db.toggle_source_enabled("bob").unwrap().unwrap();
    assert!(!toggled.enabled);
    let enabled = db
        .list_sources(SourceFilter { enabled_only: true, with_item_count: true })
        .unwrap();
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].id, "alice");

    assert!(db.toggle_source_enabled("ghost").unwrap().is_none());
}

#[test]
fn test_touch_source_checked() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_source(&Source::new("alice", "Alice")).unwrap();
    let touched = db.touch_source_checked("alice").unwrap().unwrap();
    assert!(touched.last_checked_at.is_some());
    assert!(db.touch_source_checked("ghost").unwrap().is_none());
}

#[test]
fn test_settings_roundtrip_and_defaults() {
    let db = Database::open_in_memory().unwrap();
    assert_eq!(db.get_setting("autoDownload", json!(true)).unwrap(), json!(true));

    db.save_setting("  autoDownload ", &json!(false)).unwrap();
    assert_eq!(db.get_setting("autoDownload", json!(true)).unwrap(), json!(false));
    assert!(!db.get_setting_as::<bool>("autoDownload", true).unwrap());

    db.save_setting("lastCheckTime", &Value::Null).unwrap();
    assert_eq!(db.get_setting_as::<Option<i64>>("lastCheckTime", Some(1)).unwrap(), None);
    assert_eq!(db.get_setting("   ", json!(7)).unwrap(), json!(7));
}

#[test]
fn test_save_setting_with_blank_key_fails_without_writing() {
    let db = Database::open_in_memory().unwrap();
    let err = db.save_setting("   ", &json!(1)).unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));

    let rows: i64 = db
        .run(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM settings", [], |r| r.get(0))?))
        .unwrap();
    assert_eq!(rows, 0);
}

#[test]
fn test_typed_setting_with_wrong_type_is_an_error() {
    let db = Database::open_in_memory().unwrap();
    db.save_setting("minDelayMs", &json!("soon")).unwrap();
    let err = db.get_setting_as::<u64>("minDelayMs", 1).unwrap_err();
    assert!(matches!(err, StoreError::Serialization(_)));
}

#[test]
fn test_stats_are_consistent() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_source(&Source::new("alice", "Alice")).unwrap();
    let mut bob = Source::new("bob", "Bob");
    bob.enabled = false;
    db.upsert_source(&bob).unwrap();

    for id in ["1", "2", "3"] {
        db.upsert_item(&item(id, "alice"), true).unwrap();
        let stats = db.compute_stats().unwrap();
        assert_eq!(stats.total_items, stats.retrieved_items + stats.pending_items);
    }
    db.upsert_item(&item("4", "unknown"), true).unwrap();
    db.mark_item_retrieved("1", "1.mp4").unwrap();
    db.mark_item_retrieved("4", "4.mp4").unwrap();

    let stats = db.compute_stats().unwrap();
    assert_eq!(stats.total_sources, 2);
    assert_eq!(stats.enabled_sources, 1);
    assert_eq!(stats.total_items, 4);
    assert_eq!(stats.retrieved_items, 2);
    assert_eq!(stats.pending_items, 2);

    let alice = &stats.per_source["alice"];
    assert_eq!((alice.total_items, alice.retrieved_items, alice.pending_items), (3, 1, 2));
    let bob = &stats.per_source["bob"];
    assert_eq!((bob.total_items, bob.enabled), (0, false));
}

#[test]
fn test_transient_error_is_retried_once_then_succeeds() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("h.db")).unwrap();
    db.upsert_item(&item("1", "alice"), false).unwrap();

    let calls = Cell::new(0);
    let found = db
        .run(|conn| {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                return Err(StoreError::ConnectionLost);
            }
            Ok(select_item(conn, "1")?)
        })
        .unwrap();

    assert_eq!(calls.get(), 2);
    assert_eq!(db.reconnect_count(), 1);
    assert_eq!(found.unwrap().id, "1");
}

#[test]
fn test_second_transient_error_propagates() {
    let db = Database::open_in_memory().unwrap();
    let calls = Cell::new(0);
    let result: StoreResult<()> = db.run(|_| {
        calls.set(calls.get() + 1);
        Err(StoreError::ConnectionLost)
    });

    assert!(matches!(result, Err(StoreError::ConnectionLost)));
    assert_eq!(calls.get(), 2);
}

#[test]
fn test_non_transient_error_is_not_retried() {
    let db = Database::open_in_memory().unwrap();
    let calls = Cell::new(0);
    let result: StoreResult<()> = db.run(|_| {
        calls.set(calls.get() + 1);
        Err(StoreError::InvalidArgument("bad".into()))
    });

    assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    assert_eq!(calls.get(), 1);
    assert_eq!(db.reconnect_count(), 0);
}

#[test]
fn test_busy_sqlite_error_is_transient() {
    let busy = rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        None,
    );
    assert!(StoreError::from(busy).is_transient());

    let constraint = rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
        None,
    );
    assert!(!StoreError::from(constraint).is_transient());
}

#[test]
fn test_invalidated_connection_reopens_with_data_intact() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("h.db")).unwrap();
    db.upsert_item(&item("1", "alice"), false).unwrap();

    db.invalidate_connection();
    assert!(db.get_item("1").unwrap().is_some());
}
