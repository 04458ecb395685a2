use super::*;
use crate::commands::event::Outbox;
use crate::database::Database;
use crate::download::{ChannelGateway, DelegationRequest, HttpRetriever, QueueManager, QueueOptions, Scheduler};
use crate::settings::{QueueConfig, KEY_AUTO_DOWNLOAD, KEY_CHECK_INTERVAL_MS, KEY_MAX_DELAY_MS, KEY_MIN_DELAY_MS};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::sync::{mpsc, Mutex};

struct TestApp {
    app: AppState,
    _delegations: mpsc::Receiver<DelegationRequest>,
    outbox: mpsc::UnboundedReceiver<String>,
    dir: TempDir,
}

fn test_app_in(dir: TempDir, db: Database) -> TestApp {
    let db = Arc::new(db);
    let (gateway, delegations) = ChannelGateway::new(Duration::from_secs(10));
    let gateway = Arc::new(gateway);
    let (outbox, outbox_rx) = Outbox::new();
    let manager = QueueManager::new(
        db.clone(),
        gateway.clone(),
        Arc::new(HttpRetriever::new(dir.path())),
        QueueOptions::default(),
        None,
    );
    let config = QueueConfig::default();
    let scheduler = Scheduler::new(
        db.clone(),
        manager.clone(),
        Arc::new(outbox),
        Duration::from_millis(config.check_interval_ms),
    );
    TestApp {
        app: AppState {
            db,
            manager,
            scheduler,
            gateway: Some(gateway),
            config: Mutex::new(config),
            download_dir: dir.path().to_path_buf(),
        },
        _delegations: delegations,
        outbox: outbox_rx,
        dir,
    }
}

fn test_app() -> TestApp {
    test_app_in(tempdir().unwrap(), Database::open_in_memory().unwrap())
}

async fn call(t: &TestApp, body: Value) -> Value {
    handle_line(&t.app, &body.to_string()).await
}

#[tokio::test]
async fn test_malformed_lines_are_reported() {
    let t = test_app();
    let reply = handle_line(&t.app, "{not json").await;
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().starts_with("invalid JSON"));

    let reply = call(&t, json!({"action": "launchRockets", "id": 7})).await;
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().starts_with("invalid request"));
    assert_eq!(reply["id"], 7);
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_and_status() {
    let t = test_app();
    let reply = call(
        &t,
        json!({
            "action": "addToQueue",
            "id": "r1",
            "items": [
                {"id": "1", "sourceId": "alice", "url": "https://cdn.test/1.mp4"},
                {"id": "1", "sourceId": "alice", "url": "https://cdn.test/1.mp4"}
            ]
        }),
    )
    .await;
    assert_eq!(reply["success"], true);
    assert_eq!(reply["id"], "r1");
    assert_eq!(reply["added"], 1);
    assert_eq!(reply["duplicates"], 1);

    let status = call(&t, json!({"action": "getStatus"})).await;
    assert_eq!(status["success"], true);
    assert_eq!(status["checkIntervalMs"], 3_600_000);
    assert_eq!(status["schedulerRunning"], false);
    assert_eq!(status["stats"]["totalItems"], 1);

    let stopped = call(&t, json!({"action": "stopDownloads"})).await;
    assert_eq!(stopped["success"], true);
}

#[tokio::test]
async fn test_set_check_interval_validates_and_persists() {
    let t = test_app();
    let reply = call(&t, json!({"action": "setCheckInterval", "intervalMs": 59_999})).await;
    assert_eq!(reply["success"], false);
    assert_eq!(t.app.config.lock().await.check_interval_ms, 3_600_000);

    let reply = call(&t, json!({"action": "setCheckInterval", "intervalMs": 120_000})).await;
    assert_eq!(reply["success"], true);
    assert_eq!(t.app.config.lock().await.check_interval_ms, 120_000);
    assert_eq!(t.app.scheduler.interval(), Duration::from_secs(120));
    assert_eq!(
        t.app.db.get_setting(KEY_CHECK_INTERVAL_MS, Value::Null).unwrap(),
        json!(120_000)
    );
}

#[tokio::test]
async fn test_set_delays_validates_and_persists() {
    let t = test_app();
    let reply = call(&t, json!({"action": "setDelays", "minDelayMs": 5_000, "maxDelayMs": 1_000})).await;
    assert_eq!(reply["success"], false);

    let reply = call(&t, json!({"action": "setDelays", "minDelayMs": 1_000, "maxDelayMs": 5_000})).await;
    assert_eq!(reply["success"], true);
    assert_eq!(t.app.db.get_setting(KEY_MIN_DELAY_MS, Value::Null).unwrap(), json!(1_000));
    assert_eq!(t.app.db.get_setting(KEY_MAX_DELAY_MS, Value::Null).unwrap(), json!(5_000));
    let cfg = t.app.config.lock().await;
    assert_eq!((cfg.min_delay_ms, cfg.max_delay_ms), (1_000, 5_000));
}

#[tokio::test(start_paused = true)]
async fn test_toggle_auto_mode_drives_scheduler() {
    let t = test_app();

    let off = call(&t, json!({"action": "toggleAutoMode"})).await;
    assert_eq!(off["success"], true);
    assert_eq!(off["autoDownload"], false);
    assert!(off["stopped"].is_null());
    assert!(!t.app.scheduler.is_running());
    assert_eq!(t.app.db.get_setting(KEY_AUTO_DOWNLOAD, Value::Null).unwrap(), json!(false));

    let on = call(&t, json!({"action": "toggleAutoMode"})).await;
    assert_eq!(on["autoDownload"], true);
    assert!(t.app.scheduler.is_running());
    assert!(t.app.manager.auto_download());
    t.app.scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn test_toggle_off_stops_active_drain() {
    let t = test_app();
    call(
        &t,
        json!({"action": "enqueue", "items": [
            {"id": "1", "url": "https://cdn.test/1.mp4"},
            {"id": "2", "url": "https://cdn.test/2.mp4"}
        ]}),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(t.app.manager.is_processing());

    let off = call(&t, json!({"action": "toggleAutoMode"})).await;
    assert_eq!(off["stopped"]["cleared"], 1);
    assert_eq!(off["stopped"]["wasProcessing"], true);
    assert!(!t.app.manager.is_processing());
}

#[tokio::test]
async fn test_check_now_requests_a_scan() {
    let mut t = test_app();
    let reply = call(&t, json!({"action": "checkNow"})).await;
    assert_eq!(reply["success"], true);
    let at = reply["lastCheckTime"].as_i64().unwrap();
    assert!(!t.app.scheduler.is_running());

    let line = t.outbox.try_recv().unwrap();
    let event: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(event["event"], "scanRequested");
    assert_eq!(t.app.manager.status().await.last_check_time, Some(at));
}

#[tokio::test]
async fn test_toggle_auto_mode_reverts_when_store_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("h.db");
    let db = Database::open(&path).unwrap();
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute_batch("DROP TABLE settings;")
        .unwrap();
    let t = test_app_in(dir, db);

    let reply = call(&t, json!({"action": "toggleAutoMode"})).await;
    assert_eq!(reply["success"], false);
    assert!(t.app.config.lock().await.auto_download);
    assert!(!t.app.scheduler.is_running());
}

#[tokio::test]
async fn test_sources_received_keeps_enabled_flag() {
    let t = test_app();
    t.app.db.upsert_source(&Source::new("s1", "Alice")).unwrap();
    t.app.db.toggle_source_enabled("s1").unwrap();

    let reply = call(
        &t,
        json!({"action": "sourcesReceived", "sources": [
            {"id": "s1", "name": "Alice renamed", "enabled": true},
            {"id": "s2", "name": "Bob"}
        ]}),
    )
    .await;
    assert_eq!(reply["saved"], 2);

    let s1 = t.app.db.get_source("s1").unwrap().unwrap();
    assert!(!s1.enabled);
    assert_eq!(s1.name, "Alice renamed");

    let all = call(&t, json!({"action": "getAllSources"})).await;
    assert_eq!(all["sources"].as_array().unwrap().len(), 2);
    let enabled = call(&t, json!({"action": "getAllSources", "filter": {"enabledOnly": true}})).await;
    assert_eq!(enabled["sources"].as_array().unwrap().len(), 1);

    let toggled = call(&t, json!({"action": "toggleSource", "sourceId": "s1"})).await;
    assert_eq!(toggled["source"]["enabled"], true);
    let missing = call(&t, json!({"action": "toggleSource", "sourceId": "nope"})).await;
    assert_eq!(missing["success"], false);

    let deleted = call(&t, json!({"action": "deleteSource", "sourceId": "s2"})).await;
    assert_eq!(deleted["deleted"], true);
}

#[tokio::test]
async fn test_item_queries_and_delete_with_file() {
    let t = test_app();
    t.app.db.upsert_source(&Source::new("alice", "Alice")).unwrap();
    t.app
        .db
        .upsert_item(&Item::new("1", "alice", "one", "https://cdn.test/1.mp4"), true)
        .unwrap();
    t.app
        .db
        .upsert_item(&Item::new("2", "alice", "two", "https://cdn.test/2.mp4"), true)
        .unwrap();
    t.app.db.mark_item_retrieved("1", "one.mp4").unwrap();
    let file = t.dir.path().join("one.mp4");
    std::fs::write(&file, b"clip").unwrap();

    let pending = call(
        &t,
        json!({"action": "getSourceItems", "sourceId": "alice", "filter": "pendingOnly"}),
    )
    .await;
    assert_eq!(pending["items"].as_array().unwrap().len(), 1);
    assert_eq!(pending["items"][0]["id"], "2");

    let retrieved = call(&t, json!({"action": "getAllRetrievedItems"})).await;
    assert_eq!(retrieved["items"][0]["filename"], "one.mp4");

    let stats = call(&t, json!({"action": "getStats"})).await;
    assert_eq!(stats["stats"]["retrievedItems"], 1);
    assert_eq!(stats["stats"]["pendingItems"], 1);

    let deleted = call(&t, json!({"action": "deleteItem", "itemId": "1", "deleteFile": true})).await;
    assert_eq!(deleted["deleted"], true);
    assert_eq!(deleted["fileRemoved"], true);
    assert!(!Path::new(&file).exists());

    let again = call(&t, json!({"action": "deleteItem", "itemId": "1"})).await;
    assert_eq!(again["deleted"], false);
}

#[tokio::test]
async fn test_delete_item_keeps_file_when_store_delete_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("h.db");
    let db = Database::open(&path).unwrap();
    db.upsert_item(&Item::new("1", "alice", "one", "https://cdn.test/1.mp4"), true)
        .unwrap();
    db.mark_item_retrieved("1", "one.mp4").unwrap();
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER keep_items BEFORE DELETE ON items BEGIN SELECT RAISE(ABORT, 'read only'); END;",
        )
        .unwrap();
    let t = test_app_in(dir, db);
    let file = t.dir.path().join("one.mp4");
    std::fs::write(&file, b"clip").unwrap();

    let reply = call(&t, json!({"action": "deleteItem", "itemId": "1", "deleteFile": true})).await;
    assert_eq!(reply["success"], false);
    assert!(file.exists());
    assert!(t.app.db.get_item("1").unwrap().unwrap().retrieved);
}

#[tokio::test]
async fn test_delegation_result_and_cancel_for_unknown_token() {
    let t = test_app();
    let token = crate::download::TaskToken::new();
    let reply = call(&t, json!({"action": "delegationResult", "token": token, "success": true})).await;
    assert_eq!(reply["success"], true);
    assert_eq!(reply["resolved"], false);

    let reply = call(&t, json!({"action": "cancelTask", "token": token})).await;
    assert_eq!(reply["cancelled"], false);
}

#[tokio::test]
async fn test_client_log_is_accepted() {
    let t = test_app();
    let reply = call(
        &t,
        json!({"action": "clientLog", "level": "warn", "message": "scan slow", "context": {"page": 2}}),
    )
    .await;
    assert_eq!(reply, json!({"success": true}));
}
