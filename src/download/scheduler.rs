use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::manager::QueueManager;
use crate::database::{self, Database};
use crate::settings::KEY_LAST_CHECK_TIME;

/// Receives "go discover new items" requests.
#[async_trait]
pub trait ScanSink: Send + Sync {
    async fn request_scan(&self) -> Result<(), String>;
}

/// Periodic discovery clock for auto mode.
pub struct Scheduler {
    db: Arc<Database>,
    manager: QueueManager,
    sink: Arc<dyn ScanSink>,
    interval: Mutex<Duration>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Scheduler {
    pub fn new(db: Arc<Database>, manager: QueueManager, sink: Arc<dyn ScanSink>, interval: Duration) -> Self {
        Scheduler {
            db,
            manager,
            sink,
            interval: Mutex::new(interval),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn interval(&self) -> Duration {
        *lock(&self.interval)
    }

    /// Lift any pending queue stop, check once right away and then every
    /// interval. Returns false if the clock was already running.
    pub fn start(&self) -> bool {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        self.manager.clear_stop();

        let period = self.interval().max(Duration::from_secs(1));
        let db = Arc::clone(&self.db);
        let manager = self.manager.clone();
        let sink = Arc::clone(&self.sink);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                run_check(&db, &manager, sink.as_ref()).await;
            }
        }));
        info!("auto mode clock started; every {period:?}");
        true
    }

    pub fn stop(&self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
            info!("auto mode clock stopped");
        }
    }

    /// Apply a new interval; a running clock is restarted with it.
    pub fn restart(&self, interval: Duration) {
        *lock(&self.interval) = interval;
        if self.is_running() {
            self.stop();
            self.start();
        }
    }

    /// One check outside the clock. Returns the recorded check time.
    pub async fn check_now(&self) -> i64 {
        run_check(&self.db, &self.manager, self.sink.as_ref()).await
    }
}

async fn run_check(db: &Arc<Database>, manager: &QueueManager, sink: &dyn ScanSink) -> i64 {
    let now = Utc::now().timestamp_millis();
    manager.set_last_check_time(Some(now));
    if let Err(e) = database::blocking(db, move |db| db.save_setting(KEY_LAST_CHECK_TIME, &json!(now))).await {
        warn!("could not persist {KEY_LAST_CHECK_TIME}: {e}");
    }
    match sink.request_scan().await {
        Ok(()) => debug!("scan requested"),
        Err(e) => warn!("scan request failed: {e}"),
    }
    now
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}
