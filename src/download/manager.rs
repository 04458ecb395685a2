use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::direct::{DirectRetriever, RetrievalError};
use super::gateway::{DelegationGateway, DelegationRequest};
use super::TaskToken;
use crate::database::{self, Database, Item, Stats, StoreError};
use crate::settings::{AppSettings, QueueConfig};
use crate::utils::filename::item_filename;

/// Granularity at which a pacing wait notices a stop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemStatus {
    Queued,
    Delegated,
    Retrieved,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum DownloadEvent {
    StatusChanged { item_id: String, status: ItemStatus },
    Message { item_id: String, message: String },
}

#[derive(Debug, Error)]
pub enum DelegationError {
    /// Stops the drain loop.
    #[error("retrieval aborted")]
    Aborted,
    /// Dropped item; the drain goes on.
    #[error("retrieval failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReport {
    pub added: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub queue_length: usize,
    pub drain_started: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub cleared: usize,
    pub was_processing: bool,
    pub in_flight_cancelled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueState {
    Idle,
    Draining,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightSummary {
    pub token: TaskToken,
    pub item_id: String,
    pub title: String,
    pub filename: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub state: QueueState,
    pub queue_length: usize,
    pub processing: bool,
    pub stop_requested: bool,
    pub in_flight: Vec<InFlightSummary>,
    pub stopped_total: usize,
    pub last_check_time: Option<i64>,
    pub auto_download: bool,
    pub retrieved_count: u64,
    /// `None` when the store could not be read.
    pub stats: Option<Stats>,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub confirm_delay: Duration,
    pub stop_grace: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub auto_download: bool,
    pub last_check_time: Option<i64>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        let cfg = QueueConfig::default();
        QueueOptions {
            confirm_delay: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            min_delay: Duration::from_millis(cfg.min_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            auto_download: cfg.auto_download,
            last_check_time: cfg.last_check_time,
        }
    }
}

impl QueueOptions {
    pub fn from_config(cfg: &QueueConfig, settings: &AppSettings) -> Self {
        QueueOptions {
            confirm_delay: Duration::from_millis(settings.confirm_delay_ms),
            stop_grace: Duration::from_millis(settings.stop_grace_ms),
            min_delay: Duration::from_millis(cfg.min_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            auto_download: cfg.auto_download,
            last_check_time: cfg.last_check_time,
        }
    }
}

struct InFlightTask {
    item: Item,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    filename: String,
    confirmation: Option<JoinHandle<()>>,
    /// Set once the completion write has started; the entry can no longer be
    /// cancelled and leaves the registry when the write returns.
    finalizing: bool,
}

impl InFlightTask {
    fn halt(&mut self) {
        self.cancel.cancel();
        if let Some(job) = self.confirmation.take() {
            job.abort();
        }
    }
}

struct State {
    queue: VecDeque<Item>,
    processing: bool,
    stop_requested: bool,
    /// Bumped whenever a drain starts or is stopped; a drain loop that sees a
    /// different value has been superseded.
    drain_generation: u64,
    /// Bumped on every stop so only the newest grace timer clears the flag.
    stop_generation: u64,
    in_flight: HashMap<TaskToken, InFlightTask>,
    stopped_total: usize,
    min_delay: Duration,
    max_delay: Duration,
    last_check_time: Option<i64>,
    auto_download: bool,
}

impl State {
    fn is_known(&self, id: &str) -> bool {
        self.queue.iter().any(|i| i.id == id) || self.in_flight.values().any(|t| t.item.id == id)
    }

    fn drain_is_current(&self, generation: u64) -> bool {
        !self.stop_requested && self.drain_generation == generation
    }
}

struct Inner {
    db: Arc<Database>,
    gateway: Arc<dyn DelegationGateway>,
    direct: Arc<dyn DirectRetriever>,
    events: Option<mpsc::UnboundedSender<DownloadEvent>>,
    confirm_delay: Duration,
    stop_grace: Duration,
    state: Mutex<State>,
}

enum Checked {
    Candidate { item: Item, retrieved: bool },
    Rejected { id: String, reason: String },
}

/// Paced, cancellable retrieval queue. Cheap to clone; clones share state.
///
/// Every method that spawns work (`enqueue`, `stop`, ...) must run inside a
/// Tokio runtime.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager").finish_non_exhaustive()
    }
}

impl QueueManager {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn DelegationGateway>,
        direct: Arc<dyn DirectRetriever>,
        options: QueueOptions,
        events: Option<mpsc::UnboundedSender<DownloadEvent>>,
    ) -> Self {
        let state = State {
            queue: VecDeque::new(),
            processing: false,
            stop_requested: false,
            drain_generation: 0,
            stop_generation: 0,
            in_flight: HashMap::new(),
            stopped_total: 0,
            min_delay: options.min_delay,
            max_delay: options.max_delay.max(options.min_delay),
            last_check_time: options.last_check_time,
            auto_download: options.auto_download,
        };
        QueueManager {
            inner: Arc::new(Inner {
                db,
                gateway,
                direct,
                events,
                confirm_delay: options.confirm_delay,
                stop_grace: options.stop_grace,
                state: Mutex::new(state),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: DownloadEvent) {
        if let Some(tx) = &self.inner.events {
            if tx.send(event).is_err() {
                debug!("download event dropped; no listener");
            }
        }
    }

    fn emit_status(&self, item_id: &str, status: ItemStatus) {
        self.emit(DownloadEvent::StatusChanged {
            item_id: item_id.to_string(),
            status,
        });
    }

    /* -------------------------------- enqueue -------------------------------- */

    /// Record the items as pending and queue the ones not yet retrieved or
    /// already waiting. Starts a drain when none is running.
    pub async fn enqueue(&self, items: Vec<Item>) -> Result<EnqueueReport, StoreError> {
        let incoming: Vec<Item> = items
            .into_iter()
            .map(|mut item| {
                item.retrieved = false;
                item.retrieved_at = None;
                item.filename = None;
                item
            })
            .collect();

        let checked = database::blocking(&self.inner.db, move |db| Ok(check_incoming(db, incoming))).await?;

        let mut report = EnqueueReport::default();
        let mut queued = Vec::new();
        {
            let mut st = self.state();
            for entry in checked {
                match entry {
                    Checked::Rejected { id, reason } => {
                        warn!("rejected item {id:?}: {reason}");
                        report.rejected += 1;
                    }
                    Checked::Candidate { item, retrieved } => {
                        if retrieved || st.is_known(&item.id) {
                            report.duplicates += 1;
                            continue;
                        }
                        queued.push(item.id.clone());
                        st.queue.push_back(item);
                        report.added += 1;
                    }
                }
            }
            report.queue_length = st.queue.len();
        }

        for id in &queued {
            self.emit_status(id, ItemStatus::Queued);
        }
        report.drain_started = self.maybe_start_drain();
        info!(
            "enqueue: added={} duplicates={} rejected={} queue_length={}",
            report.added, report.duplicates, report.rejected, report.queue_length
        );
        Ok(report)
    }

    /// Spawn a drain unless one is running, a stop is in effect, or there is nothing to do.
    fn maybe_start_drain(&self) -> bool {
        let generation = {
            let mut st = self.state();
            if st.processing || st.stop_requested || st.queue.is_empty() {
                return false;
            }
            st.processing = true;
            st.drain_generation += 1;
            st.drain_generation
        };
        let this = self.clone();
        tokio::spawn(async move { this.process_queue(generation).await });
        true
    }

    /* ------------------------------- drain loop ------------------------------ */

    async fn process_queue(&self, generation: u64) {
        debug!(generation, "drain started");
        loop {
            let item = {
                let mut st = self.state();
                let next = if st.drain_is_current(generation) {
                    st.queue.pop_front()
                } else {
                    None
                };
                match next {
                    Some(item) => item,
                    None => {
                        if st.drain_generation == generation {
                            st.processing = false;
                        }
                        debug!(generation, "drain finished");
                        return;
                    }
                }
            };

            let id = item.id.clone();
            match self.delegate_retrieval(item).await {
                Ok(()) => {}
                Err(DelegationError::Aborted) => {
                    info!("retrieval of {id} aborted; halting drain");
                    self.finish_drain(generation);
                    return;
                }
                Err(e) => {
                    warn!("item {id} dropped: {e}");
                    self.emit(DownloadEvent::Message {
                        item_id: id.clone(),
                        message: e.to_string(),
                    });
                }
            }

            let pause = {
                let st = self.state();
                if st.queue.is_empty() || !st.drain_is_current(generation) {
                    None
                } else {
                    Some(pick_delay(st.min_delay, st.max_delay))
                }
            };
            if let Some(pause) = pause {
                debug!("waiting {pause:?} before the next item");
                if !self.wait_unless_stopped(pause, generation).await {
                    self.finish_drain(generation);
                    return;
                }
            }
        }
    }

    fn finish_drain(&self, generation: u64) {
        let mut st = self.state();
        if st.drain_generation == generation {
            st.processing = false;
        }
    }

    /// Returns false if the drain was stopped or superseded during the wait.
    async fn wait_unless_stopped(&self, pause: Duration, generation: u64) -> bool {
        let deadline = Instant::now() + pause;
        loop {
            if !self.state().drain_is_current(generation) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /* ------------------------------- delegation ------------------------------ */

    async fn delegate_retrieval(&self, item: Item) -> Result<(), DelegationError> {
        let token = TaskToken::new();
        let cancel = CancellationToken::new();
        let filename = item_filename(&item);
        {
            let mut st = self.state();
            if st.stop_requested {
                return Err(DelegationError::Aborted);
            }
            st.in_flight.insert(
                token,
                InFlightTask {
                    item: item.clone(),
                    cancel: cancel.clone(),
                    started_at: Utc::now(),
                    filename: filename.clone(),
                    confirmation: None,
                    finalizing: false,
                },
            );
        }

        if item.url.trim().is_empty() {
            self.state().in_flight.remove(&token);
            self.emit_status(&item.id, ItemStatus::Failed);
            return Err(DelegationError::Failed(format!("item {} has no url", item.id)));
        }

        self.emit_status(&item.id, ItemStatus::Delegated);

        let request = DelegationRequest {
            token,
            item: item.clone(),
            filename,
        };
        let result = self.inner.gateway.delegate(request, cancel.clone()).await;

        if cancel.is_cancelled() {
            self.abandon(&token);
            let st = self.state();
            return Err(self.cancelled_error(&st));
        }

        match result {
            Ok(outcome) if outcome.aborted => {
                self.abandon(&token);
                self.emit_status(&item.id, ItemStatus::Cancelled);
                Err(DelegationError::Aborted)
            }
            Ok(outcome) if outcome.success => {
                let mut st = self.state();
                let Some(task) = st.in_flight.get_mut(&token) else {
                    return Err(self.cancelled_error(&st));
                };
                if let Some(hint) = outcome.filename_hint.filter(|h| !h.trim().is_empty()) {
                    task.filename = hint;
                }
                task.confirmation = Some(self.schedule_confirmation(token));
                debug!(%token, "client accepted {}", item.id);
                Ok(())
            }
            Ok(_) => {
                info!("client declined {}; retrieving directly", item.id);
                self.retrieve_directly(token, &item, cancel).await
            }
            Err(e) => {
                warn!("delegation of {} failed ({e}); retrieving directly", item.id);
                self.retrieve_directly(token, &item, cancel).await
            }
        }
    }

    /// A stop turns cancellation into an abort; a single-task cancel does not.
    fn cancelled_error(&self, st: &State) -> DelegationError {
        if st.stop_requested {
            DelegationError::Aborted
        } else {
            DelegationError::Failed("task cancelled".into())
        }
    }

    fn abandon(&self, token: &TaskToken) {
        let mut st = self.state();
        if let Some(mut task) = st.in_flight.remove(token) {
            task.halt();
            st.stopped_total += 1;
        }
    }

    async fn retrieve_directly(
        &self,
        token: TaskToken,
        item: &Item,
        cancel: CancellationToken,
    ) -> Result<(), DelegationError> {
        let filename = {
            let st = self.state();
            match st.in_flight.get(&token) {
                Some(task) => task.filename.clone(),
                None => return Err(self.cancelled_error(&st)),
            }
        };

        let result = self.inner.direct.retrieve(&item.url, &filename, cancel).await;
        {
            let mut st = self.state();
            let claimed = result.is_ok()
                && st
                    .in_flight
                    .get_mut(&token)
                    .map(|task| task.finalizing = true)
                    .is_some();
            if !claimed {
                st.in_flight.remove(&token);
            }
        }

        match result {
            Ok(path) => {
                let stored_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or(filename);
                let id = item.id.clone();
                let marked =
                    database::blocking(&self.inner.db, move |db| db.mark_item_retrieved(&id, &stored_name)).await;
                self.state().in_flight.remove(&token);
                marked?;
                self.emit_status(&item.id, ItemStatus::Retrieved);
                Ok(())
            }
            Err(RetrievalError::Aborted) => {
                self.emit_status(&item.id, ItemStatus::Cancelled);
                let st = self.state();
                Err(self.cancelled_error(&st))
            }
            Err(e) => {
                self.emit_status(&item.id, ItemStatus::Failed);
                Err(DelegationError::Failed(e.to_string()))
            }
        }
    }

    fn schedule_confirmation(&self, token: TaskToken) -> JoinHandle<()> {
        let this = self.clone();
        let delay = self.inner.confirm_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let claimed = {
                let mut st = this.state();
                st.in_flight.get_mut(&token).map(|task| {
                    task.finalizing = true;
                    task.confirmation = None;
                    (task.item.id.clone(), task.filename.clone())
                })
            };
            let Some((item_id, filename)) = claimed else {
                debug!(%token, "confirmation skipped; task no longer registered");
                return;
            };
            let (id, name) = (item_id.clone(), filename.clone());
            let marked = database::blocking(&this.inner.db, move |db| db.mark_item_retrieved(&id, &name)).await;
            this.state().in_flight.remove(&token);
            match marked {
                Ok(Some(_)) => {
                    info!("{item_id} marked retrieved as {filename}");
                    this.emit_status(&item_id, ItemStatus::Retrieved);
                }
                Ok(None) => warn!("{item_id} vanished before confirmation"),
                Err(e) => error!("could not mark {item_id} retrieved: {e}"),
            }
        })
    }

    /* --------------------------------- control ------------------------------- */

    /// Clear the queue and cancel everything in flight. New drains are refused
    /// until the grace window passes.
    pub fn stop(&self) -> StopReport {
        let (report, cancelled_ids, generation) = {
            let mut st = self.state();
            let cleared = st.queue.len();
            let was_processing = st.processing;
            st.stop_requested = true;
            st.queue.clear();
            // Entries already writing their completion are left to finish.
            let cancellable: Vec<TaskToken> = st
                .in_flight
                .iter()
                .filter(|(_, task)| !task.finalizing)
                .map(|(token, _)| *token)
                .collect();
            let mut cancelled_ids = Vec::with_capacity(cancellable.len());
            for token in cancellable {
                if let Some(mut task) = st.in_flight.remove(&token) {
                    task.halt();
                    cancelled_ids.push(task.item.id);
                }
            }
            st.stopped_total += cancelled_ids.len();
            st.processing = false;
            st.drain_generation += 1;
            st.stop_generation += 1;
            let report = StopReport {
                cleared,
                was_processing,
                in_flight_cancelled: cancelled_ids.len(),
            };
            (report, cancelled_ids, st.stop_generation)
        };

        info!(
            "stop: cleared={} was_processing={} in_flight_cancelled={}",
            report.cleared, report.was_processing, report.in_flight_cancelled
        );
        for id in &cancelled_ids {
            self.emit_status(id, ItemStatus::Cancelled);
        }

        let this = self.clone();
        let grace = self.inner.stop_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.finish_stop(generation);
        });
        report
    }

    fn finish_stop(&self, generation: u64) {
        {
            let mut st = self.state();
            if st.stop_generation != generation || !st.stop_requested {
                return;
            }
            st.stop_requested = false;
        }
        debug!("stop grace elapsed");
        self.maybe_start_drain();
    }

    /// Lift a pending stop right away.
    pub fn clear_stop(&self) {
        {
            let mut st = self.state();
            st.stop_requested = false;
            st.stop_generation += 1;
        }
        self.maybe_start_drain();
    }

    /// Cancel one in-flight retrieval. Returns false if the token is unknown,
    /// was already cancelled, or is already being recorded as retrieved.
    pub fn cancel_task(&self, token: TaskToken) -> bool {
        let item_id = {
            let mut st = self.state();
            if !st.in_flight.get(&token).is_some_and(|task| !task.finalizing) {
                return false;
            }
            let Some(mut task) = st.in_flight.remove(&token) else {
                return false;
            };
            task.halt();
            st.stopped_total += 1;
            task.item.id
        };
        info!(%token, "cancelled retrieval of {item_id}");
        self.emit_status(&item_id, ItemStatus::Cancelled);
        true
    }

    pub fn update_pacing(&self, min_delay: Duration, max_delay: Duration) {
        let mut st = self.state();
        st.min_delay = min_delay;
        st.max_delay = max_delay.max(min_delay);
    }

    pub fn set_last_check_time(&self, at: Option<i64>) {
        self.state().last_check_time = at;
    }

    pub fn set_auto_download(&self, on: bool) {
        self.state().auto_download = on;
    }

    pub fn auto_download(&self) -> bool {
        self.state().auto_download
    }

    pub fn is_processing(&self) -> bool {
        self.state().processing
    }

    pub async fn status(&self) -> QueueStatus {
        let mut status = {
            let st = self.state();
            let state = if st.stop_requested {
                QueueState::Stopping
            } else if st.processing {
                QueueState::Draining
            } else {
                QueueState::Idle
            };
            let mut in_flight: Vec<InFlightSummary> = st
                .in_flight
                .iter()
                .map(|(token, task)| InFlightSummary {
                    token: *token,
                    item_id: task.item.id.clone(),
                    title: task.item.title.clone(),
                    filename: task.filename.clone(),
                    started_at: task.started_at,
                })
                .collect();
            in_flight.sort_by_key(|t| t.started_at);
            QueueStatus {
                state,
                queue_length: st.queue.len(),
                processing: st.processing,
                stop_requested: st.stop_requested,
                in_flight,
                stopped_total: st.stopped_total,
                last_check_time: st.last_check_time,
                auto_download: st.auto_download,
                retrieved_count: 0,
                stats: None,
            }
        };

        match database::blocking(&self.inner.db, |db| db.compute_stats()).await {
            Ok(stats) => {
                status.retrieved_count = stats.retrieved_items;
                status.stats = Some(stats);
            }
            Err(e) => warn!("status without stats: {e}"),
        }
        status
    }
}

fn check_incoming(db: &Database, items: Vec<Item>) -> Vec<Checked> {
    items
        .into_iter()
        .map(|item| match db.upsert_item(&item, true) {
            Ok(stored) => Checked::Candidate {
                retrieved: stored.retrieved,
                item: stored,
            },
            Err(StoreError::InvalidArgument(reason)) => Checked::Rejected { id: item.id, reason },
            Err(e) => {
                warn!("could not record {}: {e}", item.id);
                let retrieved = db.is_item_retrieved(&item.id).unwrap_or(false);
                Checked::Candidate { item, retrieved }
            }
        })
        .collect()
}

fn pick_delay(min: Duration, max: Duration) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = (max.as_millis() as u64).max(lo);
    Duration::from_millis(rand::rng().random_range(lo..=hi))
}
