use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::download::{DelegationRequest, DownloadEvent, ScanSink};

/// Everything written to the client that is not a reply.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OutboundEvent {
    /// Please retrieve this item and answer with `delegationResult`.
    Delegate(DelegationRequest),
    /// Time to discover new items from the enabled sources.
    ScanRequested { at: i64 },
    Download(DownloadEvent),
}

/// Line-oriented writer handle; one JSON document per line.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Outbox { tx }, rx)
    }

    pub fn emit(&self, event: &OutboundEvent) {
        match serde_json::to_string(event) {
            Ok(line) => self.push(line),
            Err(e) => warn!("emit failed: {e}"),
        }
    }

    pub fn reply(&self, body: &Value) {
        self.push(body.to_string());
    }

    fn push(&self, line: String) {
        if self.tx.send(line).is_err() {
            warn!("outbox closed; dropping message");
        }
    }
}

#[async_trait]
impl ScanSink for Outbox {
    async fn request_scan(&self) -> Result<(), String> {
        let line = serde_json::to_string(&OutboundEvent::ScanRequested {
            at: Utc::now().timestamp_millis(),
        })
        .map_err(|e| e.to_string())?;
        self.tx.send(line).map_err(|_| "outbox closed".to_string())
    }
}
