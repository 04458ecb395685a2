use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::TaskToken;
use crate::database::Item;

/// One retrieval handed to the connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationRequest {
    pub token: TaskToken,
    pub item: Item,
    pub filename: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DelegationOutcome {
    pub success: bool,
    pub aborted: bool,
    pub filename_hint: Option<String>,
}

impl DelegationOutcome {
    pub fn succeeded() -> Self {
        DelegationOutcome {
            success: true,
            ..Default::default()
        }
    }

    pub fn aborted() -> Self {
        DelegationOutcome {
            aborted: true,
            ..Default::default()
        }
    }

    pub fn failed() -> Self {
        DelegationOutcome::default()
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no client is connected to take the retrieval")]
    Unavailable,
    #[error("client declined the retrieval: {0}")]
    Declined(String),
    #[error("delegation transport failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait DelegationGateway: Send + Sync {
    /// Ask the collaborator to perform a retrieval. Resolves once it has
    /// accepted, refused, or was cancelled through `cancel`.
    async fn delegate(
        &self,
        request: DelegationRequest,
        cancel: CancellationToken,
    ) -> Result<DelegationOutcome, GatewayError>;
}

/// Forwards requests over an mpsc channel and waits for a matching
/// [`ChannelGateway::resolve`] call.
pub struct ChannelGateway {
    tx: mpsc::Sender<DelegationRequest>,
    pending: Mutex<HashMap<TaskToken, oneshot::Sender<DelegationOutcome>>>,
    reply_timeout: Duration,
}

impl ChannelGateway {
    pub fn new(reply_timeout: Duration) -> (Self, mpsc::Receiver<DelegationRequest>) {
        let (tx, rx) = mpsc::channel(64);
        let gateway = ChannelGateway {
            tx,
            pending: Mutex::new(HashMap::new()),
            reply_timeout,
        };
        (gateway, rx)
    }

    /// Complete a pending delegation. Returns false when nothing waits on `token`.
    pub fn resolve(&self, token: TaskToken, outcome: DelegationOutcome) -> bool {
        let slot = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&token),
            Err(_) => None,
        };
        match slot {
            Some(reply) => reply.send(outcome).is_ok(),
            None => {
                debug!(%token, "delegation result for unknown token");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn forget(&self, token: &TaskToken) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(token);
        }
    }
}

#[async_trait]
impl DelegationGateway for ChannelGateway {
    async fn delegate(
        &self,
        request: DelegationRequest,
        cancel: CancellationToken,
    ) -> Result<DelegationOutcome, GatewayError> {
        let token = request.token;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|e| GatewayError::Transport(e.to_string()))?
            .insert(token, reply_tx);

        let sent = tokio::select! {
            _ = cancel.cancelled() => {
                self.forget(&token);
                return Ok(DelegationOutcome::aborted());
            }
            sent = self.tx.send(request) => sent,
        };
        if sent.is_err() {
            self.forget(&token);
            return Err(GatewayError::Unavailable);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(DelegationOutcome::aborted()),
            reply = tokio::time::timeout(self.reply_timeout, reply_rx) => match reply {
                Ok(Ok(outcome)) => Ok(outcome),
                // The client saw the request; assume it is working on it.
                Err(_) => {
                    debug!(%token, "no delegation reply within {:?}; assuming accepted", self.reply_timeout);
                    Ok(DelegationOutcome::succeeded())
                }
                Ok(Err(_)) => {
                    warn!(%token, "delegation reply slot dropped");
                    Err(GatewayError::Transport("reply channel closed".into()))
                }
            },
        };
        self.forget(&token);
        result
    }
}

/// Used when no client is configured; every retrieval goes direct.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledGateway;

#[async_trait]
impl DelegationGateway for DisabledGateway {
    async fn delegate(
        &self,
        _request: DelegationRequest,
        _cancel: CancellationToken,
    ) -> Result<DelegationOutcome, GatewayError> {
        Err(GatewayError::Unavailable)
    }
}
