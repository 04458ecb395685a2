pub mod direct;
pub mod gateway;
pub mod manager;
pub mod scheduler;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub use direct::{DirectRetriever, HttpRetriever, RetrievalError};
pub use gateway::{ChannelGateway, DelegationGateway, DelegationOutcome, DelegationRequest, DisabledGateway, GatewayError};
pub use manager::{DownloadEvent, EnqueueReport, QueueManager, QueueOptions, QueueStatus, StopReport};
pub use scheduler::{ScanSink, Scheduler};

/// Identifies one in-flight retrieval across the delegation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskToken(pub Uuid);

impl TaskToken {
    pub fn new() -> Self {
        TaskToken(Uuid::new_v4())
    }
}

impl Default for TaskToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
