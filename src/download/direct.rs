use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::utils::filename::unique_path;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("retrieval aborted")]
    Aborted,
    #[error("item has no url")]
    MissingUrl,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fallback path used when delegation is refused or unavailable.
#[async_trait]
pub trait DirectRetriever: Send + Sync {
    async fn retrieve(
        &self,
        url: &str,
        filename: &str,
        cancel: CancellationToken,
    ) -> Result<PathBuf, RetrievalError>;
}

pub struct HttpRetriever {
    client: reqwest::Client,
    dest_dir: PathBuf,
}

impl HttpRetriever {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("clip-harvester/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        HttpRetriever {
            client,
            dest_dir: dest_dir.into(),
        }
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    async fn fetch_into(&self, url: &str, part: &Path, cancel: &CancellationToken) -> Result<u64, RetrievalError> {
        let mut resp = tokio::select! {
            _ = cancel.cancelled() => return Err(RetrievalError::Aborted),
            resp = self.client.get(url).send() => resp?.error_for_status()?,
        };

        let mut file = tokio::fs::File::create(part).await?;
        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(RetrievalError::Aborted),
                chunk = resp.chunk() => chunk?,
            };
            let Some(bytes) = chunk else { break };
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl DirectRetriever for HttpRetriever {
    async fn retrieve(
        &self,
        url: &str,
        filename: &str,
        cancel: CancellationToken,
    ) -> Result<PathBuf, RetrievalError> {
        if cancel.is_cancelled() {
            return Err(RetrievalError::Aborted);
        }
        if url.trim().is_empty() {
            return Err(RetrievalError::MissingUrl);
        }
        tokio::fs::create_dir_all(&self.dest_dir).await?;

        let part = self.dest_dir.join(format!(".{}.part", Uuid::new_v4()));
        let written = match self.fetch_into(url, &part, &cancel).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                if matches!(e, RetrievalError::Aborted) {
                    debug!("direct retrieval of {url} cancelled");
                }
                return Err(e);
            }
        };

        let target = unique_path(&self.dest_dir, filename);
        if let Err(e) = tokio::fs::rename(&part, &target).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e.into());
        }
        info!("retrieved {url} -> {} ({written} bytes)", target.display());
        Ok(target)
    }
}
