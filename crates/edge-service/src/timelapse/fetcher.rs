use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::selector::MIN_FRAMES;
use crate::error::PipelineError;
use crate::metrics;

/// Materializes one frame reference as a local file.
#[async_trait]
pub trait FrameFetcher: Send + Sync {
    /// Returns the local path of the frame. Remote frames are written to
    /// `dest`; existing local files are returned as-is.
    async fn fetch(
        &self,
        reference: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError>;
}

/// File name of the `index`-th downloaded frame
pub fn frame_file_name(index: usize) -> String {
    format!("frame_{index:06}.jpg")
}

/// Fetch every reference in order. One failure aborts the whole run.
pub async fn fetch_all(
    fetcher: &dyn FrameFetcher,
    references: &[String],
    frames_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>, PipelineError> {
    let mut paths = Vec::with_capacity(references.len());

    for (index, reference) in references.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let dest = frames_dir.join(frame_file_name(index));
        let path = fetcher.fetch(reference, &dest, cancel).await?;
        metrics::TIMELAPSE_FRAMES_FETCHED_TOTAL.inc();
        paths.push(path);
    }

    if paths.len() < MIN_FRAMES {
        return Err(PipelineError::InsufficientFrames {
            required: MIN_FRAMES,
            found: paths.len(),
        });
    }

    debug!(count = paths.len(), "fetched timelapse frames");
    Ok(paths)
}

/// Local files pass through; anything else is downloaded over HTTP.
#[derive(Clone)]
pub struct HttpFrameFetcher {
    client: reqwest::Client,
}

impl HttpFrameFetcher {
    pub fn new(timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::storage(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn local_file(reference: &str) -> Option<PathBuf> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return None;
        }
        let path = Path::new(reference);
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => tokio::fs::canonicalize(path).await.ok(),
            _ => None,
        }
    }

    async fn download(
        &self,
        reference: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let fetch_error = |reason: String| PipelineError::FrameFetch {
            reference: reference.to_string(),
            reason,
        };

        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            response = self.client.get(reference).send() => response.map_err(|e| fetch_error(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("HTTP {status}")));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                chunk = response.chunk() => chunk.map_err(|e| fetch_error(e.to_string()))?,
            };
            match chunk {
                Some(bytes) => file.write_all(&bytes).await?,
                None => break,
            }
        }
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl FrameFetcher for HttpFrameFetcher {
    async fn fetch(
        &self,
        reference: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        if let Some(local) = Self::local_file(reference).await {
            debug!(reference = %reference, "using local frame");
            return Ok(local);
        }

        if let Err(e) = self.download(reference, dest, cancel).await {
            warn!(reference = %reference, error = %e, "frame fetch failed");
            return Err(e);
        }
        Ok(dest.to_path_buf())
    }
}
