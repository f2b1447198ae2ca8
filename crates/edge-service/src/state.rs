use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::blob_store::BlobStore;
use crate::cache::ResponseCache;
use crate::config::EdgeServiceConfig;
use crate::error::PipelineError;
use crate::ingest::IngestionService;
use crate::store::EdgeEventStore;
use crate::timelapse::encoder::TimelapseEncoder;
use crate::timelapse::fetcher::{FrameFetcher, HttpFrameFetcher};
use crate::timelapse::process::{ProcessRunner, TokioProcessRunner};
use crate::timelapse::TimelapseService;

#[derive(Clone)]
pub struct EdgeState {
    inner: Arc<StateInner>,
}

struct StateInner {
    config: EdgeServiceConfig,
    store: Arc<dyn EdgeEventStore>,
    blobs: BlobStore,
    cache: Arc<ResponseCache>,
    ingest: IngestionService,
    timelapse: TimelapseService,
    shutdown: CancellationToken,
}

impl EdgeState {
    /// State wired to the real HTTP fetcher and ffmpeg subprocess runner
    pub fn new(
        config: EdgeServiceConfig,
        store: Arc<dyn EdgeEventStore>,
        shutdown: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let fetcher = Arc::new(HttpFrameFetcher::new(config.frame_fetch_timeout)?);
        Ok(Self::with_pipeline(
            config,
            store,
            fetcher,
            Arc::new(TokioProcessRunner),
            shutdown,
        ))
    }

    pub fn with_pipeline(
        config: EdgeServiceConfig,
        store: Arc<dyn EdgeEventStore>,
        fetcher: Arc<dyn FrameFetcher>,
        runner: Arc<dyn ProcessRunner>,
        shutdown: CancellationToken,
    ) -> Self {
        let blobs = BlobStore::new(config.uploads_root());
        let cache = Arc::new(ResponseCache::new(config.read_cache_ttl));
        let ingest = IngestionService::new(blobs.clone(), store.clone(), cache.clone());
        let timelapse = TimelapseService::new(
            store.clone(),
            fetcher,
            runner,
            TimelapseEncoder::new(config.ffmpeg_path.clone()),
            config.storage_root.clone(),
            config.timelapse_output_subfolder.clone(),
            config.timelapse_max_concurrent,
        );

        Self {
            inner: Arc::new(StateInner {
                config,
                store,
                blobs,
                cache,
                ingest,
                timelapse,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &EdgeServiceConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn EdgeEventStore> {
        self.inner.store.clone()
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    pub fn ingest(&self) -> &IngestionService {
        &self.inner.ingest
    }

    pub fn timelapse(&self) -> &TimelapseService {
        &self.inner.timelapse
    }

    /// Token cancelled when the server shuts down
    pub fn shutdown(&self) -> &CancellationToken {
        &self.inner.shutdown
    }
}
