//! Timelapse assembly from stored edge frames.
//!
//! A run goes: normalize request, check the encoder, select frames, allocate
//! a workspace, fetch frames, encode, clean up. Everything after the encoder
//! check observes the run's cancellation token.

pub mod encoder;
pub mod fetcher;
pub mod process;
pub mod selector;
pub mod workspace;

use chrono::{DateTime, Utc};
use common::edge_events::EdgeEventFilter;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::metrics;
use crate::store::EdgeEventStore;
use encoder::{EncodeSettings, TimelapseEncoder, X264Preset};
use fetcher::FrameFetcher;
use process::ProcessRunner;
use workspace::RunWorkspace;

pub const DEFAULT_FPS: u32 = 20;
pub const DEFAULT_MAX_FRAMES: usize = 5000;
pub const DEFAULT_CRF: u8 = 18;
pub const MAX_CRF: u8 = 51;

/// Timelapse parameters as supplied by a caller; anything missing or out of
/// range is replaced by [`TimelapseRequest::normalize`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelapseRequest {
    pub search: Option<String>,
    pub fps: Option<i64>,
    pub width: Option<i64>,
    #[serde(alias = "maxFrames")]
    pub max_frames: Option<i64>,
    pub crf: Option<i64>,
    pub preset: Option<String>,
    #[serde(alias = "fromUtc", alias = "fromUTC")]
    pub from_utc: Option<DateTime<Utc>>,
    #[serde(alias = "toUtc", alias = "toUTC")]
    pub to_utc: Option<DateTime<Utc>>,
}

/// A request with every default applied
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub filter: EdgeEventFilter,
    pub max_frames: usize,
    pub settings: EncodeSettings,
}

impl TimelapseRequest {
    pub fn normalize(&self) -> NormalizedRequest {
        let fps = self
            .fps
            .filter(|v| *v > 0)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(DEFAULT_FPS);
        let width = self
            .width
            .filter(|v| *v > 0)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        let max_frames = self
            .max_frames
            .filter(|v| *v > 0)
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(DEFAULT_MAX_FRAMES);
        let crf = match self.crf {
            Some(v) if v > 0 => v.min(i64::from(MAX_CRF)) as u8,
            _ => DEFAULT_CRF,
        };

        NormalizedRequest {
            filter: EdgeEventFilter::new(self.search.clone(), self.from_utc, self.to_utc),
            max_frames,
            settings: EncodeSettings {
                fps,
                width,
                crf,
                preset: X264Preset::normalize(self.preset.as_deref()),
            },
        }
    }
}

/// A finished timelapse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelapseArtifact {
    pub run_id: String,
    /// Root-relative, forward slashes: `/<subfolder>/<run>/video.mp4`
    pub relative_path: String,
    pub physical_path: PathBuf,
    pub frame_count: usize,
}

#[derive(Clone)]
pub struct TimelapseService {
    store: Arc<dyn EdgeEventStore>,
    fetcher: Arc<dyn FrameFetcher>,
    runner: Arc<dyn ProcessRunner>,
    encoder: Arc<TimelapseEncoder>,
    output_root: PathBuf,
    output_subfolder: String,
    permits: Arc<Semaphore>,
}

impl TimelapseService {
    /// `output_subfolder` must already be a normalized relative folder.
    pub fn new(
        store: Arc<dyn EdgeEventStore>,
        fetcher: Arc<dyn FrameFetcher>,
        runner: Arc<dyn ProcessRunner>,
        encoder: TimelapseEncoder,
        output_root: impl Into<PathBuf>,
        output_subfolder: impl Into<String>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            fetcher,
            runner,
            encoder: Arc::new(encoder),
            output_root: output_root.into(),
            output_subfolder: output_subfolder.into(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub async fn encoder_available(&self) -> bool {
        self.encoder.ensure_available().await.is_ok()
    }

    pub async fn generate(
        &self,
        request: &TimelapseRequest,
        cancel: &CancellationToken,
    ) -> Result<TimelapseArtifact, PipelineError> {
        metrics::TIMELAPSE_RUNS_TOTAL.inc();
        let started = Instant::now();

        let result = self.run(request.normalize(), cancel).await;
        match &result {
            Ok(artifact) => {
                metrics::TIMELAPSE_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
                info!(
                    run_id = %artifact.run_id,
                    frames = artifact.frame_count,
                    path = %artifact.relative_path,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "timelapse generated"
                );
            }
            Err(e) => {
                metrics::TIMELAPSE_FAILURES_TOTAL
                    .with_label_values(&[metrics::reason(e)])
                    .inc();
                warn!(error = %e, "timelapse generation failed");
            }
        }
        result
    }

    async fn run(
        &self,
        request: NormalizedRequest,
        cancel: &CancellationToken,
    ) -> Result<TimelapseArtifact, PipelineError> {
        // Checked before any selection or download
        self.encoder.ensure_available().await?;

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| PipelineError::Cancelled)?,
        };

        let frames =
            selector::select_from_store(self.store.as_ref(), &request.filter, request.max_frames)
                .await?;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut workspace = RunWorkspace::create(&self.output_root, &self.output_subfolder).await?;

        // Dropping this future mid-run drops the workspace, which removes the
        // unfinished run directory
        let outcome = self
            .fetch_and_encode(&frames, request.settings, &workspace, cancel)
            .await;

        match outcome {
            Ok(frame_count) => {
                workspace.mark_completed();
                workspace.cleanup().await;
                Ok(TimelapseArtifact {
                    run_id: workspace.run_id().to_string(),
                    relative_path: workspace.relative_video_path(),
                    physical_path: workspace.video_path(),
                    frame_count,
                })
            }
            Err(e) => {
                workspace.discard().await;
                Err(e)
            }
        }
    }

    async fn fetch_and_encode(
        &self,
        frames: &[String],
        settings: EncodeSettings,
        workspace: &RunWorkspace,
        cancel: &CancellationToken,
    ) -> Result<usize, PipelineError> {
        let local =
            fetcher::fetch_all(self.fetcher.as_ref(), frames, &workspace.frames_dir(), cancel)
                .await?;

        self.encoder
            .encode(self.runner.as_ref(), &local, settings, workspace, cancel)
            .await?;

        if !tokio::fs::try_exists(workspace.video_path()).await? {
            return Err(PipelineError::EncodingFailed(
                "encoder exited successfully but produced no output".to_string(),
            ));
        }
        Ok(local.len())
    }
}
