//! Single-upload ingestion: metadata, frame blobs, repository record.
//!
//! Blobs saved for a request are deleted again if anything after them fails,
//! so a rejected upload never leaves files behind.

use std::sync::Arc;

use common::edge_events::{CreateEdgeEventRequest, EdgeEvent};
use common::validation::{
    validate_camera_id, validate_length, validate_optional_length, Violations,
    MAX_COMPUTE_MODEL_LENGTH, MAX_FRAME_URL_LENGTH,
};
use tracing::{info, warn};

use crate::blob_store::BlobStore;
use crate::cache::{edge_event_key, CacheInvalidator, EDGE_EVENTS_TAG};
use crate::error::PipelineError;
use crate::metadata;
use crate::metrics;
use crate::store::EdgeEventStore;

pub const RAW_FRAMES_FOLDER: &str = "edge-frames/raw";
pub const ANNOTATED_FRAMES_FOLDER: &str = "edge-frames/annotated";

/// An image part of the multipart body
#[derive(Debug, Clone)]
pub struct UploadedFrame {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Raw parts of an ingestion request, as received from the transport
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub meta: Option<String>,
    pub frame_raw: Option<UploadedFrame>,
    pub frame_annotated: Option<UploadedFrame>,
}

/// Blobs written so far for one request
#[derive(Default)]
struct SavedBlobs {
    references: Vec<String>,
}

impl SavedBlobs {
    async fn discard(self, blobs: &BlobStore) {
        for reference in &self.references {
            blobs.delete(reference).await;
        }
        if !self.references.is_empty() {
            warn!(count = self.references.len(), "discarded blobs of rejected upload");
        }
    }
}

#[derive(Clone)]
pub struct IngestionService {
    blobs: BlobStore,
    store: Arc<dyn EdgeEventStore>,
    cache: Arc<dyn CacheInvalidator>,
}

impl IngestionService {
    pub fn new(
        blobs: BlobStore,
        store: Arc<dyn EdgeEventStore>,
        cache: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            blobs,
            store,
            cache,
        }
    }

    /// Ingest one upload. `public_base` prefixes the `/uploads/...` URLs
    /// recorded for the stored frames.
    pub async fn ingest(
        &self,
        request: IngestRequest,
        public_base: &str,
    ) -> Result<EdgeEvent, PipelineError> {
        let result = self.ingest_inner(request, public_base).await;
        match &result {
            Ok(event) => {
                metrics::EDGE_INGEST_ACCEPTED_TOTAL.inc();
                info!(id = %event.id, camera_id = %event.camera_id, "edge event ingested");
            }
            Err(e) => {
                metrics::EDGE_INGEST_REJECTED_TOTAL
                    .with_label_values(&[metrics::reason(e)])
                    .inc();
                if e.is_client_fault() {
                    warn!(error = %e, "edge upload rejected");
                }
            }
        }
        result
    }

    async fn ingest_inner(
        &self,
        request: IngestRequest,
        public_base: &str,
    ) -> Result<EdgeEvent, PipelineError> {
        // Nothing touches storage until the metadata and raw frame are known good
        let meta_text = request
            .meta
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| PipelineError::validation("meta", "is required"))?;
        let meta = metadata::parse(&meta_text)?;
        let capture_timestamp_utc = meta.capture_timestamp()?;
        let detections = meta.detections_json()?;

        let raw = request
            .frame_raw
            .ok_or_else(|| PipelineError::validation("frame_raw", "raw frame required"))?;

        let mut saved = SavedBlobs::default();

        let raw_ref = self
            .blobs
            .save(&raw.data, &raw.file_name, RAW_FRAMES_FOLDER)
            .await?;
        saved.references.push(raw_ref.clone());

        let annotated_ref = match request.frame_annotated {
            Some(frame) => match self
                .blobs
                .save(&frame.data, &frame.file_name, ANNOTATED_FRAMES_FOLDER)
                .await
            {
                Ok(reference) => {
                    saved.references.push(reference.clone());
                    Some(reference)
                }
                Err(e) => {
                    saved.discard(&self.blobs).await;
                    return Err(e);
                }
            },
            None => None,
        };

        let compute = meta.compute.unwrap_or_default();
        let create = CreateEdgeEventRequest {
            capture_timestamp_utc,
            camera_id: meta.camera_id.trim().to_string(),
            compute_model: compute.model,
            compute_inference_ms: compute.inference_ms,
            image_width: Some(meta.image.width),
            image_height: Some(meta.image.height),
            detections: Some(detections),
            frame_raw_url: public_url(public_base, &raw_ref),
            frame_annotated_url: annotated_ref.as_deref().map(|r| public_url(public_base, r)),
        };

        if let Err(errors) = validate_create(&create) {
            saved.discard(&self.blobs).await;
            return Err(PipelineError::Validation(errors));
        }

        let event = match self.store.create(create).await {
            Ok(event) => event,
            Err(e) => {
                saved.discard(&self.blobs).await;
                return Err(PipelineError::repository(format!("{e:#}")));
            }
        };

        if let Err(e) = self.cache.evict_tag(EDGE_EVENTS_TAG).await {
            warn!(error = %e, "failed to evict edge event cache tag");
        }
        if let Err(e) = self.cache.evict_key(&edge_event_key(event.id)).await {
            warn!(id = %event.id, error = %e, "failed to evict edge event cache entry");
        }

        Ok(event)
    }
}

/// Field checks on the assembled record; reports every violation.
pub fn validate_create(
    request: &CreateEdgeEventRequest,
) -> Result<(), Vec<common::validation::FieldError>> {
    let mut violations = Violations::new();
    violations
        .check(validate_camera_id(&request.camera_id))
        .check(validate_length(
            &request.frame_raw_url,
            MAX_FRAME_URL_LENGTH,
            "frame_raw_url",
        ))
        .check(validate_optional_length(
            request.frame_annotated_url.as_deref(),
            MAX_FRAME_URL_LENGTH,
            "frame_annotated_url",
        ))
        .check(validate_optional_length(
            request.compute_model.as_deref(),
            MAX_COMPUTE_MODEL_LENGTH,
            "compute_model",
        ));
    violations.finish()
}

/// `{base}/uploads/{reference}` with exactly one slash at each join
pub fn public_url(base: &str, reference: &str) -> String {
    format!(
        "{}/uploads/{}",
        base.trim_end_matches('/'),
        reference.trim_start_matches('/')
    )
}
