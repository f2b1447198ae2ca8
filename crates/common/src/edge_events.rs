//! Edge event records shared between the ingestion pipeline, the repository
//! and the timelapse builder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default page size for paged listings
pub const DEFAULT_PAGE_SIZE: i64 = 10;

/// Upper bound on a single page
pub const MAX_PAGE_SIZE: i64 = 100;

/// One accepted upload from an edge device.
///
/// Created once at ingestion time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeEvent {
    pub id: Uuid,
    /// When the device captured the frame; the ordering key for timelapses
    pub capture_timestamp_utc: DateTime<Utc>,
    /// When the server persisted the record
    pub created_utc: DateTime<Utc>,
    pub camera_id: String,
    pub compute_model: Option<String>,
    pub compute_inference_ms: Option<f64>,
    pub image_width: Option<i32>,
    pub image_height: Option<i32>,
    /// Serialized detections, stored verbatim
    pub detections: Option<String>,
    pub frame_raw_url: Option<String>,
    pub frame_annotated_url: Option<String>,
}

/// Fields needed to persist a new edge event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEdgeEventRequest {
    pub capture_timestamp_utc: DateTime<Utc>,
    pub camera_id: String,
    pub compute_model: Option<String>,
    pub compute_inference_ms: Option<f64>,
    pub image_width: Option<i32>,
    pub image_height: Option<i32>,
    pub detections: Option<String>,
    pub frame_raw_url: String,
    pub frame_annotated_url: Option<String>,
}

impl CreateEdgeEventRequest {
    /// Materialize the persisted record with a fresh id and creation time
    pub fn into_event(self, created_utc: DateTime<Utc>) -> EdgeEvent {
        EdgeEvent {
            id: Uuid::new_v4(),
            capture_timestamp_utc: self.capture_timestamp_utc,
            created_utc,
            camera_id: self.camera_id.trim().to_string(),
            compute_model: self.compute_model,
            compute_inference_ms: self.compute_inference_ms,
            image_width: self.image_width,
            image_height: self.image_height,
            detections: self.detections,
            frame_raw_url: Some(self.frame_raw_url),
            frame_annotated_url: self.frame_annotated_url,
        }
    }
}

/// Filter shared by the paged and unpaged queries.
///
/// `search` is a case-insensitive substring match against the camera id and
/// both frame URLs; the time bounds apply to the capture timestamp and are
/// inclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeEventFilter {
    pub search: Option<String>,
    pub from_utc: Option<DateTime<Utc>>,
    pub to_utc: Option<DateTime<Utc>>,
}

impl EdgeEventFilter {
    pub fn new(
        search: Option<String>,
        from_utc: Option<DateTime<Utc>>,
        to_utc: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            search,
            from_utc,
            to_utc,
        }
    }

    /// Trimmed search term, `None` when blank
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// In-process evaluation of the filter, mirroring the SQL predicate
    pub fn matches(&self, event: &EdgeEvent) -> bool {
        if let Some(term) = self.search_term() {
            let term = term.to_lowercase();
            let hit = |value: Option<&str>| {
                value
                    .map(|v| v.to_lowercase().contains(&term))
                    .unwrap_or(false)
            };
            if !(hit(Some(&event.camera_id))
                || hit(event.frame_raw_url.as_deref())
                || hit(event.frame_annotated_url.as_deref()))
            {
                return false;
            }
        }
        if let Some(from) = self.from_utc {
            if event.capture_timestamp_utc < from {
                return false;
            }
        }
        if let Some(to) = self.to_utc {
            if event.capture_timestamp_utc > to {
                return false;
            }
        }
        true
    }
}

/// Page selection; out-of-range values are normalized rather than rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page_number: i64,
    pub page_size: i64,
}

impl PageRequest {
    pub fn new(page_number: i64, page_size: i64) -> Self {
        let page_number = if page_number <= 0 { 1 } else { page_number };
        let page_size = if page_size <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size.min(MAX_PAGE_SIZE)
        };
        Self {
            page_number,
            page_size,
        }
    }

    /// Rows to skip; saturates instead of overflowing for huge page numbers
    pub fn offset(&self) -> i64 {
        (self.page_number - 1).saturating_mul(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub total_count: i64,
    pub page_number: i64,
    pub page_size: i64,
}

impl<T> PagedResult<T> {
    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.page_number, self.page_size, self.total_count)
    }
}

/// Body of the `X-Pagination` response header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page_number: i64,
    pub page_size: i64,
    pub total_count: i64,
    pub total_pages: i64,
}

impl Pagination {
    pub fn new(page_number: i64, page_size: i64, total_count: i64) -> Self {
        let size = page_size.max(1);
        let total_pages = (total_count + size - 1) / size;
        Self {
            page_number,
            page_size,
            total_count,
            total_pages,
        }
    }
}
