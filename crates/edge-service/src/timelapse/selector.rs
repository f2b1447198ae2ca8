use common::edge_events::{EdgeEvent, EdgeEventFilter};
use std::collections::HashSet;
use tracing::debug;

use crate::error::PipelineError;
use crate::store::EdgeEventStore;

/// A timelapse needs at least this many frames to show motion
pub const MIN_FRAMES: usize = 2;

/// Ordered raw-frame references for a timelapse.
///
/// Events without a raw frame are skipped, the rest are sorted by capture
/// time (oldest first, stable for ties), duplicates are dropped ignoring
/// case and surrounding whitespace, and the result is cut to `max_frames`.
/// The minimum is enforced before the cut.
pub fn select_frames(
    mut events: Vec<EdgeEvent>,
    max_frames: usize,
) -> Result<Vec<String>, PipelineError> {
    events.retain(|e| {
        e.frame_raw_url
            .as_deref()
            .is_some_and(|raw| !raw.trim().is_empty())
    });
    events.sort_by_key(|e| e.capture_timestamp_utc);

    let mut seen = HashSet::new();
    let mut frames: Vec<String> = events
        .into_iter()
        .filter_map(|e| e.frame_raw_url)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| seen.insert(raw.to_lowercase()))
        .collect();

    if frames.len() < MIN_FRAMES {
        return Err(PipelineError::InsufficientFrames {
            required: MIN_FRAMES,
            found: frames.len(),
        });
    }

    frames.truncate(max_frames);
    Ok(frames)
}

/// Query the repository and select frames from the result
pub async fn select_from_store(
    store: &dyn EdgeEventStore,
    filter: &EdgeEventFilter,
    max_frames: usize,
) -> Result<Vec<String>, PipelineError> {
    let events = store
        .list_all(filter)
        .await
        .map_err(|e| PipelineError::repository(format!("{e:#}")))?;
    let candidates = events.len();

    let frames = select_frames(events, max_frames)?;
    debug!(candidates, selected = frames.len(), "selected timelapse frames");
    Ok(frames)
}
