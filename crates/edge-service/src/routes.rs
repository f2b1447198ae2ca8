use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use common::edge_events::{EdgeEvent, EdgeEventFilter, PageRequest, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use telemetry::CorrelationIdLayer;
use tower::ServiceExt;
use tower_http::{
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::warn;
use uuid::Uuid;

use crate::cache::{edge_event_key, CacheInvalidator, CachedResponse, EDGE_EVENTS_TAG};
use crate::error::{ApiError, PipelineError};
use crate::ingest::{IngestRequest, UploadedFrame};
use crate::metrics;
use crate::state::EdgeState;
use crate::timelapse::TimelapseRequest;

pub const X_PAGINATION: &str = "x-pagination";

pub fn create_router(state: EdgeState) -> Router {
    let max_upload = state.config().max_upload_bytes;
    let uploads = ServeDir::new(state.config().uploads_root());

    Router::new()
        .route("/health", get(health_check))
        .route("/readyz", get(ready_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/edge-data", get(list_edge_events).post(ingest_edge_event))
        .route("/api/v1/edge-data/all", get(list_all_edge_events))
        .route(
            "/api/v1/edge-data/:id",
            get(get_edge_event).delete(delete_edge_event),
        )
        .route(
            "/api/v1/timelapse/generate-from-edge",
            post(generate_timelapse),
        )
        .route("/api/v1/timelapse/from-edge/stream", get(stream_timelapse))
        .nest_service("/uploads", uploads)
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(TraceLayer::new_for_http())
        .layer(CorrelationIdLayer::new())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "edge-service"
    }))
}

async fn ready_check(State(state): State<EdgeState>) -> impl IntoResponse {
    match state.store().health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "repository": "connected"
            })),
        ),
        Err(e) => {
            warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "not ready",
                    "repository": "disconnected"
                })),
            )
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

// Edge event reads

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub search: Option<String>,
    #[serde(alias = "pageNumber")]
    pub page_number: Option<i64>,
    #[serde(alias = "pageSize")]
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AllQuery {
    pub search: Option<String>,
    #[serde(alias = "fromUtc", alias = "fromUTC")]
    pub from_utc: Option<DateTime<Utc>>,
    #[serde(alias = "toUtc", alias = "toUTC")]
    pub to_utc: Option<DateTime<Utc>>,
}

fn json_response(body: String, pagination: Option<&str>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Some(value) = pagination.and_then(|p| HeaderValue::from_str(p).ok()) {
        headers.insert(X_PAGINATION, value);
    }
    (StatusCode::OK, headers, body).into_response()
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ApiError> {
    serde_json::to_string(value).map_err(|e| ApiError::internal(e.to_string()))
}

async fn list_edge_events(
    State(state): State<EdgeState>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let page = PageRequest::new(
        query.page_number.unwrap_or(1),
        query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
    );
    let filter = EdgeEventFilter::new(query.search, None, None);
    let key = format!(
        "edge-events:list:{}:{}:{}",
        filter.search_term().unwrap_or_default().to_lowercase(),
        page.page_number,
        page.page_size
    );

    if let Some(hit) = state.cache().get(&key).await {
        return Ok(json_response(hit.body, hit.pagination.as_deref()));
    }

    let result = state
        .store()
        .list_page(&filter, page)
        .await
        .map_err(|e| PipelineError::repository(format!("{e:#}")))?;

    let body = to_json(&result.items)?;
    let pagination = to_json(&result.pagination())?;
    state
        .cache()
        .put(
            key,
            CachedResponse::new(body.clone(), Some(pagination.clone()), &[EDGE_EVENTS_TAG]),
        )
        .await;

    Ok(json_response(body, Some(&pagination)))
}

async fn list_all_edge_events(
    State(state): State<EdgeState>,
    Query(query): Query<AllQuery>,
) -> Result<Response, ApiError> {
    let filter = EdgeEventFilter::new(query.search, query.from_utc, query.to_utc);
    let key = format!(
        "edge-events:all:{}:{}:{}",
        filter.search_term().unwrap_or_default().to_lowercase(),
        filter.from_utc.map(|t| t.to_rfc3339()).unwrap_or_default(),
        filter.to_utc.map(|t| t.to_rfc3339()).unwrap_or_default()
    );

    if let Some(hit) = state.cache().get(&key).await {
        return Ok(json_response(hit.body, None));
    }

    let events = state
        .store()
        .list_all(&filter)
        .await
        .map_err(|e| PipelineError::repository(format!("{e:#}")))?;

    let body = to_json(&events)?;
    state
        .cache()
        .put(key, CachedResponse::new(body.clone(), None, &[EDGE_EVENTS_TAG]))
        .await;

    Ok(json_response(body, None))
}

async fn get_edge_event(
    State(state): State<EdgeState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let key = edge_event_key(id);
    if let Some(hit) = state.cache().get(&key).await {
        return Ok(json_response(hit.body, None));
    }

    let event = state
        .store()
        .get(id)
        .await
        .map_err(|e| PipelineError::repository(format!("{e:#}")))?
        .ok_or_else(|| ApiError::not_found("edge event not found"))?;

    let body = to_json(&event)?;
    state
        .cache()
        .put(key, CachedResponse::new(body.clone(), None, &[EDGE_EVENTS_TAG]))
        .await;

    Ok(json_response(body, None))
}

async fn delete_edge_event(
    State(state): State<EdgeState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let store = state.store();
    let event = store
        .get(id)
        .await
        .map_err(|e| PipelineError::repository(format!("{e:#}")))?
        .ok_or_else(|| ApiError::not_found("edge event not found"))?;

    let removed = store
        .delete(id)
        .await
        .map_err(|e| PipelineError::repository(format!("{e:#}")))?;
    if !removed {
        return Err(ApiError::not_found("edge event not found"));
    }

    for url in [&event.frame_raw_url, &event.frame_annotated_url]
        .into_iter()
        .flatten()
    {
        if let Some(reference) = blob_reference(url) {
            state.blobs().delete(reference).await;
        }
    }

    evict(&state, id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Part of a frame URL after `/uploads/`
fn blob_reference(url: &str) -> Option<&str> {
    url.split_once("/uploads/").map(|(_, rest)| rest)
}

async fn evict(state: &EdgeState, id: Uuid) {
    if let Err(e) = state.cache().evict_tag(EDGE_EVENTS_TAG).await {
        warn!(error = %e, "failed to evict edge event cache tag");
    }
    if let Err(e) = state.cache().evict_key(&edge_event_key(id)).await {
        warn!(id = %id, error = %e, "failed to evict edge event cache entry");
    }
}

// Ingestion

/// Base URL for stored frame links: configured value, otherwise the
/// request's own scheme and host
fn public_base(state: &EdgeState, headers: &HeaderMap) -> String {
    if let Some(base) = &state.config().public_base_url {
        return base.clone();
    }

    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let scheme = header_str("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = header_str("x-forwarded-host")
        .or_else(|| header_str(header::HOST.as_str()))
        .unwrap_or_else(|| state.config().bind_addr.to_string());
    format!("{scheme}://{host}")
}

async fn read_multipart(mut multipart: Multipart) -> Result<IngestRequest, ApiError> {
    let mut request = IngestRequest::default();

    let bad_multipart = |e: axum::extract::multipart::MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(format!("upload exceeds the size limit: {e}"))
        } else {
            ApiError::bad_request(format!("invalid multipart body: {e}"))
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_lowercase();
        match name.as_str() {
            "meta" => {
                request.meta = Some(field.text().await.map_err(bad_multipart)?);
            }
            "frame_raw" | "frame_annotated" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(bad_multipart)?.to_vec();
                let frame = UploadedFrame { file_name, data };
                if name == "frame_raw" {
                    request.frame_raw = Some(frame);
                } else {
                    request.frame_annotated = Some(frame);
                }
            }
            _ => {}
        }
    }

    Ok(request)
}

async fn ingest_edge_event(
    State(state): State<EdgeState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<(StatusCode, Json<EdgeEvent>), ApiError> {
    let request = read_multipart(multipart).await?;
    let base = public_base(&state, &headers);
    let event = state.ingest().ingest(request, &base).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

// Timelapse

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelapseResponse {
    pub download_url: String,
}

async fn generate_timelapse(
    State(state): State<EdgeState>,
    Json(request): Json<TimelapseRequest>,
) -> Result<Json<TimelapseResponse>, ApiError> {
    let cancel = state.shutdown().child_token();
    let artifact = state.timelapse().generate(&request, &cancel).await?;
    Ok(Json(TimelapseResponse {
        download_url: state.config().served_path(&artifact.relative_path),
    }))
}

async fn stream_timelapse(
    State(state): State<EdgeState>,
    Query(request): Query<TimelapseRequest>,
    req: Request,
) -> Result<Response, ApiError> {
    let cancel = state.shutdown().child_token();
    let artifact = state.timelapse().generate(&request, &cancel).await?;

    // ServeFile handles Range / If-Range and answers 206 where asked
    let served = ServeFile::new(&artifact.physical_path)
        .oneshot(req)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let mut response = served.map(Body::new);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("inline; filename=\"video.mp4\""),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_reference() {
        assert_eq!(
            blob_reference("http://h:8090/uploads/edge-frames/raw/2025-01/a.jpg"),
            Some("edge-frames/raw/2025-01/a.jpg")
        );
        assert_eq!(blob_reference("http://h/other/a.jpg"), None);
    }
}
