use anyhow::Result;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::multipart::{MultipartForm, Part};
use axum_test::TestServer;
use edge_service::{create_router, EdgeServiceConfig, EdgeState, MemoryEdgeEventStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const PUBLIC_BASE: &str = "http://edge.test";

fn test_config(root: &TempDir) -> EdgeServiceConfig {
    EdgeServiceConfig {
        storage_root: root.path().to_path_buf(),
        public_base_url: Some(PUBLIC_BASE.to_string()),
        ffmpeg_path: root.path().join("missing-ffmpeg"),
        ..Default::default()
    }
}

fn create_test_server(root: &TempDir) -> Result<TestServer> {
    server_with_config(test_config(root))
}

fn server_with_config(config: EdgeServiceConfig) -> Result<TestServer> {
    let state = EdgeState::new(
        config,
        Arc::new(MemoryEdgeEventStore::new()),
        CancellationToken::new(),
    )?;
    Ok(TestServer::new(create_router(state))?)
}

fn meta(camera_id: &str) -> String {
    json!({
        "timestamp_utc": "2025-11-10T08:30:00Z",
        "camera_id": camera_id,
        "image": { "width": 1280, "height": 720 },
        "compute": { "model": "yolov8n", "inference_ms": 41.5 },
        "people": { "count": 1, "confidence_avg": 0.87 },
        "detections": [
            { "class_id": 0, "class_name": "person", "confidence": 0.87, "bbox_xyxy": [10, 20, 110, 220] }
        ]
    })
    .to_string()
}

fn jpeg(name: &str) -> Part {
    Part::bytes(vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3, 4])
        .file_name(name)
        .mime_type("image/jpeg")
}

fn stored_files(root: &TempDir) -> usize {
    let dir = root.path().join("uploads/edge-frames");
    if !dir.exists() {
        return 0;
    }
    let mut count = 0;
    let mut pending = vec![dir];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                count += 1;
            }
        }
    }
    count
}

async fn upload(server: &TestServer, camera_id: &str) -> Value {
    let form = MultipartForm::new()
        .add_text("meta", meta(camera_id))
        .add_part("frame_raw", jpeg("raw.jpg"));
    let response = server.post("/api/v1/edge-data").multipart(form).await;
    response.assert_status(StatusCode::CREATED);
    response.json()
}

#[tokio::test]
async fn test_health_check() -> Result<()> {
    let root = TempDir::new()?;
    let server = create_test_server(&root)?;

    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");

    let response = server.get("/readyz").await;
    response.assert_status_ok();

    Ok(())
}

#[tokio::test]
async fn test_ingest_raw_and_annotated_frames() -> Result<()> {
    let root = TempDir::new()?;
    let server = create_test_server(&root)?;

    let form = MultipartForm::new()
        .add_text("meta", meta("cam-entrance"))
        .add_part("frame_raw", jpeg("raw.JPG"))
        .add_part("frame_annotated", jpeg("annotated.png"));
    let response = server.post("/api/v1/edge-data").multipart(form).await;
    response.assert_status(StatusCode::CREATED);

    let event: Value = response.json();
    assert_eq!(event["camera_id"], "cam-entrance");
    assert_eq!(event["compute_model"], "yolov8n");
    assert_eq!(event["image_width"], 1280);
    assert_eq!(event["image_height"], 720);
    assert_eq!(event["capture_timestamp_utc"], "2025-11-10T08:30:00Z");

    let raw_url = event["frame_raw_url"].as_str().unwrap();
    assert!(raw_url.starts_with("http://edge.test/uploads/edge-frames/raw/"));
    assert!(raw_url.ends_with(".jpg"));

    let annotated_url = event["frame_annotated_url"].as_str().unwrap();
    assert!(annotated_url.starts_with("http://edge.test/uploads/edge-frames/annotated/"));
    assert!(annotated_url.ends_with(".png"));

    let detections: Value = serde_json::from_str(event["detections"].as_str().unwrap())?;
    assert_eq!(detections[0]["class_name"], "person");

    assert_eq!(stored_files(&root), 2);

    // Stored frames are served back under /uploads
    let path = raw_url.trim_start_matches(PUBLIC_BASE);
    let frame = server.get(path).await;
    frame.assert_status_ok();
    assert_eq!(frame.as_bytes().to_vec(), vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3, 4]);

    Ok(())
}

#[tokio::test]
async fn test_ingest_without_camera_id_is_rejected() -> Result<()> {
    let root = TempDir::new()?;
    let server = create_test_server(&root)?;

    let form = MultipartForm::new()
        .add_text("meta", meta("  "))
        .add_part("frame_raw", jpeg("raw.jpg"));
    let response = server.post("/api/v1/edge-data").multipart(form).await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let body: Value = response.json();
    assert_eq!(body["details"][0]["field"], "camera_id");
    assert_eq!(stored_files(&root), 0);

    Ok(())
}

#[tokio::test]
async fn test_ingest_without_raw_frame_is_rejected() -> Result<()> {
    let root = TempDir::new()?;
    let server = create_test_server(&root)?;

    let form = MultipartForm::new()
        .add_text("meta", meta("cam-1"))
        .add_part("frame_annotated", jpeg("annotated.jpg"));
    let response = server.post("/api/v1/edge-data").multipart(form).await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let body: Value = response.json();
    assert_eq!(body["details"][0]["field"], "frame_raw");
    assert_eq!(stored_files(&root), 0);

    Ok(())
}

#[tokio::test]
async fn test_ingest_malformed_meta_is_rejected() -> Result<()> {
    let root = TempDir::new()?;
    let server = create_test_server(&root)?;

    let form = MultipartForm::new()
        .add_text("meta", "{not json")
        .add_part("frame_raw", jpeg("raw.jpg"));
    let response = server.post("/api/v1/edge-data").multipart(form).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(stored_files(&root), 0);

    Ok(())
}

#[tokio::test]
async fn test_ingest_disallowed_extension_leaves_no_blobs() -> Result<()> {
    let root = TempDir::new()?;
    let server = create_test_server(&root)?;

    let form = MultipartForm::new()
        .add_text("meta", meta("cam-1"))
        .add_part("frame_raw", jpeg("raw.jpg"))
        .add_part("frame_annotated", jpeg("annotated.bmp"));
    let response = server.post("/api/v1/edge-data").multipart(form).await;
    response.assert_status(StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(stored_files(&root), 0);

    let list = server.get("/api/v1/edge-data/all").await;
    let events: Value = list.json();
    assert_eq!(events.as_array().map(Vec::len), Some(0));

    Ok(())
}

#[tokio::test]
async fn test_list_is_paged_with_pagination_header() -> Result<()> {
    let root = TempDir::new()?;
    let server = create_test_server(&root)?;

    for i in 0..3 {
        upload(&server, &format!("cam-{i}")).await;
    }

    let response = server
        .get("/api/v1/edge-data")
        .add_query_param("pageNumber", 1)
        .add_query_param("pageSize", 2)
        .await;
    response.assert_status_ok();

    let pagination: Value =
        serde_json::from_str(response.header("x-pagination").to_str()?)?;
    assert_eq!(pagination["totalCount"], 3);
    assert_eq!(pagination["totalPages"], 2);
    assert_eq!(pagination["pageNumber"], 1);
    assert_eq!(pagination["pageSize"], 2);

    let items: Value = response.json();
    assert_eq!(items.as_array().map(Vec::len), Some(2));

    let response = server
        .get("/api/v1/edge-data")
        .add_query_param("search", "CAM-2")
        .await;
    let items: Value = response.json();
    assert_eq!(items.as_array().map(Vec::len), Some(1));
    assert_eq!(items[0]["camera_id"], "cam-2");

    Ok(())
}

#[tokio::test]
async fn test_list_reflects_new_uploads() -> Result<()> {
    let root = TempDir::new()?;
    let server = create_test_server(&root)?;

    upload(&server, "cam-a").await;
    let first: Value = server.get("/api/v1/edge-data/all").await.json();
    assert_eq!(first.as_array().map(Vec::len), Some(1));

    // A cached listing must not hide the second upload
    upload(&server, "cam-b").await;
    let second: Value = server.get("/api/v1/edge-data/all").await.json();
    assert_eq!(second.as_array().map(Vec::len), Some(2));

    Ok(())
}

#[tokio::test]
async fn test_get_and_delete_edge_event() -> Result<()> {
    let root = TempDir::new()?;
    let server = create_test_server(&root)?;

    let event = upload(&server, "cam-delete").await;
    let id = event["id"].as_str().unwrap().to_string();

    let response = server.get(&format!("/api/v1/edge-data/{id}")).await;
    response.assert_status_ok();
    let fetched: Value = response.json();
    assert_eq!(fetched["camera_id"], "cam-delete");

    let response = server.delete(&format!("/api/v1/edge-data/{id}")).await;
    response.assert_status(StatusCode::NO_CONTENT);
    assert_eq!(stored_files(&root), 0);

    let response = server.get(&format!("/api/v1/edge-data/{id}")).await;
    response.assert_status_not_found();

    let response = server.delete(&format!("/api/v1/edge-data/{id}")).await;
    response.assert_status_not_found();

    Ok(())
}

#[tokio::test]
async fn test_responses_carry_correlation_id() -> Result<()> {
    let root = TempDir::new()?;
    let server = create_test_server(&root)?;

    let response = server
        .get("/health")
        .add_header(
            HeaderName::from_static("x-correlation-id"),
            HeaderValue::from_static("edge-test-42"),
        )
        .await;
    response.assert_status_ok();
    assert_eq!(response.header("x-correlation-id"), "edge-test-42");

    Ok(())
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() -> Result<()> {
    let root = TempDir::new()?;
    let server = server_with_config(EdgeServiceConfig {
        max_upload_bytes: 4 * 1024,
        ..test_config(&root)
    })?;

    let oversized = Part::bytes(vec![0xAB; 64 * 1024])
        .file_name("raw.jpg")
        .mime_type("image/jpeg");
    let form = MultipartForm::new()
        .add_text("meta", meta("cam-big"))
        .add_part("frame_raw", oversized);
    let response = server.post("/api/v1/edge-data").multipart(form).await;
    response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(stored_files(&root), 0);

    let events: Value = server.get("/api/v1/edge-data/all").await.json();
    assert_eq!(events.as_array().map(Vec::len), Some(0));

    // Small uploads still go through under the same limit
    upload(&server, "cam-small").await;

    Ok(())
}

#[tokio::test]
async fn test_huge_page_number_returns_empty_page() -> Result<()> {
    let root = TempDir::new()?;
    let server = create_test_server(&root)?;
    upload(&server, "cam-1").await;

    let response = server
        .get("/api/v1/edge-data")
        .add_query_param("page_number", i64::MAX)
        .await;
    response.assert_status_ok();

    let items: Value = response.json();
    assert_eq!(items.as_array().map(Vec::len), Some(0));

    let pagination: Value =
        serde_json::from_str(response.header("x-pagination").to_str()?)?;
    assert_eq!(pagination["totalCount"], 1);

    Ok(())
}
