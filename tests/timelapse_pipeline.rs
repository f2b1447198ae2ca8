use anyhow::Result;
use async_trait::async_trait;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::{extract::Path as UrlPath, routing::get, Router};
use axum_test::TestServer;
use chrono::{TimeZone, Utc};
use common::edge_events::{CreateEdgeEventRequest, EdgeEvent};
use edge_service::timelapse::encoder::TimelapseEncoder;
use edge_service::timelapse::fetcher::{FrameFetcher, HttpFrameFetcher};
use edge_service::timelapse::process::{ProcessOutput, ProcessRunner};
use edge_service::timelapse::{TimelapseRequest, TimelapseService};
use edge_service::{
    create_router, EdgeEventStore, EdgeServiceConfig, EdgeState, MemoryEdgeEventStore,
    PipelineError,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const OUTPUT_SUBFOLDER: &str = "uploads/timelapses";
const VIDEO_BYTES: &[u8] = b"fake-mp4-payload";

/// Stands in for ffmpeg: records the manifest and writes the output file
#[derive(Default)]
struct FakeFfmpeg {
    manifest: Mutex<Option<String>>,
    args: Mutex<Vec<String>>,
    exit_code: i32,
}

impl FakeFfmpeg {
    fn failing() -> Self {
        Self {
            exit_code: 1,
            ..Default::default()
        }
    }

    fn manifest(&self) -> Option<String> {
        self.manifest.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessRunner for FakeFfmpeg {
    async fn run(
        &self,
        _program: &Path,
        args: &[String],
        _workdir: &Path,
        _cancel: &CancellationToken,
    ) -> Result<ProcessOutput, PipelineError> {
        *self.args.lock().unwrap() = args.to_vec();

        let manifest_path = args
            .iter()
            .position(|a| a == "-i")
            .and_then(|i| args.get(i + 1))
            .unwrap();
        *self.manifest.lock().unwrap() = Some(std::fs::read_to_string(manifest_path).unwrap());

        if self.exit_code != 0 {
            return Ok(ProcessOutput {
                status_code: Some(self.exit_code),
                stdout: String::new(),
                stderr: "Invalid data found when processing input".to_string(),
            });
        }

        std::fs::write(args.last().unwrap(), VIDEO_BYTES).unwrap();
        Ok(ProcessOutput {
            status_code: Some(0),
            ..Default::default()
        })
    }
}

/// Counts fetches and delegates to the real fetcher
struct SpyFetcher {
    calls: AtomicUsize,
    inner: HttpFrameFetcher,
}

impl SpyFetcher {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            inner: HttpFrameFetcher::new(Duration::from_secs(5)).unwrap(),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameFetcher for SpyFetcher {
    async fn fetch(
        &self,
        reference: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(reference, dest, cancel).await
    }
}

struct Fixture {
    root: TempDir,
    store: Arc<MemoryEdgeEventStore>,
    ffmpeg: PathBuf,
}

impl Fixture {
    fn new() -> Result<Self> {
        let root = TempDir::new()?;
        let ffmpeg = root.path().join("bin/ffmpeg");
        std::fs::create_dir_all(ffmpeg.parent().unwrap())?;
        std::fs::write(&ffmpeg, b"")?;
        Ok(Self {
            root,
            store: Arc::new(MemoryEdgeEventStore::new()),
            ffmpeg,
        })
    }

    /// Writes a local frame and records an event pointing at it
    async fn add_frame(&self, name: &str, second: u32) -> Result<PathBuf> {
        let dir = self.root.path().join("source");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xD9])?;

        self.store
            .insert(event(path.to_string_lossy().as_ref(), second))
            .await;
        Ok(std::fs::canonicalize(path)?)
    }

    fn service(
        &self,
        fetcher: Arc<dyn FrameFetcher>,
        runner: Arc<dyn ProcessRunner>,
        ffmpeg: &Path,
    ) -> TimelapseService {
        TimelapseService::new(
            self.store.clone(),
            fetcher,
            runner,
            TimelapseEncoder::new(ffmpeg),
            self.root.path(),
            OUTPUT_SUBFOLDER,
            1,
        )
    }

    fn output_dir(&self) -> PathBuf {
        self.root.path().join(OUTPUT_SUBFOLDER)
    }

    fn run_dirs(&self) -> usize {
        std::fs::read_dir(self.output_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    fn config(&self) -> EdgeServiceConfig {
        EdgeServiceConfig {
            storage_root: self.root.path().to_path_buf(),
            public_base_url: Some("http://edge.test".to_string()),
            ffmpeg_path: self.ffmpeg.clone(),
            timelapse_output_subfolder: OUTPUT_SUBFOLDER.to_string(),
            ..Default::default()
        }
    }
}

fn event(frame_raw_url: &str, second: u32) -> EdgeEvent {
    CreateEdgeEventRequest {
        capture_timestamp_utc: Utc.with_ymd_and_hms(2025, 11, 10, 8, 0, second).unwrap(),
        camera_id: "cam-yard".to_string(),
        compute_model: None,
        compute_inference_ms: None,
        image_width: Some(640),
        image_height: Some(480),
        detections: None,
        frame_raw_url: frame_raw_url.to_string(),
        frame_annotated_url: None,
    }
    .into_event(Utc::now())
}

#[tokio::test]
async fn test_generate_orders_frames_and_cleans_workspace() -> Result<()> {
    let fixture = Fixture::new()?;
    // Inserted out of capture order
    let third = fixture.add_frame("c.jpg", 30).await?;
    let first = fixture.add_frame("a.jpg", 10).await?;
    let second = fixture.add_frame("b.jpg", 20).await?;

    let ffmpeg = Arc::new(FakeFfmpeg::default());
    let service = fixture.service(
        Arc::new(SpyFetcher::new()),
        ffmpeg.clone(),
        &fixture.ffmpeg,
    );

    let artifact = service
        .generate(&TimelapseRequest::default(), &CancellationToken::new())
        .await?;

    assert_eq!(artifact.frame_count, 3);
    assert!(artifact.relative_path.starts_with("/uploads/timelapses/"));
    assert!(artifact.relative_path.ends_with("/video.mp4"));
    assert_eq!(std::fs::read(&artifact.physical_path)?, VIDEO_BYTES);

    let expected = [&first, &second, &third]
        .iter()
        .map(|p| format!("file '{}'\nduration 0.05\n", p.display()))
        .collect::<String>()
        + &format!("file '{}'\n", third.display());
    assert_eq!(ffmpeg.manifest().as_deref(), Some(expected.as_str()));

    let args = ffmpeg.args.lock().unwrap().clone();
    assert!(args.windows(2).any(|w| w == ["-preset", "veryfast"]));
    assert!(args.windows(2).any(|w| w == ["-crf", "18"]));
    assert!(args.windows(2).any(|w| w == ["-vf", "format=yuv420p"]));

    // Only the video survives in the run directory
    let run_dir = artifact.physical_path.parent().unwrap();
    let remaining: Vec<String> = std::fs::read_dir(run_dir)?
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(remaining, vec!["video.mp4".to_string()]);

    Ok(())
}

#[tokio::test]
async fn test_generate_applies_request_settings() -> Result<()> {
    let fixture = Fixture::new()?;
    for (i, name) in ["a.jpg", "b.jpg", "c.jpg"].iter().enumerate() {
        fixture.add_frame(name, i as u32).await?;
    }

    let ffmpeg = Arc::new(FakeFfmpeg::default());
    let service = fixture.service(
        Arc::new(SpyFetcher::new()),
        ffmpeg.clone(),
        &fixture.ffmpeg,
    );

    let request = TimelapseRequest {
        fps: Some(10),
        width: Some(640),
        max_frames: Some(2),
        crf: Some(99),
        preset: Some("SLOW".to_string()),
        ..Default::default()
    };
    let artifact = service.generate(&request, &CancellationToken::new()).await?;
    assert_eq!(artifact.frame_count, 2);

    let manifest = ffmpeg.manifest().unwrap();
    assert_eq!(manifest.matches("duration 0.1\n").count(), 2);

    let args = ffmpeg.args.lock().unwrap().clone();
    assert!(args.windows(2).any(|w| w == ["-preset", "slow"]));
    assert!(args.windows(2).any(|w| w == ["-crf", "51"]));
    assert!(args.windows(2).any(|w| w == ["-r", "10"]));
    assert!(args
        .windows(2)
        .any(|w| w == ["-vf", "scale=640:-2,format=yuv420p"]));

    Ok(())
}

#[tokio::test]
async fn test_missing_encoder_fails_before_fetching() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.add_frame("a.jpg", 1).await?;
    fixture.add_frame("b.jpg", 2).await?;

    let spy = Arc::new(SpyFetcher::new());
    let service = fixture.service(
        spy.clone(),
        Arc::new(FakeFfmpeg::default()),
        &fixture.root.path().join("bin/not-ffmpeg"),
    );

    let err = service
        .generate(&TimelapseRequest::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::EncoderNotFound(_)));
    assert_eq!(spy.calls(), 0);
    assert_eq!(fixture.run_dirs(), 0);

    Ok(())
}

#[tokio::test]
async fn test_single_frame_is_insufficient() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.add_frame("only.jpg", 1).await?;

    let spy = Arc::new(SpyFetcher::new());
    let service = fixture.service(spy.clone(), Arc::new(FakeFfmpeg::default()), &fixture.ffmpeg);

    let err = service
        .generate(&TimelapseRequest::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InsufficientFrames {
            required: 2,
            found: 1
        }
    ));
    assert_eq!(spy.calls(), 0);

    Ok(())
}

#[tokio::test]
async fn test_encoder_failure_removes_run_directory() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.add_frame("a.jpg", 1).await?;
    fixture.add_frame("b.jpg", 2).await?;

    let ffmpeg = Arc::new(FakeFfmpeg::failing());
    let service = fixture.service(Arc::new(SpyFetcher::new()), ffmpeg.clone(), &fixture.ffmpeg);

    let err = service
        .generate(&TimelapseRequest::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        PipelineError::EncodingFailed(stderr) => assert!(stderr.contains("Invalid data")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(ffmpeg.manifest().is_some());
    assert_eq!(fixture.run_dirs(), 0);

    Ok(())
}

#[tokio::test]
async fn test_cancelled_run_does_not_encode() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.add_frame("a.jpg", 1).await?;
    fixture.add_frame("b.jpg", 2).await?;

    let ffmpeg = Arc::new(FakeFfmpeg::default());
    let service = fixture.service(Arc::new(SpyFetcher::new()), ffmpeg.clone(), &fixture.ffmpeg);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = service
        .generate(&TimelapseRequest::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert!(ffmpeg.manifest().is_none());
    assert_eq!(fixture.run_dirs(), 0);

    Ok(())
}

/// Writes a partial video and then never finishes
struct StalledFfmpeg;

#[async_trait]
impl ProcessRunner for StalledFfmpeg {
    async fn run(
        &self,
        _program: &Path,
        args: &[String],
        _workdir: &Path,
        _cancel: &CancellationToken,
    ) -> Result<ProcessOutput, PipelineError> {
        std::fs::write(args.last().unwrap(), b"partial").unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ProcessOutput::default())
    }
}

#[tokio::test]
async fn test_abandoned_run_leaves_no_partial_video() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.add_frame("a.jpg", 1).await?;
    fixture.add_frame("b.jpg", 2).await?;

    let service = fixture.service(
        Arc::new(SpyFetcher::new()),
        Arc::new(StalledFfmpeg),
        &fixture.ffmpeg,
    );

    // The caller going away drops the in-flight run
    let request = TimelapseRequest::default();
    let cancel = CancellationToken::new();
    let outcome = tokio::time::timeout(
        Duration::from_millis(300),
        service.generate(&request, &cancel),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(fixture.run_dirs(), 0);

    Ok(())
}

async fn frame_server() -> Result<String> {
    let app = Router::new().route(
        "/frames/:name",
        get(|UrlPath(name): UrlPath<String>| async move {
            if name == "missing.jpg" {
                (StatusCode::NOT_FOUND, Vec::new())
            } else {
                (StatusCode::OK, format!("jpeg:{name}").into_bytes())
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

#[tokio::test]
async fn test_http_fetcher_downloads_remote_frames() -> Result<()> {
    let base = frame_server().await?;
    let dir = TempDir::new()?;
    let fetcher = HttpFrameFetcher::new(Duration::from_secs(5))?;
    let cancel = CancellationToken::new();

    let dest = dir.path().join("frame_000000.jpg");
    let path = fetcher
        .fetch(&format!("{base}/frames/a.jpg"), &dest, &cancel)
        .await?;
    assert_eq!(path, dest);
    assert_eq!(std::fs::read(&dest)?, b"jpeg:a.jpg");

    let err = fetcher
        .fetch(
            &format!("{base}/frames/missing.jpg"),
            &dir.path().join("frame_000001.jpg"),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::FrameFetch { .. }));

    Ok(())
}

#[tokio::test]
async fn test_pipeline_with_remote_frames() -> Result<()> {
    let base = frame_server().await?;
    let fixture = Fixture::new()?;
    fixture
        .store
        .insert(event(&format!("{base}/frames/two.jpg"), 2))
        .await;
    fixture
        .store
        .insert(event(&format!("{base}/frames/one.jpg"), 1))
        .await;

    let ffmpeg = Arc::new(FakeFfmpeg::default());
    let service = fixture.service(Arc::new(SpyFetcher::new()), ffmpeg.clone(), &fixture.ffmpeg);

    let artifact = service
        .generate(&TimelapseRequest::default(), &CancellationToken::new())
        .await?;
    assert_eq!(artifact.frame_count, 2);

    // Remote frames land in the run's frames directory
    let manifest = ffmpeg.manifest().unwrap();
    assert!(manifest.contains("/frames/frame_000000.jpg'"));
    assert!(manifest.contains("/frames/frame_000001.jpg'"));

    Ok(())
}

#[tokio::test]
async fn test_remote_fetch_failure_aborts_run() -> Result<()> {
    let base = frame_server().await?;
    let fixture = Fixture::new()?;
    fixture.add_frame("a.jpg", 1).await?;
    fixture
        .store
        .insert(event(&format!("{base}/frames/missing.jpg"), 2))
        .await;

    let ffmpeg = Arc::new(FakeFfmpeg::default());
    let service = fixture.service(Arc::new(SpyFetcher::new()), ffmpeg.clone(), &fixture.ffmpeg);

    let err = service
        .generate(&TimelapseRequest::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::FrameFetch { .. }));
    assert!(ffmpeg.manifest().is_none());
    assert_eq!(fixture.run_dirs(), 0);

    Ok(())
}

fn test_server(fixture: &Fixture, runner: Arc<dyn ProcessRunner>) -> Result<TestServer> {
    test_server_with_config(fixture, fixture.config(), runner)
}

fn test_server_with_config(
    fixture: &Fixture,
    config: EdgeServiceConfig,
    runner: Arc<dyn ProcessRunner>,
) -> Result<TestServer> {
    let store: Arc<dyn EdgeEventStore> = fixture.store.clone();
    let state = EdgeState::with_pipeline(
        config,
        store,
        Arc::new(SpyFetcher::new()),
        runner,
        CancellationToken::new(),
    );
    Ok(TestServer::new(create_router(state))?)
}

#[tokio::test]
async fn test_generate_endpoint_returns_download_url() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.add_frame("a.jpg", 1).await?;
    fixture.add_frame("b.jpg", 2).await?;
    let server = test_server(&fixture, Arc::new(FakeFfmpeg::default()))?;

    let response = server
        .post("/api/v1/timelapse/generate-from-edge")
        .json(&json!({ "fps": 24, "preset": "fast" }))
        .await;
    response.assert_status_ok();

    let body: Value = response.json();
    let url = body["downloadUrl"].as_str().unwrap();
    assert!(url.starts_with("/uploads/timelapses/"));
    assert!(url.ends_with("/video.mp4"));

    let video = server.get(url).await;
    video.assert_status_ok();
    assert_eq!(video.as_bytes().to_vec(), VIDEO_BYTES.to_vec());

    Ok(())
}

#[tokio::test]
async fn test_download_url_is_served_with_custom_uploads_dir() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.add_frame("a.jpg", 1).await?;
    fixture.add_frame("b.jpg", 2).await?;
    let config = EdgeServiceConfig {
        uploads_dir: "media".to_string(),
        timelapse_output_subfolder: "media/clips".to_string(),
        ..fixture.config()
    };
    config.validate()?;
    let server = test_server_with_config(&fixture, config, Arc::new(FakeFfmpeg::default()))?;

    let response = server
        .post("/api/v1/timelapse/generate-from-edge")
        .json(&json!({}))
        .await;
    response.assert_status_ok();

    let body: Value = response.json();
    let url = body["downloadUrl"].as_str().unwrap();
    assert!(url.starts_with("/uploads/clips/"));

    let video = server.get(url).await;
    video.assert_status_ok();
    assert_eq!(video.as_bytes().to_vec(), VIDEO_BYTES.to_vec());

    Ok(())
}

#[tokio::test]
async fn test_generate_endpoint_reports_insufficient_frames() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.add_frame("a.jpg", 1).await?;
    let server = test_server(&fixture, Arc::new(FakeFfmpeg::default()))?;

    let response = server
        .post("/api/v1/timelapse/generate-from-edge")
        .json(&json!({}))
        .await;
    response.assert_status(StatusCode::CONFLICT);

    Ok(())
}

#[tokio::test]
async fn test_stream_endpoint_serves_inline_video() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.add_frame("a.jpg", 1).await?;
    fixture.add_frame("b.jpg", 2).await?;
    let server = test_server(&fixture, Arc::new(FakeFfmpeg::default()))?;

    let response = server.get("/api/v1/timelapse/from-edge/stream").await;
    response.assert_status_ok();
    assert_eq!(response.header(header::CONTENT_TYPE), "video/mp4");
    assert_eq!(
        response.header(header::CONTENT_DISPOSITION),
        "inline; filename=\"video.mp4\""
    );
    assert_eq!(response.as_bytes().to_vec(), VIDEO_BYTES.to_vec());

    let partial = server
        .get("/api/v1/timelapse/from-edge/stream")
        .add_query_param("search", "cam-yard")
        .add_header(
            HeaderName::from_static("range"),
            HeaderValue::from_static("bytes=0-3"),
        )
        .await;
    partial.assert_status(StatusCode::PARTIAL_CONTENT);
    assert_eq!(partial.as_bytes().to_vec(), b"fake".to_vec());

    Ok(())
}
