use anyhow::{Context, Result};
use common::validation::normalize_relative_folder;
use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EdgeStoreType {
    Memory,
    Postgres,
}

#[derive(Clone, Debug)]
pub struct EdgeServiceConfig {
    pub bind_addr: SocketAddr,
    pub store_type: EdgeStoreType,
    pub database_url: Option<String>,
    /// Physical root for uploads and timelapse output
    pub storage_root: PathBuf,
    /// Blob folder below `storage_root`, served at `/uploads`
    pub uploads_dir: String,
    pub public_base_url: Option<String>,
    pub ffmpeg_path: PathBuf,
    pub timelapse_output_subfolder: String,
    pub timelapse_max_concurrent: usize,
    pub frame_fetch_timeout: Duration,
    pub max_upload_bytes: usize,
    pub read_cache_ttl: Duration,
}

impl Default for EdgeServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            store_type: EdgeStoreType::Memory,
            database_url: None,
            storage_root: PathBuf::from("./wwwroot"),
            uploads_dir: "uploads".to_string(),
            public_base_url: None,
            ffmpeg_path: PathBuf::from("/usr/bin/ffmpeg"),
            timelapse_output_subfolder: "uploads/timelapses".to_string(),
            timelapse_max_concurrent: 2,
            frame_fetch_timeout: Duration::from_secs(30),
            max_upload_bytes: 25_000_000,
            read_cache_ttl: Duration::from_secs(30),
        }
    }
}

impl EdgeServiceConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let bind = env::var("EDGE_SERVICE_ADDR").unwrap_or_else(|_| "0.0.0.0:8090".to_string());
        let bind_addr: SocketAddr = bind.parse().context("invalid EDGE_SERVICE_ADDR")?;

        let database_url = env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty());

        let store_type = match env::var("EDGE_STORE_TYPE")
            .map(|v| v.to_lowercase())
            .ok()
            .as_deref()
        {
            Some("postgres") | Some("postgresql") => EdgeStoreType::Postgres,
            Some("memory") => EdgeStoreType::Memory,
            _ if database_url.is_some() => EdgeStoreType::Postgres,
            _ => EdgeStoreType::Memory,
        };
        if store_type == EdgeStoreType::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL required for Postgres store");
        }

        let storage_root = env::var("STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_root);

        let uploads_dir = normalize_relative_folder(
            &env::var("UPLOADS_DIR").unwrap_or(defaults.uploads_dir),
            "UPLOADS_DIR",
        )?;

        let public_base_url = env::var("PUBLIC_BASE_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty());

        let ffmpeg_path = env::var("FFMPEG_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.ffmpeg_path);

        let timelapse_output_subfolder = normalize_relative_folder(
            &env::var("TIMELAPSE_OUTPUT_SUBFOLDER").unwrap_or(defaults.timelapse_output_subfolder),
            "TIMELAPSE_OUTPUT_SUBFOLDER",
        )?;

        let timelapse_max_concurrent = env::var("TIMELAPSE_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.timelapse_max_concurrent);

        let frame_fetch_timeout = env::var("FRAME_FETCH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.frame_fetch_timeout);

        let max_upload_bytes = env::var("MAX_UPLOAD_BYTES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.max_upload_bytes);

        let read_cache_ttl = env::var("READ_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.read_cache_ttl);

        let config = Self {
            bind_addr,
            store_type,
            database_url,
            storage_root,
            uploads_dir,
            public_base_url,
            ffmpeg_path,
            timelapse_output_subfolder,
            timelapse_max_concurrent,
            frame_fetch_timeout,
            max_upload_bytes,
            read_cache_ttl,
        };
        config.validate()?;
        Ok(config)
    }

    /// Timelapse videos are only reachable through the `/uploads` mount, so
    /// their folder must sit inside `uploads_dir`.
    pub fn validate(&self) -> Result<()> {
        let uploads = Path::new(&self.uploads_dir);
        let output = Path::new(&self.timelapse_output_subfolder);
        if output == uploads || !output.starts_with(uploads) {
            anyhow::bail!(
                "TIMELAPSE_OUTPUT_SUBFOLDER ({}) must be a folder inside UPLOADS_DIR ({})",
                self.timelapse_output_subfolder,
                self.uploads_dir
            );
        }
        Ok(())
    }

    /// Physical directory holding uploaded blobs
    pub fn uploads_root(&self) -> PathBuf {
        self.storage_root.join(&self.uploads_dir)
    }

    /// Map a `STORAGE_ROOT`-relative path such as `/uploads/timelapses/<run>/video.mp4`
    /// to the URL path it is served at under the `/uploads` mount.
    pub fn served_path(&self, root_relative: &str) -> String {
        let path = root_relative.trim_start_matches('/');
        let below_uploads = path
            .strip_prefix(self.uploads_dir.as_str())
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .unwrap_or(path);
        format!("/uploads/{}", below_uploads.trim_start_matches('/'))
    }
}
