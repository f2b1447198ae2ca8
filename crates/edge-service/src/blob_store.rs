use chrono::Utc;
use common::validation::{normalize_relative_folder, validate_path_components};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;

/// Image extensions accepted for upload (compared lower-case)
pub const ALLOWED_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".gif"];

/// File storage for uploaded frames.
///
/// Files land under `<root>/<folder>/<yyyy-MM>/<uuid><ext>`; callers only
/// ever see the part after `<root>`, with forward slashes.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the storage root if it does not exist yet
    pub async fn init(&self) -> Result<(), PipelineError> {
        if !fs::try_exists(&self.root).await? {
            fs::create_dir_all(&self.root).await?;
            info!("created blob storage directory: {:?}", self.root);
        }
        Ok(())
    }

    /// Store `data` and return its reference relative to the storage root.
    pub async fn save(
        &self,
        data: &[u8],
        file_name: &str,
        folder: &str,
    ) -> Result<String, PipelineError> {
        if data.is_empty() {
            return Err(PipelineError::validation("file", "empty file"));
        }

        let ext = allowed_extension(file_name)?;
        let folder = normalize_relative_folder(folder, "folder")
            .map_err(|e| PipelineError::validation("folder", e.to_string()))?;

        let bucket = Utc::now().format("%Y-%m").to_string();
        let name = format!("{}{}", Uuid::new_v4(), ext);
        let reference = format!("{folder}/{bucket}/{name}");

        let dir = self.root.join(&folder).join(&bucket);
        fs::create_dir_all(&dir).await?;

        let path = dir.join(&name);
        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;

        debug!(reference = %reference, bytes = data.len(), "stored blob");
        Ok(reference)
    }

    /// Best-effort delete. Empty, missing or unsafe references are ignored.
    pub async fn delete(&self, reference: &str) {
        let reference = reference.trim().trim_start_matches('/');
        if reference.is_empty() {
            return;
        }

        let path = match self.resolve(reference) {
            Ok(path) => path,
            Err(e) => {
                warn!(reference = %reference, error = %e, "refusing to delete blob");
                return;
            }
        };

        match fs::remove_file(&path).await {
            Ok(()) => debug!(reference = %reference, "deleted blob"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(reference = %reference, "blob already absent")
            }
            Err(e) => warn!(reference = %reference, error = %e, "failed to delete blob"),
        }
    }

    /// Physical path of a stored reference
    pub fn resolve(&self, reference: &str) -> Result<PathBuf, PipelineError> {
        validate_path_components(
            Path::new(reference.trim_start_matches('/')),
            &self.root,
            "reference",
        )
        .map_err(|e| PipelineError::validation("reference", e.to_string()))
    }
}

fn allowed_extension(file_name: &str) -> Result<String, PipelineError> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();

    if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ext)
    } else if ext.is_empty() {
        Err(PipelineError::UnsupportedMedia(format!(
            "file '{file_name}' has no extension"
        )))
    } else {
        Err(PipelineError::UnsupportedMedia(format!(
            "extension '{ext}' is not allowed"
        )))
    }
}
