use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PipelineError;

pub const MANIFEST_FILE: &str = "list.txt";
pub const VIDEO_FILE: &str = "video.mp4";
pub const FRAMES_DIR: &str = "frames";

/// Scratch directory of a single timelapse run.
///
/// Layout: `<root>/<subfolder>/<run_id>/{frames/, list.txt, video.mp4}`.
/// Once [`RunWorkspace::mark_completed`] is called only `video.mp4` survives
/// [`RunWorkspace::cleanup`]. A workspace dropped before completion removes
/// its whole directory, so an abandoned run leaves no partial artifact.
#[derive(Debug)]
pub struct RunWorkspace {
    run_id: String,
    subfolder: String,
    dir: PathBuf,
    completed: bool,
    cleaned: bool,
}

impl RunWorkspace {
    /// Allocate a fresh run directory. `subfolder` must already be normalized.
    pub async fn create(root: &Path, subfolder: &str) -> Result<Self, PipelineError> {
        let run_id = Uuid::new_v4().simple().to_string();
        let dir = root.join(subfolder).join(&run_id);
        tokio::fs::create_dir_all(dir.join(FRAMES_DIR)).await?;

        debug!(run_id = %run_id, dir = %dir.display(), "created timelapse workspace");
        Ok(Self {
            run_id,
            subfolder: subfolder.to_string(),
            dir,
            completed: false,
            cleaned: false,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.dir.join(FRAMES_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn video_path(&self) -> PathBuf {
        self.dir.join(VIDEO_FILE)
    }

    /// Root-relative artifact path, e.g. `/uploads/timelapses/<run>/video.mp4`
    pub fn relative_video_path(&self) -> String {
        format!(
            "/{}/{}/{}",
            self.subfolder.trim_matches('/'),
            self.run_id,
            VIDEO_FILE
        )
    }

    /// The video has been verified; it is kept from now on
    pub fn mark_completed(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Remove the manifest and the frames directory. Errors are logged only.
    pub async fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        log_removal(
            &self.run_id,
            "manifest",
            tokio::fs::remove_file(self.manifest_path()).await,
        );
        log_removal(
            &self.run_id,
            "frames directory",
            tokio::fs::remove_dir_all(self.frames_dir()).await,
        );
        debug!(run_id = %self.run_id, "cleaned timelapse workspace");
    }

    /// Remove the whole run directory, artifact included
    pub async fn discard(&mut self) {
        self.cleaned = true;
        self.completed = false;
        log_removal(
            &self.run_id,
            "run directory",
            tokio::fs::remove_dir_all(&self.dir).await,
        );
    }
}

fn log_removal(run_id: &str, what: &str, result: std::io::Result<()>) {
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(run_id = %run_id, error = %e, "failed to remove {what}");
        }
    }
}

impl Drop for RunWorkspace {
    fn drop(&mut self) {
        // Drop cannot await; these are the blocking equivalents
        if !self.completed {
            if self.dir.exists() {
                log_removal(&self.run_id, "run directory", std::fs::remove_dir_all(&self.dir));
                debug!(run_id = %self.run_id, "discarded unfinished timelapse workspace");
            }
        } else if !self.cleaned {
            log_removal(
                &self.run_id,
                "manifest",
                std::fs::remove_file(self.manifest_path()),
            );
            log_removal(
                &self.run_id,
                "frames directory",
                std::fs::remove_dir_all(self.frames_dir()),
            );
        }
    }
}
