//! ffmpeg concat-demuxer encoding of a frame sequence into H.264 MP4.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::process::ProcessRunner;
use super::workspace::RunWorkspace;
use crate::error::PipelineError;

/// libx264 speed/quality presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum X264Preset {
    Ultrafast,
    Superfast,
    #[default]
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    Veryslow,
    Placebo,
}

impl X264Preset {
    pub const ALL: [X264Preset; 10] = [
        X264Preset::Ultrafast,
        X264Preset::Superfast,
        X264Preset::Veryfast,
        X264Preset::Faster,
        X264Preset::Fast,
        X264Preset::Medium,
        X264Preset::Slow,
        X264Preset::Slower,
        X264Preset::Veryslow,
        X264Preset::Placebo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            X264Preset::Ultrafast => "ultrafast",
            X264Preset::Superfast => "superfast",
            X264Preset::Veryfast => "veryfast",
            X264Preset::Faster => "faster",
            X264Preset::Fast => "fast",
            X264Preset::Medium => "medium",
            X264Preset::Slow => "slow",
            X264Preset::Slower => "slower",
            X264Preset::Veryslow => "veryslow",
            X264Preset::Placebo => "placebo",
        }
    }

    /// Unknown or missing names fall back to the default preset.
    pub fn normalize(name: Option<&str>) -> Self {
        name.and_then(|n| n.parse().ok()).unwrap_or_default()
    }
}

impl FromStr for X264Preset {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

impl fmt::Display for X264Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Already-normalized encoder parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeSettings {
    pub fps: u32,
    /// 0 keeps the source resolution
    pub width: u32,
    pub crf: u8,
    pub preset: X264Preset,
}

/// Drives the ffmpeg binary through a [`ProcessRunner`].
pub struct TimelapseEncoder {
    ffmpeg_path: PathBuf,
}

impl TimelapseEncoder {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg_path
    }

    /// Fail fast when the executable is missing
    pub async fn ensure_available(&self) -> Result<(), PipelineError> {
        match tokio::fs::metadata(&self.ffmpeg_path).await {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(PipelineError::EncoderNotFound(
                self.ffmpeg_path.display().to_string(),
            )),
        }
    }

    /// Write the manifest and run ffmpeg. Diagnostics of a failed run are
    /// logged and carried in `EncodingFailed`.
    pub async fn encode(
        &self,
        runner: &dyn ProcessRunner,
        frames: &[PathBuf],
        settings: EncodeSettings,
        workspace: &RunWorkspace,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let manifest_path = workspace.manifest_path();
        let output_path = workspace.video_path();
        tokio::fs::write(&manifest_path, build_manifest(frames, settings.fps)).await?;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let args = build_args(&manifest_path, &output_path, settings);
        debug!(args = ?args, "running ffmpeg");

        let output = runner
            .run(&self.ffmpeg_path, &args, workspace.dir(), cancel)
            .await?;
        if !output.success() {
            error!(
                status = ?output.status_code,
                stderr = %output.stderr,
                "ffmpeg timelapse encoding failed"
            );
            let diagnostics = if output.stderr.trim().is_empty() {
                output.stdout
            } else {
                output.stderr
            };
            return Err(PipelineError::EncodingFailed(diagnostics));
        }

        info!(
            run_id = %workspace.run_id(),
            frames = frames.len(),
            fps = settings.fps,
            output = %output_path.display(),
            "timelapse encoded"
        );
        Ok(())
    }
}

/// Concat-demuxer manifest.
///
/// Each frame gets a `file` line and a `duration` line of `1/fps` seconds;
/// the last frame is listed once more without a duration so the demuxer
/// honours the final duration.
pub fn build_manifest(frames: &[PathBuf], fps: u32) -> String {
    let duration = format_duration(1.0 / f64::from(fps.max(1)));
    let mut out = String::new();

    for frame in frames {
        out.push_str(&file_line(frame));
        out.push_str(&format!("duration {duration}\n"));
    }
    if let Some(last) = frames.last() {
        out.push_str(&file_line(last));
    }
    out
}

fn file_line(path: &Path) -> String {
    let normalized = path.to_string_lossy().replace('\\', "/");
    format!("file '{}'\n", normalized.replace('\'', "'\\''"))
}

/// Up to six decimals, trailing zeros removed (`0.05`, `0.033333`, `1`)
fn format_duration(secs: f64) -> String {
    let text = format!("{secs:.6}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

pub fn build_args(manifest: &Path, output: &Path, settings: EncodeSettings) -> Vec<String> {
    let filter = if settings.width > 0 {
        format!("scale={}:-2,format=yuv420p", settings.width)
    } else {
        "format=yuv420p".to_string()
    };

    vec![
        "-y".to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        manifest.to_string_lossy().into_owned(),
        "-r".to_string(),
        settings.fps.to_string(),
        "-vf".to_string(),
        filter,
        "-c:v".to_string(),
        "libx264".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-crf".to_string(),
        settings.crf.to_string(),
        "-preset".to_string(),
        settings.preset.to_string(),
        "-profile:v".to_string(),
        "high".to_string(),
        "-level".to_string(),
        "5.2".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}
