use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// Result of a finished subprocess
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// Port for running an external program to completion.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `program` in `workdir`, capturing both output streams.
    ///
    /// Cancellation must terminate the child; no process may outlive the
    /// returned future.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, PipelineError>;
}

/// Runs programs with `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        debug!(program = %program.display(), args = ?args, "spawning process");

        let child = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PipelineError::EncodingFailed(format!(
                    "failed to spawn {}: {e}",
                    program.display()
                ))
            })?;

        // wait_with_output drains both pipes concurrently; dropping the
        // future on cancel drops the child, which kills it.
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program = %program.display(), "process cancelled, terminating");
                Err(PipelineError::Cancelled)
            }
            output = child.wait_with_output() => {
                let output = output?;
                Ok(ProcessOutput {
                    status_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
        }
    }
}
