use std::{io::ErrorKind, path::PathBuf, process::Output, time::Duration};

use async_trait::async_trait;
use tokio::{process::Command, time::timeout};
use tracing::debug;

use crate::{error::DownloadError, format::WorkerCommand};

#[derive(Debug, Clone, Default)]
pub struct WorkerOutput {
    pub printed_path: Option<PathBuf>,
}

/// The external conversion tool. Either it leaves a file in `command.job_dir` or it fails.
#[async_trait]
pub trait ConversionWorker: Send + Sync {
    async fn fetch_metadata(&self, url: &str) -> Result<Vec<u8>, DownloadError>;

    async fn convert(&self, command: &WorkerCommand) -> Result<WorkerOutput, DownloadError>;
}

#[derive(Debug, Clone)]
pub struct YtDlpWorker {
    binary: String,
    timeout: Duration,
}

impl YtDlpWorker {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, DownloadError> {
        debug!(binary = %self.binary, ?args, "spawning worker");

        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| {
                DownloadError::worker(format!(
                    "{} timed out after {}s",
                    self.binary,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    DownloadError::internal(format!(
                        "{} is not installed or not on PATH",
                        self.binary
                    ))
                } else {
                    DownloadError::internal(format!("failed to run {}: {error}", self.binary))
                }
            })?;

        if !output.status.success() {
            return Err(DownloadError::worker(diagnostics(&output)));
        }

        Ok(output)
    }
}

#[async_trait]
impl ConversionWorker for YtDlpWorker {
    async fn fetch_metadata(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let output = self
            .run(vec![
                "-J".to_string(),
                "--no-playlist".to_string(),
                "--no-warnings".to_string(),
                url.to_string(),
            ])
            .await?;
        Ok(output.stdout)
    }

    async fn convert(&self, command: &WorkerCommand) -> Result<WorkerOutput, DownloadError> {
        let output = self.run(command.to_args()).await?;
        Ok(WorkerOutput {
            printed_path: extract_printed_path(&output.stdout),
        })
    }
}

fn diagnostics(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        match output.status.code() {
            Some(code) => format!("worker exited with code {code}"),
            None => "worker was terminated by a signal".to_string(),
        }
    } else {
        trimmed.to_string()
    }
}

fn extract_printed_path(stdout: &[u8]) -> Option<PathBuf> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(PathBuf::from)
}
