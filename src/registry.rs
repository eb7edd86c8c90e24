//! Token registry: the only owner of prepared files between `prepare` and their reclamation.
//!
//! A token leaves the map exactly once, through `claim`, `remove`, `expire` or `sweep`.
//! Whoever takes it out is responsible for deleting the backing file and its job directory.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Preparing,
    Ready,
    Consumed,
    Expired,
}

#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub token: Uuid,
    pub job_dir: PathBuf,
    pub file_path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: &'static str,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: FileState,
}

impl PreparedFile {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Delivered,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    entries: Arc<Mutex<HashMap<Uuid, PreparedFile>>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, file: PreparedFile) -> Result<(), DownloadError> {
        if matches!(file.state, FileState::Consumed | FileState::Expired) {
            return Err(DownloadError::internal("cannot register a reclaimed file"));
        }
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&file.token) {
            return Err(DownloadError::internal("token collision"));
        }
        entries.insert(file.token, file);
        Ok(())
    }

    pub async fn get(&self, token: &Uuid) -> Result<PreparedFile, DownloadError> {
        let entries = self.entries.lock().await;
        entries
            .get(token)
            .filter(|file| !file.is_expired_at(Utc::now()))
            .cloned()
            .ok_or(DownloadError::NotFound)
    }

    /// Takes a ready entry out of the registry for streaming. At most one caller wins.
    pub async fn claim(&self, token: &Uuid) -> Result<ClaimedFile, DownloadError> {
        let expired = {
            let mut entries = self.entries.lock().await;
            match entries.get(token).map(|file| file.state) {
                Some(FileState::Ready) => {}
                Some(FileState::Preparing) => return Err(DownloadError::NotReady),
                _ => return Err(DownloadError::NotFound),
            }

            let Some(file) = entries.remove(token) else {
                return Err(DownloadError::NotFound);
            };
            if !file.is_expired_at(Utc::now()) {
                debug!(%token, "token claimed");
                return Ok(ClaimedFile::new(file));
            }
            file
        };

        info!(token = %expired.token, "token expired before download started");
        discard(&expired, FileState::Expired).await;
        Err(DownloadError::NotFound)
    }

    pub async fn remove(&self, token: &Uuid) -> Option<PreparedFile> {
        self.entries.lock().await.remove(token)
    }

    pub async fn expire(&self, token: &Uuid) -> bool {
        match self.remove(token).await {
            Some(file) => {
                info!(%token, "reclaiming unconsumed download");
                discard(&file, FileState::Expired).await;
                true
            }
            None => false,
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<PreparedFile> = {
            let mut entries = self.entries.lock().await;
            let tokens: Vec<Uuid> = entries
                .values()
                .filter(|file| file.is_expired_at(now))
                .map(|file| file.token)
                .collect();
            tokens
                .iter()
                .filter_map(|token| entries.remove(token))
                .collect()
        };

        let count = expired.len();
        for file in expired {
            discard(&file, FileState::Expired).await;
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// A file taken out of the registry for one transfer. Cleanup runs once, whichever
/// of completion, error or drop gets there first.
#[derive(Debug)]
pub struct ClaimedFile {
    file: PreparedFile,
    finished: AtomicBool,
}

impl ClaimedFile {
    fn new(file: PreparedFile) -> Self {
        Self {
            file,
            finished: AtomicBool::new(false),
        }
    }

    pub fn file(&self) -> &PreparedFile {
        &self.file
    }

    fn begin_release(&self, outcome: StreamOutcome) -> Option<PreparedFile> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return None;
        }

        match outcome {
            StreamOutcome::Delivered => info!(token = %self.file.token, "download delivered"),
            StreamOutcome::Failed => warn!(token = %self.file.token, "download failed mid-stream"),
            StreamOutcome::Aborted => info!(token = %self.file.token, "download aborted by client"),
        }
        Some(self.file.clone())
    }

    /// Deletes the backing file. Returns true only for the call that performed the cleanup.
    pub async fn release(&self, outcome: StreamOutcome) -> bool {
        match self.begin_release(outcome) {
            Some(file) => {
                discard(&file, FileState::Consumed).await;
                true
            }
            None => false,
        }
    }

    pub fn release_in_background(&self, outcome: StreamOutcome) -> bool {
        let Some(file) = self.begin_release(outcome) else {
            return false;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { discard(&file, FileState::Consumed).await });
            }
            Err(_) => discard_blocking(&file),
        }
        true
    }
}

impl Drop for ClaimedFile {
    fn drop(&mut self) {
        self.release_in_background(StreamOutcome::Aborted);
    }
}

async fn discard(file: &PreparedFile, state: FileState) {
    debug!(token = %file.token, ?state, job_dir = ?file.job_dir, "deleting prepared file");

    if let Err(error) = tokio::fs::remove_file(&file.file_path).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!(path = ?file.file_path, %error, "could not delete prepared file");
    }
    remove_job_dir(&file.job_dir).await;
}

pub(crate) async fn remove_job_dir(job_dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(job_dir).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!(path = ?job_dir, %error, "could not delete job directory");
    }
}

fn discard_blocking(file: &PreparedFile) {
    if let Err(error) = std::fs::remove_dir_all(&file.job_dir)
        && error.kind() != ErrorKind::NotFound
    {
        warn!(path = ?file.job_dir, %error, "could not delete job directory");
    }
}
