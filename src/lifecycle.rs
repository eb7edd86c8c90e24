use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    admission::AdmissionController,
    config::Config,
    error::DownloadError,
    format::{FormatSpec, WorkerCommand},
    registry::{FileState, PreparedFile, StreamOutcome, TokenRegistry, remove_job_dir},
    stream::ConsumingStream,
    worker::ConversionWorker,
};

pub const JOB_DIR_PREFIX: &str = "dl-";
const DOWNLOAD_ROUTE_PREFIX: &str = "/api/download/";
const PARTIAL_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreparedDownload {
    pub token: Uuid,
    pub download_url: String,
}

pub struct DownloadStream {
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: &'static str,
    pub body: ConsumingStream,
}

#[derive(Clone)]
pub struct DownloadManager {
    registry: TokenRegistry,
    admission: AdmissionController,
    worker: Arc<dyn ConversionWorker>,
    temp_root: PathBuf,
    token_ttl: Duration,
    expiry_grace: Duration,
}

impl DownloadManager {
    pub fn new(config: &Config, worker: Arc<dyn ConversionWorker>) -> Self {
        Self {
            registry: TokenRegistry::new(),
            admission: AdmissionController::new(config.max_prepare_concurrency),
            worker,
            temp_root: config.temp_root.clone(),
            token_ttl: config.token_ttl,
            expiry_grace: config.expiry_grace,
        }
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn worker(&self) -> &dyn ConversionWorker {
        self.worker.as_ref()
    }

    pub async fn prepare(
        &self,
        url: &str,
        format: &FormatSpec,
    ) -> Result<PreparedDownload, DownloadError> {
        let url = validate_source_url(url)?;
        let ttl = chrono::Duration::from_std(self.token_ttl)
            .map_err(|_| DownloadError::internal("token ttl out of range"))?;
        let expiry_delay = self
            .token_ttl
            .checked_add(self.expiry_grace)
            .ok_or_else(|| DownloadError::internal("token expiry out of range"))?;
        let _permit = self.admission.try_admit().ok_or_else(|| {
            warn!(%url, in_flight = self.admission.in_flight(), "rejecting prepare, all slots busy");
            DownloadError::Busy
        })?;

        let job_dir = self
            .temp_root
            .join(format!("{JOB_DIR_PREFIX}{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&job_dir).await.map_err(|error| {
            DownloadError::internal(format!("could not create job directory: {error}"))
        })?;

        let command = WorkerCommand::build(url, format, &job_dir);
        info!(%url, selector = ?command.format_selector(), ?job_dir, "starting conversion");

        let prepared: Result<PreparedFile, DownloadError> = async {
            let output = self.worker.convert(&command).await?;
            let file_path = locate_output(&job_dir, output.printed_path.as_deref()).await?;
            let metadata = tokio::fs::metadata(&file_path).await.map_err(|error| {
                DownloadError::internal(format!("could not read produced file: {error}"))
            })?;
            let file_name = file_path
                .file_name()
                .and_then(|name| name.to_str())
                .map(ToString::to_string)
                .unwrap_or_else(|| "download.bin".to_string());
            let created_at = Utc::now();
            let expires_at = created_at
                .checked_add_signed(ttl)
                .ok_or_else(|| DownloadError::internal("token ttl out of range"))?;

            Ok(PreparedFile {
                token: Uuid::new_v4(),
                job_dir: job_dir.clone(),
                file_path,
                mime_type: content_type_for_filename(&file_name),
                file_name,
                size_bytes: metadata.len(),
                source_url: url.to_string(),
                created_at,
                expires_at,
                state: FileState::Ready,
            })
        }
        .await;

        let file = match prepared {
            Ok(file) => file,
            Err(error) => {
                warn!(%url, %error, "prepare failed");
                remove_job_dir(&job_dir).await;
                return Err(error);
            }
        };

        let token = file.token;
        let size_bytes = file.size_bytes;
        if let Err(error) = self.registry.insert(file).await {
            remove_job_dir(&job_dir).await;
            return Err(error);
        }
        self.schedule_expiry(token, expiry_delay);

        info!(%token, %url, size_bytes, "download ready");
        Ok(PreparedDownload {
            token,
            download_url: format!("{DOWNLOAD_ROUTE_PREFIX}{token}"),
        })
    }

    pub async fn consume(&self, token: &str) -> Result<DownloadStream, DownloadError> {
        let token = Uuid::parse_str(token.trim()).map_err(|_| DownloadError::NotFound)?;
        let claim = self.registry.claim(&token).await?;

        let handle = match tokio::fs::File::open(&claim.file().file_path).await {
            Ok(handle) => handle,
            Err(error) => {
                claim.release(StreamOutcome::Failed).await;
                return Err(DownloadError::internal(format!(
                    "could not open prepared file: {error}"
                )));
            }
        };

        let file = claim.file();
        Ok(DownloadStream {
            file_name: file.file_name.clone(),
            size_bytes: file.size_bytes,
            mime_type: file.mime_type,
            body: ConsumingStream::new(handle, claim),
        })
    }

    fn schedule_expiry(&self, token: Uuid, delay: Duration) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.expire(&token).await;
        });
    }
}

pub fn validate_source_url(input: &str) -> Result<&str, DownloadError> {
    let url = input.trim();
    if url.is_empty() {
        return Err(DownloadError::validation("Missing url"));
    }

    let parsed = Url::parse(url).map_err(|_| DownloadError::validation("Invalid URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(DownloadError::validation("Invalid URL"));
    }

    Ok(url)
}

async fn locate_output(job_dir: &Path, printed_path: Option<&Path>) -> Result<PathBuf, DownloadError> {
    let canonical_job_dir = tokio::fs::canonicalize(job_dir).await.map_err(|error| {
        DownloadError::internal(format!("could not resolve job directory: {error}"))
    })?;

    if let Some(path) = printed_path {
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            job_dir.join(path)
        };
        if let Some(valid) = resolve_candidate(&canonical_job_dir, &candidate).await? {
            return Ok(valid);
        }
    }

    let mut entries = tokio::fs::read_dir(job_dir).await.map_err(|error| {
        DownloadError::internal(format!("could not open job directory: {error}"))
    })?;

    let mut produced = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|error| {
        DownloadError::internal(format!("could not list job directory: {error}"))
    })? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            continue;
        }
        if let Some(valid) = resolve_candidate(&canonical_job_dir, &path).await? {
            produced.push(valid);
        }
    }

    produced.sort();
    if produced.len() > 1 {
        warn!(?job_dir, count = produced.len(), "worker produced several files, keeping the first");
    }
    produced.into_iter().next().ok_or(DownloadError::EmptyOutput)
}

async fn resolve_candidate(
    canonical_job_dir: &Path,
    candidate: &Path,
) -> Result<Option<PathBuf>, DownloadError> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(DownloadError::internal(format!(
                "could not read produced file: {error}"
            )));
        }
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await.map_err(|error| {
        DownloadError::internal(format!("could not resolve produced file: {error}"))
    })?;

    if !canonical.starts_with(canonical_job_dir) {
        warn!(path = ?canonical, "ignoring file outside the job directory");
        return Ok(None);
    }

    Ok(Some(canonical))
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures_util::StreamExt;
    use tokio::sync::Notify;

    use super::*;
    use crate::worker::WorkerOutput;

    struct ScriptedWorker {
        files: Vec<(&'static str, &'static [u8])>,
        failure: Option<&'static str>,
        gate: Option<Arc<Notify>>,
        calls: AtomicUsize,
        last_selector: std::sync::Mutex<Option<String>>,
    }

    impl ScriptedWorker {
        fn producing(files: Vec<(&'static str, &'static [u8])>) -> Self {
            Self {
                files,
                failure: None,
                gate: None,
                calls: AtomicUsize::new(0),
                last_selector: std::sync::Mutex::new(None),
            }
        }

        fn failing(stderr: &'static str) -> Self {
            Self {
                failure: Some(stderr),
                ..Self::producing(Vec::new())
            }
        }
    }

    #[async_trait]
    impl ConversionWorker for ScriptedWorker {
        async fn fetch_metadata(&self, _url: &str) -> Result<Vec<u8>, DownloadError> {
            Err(DownloadError::internal("metadata not scripted"))
        }

        async fn convert(&self, command: &WorkerCommand) -> Result<WorkerOutput, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut selector) = self.last_selector.lock() {
                *selector = command.format_selector().map(ToString::to_string);
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(stderr) = self.failure {
                return Err(DownloadError::worker(stderr));
            }
            for (name, bytes) in &self.files {
                tokio::fs::write(command.job_dir.join(name), bytes)
                    .await
                    .map_err(|error| DownloadError::internal(error.to_string()))?;
            }
            Ok(WorkerOutput::default())
        }
    }

    fn test_config(root: &Path) -> Config {
        Config {
            temp_root: root.to_path_buf(),
            max_prepare_concurrency: 1,
            ..Config::default()
        }
    }

    async fn job_dirs(root: &Path) -> usize {
        let mut count = 0;
        let mut entries = tokio::fs::read_dir(root).await.expect("read root");
        while let Some(entry) = entries.next_entry().await.expect("entry") {
            if entry.file_name().to_string_lossy().starts_with(JOB_DIR_PREFIX) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn prepare_then_download_streams_exact_bytes_and_empties_registry() {
        let root = tempfile::tempdir().expect("tempdir");
        let worker = Arc::new(ScriptedWorker::producing(vec![("clip.mp4", b"0123456789")]));
        let manager = DownloadManager::new(&test_config(root.path()), worker.clone());

        let prepared = manager
            .prepare("https://valid.example/video", &FormatSpec::video(Some("480p")))
            .await
            .expect("prepare succeeds");
        assert_eq!(prepared.download_url, format!("/api/download/{}", prepared.token));
        assert_eq!(
            worker.last_selector.lock().expect("lock").as_deref(),
            Some("bestvideo[height<=480]+bestaudio/best[height<=480]/best")
        );

        let download = manager
            .consume(&prepared.token.to_string())
            .await
            .expect("consume succeeds");
        assert_eq!(download.size_bytes, 10);
        assert_eq!(download.mime_type, "video/mp4");
        assert_eq!(download.file_name, "clip.mp4");

        let mut body = download.body;
        let mut received = Vec::new();
        while let Some(chunk) = body.next().await {
            received.extend_from_slice(&chunk.expect("chunk"));
        }
        assert_eq!(received, b"0123456789");
        assert!(manager.registry().is_empty().await);
        assert!(matches!(
            manager.consume(&prepared.token.to_string()).await,
            Err(DownloadError::NotFound)
        ));
    }

    #[tokio::test]
    async fn worker_failure_carries_diagnostics_and_cleans_up() {
        let root = tempfile::tempdir().expect("tempdir");
        let worker = Arc::new(ScriptedWorker::failing("network unreachable"));
        let manager = DownloadManager::new(&test_config(root.path()), worker);

        let error = manager
            .prepare("https://valid.example/video", &FormatSpec::video(None))
            .await
            .expect_err("worker fails");
        match error {
            DownloadError::Worker { diagnostics } => assert!(diagnostics.contains("network unreachable")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(manager.registry().is_empty().await);
        assert_eq!(job_dirs(root.path()).await, 0);
        assert_eq!(manager.admission().in_flight(), 0);
    }

    #[tokio::test]
    async fn empty_output_is_reported_and_cleaned_up() {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = DownloadManager::new(
            &test_config(root.path()),
            Arc::new(ScriptedWorker::producing(Vec::new())),
        );

        let error = manager
            .prepare("https://valid.example/video", &FormatSpec::audio())
            .await
            .expect_err("nothing produced");
        assert!(matches!(error, DownloadError::EmptyOutput));
        assert_eq!(job_dirs(root.path()).await, 0);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_any_job() {
        let root = tempfile::tempdir().expect("tempdir");
        let worker = Arc::new(ScriptedWorker::producing(vec![("clip.mp4", b"x")]));
        let manager = DownloadManager::new(&test_config(root.path()), worker.clone());

        for url in ["", "   ", "ftp://valid.example/video", "not a url"] {
            let error = manager
                .prepare(url, &FormatSpec::video(None))
                .await
                .expect_err("invalid url");
            assert!(matches!(error, DownloadError::Validation(_)));
        }
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn saturated_admission_rejects_without_invoking_worker() {
        let root = tempfile::tempdir().expect("tempdir");
        let gate = Arc::new(Notify::new());
        let worker = Arc::new(ScriptedWorker {
            gate: Some(gate.clone()),
            ..ScriptedWorker::producing(vec![("clip.mp4", b"x")])
        });
        let manager = DownloadManager::new(&test_config(root.path()), worker.clone());

        let in_flight = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .prepare("https://valid.example/first", &FormatSpec::video(None))
                    .await
            }
        });
        while manager.admission().in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let rejected = manager
            .prepare("https://valid.example/second", &FormatSpec::video(None))
            .await;
        assert!(matches!(rejected, Err(DownloadError::Busy)));

        gate.notify_one();
        assert!(in_flight.await.expect("join").is_ok());
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.admission().in_flight(), 0);

        gate.notify_one();
        let admitted = manager
            .prepare("https://valid.example/third", &FormatSpec::video(None))
            .await;
        assert!(admitted.is_ok());
    }

    #[tokio::test]
    async fn several_files_pick_first_in_name_order() {
        let root = tempfile::tempdir().expect("tempdir");
        let worker = Arc::new(ScriptedWorker::producing(vec![
            ("b-second.mp4", b"second"),
            ("a-first.webm", b"first"),
            ("c.mp4.part", b"partial"),
        ]));
        let manager = DownloadManager::new(&test_config(root.path()), worker);

        let prepared = manager
            .prepare("https://valid.example/video", &FormatSpec::video(None))
            .await
            .expect("prepare succeeds");
        let entry = manager.registry().get(&prepared.token).await.expect("entry");
        assert_eq!(entry.file_name, "a-first.webm");
        assert_eq!(entry.mime_type, "video/webm");
    }

    #[tokio::test]
    async fn unconsumed_token_is_reclaimed_after_ttl_and_grace() {
        let root = tempfile::tempdir().expect("tempdir");
        let config = Config {
            token_ttl: Duration::from_millis(50),
            expiry_grace: Duration::from_millis(50),
            ..test_config(root.path())
        };
        let manager = DownloadManager::new(
            &config,
            Arc::new(ScriptedWorker::producing(vec![("clip.mp4", b"x")])),
        );

        let prepared = manager
            .prepare("https://valid.example/video", &FormatSpec::video(None))
            .await
            .expect("prepare succeeds");
        let entry = manager.registry().get(&prepared.token).await.expect("entry");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(matches!(
            manager.registry().get(&prepared.token).await,
            Err(DownloadError::NotFound)
        ));
        assert!(!entry.file_path.exists());
        assert!(manager.registry().is_empty().await);
    }

    #[tokio::test]
    async fn out_of_range_lifetimes_fail_without_leaking_job_dirs() {
        let root = tempfile::tempdir().expect("tempdir");
        let configs = [
            Config {
                token_ttl: Duration::from_secs(1_000_000_000_000_000),
                ..test_config(root.path())
            },
            Config {
                expiry_grace: Duration::from_secs(u64::MAX),
                ..test_config(root.path())
            },
        ];

        for config in configs {
            let worker = Arc::new(ScriptedWorker::producing(vec![("clip.mp4", b"x")]));
            let manager = DownloadManager::new(&config, worker);
            let result = manager
                .prepare("https://valid.example/video", &FormatSpec::video(None))
                .await;
            assert!(matches!(result, Err(DownloadError::Internal(_))));
            assert!(manager.registry().is_empty().await);
            assert_eq!(manager.admission().in_flight(), 0);
        }
        assert_eq!(job_dirs(root.path()).await, 0);
    }

    #[tokio::test]
    async fn unknown_or_malformed_tokens_are_not_found() {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = DownloadManager::new(
            &test_config(root.path()),
            Arc::new(ScriptedWorker::producing(Vec::new())),
        );
        assert!(matches!(manager.consume("nope").await, Err(DownloadError::NotFound)));
        assert!(matches!(
            manager.consume(&Uuid::new_v4().to_string()).await,
            Err(DownloadError::NotFound)
        ));
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for_filename("song.MP3"), "audio/mpeg");
        assert_eq!(content_type_for_filename("clip.mkv"), "video/x-matroska");
        assert_eq!(content_type_for_filename("noext"), "application/octet-stream");
    }
}
