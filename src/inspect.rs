use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{error::DownloadError, format::MediaKind, worker::ConversionWorker};

const UNAVAILABLE_MARKERS: [&str; 4] = ["404", "not available", "unavailable", "private video"];

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MediaInfo {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<String>,
    pub formats: Vec<MediaFormat>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MediaFormat {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub quality: String,
    pub ext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<YtDlpThumbnail>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: Option<String>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    format_note: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

pub async fn inspect(worker: &dyn ConversionWorker, url: &str) -> Result<MediaInfo, DownloadError> {
    let raw = match worker.fetch_metadata(url).await {
        Ok(raw) => raw,
        Err(DownloadError::Worker { diagnostics }) if reports_unavailable(&diagnostics) => {
            return Err(DownloadError::ContentUnavailable { diagnostics });
        }
        Err(error) => return Err(error),
    };

    let info: YtDlpVideoInfo = serde_json::from_slice(&raw).map_err(|error| {
        warn!(%url, %error, "could not parse worker metadata");
        DownloadError::internal(format!("failed to parse metadata: {error}"))
    })?;

    Ok(map_media_info(info))
}

fn reports_unavailable(diagnostics: &str) -> bool {
    let lower = diagnostics.to_ascii_lowercase();
    UNAVAILABLE_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn map_media_info(info: YtDlpVideoInfo) -> MediaInfo {
    let thumbnail = info
        .thumbnails
        .iter()
        .rev()
        .find_map(|thumbnail| thumbnail.url.clone())
        .or(info.thumbnail);

    MediaInfo {
        id: info
            .id
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        title: info
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        author: info.uploader.or(info.channel),
        thumbnail,
        duration: info.duration.and_then(format_duration),
        formats: build_formats(&info.formats),
    }
}

fn build_formats(formats: &[YtDlpFormat]) -> Vec<MediaFormat> {
    let mut options: Vec<(u32, MediaFormat)> = formats
        .iter()
        .map(|item| {
            let kind = if is_audio_only(item) {
                MediaKind::Audio
            } else {
                MediaKind::Video
            };
            let quality = item
                .height
                .map(|height| format!("{height}p"))
                .or_else(|| item.format_note.clone())
                .or_else(|| item.format_id.clone())
                .unwrap_or_else(|| "unknown".to_string());
            let ext = item.ext.clone().unwrap_or_else(|| match kind {
                MediaKind::Video => "mp4".to_string(),
                MediaKind::Audio => "m4a".to_string(),
            });
            let filesize = item
                .filesize
                .or(item.filesize_approx)
                .filter(|size| *size > 0.0)
                .map(|size| size.round() as u64);

            (
                item.height.unwrap_or_default(),
                MediaFormat {
                    kind,
                    quality,
                    ext,
                    filesize,
                },
            )
        })
        .collect();

    // Stable: equal keys keep the order the worker listed them in.
    options.sort_by(|a, b| a.1.kind.cmp(&b.1.kind).then_with(|| b.0.cmp(&a.0)));

    let mut seen = HashSet::new();
    options
        .into_iter()
        .map(|(_, format)| format)
        .filter(|format| seen.insert((format.kind, format.quality.clone(), format.ext.clone())))
        .collect()
}

fn is_audio_only(format: &YtDlpFormat) -> bool {
    let has_video = matches!(format.vcodec.as_deref(), Some(value) if value != "none");
    let has_audio = matches!(format.acodec.as_deref(), Some(value) if value != "none");
    !has_video && has_audio
}

fn format_duration(seconds: f64) -> Option<String> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }

    let total = seconds.round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        Some(format!("{hours}:{minutes:02}:{secs:02}"))
    } else {
        Some(format!("{minutes}:{secs:02}"))
    }
}
