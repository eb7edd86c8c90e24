use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const AUDIO_CONTAINER: &str = "mp3";
const OUTPUT_TEMPLATE: &str = "%(title).140B-%(id)s.%(ext)s";
const BEST_OVERALL: &str = "bestvideo+bestaudio/best";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct FormatSpec {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
}

impl FormatSpec {
    pub fn video(quality: Option<&str>) -> Self {
        Self {
            kind: MediaKind::Video,
            quality: quality.map(ToString::to_string),
            ext: None,
        }
    }

    pub fn audio() -> Self {
        Self {
            kind: MediaKind::Audio,
            quality: None,
            ext: None,
        }
    }

    /// Maximum frame height from hints like `720p` or `1080`.
    pub fn height_cap(&self) -> Option<u32> {
        let quality = self.quality.as_deref()?.trim();
        let digits = quality
            .strip_suffix('p')
            .or_else(|| quality.strip_suffix('P'))
            .unwrap_or(quality);
        digits.parse::<u32>().ok().filter(|height| *height > 0)
    }

    pub fn selector(&self) -> String {
        match self.kind {
            MediaKind::Audio => "bestaudio".to_string(),
            MediaKind::Video => match self.height_cap() {
                Some(height) => format!(
                    "bestvideo[height<={height}]+bestaudio/best[height<={height}]/best"
                ),
                None => BEST_OVERALL.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOption {
    Format(String),
    ExtractAudio,
    AudioFormat(String),
    NoMtime,
    NoWarnings,
    NoProgress,
    NoPlaylist,
    PrintFilepath,
    Output(PathBuf),
}

impl WorkerOption {
    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            Self::Format(selector) => {
                args.push("-f".to_string());
                args.push(selector.clone());
            }
            Self::ExtractAudio => args.push("--extract-audio".to_string()),
            Self::AudioFormat(container) => {
                args.push("--audio-format".to_string());
                args.push(container.clone());
            }
            Self::NoMtime => args.push("--no-mtime".to_string()),
            Self::NoWarnings => args.push("--no-warnings".to_string()),
            Self::NoProgress => args.push("--no-progress".to_string()),
            Self::NoPlaylist => args.push("--no-playlist".to_string()),
            Self::PrintFilepath => {
                args.push("--print".to_string());
                args.push("after_move:filepath".to_string());
            }
            Self::Output(template) => {
                args.push("-o".to_string());
                args.push(template.to_string_lossy().into_owned());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub job_dir: PathBuf,
    pub options: Vec<WorkerOption>,
    pub url: String,
}

impl WorkerCommand {
    pub fn build(url: &str, format: &FormatSpec, job_dir: &Path) -> Self {
        let mut options = vec![
            WorkerOption::Format(format.selector()),
            WorkerOption::NoMtime,
            WorkerOption::NoWarnings,
            WorkerOption::NoProgress,
            WorkerOption::NoPlaylist,
            WorkerOption::PrintFilepath,
            WorkerOption::Output(job_dir.join(OUTPUT_TEMPLATE)),
        ];

        if format.kind == MediaKind::Audio {
            options.push(WorkerOption::ExtractAudio);
            options.push(WorkerOption::AudioFormat(AUDIO_CONTAINER.to_string()));
        }

        Self {
            job_dir: job_dir.to_path_buf(),
            options,
            url: url.to_string(),
        }
    }

    pub fn format_selector(&self) -> Option<&str> {
        self.options.iter().find_map(|option| match option {
            WorkerOption::Format(selector) => Some(selector.as_str()),
            _ => None,
        })
    }

    pub fn extracts_audio(&self) -> bool {
        self.options.contains(&WorkerOption::ExtractAudio)
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for option in &self.options {
            option.push_args(&mut args);
        }
        args.push(self.url.clone());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(format: &FormatSpec) -> WorkerCommand {
        WorkerCommand::build("https://valid.example/video", format, Path::new("/tmp/dl-job"))
    }

    #[test]
    fn audio_ignores_quality_hint() {
        let format = FormatSpec {
            kind: MediaKind::Audio,
            quality: Some("1080p".to_string()),
            ext: None,
        };
        let command = command(&format);
        assert_eq!(command.format_selector(), Some("bestaudio"));
        assert!(command.extracts_audio());

        let args = command.to_args();
        let position = args.iter().position(|arg| arg == "--audio-format");
        assert_eq!(position.map(|index| args[index + 1].as_str()), Some("mp3"));
        assert!(!args.iter().any(|arg| arg.contains("height")));
    }

    #[test]
    fn video_quality_caps_height_with_fallback_chain() {
        let command = command(&FormatSpec::video(Some("720p")));
        assert_eq!(
            command.format_selector(),
            Some("bestvideo[height<=720]+bestaudio/best[height<=720]/best")
        );
        assert!(!command.extracts_audio());
    }

    #[test]
    fn non_numeric_quality_selects_best_overall() {
        assert_eq!(FormatSpec::video(Some("hd")).selector(), BEST_OVERALL);
        assert_eq!(FormatSpec::video(None).selector(), BEST_OVERALL);
        assert_eq!(FormatSpec::video(Some("480")).height_cap(), Some(480));
    }

    #[test]
    fn url_is_always_the_last_argument() {
        let args = command(&FormatSpec::audio()).to_args();
        assert_eq!(args.last().map(String::as_str), Some("https://valid.example/video"));
        assert!(args.iter().any(|arg| arg.starts_with("/tmp/dl-job/")));
        assert_eq!(args.first().map(String::as_str), Some("-f"));
    }

    #[test]
    fn format_spec_deserializes_ui_payload() {
        let format: FormatSpec =
            serde_json::from_str(r#"{"type":"video","quality":"480p","ext":"mp4"}"#)
                .expect("valid payload");
        assert_eq!(format.kind, MediaKind::Video);
        assert_eq!(format.height_cap(), Some(480));
    }
}
