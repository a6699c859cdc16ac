pub mod cache;
pub mod executor;
pub mod http_pool;
pub mod isolation;
pub mod manager;
pub mod registry;
pub mod routing;
pub mod selection;
pub mod strategies;
pub mod ytdlp;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::errors::{AppError, ErrorInfo, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Single,
    Playlist,
    Batch,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Single => "single",
            TaskKind::Playlist => "playlist",
            TaskKind::Batch => "batch",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Forward-only lifecycle. `Pending -> Failed` covers a Task that could
    /// not be admitted (e.g. playlist expansion failed).
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Download,
    Metadata,
    Captions,
    Thumbnail,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Webm,
    Mkv,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Webm => "webm",
            OutputFormat::Mkv => "mkv",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mp4" => Ok(OutputFormat::Mp4),
            "webm" => Ok(OutputFormat::Webm),
            "mkv" => Ok(OutputFormat::Mkv),
            other => Err(AppError::Validation(format!("Unsupported format: {} (expected mp4, webm or mkv)", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UnitOptions {
    pub quality: u32,
    pub format: OutputFormat,
    pub include_subtitles: bool,
    pub subtitle_languages: Vec<String>,
    pub download_thumbnail: bool,
}

impl Default for UnitOptions {
    fn default() -> Self {
        Self {
            quality: 720,
            format: OutputFormat::Mp4,
            include_subtitles: false,
            subtitle_languages: vec!["en".to_string()],
            download_thumbnail: false,
        }
    }
}

/// One URL plus its resolved processing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub index: usize,
    pub url: String,
    pub operation: Operation,
    pub options: UnitOptions,
    pub title: Option<String>,
}

impl WorkUnit {
    pub fn new(url: impl Into<String>, operation: Operation, options: UnitOptions) -> Self {
        Self {
            index: 0,
            url: url.into(),
            operation,
            options,
            title: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    /// Units-worth of work done: finished units count 1.0, in-flight units their fraction.
    pub current: f64,
    pub total: f64,
    pub percentage: f64,
    /// Bytes per second of the most recently reporting unit.
    pub speed: Option<f64>,
    /// Seconds remaining of the most recently reporting unit.
    pub eta: Option<u64>,
}

/// One progress report from a backend for one unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressTick {
    pub unit_index: usize,
    pub fraction: f64,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub speed: Option<f64>,
    pub eta: Option<u64>,
    pub stage: Option<String>,
}

impl ProgressTick {
    pub fn stage(stage: &str, fraction: f64) -> Self {
        Self {
            fraction,
            stage: Some(stage.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Video,
    Captions,
    Thumbnail,
    Metadata,
}

/// Reference to something a unit produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRef {
    pub unit_index: usize,
    pub url: String,
    pub kind: ArtifactKind,
    pub paths: Vec<PathBuf>,
    pub size_bytes: Option<u64>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitFailure {
    pub unit_index: usize,
    pub url: String,
    #[serde(flatten)]
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub succeeded: Vec<ArtifactRef>,
    pub failed: Vec<UnitFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub source_url: Option<String>,
    pub units: Vec<WorkUnit>,
    pub progress: TaskProgress,
    pub result: TaskResult,
    pub error: Option<ErrorInfo>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Terminal outcome of one unit as produced by the executor.
#[derive(Debug)]
pub enum UnitOutcome {
    Succeeded(ArtifactRef),
    Failed(AppError),
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Succeeded(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Single progressive stream, transferred as-is.
    Direct,
    /// Separate audio/video acquisition plus an external merge step.
    Render,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistEntry {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
}

/// What a metadata probe learned about a URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub id: String,
    pub title: String,
    pub webpage_url: String,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    /// Heights offered as single streams carrying both audio and video.
    pub progressive_qualities: Vec<u32>,
    /// Heights offered as video-only streams that need a merge step.
    pub video_only_qualities: Vec<u32>,
    pub has_audio: bool,
    pub subtitle_languages: Vec<String>,
    pub is_playlist: bool,
    pub entries: Vec<PlaylistEntry>,
}

impl MediaInfo {
    pub fn available_qualities(&self) -> Vec<u32> {
        let mut all: Vec<u32> = self
            .progressive_qualities
            .iter()
            .chain(self.video_only_qualities.iter())
            .copied()
            .collect();
        all.sort_unstable();
        all.dedup();
        all
    }

    pub fn offers_quality(&self, quality: u32) -> bool {
        self.progressive_qualities.contains(&quality) || self.video_only_qualities.contains(&quality)
    }
}

/// Per-call context handed to a backend: where to report progress and the
/// token to observe at chunk boundaries.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub unit_index: usize,
    pub progress: mpsc::Sender<ProgressTick>,
    pub cancel: CancellationToken,
}

impl FetchContext {
    /// Progress callback and cancellation checkpoint in one: once the token
    /// fires, no further I/O should start.
    pub async fn report(&self, mut tick: ProgressTick) -> Result<()> {
        self.checkpoint()?;
        tick.unit_index = self.unit_index;
        tick.fraction = tick.fraction.clamp(0.0, 1.0);
        // the executor may already be gone after a timeout; that's not our failure
        let _ = self.progress.send(tick).await;
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled("unit cancelled".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait Downloader: Send + Sync {
    /// Looks up what the URL offers without transferring content.
    async fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<MediaInfo>;
    /// Performs the unit's operation, reporting progress through `ctx`.
    async fn fetch(&self, unit: &WorkUnit, ctx: &FetchContext) -> Result<ArtifactRef>;
    fn supports_operation(&self, operation: Operation) -> bool;
    fn kind(&self) -> BackendKind;
    fn get_name(&self) -> &str;
}
