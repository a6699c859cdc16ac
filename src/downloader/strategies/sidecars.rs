use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use crate::config::AppConfig;
use crate::downloader::ytdlp::YtDlp;
use crate::downloader::WorkUnit;
use crate::errors::{AppError, Result};
use crate::utils::ensure_dir_exists;

pub const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "vtt"];
pub const THUMBNAIL_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Captions and thumbnails written next to a downloaded video, sharing its
/// `PREFIX_Title` stem. Used by both backends.
pub struct Sidecars {
    ytdlp: Arc<YtDlp>,
    config: AppConfig,
}

impl Sidecars {
    pub fn new(ytdlp: Arc<YtDlp>, config: AppConfig) -> Self {
        Self { ytdlp, config }
    }

    /// `PREFIX_Title` without extension.
    pub fn stem_for(&self, title: &str) -> String {
        let name = self.config.get_download_filename(title, "x");
        name.trim_end_matches(".x").to_string()
    }

    fn template(&self, stem: &str) -> String {
        self.config
            .download_path
            .join(format!("{}.%(ext)s", stem))
            .to_string_lossy()
            .to_string()
    }

    pub async fn write_captions(&self, unit: &WorkUnit, title: &str, cancel: &CancellationToken) -> Result<Vec<PathBuf>> {
        let dir = &self.config.download_path;
        ensure_dir_exists(dir).await?;
        let stem = self.stem_for(title);
        let template = self.template(&stem);
        let languages = unit.options.subtitle_languages.join(",");

        self.ytdlp
            .run(
                &[
                    "--skip-download",
                    "--write-subs",
                    "--write-auto-subs",
                    "--sub-langs",
                    &languages,
                    "--convert-subs",
                    "srt",
                    "-o",
                    &template,
                    &unit.url,
                ],
                cancel,
            )
            .await?;

        let found = collect_outputs(dir, &stem, SUBTITLE_EXTENSIONS).await?;
        if found.is_empty() {
            return Err(AppError::ContentUnavailable(format!(
                "No captions in [{}] for {}",
                languages, unit.url
            )));
        }
        Ok(found)
    }

    pub async fn write_thumbnail(&self, unit: &WorkUnit, title: &str, cancel: &CancellationToken) -> Result<Vec<PathBuf>> {
        let dir = &self.config.download_path;
        ensure_dir_exists(dir).await?;
        let stem = self.stem_for(title);
        let template = self.template(&stem);

        self.ytdlp
            .run(
                &[
                    "--skip-download",
                    "--write-thumbnail",
                    "--convert-thumbnails",
                    "jpg",
                    "-o",
                    &template,
                    &unit.url,
                ],
                cancel,
            )
            .await?;

        let found = collect_outputs(dir, &stem, THUMBNAIL_EXTENSIONS).await?;
        if found.is_empty() {
            return Err(AppError::ContentUnavailable(format!("No thumbnail for {}", unit.url)));
        }
        Ok(found)
    }

    /// Writes the extras a download asked for. A missing or failed extra is
    /// logged and skipped so the video itself still counts; only
    /// cancellation is propagated.
    pub async fn attach(&self, unit: &WorkUnit, title: &str, cancel: &CancellationToken) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();

        if unit.options.include_subtitles {
            match self.write_captions(unit, title, cancel).await {
                Ok(found) => paths.extend(found),
                Err(e @ AppError::Cancelled(_)) => return Err(e),
                Err(e) => log::warn!("⚠️ [SIDECAR] Captions skipped for {}: {}", unit.url, e),
            }
        }
        if unit.options.download_thumbnail {
            match self.write_thumbnail(unit, title, cancel).await {
                Ok(found) => paths.extend(found),
                Err(e @ AppError::Cancelled(_)) => return Err(e),
                Err(e) => log::warn!("⚠️ [SIDECAR] Thumbnail skipped for {}: {}", unit.url, e),
            }
        }
        Ok(paths)
    }
}

/// Files in `dir` named `stem.<anything>.<ext>` or `stem.<ext>` with one of `extensions`.
pub async fn collect_outputs(dir: &Path, stem: &str, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    let prefix = format!("{}.", stem);

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if name.starts_with(&prefix) && extensions.contains(&ext.as_str()) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

pub async fn total_size(paths: &[PathBuf]) -> u64 {
    let mut total = 0;
    for path in paths {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            total += meta.len();
        }
    }
    total
}
