use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use crate::errors::{AppError, Result};
use crate::utils::run_tool;
use super::{FetchContext, MediaInfo, PlaylistEntry, ProgressTick};

const PROGRESS_TEMPLATE: &str =
    "download:[progress] %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.speed)s %(progress.eta)s";

/// Video or playlist information as dumped by yt-dlp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfo {
    #[serde(rename = "_type")]
    pub _type: Option<String>,
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub formats: Option<Vec<FormatInfo>>,
    pub entries: Option<Vec<EntryInfo>>,
    pub subtitles: Option<HashMap<String, serde_json::Value>>,
    pub automatic_captions: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatInfo {
    pub format_id: String,
    pub ext: Option<String>,
    pub acodec: Option<String>,
    pub vcodec: Option<String>,
    pub height: Option<u32>,
}

impl FormatInfo {
    fn has_video(&self) -> bool {
        self.vcodec.as_deref().map_or(false, |c| c != "none")
    }

    fn has_audio(&self) -> bool {
        self.acodec.as_deref().map_or(false, |c| c != "none")
    }
}

/// Flat playlist entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryInfo {
    pub id: String,
    pub url: Option<String>,
    pub title: Option<String>,
}

impl VideoInfo {
    pub fn into_media_info(self, source_url: &str) -> MediaInfo {
        let formats = self.formats.unwrap_or_default();
        let mut progressive: Vec<u32> = formats
            .iter()
            .filter(|f| f.has_video() && f.has_audio())
            .filter_map(|f| f.height)
            .collect();
        let mut video_only: Vec<u32> = formats
            .iter()
            .filter(|f| f.has_video() && !f.has_audio())
            .filter_map(|f| f.height)
            .collect();
        progressive.sort_unstable();
        progressive.dedup();
        video_only.sort_unstable();
        video_only.dedup();

        let mut subtitle_languages: Vec<String> = self
            .subtitles
            .iter()
            .chain(self.automatic_captions.iter())
            .flat_map(|m| m.keys().cloned())
            .collect();
        subtitle_languages.sort();
        subtitle_languages.dedup();

        let is_playlist = self._type.as_deref() == Some("playlist") || self.entries.is_some();
        let entries = self
            .entries
            .unwrap_or_default()
            .into_iter()
            .map(|e| PlaylistEntry {
                url: entry_url(&e),
                id: e.id,
                title: e.title,
            })
            .collect();

        MediaInfo {
            id: self.id,
            title: self.title,
            webpage_url: self.webpage_url.unwrap_or_else(|| source_url.to_string()),
            uploader: self.uploader,
            duration: self.duration,
            thumbnail: self.thumbnail,
            has_audio: formats.iter().any(FormatInfo::has_audio),
            progressive_qualities: progressive,
            video_only_qualities: video_only,
            subtitle_languages,
            is_playlist,
            entries,
        }
    }
}

fn entry_url(entry: &EntryInfo) -> String {
    match &entry.url {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => url.clone(),
        _ => format!("https://www.youtube.com/watch?v={}", entry.id),
    }
}

/// One parsed `[progress]` line.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed: Option<f64>,
    pub eta: Option<u64>,
}

impl ToolProgress {
    pub fn fraction(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => (self.downloaded_bytes as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }
}

fn progress_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[progress\]\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s*$").ok())
        .as_ref()
}

pub fn parse_progress_line(line: &str) -> Option<ToolProgress> {
    let caps = progress_regex()?.captures(line.trim())?;
    let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok());
    Some(ToolProgress {
        downloaded_bytes: number(1)? as u64,
        total_bytes: number(2).map(|v| v as u64),
        speed: number(3),
        eta: number(4).map(|v| v as u64),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStream {
    pub url: String,
    pub ext: String,
}

/// Thin async wrapper around the yt-dlp executable.
pub struct YtDlp {
    path: String,
    proxy: Option<String>,
}

impl YtDlp {
    pub fn new(path: impl Into<String>, proxy: Option<String>) -> Self {
        Self {
            path: path.into(),
            proxy,
        }
    }

    fn args(&self, extra: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = vec!["--no-warnings".to_string(), "--no-playlist".to_string()];
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        args.extend(extra.iter().map(|s| s.to_string()));
        args
    }

    /// Metadata for a video, or the flat entry list for a playlist.
    pub async fn extract_info(&self, url: &str, cancel: &CancellationToken) -> Result<MediaInfo> {
        log::info!("🔍 [RENDER] extracting info for {}", url);
        let mut args = self.args(&["--dump-single-json", "--flat-playlist", url]);
        // a playlist URL must be expanded, not narrowed to its current video
        if url.contains("list=") {
            args.retain(|a| a != "--no-playlist");
            args.insert(0, "--yes-playlist".to_string());
        }
        let output = run_tool(&self.path, &args, cancel).await?;
        let info: VideoInfo = serde_json::from_str(output.stdout.trim())?;
        Ok(info.into_media_info(url))
    }

    /// Direct media URL and container of the best single stream matching `selector`.
    pub async fn resolve_stream(&self, url: &str, selector: &str, cancel: &CancellationToken) -> Result<ResolvedStream> {
        let args = self.args(&["-f", selector, "--print", "%(ext)s", "--print", "%(url)s", url]);
        let output = run_tool(&self.path, &args, cancel).await?;
        let mut lines = output.stdout.lines().map(str::trim).filter(|l| !l.is_empty());

        match (lines.next(), lines.next()) {
            (Some(ext), Some(stream_url)) if stream_url.starts_with("http") => Ok(ResolvedStream {
                url: stream_url.to_string(),
                ext: ext.to_string(),
            }),
            _ => Err(AppError::ContentUnavailable(format!("No stream matches {} for {}", selector, url))),
        }
    }

    /// Runs yt-dlp to completion without progress parsing (captions, thumbnails).
    pub async fn run(&self, extra: &[&str], cancel: &CancellationToken) -> Result<String> {
        let args = self.args(extra);
        Ok(run_tool(&self.path, &args, cancel).await?.stdout)
    }

    /// Downloads one format into `output_dir/stem.<ext>`, mapping tool
    /// progress into `span` of the unit's progress. Returns the file path.
    pub async fn download_format(
        &self,
        url: &str,
        selector: &str,
        output_dir: &Path,
        stem: &str,
        ctx: &FetchContext,
        span: (f64, f64),
    ) -> Result<PathBuf> {
        ctx.checkpoint()?;
        let template = output_dir.join(format!("{}.%(ext)s", stem));
        let template = template.to_string_lossy().to_string();
        let args = self.args(&[
            "-f",
            selector,
            "--newline",
            "--progress",
            "--progress-template",
            PROGRESS_TEMPLATE,
            "--print",
            "after_move:filepath",
            "-o",
            &template,
            url,
        ]);

        log::debug!("[RENDER] {} {}", self.path, args.join(" "));
        let mut child = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Subprocess(format!("Failed to start {}: {}", self.path, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Subprocess("yt-dlp stdout unavailable".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Subprocess("yt-dlp stderr unavailable".to_string()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut final_path: Option<PathBuf> = None;
        let (start, end) = span;

        loop {
            let line = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(AppError::Cancelled("download interrupted".to_string()));
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };

            if let Some(progress) = parse_progress_line(&line) {
                ctx.report(ProgressTick {
                    fraction: start + (end - start) * progress.fraction(),
                    downloaded_bytes: Some(progress.downloaded_bytes),
                    total_bytes: progress.total_bytes,
                    speed: progress.speed,
                    eta: progress.eta,
                    stage: Some(stem.to_string()),
                    ..Default::default()
                })
                .await?;
            } else if !line.trim().is_empty() && !line.starts_with('[') {
                final_path = Some(PathBuf::from(line.trim()));
            }
        }

        let status = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(AppError::Cancelled("download interrupted".to_string())),
            status = child.wait() => status?,
        };
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            log::error!("[RENDER] yt-dlp exited with {}: {}", status, stderr.trim());
            return Err(AppError::classify_backend_output(&stderr));
        }

        match final_path {
            Some(path) if path.exists() => Ok(path),
            _ => find_with_stem(output_dir, stem).await,
        }
    }
}

async fn find_with_stem(dir: &Path, stem: &str) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.file_stem().and_then(|s| s.to_str()) == Some(stem) {
            return Ok(path);
        }
    }
    Err(AppError::Backend(format!("yt-dlp reported success but no '{}' file was written", stem)))
}
