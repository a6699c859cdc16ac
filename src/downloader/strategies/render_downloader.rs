use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::config::AppConfig;
use crate::downloader::strategies::sidecars::{total_size, Sidecars};
use crate::downloader::ytdlp::YtDlp;
use crate::downloader::{
    ArtifactKind, ArtifactRef, BackendKind, Downloader, FetchContext, MediaInfo, Operation, OutputFormat,
    ProgressTick, WorkUnit,
};
use crate::errors::Result;
use crate::processing::{MergeOptions, Merger};
use crate::utils::ensure_dir_exists;

/// Full-featured backend: fetches video and audio separately into a scratch
/// directory and merges them, and serves captions, thumbnails and metadata.
pub struct RenderDownloader {
    ytdlp: Arc<YtDlp>,
    merger: Arc<Merger>,
    sidecars: Sidecars,
    config: AppConfig,
}

impl RenderDownloader {
    pub fn new(ytdlp: Arc<YtDlp>, merger: Arc<Merger>, config: AppConfig) -> Self {
        log::info!("✅ Render downloader initialized");
        let sidecars = Sidecars::new(Arc::clone(&ytdlp), config.clone());
        Self {
            ytdlp,
            merger,
            sidecars,
            config,
        }
    }

    fn download_dir(&self) -> PathBuf {
        self.config.download_path.clone()
    }

    async fn title_of(&self, unit: &WorkUnit, cancel: &CancellationToken) -> Result<String> {
        match &unit.title {
            Some(title) => Ok(title.clone()),
            None => Ok(self.ytdlp.extract_info(&unit.url, cancel).await?.title),
        }
    }

    async fn render_video(&self, unit: &WorkUnit, ctx: &FetchContext) -> Result<ArtifactRef> {
        let title = self.title_of(unit, &ctx.cancel).await?;
        let (video_selector, audio_selector) = selectors(unit.options.quality, unit.options.format);

        ensure_dir_exists(&self.config.temp_path).await?;
        // removed on every exit path, including an abandoned future
        let scratch = tempfile::Builder::new()
            .prefix("mediagrab-")
            .tempdir_in(&self.config.temp_path)?;

        let video = self
            .ytdlp
            .download_format(&unit.url, &video_selector, scratch.path(), "video", ctx, (0.0, 0.80))
            .await?;
        let audio = self
            .ytdlp
            .download_format(&unit.url, &audio_selector, scratch.path(), "audio", ctx, (0.80, 0.95))
            .await?;

        ctx.report(ProgressTick::stage("merge", 0.95)).await?;
        let download_dir = self.download_dir();
        ensure_dir_exists(&download_dir).await?;
        let output = download_dir.join(
            self.config
                .get_download_filename(&title, unit.options.format.extension()),
        );
        let mut size = self
            .merger
            .merge(&video, &audio, &output, &MergeOptions::new(unit.options.format), &ctx.cancel)
            .await?;

        let mut paths = vec![output];
        let extras = self.sidecars.attach(unit, &title, &ctx.cancel).await?;
        size += total_size(&extras).await;
        paths.extend(extras);

        ctx.report(ProgressTick::stage("done", 1.0)).await?;
        Ok(ArtifactRef {
            unit_index: unit.index,
            url: unit.url.clone(),
            kind: ArtifactKind::Video,
            paths,
            size_bytes: Some(size),
            title: Some(title),
        })
    }

    async fn write_metadata(&self, unit: &WorkUnit, cancel: &CancellationToken) -> Result<(PathBuf, String)> {
        let info = self.ytdlp.extract_info(&unit.url, cancel).await?;
        let dir = self.download_dir();
        ensure_dir_exists(&dir).await?;
        let path = dir.join(format!("{}.info.json", self.sidecars.stem_for(&info.title)));
        let body = serde_json::to_vec_pretty(&info)?;
        tokio::fs::write(&path, &body).await?;
        Ok((path, info.title))
    }

    async fn sidecar(&self, unit: &WorkUnit, ctx: &FetchContext) -> Result<ArtifactRef> {
        ctx.report(ProgressTick::stage(stage_name(unit.operation), 0.1)).await?;

        let (kind, paths, title) = match unit.operation {
            Operation::Captions => {
                let title = self.title_of(unit, &ctx.cancel).await?;
                (ArtifactKind::Captions, self.sidecars.write_captions(unit, &title, &ctx.cancel).await?, title)
            }
            Operation::Thumbnail => {
                let title = self.title_of(unit, &ctx.cancel).await?;
                (ArtifactKind::Thumbnail, self.sidecars.write_thumbnail(unit, &title, &ctx.cancel).await?, title)
            }
            Operation::Metadata => {
                let (path, title) = self.write_metadata(unit, &ctx.cancel).await?;
                (ArtifactKind::Metadata, vec![path], title)
            }
            Operation::Download => return self.render_video(unit, ctx).await,
        };

        ctx.report(ProgressTick::stage("done", 1.0)).await?;
        let size = total_size(&paths).await;
        Ok(ArtifactRef {
            unit_index: unit.index,
            url: unit.url.clone(),
            kind,
            paths,
            size_bytes: Some(size),
            title: Some(title),
        })
    }
}

#[async_trait::async_trait]
impl Downloader for RenderDownloader {
    async fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<MediaInfo> {
        self.ytdlp.extract_info(url, cancel).await
    }

    async fn fetch(&self, unit: &WorkUnit, ctx: &FetchContext) -> Result<ArtifactRef> {
        let start_time = Instant::now();
        log::info!(
            "🚀 [RENDER] Started {}: {} ({}p {})",
            stage_name(unit.operation),
            unit.url,
            unit.options.quality,
            unit.options.format.extension()
        );

        let result = match unit.operation {
            Operation::Download => self.render_video(unit, ctx).await,
            _ => self.sidecar(unit, ctx).await,
        };

        let duration = start_time.elapsed();
        match &result {
            Ok(artifact) => log::info!(
                "✅ [RENDER] Finished: {} -> {} file(s) (took {:.2} seconds)",
                unit.url,
                artifact.paths.len(),
                duration.as_secs_f64()
            ),
            Err(e) => log::error!(
                "❌ [RENDER] Failed: {} - Error: {} (took {:.2} seconds)",
                unit.url,
                e,
                duration.as_secs_f64()
            ),
        }
        result
    }

    fn supports_operation(&self, _operation: Operation) -> bool {
        true
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Render
    }

    fn get_name(&self) -> &str {
        "render"
    }
}

fn stage_name(operation: Operation) -> &'static str {
    match operation {
        Operation::Download => "download",
        Operation::Captions => "captions",
        Operation::Thumbnail => "thumbnail",
        Operation::Metadata => "metadata",
    }
}

/// Format selectors for the video-only and audio-only passes.
fn selectors(quality: u32, format: OutputFormat) -> (String, String) {
    match format {
        OutputFormat::Mp4 => (
            format!("bestvideo[height<={q}][ext=mp4]/bestvideo[height<={q}]", q = quality),
            "bestaudio[ext=m4a]/bestaudio".to_string(),
        ),
        OutputFormat::Webm => (
            format!("bestvideo[height<={q}][ext=webm]/bestvideo[height<={q}]", q = quality),
            "bestaudio[ext=webm]/bestaudio".to_string(),
        ),
        OutputFormat::Mkv => (format!("bestvideo[height<={}]", quality), "bestaudio".to_string()),
    }
}
