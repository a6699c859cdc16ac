use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::config::AppConfig;
use crate::downloader::http_pool::HttpPool;
use crate::downloader::strategies::sidecars::{total_size, Sidecars};
use crate::downloader::ytdlp::YtDlp;
use crate::downloader::{
    ArtifactKind, ArtifactRef, BackendKind, Downloader, FetchContext, MediaInfo, Operation, ProgressTick, WorkUnit,
};
use crate::errors::Result;
use crate::utils::ensure_dir_exists;

/// Single-stream backend: resolves one progressive format and streams it
/// straight to disk over the shared HTTP pool. No merge step. Requested
/// captions and thumbnails are written afterwards on a best-effort basis.
pub struct DirectDownloader {
    ytdlp: Arc<YtDlp>,
    pool: Arc<HttpPool>,
    sidecars: Sidecars,
    config: AppConfig,
}

impl DirectDownloader {
    pub fn new(ytdlp: Arc<YtDlp>, pool: Arc<HttpPool>, config: AppConfig) -> Self {
        log::info!("✅ Direct downloader initialized");
        let sidecars = Sidecars::new(Arc::clone(&ytdlp), config.clone());
        Self {
            ytdlp,
            pool,
            sidecars,
            config,
        }
    }

    fn selector(unit: &WorkUnit) -> String {
        let q = unit.options.quality;
        let ext = unit.options.format.extension();
        format!(
            "best[height<={q}][vcodec!=none][acodec!=none][ext={ext}]/best[height<={q}][vcodec!=none][acodec!=none]",
            q = q,
            ext = ext
        )
    }

    fn output_path(&self, title: &str, ext: &str) -> PathBuf {
        self.config.download_path.join(self.config.get_download_filename(title, ext))
    }
}

#[async_trait::async_trait]
impl Downloader for DirectDownloader {
    async fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<MediaInfo> {
        self.ytdlp.extract_info(url, cancel).await
    }

    async fn fetch(&self, unit: &WorkUnit, ctx: &FetchContext) -> Result<ArtifactRef> {
        let start_time = Instant::now();
        let title = unit.title.clone().unwrap_or_else(|| "untitled".to_string());
        log::info!("🚀 [DIRECT] Started Downloading: {} ({}p)", title, unit.options.quality);
        log::info!("🔗 [DIRECT] URL: {}", unit.url);

        ctx.report(ProgressTick::stage("resolve", 0.0)).await?;
        let stream = self.ytdlp.resolve_stream(&unit.url, &Self::selector(unit), &ctx.cancel).await?;

        let dest = self.output_path(&title, &stream.ext);
        if let Some(parent) = dest.parent() {
            ensure_dir_exists(parent).await?;
        }
        log::info!("📁 [DIRECT] Output path: {:?}", dest);

        let result = self.pool.download_to_file(&stream.url, &dest, ctx, (0.02, 1.0)).await;

        let duration = start_time.elapsed();
        match &result {
            Ok(bytes) => log::info!(
                "✅ [DIRECT] Successfully downloaded: {} ({} bytes, took {:.2} seconds)",
                title,
                bytes,
                duration.as_secs_f64()
            ),
            Err(e) => log::error!(
                "❌ [DIRECT] Failed to download: {} - Error: {} (took {:.2} seconds)",
                title,
                e,
                duration.as_secs_f64()
            ),
        }

        let mut size = result?;
        let mut paths = vec![dest];
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

    fn supports_operation(&self, operation: Operation) -> bool {
        operation == Operation::Download
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    fn get_name(&self) -> &str {
        "direct"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{OutputFormat, UnitOptions};

    fn downloader() -> DirectDownloader {
        let config = AppConfig {
            download_path: PathBuf::from("/tmp/mediagrab-test"),
            ..Default::default()
        };
        DirectDownloader::new(
            Arc::new(YtDlp::new("yt-dlp", None)),
            Arc::new(HttpPool::new(None).unwrap()),
            config,
        )
    }

    #[test]
    fn only_handles_plain_downloads() {
        let d = downloader();
        assert!(d.supports_operation(Operation::Download));
        assert!(!d.supports_operation(Operation::Captions));
        assert!(!d.supports_operation(Operation::Thumbnail));
        assert!(!d.supports_operation(Operation::Metadata));
        assert_eq!(d.kind(), BackendKind::Direct);
    }

    #[test]
    fn selector_caps_height_and_prefers_container() {
        let unit = WorkUnit::new(
            "https://youtu.be/dQw4w9WgXcQ",
            Operation::Download,
            UnitOptions {
                quality: 480,
                format: OutputFormat::Webm,
                ..Default::default()
            },
        );
        let selector = DirectDownloader::selector(&unit);
        assert!(selector.starts_with("best[height<=480]"));
        assert!(selector.contains("[ext=webm]"));
    }

    #[test]
    fn output_uses_prefixed_name() {
        let path = downloader().output_path("My Clip", "mp4");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_My Clip.mp4"));
    }
}
