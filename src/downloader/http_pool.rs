use std::path::Path;
use std::time::{Duration, Instant};
use futures_util::StreamExt;
use reqwest::{Client, ClientBuilder, Proxy};
use tokio::io::AsyncWriteExt;
use crate::errors::{AppError, Result};
use super::{FetchContext, ProgressTick};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Shared HTTP client for direct stream transfers.
pub struct HttpPool {
    client: Client,
}

impl HttpPool {
    pub fn new(proxy_url: Option<&str>) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .connect_timeout(Duration::from_secs(15))
            .user_agent(USER_AGENT)
            .gzip(true)
            .brotli(true)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true);

        if let Some(proxy_url) = proxy_url {
            builder = builder.proxy(Proxy::all(proxy_url)?);
        }

        Ok(Self { client: builder.build()? })
    }

    pub fn get_client(&self) -> &Client {
        &self.client
    }

    /// Streams `url` into `dest`, retrying transient failures from scratch.
    /// Progress (scaled into `span`) doubles as the cancellation
    /// checkpoint at every chunk. On any failure `dest` is removed.
    pub async fn download_to_file(
        &self,
        url: &str,
        dest: &Path,
        ctx: &FetchContext,
        span: (f64, f64),
    ) -> Result<u64> {
        for attempt in 1..=MAX_RETRIES {
            log::debug!("🌐 [DIRECT] attempt {} of {} for {}", attempt, MAX_RETRIES, dest.display());

            match self.stream_once(url, dest, ctx, span).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    let _ = tokio::fs::remove_file(dest).await;
                    if attempt < MAX_RETRIES && e.is_retryable() && !ctx.cancel.is_cancelled() {
                        log::warn!("⚠️ [DIRECT] attempt {} failed: {}; retrying in {:?}", attempt, e, RETRY_DELAY);
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => return Err(AppError::Cancelled("transfer cancelled".to_string())),
                            _ = tokio::time::sleep(RETRY_DELAY) => {}
                        }
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(AppError::network("transfer attempts exhausted", true))
    }

    async fn stream_once(&self, url: &str, dest: &Path, ctx: &FetchContext, span: (f64, f64)) -> Result<u64> {
        ctx.checkpoint()?;
        let response = self.client.get(url).send().await?.error_for_status()?;

        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        let started = Instant::now();
        let (start, end) = span;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let elapsed = started.elapsed().as_secs_f64();
            let speed = (elapsed > 0.0).then(|| downloaded as f64 / elapsed);
            let fraction = total.map_or(0.0, |t| if t > 0 { downloaded as f64 / t as f64 } else { 0.0 });
            let eta = match (total, speed) {
                (Some(t), Some(s)) if s > 0.0 && t > downloaded => Some(((t - downloaded) as f64 / s) as u64),
                _ => None,
            };

            ctx.report(ProgressTick {
                fraction: start + (end - start) * fraction.min(1.0),
                downloaded_bytes: Some(downloaded),
                total_bytes: total,
                speed,
                eta,
                stage: Some("download".to_string()),
                ..Default::default()
            })
            .await?;
        }

        file.flush().await?;
        if let Some(expected) = total {
            if downloaded < expected {
                return Err(AppError::network(
                    format!("connection closed after {} of {} bytes", downloaded, expected),
                    true,
                ));
            }
        }
        Ok(downloaded)
    }
}
