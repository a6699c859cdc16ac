use moka::future::Cache as MokaCache;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::errors::{AppError, Result};
use super::{Downloader, MediaInfo};

/// TTL cache of metadata probes keyed by URL.
#[derive(Clone)]
pub struct ProbeCache {
    probes: Arc<MokaCache<String, MediaInfo>>,
    probe_timeout: Duration,
}

impl ProbeCache {
    pub fn new(ttl: Duration, probe_timeout: Duration) -> Self {
        Self::with_capacity(ttl, probe_timeout, 1000)
    }

    pub fn with_capacity(ttl: Duration, probe_timeout: Duration, max_capacity: u64) -> Self {
        Self {
            probes: Arc::new(
                MokaCache::builder()
                    .max_capacity(max_capacity)
                    .time_to_live(ttl)
                    .build(),
            ),
            probe_timeout,
        }
    }

    pub async fn get(&self, url: &str) -> Option<MediaInfo> {
        self.probes.get(url).await
    }

    pub async fn insert(&self, url: String, info: MediaInfo) {
        self.probes.insert(url, info).await;
    }

    pub async fn invalidate(&self, url: &str) {
        self.probes.invalidate(url).await;
    }

    /// Cached probe result, or a fresh probe through `backend` bounded by the
    /// probe timeout. Failures are not cached.
    pub async fn get_or_probe(
        &self,
        url: &str,
        backend: &dyn Downloader,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo> {
        if let Some(info) = self.get(url).await {
            log::debug!("[CACHE] probe hit for {}", url);
            return Ok(info);
        }

        let info = match tokio::time::timeout(self.probe_timeout, backend.probe(url, cancel)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::network(
                    format!("Metadata probe timed out after {}s", self.probe_timeout.as_secs()),
                    true,
                ))
            }
        };

        self.insert(url.to_string(), info.clone()).await;
        Ok(info)
    }
}
