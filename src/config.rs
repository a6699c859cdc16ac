use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::errors::{AppError, Result};

pub const ENV_PREFIX: &str = "MEDIAGRAB";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub download_path: PathBuf,
    pub temp_path: PathBuf,
    pub filename_prefix: String,
    pub max_concurrent_downloads: usize,
    pub max_quality_direct: u32,
    pub min_quality: u32,
    pub max_quality: u32,
    pub unit_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub probe_cache_ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub max_observer_connections: usize,
    pub observer_queue_capacity: usize,
    pub task_retention_secs: u64,
    pub retention_sweep_secs: u64,
    pub max_batch_urls: usize,
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
    pub proxy: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let download_path = dirs::download_dir()
            .map(|d| d.join("mediagrab"))
            .unwrap_or_else(|| PathBuf::from("./downloads"));

        Self {
            temp_path: std::env::temp_dir().join("mediagrab"),
            download_path,
            filename_prefix: "MEDIAGRAB".to_string(),
            max_concurrent_downloads: 3,
            max_quality_direct: 720,
            min_quality: 144,
            max_quality: 2160,
            unit_timeout_secs: 1800,
            probe_timeout_secs: 60,
            probe_cache_ttl_secs: 600,
            heartbeat_interval_secs: 30,
            max_observer_connections: 100,
            observer_queue_capacity: 64,
            task_retention_secs: 3600,
            retention_sweep_secs: 60,
            max_batch_urls: 50,
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            proxy: None,
        }
    }
}

impl AppConfig {
    /// Loads defaults, then the user config file if present, then `MEDIAGRAB_*` env vars.
    pub fn load() -> Result<Self> {
        let path = Self::get_config_path()?;
        Self::load_from(Some(&path))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);

        if let Some(path) = path {
            log::debug!("Looking for configuration at {:?}", path);
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let loaded: AppConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::Config(config::ConfigError::Message("Could not find config directory".to_string())))?;

        Ok(config_dir.join("mediagrab").join("config"))
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        let positive = [
            ("max_concurrent_downloads", self.max_concurrent_downloads as u64),
            ("unit_timeout_secs", self.unit_timeout_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("max_observer_connections", self.max_observer_connections as u64),
            ("observer_queue_capacity", self.observer_queue_capacity as u64),
            ("retention_sweep_secs", self.retention_sweep_secs),
            ("max_batch_urls", self.max_batch_urls as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                errors.push(format!("{} must be a positive integer", name));
            }
        }

        if self.max_quality_direct < self.min_quality {
            errors.push("max_quality_direct must be greater than or equal to min_quality".to_string());
        }
        if self.max_quality < self.max_quality_direct {
            errors.push("max_quality must be greater than or equal to max_quality_direct".to_string());
        }
        if self.ytdlp_path.trim().is_empty() {
            errors.push("ytdlp_path cannot be empty".to_string());
        }
        if self.ffmpeg_path.trim().is_empty() {
            errors.push("ffmpeg_path cannot be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            let message = format!(
                "Configuration validation errors:\n{}",
                errors.iter().map(|e| format!("- {}", e)).collect::<Vec<_>>().join("\n")
            );
            Err(AppError::Config(config::ConfigError::Message(message)))
        }
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_secs)
    }

    /// Output file name with the configured prefix, e.g. `MEDIAGRAB_My Video.mp4`.
    pub fn get_download_filename(&self, base_name: &str, extension: &str) -> String {
        let clean: String = base_name
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
            .collect();
        let clean = clean.split_whitespace().collect::<Vec<_>>().join(" ");
        let clean = if clean.is_empty() { "untitled".to_string() } else { clean };
        format!("{}_{}.{}", self.filename_prefix, clean, extension)
    }
}
