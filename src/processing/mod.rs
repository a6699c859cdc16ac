use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use crate::downloader::OutputFormat;
use crate::errors::{AppError, Result};
use crate::utils::run_tool;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AudioQuality {
    Low,    // 96 kbps
    Medium, // 128 kbps
    High,   // 192 kbps
}

impl AudioQuality {
    pub fn get_bitrate(&self) -> u32 {
        match self {
            AudioQuality::Low => 96,
            AudioQuality::Medium => 128,
            AudioQuality::High => 192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOptions {
    pub format: OutputFormat,
    pub audio_quality: AudioQuality,
}

impl MergeOptions {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            audio_quality: AudioQuality::Medium,
        }
    }

    /// mp4 gets AAC; mkv/webm keep the fetched audio as-is.
    fn audio_codec(&self) -> &'static str {
        match self.format {
            OutputFormat::Mp4 => "aac",
            OutputFormat::Webm | OutputFormat::Mkv => "copy",
        }
    }

    /// ffmpeg argument list; the video stream is always copied.
    pub fn ffmpeg_args(&self, video: &Path, audio: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            video.to_string_lossy().to_string(),
            "-i".to_string(),
            audio.to_string_lossy().to_string(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "1:a:0".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            self.audio_codec().to_string(),
        ];
        if self.format == OutputFormat::Mp4 {
            args.push("-b:a".to_string());
            args.push(format!("{}k", self.audio_quality.get_bitrate()));
            args.push("-movflags".to_string());
            args.push("+faststart".to_string());
        }
        args.push("-y".to_string());
        args.push(output.to_string_lossy().to_string());
        args
    }
}

/// Combines separately fetched video and audio streams with ffmpeg.
pub struct Merger {
    ffmpeg_path: String,
}

impl Merger {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Merges `video` and `audio` into `output` and returns the output size.
    /// A partially written output is removed on failure or cancellation.
    pub async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        options: &MergeOptions,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        for input in [video, audio] {
            if !input.exists() {
                return Err(AppError::Backend(format!("Merge input missing: {:?}", input)));
            }
        }

        log::info!("[MERGE] {:?} + {:?} -> {:?}", video.file_name(), audio.file_name(), output);
        let args = options.ffmpeg_args(video, audio, output);

        match run_tool(&self.ffmpeg_path, &args, cancel).await {
            Ok(_) => {
                let size = tokio::fs::metadata(output).await?.len();
                log::info!("[MERGE] ✅ wrote {} bytes", size);
                Ok(size)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(output).await;
                match e {
                    AppError::Cancelled(_) => Err(e),
                    // the classifier is tuned for extractor output; ffmpeg failures are backend failures
                    other => Err(AppError::Backend(format!("ffmpeg merge failed: {}", other))),
                }
            }
        }
    }
}
