use crate::errors::{AppError, Result};
use url::Url;

const SUPPORTED_DOMAINS: [&str; 6] = [
    "youtube.com", "youtu.be", "youtube-nocookie.com", "vimeo.com", "dailymotion.com", "soundcloud.com",
];

pub struct InputValidator {
    min_quality: u32,
    max_quality: u32,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new(144, 2160)
    }
}

impl InputValidator {
    pub fn new(min_quality: u32, max_quality: u32) -> Self {
        Self { min_quality, max_quality }
    }

    /// Syntactic check applied at submission: an absolute http(s) URL with a host.
    pub fn validate_url_format(&self, url: &str) -> Result<Url> {
        if url.trim().is_empty() {
            return Err(AppError::Validation("URL cannot be empty".to_string()));
        }

        let parsed = Url::parse(url.trim())
            .map_err(|e| AppError::Validation(format!("Invalid URL '{}': {}", url, e)))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme '{}' (expected http or https)",
                parsed.scheme()
            )));
        }

        if parsed.host_str().map_or(true, |h| h.is_empty()) {
            return Err(AppError::Validation("URL must have a host".to_string()));
        }

        Ok(parsed)
    }

    /// Per-unit check: the URL must point at a supported platform and, for
    /// YouTube, identify a video or a playlist.
    pub fn validate_media_url(&self, url: &str) -> Result<()> {
        let parsed = self.validate_url_format(url)?;
        let host = parsed.host_str().unwrap_or_default().to_lowercase();

        let is_supported = SUPPORTED_DOMAINS
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)));

        if !is_supported {
            return Err(AppError::Validation(format!("Unsupported platform: {}", host)));
        }

        if host.ends_with("youtube.com") && parsed.path() == "/watch" {
            let video_id = parsed
                .query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.to_string())
                .unwrap_or_default();
            if !is_youtube_id(&video_id) {
                return Err(AppError::Validation(format!("Missing or malformed video id in {}", url)));
            }
        }

        if host == "youtu.be" && !is_youtube_id(parsed.path().trim_start_matches('/')) {
            return Err(AppError::Validation(format!("Missing or malformed video id in {}", url)));
        }

        Ok(())
    }

    pub fn is_playlist_url(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(parsed) => {
                parsed.query_pairs().any(|(k, _)| k == "list") || parsed.path().contains("/playlist")
            }
            Err(_) => false,
        }
    }

    pub fn validate_quality(&self, quality: u32) -> Result<()> {
        if quality < self.min_quality || quality > self.max_quality {
            return Err(AppError::Validation(format!(
                "Quality {}p outside supported range {}p-{}p",
                quality, self.min_quality, self.max_quality
            )));
        }
        Ok(())
    }

    pub fn validate_subtitle_languages(&self, languages: &[String]) -> Result<()> {
        for lang in languages {
            let valid = lang == "all"
                || (!lang.is_empty()
                    && lang.len() <= 12
                    && lang.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
            if !valid {
                return Err(AppError::Validation(format!("Invalid subtitle language code: {}", lang)));
            }
        }
        Ok(())
    }
}

fn is_youtube_id(candidate: &str) -> bool {
    candidate.len() == 11
        && candidate.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
