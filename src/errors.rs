use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Quality {requested}p unavailable (available: {})", format_qualities(.available))]
    QualityUnavailable { requested: u32, available: Vec<u32> },

    #[error("Network error: {message}")]
    Network { message: String, retryable: bool },

    #[error("Content unavailable: {0}")]
    ContentUnavailable(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Subprocess error: {0}")]
    Subprocess(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

fn format_qualities(qualities: &[u32]) -> String {
    if qualities.is_empty() {
        return "none".to_string();
    }
    qualities
        .iter()
        .map(|q| format!("{}p", q))
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        let retryable = error.is_timeout()
            || error.is_connect()
            || error.is_request()
            || error.is_body()
            || error.status().map_or(false, |s| s.is_server_error() || s.as_u16() == 429);

        if let Some(status) = error.status() {
            if matches!(status.as_u16(), 403 | 404 | 410 | 451) {
                return AppError::ContentUnavailable(format!("HTTP {}", status));
            }
        }

        AppError::Network {
            message: error.to_string(),
            retryable,
        }
    }
}

impl AppError {
    pub fn network(message: impl Into<String>, retryable: bool) -> Self {
        AppError::Network {
            message: message.into(),
            retryable,
        }
    }

    /// Stable name used on the wire as `error_type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "ValidationError",
            AppError::QualityUnavailable { .. } => "QualityUnavailableError",
            AppError::Network { .. } => "NetworkError",
            AppError::ContentUnavailable(_) => "ContentUnavailableError",
            AppError::InvalidState(_) => "InvalidStateError",
            AppError::NotFound(_) => "NotFoundError",
            AppError::Cancelled(_) => "CancelledError",
            AppError::Config(_) => "ConfigError",
            AppError::Io(_) => "IoError",
            AppError::Json(_) => "JsonError",
            AppError::Subprocess(_) => "SubprocessError",
            AppError::Backend(_) => "BackendError",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Network { retryable, .. } => *retryable,
            AppError::Subprocess(_) => true,
            _ => false,
        }
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            error: self.to_string(),
            error_type: self.error_type().to_string(),
            retryable: self.is_retryable(),
        }
    }

    /// Maps raw backend diagnostics (usually stderr of an extractor run) onto
    /// the shared taxonomy.
    pub fn classify_backend_output(stderr: &str) -> Self {
        let message = stderr.trim().to_string();
        let lower = message.to_lowercase();

        let content_markers = [
            "private video",
            "video unavailable",
            "has been removed",
            "members-only",
            "join this channel",
            "sign in to confirm your age",
            "account associated with this video has been terminated",
            "this video is not available",
            "copyright",
        ];
        if content_markers.iter().any(|m| lower.contains(m)) {
            return AppError::ContentUnavailable(message);
        }

        let validation_markers = ["unsupported url", "is not a valid url", "incomplete youtube id"];
        if validation_markers.iter().any(|m| lower.contains(m)) {
            return AppError::Validation(message);
        }

        let network_markers = [
            "timed out",
            "timeout",
            "temporary failure in name resolution",
            "name or service not known",
            "connection refused",
            "connection reset",
            "network is unreachable",
            "unable to download",
            "http error 5",
            "http error 429",
            "getaddrinfo failed",
        ];
        if network_markers.iter().any(|m| lower.contains(m)) {
            return AppError::network(message, true);
        }

        AppError::Backend(message)
    }
}

/// Serializable projection of an error as surfaced to callers and observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error: String,
    pub error_type: String,
    pub retryable: bool,
}

impl From<&AppError> for ErrorInfo {
    fn from(error: &AppError) -> Self {
        error.info()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
