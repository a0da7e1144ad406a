//! Error types for the monitor.
//!
//! Attachment-level errors never escape the pipeline: they are rendered to a
//! diagnostic string and stored next to the attachment. `AppError` covers
//! startup and storage failures.

use thiserror::Error;

const MAX_DIAGNOSTIC: usize = 300;

/// No download URL could be derived from an attachment record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ResolutionGap {
    pub reason: String,
}

impl ResolutionGap {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failure while fetching a direct URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("HTTP {code}: {reason}")]
    Status { code: u16, reason: String },

    #[error("{0}")]
    Transport(String),

    #[error("write failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

/// Failure of the external page/stream downloader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScrapeError {
    #[error("player fallback unavailable: external downloader `{0}` is not installed")]
    Unavailable(String),

    #[error(
        "access restricted: the platform requires authorization or an access key the bot does not have ({0})"
    )]
    AccessRestricted(String),

    #[error("player download failed: {0}")]
    Failed(String),
}

/// Every sticker candidate URL failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sticker {sticker_id}: none of {attempts} candidate URLs succeeded (last error: {last_error})")]
pub struct CacheMissError {
    pub sticker_id: i64,
    pub attempts: usize,
    pub last_error: String,
}

/// Errors from the platform HTTP API.
#[derive(Debug, Error)]
pub enum VkError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Startup and storage errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("platform api error: {0}")]
    Vk(#[from] VkError),

    #[error("shared state lock poisoned")]
    LockPoisoned,
}

/// Clamp a diagnostic to the size stored alongside an attachment.
pub fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_DIAGNOSTIC {
        return error.to_string();
    }
    let mut end = MAX_DIAGNOSTIC;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_renders_code_and_reason() {
        let err = TransferError::Status {
            code: 404,
            reason: "Not Found".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 404: Not Found");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "ж".repeat(400);
        let out = truncate_error(&long);
        assert!(out.len() <= MAX_DIAGNOSTIC);
        assert!(out.chars().all(|c| c == 'ж'));
    }
}
