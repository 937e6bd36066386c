//! Error types
//!
//! One enum covers every failure the core can report. Process-level failures
//! abort a batch; everything else is attached to a single image or rename
//! and the batch carries on.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, OcrRenameError>;

/// Errors produced by the engine client, preprocessing, and renaming
#[derive(Debug, Error)]
pub enum OcrRenameError {
    /// Executable or models missing, or spawning the child failed
    #[error("failed to launch OCR engine: {0}")]
    EngineLaunch(String),

    /// Readiness marker did not show up in time, or the engine exited first
    #[error("OCR engine not ready: {0}")]
    EngineNotReady(String),

    /// Response line was not valid JSON or lacked expected fields
    #[error("OCR engine protocol error: {0}")]
    EngineProtocol(String),

    /// Pipe closed or write failed while a request was in flight
    #[error("OCR engine crashed: {0}")]
    EngineCrashed(String),

    /// No response line within the per-request ceiling
    #[error("OCR engine did not answer within {0} ms")]
    EngineTimeout(u64),

    /// Engine answered with a non-success status
    #[error("OCR engine rejected image (code {code}): {message}")]
    EngineReported { code: i64, message: String },

    #[error("unsupported image format for {path}: {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("failed to rename {source_path} -> {target_path}: {reason}")]
    RenameIo {
        source_path: PathBuf,
        target_path: PathBuf,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OcrRenameError {
    /// Whether this error takes the whole engine down rather than one image
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EngineLaunch(_) | Self::EngineNotReady(_))
    }

    pub fn unsupported(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
