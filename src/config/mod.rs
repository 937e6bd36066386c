//! Application Configuration
//!
//! Engine, recognition, and matching settings stored in TOML format.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::matching::{CollisionPolicy, ScorerKind};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// External OCR engine settings
    pub engine: EngineConfig,
    /// Batch recognition settings
    pub recognition: RecognitionConfig,
    /// Similarity matching settings
    pub matching: MatchingConfig,
}

/// How to launch and talk to the OCR engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine executable; discovered next to this binary when unset
    pub executable: Option<PathBuf>,
    /// Extra command-line arguments passed to the engine
    pub args: Vec<String>,
    /// Working directory; defaults to the executable's directory
    pub working_dir: Option<PathBuf>,
    /// Directory (relative to the working directory) that must exist before launch
    pub models_subdir: Option<String>,
    /// Substrings that signal the engine finished loading its models
    pub ready_markers: Vec<String>,
    /// How long to wait for a readiness marker
    pub ready_timeout_secs: u64,
    /// Ceiling for a single request/response exchange
    pub request_timeout_secs: u64,
    /// Grace period between closing stdin and killing the engine
    pub shutdown_grace_ms: u64,
    /// Joined between recognized fragments
    pub fragment_separator: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            working_dir: None,
            models_subdir: Some("models".to_string()),
            ready_markers: vec![
                "OCR init completed.".to_string(),
                "初始化完成".to_string(),
            ],
            ready_timeout_secs: 10,
            request_timeout_secs: 30,
            shutdown_grace_ms: 500,
            fragment_separator: String::new(),
        }
    }
}

impl EngineConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Batch recognition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Number of images prepared and queued at once
    pub concurrency: usize,
    /// Extensions picked up when listing a folder (lowercase, no dot)
    pub image_extensions: Vec<String>,
    /// Extensions the engine cannot read and that get converted to PNG first
    pub convert_extensions: Vec<String>,
    /// Reuse text recognized in earlier runs when the file is unchanged
    pub use_cache: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            image_extensions: ["jpg", "jpeg", "png", "bmp", "gif", "tiff", "webp", "avif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            convert_extensions: ["avif", "heic", "heif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            use_cache: true,
        }
    }
}

/// Similarity matching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum score for a B image to be assigned an A image (0.0 - 1.0)
    pub threshold: f64,
    /// String similarity metric
    pub scorer: ScorerKind,
    /// Compare lowercased text and also punctuation-free text
    pub normalize: bool,
    /// What to do when several B images want the same A image
    pub collision_policy: CollisionPolicy,
    /// Only pair images with identical pixel dimensions
    pub same_size_only: bool,
    /// Matches below `threshold + review_margin` are flagged for review
    pub review_margin: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold: 0.80,
            scorer: ScorerKind::default(),
            normalize: false,
            collision_policy: CollisionPolicy::default(),
            same_size_only: true,
            review_margin: 0.05,
        }
    }
}

impl AppConfig {
    /// Reject values the core cannot work with
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::OcrRenameError;

        if !(0.0..=1.0).contains(&self.matching.threshold) {
            return Err(OcrRenameError::Config(format!(
                "matching.threshold must be within 0.0..=1.0, got {}",
                self.matching.threshold
            )));
        }
        if self.recognition.concurrency == 0 {
            return Err(OcrRenameError::Config(
                "recognition.concurrency must be at least 1".to_string(),
            ));
        }
        if self.engine.ready_markers.iter().all(|m| m.is_empty()) {
            return Err(OcrRenameError::Config(
                "engine.ready_markers needs at least one non-empty marker".to_string(),
            ));
        }
        if self.engine.ready_timeout_secs == 0 {
            return Err(OcrRenameError::Config(
                "engine.ready_timeout_secs must be positive".to_string(),
            ));
        }
        if self.engine.request_timeout_secs == 0 {
            return Err(OcrRenameError::Config(
                "engine.request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
