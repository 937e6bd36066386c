//! Per-image recognition state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Which folder an image came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Group {
    /// Reference images whose names are kept
    A,
    /// Images to be renamed after their A counterpart
    B,
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::A => write!(f, "A"),
            Group::B => write!(f, "B"),
        }
    }
}

/// Where a record is in its current recognition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionState {
    Pending,
    Running,
    Done,
    /// Failed with a human-readable reason
    Failed { reason: String },
}

impl RecognitionState {
    /// Done or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecognitionState::Done | RecognitionState::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecognitionState::Pending => "pending",
            RecognitionState::Running => "running",
            RecognitionState::Done => "done",
            RecognitionState::Failed { .. } => "failed",
        }
    }
}

/// One image in a recognition batch
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Original path; the stable key of the record
    pub path: PathBuf,
    pub group: Group,
    /// Recognized text; empty until Done
    pub text: String,
    pub state: RecognitionState,
    /// Number of recognition attempts started
    pub attempts: u32,
    /// Engine generation that produced `text`
    pub generation: Option<u64>,
    /// Pixel size, when the header could be read
    pub dimensions: Option<(u32, u32)>,
    /// Text came from the recognition cache
    pub from_cache: bool,
}

impl ImageRecord {
    pub fn new(path: PathBuf, group: Group) -> Self {
        Self {
            path,
            group,
            text: String::new(),
            state: RecognitionState::Pending,
            attempts: 0,
            generation: None,
            dimensions: None,
            from_cache: false,
        }
    }

    pub fn identifier(&self) -> &Path {
        &self.path
    }

    /// File name for display
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }

    /// Start a new attempt; a retry of a finished record reuses the record
    pub fn begin_attempt(&mut self) {
        self.state = RecognitionState::Running;
        self.text.clear();
        self.generation = None;
        self.attempts += 1;
    }

    pub fn complete(&mut self, text: String, generation: u64) {
        debug_assert_eq!(self.state, RecognitionState::Running);
        self.text = text;
        self.generation = Some(generation);
        self.state = RecognitionState::Done;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        debug_assert_eq!(self.state, RecognitionState::Running);
        self.text.clear();
        self.state = RecognitionState::Failed {
            reason: reason.into(),
        };
    }

    /// Mark Done from previously recognized text without touching the engine
    pub fn restore_cached(&mut self, text: String, dimensions: Option<(u32, u32)>) {
        self.text = text;
        self.dimensions = dimensions.or(self.dimensions);
        self.from_cache = true;
        self.state = RecognitionState::Done;
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.state {
            RecognitionState::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Build Pending records for a listing, in order
pub fn records_for(paths: &[PathBuf], group: Group) -> Vec<ImageRecord> {
    paths
        .iter()
        .map(|path| ImageRecord::new(path.clone(), group))
        .collect()
}
