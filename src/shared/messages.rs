//! Progress events sent from the dispatcher to whoever renders them

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::PathBuf;

use super::state::{Group, ImageRecord, RecognitionState};

/// Longest text excerpt carried in a status line
const PREVIEW_CHARS: usize = 40;

/// One state transition of one record
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub group: Group,
    /// Zero-based position in the batch
    pub index: usize,
    pub total: usize,
    pub identifier: PathBuf,
    pub state: RecognitionState,
    /// Recognized text, on Done
    pub text: Option<String>,
    /// Human-readable status line
    pub summary: String,
}

pub type ProgressSender = Sender<ProgressEvent>;
pub type ProgressReceiver = Receiver<ProgressEvent>;

/// Unbounded channel for progress events
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    unbounded()
}

impl ProgressEvent {
    /// Snapshot of `record` right after a transition
    pub fn for_record(record: &ImageRecord, index: usize, total: usize) -> Self {
        let position = index + 1;
        let name = record.display_name();
        let group = record.group;

        let summary = match &record.state {
            RecognitionState::Pending => format!("Waiting {group}: {position}/{total} - {name}"),
            RecognitionState::Running => {
                format!("Recognizing {group}: {position}/{total} - {name}")
            }
            RecognitionState::Done if record.text.is_empty() => {
                format!("✓ {group} {position}/{total} {name}: (no text)")
            }
            RecognitionState::Done => {
                format!("✓ {group} {position}/{total} {name}: {}", preview(&record.text))
            }
            RecognitionState::Failed { reason } => {
                format!("✗ {group} {position}/{total} {name} failed: {reason}")
            }
        };

        Self {
            group,
            index,
            total,
            identifier: record.path.clone(),
            state: record.state.clone(),
            text: matches!(record.state, RecognitionState::Done).then(|| record.text.clone()),
            summary,
        }
    }
}

fn preview(text: &str) -> String {
    let single_line = text.replace(['\r', '\n'], " ");
    if single_line.chars().count() > PREVIEW_CHARS {
        let cut: String = single_line.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        single_line
    }
}
