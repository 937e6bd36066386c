//! Image records and progress messaging
//!
//! Records are the unit of work handed to the dispatcher; progress events
//! flow back over a channel to whichever layer renders them.

pub mod state;
pub mod messages;

pub use state::{records_for, Group, ImageRecord, RecognitionState};
pub use messages::{progress_channel, ProgressEvent, ProgressReceiver, ProgressSender};
