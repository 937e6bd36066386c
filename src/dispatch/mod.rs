//! Recognition Dispatcher
//!
//! Runs a batch of image records through preprocessing and the engine with a
//! bounded number of records in flight. Engine calls are serialized by the
//! engine manager, so a limit above one only overlaps preprocessing and
//! cleanup with the single engine exchange that is running.
//!
//! Cancellation is checked when a record takes a slot. Records already in
//! flight always finish; an engine call is never interrupted from here.

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::TextRecognizer;
use crate::error::{OcrRenameError, Result};
use crate::shared::{ImageRecord, ProgressEvent, ProgressSender, RecognitionState};
use crate::vision::{image_dimensions, ImagePreprocessor};

/// Counts after a batch run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionSummary {
    pub done: usize,
    pub failed: usize,
    /// Never started, usually because the batch was cancelled or aborted
    pub pending: usize,
    pub elapsed: Duration,
}

impl CompletionSummary {
    /// Tally the states of `records`
    pub fn from_records(records: &[ImageRecord], elapsed: Duration) -> Self {
        let mut summary = Self {
            elapsed,
            ..Default::default()
        };
        for record in records {
            match record.state {
                RecognitionState::Done => summary.done += 1,
                RecognitionState::Failed { .. } => summary.failed += 1,
                // Running cannot survive a finished run
                RecognitionState::Pending | RecognitionState::Running => summary.pending += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.done + self.failed + self.pending
    }
}

/// Drives recognition of one group of images
pub struct Dispatcher {
    recognizer: Arc<dyn TextRecognizer>,
    preprocessor: Arc<ImagePreprocessor>,
    separator: String,
}

impl Dispatcher {
    pub fn new(
        recognizer: Arc<dyn TextRecognizer>,
        preprocessor: Arc<ImagePreprocessor>,
        separator: impl Into<String>,
    ) -> Self {
        Self {
            recognizer,
            preprocessor,
            separator: separator.into(),
        }
    }

    /// Recognize every Pending record in place
    ///
    /// Records that are already Done (restored from cache) are left alone.
    /// A fatal engine error stops new records from starting; the error is
    /// returned once in-flight records drain, and unstarted records stay
    /// Pending.
    pub async fn run(
        &self,
        records: &mut [ImageRecord],
        concurrency_limit: usize,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<CompletionSummary> {
        let started = Instant::now();
        let total = records.len();
        let limit = concurrency_limit.max(1);

        // Cancelled by the caller or by a fatal error below
        let stop = cancel.child_token();
        let fatal: Mutex<Option<OcrRenameError>> = Mutex::new(None);

        debug!("Dispatching {} records with {} slots", total, limit);

        {
            let stop = &stop;
            let fatal = &fatal;
            stream::iter(records.iter_mut().enumerate())
                .for_each_concurrent(limit, |(index, record)| async move {
                    if record.state != RecognitionState::Pending || stop.is_cancelled() {
                        return;
                    }
                    if let Err(e) = self.process(record, index, total, progress).await {
                        error!("Stopping batch after fatal engine error: {}", e);
                        stop.cancel();
                        fatal.lock().get_or_insert(e);
                    }
                })
                .await;
        }

        let summary = CompletionSummary::from_records(records, started.elapsed());

        if let Some(e) = fatal.into_inner() {
            warn!(
                "Batch aborted: {} done, {} failed, {} not started",
                summary.done, summary.failed, summary.pending
            );
            return Err(e);
        }

        if cancel.is_cancelled() {
            info!(
                "Batch cancelled: {} done, {} failed, {} left pending ({:.1}s)",
                summary.done,
                summary.failed,
                summary.pending,
                summary.elapsed.as_secs_f64()
            );
        } else {
            info!(
                "Batch finished: {} done, {} failed ({:.1}s)",
                summary.done,
                summary.failed,
                summary.elapsed.as_secs_f64()
            );
        }
        Ok(summary)
    }

    /// One attempt for one record; `Err` only for fatal engine errors
    async fn process(
        &self,
        record: &mut ImageRecord,
        index: usize,
        total: usize,
        progress: &ProgressSender,
    ) -> Result<()> {
        record.begin_attempt();
        emit(progress, record, index, total);

        let source = record.path.clone();
        let preprocessor = self.preprocessor.clone();
        let prepared = tokio::task::spawn_blocking(move || prepare(&preprocessor, source))
            .await
            .unwrap_or_else(|e| {
                (
                    Err(OcrRenameError::unsupported(
                        &record.path,
                        format!("preprocessing task failed: {e}"),
                    )),
                    None,
                )
            });

        let (effective, dimensions) = prepared;
        if dimensions.is_some() {
            record.dimensions = dimensions;
        }

        let outcome = match effective {
            Ok(effective) => {
                let reply = self.recognizer.recognize(&effective).await;
                // Every exit path after recognition releases the temporary copy
                self.preprocessor.release_if_temporary(&effective);
                reply.and_then(|reply| {
                    let generation = reply.generation;
                    reply
                        .response
                        .into_text(&self.separator)
                        .map(|text| (text, generation))
                })
            }
            Err(e) => Err(e),
        };

        let result = match outcome {
            Ok((text, generation)) => {
                debug!(
                    "{} recognized by generation {} ({} chars)",
                    record.display_name(),
                    generation,
                    text.chars().count()
                );
                record.complete(text, generation);
                Ok(())
            }
            Err(e) => {
                debug!("{} failed: {}", record.display_name(), e);
                record.fail(e.to_string());
                if e.is_fatal() {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        };

        emit(progress, record, index, total);
        result
    }
}

/// Convert if needed and read the pixel size; runs on the blocking pool
fn prepare(
    preprocessor: &ImagePreprocessor,
    source: PathBuf,
) -> (Result<PathBuf>, Option<(u32, u32)>) {
    let effective = preprocessor.ensure_readable(&source);
    let dimensions = match &effective {
        Ok(path) => image_dimensions(path),
        Err(_) => None,
    };
    (effective, dimensions)
}

fn emit(progress: &ProgressSender, record: &ImageRecord, index: usize, total: usize) {
    // A dropped receiver only means nobody is watching
    let _ = progress.send(ProgressEvent::for_record(record, index, total));
}
