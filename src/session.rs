//! OCR Session
//!
//! Single owner of the engine manager, the image preprocessor, and the
//! recognition cache for one run. Everything that talks to the engine gets it
//! through here, and `shutdown` tears it all down in one place.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::dispatch::{CompletionSummary, Dispatcher};
use crate::engine::{EngineManager, TextRecognizer};
use crate::error::{OcrRenameError, Result};
use crate::matching::{build_scorer, match_groups, MatchItem, MatchOptions, MatchOutcome};
use crate::rename::{plan_renames, PlannedRename};
use crate::shared::{records_for, Group, ImageRecord, ProgressSender, RecognitionState};
use crate::storage::RecognitionCache;
use crate::vision::ImagePreprocessor;

/// Records of one group after a dispatcher run
#[derive(Debug)]
pub struct GroupRecognition {
    pub group: Group,
    pub records: Vec<ImageRecord>,
    pub summary: CompletionSummary,
    /// Engine failure that stopped the group; unstarted records stay Pending
    pub fatal: Option<OcrRenameError>,
}

pub struct OcrSession {
    config: AppConfig,
    engine: Arc<EngineManager>,
    preprocessor: Arc<ImagePreprocessor>,
    cache: RecognitionCache,
}

impl OcrSession {
    /// Resolve the engine and set up the session; the engine is not launched yet
    pub fn open(config: AppConfig, cache: RecognitionCache) -> Result<Self> {
        config.validate()?;
        let engine = Arc::new(EngineManager::from_config(config.engine.clone())?);
        let preprocessor = Arc::new(ImagePreprocessor::new(&config.recognition.convert_extensions));
        info!("Using OCR engine {:?}", engine.executable());

        Ok(Self {
            config,
            engine,
            preprocessor,
            cache,
        })
    }

    #[cfg(test)]
    pub fn engine(&self) -> &Arc<EngineManager> {
        &self.engine
    }

    /// Recognize one folder's images, reusing cached text where possible
    ///
    /// The engine is launched only when something is left after the cache
    /// lookup, and a broken engine is reported before any image is touched.
    /// A fatal engine error ends up in `fatal`; whatever was recognized so far
    /// is still returned and cached.
    pub async fn recognize_group(
        &mut self,
        group: Group,
        paths: &[PathBuf],
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> GroupRecognition {
        let started = Instant::now();
        let mut records = records_for(paths, group);
        self.restore_cached(group, &mut records);

        let pending = records
            .iter()
            .filter(|r| r.state == RecognitionState::Pending)
            .count();

        let mut fatal = None;
        if pending > 0 && !cancel.is_cancelled() {
            match self.engine.ensure_started().await {
                Ok(generation) => debug!("Engine generation {} ready for group {}", generation, group),
                Err(e) => {
                    error!("OCR engine unavailable for group {}: {}", group, e);
                    fatal = Some(e);
                }
            }
        }

        let summary = if fatal.is_none() {
            info!("Recognizing group {} ({} images, {} to do)", group, records.len(), pending);
            let recognizer: Arc<dyn TextRecognizer> = self.engine.clone();
            let dispatcher = Dispatcher::new(
                recognizer,
                self.preprocessor.clone(),
                self.config.engine.fragment_separator.clone(),
            );
            let outcome = dispatcher
                .run(
                    &mut records,
                    self.config.recognition.concurrency,
                    progress,
                    cancel,
                )
                .await;
            match outcome {
                Ok(summary) => summary,
                Err(e) => {
                    fatal = Some(e);
                    CompletionSummary::from_records(&records, started.elapsed())
                }
            }
        } else {
            CompletionSummary::from_records(&records, started.elapsed())
        };
        debug!(
            "Group {} finished with engine generation {}",
            group,
            self.engine.generation()
        );

        self.remember(&records);
        GroupRecognition {
            group,
            records,
            summary,
            fatal,
        }
    }

    /// Match recognized B images to A images with the configured scorer
    pub fn match_groups(&self, group_a: &[ImageRecord], group_b: &[ImageRecord]) -> MatchOutcome {
        let matching = &self.config.matching;
        let scorer = build_scorer(matching.scorer, matching.normalize);
        let options = MatchOptions {
            threshold: matching.threshold,
            collision_policy: matching.collision_policy,
            same_size_only: matching.same_size_only,
            review_margin: matching.review_margin,
        };
        match_groups(
            &match_items(group_a),
            &match_items(group_b),
            &options,
            scorer.as_ref(),
        )
    }

    /// Rename plan for `outcome` against the current B listing
    pub fn plan_renames(&self, outcome: &MatchOutcome, b_listing: &[PathBuf]) -> Vec<PlannedRename> {
        plan_renames(&outcome.results, b_listing)
    }

    /// Stop the engine, drop temporary files, and persist the cache
    pub async fn shutdown(&mut self) {
        self.engine.shutdown().await;
        self.preprocessor.release_all();
        if let Err(e) = self.cache.save() {
            warn!("Failed to save recognition cache: {}", e);
        }
    }

    fn restore_cached(&self, group: Group, records: &mut [ImageRecord]) {
        if !self.config.recognition.use_cache {
            return;
        }
        let mut restored = 0;
        for record in records.iter_mut() {
            if let Some(entry) = self.cache.lookup(&record.path) {
                record.restore_cached(entry.text.clone(), entry.dimensions);
                restored += 1;
            }
        }
        if restored > 0 {
            info!("Group {}: {} of {} images restored from cache", group, restored, records.len());
        }
    }

    fn remember(&mut self, records: &[ImageRecord]) {
        if !self.config.recognition.use_cache {
            return;
        }
        for record in records {
            if record.state == RecognitionState::Done && !record.from_cache {
                self.cache.store(&record.path, &record.text, record.dimensions);
            }
        }
    }
}

/// Every record becomes a match item; failed ones carry empty text and never match
fn match_items(records: &[ImageRecord]) -> Vec<MatchItem> {
    records
        .iter()
        .map(|record| {
            MatchItem::new(record.identifier().to_string_lossy(), record.text.clone())
                .with_dimensions(record.dimensions)
        })
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::shared::progress_channel;
    use std::path::Path;
    use tempfile::TempDir;

    /// Answers with the file stem minus everything up to the first '-'
    const STEM_ENGINE: &str = r#"
echo "OCR init completed."
while IFS= read -r line; do
  text=$(printf '%s' "$line" | sed 's/.*\///; s/\.[^.]*$//; s/^[^-]*-//')
  printf '{"code":100,"data":[{"text":"%s"}]}\n' "$text"
done
"#;

    fn session_config(dir: &TempDir) -> AppConfig {
        let script = dir.path().join("engine.sh");
        std::fs::write(&script, STEM_ENGINE).unwrap();
        let mut config = AppConfig::default();
        config.engine = EngineConfig {
            executable: Some(PathBuf::from("/bin/sh")),
            args: vec![script.to_string_lossy().into_owned()],
            working_dir: Some(dir.path().to_path_buf()),
            models_subdir: None,
            ready_timeout_secs: 5,
            request_timeout_secs: 5,
            shutdown_grace_ms: 200,
            ..Default::default()
        };
        config
    }

    fn write_png(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        image::RgbImage::new(4, 4).save(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn test_recognize_match_and_plan() {
        let dir = tempfile::tempdir().unwrap();
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let a = vec![
            write_png(a_dir.path(), "01-chapter one.png"),
            write_png(a_dir.path(), "02-epilogue.png"),
        ];
        let b = vec![
            write_png(b_dir.path(), "x-epilogue.png"),
            write_png(b_dir.path(), "y-chaptr one.png"),
        ];

        let mut config = session_config(&dir);
        config.matching.threshold = 0.6;
        let mut session = OcrSession::open(config, RecognitionCache::in_memory()).unwrap();

        let (tx, _rx) = progress_channel();
        let cancel = CancellationToken::new();
        let group_a = session.recognize_group(Group::A, &a, &tx, &cancel).await;
        let group_b = session.recognize_group(Group::B, &b, &tx, &cancel).await;
        assert!(group_a.fatal.is_none() && group_b.fatal.is_none());
        assert_eq!(group_a.summary.done, 2);
        // Group B reuses the process group A started
        assert_eq!(session.engine().generation(), 1);
        assert_eq!(group_a.records[0].text, "chapter one");

        let outcome = session.match_groups(&group_a.records, &group_b.records);
        assert_eq!(
            outcome.results[0].a_identifier.as_deref(),
            Some(a[1].to_string_lossy().as_ref())
        );
        assert_eq!(
            outcome.results[1].a_identifier.as_deref(),
            Some(a[0].to_string_lossy().as_ref())
        );

        let plan = session.plan_renames(&outcome, &b);
        let names: Vec<String> = plan.iter().map(|p| p.target_name()).collect();
        assert_eq!(names, vec!["02-epilogue.png", "01-chapter one.png"]);

        session.shutdown().await;
        assert!(!session.engine().is_running().await);
    }

    #[tokio::test]
    async fn test_cache_skips_engine_on_second_run() {
        let dir = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let a = vec![write_png(images.path(), "1-cached.png")];
        let cache_path = dir.path().join("cache.json");

        let mut session =
            OcrSession::open(session_config(&dir), RecognitionCache::load(cache_path.clone())).unwrap();
        let (tx, _rx) = progress_channel();
        let first = session
            .recognize_group(Group::A, &a, &tx, &CancellationToken::new())
            .await;
        assert!(!first.records[0].from_cache);
        session.shutdown().await;

        let mut session =
            OcrSession::open(session_config(&dir), RecognitionCache::load(cache_path)).unwrap();
        let second = session
            .recognize_group(Group::A, &a, &tx, &CancellationToken::new())
            .await;
        assert!(second.records[0].from_cache);
        assert_eq!(second.records[0].text, "cached");
        // Nothing needed the engine, so it was never launched
        assert_eq!(session.engine().generation(), 0);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_fully_cached_group_needs_no_engine() {
        let dir = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let a = vec![write_png(images.path(), "1-known.png")];

        let mut cache = RecognitionCache::in_memory();
        cache.store(&a[0], "known", None);
        let mut config = session_config(&dir);
        config.engine.executable = Some(PathBuf::from("/nonexistent/engine"));

        let mut session = OcrSession::open(config, cache).unwrap();
        let (tx, _rx) = progress_channel();
        let group = session
            .recognize_group(Group::A, &a, &tx, &CancellationToken::new())
            .await;

        assert!(group.fatal.is_none());
        assert_eq!(group.summary.done, 1);
        assert_eq!(session.engine().generation(), 0);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_never_ready_processes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let a = vec![
            write_png(images.path(), "1-one.png"),
            write_png(images.path(), "2-two.png"),
        ];
        let mut config = session_config(&dir);
        std::fs::write(dir.path().join("engine.sh"), "exec sleep 30\n").unwrap();
        config.engine.ready_timeout_secs = 1;

        let mut session = OcrSession::open(config, RecognitionCache::in_memory()).unwrap();
        let (tx, rx) = progress_channel();
        let group = session
            .recognize_group(Group::A, &a, &tx, &CancellationToken::new())
            .await;

        assert!(group.fatal.as_ref().unwrap().is_fatal());
        assert_eq!(group.summary.pending, 2);
        assert!(group.records.iter().all(|r| r.attempts == 0));
        drop(tx);
        assert_eq!(rx.iter().count(), 0);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_restart_keeps_partial_counts() {
        let dir = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let a: Vec<PathBuf> = (1..=4)
            .map(|i| write_png(images.path(), &format!("{i}-page.png")))
            .collect();

        // Answers once; every relaunch dies before becoming ready
        let mut config = session_config(&dir);
        std::fs::write(
            dir.path().join("engine.sh"),
            "if [ -f launched ]; then exit 3; fi\ntouch launched\necho 'OCR init completed.'\nread -r line\necho '{\"code\":100,\"data\":[{\"text\":\"first\"}]}'\nexit 0\n",
        )
        .unwrap();
        config.recognition.concurrency = 1;

        let mut session = OcrSession::open(config, RecognitionCache::in_memory()).unwrap();
        let (tx, _rx) = progress_channel();
        let group = session
            .recognize_group(Group::A, &a, &tx, &CancellationToken::new())
            .await;

        assert!(group.fatal.as_ref().unwrap().is_fatal());
        assert_eq!(group.summary.done, 1);
        assert_eq!(group.summary.failed, 2);
        assert_eq!(group.summary.pending, 1);
        assert_eq!(group.records[0].text, "first");
        assert!(group.records[1].failure_reason().is_some());
        assert_eq!(group.records[3].state, RecognitionState::Pending);
        session.shutdown().await;
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = session_config(&dir);
        config.matching.threshold = -0.1;
        assert!(OcrSession::open(config, RecognitionCache::in_memory()).is_err());
    }
}
