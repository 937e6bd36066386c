//! ocr-rename - rename one folder of images after another by their text
//!
//! Both folders are run through an external OCR engine; every image in
//! group B is matched to the group A image with the most similar text and
//! can then be renamed after it.

mod config;
mod dispatch;
mod engine;
mod error;
mod matching;
mod rename;
mod report;
mod session;
mod shared;
mod storage;
mod vision;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::error::OcrRenameError;
use crate::matching::{CollisionPolicy, ScorerKind};
use crate::rename::execute_plan;
use crate::report::{BatchReport, GroupReport, RenameReport};
use crate::session::{GroupRecognition, OcrSession};
use crate::shared::{progress_channel, Group, ProgressReceiver, RecognitionState};
use crate::storage::RecognitionCache;

/// Exit code for an engine that could not be launched or kept alive
const EXIT_ENGINE_FAILURE: u8 = 2;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScorerArg {
    Levenshtein,
    Ratio,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Greedy,
    FlagAll,
    Optimal,
}

/// Rename images in group B after their best text match in group A
#[derive(Parser, Debug)]
#[command(name = "ocr-rename")]
#[command(about = "OCR two image folders and rename B images after their closest A match")]
struct Args {
    /// Folder with the reference images (names are kept)
    #[arg(long, value_name = "DIR")]
    group_a: PathBuf,

    /// Folder with the images to rename
    #[arg(long, value_name = "DIR")]
    group_b: PathBuf,

    /// Minimum similarity for a match (0.0 - 1.0)
    #[arg(long)]
    threshold: Option<f64>,

    /// Images prepared and queued at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Configuration file (defaults to config.toml in the config directory)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// OCR engine executable
    #[arg(long, value_name = "FILE")]
    engine: Option<PathBuf>,

    /// Similarity metric
    #[arg(long, value_enum)]
    scorer: Option<ScorerArg>,

    /// Compare lowercased and punctuation-free text too
    #[arg(long)]
    normalize: bool,

    /// How to settle several B images matching the same A image
    #[arg(long, value_enum)]
    collision_policy: Option<PolicyArg>,

    /// Only match images with identical pixel dimensions
    #[arg(long, conflicts_with = "any_size")]
    same_size_only: bool,

    /// Match images regardless of their dimensions
    #[arg(long)]
    any_size: bool,

    /// Actually rename files (otherwise only the plan is reported)
    #[arg(long)]
    rename: bool,

    /// Ignore and do not update the recognition cache
    #[arg(long)]
    no_cache: bool,

    /// Write the JSON report here instead of stdout
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            if is_engine_failure(&e) {
                ExitCode::from(EXIT_ENGINE_FAILURE)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// Logs go to stderr so the report on stdout stays parseable
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn is_engine_failure(e: &anyhow::Error) -> bool {
    e.chain()
        .filter_map(|cause| cause.downcast_ref::<OcrRenameError>())
        .any(OcrRenameError::is_fatal)
}

fn run(args: Args) -> Result<()> {
    let config = effective_config(&args)?;
    config.validate()?;

    let extensions = &config.recognition.image_extensions;
    let a_paths = storage::scan_folder(&args.group_a, extensions)
        .with_context(|| format!("Failed to list group A folder {:?}", args.group_a))?;
    let b_paths = storage::scan_folder(&args.group_b, extensions)
        .with_context(|| format!("Failed to list group B folder {:?}", args.group_b))?;
    info!("Group A: {} images, group B: {} images", a_paths.len(), b_paths.len());

    let cache = if config.recognition.use_cache {
        match storage::default_cache_path() {
            Ok(path) => RecognitionCache::load(path),
            Err(e) => {
                warn!("Recognition cache unavailable: {}", e);
                RecognitionCache::in_memory()
            }
        }
    } else {
        RecognitionCache::in_memory()
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let outcome = runtime.block_on(run_batch(config, cache, &a_paths, &b_paths, args.rename))?;

    let json = outcome.report.to_json().context("Failed to serialize report")?;
    match &args.report {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("Failed to write report {:?}", path))?;
            info!("Report written to {:?}", path);
        }
        None => println!("{json}"),
    }

    match outcome.fatal {
        Some(e) => Err(anyhow::Error::new(e).context("Recognition aborted")),
        None => Ok(()),
    }
}

/// Config file (if any) with command-line overrides applied
fn effective_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load configuration {:?}", path))?,
        None => load_or_create_config(),
    };

    if let Some(threshold) = args.threshold {
        config.matching.threshold = threshold;
    }
    if let Some(concurrency) = args.concurrency {
        config.recognition.concurrency = concurrency;
    }
    if let Some(engine) = &args.engine {
        config.engine.executable = Some(engine.clone());
    }
    if let Some(scorer) = args.scorer {
        config.matching.scorer = match scorer {
            ScorerArg::Levenshtein => ScorerKind::Levenshtein,
            ScorerArg::Ratio => ScorerKind::Ratio,
        };
    }
    if args.normalize {
        config.matching.normalize = true;
    }
    if let Some(policy) = args.collision_policy {
        config.matching.collision_policy = match policy {
            PolicyArg::Greedy => CollisionPolicy::Greedy,
            PolicyArg::FlagAll => CollisionPolicy::FlagAll,
            PolicyArg::Optimal => CollisionPolicy::Optimal,
        };
    }
    if args.same_size_only {
        config.matching.same_size_only = true;
    }
    if args.any_size {
        config.matching.same_size_only = false;
    }
    if args.no_cache {
        config.recognition.use_cache = false;
    }
    Ok(config)
}

/// Load configuration from the config directory, writing the defaults there on first run
fn load_or_create_config() -> AppConfig {
    if let Ok(config_dir) = storage::get_config_dir() {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            match config::load_config(&config_path) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path);
                    return config;
                }
                Err(e) => warn!("Ignoring invalid configuration {:?}: {:#}", config_path, e),
            }
        } else {
            match config::save_config(&AppConfig::default(), &config_path) {
                Ok(()) => info!("Wrote default configuration to {:?}", config_path),
                Err(e) => debug!("Could not write default configuration: {:#}", e),
            }
        }
    }
    debug!("Using default configuration");
    AppConfig::default()
}

/// Report of a run plus the engine error that cut it short, if any
struct BatchOutcome {
    report: BatchReport,
    fatal: Option<OcrRenameError>,
}

async fn run_batch(
    config: AppConfig,
    cache: RecognitionCache,
    a_paths: &[PathBuf],
    b_paths: &[PathBuf],
    apply_renames: bool,
) -> Result<BatchOutcome> {
    let mut session = OcrSession::open(config, cache)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted: finishing images in flight, no new ones will start");
                cancel.cancel();
            }
        });
    }

    let outcome = recognize_and_match(&mut session, a_paths, b_paths, &cancel, apply_renames).await;
    session.shutdown().await;
    Ok(outcome)
}

async fn recognize_and_match(
    session: &mut OcrSession,
    a_paths: &[PathBuf],
    b_paths: &[PathBuf],
    cancel: &CancellationToken,
    apply_renames: bool,
) -> BatchOutcome {
    let mut report = BatchReport::default();

    let (progress, events) = progress_channel();
    let printer = std::thread::spawn(move || print_progress(events));

    let mut group_a = session.recognize_group(Group::A, a_paths, &progress, cancel).await;
    let mut group_b = if group_a.fatal.is_none() && !cancel.is_cancelled() {
        Some(session.recognize_group(Group::B, b_paths, &progress, cancel).await)
    } else {
        None
    };

    drop(progress);
    if printer.join().is_err() {
        warn!("Progress printer panicked");
    }

    report.group_a = GroupReport::from_recognition(&group_a);
    log_group(&group_a, &report.group_a);
    report.group_b = match &group_b {
        Some(group_b) => {
            let group_report = GroupReport::from_recognition(group_b);
            log_group(group_b, &group_report);
            group_report
        }
        None => GroupReport::not_started(b_paths.len()),
    };

    let fatal = group_a
        .fatal
        .take()
        .or_else(|| group_b.as_mut().and_then(|g| g.fatal.take()));
    if let Some(e) = fatal {
        error!("Engine failure, skipping matching: {}", e);
        report.aborted = Some(e.to_string());
        return BatchOutcome {
            report,
            fatal: Some(e),
        };
    }

    let group_b = match group_b {
        Some(group_b) if !cancel.is_cancelled() => group_b,
        _ => {
            report.cancelled = true;
            warn!("Cancelled; skipping matching");
            return BatchOutcome {
                report,
                fatal: None,
            };
        }
    };

    let outcome = session.match_groups(&group_a.records, &group_b.records);
    report.set_matches(&outcome);
    info!(
        "Matched {} of {} B images ({} collisions)",
        outcome.matched(),
        outcome.results.len(),
        outcome.collisions.len()
    );

    let plan = session.plan_renames(&outcome, b_paths);
    for planned in &plan {
        debug!("Plan: {:?} -> {}", planned.source, planned.target_name());
    }
    report.renames = if apply_renames {
        let summary = execute_plan(&plan);
        info!(
            "Renames: {} succeeded, {} failed",
            summary.succeeded.len(),
            summary.failures.len()
        );
        RenameReport::applied(plan, summary)
    } else {
        info!("{} renames planned (use --rename to apply)", plan.len());
        RenameReport::dry_run(plan)
    };

    BatchOutcome {
        report,
        fatal: None,
    }
}

fn print_progress(events: ProgressReceiver) {
    for event in events {
        let position = event.index + 1;
        match &event.state {
            RecognitionState::Failed { .. } => {
                warn!(group = %event.group, position, total = event.total, "{}", event.summary)
            }
            state if state.is_terminal() => {
                info!(group = %event.group, position, total = event.total, "{}", event.summary);
                if let Some(text) = &event.text {
                    debug!("{:?} full text: {:?}", event.identifier, text);
                }
            }
            state => debug!(
                group = %event.group,
                position,
                total = event.total,
                state = state.label(),
                "{}",
                event.summary
            ),
        }
    }
}

fn log_group(recognition: &GroupRecognition, group: &GroupReport) {
    info!(
        "Recognition {}: {} done ({} cached), {} failed, {} pending in {:.1}s",
        recognition.group,
        group.done,
        group.from_cache,
        group.failed,
        group.pending,
        group.elapsed_ms as f64 / 1000.0
    );
}
