//! Rename Planner
//!
//! Turns matches into renames of B files after their A counterpart: the A
//! file's stem with the B file's own extension. Names already present in the
//! destination folder, or claimed earlier in the same plan, get a `_N`
//! suffix. Planning touches nothing on disk; `execute_plan` performs one
//! rename per entry and keeps going past failures.

use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{OcrRenameError, Result};
use crate::matching::MatchResult;

/// One file to rename
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRename {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl PlannedRename {
    pub fn target_name(&self) -> String {
        self.target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RenameFailure {
    pub source: PathBuf,
    pub target: PathBuf,
    pub reason: String,
}

/// Result of executing a plan
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenameSummary {
    pub succeeded: Vec<PlannedRename>,
    pub failures: Vec<RenameFailure>,
}

/// Build a conflict-free plan for every matched B image
///
/// `destination_listing` is the current content of the folders being renamed
/// into. Comparisons ignore case so a plan behaves the same on
/// case-insensitive filesystems.
pub fn plan_renames(matches: &[MatchResult], destination_listing: &[PathBuf]) -> Vec<PlannedRename> {
    let mut taken: HashSet<PathBuf> = destination_listing.iter().map(|p| fold_case(p)).collect();
    let mut plan = Vec::new();

    for result in matches {
        let Some(a_identifier) = &result.a_identifier else {
            continue;
        };
        let source = PathBuf::from(&result.b_identifier);
        let Some(stem) = Path::new(a_identifier).file_stem() else {
            warn!("Cannot derive a name from {:?}", a_identifier);
            continue;
        };
        let stem = stem.to_string_lossy();
        let extension = source
            .extension()
            .map(|e| e.to_string_lossy().into_owned());
        let dir = source.parent().map(Path::to_path_buf).unwrap_or_default();

        let candidate = dir.join(file_name(&stem, extension.as_deref(), 0));
        if fold_case(&candidate) == fold_case(&source) {
            debug!("{:?} already has its target name", source);
            continue;
        }

        let mut n = 0;
        let target = loop {
            let candidate = dir.join(file_name(&stem, extension.as_deref(), n));
            if !taken.contains(&fold_case(&candidate)) {
                break candidate;
            }
            n += 1;
        };

        taken.insert(fold_case(&target));
        plan.push(PlannedRename { source, target });
    }

    plan
}

/// Rename every planned pair; failures are collected, never fatal
pub fn execute_plan(plan: &[PlannedRename]) -> RenameSummary {
    let mut summary = RenameSummary::default();

    for entry in plan {
        match rename_one(entry) {
            Ok(()) => {
                debug!("Renamed {:?} -> {:?}", entry.source, entry.target);
                summary.succeeded.push(entry.clone());
            }
            Err(e) => {
                warn!("{}", e);
                summary.failures.push(RenameFailure {
                    source: entry.source.clone(),
                    target: entry.target.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    info!(
        "Renamed {} of {} files ({} failed)",
        summary.succeeded.len(),
        plan.len(),
        summary.failures.len()
    );
    summary
}

fn rename_one(entry: &PlannedRename) -> Result<()> {
    let io_error = |reason: String| OcrRenameError::RenameIo {
        source_path: entry.source.clone(),
        target_path: entry.target.clone(),
        reason,
    };

    if !entry.source.exists() {
        return Err(io_error("source no longer exists".to_string()));
    }
    if entry.target.exists() {
        return Err(io_error("target already exists".to_string()));
    }
    std::fs::rename(&entry.source, &entry.target).map_err(|e| io_error(e.to_string()))
}

fn file_name(stem: &str, extension: Option<&str>, suffix: usize) -> String {
    let stem = if suffix == 0 {
        stem.to_string()
    } else {
        format!("{stem}_{suffix}")
    };
    match extension {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}

fn fold_case(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().to_lowercase())
}
