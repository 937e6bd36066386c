//! Machine-readable batch report

use serde::Serialize;
use std::path::PathBuf;

use crate::matching::MatchOutcome;
use crate::rename::{PlannedRename, RenameFailure, RenameSummary};
use crate::session::GroupRecognition;

#[derive(Debug, Clone, Serialize)]
pub struct FailureEntry {
    pub image: PathBuf,
    pub reason: String,
}

/// Recognition counts for one group
#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupReport {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub pending: usize,
    pub from_cache: usize,
    pub elapsed_ms: u64,
    pub failures: Vec<FailureEntry>,
}

impl GroupReport {
    pub fn from_recognition(recognition: &GroupRecognition) -> Self {
        let summary = &recognition.summary;
        Self {
            total: summary.total(),
            done: summary.done,
            failed: summary.failed,
            pending: summary.pending,
            from_cache: recognition.records.iter().filter(|r| r.from_cache).count(),
            elapsed_ms: summary.elapsed.as_millis() as u64,
            failures: recognition
                .records
                .iter()
                .filter_map(|r| {
                    r.failure_reason().map(|reason| FailureEntry {
                        image: r.path.clone(),
                        reason: reason.to_string(),
                    })
                })
                .collect(),
        }
    }

    /// A group that was never started: every image is still pending
    pub fn not_started(total: usize) -> Self {
        Self {
            total,
            pending: total,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchEntry {
    pub b: String,
    pub a: Option<String>,
    pub score: f64,
    pub rank: usize,
    pub needs_review: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Claimant {
    pub b: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollisionEntry {
    pub a: String,
    pub claimants: Vec<Claimant>,
    pub winner: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenameReport {
    pub planned: Vec<PlannedRename>,
    /// Whether the plan was executed or only printed
    pub applied: bool,
    pub succeeded: usize,
    pub failures: Vec<RenameFailure>,
}

impl RenameReport {
    pub fn dry_run(planned: Vec<PlannedRename>) -> Self {
        Self {
            planned,
            ..Default::default()
        }
    }

    pub fn applied(planned: Vec<PlannedRename>, summary: RenameSummary) -> Self {
        Self {
            planned,
            applied: true,
            succeeded: summary.succeeded.len(),
            failures: summary.failures,
        }
    }
}

/// Everything a run produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub group_a: GroupReport,
    pub group_b: GroupReport,
    pub matches: Vec<MatchEntry>,
    pub collisions: Vec<CollisionEntry>,
    pub renames: RenameReport,
    pub cancelled: bool,
    /// Engine failure that stopped the run before matching
    pub aborted: Option<String>,
}

impl BatchReport {
    pub fn set_matches(&mut self, outcome: &MatchOutcome) {
        self.matches = outcome
            .results
            .iter()
            .map(|r| MatchEntry {
                b: r.b_identifier.clone(),
                a: r.a_identifier.clone(),
                score: r.score,
                rank: r.rank,
                needs_review: r.needs_review,
            })
            .collect();
        self.collisions = outcome
            .collisions
            .iter()
            .map(|c| CollisionEntry {
                a: c.a_identifier.clone(),
                claimants: c
                    .claimants
                    .iter()
                    .map(|(b, score)| Claimant {
                        b: b.clone(),
                        score: *score,
                    })
                    .collect(),
                winner: c.winner.clone(),
            })
            .collect();
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
