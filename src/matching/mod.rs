//! Similarity Matcher
//!
//! Scores every B text against every A text and turns the scores into an
//! assignment from B to A. Each B first gets its independent best candidate
//! (ties go to the lowest A index); A images claimed by more than one B are
//! reported as collisions, and the collision policy decides who keeps them.

pub mod assignment;
pub mod scorer;

pub use scorer::{build_scorer, SimilarityScorer};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Which string metric to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    /// Normalized edit distance
    #[default]
    Levenshtein,
    /// Indel ratio (longest common subsequence)
    Ratio,
}

/// How to settle several B images wanting the same A image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Highest score claims first; the rest fall back to their next free candidate
    #[default]
    Greedy,
    /// Every claimant of a contested A is left unmatched
    FlagAll,
    /// Maximum total score over all pairs
    Optimal,
}

/// One recognized image as seen by the matcher
#[derive(Debug, Clone)]
pub struct MatchItem {
    pub id: String,
    pub text: String,
    pub dimensions: Option<(u32, u32)>,
}

impl MatchItem {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            dimensions: None,
        }
    }

    pub fn with_dimensions(mut self, dimensions: Option<(u32, u32)>) -> Self {
        self.dimensions = dimensions;
        self
    }
}

#[derive(Debug, Clone)]
pub struct MatchOptions {
    /// Minimum score for a match
    pub threshold: f64,
    pub collision_policy: CollisionPolicy,
    /// Skip A candidates whose known size differs from the B image's
    pub same_size_only: bool,
    /// Matches below `threshold + review_margin` are flagged
    pub review_margin: f64,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            threshold: 0.80,
            collision_policy: CollisionPolicy::Greedy,
            same_size_only: true,
            review_margin: 0.05,
        }
    }
}

#[cfg(test)]
impl MatchOptions {
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }
}

/// Outcome for one B image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub b_identifier: String,
    /// `None` when nothing scored high enough or the claim was given up
    pub a_identifier: Option<String>,
    /// Score of the assigned A, or of the best candidate when unmatched
    pub score: f64,
    /// 1-based position of the assigned A in this B's candidate ranking; 0 when unmatched
    pub rank: usize,
    pub needs_review: bool,
}

/// An A image that was the independent best match of several B images
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Collision {
    pub a_identifier: String,
    /// `(b_identifier, score)` of every claimant, highest score first
    pub claimants: Vec<(String, f64)>,
    /// B image that ended up with the A image, if any
    pub winner: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchOutcome {
    /// One entry per B image, in B order
    pub results: Vec<MatchResult>,
    pub collisions: Vec<Collision>,
}

impl MatchOutcome {
    pub fn matched(&self) -> usize {
        self.results.iter().filter(|r| r.a_identifier.is_some()).count()
    }
}

/// Cost of a pair that must not be chosen
const FORBIDDEN_COST: f64 = 2.0;

/// Cost of leaving a B image unmatched
const UNMATCHED_COST: f64 = 1.0;

/// Match every B item to at most one A item
pub fn match_groups(
    group_a: &[MatchItem],
    group_b: &[MatchItem],
    options: &MatchOptions,
    scorer: &dyn SimilarityScorer,
) -> MatchOutcome {
    // rankings[b] = (a index, score), best first, lowest A index on ties
    let rankings: Vec<Vec<(usize, f64)>> = group_b
        .iter()
        .map(|b| rank_candidates(b, group_a, options, scorer))
        .collect();

    let acceptable = |score: f64| score > 0.0 && score >= options.threshold;

    // Independent best per B
    let independent: Vec<Option<usize>> = rankings
        .iter()
        .map(|ranking| match ranking.first() {
            Some(&(a, score)) if acceptable(score) => Some(a),
            _ => None,
        })
        .collect();

    let mut claims: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (b, best) in independent.iter().enumerate() {
        if let Some(a) = best {
            claims.entry(*a).or_default().push(b);
        }
    }
    let contested: BTreeMap<usize, Vec<usize>> = claims
        .into_iter()
        .filter(|(_, claimants)| claimants.len() > 1)
        .collect();

    let assigned: Vec<Option<usize>> = match options.collision_policy {
        CollisionPolicy::Greedy => assign_greedy(&rankings, group_a.len(), acceptable),
        CollisionPolicy::FlagAll => independent
            .iter()
            .map(|best| best.filter(|a| !contested.contains_key(a)))
            .collect(),
        CollisionPolicy::Optimal => assign_optimal(&rankings, group_a.len(), acceptable),
    };

    let flagged: HashSet<usize> = contested.values().flatten().copied().collect();

    let results: Vec<MatchResult> = group_b
        .iter()
        .enumerate()
        .map(|(b, item)| {
            let ranking = &rankings[b];
            match assigned[b] {
                Some(a) => {
                    let position = ranking.iter().position(|&(cand, _)| cand == a).unwrap_or(0);
                    let score = ranking.get(position).map(|&(_, s)| s).unwrap_or(0.0);
                    MatchResult {
                        b_identifier: item.id.clone(),
                        a_identifier: Some(group_a[a].id.clone()),
                        score,
                        rank: position + 1,
                        needs_review: score < options.threshold + options.review_margin,
                    }
                }
                None => MatchResult {
                    b_identifier: item.id.clone(),
                    a_identifier: None,
                    score: ranking.first().map(|&(_, s)| s).unwrap_or(0.0),
                    rank: 0,
                    // Lost a contested claim: a human should look
                    needs_review: flagged.contains(&b),
                },
            }
        })
        .collect();

    let collisions = contested
        .into_iter()
        .map(|(a, mut claimants)| {
            claimants.sort_by(|&x, &y| {
                let sx = rankings[x][0].1;
                let sy = rankings[y][0].1;
                sy.total_cmp(&sx).then(x.cmp(&y))
            });
            let winner = claimants
                .iter()
                .find(|&&b| assigned[b] == Some(a))
                .map(|&b| group_b[b].id.clone());
            Collision {
                a_identifier: group_a[a].id.clone(),
                claimants: claimants
                    .iter()
                    .map(|&b| (group_b[b].id.clone(), rankings[b][0].1))
                    .collect(),
                winner,
            }
        })
        .collect::<Vec<_>>();

    let outcome = MatchOutcome {
        results,
        collisions,
    };
    debug!(
        "Matched {}/{} B images with {} ({:?}), {} collisions",
        outcome.matched(),
        group_b.len(),
        scorer.name(),
        options.collision_policy,
        outcome.collisions.len()
    );
    outcome
}

/// Scores of every eligible A for one B, best first
fn rank_candidates(
    b: &MatchItem,
    group_a: &[MatchItem],
    options: &MatchOptions,
    scorer: &dyn SimilarityScorer,
) -> Vec<(usize, f64)> {
    let mut ranking: Vec<(usize, f64)> = group_a
        .iter()
        .enumerate()
        .filter(|(_, a)| !options.same_size_only || sizes_compatible(a.dimensions, b.dimensions))
        .map(|(index, a)| (index, scorer.score(&b.text, &a.text)))
        .collect();
    // Stable sort keeps A order among equal scores
    ranking.sort_by(|x, y| y.1.total_cmp(&x.1));
    ranking
}

/// Unknown sizes never exclude a candidate
fn sizes_compatible(a: Option<(u32, u32)>, b: Option<(u32, u32)>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Claim in global descending score order; each A goes to its first claimant
fn assign_greedy(
    rankings: &[Vec<(usize, f64)>],
    a_len: usize,
    acceptable: impl Fn(f64) -> bool,
) -> Vec<Option<usize>> {
    let mut pairs: Vec<(f64, usize, usize)> = rankings
        .iter()
        .enumerate()
        .flat_map(|(b, ranking)| ranking.iter().map(move |&(a, score)| (score, b, a)))
        .filter(|&(score, _, _)| acceptable(score))
        .collect();
    pairs.sort_by(|x, y| y.0.total_cmp(&x.0).then(x.1.cmp(&y.1)).then(x.2.cmp(&y.2)));

    let mut assigned = vec![None; rankings.len()];
    let mut taken = vec![false; a_len];
    for (_, b, a) in pairs {
        if assigned[b].is_none() && !taken[a] {
            assigned[b] = Some(a);
            taken[a] = true;
        }
    }
    assigned
}

/// Maximum total score; a B may stay unmatched at cost 1
fn assign_optimal(
    rankings: &[Vec<(usize, f64)>],
    a_len: usize,
    acceptable: impl Fn(f64) -> bool,
) -> Vec<Option<usize>> {
    let b_len = rankings.len();
    if b_len == 0 {
        return Vec::new();
    }

    // Columns: A images, then one "unmatched" column per B
    let columns = a_len + b_len;
    let cost: Vec<Vec<f64>> = rankings
        .iter()
        .map(|ranking| {
            let mut row = vec![FORBIDDEN_COST; columns];
            for &(a, score) in ranking {
                if acceptable(score) {
                    row[a] = 1.0 - score;
                }
            }
            for cell in row.iter_mut().skip(a_len) {
                *cell = UNMATCHED_COST;
            }
            row
        })
        .collect();

    assignment::solve(&cost)
        .into_iter()
        .enumerate()
        .map(|(b, column)| {
            let allowed = column < a_len && cost[b][column] < UNMATCHED_COST;
            allowed.then_some(column)
        })
        .collect()
}
