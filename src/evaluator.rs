//! Quality verdict over a Turn snapshot.
//!
//! The verdict is a pure function of the snapshot: claims, evidence, plan
//! completion and the snapshot's own timestamp. Each of the five dimensions
//! is scored in [0, 1] and must meet its threshold on its own; scores are
//! never averaged across dimensions.
//!
//! Per-claim scores (depth, recency, confidence) are aggregated over active
//! claims by arithmetic mean. Coverage and consistency are turn-level.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ResearchConfig, Thresholds};
use crate::memory::{Claim, TurnSnapshot};

/// Score given to evidence with no usable publication date.
const UNKNOWN_RECENCY: f64 = 0.5;

/// An evaluation dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Share of the plan and its aspects covered.
    Coverage,
    /// Share of active claims not in conflict.
    Consistency,
    /// Support per claim relative to the target.
    Depth,
    /// Freshness of supporting evidence.
    Recency,
    /// Mean claim confidence.
    Confidence,
}

impl Dimension {
    /// All dimensions in reporting order
    pub const ALL: [Dimension; 5] = [
        Dimension::Coverage,
        Dimension::Consistency,
        Dimension::Depth,
        Dimension::Recency,
        Dimension::Confidence,
    ];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Coverage => "coverage",
            Dimension::Consistency => "consistency",
            Dimension::Depth => "depth",
            Dimension::Recency => "recency",
            Dimension::Confidence => "confidence",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One score per dimension.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DimensionScores {
    /// Coverage score.
    pub coverage: f64,
    /// Consistency score.
    pub consistency: f64,
    /// Depth score.
    pub depth: f64,
    /// Recency score.
    pub recency: f64,
    /// Confidence score.
    pub confidence: f64,
}

impl DimensionScores {
    /// Score for one dimension.
    pub fn get(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Coverage => self.coverage,
            Dimension::Consistency => self.consistency,
            Dimension::Depth => self.depth,
            Dimension::Recency => self.recency,
            Dimension::Confidence => self.confidence,
        }
    }
}

fn threshold(thresholds: &Thresholds, dimension: Dimension) -> f64 {
    match dimension {
        Dimension::Coverage => thresholds.coverage,
        Dimension::Consistency => thresholds.consistency,
        Dimension::Depth => thresholds.depth,
        Dimension::Recency => thresholds.recency,
        Dimension::Confidence => thresholds.confidence,
    }
}

/// Multi-dimension pass/fail assessment of a Turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationVerdict {
    /// Per-dimension scores.
    pub scores: DimensionScores,
    /// True when every dimension passes.
    pub passed: bool,
    /// Dimensions below their threshold, in reporting order.
    pub failing: Vec<Dimension>,
    /// Number of active claims evaluated.
    pub active_claims: usize,
    /// Active claims still flagged as conflicting.
    pub unresolved_conflicts: usize,
}

impl EvaluationVerdict {
    /// Whether the given dimension missed its threshold
    pub fn fails_on(&self, dimension: Dimension) -> bool {
        self.failing.contains(&dimension)
    }

    /// One-line description for logs and prompts
    pub fn summary(&self) -> String {
        let scores = Dimension::ALL
            .iter()
            .map(|d| format!("{}={:.2}", d, self.scores.get(*d)))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{} [{}] claims={} conflicts={}",
            if self.passed { "PASS" } else { "FAIL" },
            scores,
            self.active_claims,
            self.unresolved_conflicts
        )
    }
}

/// Scores Turn snapshots against configured thresholds.
#[derive(Debug, Clone)]
pub struct Evaluator {
    thresholds: Thresholds,
    depth_target_support: usize,
    recency_window_days: i64,
}

impl Evaluator {
    /// Create an evaluator from the research settings.
    pub fn new(config: &ResearchConfig) -> Self {
        Self {
            thresholds: config.thresholds,
            depth_target_support: config.depth_target_support.max(1),
            recency_window_days: config.recency_window_days.max(1),
        }
    }

    /// Thresholds in effect.
    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Compute the verdict for a snapshot.
    pub fn evaluate(&self, snapshot: &TurnSnapshot) -> EvaluationVerdict {
        let claims: Vec<&Claim> = snapshot.active_claims().collect();
        let unresolved_conflicts = claims.iter().filter(|c| c.conflict).count();

        let scores = DimensionScores {
            coverage: self.coverage(snapshot, &claims),
            consistency: if claims.is_empty() {
                0.0
            } else {
                1.0 - unresolved_conflicts as f64 / claims.len() as f64
            },
            depth: mean(claims.iter().map(|c| {
                (c.support.len() as f64 / self.depth_target_support as f64).min(1.0)
            })),
            recency: mean(
                claims
                    .iter()
                    .map(|c| self.claim_recency(snapshot, c)),
            ),
            confidence: mean(claims.iter().map(|c| c.confidence)),
        };

        let failing: Vec<Dimension> = Dimension::ALL
            .iter()
            .copied()
            .filter(|d| scores.get(*d) < threshold(&self.thresholds, *d))
            .collect();

        EvaluationVerdict {
            passed: !claims.is_empty() && failing.is_empty(),
            scores,
            failing,
            active_claims: claims.len(),
            unresolved_conflicts,
        }
    }

    /// Plan completion, blended with aspect coverage when steps declare aspects.
    fn coverage(&self, snapshot: &TurnSnapshot, claims: &[&Claim]) -> f64 {
        let completion = snapshot.plan_completion_ratio();

        let mut required: Vec<String> = snapshot
            .steps()
            .flat_map(|s| s.aspects.iter().map(|a| a.trim().to_lowercase()))
            .filter(|a| !a.is_empty())
            .collect();
        required.sort();
        required.dedup();
        if required.is_empty() {
            return completion;
        }

        let covered = required
            .iter()
            .filter(|aspect| {
                claims
                    .iter()
                    .any(|c| c.aspects.iter().any(|a| a.trim().to_lowercase() == **aspect))
            })
            .count();
        (completion + covered as f64 / required.len() as f64) / 2.0
    }

    fn claim_recency(&self, snapshot: &TurnSnapshot, claim: &Claim) -> f64 {
        mean(claim.support.iter().map(|id| {
            snapshot
                .evidence_by_id(id)
                .and_then(|e| e.published.as_deref())
                .and_then(parse_published)
                .map(|date| self.recency_score(date, snapshot.taken_at()))
                .unwrap_or(UNKNOWN_RECENCY)
        }))
    }

    fn recency_score(&self, published: NaiveDate, now: DateTime<Utc>) -> f64 {
        let age_days = (now.date_naive() - published).num_days();
        if age_days <= self.recency_window_days {
            1.0
        } else if age_days <= self.recency_window_days * 2 {
            0.5
        } else {
            0.0
        }
    }
}

/// Parse `YYYY-MM-DD`, `YYYY-MM` or `YYYY`.
pub(crate) fn parse_published(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}-01", raw), "%Y-%m-%d"))
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}-01-01", raw), "%Y-%m-%d"))
        .ok()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
#[path = "evaluator_tests.rs"]
mod evaluator_tests;
