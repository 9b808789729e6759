use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{
    Action, ActionKind, ActionStatus, Claim, ClaimLineage, Cost, Evidence, SourceKind, Step,
    StepStatus, Turn, TurnStatus,
};

/// Immutable point-in-time view of a Turn.
///
/// Cloning is cheap; the underlying Turn is shared.
#[derive(Debug, Clone)]
pub struct TurnSnapshot {
    turn: Arc<Turn>,
    taken_at: DateTime<Utc>,
}

impl TurnSnapshot {
    /// Wrap a copy of a Turn
    pub fn new(turn: Turn, taken_at: DateTime<Utc>) -> Self {
        Self {
            turn: Arc::new(turn),
            taken_at,
        }
    }

    /// The captured Turn
    pub fn turn(&self) -> &Turn {
        &self.turn
    }

    /// When the snapshot was taken; the evaluator's reference time
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// Turn identifier.
    pub fn id(&self) -> &str {
        &self.turn.id
    }

    /// The Turn's question.
    pub fn query(&self) -> &str {
        &self.turn.query
    }

    /// Turn status.
    pub fn status(&self) -> TurnStatus {
        self.turn.status
    }

    /// All claims, including superseded and retracted ones.
    pub fn claims(&self) -> &[Claim] {
        &self.turn.claims
    }

    /// All evidence.
    pub fn evidence(&self) -> &[Evidence] {
        &self.turn.evidence
    }

    /// Actions in execution order.
    pub fn actions(&self) -> &[Action] {
        &self.turn.actions
    }

    /// Claims that are neither superseded nor retracted
    pub fn active_claims(&self) -> impl Iterator<Item = &Claim> {
        self.turn.claims.iter().filter(|c| c.is_active())
    }

    /// Active claims still flagged as conflicting
    pub fn unresolved_conflicts(&self) -> Vec<&Claim> {
        self.turn
            .claims
            .iter()
            .filter(|c| c.is_unresolved_conflict())
            .collect()
    }

    /// Claim by id.
    pub fn claim(&self, id: &str) -> Option<&Claim> {
        self.turn.claims.iter().find(|c| c.id == id)
    }

    /// Evidence by id.
    pub fn evidence_by_id(&self, id: &str) -> Option<&Evidence> {
        self.turn.evidence.iter().find(|e| e.id == id)
    }

    /// Steps of every plan, in plan order
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.turn.plans.iter().flat_map(|p| p.steps.iter())
    }

    /// Step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps().find(|s| s.id == id)
    }

    /// DONE steps over all steps; zero before planning
    pub fn plan_completion_ratio(&self) -> f64 {
        let total = self.steps().count();
        if total == 0 {
            return 0.0;
        }
        let done = self.steps().filter(|s| s.status == StepStatus::Done).count();
        done as f64 / total as f64
    }

    /// Every step was skipped (and at least one exists)
    pub fn all_steps_skipped(&self) -> bool {
        let mut steps = self.steps().peekable();
        steps.peek().is_some() && steps.all(|s| s.status == StepStatus::Skipped)
    }

    /// Cumulative cost over all recorded actions
    pub fn total_cost(&self) -> Cost {
        let mut total = Cost::default();
        for action in &self.turn.actions {
            total.add(action.cost);
        }
        total
    }

    /// Failed actions attributed to a step
    pub fn failed_attempts(&self, step_id: &str) -> u32 {
        self.turn
            .actions
            .iter()
            .filter(|a| a.step_id.as_deref() == Some(step_id) && a.status == ActionStatus::Error)
            .count() as u32
    }

    /// Failed conflict resolutions since the last successful one
    pub fn consecutive_conflict_failures(&self) -> u32 {
        self.turn
            .actions
            .iter()
            .rev()
            .filter(|a| a.kind == ActionKind::ResolveConflict)
            .take_while(|a| a.status == ActionStatus::Error)
            .count() as u32
    }

    /// Evidence id to source locator, for citation rendering
    pub fn evidence_locators(&self) -> BTreeMap<String, String> {
        self.turn
            .evidence
            .iter()
            .map(|e| (e.id.clone(), e.locator.clone()))
            .collect()
    }

    /// Reduced view consumed by the decision policy
    pub fn plan_snapshot(&self, retry_limit: u32) -> PlanSnapshot {
        PlanSnapshot {
            steps: self
                .steps()
                .map(|s| StepView {
                    id: s.id.clone(),
                    kind: s.kind,
                    status: s.status,
                })
                .collect(),
            conflict_attempts_remaining: retry_limit
                .saturating_sub(self.consecutive_conflict_failures()),
        }
    }

    /// Claim lineage in creation order
    pub fn lineage(&self) -> Vec<ClaimLineage> {
        self.turn
            .claims
            .iter()
            .map(|c| ClaimLineage {
                claim_id: c.id.clone(),
                supersedes: c.supersedes.clone(),
                superseded_by: c.superseded_by.clone(),
                retracted: c.retracted,
            })
            .collect()
    }
}

/// Step state as seen by the decision policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepView {
    /// Step identifier.
    pub id: String,
    /// Source the Step draws on.
    pub kind: SourceKind,
    /// Current status.
    pub status: StepStatus,
}

/// Plan state as seen by the decision policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlanSnapshot {
    /// Steps in plan order.
    pub steps: Vec<StepView>,
    /// Conflict resolution attempts left before conflicts are left as-is.
    pub conflict_attempts_remaining: u32,
}

impl PlanSnapshot {
    /// First step that is still PENDING or IN_PROGRESS
    pub fn next_open_step(&self) -> Option<&StepView> {
        self.steps.iter().find(|s| s.status.is_open())
    }
}

/// Claim lineage changes made by one Action, stored in its result payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageDelta {
    /// Claims inserted, in insertion order.
    #[serde(default)]
    pub created: Vec<String>,
    /// `(old, new)` pairs.
    #[serde(default)]
    pub superseded: Vec<(String, String)>,
    /// Claims retracted.
    #[serde(default)]
    pub retracted: Vec<String>,
}

impl LineageDelta {
    /// True when the Action changed no claims.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.superseded.is_empty() && self.retracted.is_empty()
    }

    /// Key under which the delta is stored in an Action result
    pub const RESULT_KEY: &'static str = "lineage";
}

/// Rebuild claim lineage from a Turn's action log.
pub fn replay_lineage(actions: &[Action]) -> Vec<ClaimLineage> {
    let mut lineage: Vec<ClaimLineage> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for action in actions {
        let Some(delta) = action
            .result
            .as_ref()
            .and_then(|r| r.get(LineageDelta::RESULT_KEY))
            .and_then(|v| serde_json::from_value::<LineageDelta>(v.clone()).ok())
        else {
            continue;
        };

        for id in delta.created {
            index.insert(id.clone(), lineage.len());
            lineage.push(ClaimLineage {
                claim_id: id,
                supersedes: None,
                superseded_by: None,
                retracted: false,
            });
        }
        for (old, new) in delta.superseded {
            if let Some(&i) = index.get(&old) {
                lineage[i].superseded_by = Some(new.clone());
            }
            if let Some(&i) = index.get(&new) {
                lineage[i].supersedes = Some(old);
            }
        }
        for id in delta.retracted {
            if let Some(&i) = index.get(&id) {
                lineage[i].retracted = true;
            }
        }
    }

    lineage
}
