use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ResearchConfig, Thresholds};

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================================
// Status enums
// ============================================================================

/// Lifecycle of a Turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStatus {
    /// Research in progress.
    Active,
    /// Finished normally.
    Complete,
    /// Ended without usable findings or on an integrity violation.
    Failed,
}

impl TurnStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Active => "ACTIVE",
            TurnStatus::Complete => "COMPLETE",
            TurnStatus::Failed => "FAILED",
        }
    }

    /// Whether the Turn has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnStatus::Active)
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TurnStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(TurnStatus::Active),
            "COMPLETE" => Ok(TurnStatus::Complete),
            "FAILED" => Ok(TurnStatus::Failed),
            _ => Err(format!("Unknown turn status: {}", s)),
        }
    }
}

/// Lifecycle of a plan Step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Not started.
    Pending,
    /// Being executed.
    InProgress,
    /// Finished.
    Done,
    /// Abandoned after repeated failures.
    Skipped,
}

impl StepStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::InProgress => "IN_PROGRESS",
            StepStatus::Done => "DONE",
            StepStatus::Skipped => "SKIPPED",
        }
    }

    /// Allowed moves: PENDING -> IN_PROGRESS -> {DONE, SKIPPED}.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::InProgress)
                | (StepStatus::InProgress, StepStatus::Done)
                | (StepStatus::InProgress, StepStatus::Skipped)
        )
    }

    /// Whether the Step still needs work.
    pub fn is_open(&self) -> bool {
        matches!(self, StepStatus::Pending | StepStatus::InProgress)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a piece of evidence came from, and which executor a Step needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceKind {
    /// Knowledge-base retrieval.
    Rag,
    /// Web search.
    Web,
}

impl SourceKind {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Rag => "RAG",
            SourceKind::Web => "WEB",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RAG" => Ok(SourceKind::Rag),
            "WEB" | "WEB_SEARCH" => Ok(SourceKind::Web),
            _ => Err(format!("Unknown source kind: {}", s)),
        }
    }
}

/// Kind of an executed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Planning.
    Plan,
    /// Knowledge-base retrieval.
    Retrieve,
    /// Web search.
    Search,
    /// Conflict resolution.
    ResolveConflict,
    /// Claim synthesis.
    Synthesize,
    /// Final report.
    Output,
}

impl ActionKind {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Plan => "plan",
            ActionKind::Retrieve => "retrieve",
            ActionKind::Search => "search",
            ActionKind::ResolveConflict => "resolve_conflict",
            ActionKind::Synthesize => "synthesize",
            ActionKind::Output => "output",
        }
    }

    /// Retrieval action kind that serves a Step of the given source.
    pub fn for_source(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Rag => ActionKind::Retrieve,
            SourceKind::Web => ActionKind::Search,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of an Action. `Running` until `complete_action` is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// In flight.
    Running,
    /// Completed successfully.
    Ok,
    /// Completed with an error.
    Error,
}

impl ActionStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Running => "RUNNING",
            ActionStatus::Ok => "OK",
            ActionStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Session
// ============================================================================

/// Configuration captured when a Session is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Coverage threshold.
    pub coverage: f64,
    /// Consistency threshold.
    pub consistency: f64,
    /// Depth threshold.
    pub depth: f64,
    /// Recency threshold.
    pub recency: f64,
    /// Confidence threshold.
    pub confidence: f64,
    /// Loop ceiling per Turn.
    pub max_loops_per_turn: u32,
    /// Cost ceiling per Turn.
    pub cost_ceiling: u64,
    /// Failed attempts before a Step is skipped.
    pub retry_limit: u32,
}

impl From<&ResearchConfig> for ConfigSnapshot {
    fn from(config: &ResearchConfig) -> Self {
        let Thresholds {
            coverage,
            consistency,
            depth,
            recency,
            confidence,
        } = config.thresholds;
        Self {
            coverage,
            consistency,
            depth,
            recency,
            confidence,
            max_loops_per_turn: config.max_loops_per_turn,
            cost_ceiling: config.cost_ceiling,
            retry_limit: config.retry_limit,
        }
    }
}

/// One persistent research identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub id: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Turns in creation order.
    pub turn_ids: Vec<String>,
    /// Compressed history of archived turns, one line per turn.
    pub archived_summary: String,
    /// Settings in effect when the session started.
    pub config: ConfigSnapshot,
}

impl Session {
    /// Create a new session
    pub fn new(config: ConfigSnapshot) -> Self {
        Self {
            id: new_id(),
            created_at: Utc::now(),
            turn_ids: Vec::new(),
            archived_summary: String::new(),
            config,
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Input descriptor for one planned Step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// What the Step should establish.
    pub goal: String,
    /// Source to query.
    pub kind: SourceKind,
    /// Seed query.
    pub query: String,
    /// Aspects of the question the Step covers.
    #[serde(default)]
    pub aspects: Vec<String>,
    /// When the Step counts as done.
    #[serde(default)]
    pub done_criteria: String,
    /// Lower runs first.
    #[serde(default)]
    pub priority: u8,
}

impl StepSpec {
    /// Create a step spec with no aspects and default priority
    pub fn new(goal: impl Into<String>, kind: SourceKind, query: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            kind,
            query: query.into(),
            aspects: Vec::new(),
            done_criteria: String::new(),
            priority: 0,
        }
    }

    /// Set the aspects this step should cover
    pub fn with_aspects(mut self, aspects: Vec<String>) -> Self {
        self.aspects = aspects;
        self
    }

    /// Set the priority (lower runs first)
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// One planned unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step identifier.
    pub id: String,
    /// What the Step should establish.
    pub goal: String,
    /// Source to query.
    pub kind: SourceKind,
    /// Seed query.
    pub query: String,
    /// Aspects of the question the Step covers.
    pub aspects: Vec<String>,
    /// When the Step counts as done.
    pub done_criteria: String,
    /// Lower runs first.
    pub priority: u8,
    /// Current status.
    pub status: StepStatus,
}

/// Append-only record of a plan modification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRevision {
    /// Revised Step, if any.
    pub step_id: Option<String>,
    /// Status before the revision.
    pub from: Option<StepStatus>,
    /// Status after the revision.
    pub to: Option<StepStatus>,
    /// Why the plan changed.
    pub reason: String,
    /// When the revision happened.
    pub at: DateTime<Utc>,
}

/// Ordered decomposition of a Turn's query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier.
    pub id: String,
    /// Owning Turn.
    pub turn_id: String,
    /// Steps in execution order.
    pub steps: Vec<Step>,
    /// Revision log.
    pub revisions: Vec<PlanRevision>,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub(crate) fn new(turn_id: &str, specs: Vec<StepSpec>) -> Self {
        let plan_id = new_id();
        let created_at = Utc::now();
        let steps = specs
            .into_iter()
            .map(|spec| Step {
                id: new_id(),
                goal: spec.goal,
                kind: spec.kind,
                query: spec.query,
                aspects: spec.aspects,
                done_criteria: spec.done_criteria,
                priority: spec.priority,
                status: StepStatus::Pending,
            })
            .collect::<Vec<_>>();
        let revisions = vec![PlanRevision {
            step_id: None,
            from: None,
            to: None,
            reason: format!("plan created with {} steps", steps.len()),
            at: created_at,
        }];
        Self {
            id: plan_id,
            turn_id: turn_id.to_string(),
            steps,
            revisions,
            created_at,
        }
    }

    /// Fraction of steps that reached DONE, zero for an empty plan.
    pub fn completion_ratio(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .count();
        done as f64 / self.steps.len() as f64
    }
}

// ============================================================================
// Action
// ============================================================================

/// Resources consumed by one Action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    /// Collaborator calls made.
    pub calls: u64,
    /// Tokens consumed.
    pub tokens: u64,
    /// Wall-clock time in milliseconds.
    pub elapsed_ms: u64,
}

impl Cost {
    /// Cost of a single collaborator call
    pub fn call(tokens: u64, elapsed_ms: u64) -> Self {
        Self {
            calls: 1,
            tokens,
            elapsed_ms,
        }
    }

    /// Accumulate another cost into this one
    pub fn add(&mut self, other: Cost) {
        self.calls += other.calls;
        self.tokens += other.tokens;
        self.elapsed_ms += other.elapsed_ms;
    }
}

/// One executed operation; the audit trail of a Turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Action identifier.
    pub id: String,
    /// Owning Turn.
    pub turn_id: String,
    /// Step the Action serves, if any.
    pub step_id: Option<String>,
    /// What the Action does.
    pub kind: ActionKind,
    /// Input payload.
    pub input: serde_json::Value,
    /// Result payload, set on completion.
    pub result: Option<serde_json::Value>,
    /// Resources consumed.
    pub cost: Cost,
    /// Current status.
    pub status: ActionStatus,
    /// When the Action started.
    pub started_at: DateTime<Utc>,
    /// When the Action completed.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Reference to a recorded, not yet completed Action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionHandle {
    /// Owning Turn.
    pub turn_id: String,
    /// Action identifier.
    pub action_id: String,
    /// Step the Action serves, if any.
    pub step_id: Option<String>,
    /// What the Action does.
    pub kind: ActionKind,
}

// ============================================================================
// Evidence and Claims
// ============================================================================

/// Input for a new piece of evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvidence {
    /// Where the evidence came from.
    pub source: SourceKind,
    /// URL or knowledge-base reference.
    pub locator: String,
    /// Excerpt text.
    pub content: String,
    /// Source confidence (0.0-1.0).
    pub confidence: f64,
    /// Publication date as `YYYY-MM` or `YYYY-MM-DD`.
    pub published: Option<String>,
    /// Action that gathered the evidence.
    pub action_id: Option<String>,
}

/// An atomic, immutable piece of retrieved information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Evidence identifier, e.g. "RAG_1".
    pub id: String,
    /// Owning Turn.
    pub turn_id: String,
    /// Where the evidence came from.
    pub source: SourceKind,
    /// URL or knowledge-base reference.
    pub locator: String,
    /// Excerpt text.
    pub content: String,
    /// Source confidence (0.0-1.0).
    pub confidence: f64,
    /// Publication date, when known.
    pub published: Option<String>,
    /// Action that gathered the evidence.
    pub action_id: Option<String>,
    /// When the evidence was stored.
    pub created_at: DateTime<Utc>,
}

/// Input for a new claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewClaim {
    /// Claim text.
    pub statement: String,
    /// Supporting evidence ids.
    pub support: Vec<String>,
    /// Confidence (0.0-1.0).
    pub confidence: f64,
    /// Aspects the claim addresses.
    pub aspects: Vec<String>,
    /// Starts flagged as conflicting.
    pub conflict: bool,
    /// Action that produced the claim.
    pub action_id: Option<String>,
}

impl NewClaim {
    /// Create a claim input; confidence is clamped to [0, 1]
    pub fn new(statement: impl Into<String>, support: Vec<String>, confidence: f64) -> Self {
        Self {
            statement: statement.into(),
            support,
            confidence: confidence.clamp(0.0, 1.0),
            aspects: Vec::new(),
            conflict: false,
            action_id: None,
        }
    }

    /// Set the aspects the claim addresses
    pub fn with_aspects(mut self, aspects: Vec<String>) -> Self {
        self.aspects = aspects;
        self
    }

    /// Mark the claim as conflicting with another claim
    pub fn with_conflict(mut self, conflict: bool) -> Self {
        self.conflict = conflict;
        self
    }

    /// Set the originating action
    pub fn with_action(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }
}

/// A structured assertion derived from evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Claim identifier.
    pub id: String,
    /// Owning Turn.
    pub turn_id: String,
    /// Claim text.
    pub statement: String,
    /// Supporting evidence ids.
    pub support: Vec<String>,
    /// Confidence (0.0-1.0).
    pub confidence: f64,
    /// Aspects the claim addresses.
    pub aspects: Vec<String>,
    /// Flagged as conflicting with another claim.
    pub conflict: bool,
    /// Action that produced the claim.
    pub action_id: Option<String>,
    /// Claim this one replaced.
    pub supersedes: Option<String>,
    /// Claim that replaced this one.
    pub superseded_by: Option<String>,
    /// Retired without a successor.
    pub retracted: bool,
    /// When the claim was stored.
    pub created_at: DateTime<Utc>,
}

impl Claim {
    /// Neither superseded nor retracted.
    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none() && !self.retracted
    }

    /// Active and still flagged as conflicting.
    pub fn is_unresolved_conflict(&self) -> bool {
        self.is_active() && self.conflict
    }
}

// ============================================================================
// Turn
// ============================================================================

/// One user question cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Turn identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// The user's question.
    pub query: String,
    /// Plans in creation order.
    pub plans: Vec<Plan>,
    /// Evidence gathered.
    pub evidence: Vec<Evidence>,
    /// Claims, including superseded and retracted ones.
    pub claims: Vec<Claim>,
    /// Actions in execution order.
    pub actions: Vec<Action>,
    /// Final report.
    pub report: Option<String>,
    /// Current status.
    pub status: TurnStatus,
    /// Human-readable reason the loop stopped.
    pub termination_cause: Option<String>,
    /// Rollup produced by `archive_turn`.
    pub summary: Option<String>,
    /// When the Turn started.
    pub created_at: DateTime<Utc>,
    /// When the Turn finished.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Turn {
    pub(crate) fn new(session_id: &str, query: &str) -> Self {
        Self {
            id: new_id(),
            session_id: session_id.to_string(),
            query: query.to_string(),
            plans: Vec::new(),
            evidence: Vec::new(),
            claims: Vec::new(),
            actions: Vec::new(),
            report: None,
            status: TurnStatus::Active,
            termination_cause: None,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Terminal state applied by `finish_turn`.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Terminal status.
    pub status: TurnStatus,
    /// Final report.
    pub report: String,
    /// Why the Turn ended.
    pub cause: String,
}

/// Condensed view of an earlier Turn for prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorTurn {
    /// The earlier question.
    pub query: String,
    /// Its strongest active claims.
    pub key_claims: Vec<String>,
}

/// One entry of a Turn's claim lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLineage {
    /// Claim identifier.
    pub claim_id: String,
    /// Claim this one replaced.
    pub supersedes: Option<String>,
    /// Claim that replaced this one.
    pub superseded_by: Option<String>,
    /// Retired without a successor.
    pub retracted: bool,
}

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;
