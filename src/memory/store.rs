use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::snapshot::TurnSnapshot;
use super::types::{
    Action, ActionHandle, ActionKind, ActionStatus, Claim, ConfigSnapshot, Cost, Evidence,
    NewClaim, NewEvidence, Plan, PlanRevision, PriorTurn, Session, StepSpec, StepStatus, Turn,
    TurnOutcome, TurnStatus,
};
use crate::error::{ResearchError, ResearchResult};
use crate::observability::{ChangeKind, EntityType, EventBus, MemoryEvent};

/// Minimum confidence for a claim to appear in an archive rollup.
const ROLLUP_MIN_CONFIDENCE: f64 = 0.7;
/// Maximum claims in an archive rollup.
const ROLLUP_MAX_CLAIMS: usize = 5;
/// Claims per prior turn offered as context.
const CONTEXT_CLAIMS_PER_TURN: usize = 3;

/// Holds all research state, one lock per Turn.
///
/// Every mutator takes the owning Turn's lock for its whole duration, so a
/// snapshot never observes a half-applied change. Turns of different
/// sessions never contend.
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    turns: RwLock<HashMap<String, Arc<Mutex<Turn>>>>,
    /// Claim id to owning turn id.
    claim_index: RwLock<HashMap<String, String>>,
    events: EventBus,
    max_evidence: usize,
}

impl MemoryStore {
    /// Create an empty store publishing to the given bus
    pub fn new(events: EventBus, max_evidence: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            turns: RwLock::new(HashMap::new()),
            claim_index: RwLock::new(HashMap::new()),
            events,
            max_evidence,
        }
    }

    /// The event bus mutations are published to
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Evidence cap per Turn
    pub fn max_evidence(&self) -> usize {
        self.max_evidence
    }

    fn emit(&self, turn_id: &str, entity_type: EntityType, entity_id: &str, change: ChangeKind) {
        self.events
            .publish(MemoryEvent::new(turn_id, entity_type, entity_id, change));
    }

    async fn session_handle(&self, session_id: &str) -> ResearchResult<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ResearchError::not_found("Session", session_id))
    }

    async fn turn_handle(&self, turn_id: &str) -> ResearchResult<Arc<Mutex<Turn>>> {
        self.turns
            .read()
            .await
            .get(turn_id)
            .cloned()
            .ok_or_else(|| ResearchError::not_found("Turn", turn_id))
    }

    async fn claim_turn(&self, claim_id: &str) -> ResearchResult<String> {
        self.claim_index
            .read()
            .await
            .get(claim_id)
            .cloned()
            .ok_or_else(|| ResearchError::not_found("Claim", claim_id))
    }

    // ========================================================================
    // Session and Turn lifecycle
    // ========================================================================

    /// Create a new session
    pub async fn create_session(&self, config: ConfigSnapshot) -> Session {
        let session = Session::new(config);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(session.clone())));
        self.emit("", EntityType::Session, &session.id, ChangeKind::Created);
        info!(session_id = %session.id, "Session created");
        session
    }

    /// Get a copy of a session
    pub async fn get_session(&self, session_id: &str) -> ResearchResult<Session> {
        let handle = self.session_handle(session_id).await?;
        let session = handle.lock().await;
        Ok(session.clone())
    }

    /// Load an archived session and its finished turns back into the store.
    ///
    /// Restored turns are read-only history: they feed `previous_context`
    /// and the archived summary but accept no further mutation.
    pub async fn restore_session(&self, session: Session, turns: Vec<Turn>) -> ResearchResult<()> {
        if self.sessions.read().await.contains_key(&session.id) {
            return Err(ResearchError::invalid_state(
                "Session",
                &session.id,
                "session is already loaded",
            ));
        }
        if let Some(open) = turns
            .iter()
            .find(|t| t.session_id != session.id || !t.status.is_terminal())
        {
            return Err(ResearchError::invalid_state(
                "Turn",
                &open.id,
                "only finished turns of the session can be restored",
            ));
        }

        {
            let mut index = self.claim_index.write().await;
            for turn in &turns {
                for claim in &turn.claims {
                    index.insert(claim.id.clone(), turn.id.clone());
                }
            }
        }
        {
            let mut map = self.turns.write().await;
            for turn in turns {
                map.insert(turn.id.clone(), Arc::new(Mutex::new(turn)));
            }
        }

        info!(session_id = %session.id, turns = session.turn_ids.len(), "Session restored");
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// Open a new Turn; fails while another Turn of the session is active
    pub async fn start_turn(&self, session_id: &str, query: &str) -> ResearchResult<Turn> {
        let handle = self.session_handle(session_id).await?;
        let mut session = handle.lock().await;

        if let Some(last_id) = session.turn_ids.last() {
            let last = self.turn_handle(last_id).await?;
            let last = last.lock().await;
            if last.status == TurnStatus::Active {
                return Err(ResearchError::invalid_state(
                    "Session",
                    session_id,
                    format!("turn {} is still active", last.id),
                ));
            }
        }

        let turn = Turn::new(session_id, query);
        self.turns
            .write()
            .await
            .insert(turn.id.clone(), Arc::new(Mutex::new(turn.clone())));
        session.turn_ids.push(turn.id.clone());

        self.emit(&turn.id, EntityType::Turn, &turn.id, ChangeKind::Created);
        info!(session_id = %session_id, turn_id = %turn.id, "Turn started");
        Ok(turn)
    }

    /// Move an active Turn to its terminal state
    pub async fn finish_turn(&self, turn_id: &str, outcome: TurnOutcome) -> ResearchResult<()> {
        let handle = self.turn_handle(turn_id).await?;
        let mut turn = handle.lock().await;
        ensure_active(&turn)?;

        if !outcome.status.is_terminal() {
            return Err(ResearchError::invalid_state(
                "Turn",
                turn_id,
                "a turn can only finish as COMPLETE or FAILED",
            ));
        }
        if let Some(running) = turn
            .actions
            .iter()
            .find(|a| a.status == ActionStatus::Running)
        {
            return Err(ResearchError::invalid_state(
                "Turn",
                turn_id,
                format!("action {} is still running", running.id),
            ));
        }

        turn.status = outcome.status;
        turn.report = Some(outcome.report);
        turn.termination_cause = Some(outcome.cause);
        turn.completed_at = Some(Utc::now());

        self.emit(turn_id, EntityType::Turn, turn_id, ChangeKind::Completed);
        Ok(())
    }

    /// Roll a terminal Turn up into its session's archived summary.
    ///
    /// Repeated calls return the same summary without appending again.
    pub async fn archive_turn(&self, turn_id: &str) -> ResearchResult<String> {
        let (session_id, query, summary) = {
            let handle = self.turn_handle(turn_id).await?;
            let mut turn = handle.lock().await;
            if !turn.status.is_terminal() {
                return Err(ResearchError::invalid_state(
                    "Turn",
                    turn_id,
                    "only a finished turn can be archived",
                ));
            }
            if let Some(existing) = &turn.summary {
                return Ok(existing.clone());
            }
            let summary = rollup_summary(&turn.claims);
            turn.summary = Some(summary.clone());
            (turn.session_id.clone(), turn.query.clone(), summary)
        };

        let handle = self.session_handle(&session_id).await?;
        let mut session = handle.lock().await;
        if !session.archived_summary.is_empty() {
            session.archived_summary.push('\n');
        }
        session
            .archived_summary
            .push_str(&format!("[{}] {}", query, summary));

        self.emit(turn_id, EntityType::Turn, turn_id, ChangeKind::Archived);
        debug!(turn_id = %turn_id, summary = %summary, "Turn archived");
        Ok(summary)
    }

    /// Immutable point-in-time view of a Turn
    pub async fn snapshot(&self, turn_id: &str) -> ResearchResult<TurnSnapshot> {
        let handle = self.turn_handle(turn_id).await?;
        let turn = handle.lock().await;
        Ok(TurnSnapshot::new(turn.clone(), Utc::now()))
    }

    /// Queries and strongest claims of the most recent finished turns
    pub async fn previous_context(
        &self,
        session_id: &str,
        limit: usize,
    ) -> ResearchResult<Vec<PriorTurn>> {
        let turn_ids = self.get_session(session_id).await?.turn_ids;
        let mut prior = Vec::new();

        for turn_id in turn_ids.iter().rev() {
            if prior.len() >= limit {
                break;
            }
            let handle = self.turn_handle(turn_id).await?;
            let turn = handle.lock().await;
            if !turn.status.is_terminal() {
                continue;
            }
            let mut claims: Vec<&Claim> = turn.claims.iter().filter(|c| c.is_active()).collect();
            claims.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            prior.push(PriorTurn {
                query: turn.query.clone(),
                key_claims: claims
                    .into_iter()
                    .take(CONTEXT_CLAIMS_PER_TURN)
                    .map(|c| c.statement.clone())
                    .collect(),
            });
        }

        prior.reverse();
        Ok(prior)
    }

    // ========================================================================
    // Plans
    // ========================================================================

    /// Attach a new Plan to a Turn; returns the plan id
    pub async fn append_plan(&self, turn_id: &str, steps: Vec<StepSpec>) -> ResearchResult<String> {
        if steps.is_empty() {
            return Err(ResearchError::invalid_state(
                "Turn",
                turn_id,
                "a plan needs at least one step",
            ));
        }

        let handle = self.turn_handle(turn_id).await?;
        let mut turn = handle.lock().await;
        ensure_active(&turn)?;

        let plan = Plan::new(turn_id, steps);
        let plan_id = plan.id.clone();
        let step_count = plan.steps.len();
        turn.plans.push(plan);

        self.emit(turn_id, EntityType::Plan, &plan_id, ChangeKind::Created);
        info!(turn_id = %turn_id, plan_id = %plan_id, steps = step_count, "Plan appended");
        Ok(plan_id)
    }

    /// Move a Step along PENDING -> IN_PROGRESS -> {DONE, SKIPPED}, logging the revision
    pub async fn revise_step(
        &self,
        turn_id: &str,
        step_id: &str,
        to: StepStatus,
        reason: &str,
    ) -> ResearchResult<()> {
        let handle = self.turn_handle(turn_id).await?;
        let mut turn = handle.lock().await;
        ensure_active(&turn)?;

        let plan = turn
            .plans
            .iter_mut()
            .find(|p| p.steps.iter().any(|s| s.id == step_id))
            .ok_or_else(|| ResearchError::not_found("Step", step_id))?;
        let step = plan
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| ResearchError::not_found("Step", step_id))?;

        let from = step.status;
        if !from.can_transition_to(to) {
            return Err(ResearchError::invalid_state(
                "Step",
                step_id,
                format!("cannot move from {} to {}", from, to),
            ));
        }
        step.status = to;
        plan.revisions.push(PlanRevision {
            step_id: Some(step_id.to_string()),
            from: Some(from),
            to: Some(to),
            reason: reason.to_string(),
            at: Utc::now(),
        });

        self.emit(turn_id, EntityType::Step, step_id, ChangeKind::Updated);
        Ok(())
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Open an Action; only one may run per Turn at a time
    pub async fn record_action(
        &self,
        turn_id: &str,
        step_id: Option<&str>,
        kind: ActionKind,
        input: serde_json::Value,
    ) -> ResearchResult<ActionHandle> {
        let handle = self.turn_handle(turn_id).await?;
        let mut turn = handle.lock().await;
        ensure_active(&turn)?;

        if let Some(step_id) = step_id {
            if !turn
                .plans
                .iter()
                .any(|p| p.steps.iter().any(|s| s.id == step_id))
            {
                return Err(ResearchError::not_found("Step", step_id));
            }
        }
        if let Some(running) = turn
            .actions
            .iter()
            .find(|a| a.status == ActionStatus::Running)
        {
            return Err(ResearchError::invalid_state(
                "Action",
                &running.id,
                "another action is still running in this turn",
            ));
        }

        let action = Action {
            id: uuid::Uuid::new_v4().to_string(),
            turn_id: turn_id.to_string(),
            step_id: step_id.map(str::to_string),
            kind,
            input,
            result: None,
            cost: Cost::default(),
            status: ActionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
        };
        let action_handle = ActionHandle {
            turn_id: turn_id.to_string(),
            action_id: action.id.clone(),
            step_id: action.step_id.clone(),
            kind,
        };
        turn.actions.push(action);

        self.emit(turn_id, EntityType::Action, &action_handle.action_id, ChangeKind::Created);
        Ok(action_handle)
    }

    /// Close a running Action. Completed actions are never modified again.
    pub async fn complete_action(
        &self,
        handle: &ActionHandle,
        result: serde_json::Value,
        cost: Cost,
        status: ActionStatus,
    ) -> ResearchResult<()> {
        if status == ActionStatus::Running {
            return Err(ResearchError::invalid_state(
                "Action",
                &handle.action_id,
                "completion status must be OK or ERROR",
            ));
        }

        let turn_handle = self.turn_handle(&handle.turn_id).await?;
        let mut turn = turn_handle.lock().await;
        let action = turn
            .actions
            .iter_mut()
            .find(|a| a.id == handle.action_id)
            .ok_or_else(|| ResearchError::not_found("Action", &handle.action_id))?;

        if action.status != ActionStatus::Running {
            return Err(ResearchError::invalid_state(
                "Action",
                &handle.action_id,
                format!("already completed with status {}", action.status),
            ));
        }

        action.result = Some(result);
        action.cost = cost;
        action.status = status;
        action.completed_at = Some(Utc::now());

        if status == ActionStatus::Error {
            warn!(
                turn_id = %handle.turn_id,
                action_id = %handle.action_id,
                kind = %handle.kind,
                "Action completed with error"
            );
        }
        self.emit(&handle.turn_id, EntityType::Action, &handle.action_id, ChangeKind::Completed);
        Ok(())
    }

    // ========================================================================
    // Evidence and Claims
    // ========================================================================

    /// Store evidence; a duplicate (same locator and content) returns the existing id
    pub async fn add_evidence(&self, turn_id: &str, evidence: NewEvidence) -> ResearchResult<String> {
        let handle = self.turn_handle(turn_id).await?;
        let mut turn = handle.lock().await;
        ensure_active(&turn)?;

        if let Some(existing) = turn
            .evidence
            .iter()
            .find(|e| e.locator == evidence.locator && e.content == evidence.content)
        {
            debug!(turn_id = %turn_id, evidence_id = %existing.id, "Duplicate evidence ignored");
            return Ok(existing.id.clone());
        }
        if turn.evidence.len() >= self.max_evidence {
            return Err(ResearchError::invalid_state(
                "Turn",
                turn_id,
                format!("evidence limit of {} reached", self.max_evidence),
            ));
        }
        if let Some(action_id) = &evidence.action_id {
            ensure_action_exists(&turn, action_id)?;
        }

        let id = format!("{}_{}", evidence.source, turn.evidence.len() + 1);
        turn.evidence.push(Evidence {
            id: id.clone(),
            turn_id: turn_id.to_string(),
            source: evidence.source,
            locator: evidence.locator,
            content: evidence.content,
            confidence: evidence.confidence.clamp(0.0, 1.0),
            published: evidence.published,
            action_id: evidence.action_id,
            created_at: Utc::now(),
        });

        self.emit(turn_id, EntityType::Evidence, &id, ChangeKind::Created);
        Ok(id)
    }

    /// Store a claim backed by evidence of the same Turn.
    ///
    /// An identical active statement returns the existing claim id.
    pub async fn add_claim(&self, turn_id: &str, claim: NewClaim) -> ResearchResult<String> {
        let handle = self.turn_handle(turn_id).await?;
        let mut turn = handle.lock().await;
        ensure_active(&turn)?;
        validate_claim(&turn, &claim)?;

        let normalized = claim.statement.trim().to_lowercase();
        if let Some(existing) = turn
            .claims
            .iter()
            .find(|c| c.is_active() && c.statement.trim().to_lowercase() == normalized)
        {
            return Ok(existing.id.clone());
        }

        let id = self.insert_claim(&mut turn, claim, None).await;
        self.emit(turn_id, EntityType::Claim, &id, ChangeKind::Created);
        Ok(id)
    }

    /// Replace an active claim with a successor; the old claim is kept and linked
    pub async fn supersede_claim(&self, old_id: &str, new_claim: NewClaim) -> ResearchResult<String> {
        let turn_id = self.claim_turn(old_id).await?;
        let handle = self.turn_handle(&turn_id).await?;
        let mut turn = handle.lock().await;
        ensure_active(&turn)?;
        validate_claim(&turn, &new_claim)?;

        let old_index = active_claim_index(&turn, old_id)?;
        let new_id = self
            .insert_claim(&mut turn, new_claim, Some(old_id.to_string()))
            .await;
        turn.claims[old_index].superseded_by = Some(new_id.clone());

        self.emit(&turn_id, EntityType::Claim, &new_id, ChangeKind::Created);
        self.emit(&turn_id, EntityType::Claim, old_id, ChangeKind::Superseded);
        Ok(new_id)
    }

    /// Retire an active claim without a successor
    pub async fn retract_claim(&self, claim_id: &str) -> ResearchResult<()> {
        let turn_id = self.claim_turn(claim_id).await?;
        let handle = self.turn_handle(&turn_id).await?;
        let mut turn = handle.lock().await;
        ensure_active(&turn)?;

        let index = active_claim_index(&turn, claim_id)?;
        turn.claims[index].retracted = true;

        self.emit(&turn_id, EntityType::Claim, claim_id, ChangeKind::Retracted);
        Ok(())
    }

    /// Flag active claims of a Turn as mutually conflicting
    pub async fn flag_conflict(&self, turn_id: &str, claim_ids: &[String]) -> ResearchResult<()> {
        let handle = self.turn_handle(turn_id).await?;
        let mut turn = handle.lock().await;
        ensure_active(&turn)?;

        let indices = claim_ids
            .iter()
            .map(|id| active_claim_index(&turn, id))
            .collect::<ResearchResult<Vec<_>>>()?;
        for index in indices {
            if !turn.claims[index].conflict {
                turn.claims[index].conflict = true;
                let id = turn.claims[index].id.clone();
                self.emit(turn_id, EntityType::Claim, &id, ChangeKind::Updated);
            }
        }
        Ok(())
    }

    async fn insert_claim(&self, turn: &mut Turn, claim: NewClaim, supersedes: Option<String>) -> String {
        // Claim ids are indexed store-wide, evidence ids only per turn
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("c{}-{}", turn.claims.len() + 1, &suffix[..8]);
        turn.claims.push(Claim {
            id: id.clone(),
            turn_id: turn.id.clone(),
            statement: claim.statement,
            support: dedup_preserving_order(claim.support),
            confidence: claim.confidence.clamp(0.0, 1.0),
            aspects: claim.aspects,
            conflict: claim.conflict,
            action_id: claim.action_id,
            supersedes,
            superseded_by: None,
            retracted: false,
            created_at: Utc::now(),
        });
        self.claim_index
            .write()
            .await
            .insert(id.clone(), turn.id.clone());
        id
    }
}

fn ensure_active(turn: &Turn) -> ResearchResult<()> {
    if turn.status != TurnStatus::Active {
        return Err(ResearchError::invalid_state(
            "Turn",
            &turn.id,
            format!("turn is {}", turn.status),
        ));
    }
    Ok(())
}

fn ensure_action_exists(turn: &Turn, action_id: &str) -> ResearchResult<()> {
    if turn.actions.iter().any(|a| a.id == action_id) {
        Ok(())
    } else {
        Err(ResearchError::not_found("Action", action_id))
    }
}

fn validate_claim(turn: &Turn, claim: &NewClaim) -> ResearchResult<()> {
    if claim.support.is_empty() {
        return Err(ResearchError::invalid_state(
            "Claim",
            claim.statement.chars().take(40).collect::<String>(),
            "a claim needs at least one supporting evidence id",
        ));
    }
    if let Some(missing) = claim
        .support
        .iter()
        .find(|id| !turn.evidence.iter().any(|e| &e.id == *id))
    {
        return Err(ResearchError::not_found("Evidence", missing.as_str()));
    }
    if let Some(action_id) = &claim.action_id {
        ensure_action_exists(turn, action_id)?;
    }
    Ok(())
}

fn active_claim_index(turn: &Turn, claim_id: &str) -> ResearchResult<usize> {
    let index = turn
        .claims
        .iter()
        .position(|c| c.id == claim_id)
        .ok_or_else(|| ResearchError::not_found("Claim", claim_id))?;
    if !turn.claims[index].is_active() {
        return Err(ResearchError::invalid_state(
            "Claim",
            claim_id,
            "claim is already superseded or retracted",
        ));
    }
    Ok(index)
}

fn dedup_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// `"Key findings: a; b"` from the strongest active claims.
fn rollup_summary(claims: &[Claim]) -> String {
    let mut strong: Vec<&Claim> = claims
        .iter()
        .filter(|c| c.is_active() && c.confidence >= ROLLUP_MIN_CONFIDENCE)
        .collect();
    strong.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    if strong.is_empty() {
        return "No high-confidence findings".to_string();
    }
    let findings = strong
        .iter()
        .take(ROLLUP_MAX_CLAIMS)
        .map(|c| c.statement.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    format!("Key findings: {}", findings)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod store_tests;
