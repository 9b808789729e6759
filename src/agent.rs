//! Loop controller: drives one Turn from planning to report.
//!
//! ```text
//! plan -> { evaluate -> decide -> execute -> synthesize }* -> terminate -> final synthesis -> output
//! ```
//!
//! Two bounds are enforced independently of the decision policy's inputs:
//! loop iterations per Turn and collaborator calls per Turn. The budget is
//! checked before every collaborator-calling Action, so the recorded cost
//! can exceed the ceiling by at most one Action.
//!
//! Collaborator failures are recorded on their Action and retried on the
//! next iteration; a Step whose failed attempts reach the retry limit is
//! SKIPPED. Integrity violations (unknown ids, illegal transitions) end the
//! Turn as FAILED.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ResearchConfig;
use crate::error::{AppError, AppResult, ResearchError, ResearchResult};
use crate::evaluator::{Dimension, EvaluationVerdict, Evaluator};
use crate::executors::{
    final_synthesis, render_local_report, FinalSynthesis, OutputExecutor, ResolveExecutor,
    RetrieveExecutor, SearchExecutor, SynthesizeExecutor,
};
use crate::llm::ReasoningBackend;
use crate::memory::{
    ActionHandle, ActionKind, ActionStatus, ConfigSnapshot, Cost, MemoryStore, PriorTurn, Session,
    SourceKind, StepStatus, Turn, TurnOutcome, TurnSnapshot, TurnStatus,
};
use crate::planner::Planner;
use crate::policy::{Decision, DecisionPolicy, TerminationCause, TurnStateMachine};
use crate::retrieval::{Retriever, SearchBackend, SearchParams};
use crate::storage::{ActionRecord, ArchiveStorage, SessionRecord, TurnRecord};

/// Earlier turns offered to the planner and synthesizer.
pub const PREVIOUS_TURNS: usize = 3;

/// Result of one research Turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    /// Turn identifier.
    pub turn_id: String,
    /// Owning session.
    pub session_id: String,
    /// Final Turn status.
    pub status: TurnStatus,
    /// Human-readable reason the Turn ended.
    pub cause: String,
    /// Markdown report shown to the user.
    pub report: String,
    /// Archive rollup of the Turn's strongest claims.
    pub summary: String,
    /// Loop iterations executed before termination.
    pub loops: u32,
    /// Total collaborator cost of the Turn.
    pub cost: Cost,
}

/// How a recorded Action ended, once its completion is stored.
enum ActionOutcome<T> {
    Succeeded(T),
    Failed(ResearchError),
}

struct LoopRun {
    status: TurnStatus,
    cause: String,
    report: String,
    loops: u32,
}

#[derive(Debug, Serialize)]
struct GeneratedReport {
    source: &'static str,
    report: String,
}

/// Research agent: one instance serves any number of sessions.
pub struct Agent {
    store: Arc<MemoryStore>,
    config: ResearchConfig,
    planner: Planner,
    evaluator: Evaluator,
    policy: DecisionPolicy,
    retrieve: RetrieveExecutor,
    search: SearchExecutor,
    synthesize: SynthesizeExecutor,
    resolve: ResolveExecutor,
    output: OutputExecutor,
    archive: Option<Arc<dyn ArchiveStorage>>,
}

impl Agent {
    /// Build an agent; the configuration is validated here, before any Turn starts.
    pub fn new(
        store: Arc<MemoryStore>,
        backend: Arc<dyn ReasoningBackend>,
        retriever: Arc<dyn Retriever>,
        search: Arc<dyn SearchBackend>,
        config: ResearchConfig,
    ) -> AppResult<Self> {
        config.validate()?;

        Ok(Self {
            planner: Planner::new(backend.clone(), &config),
            evaluator: Evaluator::new(&config),
            policy: DecisionPolicy::new(config.max_loops_per_turn),
            retrieve: RetrieveExecutor::new(retriever.clone(), &config),
            search: SearchExecutor::new(search.clone(), &config),
            synthesize: SynthesizeExecutor::new(backend.clone(), &config),
            resolve: ResolveExecutor::new(backend.clone(), retriever, search, &config),
            output: OutputExecutor::new(backend, &config),
            store,
            config,
            archive: None,
        })
    }

    /// Persist sessions and finished turns to an archive
    pub fn with_archive(mut self, archive: Arc<dyn ArchiveStorage>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Memory store backing this agent.
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Research settings in effect.
    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    /// Create a session carrying a snapshot of the research configuration
    pub async fn start_session(&self) -> AppResult<Session> {
        let session = self
            .store
            .create_session(ConfigSnapshot::from(&self.config))
            .await;
        if let Some(archive) = &self.archive {
            archive.save_session(&SessionRecord::from(&session)).await?;
        }
        Ok(session)
    }

    /// Continue an archived session: its finished turns become context for new ones.
    pub async fn resume_session(&self, session_id: &str) -> AppResult<Session> {
        if let Ok(session) = self.store.get_session(session_id).await {
            return Ok(session);
        }
        let Some(archive) = &self.archive else {
            return Err(AppError::Config {
                message: "resuming a session requires an archive".to_string(),
            });
        };
        let record = archive
            .get_session(session_id)
            .await?
            .ok_or_else(|| ResearchError::not_found("Session", session_id))?;
        let turns: Vec<Turn> = archive
            .list_turns(session_id)
            .await?
            .into_iter()
            .map(|t| t.snapshot)
            .collect();

        let session = Session {
            id: record.id,
            created_at: record.created_at,
            turn_ids: turns.iter().map(|t| t.id.clone()).collect(),
            archived_summary: record.archived_summary,
            config: record.config,
        };
        self.store.restore_session(session.clone(), turns).await?;
        Ok(session)
    }

    /// Run one research Turn to completion.
    ///
    /// `cancel` is checked at the top of every loop iteration. An in-flight
    /// collaborator call is awaited (bounded by the action timeout); a
    /// cancelled Turn still goes through final synthesis and output.
    pub async fn run_turn(
        &self,
        session_id: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> AppResult<TurnReport> {
        let start = Instant::now();
        let turn = self.store.start_turn(session_id, query).await?;
        let turn_id = turn.id;

        let mut loops = 0u32;
        let driven = self.drive(session_id, &turn_id, query, cancel, &mut loops).await;
        let run = match driven {
            Ok(run) => run,
            Err(err) => {
                error!(turn_id = %turn_id, loop_count = loops, error = %err, "Turn aborted");
                self.abort(&turn_id, &err, loops).await?
            }
        };

        self.store
            .finish_turn(
                &turn_id,
                TurnOutcome {
                    status: run.status,
                    report: run.report.clone(),
                    cause: run.cause.clone(),
                },
            )
            .await?;
        let summary = self.store.archive_turn(&turn_id).await?;
        let snapshot = self.store.snapshot(&turn_id).await?;
        self.persist(&snapshot).await?;

        let cost = snapshot.total_cost();
        info!(
            turn_id = %turn_id,
            status = %run.status,
            cause = %run.cause,
            loops = run.loops,
            calls = cost.calls,
            tokens = cost.tokens,
            latency_ms = start.elapsed().as_millis() as u64,
            "Turn finished"
        );

        Ok(TurnReport {
            turn_id,
            session_id: session_id.to_string(),
            status: run.status,
            cause: run.cause,
            report: run.report,
            summary,
            loops: run.loops,
            cost,
        })
    }

    async fn drive(
        &self,
        session_id: &str,
        turn_id: &str,
        query: &str,
        cancel: &CancellationToken,
        loops: &mut u32,
    ) -> ResearchResult<LoopRun> {
        let mut machine = TurnStateMachine::new(turn_id);
        let context = self
            .store
            .previous_context(session_id, PREVIOUS_TURNS)
            .await?;

        self.plan(turn_id, query, &context).await?;
        machine.plan_created()?;

        let cause = loop {
            if cancel.is_cancelled() {
                info!(turn_id = %turn_id, loop_count = *loops, "Cancellation requested");
                break TerminationCause::Cancelled;
            }

            let snapshot = self.store.snapshot(turn_id).await?;
            let verdict = self.evaluator.evaluate(&snapshot);
            let remaining = self.budget_remaining(&snapshot);
            let decision = self.policy.decide(
                &verdict,
                &snapshot.plan_snapshot(self.config.retry_limit),
                *loops,
                remaining,
            );
            debug!(
                turn_id = %turn_id,
                loop_count = *loops,
                verdict = %verdict.summary(),
                decision = decision.label(),
                budget_remaining = remaining,
                "Loop decision"
            );

            match decision {
                Decision::Terminate(cause) => break cause,
                Decision::ResolveConflict => self.resolve_conflicts(turn_id, &snapshot).await?,
                Decision::Retrieve { step_id } | Decision::Search { step_id } => {
                    self.run_step(turn_id, &snapshot, &step_id, &verdict, &context)
                        .await?
                }
            }
            *loops += 1;
        };

        machine.terminate(cause)?;
        machine.begin_synthesis()?;

        let snapshot = self.store.snapshot(turn_id).await?;
        let synthesis = final_synthesis(&snapshot);
        let total_failure = snapshot.all_steps_skipped() && synthesis.is_empty();
        let cause = if total_failure {
            format!("{}; every step was skipped and no claims were established", cause)
        } else {
            cause.to_string()
        };
        let report = self.output(turn_id, &snapshot, &synthesis, &cause).await?;

        Ok(LoopRun {
            status: if total_failure {
                TurnStatus::Failed
            } else {
                TurnStatus::Complete
            },
            cause,
            report,
            loops: *loops,
        })
    }

    /// Planning Action; a failed plan falls back to a single retrieval step.
    async fn plan(&self, turn_id: &str, query: &str, context: &[PriorTurn]) -> ResearchResult<()> {
        let handle = self
            .store
            .record_action(
                turn_id,
                None,
                ActionKind::Plan,
                json!({"query": query, "previous_turns": context.len()}),
            )
            .await?;
        let mut cost = Cost::default();
        let outcome = self.planner.plan(query, context, &mut cost).await;

        let steps = match self.finish_action(&handle, outcome, cost).await? {
            ActionOutcome::Succeeded(steps) => steps,
            ActionOutcome::Failed(err) => {
                warn!(turn_id = %turn_id, error = %err, "Planning failed, using fallback plan");
                Planner::fallback(query)
            }
        };
        self.store.append_plan(turn_id, steps).await?;
        Ok(())
    }

    /// One attempt at a Step: retrieval or search, then synthesis of the new evidence.
    async fn run_step(
        &self,
        turn_id: &str,
        snapshot: &TurnSnapshot,
        step_id: &str,
        verdict: &EvaluationVerdict,
        context: &[PriorTurn],
    ) -> ResearchResult<()> {
        let step = snapshot
            .step(step_id)
            .cloned()
            .ok_or_else(|| ResearchError::not_found("Step", step_id))?;
        if step.status == StepStatus::Pending {
            self.store
                .revise_step(turn_id, step_id, StepStatus::InProgress, "execution started")
                .await?;
        }

        let handle = self
            .store
            .record_action(
                turn_id,
                Some(step_id),
                ActionKind::for_source(step.kind),
                json!({"goal": step.goal, "query": step.query}),
            )
            .await?;
        let mut cost = Cost::default();
        let outcome = match step.kind {
            SourceKind::Rag => {
                self.retrieve
                    .execute(&self.store, &handle, &step, &mut cost)
                    .await
            }
            SourceKind::Web => {
                let params = if verdict.active_claims > 0 && verdict.fails_on(Dimension::Recency) {
                    SearchParams::recent()
                } else {
                    SearchParams::default()
                };
                self.search
                    .execute(&self.store, &handle, &step, params, &mut cost)
                    .await
            }
        };
        let retrieved = match self.finish_action(&handle, outcome, cost).await? {
            ActionOutcome::Succeeded(retrieved) => retrieved,
            ActionOutcome::Failed(err) => return self.record_step_failure(turn_id, step_id, &err).await,
        };

        // Evidence from an earlier attempt whose synthesis failed shows up as duplicates
        let current = self.store.snapshot(turn_id).await?;
        let pending = unsynthesized(
            &current,
            retrieved.evidence_ids.iter().chain(&retrieved.duplicate_ids),
        );
        if !pending.is_empty() {
            if self.budget_remaining(&current) == 0 {
                info!(turn_id = %turn_id, step_id = %step_id, "Budget exhausted before synthesis");
                return Ok(());
            }

            let handle = self
                .store
                .record_action(
                    turn_id,
                    Some(step_id),
                    ActionKind::Synthesize,
                    json!({ "evidence_ids": pending }),
                )
                .await?;
            let mut cost = Cost::default();
            let outcome = self
                .synthesize
                .execute(&self.store, &handle, &pending, context, &mut cost)
                .await;
            if let ActionOutcome::Failed(err) = self.finish_action(&handle, outcome, cost).await? {
                return self.record_step_failure(turn_id, step_id, &err).await;
            }
        }

        self.store
            .revise_step(
                turn_id,
                step_id,
                StepStatus::Done,
                &format!("{} new evidence items", retrieved.evidence_ids.len()),
            )
            .await
    }

    /// Skip the Step once its failed attempts reach the retry limit.
    async fn record_step_failure(
        &self,
        turn_id: &str,
        step_id: &str,
        err: &ResearchError,
    ) -> ResearchResult<()> {
        let attempts = self.store.snapshot(turn_id).await?.failed_attempts(step_id);
        if attempts >= self.config.retry_limit {
            warn!(
                turn_id = %turn_id,
                step_id = %step_id,
                attempts,
                error = %err,
                "Retry limit reached, skipping step"
            );
            self.store
                .revise_step(
                    turn_id,
                    step_id,
                    StepStatus::Skipped,
                    &format!("skipped after {} failed attempts: {}", attempts, err),
                )
                .await
        } else {
            warn!(
                turn_id = %turn_id,
                step_id = %step_id,
                attempts,
                error = %err,
                "Step attempt failed, will retry"
            );
            Ok(())
        }
    }

    async fn resolve_conflicts(&self, turn_id: &str, snapshot: &TurnSnapshot) -> ResearchResult<()> {
        let conflicts: Vec<&str> = snapshot
            .unresolved_conflicts()
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        let handle = self
            .store
            .record_action(
                turn_id,
                None,
                ActionKind::ResolveConflict,
                json!({ "conflicts": conflicts }),
            )
            .await?;
        let mut cost = Cost::default();
        let outcome = self.resolve.execute(&self.store, &handle, &mut cost).await;

        if let ActionOutcome::Failed(err) = self.finish_action(&handle, outcome, cost).await? {
            warn!(turn_id = %turn_id, error = %err, "Conflict resolution failed");
        }
        Ok(())
    }

    /// Output Action. Falls back to a local report when the budget is spent,
    /// there is nothing to report, or the backend fails.
    async fn output(
        &self,
        turn_id: &str,
        snapshot: &TurnSnapshot,
        synthesis: &FinalSynthesis,
        cause: &str,
    ) -> ResearchResult<String> {
        let handle = self
            .store
            .record_action(
                turn_id,
                None,
                ActionKind::Output,
                json!({
                    "claims": synthesis.claims.len(),
                    "sources": synthesis.sources.len(),
                    "cause": cause,
                }),
            )
            .await?;

        let spent = snapshot.total_cost().calls;
        let skip_reason = if synthesis.is_empty() {
            Some("no claims to report".to_string())
        } else if spent >= self.config.cost_ceiling {
            Some(
                ResearchError::BudgetExhausted {
                    spent,
                    ceiling: self.config.cost_ceiling,
                }
                .to_string(),
            )
        } else {
            None
        };
        if let Some(reason) = skip_reason {
            self.store
                .complete_action(
                    &handle,
                    json!({"source": "local", "reason": reason}),
                    Cost::default(),
                    ActionStatus::Ok,
                )
                .await?;
            return Ok(render_local_report(synthesis, cause));
        }

        let mut cost = Cost::default();
        let outcome = self
            .output
            .execute(synthesis, &mut cost)
            .await
            .map(|report| GeneratedReport {
                source: "backend",
                report,
            });
        match self.finish_action(&handle, outcome, cost).await? {
            ActionOutcome::Succeeded(generated) => Ok(generated.report),
            ActionOutcome::Failed(err) => {
                warn!(turn_id = %turn_id, error = %err, "Report generation failed, using local report");
                Ok(render_local_report(synthesis, cause))
            }
        }
    }

    /// Store an executor outcome on its Action.
    ///
    /// Collaborator failures come back as [`ActionOutcome::Failed`];
    /// integrity violations are recorded and then propagated.
    async fn finish_action<T: Serialize>(
        &self,
        handle: &ActionHandle,
        outcome: ResearchResult<T>,
        cost: Cost,
    ) -> ResearchResult<ActionOutcome<T>> {
        match outcome {
            Ok(value) => {
                let payload = serde_json::to_value(&value)
                    .unwrap_or_else(|e| json!({"serialization_error": e.to_string()}));
                self.store
                    .complete_action(handle, payload, cost, ActionStatus::Ok)
                    .await?;
                Ok(ActionOutcome::Succeeded(value))
            }
            Err(err) => {
                self.store
                    .complete_action(handle, json!({"error": err.to_string()}), cost, ActionStatus::Error)
                    .await?;
                if err.is_integrity_violation() {
                    return Err(err);
                }
                Ok(ActionOutcome::Failed(err))
            }
        }
    }

    /// Close any running Action and produce a FAILED outcome with a local report.
    async fn abort(&self, turn_id: &str, err: &ResearchError, loops: u32) -> ResearchResult<LoopRun> {
        let snapshot = self.store.snapshot(turn_id).await?;
        if let Some(running) = snapshot
            .actions()
            .iter()
            .find(|a| a.status == ActionStatus::Running)
        {
            let handle = ActionHandle {
                turn_id: turn_id.to_string(),
                action_id: running.id.clone(),
                step_id: running.step_id.clone(),
                kind: running.kind,
            };
            self.store
                .complete_action(&handle, json!({"error": err.to_string()}), Cost::default(), ActionStatus::Error)
                .await?;
        }

        let cause = format!("integrity violation: {}", err);
        Ok(LoopRun {
            status: TurnStatus::Failed,
            report: render_local_report(&final_synthesis(&snapshot), &cause),
            cause,
            loops,
        })
    }

    fn budget_remaining(&self, snapshot: &TurnSnapshot) -> u64 {
        self.config
            .cost_ceiling
            .saturating_sub(snapshot.total_cost().calls)
    }

    async fn persist(&self, snapshot: &TurnSnapshot) -> AppResult<()> {
        let Some(archive) = &self.archive else {
            return Ok(());
        };
        let session = self.store.get_session(&snapshot.turn().session_id).await?;
        archive.save_session(&SessionRecord::from(&session)).await?;
        archive.save_turn(&TurnRecord::from(snapshot.turn())).await?;
        let actions: Vec<ActionRecord> = snapshot.actions().iter().map(ActionRecord::from).collect();
        archive.save_actions(&actions).await?;
        Ok(())
    }
}

/// Candidate evidence ids not yet covered by a successful synthesis.
fn unsynthesized<'a>(
    snapshot: &TurnSnapshot,
    candidates: impl Iterator<Item = &'a String>,
) -> Vec<String> {
    let done: HashSet<&str> = snapshot
        .actions()
        .iter()
        .filter(|a| a.kind == ActionKind::Synthesize && a.status == ActionStatus::Ok)
        .filter_map(|a| a.input.get("evidence_ids").and_then(|v| v.as_array()))
        .flatten()
        .filter_map(|v| v.as_str())
        .collect();

    let mut pending: Vec<String> = Vec::new();
    for id in candidates {
        if !done.contains(id.as_str()) && !pending.contains(id) {
            pending.push(id.clone());
        }
    }
    pending
}
