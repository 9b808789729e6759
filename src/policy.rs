//! Deterministic decision policy and per-Turn state machine.
//!
//! # States
//!
//! - **Planning**: waiting for the first Plan
//! - **Looping**: evaluate, decide, execute, synthesize
//! - **Terminated**: a stop condition fired; the cause is recorded
//! - **Synthesizing**: final synthesis and report output

use serde::{Deserialize, Serialize};

use crate::error::{ResearchError, ResearchResult};
use crate::evaluator::EvaluationVerdict;
use crate::memory::{PlanSnapshot, SourceKind};

/// Phase of a Turn's control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Building the initial plan.
    Planning,
    /// Running evaluate/decide/execute iterations.
    Looping,
    /// Loop stopped; cause recorded.
    Terminated,
    /// Final synthesis and output.
    Synthesizing,
}

impl Phase {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Looping => "looping",
            Phase::Terminated => "terminated",
            Phase::Synthesizing => "synthesizing",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    /// Every dimension passed.
    VerdictPassed,
    /// Loop ceiling reached.
    MaxLoopsReached,
    /// Cost ceiling reached.
    BudgetExhausted,
    /// No open Step and nothing to resolve.
    NoActionableSteps,
    /// Cancelled by the caller.
    Cancelled,
}

impl TerminationCause {
    /// Human-readable cause recorded on the Turn.
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationCause::VerdictPassed => "verdict passed",
            TerminationCause::MaxLoopsReached => "max loops reached",
            TerminationCause::BudgetExhausted => "budget exhausted",
            TerminationCause::NoActionableSteps => "no actionable steps remain",
            TerminationCause::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Next thing the loop controller should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Resolve flagged conflicts.
    ResolveConflict,
    /// Run a knowledge-base Step.
    Retrieve { step_id: String },
    /// Run a web Step.
    Search { step_id: String },
    /// Stop the loop.
    Terminate(TerminationCause),
}

impl Decision {
    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            Decision::ResolveConflict => "resolve_conflict",
            Decision::Retrieve { .. } => "retrieve",
            Decision::Search { .. } => "search",
            Decision::Terminate(_) => "terminate",
        }
    }
}

/// Maps a verdict and plan state to the next action.
#[derive(Debug, Clone, Copy)]
pub struct DecisionPolicy {
    max_loops: u32,
}

impl DecisionPolicy {
    /// Create a policy with the given loop ceiling.
    pub fn new(max_loops: u32) -> Self {
        Self { max_loops }
    }

    /// Decide the next action.
    ///
    /// Stop conditions are checked first (verdict, loop bound, budget). An
    /// unresolved conflict outranks a pending retrieval step.
    pub fn decide(
        &self,
        verdict: &EvaluationVerdict,
        plan: &PlanSnapshot,
        loop_count: u32,
        budget_remaining: u64,
    ) -> Decision {
        if verdict.passed {
            return Decision::Terminate(TerminationCause::VerdictPassed);
        }
        if loop_count >= self.max_loops {
            return Decision::Terminate(TerminationCause::MaxLoopsReached);
        }
        if budget_remaining == 0 {
            return Decision::Terminate(TerminationCause::BudgetExhausted);
        }
        if verdict.unresolved_conflicts > 0 && plan.conflict_attempts_remaining > 0 {
            return Decision::ResolveConflict;
        }
        match plan.next_open_step() {
            Some(step) => match step.kind {
                SourceKind::Rag => Decision::Retrieve {
                    step_id: step.id.clone(),
                },
                SourceKind::Web => Decision::Search {
                    step_id: step.id.clone(),
                },
            },
            None => Decision::Terminate(TerminationCause::NoActionableSteps),
        }
    }
}

/// Tracks the phase of one Turn and rejects out-of-order transitions.
#[derive(Debug, Clone)]
pub struct TurnStateMachine {
    turn_id: String,
    phase: Phase,
    cause: Option<TerminationCause>,
}

impl TurnStateMachine {
    /// Start a Turn in the planning phase.
    pub fn new(turn_id: impl Into<String>) -> Self {
        Self {
            turn_id: turn_id.into(),
            phase: Phase::Planning,
            cause: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Why the loop stopped, once it has.
    pub fn cause(&self) -> Option<TerminationCause> {
        self.cause
    }

    /// PLANNING -> LOOPING
    pub fn plan_created(&mut self) -> ResearchResult<()> {
        self.expect(&[Phase::Planning], Phase::Looping)?;
        self.transition_to(Phase::Looping);
        Ok(())
    }

    /// PLANNING | LOOPING -> TERMINATED
    pub fn terminate(&mut self, cause: TerminationCause) -> ResearchResult<()> {
        self.expect(&[Phase::Planning, Phase::Looping], Phase::Terminated)?;
        self.cause = Some(cause);
        self.transition_to(Phase::Terminated);
        Ok(())
    }

    /// TERMINATED -> SYNTHESIZING
    pub fn begin_synthesis(&mut self) -> ResearchResult<()> {
        self.expect(&[Phase::Terminated], Phase::Synthesizing)?;
        self.transition_to(Phase::Synthesizing);
        Ok(())
    }

    fn expect(&self, allowed: &[Phase], target: Phase) -> ResearchResult<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(ResearchError::invalid_state(
                "Turn",
                &self.turn_id,
                format!("cannot move from {} to {}", self.phase, target),
            ))
        }
    }

    fn transition_to(&mut self, new_phase: Phase) {
        tracing::info!(
            turn_id = %self.turn_id,
            from = %self.phase,
            to = %new_phase,
            cause = self.cause.map(|c| c.as_str()).unwrap_or(""),
            "Turn phase transition"
        );
        self.phase = new_phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::DimensionScores;
    use crate::memory::{StepStatus, StepView};

    fn verdict(passed: bool, conflicts: usize) -> EvaluationVerdict {
        EvaluationVerdict {
            scores: DimensionScores::default(),
            passed,
            failing: vec![],
            active_claims: 2,
            unresolved_conflicts: conflicts,
        }
    }

    fn step(id: &str, kind: SourceKind, status: StepStatus) -> StepView {
        StepView {
            id: id.to_string(),
            kind,
            status,
        }
    }

    fn plan(steps: Vec<StepView>) -> PlanSnapshot {
        PlanSnapshot {
            steps,
            conflict_attempts_remaining: 2,
        }
    }

    #[test]
    fn test_passing_verdict_terminates() {
        let policy = DecisionPolicy::new(5);
        let plan = plan(vec![step("s1", SourceKind::Rag, StepStatus::Pending)]);
        assert_eq!(
            policy.decide(&verdict(true, 1), &plan, 0, 10),
            Decision::Terminate(TerminationCause::VerdictPassed)
        );
    }

    #[test]
    fn test_loop_bound_terminates() {
        let policy = DecisionPolicy::new(3);
        let plan = plan(vec![step("s1", SourceKind::Rag, StepStatus::Pending)]);
        assert_eq!(
            policy.decide(&verdict(false, 0), &plan, 3, 10),
            Decision::Terminate(TerminationCause::MaxLoopsReached)
        );
        assert!(matches!(
            policy.decide(&verdict(false, 0), &plan, 2, 10),
            Decision::Retrieve { .. }
        ));
    }

    #[test]
    fn test_budget_exhaustion_terminates() {
        let policy = DecisionPolicy::new(5);
        let plan = plan(vec![step("s1", SourceKind::Web, StepStatus::Pending)]);
        assert_eq!(
            policy.decide(&verdict(false, 1), &plan, 1, 0),
            Decision::Terminate(TerminationCause::BudgetExhausted)
        );
    }

    #[test]
    fn test_conflict_outranks_pending_step() {
        let policy = DecisionPolicy::new(5);
        let plan = plan(vec![
            step("s1", SourceKind::Rag, StepStatus::Pending),
            step("s2", SourceKind::Web, StepStatus::Pending),
        ]);
        assert_eq!(
            policy.decide(&verdict(false, 2), &plan, 1, 10),
            Decision::ResolveConflict
        );
    }

    #[test]
    fn test_exhausted_conflict_attempts_fall_through_to_steps() {
        let policy = DecisionPolicy::new(5);
        let mut plan = plan(vec![step("s1", SourceKind::Web, StepStatus::Pending)]);
        plan.conflict_attempts_remaining = 0;
        assert_eq!(
            policy.decide(&verdict(false, 2), &plan, 1, 10),
            Decision::Search {
                step_id: "s1".to_string()
            }
        );
    }

    #[test]
    fn test_step_kind_selects_executor() {
        let policy = DecisionPolicy::new(5);
        let plan = plan(vec![
            step("s1", SourceKind::Rag, StepStatus::Done),
            step("s2", SourceKind::Web, StepStatus::Skipped),
            step("s3", SourceKind::Web, StepStatus::InProgress),
            step("s4", SourceKind::Rag, StepStatus::Pending),
        ]);
        assert_eq!(
            policy.decide(&verdict(false, 0), &plan, 0, 10),
            Decision::Search {
                step_id: "s3".to_string()
            }
        );
    }

    #[test]
    fn test_no_open_steps_terminates() {
        let policy = DecisionPolicy::new(5);
        let plan = plan(vec![step("s1", SourceKind::Rag, StepStatus::Done)]);
        assert_eq!(
            policy.decide(&verdict(false, 0), &plan, 1, 10),
            Decision::Terminate(TerminationCause::NoActionableSteps)
        );
    }

    #[test]
    fn test_decide_is_deterministic() {
        let policy = DecisionPolicy::new(5);
        let plan = plan(vec![step("s1", SourceKind::Rag, StepStatus::Pending)]);
        let first = policy.decide(&verdict(false, 0), &plan, 1, 10);
        for _ in 0..10 {
            assert_eq!(policy.decide(&verdict(false, 0), &plan, 1, 10), first);
        }
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut machine = TurnStateMachine::new("t1");
        assert_eq!(machine.phase(), Phase::Planning);
        machine.plan_created().unwrap();
        assert_eq!(machine.phase(), Phase::Looping);
        machine.terminate(TerminationCause::BudgetExhausted).unwrap();
        assert_eq!(machine.cause(), Some(TerminationCause::BudgetExhausted));
        machine.begin_synthesis().unwrap();
        assert_eq!(machine.phase(), Phase::Synthesizing);
    }

    #[test]
    fn test_state_machine_rejects_out_of_order() {
        let mut machine = TurnStateMachine::new("t1");
        assert!(machine.begin_synthesis().is_err());

        machine.plan_created().unwrap();
        assert!(machine.plan_created().is_err());

        machine.terminate(TerminationCause::VerdictPassed).unwrap();
        let err = machine.terminate(TerminationCause::Cancelled).unwrap_err();
        assert!(err.is_integrity_violation());
        assert_eq!(machine.cause(), Some(TerminationCause::VerdictPassed));
    }

    #[test]
    fn test_cause_strings() {
        assert_eq!(TerminationCause::BudgetExhausted.to_string(), "budget exhausted");
        assert_eq!(TerminationCause::MaxLoopsReached.as_str(), "max loops reached");
    }
}
