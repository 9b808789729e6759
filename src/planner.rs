//! Query decomposition into research Steps.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tracing::info;

use crate::config::ResearchConfig;
use crate::error::{ResearchError, ResearchResult};
use crate::executors::complete_structured;
use crate::llm::{CompletionRequest, Message, ReasoningBackend};
use crate::memory::{Cost, PriorTurn, SourceKind, StepSpec};
use crate::prompts::{format_previous_context, PLANNER_PROMPT, PLAN_SCHEMA};

/// Most steps accepted from one planning call.
pub const MAX_PLAN_STEPS: usize = 5;

#[derive(Debug, Deserialize)]
struct PlanResponse {
    steps: Vec<ProposedStep>,
}

#[derive(Debug, Deserialize)]
struct ProposedStep {
    goal: String,
    kind: SourceKind,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    aspects: Vec<String>,
    #[serde(default)]
    done_criteria: String,
    #[serde(default)]
    priority: Option<u8>,
}

/// Asks the reasoning backend for a research plan.
pub struct Planner {
    backend: Arc<dyn ReasoningBackend>,
    timeout_ms: u64,
}

impl Planner {
    /// Create a planner.
    pub fn new(backend: Arc<dyn ReasoningBackend>, config: &ResearchConfig) -> Self {
        Self {
            backend,
            timeout_ms: config.action_timeout_ms,
        }
    }

    /// Plan 1-5 steps for `query`, lowest priority number first.
    ///
    /// Steps without a priority keep their proposed position after the
    /// prioritized ones. A step without a query uses its goal as the query.
    pub async fn plan(
        &self,
        query: &str,
        context: &[PriorTurn],
        cost: &mut Cost,
    ) -> ResearchResult<Vec<StepSpec>> {
        let start = Instant::now();
        let request = CompletionRequest::new(
            PLAN_SCHEMA,
            vec![
                Message::system(PLANNER_PROMPT),
                Message::user(format!(
                    "Question: {}\n\nPrevious turns:\n{}",
                    query,
                    format_previous_context(context)
                )),
            ],
        )
        .with_temperature(0.3);

        let response: PlanResponse =
            complete_structured(self.backend.as_ref(), request, self.timeout_ms, cost).await?;

        let mut steps = Vec::new();
        for proposed in response.steps.into_iter().take(MAX_PLAN_STEPS) {
            let goal = proposed.goal.trim().to_string();
            if goal.is_empty() {
                return Err(ResearchError::MalformedResponse {
                    message: format!("{}: step without a goal", PLAN_SCHEMA),
                });
            }
            let seed = proposed
                .query
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .unwrap_or_else(|| goal.clone());

            let mut spec = StepSpec::new(goal, proposed.kind, seed)
                .with_aspects(proposed.aspects)
                .with_priority(proposed.priority.unwrap_or(u8::MAX));
            spec.done_criteria = proposed.done_criteria;
            steps.push(spec);
        }
        if steps.is_empty() {
            return Err(ResearchError::MalformedResponse {
                message: format!("{}: no steps", PLAN_SCHEMA),
            });
        }
        steps.sort_by_key(|s| s.priority);

        info!(
            steps = steps.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Plan generated"
        );
        Ok(steps)
    }

    /// Single-step plan used when planning fails.
    pub fn fallback(query: &str) -> Vec<StepSpec> {
        let mut step = StepSpec::new("Gather initial information", SourceKind::Rag, query)
            .with_priority(1);
        step.done_criteria = "Relevant background evidence retrieved".to_string();
        vec![step]
    }
}
