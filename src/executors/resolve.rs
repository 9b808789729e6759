use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{call_with_timeout, complete_structured, store_evidence};
use crate::config::ResearchConfig;
use crate::error::{ResearchError, ResearchResult};
use crate::llm::{to_prompt_json, CompletionRequest, Message, ReasoningBackend};
use crate::memory::{ActionHandle, Claim, Cost, LineageDelta, MemoryStore, NewClaim, NewEvidence, SourceKind};
use crate::prompts::{
    ADJUDICATION_PROMPT, ADJUDICATION_SCHEMA, RESOLUTION_PLAN_PROMPT, RESOLUTION_PLAN_SCHEMA,
};
use crate::retrieval::{normalize_confidence, RetrievalQuery, Retriever, SearchBackend, SearchParams, SearchQuery};

/// Verification queries run per resolution attempt.
const MAX_VERIFICATION_QUERIES: usize = 2;

/// Payload recorded on a RESOLVE_CONFLICT Action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    /// Verification queries that were run.
    pub queries: Vec<String>,
    /// Rubric used for adjudication.
    pub rubric: String,
    /// Evidence added by verification.
    pub evidence_ids: Vec<String>,
    /// Claim lineage changes.
    pub lineage: LineageDelta,
    /// Conflicting claims settled by a ruling.
    pub resolved: usize,
    /// Conflicting claims left unresolved.
    pub remaining: usize,
}

#[derive(Debug, Deserialize)]
struct ResolutionPlan {
    #[serde(default)]
    queries: Vec<VerificationQuery>,
    #[serde(default)]
    rubric: String,
}

#[derive(Debug, Deserialize)]
struct VerificationQuery {
    kind: SourceKind,
    query: String,
}

#[derive(Debug, Deserialize)]
struct Adjudication {
    updated_claims: Vec<Ruling>,
}

#[derive(Debug, Deserialize)]
struct Ruling {
    claim_id: String,
    action: RulingAction,
    #[serde(default)]
    new_text: Option<String>,
    #[serde(default)]
    new_confidence: Option<f64>,
    #[serde(default)]
    evidence_ids: Vec<String>,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RulingAction {
    Upheld,
    Revised,
    Retracted,
}

/// Settles conflicting claims in two phases within one Action.
///
/// 1. The backend proposes up to two verification queries; their results
///    are stored as evidence.
/// 2. The backend adjudicates each conflicting claim against all evidence.
///    Upheld and revised claims are superseded by unflagged successors,
///    retracted claims are retired.
///
/// An adjudication that settles nothing is an error, so repeated futile
/// attempts count against the retry limit.
pub struct ResolveExecutor {
    backend: Arc<dyn ReasoningBackend>,
    retriever: Arc<dyn Retriever>,
    search: Arc<dyn SearchBackend>,
    timeout_ms: u64,
    top_k: usize,
    web_results: usize,
}

impl ResolveExecutor {
    /// Create a resolve executor.
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        retriever: Arc<dyn Retriever>,
        search: Arc<dyn SearchBackend>,
        config: &ResearchConfig,
    ) -> Self {
        Self {
            backend,
            retriever,
            search,
            timeout_ms: config.action_timeout_ms,
            top_k: config.rag_top_k,
            web_results: config.web_results,
        }
    }

    /// Verify and adjudicate the Turn's unresolved conflicts.
    pub async fn execute(
        &self,
        store: &MemoryStore,
        handle: &ActionHandle,
        cost: &mut Cost,
    ) -> ResearchResult<ResolutionOutcome> {
        let start = Instant::now();
        let before = store.snapshot(&handle.turn_id).await?;
        let conflicts: Vec<Claim> = before.unresolved_conflicts().into_iter().cloned().collect();
        if conflicts.is_empty() {
            return Err(ResearchError::invalid_state(
                "Turn",
                &handle.turn_id,
                "no conflicting claims to resolve",
            ));
        }
        let conflict_view: Vec<_> = conflicts
            .iter()
            .map(|c| json!({"id": c.id, "text": c.statement, "confidence": c.confidence, "support": c.support}))
            .collect();

        // Phase 1: verification queries
        let request = CompletionRequest::new(
            RESOLUTION_PLAN_SCHEMA,
            vec![
                Message::system(RESOLUTION_PLAN_PROMPT),
                Message::user(format!(
                    "Question: {}\n\nConflicting claims:\n{}",
                    before.query(),
                    to_prompt_json(&conflict_view)
                )),
            ],
        )
        .with_temperature(0.2);
        let plan: ResolutionPlan =
            complete_structured(self.backend.as_ref(), request, self.timeout_ms, cost).await?;

        let mut outcome = ResolutionOutcome {
            rubric: plan.rubric,
            ..Default::default()
        };
        for query in plan.queries.into_iter().take(MAX_VERIFICATION_QUERIES) {
            let items = self.verify(&query, cost).await?;
            let stored = store_evidence(store, handle, items).await?;
            outcome.evidence_ids.extend(stored.created);
            outcome.queries.push(query.query);
        }

        // Phase 2: adjudication
        let current = store.snapshot(&handle.turn_id).await?;
        let relevant: HashSet<&str> = conflicts
            .iter()
            .flat_map(|c| c.support.iter().map(String::as_str))
            .chain(outcome.evidence_ids.iter().map(String::as_str))
            .collect();
        let evidence_view: Vec<_> = current
            .evidence()
            .iter()
            .filter(|e| relevant.contains(e.id.as_str()))
            .map(|e| json!({"id": e.id, "locator": e.locator, "published": e.published, "content": e.content}))
            .collect();

        let request = CompletionRequest::new(
            ADJUDICATION_SCHEMA,
            vec![
                Message::system(ADJUDICATION_PROMPT),
                Message::user(format!(
                    "Rubric: {}\n\nConflicting claims:\n{}\n\nEvidence:\n{}",
                    if outcome.rubric.is_empty() {
                        "prefer authoritative, recent sources"
                    } else {
                        outcome.rubric.as_str()
                    },
                    to_prompt_json(&conflict_view),
                    to_prompt_json(&evidence_view)
                )),
            ],
        )
        .with_temperature(0.2);
        let adjudication: Adjudication =
            complete_structured(self.backend.as_ref(), request, self.timeout_ms, cost).await?;

        let valid_evidence: HashSet<&str> = current.evidence().iter().map(|e| e.id.as_str()).collect();
        let mut settled: HashSet<String> = HashSet::new();

        for ruling in adjudication.updated_claims {
            let Some(claim) = conflicts.iter().find(|c| c.id == ruling.claim_id) else {
                warn!(claim_id = %ruling.claim_id, "Ruling names a claim that is not in conflict");
                continue;
            };
            if settled.contains(&claim.id) {
                continue;
            }

            let mut support = claim.support.clone();
            support.extend(
                ruling
                    .evidence_ids
                    .iter()
                    .filter(|id| valid_evidence.contains(id.as_str()))
                    .cloned(),
            );
            let confidence = ruling
                .new_confidence
                .map(|c| normalize_confidence(Some(c)))
                .unwrap_or(claim.confidence);

            match ruling.action {
                RulingAction::Retracted => {
                    store.retract_claim(&claim.id).await?;
                    outcome.lineage.retracted.push(claim.id.clone());
                }
                RulingAction::Upheld | RulingAction::Revised => {
                    let statement = match (ruling.action, ruling.new_text.as_deref().map(str::trim)) {
                        (RulingAction::Revised, Some(text)) if !text.is_empty() => text.to_string(),
                        (RulingAction::Revised, _) => {
                            warn!(claim_id = %claim.id, "Revised ruling without replacement text");
                            continue;
                        }
                        _ => claim.statement.clone(),
                    };
                    let successor = NewClaim::new(statement, support, confidence)
                        .with_aspects(claim.aspects.clone())
                        .with_action(&handle.action_id);
                    let new_id = store.supersede_claim(&claim.id, successor).await?;
                    outcome.lineage.created.push(new_id.clone());
                    outcome.lineage.superseded.push((claim.id.clone(), new_id));
                }
            }
            info!(
                turn_id = %handle.turn_id,
                claim_id = %claim.id,
                ruling = ?ruling.action,
                rationale = %ruling.rationale,
                "Conflict ruling applied"
            );
            settled.insert(claim.id.clone());
        }

        outcome.resolved = settled.len();
        outcome.remaining = conflicts.len() - settled.len();
        info!(
            turn_id = %handle.turn_id,
            resolved = outcome.resolved,
            remaining = outcome.remaining,
            latency_ms = start.elapsed().as_millis() as u64,
            "Conflict resolution completed"
        );

        if outcome.resolved == 0 {
            return Err(ResearchError::MalformedResponse {
                message: format!(
                    "adjudication settled none of {} conflicting claims",
                    conflicts.len()
                ),
            });
        }
        Ok(outcome)
    }

    async fn verify(
        &self,
        query: &VerificationQuery,
        cost: &mut Cost,
    ) -> ResearchResult<Vec<NewEvidence>> {
        let items = match query.kind {
            SourceKind::Rag => {
                let request = RetrievalQuery {
                    text: query.query.clone(),
                    top_k: self.top_k,
                };
                call_with_timeout("retriever", self.timeout_ms, cost, self.retriever.retrieve(&request))
                    .await?
                    .into_iter()
                    .take(self.top_k)
                    .map(|item| NewEvidence {
                        source: SourceKind::Rag,
                        locator: item.locator,
                        content: item.content,
                        confidence: item.confidence,
                        published: item.published,
                        action_id: None,
                    })
                    .collect()
            }
            SourceKind::Web => {
                let request = SearchQuery {
                    text: query.query.clone(),
                    num_results: self.web_results,
                    params: SearchParams::default(),
                };
                call_with_timeout("search backend", self.timeout_ms, cost, self.search.search(&request))
                    .await?
                    .into_iter()
                    .take(self.web_results)
                    .map(|hit| NewEvidence {
                        source: SourceKind::Web,
                        locator: hit.url,
                        content: hit.snippet,
                        confidence: hit.confidence,
                        published: hit.published,
                        action_id: None,
                    })
                    .collect()
            }
        };
        Ok(items)
    }
}

#[cfg(test)]
#[path = "resolve_tests.rs"]
mod resolve_tests;
