use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::complete_structured;
use crate::config::ResearchConfig;
use crate::error::ResearchResult;
use crate::llm::{to_prompt_json, CompletionRequest, Message, ReasoningBackend};
use crate::memory::{ActionHandle, Cost, LineageDelta, MemoryStore, NewClaim, PriorTurn};
use crate::prompts::{format_previous_context, CLAIMS_SCHEMA, SYNTHESIS_PROMPT};
use crate::retrieval::normalize_confidence;

/// Payload recorded on a SYNTHESIZE Action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisOutcome {
    /// Claims created by this Action.
    pub lineage: LineageDelta,
    /// Proposed claims discarded for lack of valid support.
    pub unsupported: usize,
    /// Proposed claims that restated an existing claim.
    pub duplicates: usize,
    /// Restatements that superseded a claim to add support or confidence.
    #[serde(default)]
    pub merged: usize,
    /// Distinct claim pairs newly flagged as conflicting.
    pub conflicts_flagged: usize,
}

#[derive(Debug, Deserialize)]
struct ClaimsResponse {
    #[serde(default)]
    claims: Vec<ProposedClaim>,
}

#[derive(Debug, Deserialize)]
struct ProposedClaim {
    /// Response-local label that `conflicts_with` of sibling claims may name.
    #[serde(default, rename = "ref")]
    local_ref: Option<String>,
    text: String,
    #[serde(default)]
    support_ids: Vec<String>,
    #[serde(default)]
    aspects: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    conflicts_with: Vec<String>,
}

/// Current state of an active claim while a response is applied.
struct ActiveClaim {
    id: String,
    statement: String,
    support: Vec<String>,
    confidence: f64,
    aspects: Vec<String>,
    conflict: bool,
}

impl ActiveClaim {
    /// Fold a restatement in; true when it added support, aspects or confidence.
    fn absorbs(&mut self, support: &[String], confidence: f64, aspects: &[String]) -> bool {
        let mut changed = false;
        for id in support {
            if !self.support.contains(id) {
                self.support.push(id.clone());
                changed = true;
            }
        }
        for aspect in aspects {
            if !self.aspects.iter().any(|a| a.eq_ignore_ascii_case(aspect)) {
                self.aspects.push(aspect.clone());
                changed = true;
            }
        }
        if confidence > self.confidence {
            self.confidence = confidence;
            changed = true;
        }
        changed
    }
}

fn normalize_statement(statement: &str) -> String {
    statement.trim().to_lowercase()
}

/// Follow supersession links made during this Action to the live claim id.
fn latest(successors: &HashMap<String, String>, mut id: String) -> String {
    while let Some(next) = successors.get(&id) {
        id = next.clone();
    }
    id
}

/// Turns evidence into Claims via the reasoning backend.
pub struct SynthesizeExecutor {
    backend: Arc<dyn ReasoningBackend>,
    timeout_ms: u64,
}

impl SynthesizeExecutor {
    /// Create a synthesize executor.
    pub fn new(backend: Arc<dyn ReasoningBackend>, config: &ResearchConfig) -> Self {
        Self {
            backend,
            timeout_ms: config.action_timeout_ms,
        }
    }

    /// Synthesize claims from the given evidence of the Action's Turn.
    ///
    /// Support ids that do not name evidence of the Turn are discarded; a
    /// claim left without support is dropped. Restating an active claim with
    /// new support or higher confidence supersedes it with a merged
    /// successor. `conflicts_with` may name active claims or the `ref` of a
    /// sibling claim; each pair is flagged on both sides.
    pub async fn execute(
        &self,
        store: &MemoryStore,
        handle: &ActionHandle,
        evidence_ids: &[String],
        context: &[PriorTurn],
        cost: &mut Cost,
    ) -> ResearchResult<SynthesisOutcome> {
        let start = Instant::now();
        let before = store.snapshot(&handle.turn_id).await?;

        let evidence: Vec<_> = evidence_ids
            .iter()
            .filter_map(|id| before.evidence_by_id(id))
            .map(|e| {
                json!({
                    "id": e.id,
                    "source": e.source,
                    "locator": e.locator,
                    "published": e.published,
                    "content": e.content,
                })
            })
            .collect();
        let existing: Vec<_> = before
            .active_claims()
            .map(|c| json!({"id": c.id, "text": c.statement, "confidence": c.confidence}))
            .collect();

        let prompt = format!(
            "Question: {}\n\nPrevious research:\n{}\n\nExisting claims:\n{}\n\nEvidence:\n{}",
            before.query(),
            format_previous_context(context),
            to_prompt_json(&existing),
            to_prompt_json(&evidence),
        );
        let request = CompletionRequest::new(
            CLAIMS_SCHEMA,
            vec![Message::system(SYNTHESIS_PROMPT), Message::user(prompt)],
        )
        .with_temperature(0.3);

        let response: ClaimsResponse =
            complete_structured(self.backend.as_ref(), request, self.timeout_ms, cost).await?;

        let valid_evidence: HashSet<&str> = before.evidence().iter().map(|e| e.id.as_str()).collect();
        let mut active: HashMap<String, ActiveClaim> = before
            .active_claims()
            .map(|c| {
                (
                    normalize_statement(&c.statement),
                    ActiveClaim {
                        id: c.id.clone(),
                        statement: c.statement.clone(),
                        support: c.support.clone(),
                        confidence: c.confidence,
                        aspects: c.aspects.clone(),
                        conflict: c.conflict,
                    },
                )
            })
            .collect();
        let mut successors: HashMap<String, String> = HashMap::new();
        let mut local_refs: HashMap<String, String> = HashMap::new();
        let mut pending_conflicts: Vec<(String, Vec<String>)> = Vec::new();
        let mut outcome = SynthesisOutcome::default();

        for proposed in response.claims {
            let statement = proposed.text.trim();
            let support: Vec<String> = proposed
                .support_ids
                .into_iter()
                .filter(|id| valid_evidence.contains(id.as_str()))
                .collect();
            if statement.is_empty() || support.is_empty() {
                debug!(turn_id = %handle.turn_id, claim = %statement, "Dropping unsupported claim");
                outcome.unsupported += 1;
                continue;
            }
            let confidence = normalize_confidence(proposed.confidence);
            let key = normalize_statement(statement);

            let id = match active.get_mut(&key) {
                Some(current) => {
                    outcome.duplicates += 1;
                    if current.absorbs(&support, confidence, &proposed.aspects) {
                        let successor = NewClaim::new(
                            current.statement.clone(),
                            current.support.clone(),
                            current.confidence,
                        )
                        .with_aspects(current.aspects.clone())
                        .with_conflict(current.conflict)
                        .with_action(&handle.action_id);
                        let new_id = store.supersede_claim(&current.id, successor).await?;
                        debug!(
                            turn_id = %handle.turn_id,
                            old = %current.id,
                            new = %new_id,
                            "Restated claim merged into successor"
                        );
                        outcome.lineage.created.push(new_id.clone());
                        outcome
                            .lineage
                            .superseded
                            .push((current.id.clone(), new_id.clone()));
                        successors.insert(current.id.clone(), new_id.clone());
                        current.id = new_id;
                        outcome.merged += 1;
                    }
                    current.id.clone()
                }
                None => {
                    let claim = NewClaim::new(statement, support.clone(), confidence)
                        .with_aspects(proposed.aspects.clone())
                        .with_action(&handle.action_id);
                    let id = store.add_claim(&handle.turn_id, claim).await?;
                    outcome.lineage.created.push(id.clone());
                    active.insert(
                        key,
                        ActiveClaim {
                            id: id.clone(),
                            statement: statement.to_string(),
                            support,
                            confidence,
                            aspects: proposed.aspects,
                            conflict: false,
                        },
                    );
                    id
                }
            };

            if let Some(local) = proposed.local_ref.filter(|r| !r.trim().is_empty()) {
                local_refs.insert(local.trim().to_string(), id.clone());
            }
            if !proposed.conflicts_with.is_empty() {
                pending_conflicts.push((id, proposed.conflicts_with));
            }
        }

        // References resolve once every proposed claim is stored, so a claim
        // may name a sibling that appears later in the same response.
        let active_ids: HashSet<String> = active.values().map(|c| c.id.clone()).collect();
        let mut flagged: HashSet<(String, String)> = HashSet::new();
        for (id, targets) in pending_conflicts {
            let id = latest(&successors, id);
            for target in targets {
                let target = local_refs.get(target.trim()).cloned().unwrap_or(target);
                let target = latest(&successors, target);
                if target == id || !active_ids.contains(&target) {
                    continue;
                }
                let pair = if id < target {
                    (id.clone(), target.clone())
                } else {
                    (target.clone(), id.clone())
                };
                if !flagged.insert(pair) {
                    continue;
                }
                store
                    .flag_conflict(&handle.turn_id, &[id.clone(), target])
                    .await?;
                outcome.conflicts_flagged += 1;
            }
        }

        info!(
            turn_id = %handle.turn_id,
            created = outcome.lineage.created.len(),
            merged = outcome.merged,
            unsupported = outcome.unsupported,
            conflicts = outcome.conflicts_flagged,
            latency_ms = start.elapsed().as_millis() as u64,
            "Synthesis completed"
        );
        Ok(outcome)
    }
}
