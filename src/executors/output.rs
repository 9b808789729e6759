use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::complete_structured;
use crate::config::ResearchConfig;
use crate::error::{ResearchError, ResearchResult};
use crate::llm::{to_prompt_json, CompletionRequest, Message, ReasoningBackend};
use crate::memory::{Claim, Cost, TurnSnapshot};
use crate::prompts::{OUTPUT_PROMPT, REPORT_SCHEMA};

/// A claim in final ranking order with its citation numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedClaim {
    /// Claim identifier.
    pub id: String,
    /// Claim text.
    pub statement: String,
    /// Claim confidence.
    pub confidence: f64,
    /// True when the claim is still disputed.
    pub conflict: bool,
    /// 1-based indexes into [`FinalSynthesis::sources`].
    pub citations: Vec<usize>,
}

/// A numbered citation source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Citation number used in the report.
    pub number: usize,
    /// Evidence identifier.
    pub evidence_id: String,
    /// Source locator.
    pub locator: String,
}

/// Deterministic end-of-turn digest of the active claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSynthesis {
    /// The Turn's question.
    pub query: String,
    /// Active claims, strongest first.
    pub claims: Vec<RankedClaim>,
    /// Cited sources in citation order.
    pub sources: Vec<SourceRef>,
}

impl FinalSynthesis {
    /// True when no claims were established.
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Number of disputed claims.
    pub fn unresolved_conflicts(&self) -> usize {
        self.claims.iter().filter(|c| c.conflict).count()
    }
}

/// Rank active claims by confidence (ties keep creation order) and number
/// their sources in order of first citation.
pub fn final_synthesis(snapshot: &TurnSnapshot) -> FinalSynthesis {
    let mut active: Vec<&Claim> = snapshot.active_claims().collect();
    active.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let locators = snapshot.evidence_locators();
    let mut numbers: HashMap<String, usize> = HashMap::new();
    let mut sources = Vec::new();

    let claims = active
        .into_iter()
        .map(|claim| {
            let citations = claim
                .support
                .iter()
                .filter_map(|evidence_id| {
                    if let Some(number) = numbers.get(evidence_id) {
                        return Some(*number);
                    }
                    let locator = locators.get(evidence_id)?;
                    let number = sources.len() + 1;
                    numbers.insert(evidence_id.clone(), number);
                    sources.push(SourceRef {
                        number,
                        evidence_id: evidence_id.clone(),
                        locator: locator.clone(),
                    });
                    Some(number)
                })
                .collect();
            RankedClaim {
                id: claim.id.clone(),
                statement: claim.statement.clone(),
                confidence: claim.confidence,
                conflict: claim.conflict,
                citations,
            }
        })
        .collect();

    FinalSynthesis {
        query: snapshot.query().to_string(),
        claims,
        sources,
    }
}

/// Markdown report built without the reasoning backend.
pub fn render_local_report(synthesis: &FinalSynthesis, cause: &str) -> String {
    let mut report = format!("# {}\n\n", synthesis.query);

    if synthesis.is_empty() {
        report.push_str("No supported findings were established.\n");
    } else {
        report.push_str("## Findings\n\n");
        for (i, claim) in synthesis.claims.iter().enumerate() {
            let cites: String = claim.citations.iter().map(|n| format!("[{}]", n)).collect();
            let _ = writeln!(
                report,
                "{}. {} (confidence {:.2}){}{}",
                i + 1,
                claim.statement,
                claim.confidence,
                if cites.is_empty() { "" } else { " " },
                cites
            );
        }
        let unresolved = synthesis.unresolved_conflicts();
        if unresolved > 0 {
            let _ = write!(
                report,
                "\n_{} finding(s) remain disputed by other evidence._\n",
                unresolved
            );
        }
        report.push_str("\n## Sources\n\n");
        for source in &synthesis.sources {
            let _ = writeln!(report, "[{}] {}", source.number, source.locator);
        }
    }

    let _ = write!(report, "\n_Research ended: {}._\n", cause);
    report
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    report: String,
}

/// Final report generation via the reasoning backend.
pub struct OutputExecutor {
    backend: Arc<dyn ReasoningBackend>,
    timeout_ms: u64,
}

impl OutputExecutor {
    /// Create an output executor.
    pub fn new(backend: Arc<dyn ReasoningBackend>, config: &ResearchConfig) -> Self {
        Self {
            backend,
            timeout_ms: config.action_timeout_ms,
        }
    }

    /// Ask the backend to write the report from the ranked claims.
    pub async fn execute(&self, synthesis: &FinalSynthesis, cost: &mut Cost) -> ResearchResult<String> {
        let start = Instant::now();
        let request = CompletionRequest::new(
            REPORT_SCHEMA,
            vec![
                Message::system(OUTPUT_PROMPT),
                Message::user(format!(
                    "Question: {}\n\nClaims (strongest first):\n{}\n\nSources:\n{}",
                    synthesis.query,
                    to_prompt_json(&synthesis.claims),
                    to_prompt_json(&synthesis.sources)
                )),
            ],
        )
        .with_temperature(0.4);

        let response: ReportResponse =
            complete_structured(self.backend.as_ref(), request, self.timeout_ms, cost).await?;
        if response.report.trim().is_empty() {
            return Err(ResearchError::MalformedResponse {
                message: format!("{}: empty report", REPORT_SCHEMA),
            });
        }

        info!(
            claims = synthesis.claims.len(),
            report_chars = response.report.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Report generated"
        );
        Ok(response.report)
    }
}
