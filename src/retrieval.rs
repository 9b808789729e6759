//! Retrieval (RAG) and search (WEB) collaborators.
//!
//! Real and simulated backends share one confidence contract: scores are
//! clamped to [0, 1] and a missing score becomes [`DEFAULT_CONFIDENCE`].
//! Result lists are truncated to the requested size.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ResearchResult;
use crate::llm::{parse_structured, CompletionRequest, Message, ReasoningBackend};
use crate::prompts::{EVIDENCE_SCHEMA, RAG_SIMULATION_PROMPT, WEB_SIMULATION_PROMPT};

/// Confidence assumed when a backend does not report one.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Normalize a backend-reported confidence.
pub fn normalize_confidence(raw: Option<f64>) -> f64 {
    match raw {
        Some(value) if value.is_finite() => value.clamp(0.0, 1.0),
        _ => DEFAULT_CONFIDENCE,
    }
}

/// Knowledge-base query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    /// Query text.
    pub text: String,
    /// Maximum results.
    pub top_k: usize,
}

/// One knowledge-base hit, most relevant first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    /// Excerpt text.
    pub content: String,
    /// Knowledge-base reference.
    pub locator: String,
    /// Relevance confidence (0.0-1.0).
    pub confidence: f64,
    /// Publication date, when known.
    pub published: Option<String>,
}

/// Freshness hints for web search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Restrict results to a recent window, e.g. "year".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<String>,
    /// Prefer the newest results.
    #[serde(default)]
    pub sort_by_date: bool,
}

impl SearchParams {
    /// Restrict to the last six months, newest first
    pub fn recent() -> Self {
        Self {
            time_range: Some("last_6_months".to_string()),
            sort_by_date: true,
        }
    }
}

/// Web search query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Query text.
    pub text: String,
    /// Maximum results.
    pub num_results: usize,
    /// Freshness hints.
    #[serde(default)]
    pub params: SearchParams,
}

/// One web hit, most relevant first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Result snippet.
    pub snippet: String,
    /// Result URL.
    pub url: String,
    /// Relevance confidence (0.0-1.0).
    pub confidence: f64,
    /// Publication date, when known.
    pub published: Option<String>,
}

/// Knowledge-base retrieval backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `top_k` passages relevant to the query.
    async fn retrieve(&self, query: &RetrievalQuery) -> ResearchResult<Vec<RetrievedItem>>;
}

/// Web search backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Up to `num_results` hits, honoring the freshness hints where possible.
    async fn search(&self, query: &SearchQuery) -> ResearchResult<Vec<SearchHit>>;
}

#[derive(Debug, Deserialize)]
struct SimulatedResults {
    #[serde(default)]
    results: Vec<SimulatedResult>,
}

#[derive(Debug, Deserialize)]
struct SimulatedResult {
    content: String,
    locator: String,
    #[serde(default)]
    published: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

async fn simulate(
    backend: &dyn ReasoningBackend,
    system_prompt: &'static str,
    user_prompt: String,
    limit: usize,
) -> ResearchResult<Vec<SimulatedResult>> {
    let request = CompletionRequest::new(
        EVIDENCE_SCHEMA,
        vec![Message::system(system_prompt), Message::user(user_prompt)],
    )
    .with_temperature(0.8);

    let completion = backend.complete(request).await?;
    let parsed: SimulatedResults = parse_structured(&completion.text, EVIDENCE_SCHEMA)?;
    let mut results = parsed.results;
    results.retain(|r| !r.content.trim().is_empty());
    results.truncate(limit);
    Ok(results)
}

/// Knowledge-base retriever whose results are generated by the reasoning backend.
pub struct SimulatedRetriever {
    backend: Arc<dyn ReasoningBackend>,
}

impl SimulatedRetriever {
    /// Create a retriever backed by the reasoning backend.
    pub fn new(backend: Arc<dyn ReasoningBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Retriever for SimulatedRetriever {
    async fn retrieve(&self, query: &RetrievalQuery) -> ResearchResult<Vec<RetrievedItem>> {
        let prompt = format!(
            "Produce {} knowledge-base excerpts for the query.\n\nquery: {}",
            query.top_k, query.text
        );
        let results = simulate(
            self.backend.as_ref(),
            RAG_SIMULATION_PROMPT,
            prompt,
            query.top_k,
        )
        .await?;
        debug!(query = %query.text, results = results.len(), "Simulated retrieval");

        Ok(results
            .into_iter()
            .map(|r| RetrievedItem {
                content: r.content,
                locator: r.locator,
                confidence: normalize_confidence(r.confidence),
                published: r.published,
            })
            .collect())
    }
}

/// Web search whose results are generated by the reasoning backend.
pub struct SimulatedSearch {
    backend: Arc<dyn ReasoningBackend>,
}

impl SimulatedSearch {
    /// Create a search backend backed by the reasoning backend.
    pub fn new(backend: Arc<dyn ReasoningBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl SearchBackend for SimulatedSearch {
    async fn search(&self, query: &SearchQuery) -> ResearchResult<Vec<SearchHit>> {
        let mut prompt = format!(
            "Produce {} web search results for the query.\n\nquery: {}",
            query.num_results, query.text
        );
        if let Some(range) = &query.params.time_range {
            prompt.push_str(&format!("\ntime range: {}", range));
        }
        if query.params.sort_by_date {
            prompt.push_str("\nsort by date: yes");
        }

        let results = simulate(
            self.backend.as_ref(),
            WEB_SIMULATION_PROMPT,
            prompt,
            query.num_results,
        )
        .await?;
        debug!(query = %query.text, results = results.len(), "Simulated search");

        Ok(results
            .into_iter()
            .map(|r| SearchHit {
                snippet: r.content,
                url: r.locator,
                confidence: normalize_confidence(r.confidence),
                published: r.published,
            })
            .collect())
    }
}
