//! Centralized prompt definitions for the research loop
//!
//! Every prompt demands JSON-only output matching one named schema. The
//! schema names double as the `CompletionRequest::schema` tag so fakes and
//! logs can tell calls apart.

use crate::memory::PriorTurn;

/// Schema tag for plan generation.
pub const PLAN_SCHEMA: &str = "plan";
/// Schema tag for claim synthesis.
pub const CLAIMS_SCHEMA: &str = "claims";
/// Schema tag for conflict verification queries.
pub const RESOLUTION_PLAN_SCHEMA: &str = "resolution_plan";
/// Schema tag for conflict adjudication.
pub const ADJUDICATION_SCHEMA: &str = "adjudication";
/// Schema tag for the final report.
pub const REPORT_SCHEMA: &str = "report";
/// Schema tag for simulated retrieval results.
pub const EVIDENCE_SCHEMA: &str = "evidence";

/// System prompt for research planning.
pub const PLANNER_PROMPT: &str = r#"You are a research planner. Break the user's question into 1-5 executable research steps.

Your response MUST be valid JSON in this exact format:
{
  "steps": [
    {
      "goal": "what this step establishes",
      "kind": "RAG",
      "query": "the retrieval query to run",
      "aspects": ["aspect covered by this step"],
      "done_criteria": "how to tell the step is complete",
      "priority": 1
    }
  ]
}

Guidelines:
- kind is "RAG" for internal knowledge-base lookups and "WEB" for public or recent information
- Lower priority numbers run first
- Each step must be answerable by a single retrieval query
- Use the previous turns, when given, to avoid repeating settled findings

Always respond with valid JSON only, no other text."#;

/// System prompt for turning evidence into claims.
pub const SYNTHESIS_PROMPT: &str = r#"You are a research assistant. Summarize objective claims strictly supported by the given evidence. Never speculate beyond it.

Your response MUST be valid JSON in this exact format:
{
  "claims": [
    {
      "ref": "n1",
      "text": "the claim",
      "support_ids": ["RAG_1"],
      "aspects": ["aspect"],
      "confidence": 0.7,
      "conflicts_with": ["existing claim id or ref of another claim in this response"]
    }
  ]
}

Guidelines:
- support_ids must only reference evidence ids listed in the input
- Every claim needs at least one support id
- Restate an existing claim word for word only to cite additional evidence for it
- confidence must be between 0.0 and 1.0
- ref is a short label unique within this response
- conflicts_with lists the existing claim ids or refs of claims in this response that the claim contradicts, or is empty

Always respond with valid JSON only, no other text."#;

/// System prompt for planning verification of conflicting claims.
pub const RESOLUTION_PLAN_PROMPT: &str = r#"You are a fact-checking planner. Given conflicting claims, propose targeted queries that would settle the disagreement.

Your response MUST be valid JSON in this exact format:
{
  "queries": [
    {"kind": "WEB", "query": "verification query"}
  ],
  "rubric": "how to judge which claim is right"
}

Guidelines:
- Propose at most 2 queries
- kind is "RAG" or "WEB"
- Prefer authoritative and recent sources for the rubric

Always respond with valid JSON only, no other text."#;

/// System prompt for adjudicating conflicting claims.
pub const ADJUDICATION_PROMPT: &str = r#"You are a fact-checking judge. Decide each conflicting claim against the evidence and the rubric.

Your response MUST be valid JSON in this exact format:
{
  "updated_claims": [
    {
      "claim_id": "id of the conflicting claim",
      "action": "upheld",
      "new_text": "replacement text when revised",
      "new_confidence": 0.8,
      "evidence_ids": ["WEB_3"],
      "rationale": "one sentence"
    }
  ]
}

Guidelines:
- action is one of "upheld", "revised", "retracted"
- new_text is required only when the action is "revised"
- evidence_ids must reference evidence ids listed in the input
- Decide every conflicting claim

Always respond with valid JSON only, no other text."#;

/// System prompt for the final report.
pub const OUTPUT_PROMPT: &str = r#"You are a research writer. Write the final answer to the user's question using only the given claims.

Your response MUST be valid JSON in this exact format:
{
  "report": "markdown answer with numbered citations like [1]"
}

Guidelines:
- Lead with a direct answer, then the supporting findings
- Cite evidence with numbered references that map to the given sources
- Mention unresolved uncertainty plainly
- End with a "Sources" list of the cited locators

Always respond with valid JSON only, no other text."#;

/// System prompt for simulated knowledge-base retrieval.
pub const RAG_SIMULATION_PROMPT: &str = r#"You simulate an internal knowledge-base retriever. Produce realistic, specific document excerpts relevant to the query.

Your response MUST be valid JSON in this exact format:
{
  "results": [
    {
      "content": "100-200 words of specific, informative text",
      "locator": "https://kb.local/doc/1",
      "published": "2024-12",
      "confidence": 0.8
    }
  ]
}

Guidelines:
- locator always uses the kb.local domain
- published is a recent YYYY-MM month
- confidence between 0.0 and 1.0 reflects how relevant the excerpt is

Always respond with valid JSON only, no other text."#;

/// System prompt for simulated web search.
pub const WEB_SIMULATION_PROMPT: &str = r#"You simulate a web search engine. Produce realistic, specific search result snippets relevant to the query.

Your response MUST be valid JSON in this exact format:
{
  "results": [
    {
      "content": "100-200 words of specific, informative text",
      "locator": "https://example.com/article",
      "published": "2025-01",
      "confidence": 0.7
    }
  ]
}

Guidelines:
- Choose plausible domains (official, media, academic) for the topic
- published must respect any requested time range
- confidence between 0.0 and 1.0 reflects source reliability

Always respond with valid JSON only, no other text."#;

/// Render earlier turns of the session for a user prompt.
pub(crate) fn format_previous_context(context: &[PriorTurn]) -> String {
    if context.is_empty() {
        return "(none)".to_string();
    }
    context
        .iter()
        .map(|turn| {
            if turn.key_claims.is_empty() {
                format!("- {}: no findings", turn.query)
            } else {
                format!("- {}: {}", turn.query, turn.key_claims.join("; "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
