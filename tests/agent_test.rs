//! End-to-end tests for the research loop.
//!
//! The reasoning backend is scripted per response schema and the retrieval
//! collaborators are in-process fakes, so every scenario is deterministic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use deep_research::agent::Agent;
use deep_research::config::ResearchConfig;
use deep_research::error::{AppError, BackendError, BackendResult, ResearchError, ResearchResult};
use deep_research::llm::{Completion, CompletionRequest, ReasoningBackend};
use deep_research::memory::{
    replay_lineage, ActionKind, ActionStatus, MemoryStore, StepStatus, TurnStatus,
};
use deep_research::observability::EventBus;
use deep_research::prompts::{
    ADJUDICATION_SCHEMA, CLAIMS_SCHEMA, PLAN_SCHEMA, REPORT_SCHEMA, RESOLUTION_PLAN_SCHEMA,
};
use deep_research::retrieval::{
    RetrievalQuery, RetrievedItem, Retriever, SearchBackend, SearchHit, SearchQuery,
};
use deep_research::storage::{ArchiveStorage, SqliteStorage};

// ============================================================================
// Test collaborators
// ============================================================================

type Handler = Box<dyn Fn(&str) -> BackendResult<Completion> + Send + Sync>;

/// Backend answering each schema with a fixed handler over the user prompt.
#[derive(Default)]
struct ScriptedBackend {
    handlers: HashMap<&'static str, Handler>,
    requests: Mutex<Vec<(String, String)>>,
}

impl ScriptedBackend {
    fn on(
        mut self,
        schema: &'static str,
        handler: impl Fn(&str) -> BackendResult<Completion> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(schema, Box::new(handler));
        self
    }

    fn prompts_for(&self, schema: &str) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == schema)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    async fn complete(&self, request: CompletionRequest) -> BackendResult<Completion> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.requests
            .lock()
            .unwrap()
            .push((request.schema.to_string(), prompt.clone()));

        match self.handlers.get(request.schema) {
            Some(handler) => handler(&prompt),
            None => Err(BackendError::InvalidResponse {
                message: format!("no script for schema '{}'", request.schema),
            }),
        }
    }
}

#[derive(Clone, Copy)]
enum Reply {
    Items,
    Fail,
    Hang,
}

/// Retriever producing two fresh items per call, keyed by the query text.
struct FakeRetriever {
    reply: Box<dyn Fn(&str) -> Reply + Send + Sync>,
    calls: AtomicUsize,
}

impl FakeRetriever {
    fn new(reply: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            reply: Box::new(reply),
            calls: AtomicUsize::new(0),
        }
    }

    fn answering() -> Self {
        Self::new(|_| Reply::Items)
    }
}

#[async_trait]
impl Retriever for FakeRetriever {
    async fn retrieve(&self, query: &RetrievalQuery) -> ResearchResult<Vec<RetrievedItem>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match (self.reply)(&query.text) {
            Reply::Items => Ok((0..2)
                .map(|i| RetrievedItem {
                    content: format!("{} excerpt {}-{}", query.text, call, i),
                    locator: format!("kb://{}/{}-{}", query.text.replace(' ', "-"), call, i),
                    confidence: 0.9,
                    published: Some(today()),
                })
                .collect()),
            Reply::Fail => Err(ResearchError::MalformedResponse {
                message: "retriever returned garbage".to_string(),
            }),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Vec::new())
            }
        }
    }
}

/// Search backend recording the freshness hints it receives.
#[derive(Default)]
struct FakeSearch {
    queries: Mutex<Vec<SearchQuery>>,
}

#[async_trait]
impl SearchBackend for FakeSearch {
    async fn search(&self, query: &SearchQuery) -> ResearchResult<Vec<SearchHit>> {
        let n = {
            let mut queries = self.queries.lock().unwrap();
            queries.push(query.clone());
            queries.len()
        };
        Ok(vec![SearchHit {
            snippet: format!("{} news {}", query.text, n),
            url: format!("https://news.example.com/{}", n),
            confidence: 0.8,
            published: Some(today()),
        }])
    }
}

// ============================================================================
// Scripts
// ============================================================================

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

fn reply(body: Value) -> BackendResult<Completion> {
    Ok(Completion::text(body.to_string()))
}

/// JSON array printed after `marker` in a prompt, up to the next blank line section.
fn section(prompt: &str, marker: &str) -> Vec<Value> {
    prompt
        .split(marker)
        .nth(1)
        .map(|rest| rest.split("\n\n").next().unwrap_or(rest))
        .and_then(|json| serde_json::from_str::<Vec<Value>>(json).ok())
        .unwrap_or_default()
}

fn ids(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .filter_map(|v| v["id"].as_str().map(str::to_string))
        .collect()
}

fn plan_of(steps: Value) -> impl Fn(&str) -> BackendResult<Completion> + Send + Sync {
    move |_: &str| reply(json!({ "steps": steps }))
}

/// One claim per synthesis, supported by all offered evidence.
fn claims_with_confidence(confidence: f64) -> impl Fn(&str) -> BackendResult<Completion> + Send + Sync {
    move |prompt: &str| {
        let evidence = ids(&section(prompt, "Evidence:\n"));
        let first = evidence.first().cloned().unwrap_or_default();
        reply(json!({"claims": [{
            "text": format!("Finding backed by {}", first),
            "support_ids": evidence,
            "confidence": confidence,
        }]}))
    }
}

fn report(_: &str) -> BackendResult<Completion> {
    reply(json!({"report": "# Final report\n\nBatteries degrade slowly."}))
}

fn config() -> ResearchConfig {
    ResearchConfig {
        action_timeout_ms: 1_000,
        ..ResearchConfig::default()
    }
}

struct Harness {
    agent: Agent,
    backend: Arc<ScriptedBackend>,
    search: Arc<FakeSearch>,
}

fn harness(backend: ScriptedBackend, retriever: FakeRetriever, config: ResearchConfig) -> Harness {
    let backend = Arc::new(backend);
    let search = Arc::new(FakeSearch::default());
    let store = Arc::new(MemoryStore::new(EventBus::default(), config.max_evidence));
    let agent = Agent::new(
        store,
        backend.clone(),
        Arc::new(retriever),
        search.clone(),
        config,
    )
    .expect("valid config");
    Harness {
        agent,
        backend,
        search,
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_turn_completes_when_verdict_passes() {
    let backend = ScriptedBackend::default()
        .on(PLAN_SCHEMA, plan_of(json!([
            {"goal": "Battery lifetime", "kind": "RAG", "query": "battery lifetime"}
        ])))
        .on(CLAIMS_SCHEMA, claims_with_confidence(0.9))
        .on(REPORT_SCHEMA, report);
    let h = harness(backend, FakeRetriever::answering(), config());

    let session = h.agent.start_session().await.unwrap();
    let result = h
        .agent
        .run_turn(&session.id, "How long do batteries last?", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, TurnStatus::Complete);
    assert_eq!(result.cause, "verdict passed");
    assert_eq!(result.loops, 1);
    assert_eq!(result.cost.calls, 4);
    assert!(result.report.starts_with("# Final report"));
    assert!(result.summary.contains("Finding backed by"));

    let snapshot = h.agent.store().snapshot(&result.turn_id).await.unwrap();
    let kinds: Vec<ActionKind> = snapshot.actions().iter().map(|a| a.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ActionKind::Plan,
            ActionKind::Retrieve,
            ActionKind::Synthesize,
            ActionKind::Output
        ]
    );
    assert!(snapshot.actions().iter().all(|a| a.status == ActionStatus::Ok));
    assert_eq!(snapshot.status(), TurnStatus::Complete);
}

#[tokio::test]
async fn test_loop_count_never_exceeds_bound() {
    let steps: Vec<Value> = (0..5)
        .map(|i| json!({"goal": format!("aspect {}", i), "kind": "RAG", "query": format!("topic {}", i)}))
        .collect();
    let backend = ScriptedBackend::default()
        .on(PLAN_SCHEMA, plan_of(json!(steps)))
        .on(CLAIMS_SCHEMA, claims_with_confidence(0.2))
        .on(REPORT_SCHEMA, report);
    let h = harness(
        backend,
        FakeRetriever::answering(),
        ResearchConfig {
            max_loops_per_turn: 3,
            ..config()
        },
    );

    let session = h.agent.start_session().await.unwrap();
    let result = h
        .agent
        .run_turn(&session.id, "Survey the topics", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.loops, 3);
    assert_eq!(result.cause, "max loops reached");
    assert_eq!(result.status, TurnStatus::Complete);

    let snapshot = h.agent.store().snapshot(&result.turn_id).await.unwrap();
    let retrievals = snapshot
        .actions()
        .iter()
        .filter(|a| a.kind == ActionKind::Retrieve)
        .count();
    assert_eq!(retrievals, 3);
    let pending = snapshot
        .steps()
        .filter(|s| s.status == StepStatus::Pending)
        .count();
    assert_eq!(pending, 2);
}

#[tokio::test]
async fn test_budget_ceiling_bounds_cost() {
    let steps: Vec<Value> = (0..3)
        .map(|i| json!({"goal": format!("g{}", i), "kind": "RAG", "query": format!("q{}", i)}))
        .collect();
    let backend = ScriptedBackend::default()
        .on(PLAN_SCHEMA, plan_of(json!(steps)))
        .on(CLAIMS_SCHEMA, claims_with_confidence(0.2))
        .on(REPORT_SCHEMA, report);
    let h = harness(
        backend,
        FakeRetriever::answering(),
        ResearchConfig {
            cost_ceiling: 3,
            ..config()
        },
    );

    let session = h.agent.start_session().await.unwrap();
    let result = h
        .agent
        .run_turn(&session.id, "Expensive question", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, TurnStatus::Complete);
    assert_eq!(result.cause, "budget exhausted");
    assert!(result.cost.calls <= 3 + 1);
    // No backend call is spent on the report once the budget is gone
    assert!(h.backend.prompts_for(REPORT_SCHEMA).is_empty());
    assert!(result.report.contains("## Findings"));
    assert!(result.report.contains("_Research ended: budget exhausted._"));
}

#[tokio::test]
async fn test_synthesis_skipped_when_budget_runs_out_mid_step() {
    let backend = ScriptedBackend::default()
        .on(PLAN_SCHEMA, plan_of(json!([{"goal": "g", "kind": "RAG", "query": "q"}])))
        .on(CLAIMS_SCHEMA, claims_with_confidence(0.9))
        .on(REPORT_SCHEMA, report);
    let h = harness(
        backend,
        FakeRetriever::answering(),
        ResearchConfig {
            cost_ceiling: 2,
            ..config()
        },
    );

    let session = h.agent.start_session().await.unwrap();
    let result = h
        .agent
        .run_turn(&session.id, "q", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.cost.calls, 2);
    assert!(h.backend.prompts_for(CLAIMS_SCHEMA).is_empty());
    assert_eq!(result.status, TurnStatus::Complete);
    assert!(result.report.contains("No supported findings were established."));

    let snapshot = h.agent.store().snapshot(&result.turn_id).await.unwrap();
    let step = snapshot.steps().next().unwrap();
    assert_eq!(step.status, StepStatus::InProgress);
}

#[tokio::test]
async fn test_timed_out_step_is_skipped_after_retry_limit() {
    let backend = ScriptedBackend::default()
        .on(PLAN_SCHEMA, plan_of(json!([
            {"goal": "slow source", "kind": "RAG", "query": "slow", "priority": 1},
            {"goal": "fast source", "kind": "RAG", "query": "fast", "priority": 2}
        ])))
        .on(CLAIMS_SCHEMA, claims_with_confidence(0.9))
        .on(REPORT_SCHEMA, report);
    let retriever = FakeRetriever::new(|query| {
        if query == "slow" {
            Reply::Hang
        } else {
            Reply::Items
        }
    });
    let h = harness(
        backend,
        retriever,
        ResearchConfig {
            action_timeout_ms: 50,
            retry_limit: 2,
            ..ResearchConfig::default()
        },
    );

    let session = h.agent.start_session().await.unwrap();
    let result = h
        .agent
        .run_turn(&session.id, "mixed sources", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, TurnStatus::Complete);
    assert_eq!(result.cause, "no actionable steps remain");

    let snapshot = h.agent.store().snapshot(&result.turn_id).await.unwrap();
    let slow = snapshot.steps().find(|s| s.query == "slow").unwrap();
    let fast = snapshot.steps().find(|s| s.query == "fast").unwrap();
    assert_eq!(slow.status, StepStatus::Skipped);
    assert_eq!(fast.status, StepStatus::Done);

    let failures: Vec<_> = snapshot
        .actions()
        .iter()
        .filter(|a| a.step_id.as_deref() == Some(slow.id.as_str()))
        .collect();
    assert_eq!(failures.len(), 2);
    for action in failures {
        assert_eq!(action.status, ActionStatus::Error);
        assert_eq!(action.cost.calls, 1);
        let error = action.result.as_ref().unwrap()["error"].as_str().unwrap();
        assert!(error.contains("timed out"));
    }
    assert_eq!(snapshot.active_claims().count(), 1);
}

#[tokio::test]
async fn test_turn_fails_when_every_step_is_skipped() {
    let backend = ScriptedBackend::default()
        .on(PLAN_SCHEMA, plan_of(json!([{"goal": "g", "kind": "RAG", "query": "q"}])))
        .on(REPORT_SCHEMA, report);
    let h = harness(
        backend,
        FakeRetriever::new(|_| Reply::Fail),
        ResearchConfig {
            retry_limit: 1,
            ..config()
        },
    );

    let session = h.agent.start_session().await.unwrap();
    let result = h
        .agent
        .run_turn(&session.id, "unanswerable", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, TurnStatus::Failed);
    assert!(result.cause.starts_with("no actionable steps remain"));
    assert!(result.cause.contains("every step was skipped"));
    assert!(result.report.contains("No supported findings were established."));

    let snapshot = h.agent.store().snapshot(&result.turn_id).await.unwrap();
    assert!(snapshot.all_steps_skipped());
    let output = snapshot.actions().last().unwrap();
    assert_eq!(output.kind, ActionKind::Output);
    assert_eq!(output.result.as_ref().unwrap()["source"], "local");
}

#[tokio::test]
async fn test_conflict_resolved_before_further_work() {
    let claims = |prompt: &str| {
        let evidence = ids(&section(prompt, "Evidence:\n"));
        let existing = ids(&section(prompt, "Existing claims:\n"));
        let claim = match existing.first() {
            None => json!({"text": "Cells last ten years", "support_ids": evidence, "confidence": 0.9}),
            Some(other) => json!({
                "text": "Cells last five years",
                "support_ids": evidence,
                "confidence": 0.6,
                "conflicts_with": [other],
            }),
        };
        reply(json!({ "claims": [claim] }))
    };
    let adjudicate = |prompt: &str| {
        let conflicting = ids(&section(prompt, "Conflicting claims:\n"));
        reply(json!({"updated_claims": [
            {"claim_id": conflicting[0], "action": "upheld", "rationale": "more sources"},
            {"claim_id": conflicting[1], "action": "retracted", "rationale": "outdated"}
        ]}))
    };
    let backend = ScriptedBackend::default()
        .on(PLAN_SCHEMA, plan_of(json!([
            {"goal": "lab studies", "kind": "RAG", "query": "lab", "priority": 1},
            {"goal": "field reports", "kind": "RAG", "query": "field", "priority": 2}
        ])))
        .on(CLAIMS_SCHEMA, claims)
        .on(RESOLUTION_PLAN_SCHEMA, |_| {
            reply(json!({"queries": [], "rubric": "prefer larger samples"}))
        })
        .on(ADJUDICATION_SCHEMA, adjudicate)
        .on(REPORT_SCHEMA, report);
    let h = harness(backend, FakeRetriever::answering(), config());

    let session = h.agent.start_session().await.unwrap();
    let result = h
        .agent
        .run_turn(&session.id, "How long do cells last?", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, TurnStatus::Complete);
    assert_eq!(result.cause, "verdict passed");

    let snapshot = h.agent.store().snapshot(&result.turn_id).await.unwrap();
    let kinds: Vec<ActionKind> = snapshot.actions().iter().map(|a| a.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ActionKind::Plan,
            ActionKind::Retrieve,
            ActionKind::Synthesize,
            ActionKind::Retrieve,
            ActionKind::Synthesize,
            ActionKind::ResolveConflict,
            ActionKind::Output
        ]
    );

    let active: Vec<_> = snapshot.active_claims().collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].statement, "Cells last ten years");
    assert!(!active[0].conflict);
    assert!(snapshot.unresolved_conflicts().is_empty());

    // Lineage can be rebuilt from the action log alone
    let lineage = snapshot.lineage();
    assert_eq!(lineage.len(), 3);
    assert_eq!(replay_lineage(snapshot.actions()), lineage);
    assert!(lineage[1].retracted);
    assert_eq!(lineage[2].supersedes.as_deref(), Some(lineage[0].claim_id.as_str()));
}

#[tokio::test]
async fn test_cancelled_turn_still_reports() {
    let backend = ScriptedBackend::default()
        .on(PLAN_SCHEMA, plan_of(json!([{"goal": "g", "kind": "RAG", "query": "q"}])))
        .on(REPORT_SCHEMA, report);
    let h = harness(backend, FakeRetriever::answering(), config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let session = h.agent.start_session().await.unwrap();
    let result = h
        .agent
        .run_turn(&session.id, "never mind", &cancel)
        .await
        .unwrap();

    assert_eq!(result.status, TurnStatus::Complete);
    assert_eq!(result.cause, "cancelled");
    assert_eq!(result.loops, 0);
    assert!(result.report.contains("_Research ended: cancelled._"));

    let snapshot = h.agent.store().snapshot(&result.turn_id).await.unwrap();
    assert!(snapshot.steps().all(|s| s.status == StepStatus::Pending));
}

#[tokio::test]
async fn test_failed_planning_falls_back_to_single_step() {
    let backend = ScriptedBackend::default()
        .on(PLAN_SCHEMA, |_| Ok(Completion::text("I would start by reading.")))
        .on(CLAIMS_SCHEMA, claims_with_confidence(0.9))
        .on(REPORT_SCHEMA, report);
    let h = harness(backend, FakeRetriever::answering(), config());

    let session = h.agent.start_session().await.unwrap();
    let result = h
        .agent
        .run_turn(&session.id, "What is RISC-V?", &CancellationToken::new())
        .await
        .unwrap();

    let snapshot = h.agent.store().snapshot(&result.turn_id).await.unwrap();
    let plan_action = &snapshot.actions()[0];
    assert_eq!(plan_action.kind, ActionKind::Plan);
    assert_eq!(plan_action.status, ActionStatus::Error);

    let steps: Vec<_> = snapshot.steps().collect();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].goal, "Gather initial information");
    assert_eq!(steps[0].query, "What is RISC-V?");
    assert_eq!(result.status, TurnStatus::Complete);
}

#[tokio::test]
async fn test_web_step_requests_recent_results_when_recency_fails() {
    let backend = ScriptedBackend::default()
        .on(PLAN_SCHEMA, plan_of(json!([
            {"goal": "background", "kind": "RAG", "query": "background", "priority": 1},
            {"goal": "latest news", "kind": "WEB", "query": "news", "priority": 2}
        ])))
        .on(CLAIMS_SCHEMA, claims_with_confidence(0.9))
        .on(REPORT_SCHEMA, report);
    let h = harness(
        backend,
        FakeRetriever::new(|_| Reply::Items),
        ResearchConfig {
            // Same-day evidence still scores below an impossible bar
            thresholds: deep_research::config::Thresholds {
                recency: 1.0,
                ..Default::default()
            },
            recency_window_days: -1,
            ..config()
        },
    );

    let session = h.agent.start_session().await.unwrap();
    h.agent
        .run_turn(&session.id, "market update", &CancellationToken::new())
        .await
        .unwrap();

    let queries = h.search.queries.lock().unwrap();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].params.sort_by_date);
    assert_eq!(queries[0].params.time_range.as_deref(), Some("last_6_months"));
}

#[tokio::test]
async fn test_follow_up_turn_sees_previous_findings() {
    let backend = ScriptedBackend::default()
        .on(PLAN_SCHEMA, plan_of(json!([{"goal": "g", "kind": "RAG", "query": "q"}])))
        .on(CLAIMS_SCHEMA, claims_with_confidence(0.9))
        .on(REPORT_SCHEMA, report);
    let h = harness(backend, FakeRetriever::answering(), config());

    let session = h.agent.start_session().await.unwrap();
    let first = h
        .agent
        .run_turn(&session.id, "How do batteries age?", &CancellationToken::new())
        .await
        .unwrap();
    h.agent
        .run_turn(&session.id, "And in cold climates?", &CancellationToken::new())
        .await
        .unwrap();

    let plans = h.backend.prompts_for(PLAN_SCHEMA);
    assert_eq!(plans.len(), 2);
    assert!(plans[0].contains("(none)"));
    assert!(plans[1].contains("- How do batteries age?: Finding backed by"));

    let stored = h.agent.store().get_session(&session.id).await.unwrap();
    assert_eq!(stored.turn_ids.len(), 2);
    assert!(stored.archived_summary.contains("[How do batteries age?]"));
    assert!(stored.archived_summary.contains(&first.summary));
}

#[tokio::test]
async fn test_finished_turn_is_archived() {
    let backend = ScriptedBackend::default()
        .on(PLAN_SCHEMA, plan_of(json!([{"goal": "g", "kind": "RAG", "query": "q"}])))
        .on(CLAIMS_SCHEMA, claims_with_confidence(0.9))
        .on(REPORT_SCHEMA, report);
    let archive = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
    let h = harness(backend, FakeRetriever::answering(), config());
    let agent = h.agent.with_archive(archive.clone());

    let session = agent.start_session().await.unwrap();
    let result = agent
        .run_turn(&session.id, "Archive me", &CancellationToken::new())
        .await
        .unwrap();

    let stored = archive.get_session(&session.id).await.unwrap().unwrap();
    assert!(stored.archived_summary.contains("[Archive me]"));

    let turns = archive.list_turns(&session.id).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].id, result.turn_id);
    assert_eq!(turns[0].status, TurnStatus::Complete);
    assert_eq!(turns[0].report.as_deref(), Some(result.report.as_str()));

    let actions = archive.list_actions(&result.turn_id).await.unwrap();
    let snapshot = agent.store().snapshot(&result.turn_id).await.unwrap();
    assert_eq!(actions.len(), snapshot.actions().len());
    assert_eq!(actions[0].kind, ActionKind::Plan);
}

/// Backend that retracts the listed claims behind the synthesizer's back once.
struct RetractingBackend {
    inner: ScriptedBackend,
    store: OnceLock<Arc<MemoryStore>>,
    armed: AtomicBool,
}

#[async_trait]
impl ReasoningBackend for RetractingBackend {
    async fn complete(&self, request: CompletionRequest) -> BackendResult<Completion> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let existing = ids(&section(&prompt, "Existing claims:\n"));
        if request.schema == CLAIMS_SCHEMA
            && !existing.is_empty()
            && self.armed.swap(false, Ordering::SeqCst)
        {
            if let Some(store) = self.store.get() {
                for id in existing {
                    store.retract_claim(&id).await.unwrap();
                }
            }
        }
        self.inner.complete(request).await
    }
}

#[tokio::test]
async fn test_integrity_violation_fails_turn_and_session_continues() {
    // The same statement every time, so the second step's synthesis merges
    // into a claim that no longer exists.
    let inner = ScriptedBackend::default()
        .on(PLAN_SCHEMA, plan_of(json!([
            {"goal": "Causes", "kind": "RAG", "query": "coil frost"},
            {"goal": "Mitigation", "kind": "RAG", "query": "defrost cycle"}
        ])))
        .on(CLAIMS_SCHEMA, |prompt: &str| {
            reply(json!({"claims": [{
                "text": "Coils frost in humid cold air",
                "support_ids": ids(&section(prompt, "Evidence:\n")),
                "confidence": 0.3,
            }]}))
        })
        .on(REPORT_SCHEMA, report);
    let backend = Arc::new(RetractingBackend {
        inner,
        store: OnceLock::new(),
        armed: AtomicBool::new(true),
    });
    let config = config();
    let store = Arc::new(MemoryStore::new(EventBus::default(), config.max_evidence));
    let agent = Agent::new(
        store.clone(),
        backend.clone(),
        Arc::new(FakeRetriever::answering()),
        Arc::new(FakeSearch::default()),
        config,
    )
    .unwrap();
    let _ = backend.store.set(store.clone());

    let session = agent.start_session().await.unwrap();
    let failed = agent
        .run_turn(&session.id, "Why do heat pumps ice up?", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(failed.status, TurnStatus::Failed);
    assert!(failed.cause.starts_with("integrity violation: "), "{}", failed.cause);
    assert_eq!(failed.loops, 1);
    assert!(failed.report.contains("_Research ended: integrity violation: "));

    let snapshot = store.snapshot(&failed.turn_id).await.unwrap();
    assert!(snapshot
        .actions()
        .iter()
        .all(|a| a.status != ActionStatus::Running));
    let last_synthesis = snapshot
        .actions()
        .iter()
        .rev()
        .find(|a| a.kind == ActionKind::Synthesize)
        .unwrap();
    assert_eq!(last_synthesis.status, ActionStatus::Error);

    let next = agent
        .run_turn(&session.id, "How is defrost triggered?", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(next.status, TurnStatus::Complete);
    assert_eq!(
        agent.store().get_session(&session.id).await.unwrap().turn_ids.len(),
        2
    );
}

#[tokio::test]
async fn test_archived_session_resumes_in_new_process() {
    let script = || {
        ScriptedBackend::default()
            .on(PLAN_SCHEMA, plan_of(json!([{"goal": "g", "kind": "RAG", "query": "q"}])))
            .on(CLAIMS_SCHEMA, claims_with_confidence(0.9))
            .on(REPORT_SCHEMA, report)
    };
    let archive = Arc::new(SqliteStorage::new_in_memory().await.unwrap());

    let first = harness(script(), FakeRetriever::answering(), config());
    let first_agent = first.agent.with_archive(archive.clone());
    let session = first_agent.start_session().await.unwrap();
    first_agent
        .run_turn(&session.id, "Why do heat pumps ice up?", &CancellationToken::new())
        .await
        .unwrap();

    // A fresh store only knows the session through the archive
    let second = harness(script(), FakeRetriever::answering(), config());
    let backend = second.backend.clone();
    let second_agent = second.agent.with_archive(archive.clone());
    let resumed = second_agent.resume_session(&session.id).await.unwrap();
    assert_eq!(resumed.turn_ids.len(), 1);
    assert!(resumed.archived_summary.contains("[Why do heat pumps ice up?]"));

    second_agent
        .run_turn(&session.id, "How is defrost triggered?", &CancellationToken::new())
        .await
        .unwrap();
    let plans = backend.prompts_for(PLAN_SCHEMA);
    assert!(plans[0].contains("- Why do heat pumps ice up?:"));
    assert_eq!(archive.list_turns(&session.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_resume_unknown_session_fails() {
    let archive = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
    let h = harness(ScriptedBackend::default(), FakeRetriever::answering(), config());
    let agent = h.agent.with_archive(archive);

    let err = agent.resume_session("missing").await.unwrap_err();
    assert!(matches!(err, AppError::Research(ResearchError::NotFound { .. })));
}

#[test]
fn test_invalid_config_rejected_at_construction() {
    let store = Arc::new(MemoryStore::new(EventBus::default(), 10));
    let backend: Arc<ScriptedBackend> = Arc::new(ScriptedBackend::default());
    let result = Agent::new(
        store,
        backend,
        Arc::new(FakeRetriever::answering()),
        Arc::new(FakeSearch::default()),
        ResearchConfig {
            max_loops_per_turn: 0,
            ..ResearchConfig::default()
        },
    );

    assert!(matches!(result, Err(AppError::Config { .. })));
}
