//! Action executors.
//!
//! Each executor performs one kind of Action: it calls an external
//! collaborator, translates the raw result into Evidence or Claims through
//! the [`MemoryStore`], and returns a serializable payload for the Action
//! record. Collaborator cost is accumulated into a caller-owned [`Cost`] so a
//! failed Action still reports what it spent.

mod output;
mod resolve;
mod retrieve;
mod search;
mod synthesize;

pub use output::{final_synthesis, render_local_report, FinalSynthesis, OutputExecutor, RankedClaim, SourceRef};
pub use resolve::{ResolutionOutcome, ResolveExecutor};
pub use retrieve::{RetrievalOutcome, RetrieveExecutor};
pub use search::SearchExecutor;
pub use synthesize::{SynthesisOutcome, SynthesizeExecutor};

use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{ResearchError, ResearchResult};
use crate::llm::{parse_structured, CompletionRequest, ReasoningBackend};
use crate::memory::{ActionHandle, Cost, MemoryStore, NewEvidence};

/// Await a collaborator call bounded by `timeout_ms`.
///
/// The call is charged to `cost` whether it succeeds, fails or times out.
pub(crate) async fn call_with_timeout<T, F>(
    collaborator: &str,
    timeout_ms: u64,
    cost: &mut Cost,
    call: F,
) -> ResearchResult<T>
where
    F: Future<Output = ResearchResult<T>>,
{
    let start = Instant::now();
    let result = tokio::time::timeout(Duration::from_millis(timeout_ms), call).await;
    cost.add(Cost::call(0, start.elapsed().as_millis() as u64));

    match result {
        Ok(inner) => inner,
        Err(_) => Err(ResearchError::CollaboratorTimeout {
            collaborator: collaborator.to_string(),
            timeout_ms,
        }),
    }
}

/// Run one reasoning-backend call and parse its structured output.
pub(crate) async fn complete_structured<T: DeserializeOwned>(
    backend: &dyn ReasoningBackend,
    request: CompletionRequest,
    timeout_ms: u64,
    cost: &mut Cost,
) -> ResearchResult<T> {
    let schema = request.schema;
    let completion = call_with_timeout("reasoning backend", timeout_ms, cost, async {
        backend.complete(request).await.map_err(ResearchError::from)
    })
    .await?;
    cost.tokens += completion.total_tokens();
    parse_structured(&completion.text, schema)
}

/// Evidence ids produced by one batch of retrieval results.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct StoredEvidence {
    pub created: Vec<String>,
    pub duplicates: Vec<String>,
    pub dropped: usize,
}

/// Add a batch of evidence to the Action's Turn, honoring the per-Turn cap.
///
/// Items past the cap are dropped with a warning rather than failing the Action.
pub(crate) async fn store_evidence(
    store: &MemoryStore,
    handle: &ActionHandle,
    items: Vec<NewEvidence>,
) -> ResearchResult<StoredEvidence> {
    let snapshot = store.snapshot(&handle.turn_id).await?;
    let mut known: HashSet<String> = snapshot.evidence().iter().map(|e| e.id.clone()).collect();
    let mut stored = StoredEvidence::default();

    for mut item in items {
        if known.len() >= store.max_evidence() {
            stored.dropped += 1;
            continue;
        }
        item.action_id = Some(handle.action_id.clone());
        let id = store.add_evidence(&handle.turn_id, item).await?;
        if known.insert(id.clone()) {
            stored.created.push(id);
        } else if !stored.duplicates.contains(&id) {
            stored.duplicates.push(id);
        }
    }

    if stored.dropped > 0 {
        warn!(
            turn_id = %handle.turn_id,
            action_id = %handle.action_id,
            dropped = stored.dropped,
            limit = store.max_evidence(),
            "Evidence limit reached, dropping results"
        );
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Completion, MockReasoningBackend};
    use crate::config::ResearchConfig;
    use crate::memory::{ActionKind, ConfigSnapshot, SourceKind};
    use crate::observability::EventBus;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Echo {
        value: u32,
    }

    fn evidence(n: usize) -> NewEvidence {
        NewEvidence {
            source: SourceKind::Web,
            locator: format!("https://example.com/{}", n),
            content: format!("content {}", n),
            confidence: 0.6,
            published: None,
            action_id: None,
        }
    }

    #[tokio::test]
    async fn test_call_with_timeout_charges_timed_out_calls() {
        let mut cost = Cost::default();
        let result: ResearchResult<()> = call_with_timeout("retriever", 10, &mut cost, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(ResearchError::CollaboratorTimeout { timeout_ms: 10, .. })
        ));
        assert_eq!(cost.calls, 1);
    }

    #[tokio::test]
    async fn test_complete_structured_counts_tokens() {
        let mut mock = MockReasoningBackend::new();
        mock.expect_complete().returning(|_| {
            let mut completion = Completion::text(r#"{"value": 7}"#);
            completion.usage = Some(crate::llm::Usage {
                prompt_tokens: Some(10),
                completion_tokens: Some(5),
                total_tokens: Some(15),
            });
            Ok(completion)
        });

        let mut cost = Cost::default();
        let echo: Echo = complete_structured(
            &mock,
            CompletionRequest::new("echo", vec![]),
            1_000,
            &mut cost,
        )
        .await
        .unwrap();

        assert_eq!(echo.value, 7);
        assert_eq!(cost.calls, 1);
        assert_eq!(cost.tokens, 15);
    }

    #[tokio::test]
    async fn test_store_evidence_dedupes_and_caps() {
        let store = MemoryStore::new(EventBus::default(), 3);
        let session = store
            .create_session(ConfigSnapshot::from(&ResearchConfig::default()))
            .await;
        let turn = store.start_turn(&session.id, "q").await.unwrap();
        let handle = store
            .record_action(&turn.id, None, ActionKind::ResolveConflict, json!({}))
            .await
            .unwrap();

        let first = store_evidence(&store, &handle, vec![evidence(1), evidence(1), evidence(2)])
            .await
            .unwrap();
        assert_eq!(first.created.len(), 2);
        assert_eq!(first.duplicates.len(), 1);

        let second = store_evidence(&store, &handle, vec![evidence(3), evidence(4), evidence(5)])
            .await
            .unwrap();
        assert_eq!(second.created.len(), 1);
        assert_eq!(second.dropped, 2);

        let snapshot = store.snapshot(&turn.id).await.unwrap();
        assert_eq!(snapshot.evidence().len(), 3);
        assert!(snapshot
            .evidence()
            .iter()
            .all(|e| e.action_id.as_deref() == Some(handle.action_id.as_str())));
    }
}
