use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use super::{call_with_timeout, store_evidence, RetrievalOutcome};
use crate::config::ResearchConfig;
use crate::error::ResearchResult;
use crate::memory::{ActionHandle, Cost, MemoryStore, NewEvidence, SourceKind, Step};
use crate::retrieval::{SearchBackend, SearchParams, SearchQuery};

/// Web search for a Step.
pub struct SearchExecutor {
    search: Arc<dyn SearchBackend>,
    num_results: usize,
    timeout_ms: u64,
}

impl SearchExecutor {
    /// Create a search executor.
    pub fn new(search: Arc<dyn SearchBackend>, config: &ResearchConfig) -> Self {
        Self {
            search,
            num_results: config.web_results,
            timeout_ms: config.action_timeout_ms,
        }
    }

    /// Search the web for the Step's seed query.
    ///
    /// `params` carries freshness hints, set when the last verdict failed on recency.
    pub async fn execute(
        &self,
        store: &MemoryStore,
        handle: &ActionHandle,
        step: &Step,
        params: SearchParams,
        cost: &mut Cost,
    ) -> ResearchResult<RetrievalOutcome> {
        let start = Instant::now();
        let query = SearchQuery {
            text: step.query.clone(),
            num_results: self.num_results,
            params,
        };

        let mut hits = call_with_timeout(
            "search backend",
            self.timeout_ms,
            cost,
            self.search.search(&query),
        )
        .await?;
        hits.truncate(self.num_results);

        let stored = store_evidence(
            store,
            handle,
            hits.into_iter()
                .map(|hit| NewEvidence {
                    source: SourceKind::Web,
                    locator: hit.url,
                    content: hit.snippet,
                    confidence: hit.confidence,
                    published: hit.published,
                    action_id: None,
                })
                .collect(),
        )
        .await?;

        info!(
            turn_id = %handle.turn_id,
            step_id = %step.id,
            added = stored.created.len(),
            fresh_only = query.params.sort_by_date,
            latency_ms = start.elapsed().as_millis() as u64,
            "Search completed"
        );

        Ok(RetrievalOutcome {
            query: query.text,
            evidence_ids: stored.created,
            duplicate_ids: stored.duplicates,
            dropped: stored.dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ActionKind, ConfigSnapshot, StepSpec};
    use crate::observability::EventBus;
    use crate::retrieval::{MockSearchBackend, SearchHit};
    use serde_json::json;

    async fn setup(max_evidence: usize) -> (MemoryStore, Step, ActionHandle) {
        let store = MemoryStore::new(EventBus::default(), max_evidence);
        let session = store
            .create_session(ConfigSnapshot::from(&ResearchConfig::default()))
            .await;
        let turn = store.start_turn(&session.id, "grid storage").await.unwrap();
        store
            .append_plan(
                &turn.id,
                vec![StepSpec::new("news", SourceKind::Web, "grid storage 2025")],
            )
            .await
            .unwrap();
        let step = store.snapshot(&turn.id).await.unwrap().steps().next().unwrap().clone();
        let handle = store
            .record_action(&turn.id, Some(&step.id), ActionKind::Search, json!({}))
            .await
            .unwrap();
        (store, step, handle)
    }

    fn hit(n: usize) -> SearchHit {
        SearchHit {
            snippet: format!("snippet {}", n),
            url: format!("https://example.com/{}", n),
            confidence: 0.7,
            published: Some("2025-04-02".to_string()),
        }
    }

    #[tokio::test]
    async fn test_search_forwards_freshness_hints() {
        let (store, step, handle) = setup(50).await;
        let mut search = MockSearchBackend::new();
        search
            .expect_search()
            .withf(|q| q.params.time_range.as_deref() == Some("last_6_months") && q.params.sort_by_date)
            .times(1)
            .returning(|_| Ok(vec![hit(1), hit(2)]));
        let executor = SearchExecutor::new(Arc::new(search), &ResearchConfig::default());

        let mut cost = Cost::default();
        let outcome = executor
            .execute(&store, &handle, &step, SearchParams::recent(), &mut cost)
            .await
            .unwrap();

        assert_eq!(outcome.evidence_ids, vec!["WEB_1", "WEB_2"]);
    }

    #[tokio::test]
    async fn test_search_drops_results_past_evidence_cap() {
        let (store, step, handle) = setup(1).await;
        let mut search = MockSearchBackend::new();
        search
            .expect_search()
            .returning(|_| Ok(vec![hit(1), hit(2), hit(3)]));
        let executor = SearchExecutor::new(Arc::new(search), &ResearchConfig::default());

        let mut cost = Cost::default();
        let outcome = executor
            .execute(&store, &handle, &step, SearchParams::default(), &mut cost)
            .await
            .unwrap();

        assert_eq!(outcome.evidence_ids.len(), 1);
        assert_eq!(outcome.dropped, 2);
    }
}
