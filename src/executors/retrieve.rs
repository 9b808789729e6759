use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{call_with_timeout, store_evidence};
use crate::config::ResearchConfig;
use crate::error::ResearchResult;
use crate::memory::{ActionHandle, Cost, MemoryStore, NewEvidence, SourceKind, Step};
use crate::retrieval::{RetrievalQuery, Retriever};

/// Payload recorded on a RETRIEVE or SEARCH Action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    /// Query sent to the retriever.
    pub query: String,
    /// Evidence added by this Action.
    pub evidence_ids: Vec<String>,
    /// Results that matched evidence already in the Turn.
    pub duplicate_ids: Vec<String>,
    /// Results discarded at the evidence cap.
    pub dropped: usize,
}

/// Knowledge-base (RAG) retrieval for a Step.
pub struct RetrieveExecutor {
    retriever: Arc<dyn Retriever>,
    top_k: usize,
    timeout_ms: u64,
}

impl RetrieveExecutor {
    /// Create a retrieve executor.
    pub fn new(retriever: Arc<dyn Retriever>, config: &ResearchConfig) -> Self {
        Self {
            retriever,
            top_k: config.rag_top_k,
            timeout_ms: config.action_timeout_ms,
        }
    }

    /// Retrieve evidence for the Step's seed query.
    pub async fn execute(
        &self,
        store: &MemoryStore,
        handle: &ActionHandle,
        step: &Step,
        cost: &mut Cost,
    ) -> ResearchResult<RetrievalOutcome> {
        let start = Instant::now();
        let query = RetrievalQuery {
            text: step.query.clone(),
            top_k: self.top_k,
        };

        let mut items = call_with_timeout(
            "retriever",
            self.timeout_ms,
            cost,
            self.retriever.retrieve(&query),
        )
        .await?;
        items.truncate(self.top_k);

        let stored = store_evidence(
            store,
            handle,
            items
                .into_iter()
                .map(|item| NewEvidence {
                    source: SourceKind::Rag,
                    locator: item.locator,
                    content: item.content,
                    confidence: item.confidence,
                    published: item.published,
                    action_id: None,
                })
                .collect(),
        )
        .await?;

        info!(
            turn_id = %handle.turn_id,
            step_id = %step.id,
            added = stored.created.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Retrieval completed"
        );

        Ok(RetrievalOutcome {
            query: query.text,
            evidence_ids: stored.created,
            duplicate_ids: stored.duplicates,
            dropped: stored.dropped,
        })
    }
}
