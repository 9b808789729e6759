//! Archive storage for finished research turns.
//!
//! The in-memory [`MemoryStore`](crate::memory::MemoryStore) is the working
//! set of a running process; this layer keeps sessions, terminal turns and
//! their action logs across restarts.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::memory::{Action, ActionKind, ActionStatus, ConfigSnapshot, Cost, Session, Turn, TurnStatus};

/// Persisted session header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier.
    pub id: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// One line per archived Turn.
    pub archived_summary: String,
    /// Settings in effect for the session.
    pub config: ConfigSnapshot,
}

impl From<&Session> for SessionRecord {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            created_at: session.created_at,
            archived_summary: session.archived_summary.clone(),
            config: session.config.clone(),
        }
    }
}

/// Persisted turn: indexed columns plus the full Turn as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Turn identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// The user's question.
    pub query: String,
    /// Turn status.
    pub status: TurnStatus,
    /// Why the Turn ended.
    pub termination_cause: Option<String>,
    /// Final report.
    pub report: Option<String>,
    /// Archive rollup.
    pub summary: Option<String>,
    /// When the Turn started.
    pub created_at: DateTime<Utc>,
    /// When the Turn finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Full Turn state.
    pub snapshot: Turn,
}

impl From<&Turn> for TurnRecord {
    fn from(turn: &Turn) -> Self {
        Self {
            id: turn.id.clone(),
            session_id: turn.session_id.clone(),
            query: turn.query.clone(),
            status: turn.status,
            termination_cause: turn.termination_cause.clone(),
            report: turn.report.clone(),
            summary: turn.summary.clone(),
            created_at: turn.created_at,
            completed_at: turn.completed_at,
            snapshot: turn.clone(),
        }
    }
}

/// Persisted action log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Action identifier.
    pub id: String,
    /// Owning Turn.
    pub turn_id: String,
    /// Step served, if any.
    pub step_id: Option<String>,
    /// What the Action did.
    pub kind: ActionKind,
    /// Final status.
    pub status: ActionStatus,
    /// Input payload.
    pub input: serde_json::Value,
    /// Result payload.
    pub result: Option<serde_json::Value>,
    /// Resources consumed.
    pub cost: Cost,
    /// When the Action started.
    pub started_at: DateTime<Utc>,
    /// When the Action completed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Action> for ActionRecord {
    fn from(action: &Action) -> Self {
        Self {
            id: action.id.clone(),
            turn_id: action.turn_id.clone(),
            step_id: action.step_id.clone(),
            kind: action.kind,
            status: action.status,
            input: action.input.clone(),
            result: action.result.clone(),
            cost: action.cost,
            started_at: action.started_at,
            completed_at: action.completed_at,
        }
    }
}

/// Durable archive of sessions, turns and action logs.
///
/// All writes are upserts, so re-archiving a turn is harmless.
#[async_trait]
pub trait ArchiveStorage: Send + Sync {
    /// Insert or update a session header.
    async fn save_session(&self, session: &SessionRecord) -> StorageResult<()>;
    /// Get a session by ID.
    async fn get_session(&self, id: &str) -> StorageResult<Option<SessionRecord>>;
    /// Insert or update a turn; its session must already be saved.
    async fn save_turn(&self, turn: &TurnRecord) -> StorageResult<()>;
    /// Insert or update a batch of actions in one transaction.
    async fn save_actions(&self, actions: &[ActionRecord]) -> StorageResult<()>;
    /// Turns of a session, oldest first.
    async fn list_turns(&self, session_id: &str) -> StorageResult<Vec<TurnRecord>>;
    /// Most recent turns across sessions, newest first.
    async fn recent_turns(&self, limit: u32) -> StorageResult<Vec<TurnRecord>>;
    /// Action log of a turn in execution order.
    async fn list_actions(&self, turn_id: &str) -> StorageResult<Vec<ActionRecord>>;
}
