use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use super::{ActionRecord, ArchiveStorage, SessionRecord, TurnRecord};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::memory::{Cost, TurnStatus};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed archive
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at the configured path
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Private in-memory database, for tests
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        // Every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ArchiveStorage for SqliteStorage {
    async fn save_session(&self, session: &SessionRecord) -> StorageResult<()> {
        let config = to_json(&session.config)?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, created_at, archived_summary, config)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                archived_summary = excluded.archived_summary,
                config = excluded.config
            "#,
        )
        .bind(&session.id)
        .bind(session.created_at.to_rfc3339())
        .bind(&session.archived_summary)
        .bind(&config)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<SessionRecord>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, created_at, archived_summary, config
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRecord::try_from).transpose()
    }

    async fn save_turn(&self, turn: &TurnRecord) -> StorageResult<()> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM sessions WHERE id = ?")
            .bind(&turn.session_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StorageError::SessionNotFound {
                session_id: turn.session_id.clone(),
            });
        }

        let snapshot = to_json(&turn.snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO turns (id, session_id, query, status, termination_cause, report, summary,
                               created_at, completed_at, snapshot_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                termination_cause = excluded.termination_cause,
                report = excluded.report,
                summary = excluded.summary,
                completed_at = excluded.completed_at,
                snapshot_json = excluded.snapshot_json
            "#,
        )
        .bind(&turn.id)
        .bind(&turn.session_id)
        .bind(&turn.query)
        .bind(turn.status.as_str())
        .bind(&turn.termination_cause)
        .bind(&turn.report)
        .bind(&turn.summary)
        .bind(turn.created_at.to_rfc3339())
        .bind(turn.completed_at.map(|t| t.to_rfc3339()))
        .bind(&snapshot)
        .execute(&self.pool)
        .await?;

        debug!(turn_id = %turn.id, status = %turn.status, "Turn archived to storage");
        Ok(())
    }

    async fn save_actions(&self, actions: &[ActionRecord]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        for action in actions {
            let input = to_json(&action.input)?;
            let result = action.result.as_ref().map(to_json).transpose()?;

            sqlx::query(
                r#"
                INSERT INTO actions (id, turn_id, step_id, kind, status, input, result,
                                     calls, tokens, elapsed_ms, started_at, completed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    result = excluded.result,
                    calls = excluded.calls,
                    tokens = excluded.tokens,
                    elapsed_ms = excluded.elapsed_ms,
                    completed_at = excluded.completed_at
                "#,
            )
            .bind(&action.id)
            .bind(&action.turn_id)
            .bind(&action.step_id)
            .bind(action.kind.as_str())
            .bind(action.status.as_str())
            .bind(&input)
            .bind(&result)
            .bind(action.cost.calls as i64)
            .bind(action.cost.tokens as i64)
            .bind(action.cost.elapsed_ms as i64)
            .bind(action.started_at.to_rfc3339())
            .bind(action.completed_at.map(|t| t.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_turns(&self, session_id: &str) -> StorageResult<Vec<TurnRecord>> {
        let rows: Vec<TurnRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, query, status, termination_cause, report, summary,
                   created_at, completed_at, snapshot_json
            FROM turns
            WHERE session_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TurnRecord::try_from).collect()
    }

    async fn recent_turns(&self, limit: u32) -> StorageResult<Vec<TurnRecord>> {
        let rows: Vec<TurnRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, query, status, termination_cause, report, summary,
                   created_at, completed_at, snapshot_json
            FROM turns
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TurnRecord::try_from).collect()
    }

    async fn list_actions(&self, turn_id: &str) -> StorageResult<Vec<ActionRecord>> {
        let rows: Vec<ActionRow> = sqlx::query_as(
            r#"
            SELECT id, turn_id, step_id, kind, status, input, result,
                   calls, tokens, elapsed_ms, started_at, completed_at
            FROM actions
            WHERE turn_id = ?
            ORDER BY started_at ASC, rowid ASC
            "#,
        )
        .bind(turn_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ActionRecord::try_from).collect()
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })
}

fn from_json<T: DeserializeOwned>(column: &str, raw: &str) -> StorageResult<T> {
    serde_json::from_str(raw).map_err(|e| StorageError::Serialization {
        message: format!("column '{}': {}", column, e),
    })
}

/// Parse an enum stored by its serde name.
fn from_name<T: DeserializeOwned>(column: &str, raw: &str) -> StorageResult<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).map_err(|e| {
        StorageError::Serialization {
            message: format!("column '{}': {}", column, e),
        }
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    created_at: String,
    archived_summary: String,
    config: String,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = StorageError;

    fn try_from(row: SessionRow) -> StorageResult<Self> {
        Ok(Self {
            config: from_json("config", &row.config)?,
            id: row.id,
            created_at: parse_timestamp(&row.created_at),
            archived_summary: row.archived_summary,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TurnRow {
    id: String,
    session_id: String,
    query: String,
    status: String,
    termination_cause: Option<String>,
    report: Option<String>,
    summary: Option<String>,
    created_at: String,
    completed_at: Option<String>,
    snapshot_json: String,
}

impl TryFrom<TurnRow> for TurnRecord {
    type Error = StorageError;

    fn try_from(row: TurnRow) -> StorageResult<Self> {
        let status = TurnStatus::from_str(&row.status).map_err(|message| {
            StorageError::Serialization { message }
        })?;
        Ok(Self {
            snapshot: from_json("snapshot_json", &row.snapshot_json)?,
            id: row.id,
            session_id: row.session_id,
            query: row.query,
            status,
            termination_cause: row.termination_cause,
            report: row.report,
            summary: row.summary,
            created_at: parse_timestamp(&row.created_at),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    id: String,
    turn_id: String,
    step_id: Option<String>,
    kind: String,
    status: String,
    input: String,
    result: Option<String>,
    calls: i64,
    tokens: i64,
    elapsed_ms: i64,
    started_at: String,
    completed_at: Option<String>,
}

impl TryFrom<ActionRow> for ActionRecord {
    type Error = StorageError;

    fn try_from(row: ActionRow) -> StorageResult<Self> {
        Ok(Self {
            kind: from_name("kind", &row.kind)?,
            status: from_name("status", &row.status)?,
            input: from_json("input", &row.input)?,
            result: row
                .result
                .as_deref()
                .map(|raw| from_json("result", raw))
                .transpose()?,
            cost: Cost {
                calls: row.calls.max(0) as u64,
                tokens: row.tokens.max(0) as u64,
                elapsed_ms: row.elapsed_ms.max(0) as u64,
            },
            id: row.id,
            turn_id: row.turn_id,
            step_id: row.step_id,
            started_at: parse_timestamp(&row.started_at),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
        })
    }
}
