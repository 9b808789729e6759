use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Research error: {0}")]
    Research(#[from] ResearchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Errors raised by the research core (memory, executors, loop controller)
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state for {entity} {id}: {message}")]
    InvalidState {
        entity: &'static str,
        id: String,
        message: String,
    },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("Collaborator {collaborator} timed out after {timeout_ms}ms")]
    CollaboratorTimeout { collaborator: String, timeout_ms: u64 },

    #[error("Budget exhausted: spent {spent} of {ceiling}")]
    BudgetExhausted { spent: u64, ceiling: u64 },

    #[error(transparent)]
    Backend(BackendError),
}

impl ResearchError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        ResearchError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Shorthand for an `InvalidState` error.
    pub fn invalid_state(
        entity: &'static str,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ResearchError::InvalidState {
            entity,
            id: id.into(),
            message: message.into(),
        }
    }

    /// Collaborator failures are recovered locally by the Action retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResearchError::MalformedResponse { .. }
                | ResearchError::CollaboratorTimeout { .. }
                | ResearchError::Backend(_)
        )
    }

    /// Entity-integrity errors are contract violations and fail the Turn.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            ResearchError::NotFound { .. } | ResearchError::InvalidState { .. }
        )
    }
}

impl From<BackendError> for ResearchError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout { timeout_ms } => ResearchError::CollaboratorTimeout {
                collaborator: "reasoning backend".to_string(),
                timeout_ms,
            },
            BackendError::InvalidResponse { message } => {
                ResearchError::MalformedResponse { message }
            }
            other => ResearchError::Backend(other),
        }
    }
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Reasoning backend transport errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for research core operations
pub type ResearchResult<T> = Result<T, ResearchError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");

        let err = AppError::Internal {
            message: "unexpected".to_string(),
        };
        assert_eq!(err.to_string(), "Internal error: unexpected");
    }

    #[test]
    fn test_research_error_display() {
        let err = ResearchError::not_found("Turn", "turn-1");
        assert_eq!(err.to_string(), "Turn not found: turn-1");

        let err = ResearchError::invalid_state("Step", "s1", "DONE -> PENDING");
        assert_eq!(err.to_string(), "Invalid state for Step s1: DONE -> PENDING");

        let err = ResearchError::CollaboratorTimeout {
            collaborator: "retriever".to_string(),
            timeout_ms: 500,
        };
        assert_eq!(err.to_string(), "Collaborator retriever timed out after 500ms");

        let err = ResearchError::BudgetExhausted {
            spent: 10,
            ceiling: 10,
        };
        assert_eq!(err.to_string(), "Budget exhausted: spent 10 of 10");
    }

    #[test]
    fn test_research_error_classification() {
        assert!(ResearchError::MalformedResponse {
            message: "x".to_string()
        }
        .is_retryable());
        assert!(ResearchError::CollaboratorTimeout {
            collaborator: "web".to_string(),
            timeout_ms: 1
        }
        .is_retryable());
        assert!(!ResearchError::not_found("Claim", "c1").is_retryable());

        assert!(ResearchError::not_found("Claim", "c1").is_integrity_violation());
        assert!(ResearchError::invalid_state("Turn", "t", "x").is_integrity_violation());
        assert!(!ResearchError::BudgetExhausted {
            spent: 1,
            ceiling: 1
        }
        .is_integrity_violation());
    }

    #[test]
    fn test_backend_error_conversion() {
        let err: ResearchError = BackendError::Timeout { timeout_ms: 3000 }.into();
        assert!(matches!(
            err,
            ResearchError::CollaboratorTimeout {
                timeout_ms: 3000,
                ..
            }
        ));

        let err: ResearchError = BackendError::InvalidResponse {
            message: "bad".to_string(),
        }
        .into();
        assert!(matches!(err, ResearchError::MalformedResponse { .. }));

        let err: ResearchError = BackendError::Api {
            status: 500,
            message: "boom".to_string(),
        }
        .into();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "API error: 500 - boom");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Connection {
            message: "failed to connect".to_string(),
        };
        assert_eq!(err.to_string(), "Database connection failed: failed to connect");

        let err = StorageError::SessionNotFound {
            session_id: "sess-123".to_string(),
        };
        assert_eq!(err.to_string(), "Session not found: sess-123");

        let err = StorageError::Migration {
            message: "version mismatch".to_string(),
        };
        assert_eq!(err.to_string(), "Migration failed: version mismatch");
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::Unavailable {
            message: "server down".to_string(),
            retries: 3,
        };
        assert_eq!(err.to_string(), "Backend unavailable: server down (retries: 3)");

        let err = BackendError::Api {
            status: 401,
            message: "unauthorized".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 401 - unauthorized");

        let err = BackendError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Request timeout after 5000ms");
    }

    #[test]
    fn test_error_conversions_into_app_error() {
        let research = ResearchError::not_found("Session", "s");
        let app: AppError = research.into();
        assert!(matches!(app, AppError::Research(_)));

        let storage = StorageError::Query {
            message: "bad".to_string(),
        };
        let app: AppError = storage.into();
        assert!(matches!(app, AppError::Storage(_)));
    }
}
