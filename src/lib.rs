//! # Deep Research Agent
//!
//! A bounded research loop over a hierarchical, auditable memory. Each user
//! query becomes a Turn that is planned into Steps, executed as retrieval,
//! web search, synthesis and conflict-resolution Actions, scored after every
//! iteration, and ended by an explicit termination decision.
//!
//! ## Features
//!
//! - **Hierarchical memory**: Session > Turn > Plan > Action, with Evidence and
//!   Claims owned by the Turn and superseded rather than edited
//! - **Quality evaluation**: coverage, consistency, depth, recency and
//!   confidence scored against configured thresholds
//! - **Bounded execution**: loop, budget, retry and timeout limits per Turn
//! - **Conflict resolution**: targeted verification queries and adjudication
//! - **Archive**: finished turns and their action logs persisted to SQLite
//!
//! ## Architecture
//!
//! ```text
//! Agent ─ plan → evaluate → decide → execute ─┐
//!   │           ↑___________________________│
//!   ├─ MemoryStore (working set) → EventBus (monitors)
//!   ├─ ReasoningBackend / Retriever / SearchBackend (HTTP)
//!   └─ ArchiveStorage (SQLite)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use deep_research::{Agent, Config};
//! use deep_research::llm::OpenAiCompatibleClient;
//! use deep_research::memory::MemoryStore;
//! use deep_research::observability::EventBus;
//! use deep_research::retrieval::{SimulatedRetriever, SimulatedSearch};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let backend = Arc::new(OpenAiCompatibleClient::new(&config.llm, config.request.clone())?);
//!     let store = Arc::new(MemoryStore::new(EventBus::default(), config.research.max_evidence));
//!     let agent = Agent::new(
//!         store,
//!         backend.clone(),
//!         Arc::new(SimulatedRetriever::new(backend.clone())),
//!         Arc::new(SimulatedSearch::new(backend)),
//!         config.research,
//!     )?;
//!     let session = agent.start_session().await?;
//!     let report = agent
//!         .run_turn(&session.id, "How do solid-state batteries fail?", &CancellationToken::new())
//!         .await?;
//!     println!("{}", report.report);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Research loop controller.
pub mod agent;
/// Configuration management.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Quality scoring of a Turn against configured thresholds.
pub mod evaluator;
/// Action executors invoked by the loop controller.
pub mod executors;
/// Reasoning backend client and types.
pub mod llm;
/// Hierarchical research memory.
pub mod memory;
/// Memory change events and monitors.
pub mod observability;
/// Query decomposition into research steps.
pub mod planner;
/// Next-action decision and turn lifecycle.
pub mod policy;
/// System prompts for the reasoning backend.
pub mod prompts;
/// Document retrieval and web search collaborators.
pub mod retrieval;
/// SQLite archive for sessions, turns and action logs.
pub mod storage;

pub use agent::{Agent, TurnReport};
pub use config::Config;
pub use error::{AppError, AppResult};
