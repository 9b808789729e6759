use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Reasoning backend settings.
    pub llm: LlmConfig,
    /// Archive database settings.
    pub database: DatabaseConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// HTTP request settings.
    pub request: RequestConfig,
    /// Research loop settings.
    pub research: ResearchConfig,
    /// Memory event monitor settings.
    pub monitor: MonitorConfig,
}

/// Reasoning backend (OpenAI-compatible) configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API key sent as a bearer token.
    pub api_key: String,
    /// Base URL of the OpenAI-compatible API.
    pub base_url: String,
    /// Model name.
    pub model: String,
    /// Default sampling temperature.
    pub temperature: f64,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// Maximum pool connections.
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info").
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    /// Human-readable output.
    Pretty,
    /// JSON lines.
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    pub retry_delay_ms: u64,
}

/// Per-dimension pass thresholds for the evaluator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Minimum coverage score.
    pub coverage: f64,
    /// Minimum consistency score.
    pub consistency: f64,
    /// Minimum depth score.
    pub depth: f64,
    /// Minimum recency score.
    pub recency: f64,
    /// Minimum confidence score.
    pub confidence: f64,
}

/// Bounds and tuning for the research loop.
#[derive(Debug, Clone)]
pub struct ResearchConfig {
    /// Per-dimension pass thresholds.
    pub thresholds: Thresholds,
    /// Hard ceiling on loop iterations per Turn.
    pub max_loops_per_turn: u32,
    /// Hard ceiling on collaborator calls per Turn.
    pub cost_ceiling: u64,
    /// Failed attempts allowed per Step before it is skipped.
    pub retry_limit: u32,
    /// Upper bound on a single collaborator call, including cancellation waits.
    pub action_timeout_ms: u64,
    /// Knowledge-base results per retrieval.
    pub rag_top_k: usize,
    /// Web results per search.
    pub web_results: usize,
    /// Maximum evidence items per Turn.
    pub max_evidence: usize,
    /// Supporting evidence count at which a claim reaches full depth.
    pub depth_target_support: usize,
    /// Age in days under which evidence counts as recent.
    pub recency_window_days: i64,
}

/// Memory event monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Log every memory event.
    pub enabled: bool,
    /// Event channel capacity.
    pub channel_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let llm = LlmConfig {
            api_key: env::var("LLM_API_KEY").map_err(|_| AppError::Config {
                message: "LLM_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LLM_BASE_URL").unwrap_or_else(|_| {
                "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
            }),
            model: env::var("LLM_MODEL").unwrap_or_else(|_| "qwen-flash".to_string()),
            temperature: env_or("LLM_TEMPERATURE", 0.5),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/research.db".to_string()),
            ),
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: env_or("REQUEST_TIMEOUT_MS", 30000),
            max_retries: env_or("MAX_RETRIES", 3),
            retry_delay_ms: env_or("RETRY_DELAY_MS", 1000),
        };

        let defaults = ResearchConfig::default();
        let research = ResearchConfig {
            thresholds: Thresholds {
                coverage: env_or("THRESHOLD_COVERAGE", defaults.thresholds.coverage),
                consistency: env_or("THRESHOLD_CONSISTENCY", defaults.thresholds.consistency),
                depth: env_or("THRESHOLD_DEPTH", defaults.thresholds.depth),
                recency: env_or("THRESHOLD_RECENCY", defaults.thresholds.recency),
                confidence: env_or("THRESHOLD_CONFIDENCE", defaults.thresholds.confidence),
            },
            max_loops_per_turn: env_or("MAX_LOOPS_PER_TURN", defaults.max_loops_per_turn),
            cost_ceiling: env_or("COST_CEILING", defaults.cost_ceiling),
            retry_limit: env_or("RETRY_LIMIT", defaults.retry_limit),
            action_timeout_ms: env_or("ACTION_TIMEOUT_MS", defaults.action_timeout_ms),
            rag_top_k: env_or("RAG_TOP_K", defaults.rag_top_k),
            web_results: env_or("WEB_RESULTS", defaults.web_results),
            max_evidence: env_or("MAX_EVIDENCE", defaults.max_evidence),
            depth_target_support: env_or("DEPTH_TARGET_SUPPORT", defaults.depth_target_support),
            recency_window_days: env_or("RECENCY_WINDOW_DAYS", defaults.recency_window_days),
        };
        research.validate()?;

        let monitor = MonitorConfig {
            enabled: env_or("MONITOR_ENABLED", false),
            channel_capacity: env_or("MONITOR_CHANNEL_CAPACITY", 256),
        };

        Ok(Config {
            llm,
            database,
            logging,
            request,
            research,
            monitor,
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ResearchConfig {
    /// Reject settings under which a Turn could not terminate or be evaluated.
    pub fn validate(&self) -> Result<(), AppError> {
        let t = &self.thresholds;
        for (name, value) in [
            ("coverage", t.coverage),
            ("consistency", t.consistency),
            ("depth", t.depth),
            ("recency", t.recency),
            ("confidence", t.confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AppError::Config {
                    message: format!("threshold {} must be within [0, 1], got {}", name, value),
                });
            }
        }

        let bounds = [
            ("MAX_LOOPS_PER_TURN", self.max_loops_per_turn as u64),
            ("COST_CEILING", self.cost_ceiling),
            ("RETRY_LIMIT", self.retry_limit as u64),
            ("ACTION_TIMEOUT_MS", self.action_timeout_ms),
            ("DEPTH_TARGET_SUPPORT", self.depth_target_support as u64),
        ];
        if let Some((name, _)) = bounds.iter().find(|(_, v)| *v == 0) {
            return Err(AppError::Config {
                message: format!("{} must be greater than zero", name),
            });
        }

        Ok(())
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            coverage: 0.80,
            consistency: 0.70,
            depth: 0.60,
            recency: 0.70,
            confidence: 0.75,
        }
    }
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            max_loops_per_turn: 12,
            cost_ceiling: 100,
            retry_limit: 2,
            action_timeout_ms: 60000,
            rag_top_k: 5,
            web_results: 5,
            max_evidence: 200,
            depth_target_support: 2,
            recency_window_days: 365,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_capacity: 256,
        }
    }
}
