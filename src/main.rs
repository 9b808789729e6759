use std::io::{BufRead, Write};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use deep_research::{
    agent::{Agent, TurnReport},
    config::{Config, LogFormat},
    llm::OpenAiCompatibleClient,
    memory::MemoryStore,
    observability::{self, EventBus},
    retrieval::{SimulatedRetriever, SimulatedSearch},
    storage::{ArchiveStorage, SqliteStorage},
};

#[derive(Debug, Parser)]
#[command(name = "deep-research", version, about = "Deep research agent")]
struct Cli {
    /// Log every memory change event
    #[arg(long, global = true)]
    monitor: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Research a single question and print the report
    Ask {
        /// The research question
        query: String,
        /// Continue an archived session instead of starting a new one
        #[arg(long)]
        session: Option<String>,
    },
    /// Interactive session: each line is a new turn with earlier turns as context
    Chat,
    /// Show recently archived turns
    History {
        /// Number of turns to list
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Deep research agent starting..."
    );

    // Initialize storage
    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            Arc::new(s)
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    if let Command::History { limit } = cli.command {
        return print_history(storage.as_ref(), limit).await;
    }

    // Initialize reasoning backend
    let backend = match OpenAiCompatibleClient::new(&config.llm, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %c.base_url(), model = %c.model(), "Reasoning backend initialized");
            Arc::new(c)
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize reasoning backend");
            return Err(e.into());
        }
    };

    let events = EventBus::new(config.monitor.channel_capacity);
    if cli.monitor || config.monitor.enabled {
        tokio::spawn(observability::log_events(events.subscribe()));
    }

    let store = Arc::new(MemoryStore::new(events, config.research.max_evidence));
    let agent = Agent::new(
        store,
        backend.clone(),
        Arc::new(SimulatedRetriever::new(backend.clone())),
        Arc::new(SimulatedSearch::new(backend)),
        config.research.clone(),
    )?
    .with_archive(storage);
    let session = match &cli.command {
        Command::Ask {
            session: Some(id), ..
        } => agent.resume_session(id).await?,
        _ => agent.start_session().await?,
    };
    info!(session_id = %session.id, "Session ready");

    match cli.command {
        Command::Ask { query, .. } => {
            let report = run_cancellable(&agent, &session.id, &query).await?;
            print_report(&report);
        }
        Command::Chat => {
            let stdin = std::io::stdin();
            loop {
                print!("research> ");
                std::io::stdout().flush()?;

                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    break;
                }
                let query = line.trim();
                if query.is_empty() {
                    continue;
                }
                if matches!(query, "exit" | "quit") {
                    break;
                }

                match run_cancellable(&agent, &session.id, query).await {
                    Ok(report) => print_report(&report),
                    Err(e) => error!(error = %e, "Turn failed"),
                }
            }
        }
        Command::History { .. } => {}
    }

    info!("Shutdown complete");
    Ok(())
}

/// Run one turn; Ctrl-C stops it at the next loop iteration.
async fn run_cancellable(agent: &Agent, session_id: &str, query: &str) -> anyhow::Result<TurnReport> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing turn with current findings");
                cancel.cancel();
            }
        })
    };

    let result = agent.run_turn(session_id, query, &cancel).await;
    watcher.abort();
    Ok(result?)
}

fn print_report(report: &TurnReport) {
    println!("{}", report.report);
    println!();
    println!(
        "[{} | {} | loops {} | calls {} | tokens {}]",
        report.status, report.cause, report.loops, report.cost.calls, report.cost.tokens
    );
}

async fn print_history(storage: &dyn ArchiveStorage, limit: u32) -> anyhow::Result<()> {
    let turns = storage.recent_turns(limit).await?;
    if turns.is_empty() {
        println!("No archived turns.");
        return Ok(());
    }
    for turn in turns {
        println!(
            "{}  {}  {:<8}  {}",
            turn.created_at.format("%Y-%m-%d %H:%M"),
            turn.id,
            turn.status,
            turn.query
        );
        if let Some(summary) = turn.summary.filter(|s| !s.is_empty()) {
            println!("    {}", summary);
        }
    }
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
