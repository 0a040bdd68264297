//! `agent-orchestrator` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    — start the management API.
//! - `migrate`  — run pending database migrations.
//! - `validate` — validate a workflow JSON file.
//! - `run`      — execute a workflow file once against echo agents.

mod config;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use agents::{echo::EchoAgent, AgentRegistration, AgentRegistry};
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use db::Storage;
use engine::{ExecuteOptions, Orchestrator, WorkflowDraft};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

#[derive(Parser)]
#[command(
    name = "agent-orchestrator",
    about = "Multi-agent workflow orchestration engine",
    version
)]
struct Cli {
    /// Optional TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `[database].url`.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve {
        #[arg(long, env = "ORCHESTRATOR_BIND", default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Run pending database migrations.
    Migrate,
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Execute a workflow file in memory, binding every referenced agent to
    /// an echo agent, and print the final execution.
    Run {
        path: PathBuf,
        /// Workflow input as a JSON object.
        #[arg(long, default_value = "{}")]
        input: String,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn read_draft(path: &Path) -> anyhow::Result<WorkflowDraft> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid workflow JSON in {}", path.display()))
}

/// Every agent a draft can dispatch to, fallbacks included.
fn referenced_agents(draft: &WorkflowDraft) -> BTreeSet<String> {
    draft
        .steps
        .iter()
        .flat_map(|s| std::iter::once(&s.agent_id).chain(s.fallback_agent_id.as_ref()))
        .cloned()
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = AppConfig::load(cli.config.as_deref())?.with_database_url(cli.database_url);

    match cli.command {
        Command::Serve { bind } => {
            let pool = db::pool::create_pool(&config.database.url, config.database.max_connections)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;

            let storage = Storage::with_ttl_cache(pool, config.engine.cache_ttl());
            let registry = Arc::new(AgentRegistry::new());
            registry.register_agent(
                AgentRegistration::new("echo").with_capability("debug"),
                Arc::new(EchoAgent),
            );
            let orchestrator = Orchestrator::new(storage, registry, config.engine);

            info!("Starting API server on {bind}");
            api::serve(&bind, api::AppState::new(orchestrator)).await?;
        }
        Command::Migrate => {
            info!("Running migrations against {}", config.database.url);
            let pool = db::pool::create_pool(&config.database.url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("Migrations applied successfully");
        }
        Command::Validate { path } => {
            let draft = read_draft(&path)?;
            match engine::catalog::validate_draft(&draft) {
                Ok(order) => {
                    println!("✅ Workflow is valid. Execution order: {order:?}");
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Run { path, input } => {
            let draft = read_draft(&path)?;
            let input: Value = serde_json::from_str(&input).context("--input is not valid JSON")?;

            let pool = db::pool::migrated_memory_pool().await?;
            let storage = Storage::with_ttl_cache(pool, config.engine.cache_ttl());
            let registry = Arc::new(AgentRegistry::new());
            for agent_id in referenced_agents(&draft) {
                registry.register_agent(AgentRegistration::new(agent_id), Arc::new(EchoAgent));
            }
            let orchestrator = Orchestrator::new(storage, registry, config.engine);

            let workflow = orchestrator.create_workflow(draft).await?;
            let started = orchestrator
                .execute(workflow.id, input, ExecuteOptions::default())
                .await?;
            let finished = orchestrator.wait(started.id).await?;
            println!("{}", serde_json::to_string_pretty(&finished)?);
        }
    }

    Ok(())
}
