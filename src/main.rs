use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use memoria::cli;
use memoria::config::MemoriaConfig;
use memoria::memory::types::Source;
use memoria::retrieval::RetrieveRequest;
use memoria::scheduler::TaskStatus;
use memoria::{server, Engine};

#[derive(Parser)]
#[command(name = "memoria", version, about = "Personal memory and reasoning engine")]
struct Cli {
    /// Config file (defaults to ~/.memoria/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP API with background workers
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Store a memory
    Ingest {
        text: String,
        /// medication, habit, finance, voice, camera, chat or document
        #[arg(long, short)]
        source: Source,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        importance: Option<f64>,
        /// Metadata as key=value; repeatable
        #[arg(long = "meta", short = 'm')]
        metadata: Vec<String>,
        /// Return as soon as the record is stored
        #[arg(long)]
        no_wait: bool,
    },
    /// Ranked retrieval for a query
    Retrieve {
        query: String,
        #[arg(long, short)]
        k: Option<usize>,
        #[arg(long)]
        budget: Option<usize>,
        #[arg(long)]
        user: Option<String>,
        /// Restrict to these sources; repeatable
        #[arg(long = "source", short = 's')]
        sources: Vec<Source>,
        /// RFC 3339 lower bound on creation time
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long)]
        json: bool,
    },
    /// Explain an entity: relationships, impacts and suggestions
    Reason {
        /// Entity id or label
        entity: String,
        #[arg(long)]
        json: bool,
    },
    /// Memory, index and task statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Database and index diagnostics
    Doctor,
    /// Rebuild the index from the record table
    Rebuild {
        /// Also run the consolidation policy
        #[arg(long)]
        consolidate: bool,
        /// Also re-extract the knowledge graph
        #[arg(long)]
        graph: bool,
    },
    /// Inspect or cancel a background task
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    Status { id: String },
    Cancel { id: String },
    /// Most recently updated tasks with a status (queued, running, done, failed, cancelled)
    List {
        #[arg(default_value = "failed")]
        status: TaskStatus,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Drop done and cancelled tasks older than the configured retention
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MemoriaConfig::load_from(path)?,
        None => MemoriaConfig::load()?,
    };

    // Logs go to stderr so command output stays clean on stdout.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            server::serve(Engine::open(config)?).await?;
        }
        Command::Ingest {
            text,
            source,
            user,
            importance,
            metadata,
            no_wait,
        } => {
            let args = cli::ingest::IngestArgs {
                text,
                source,
                user,
                importance,
                metadata,
                wait: !no_wait,
            };
            cli::ingest::ingest(&config, args).await?;
        }
        Command::Retrieve {
            query,
            k,
            budget,
            user,
            sources,
            since,
            until,
            json,
        } => {
            let request = RetrieveRequest {
                k,
                token_budget: budget,
                user,
                sources,
                since,
                until,
                ..RetrieveRequest::new(query)
            };
            cli::retrieve::retrieve(&config, request, json).await?;
        }
        Command::Reason { entity, json } => cli::reason::reason(&config, &entity, json).await?,
        Command::Stats { json } => cli::stats::stats(&config, json).await?,
        Command::Doctor => cli::doctor::doctor(&config).await?,
        Command::Rebuild { consolidate, graph } => {
            cli::rebuild::rebuild(&config, consolidate, graph).await?
        }
        Command::Task { action } => match action {
            TaskAction::Status { id } => cli::task::status(&config, &id).await?,
            TaskAction::Cancel { id } => cli::task::cancel(&config, &id).await?,
            TaskAction::List { status, limit } => cli::task::list(&config, status, limit).await?,
            TaskAction::Purge => cli::task::purge(&config).await?,
        },
    }

    Ok(())
}
