//! memctl - command-line front end for the memoria worker.
//!
//! Spawns the configured worker, performs one memory operation, prints the
//! result as JSON on stdout and shuts the worker down again. Logs go to
//! stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memoria::config::WorkerConfig;
use memoria::ipc::RpcClient;
use memoria::models::NewMemory;

/// Log filter used when `RUST_LOG` is unset. Worker stderr is logged under
/// its own target.
const DEFAULT_LOG_FILTER: &str = "memoria=info,memctl=info,worker_stderr=warn";

/// Default result count for `search` and `list`.
const DEFAULT_LIMIT: u32 = 20;

#[derive(Debug, Parser)]
#[command(name = "memctl", version, about = "Query and update the memoria store")]
struct Cli {
    /// Worker config file (JSON)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Worker command line, overriding the config file
    #[arg(long, global = true, value_name = "COMMAND")]
    worker: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true, value_name = "MS")]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Search memories by relevance
    Search {
        query: String,
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: u32,
    },
    /// Store a new memory
    Store {
        content: String,
        #[arg(long = "type", default_value = "note")]
        doc_type: String,
        #[arg(long, default_value = "manual")]
        source: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Show one memory
    Recall { id: String },
    /// List recent memories
    List {
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: u32,
    },
    /// Show store statistics
    Stats,
    /// Delete a memory
    Delete { id: String },
}

impl Cli {
    fn worker_config(&self) -> Result<WorkerConfig> {
        let mut config = WorkerConfig::load(self.config.as_deref())?;
        if let Some(line) = &self.worker {
            config
                .set_command_line(line)
                .context("Invalid --worker command line")?;
        }
        if let Some(ms) = self.timeout_ms {
            config.request_timeout_ms = ms;
        }
        Ok(config)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to format result")?;
    println!("{}", text);
    Ok(())
}

async fn run(client: &RpcClient, command: Command) -> Result<()> {
    match command {
        Command::Search { query, limit } => print_json(&client.search(&query, limit).await),
        Command::Store {
            content,
            doc_type,
            source,
            tags,
        } => {
            let memory = NewMemory::new(content)
                .with_type(doc_type)
                .with_source(source)
                .with_tags(tags);
            let id = client.store(&memory).await.context("Store failed")?;
            print_json(&serde_json::json!({ "id": id }))
        }
        Command::Recall { id } => match client.recall(&id).await {
            Some(entry) => print_json(&entry),
            None => anyhow::bail!("No memory with id {}", id),
        },
        Command::List { limit } => print_json(&client.list(limit).await),
        Command::Stats => {
            let stats = client.get_stats().await.context("Stats failed")?;
            print_json(&stats)
        }
        Command::Delete { id } => {
            client.delete(&id).await.context("Delete failed")?;
            print_json(&serde_json::json!({ "deleted": id }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.worker_config()?;

    tracing::debug!("memctl v{}", env!("CARGO_PKG_VERSION"));

    let client = RpcClient::new(config);
    client
        .connect()
        .await
        .with_context(|| format!("Could not start worker `{}`", client.config().command))?;

    let result = run(&client, cli.command).await;
    client.disconnect().await;
    result
}
