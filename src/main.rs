use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dirprobe_rs::events::EventBroker;
use dirprobe_rs::scanner::Engine;
use dirprobe_rs::server::{self, AppState};
use dirprobe_rs::store::{ScanRepo, WordlistStore};

/// dirprobe-rs — concurrent HTTP path enumeration with soft-404 filtering,
/// durable NDJSON logs, and live events over a small web API.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dirprobe-rs",
    version,
    about = "Concurrent HTTP path enumeration with soft-404 filtering and a small web API.",
    long_about = None
)]
struct Cli {
    /// Directory for wordlists, scan metadata, and NDJSON logs.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Address to bind the HTTP API on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let wordlists = Arc::new(WordlistStore::new(cli.data_dir.join("wordlists"))?);
    let repo = Arc::new(ScanRepo::new(cli.data_dir.clone())?);
    let broker = EventBroker::default();

    let engine = Engine::new(wordlists.clone(), repo.clone(), Arc::new(broker.clone()));

    server::serve(&cli.bind, AppState { engine, repo, wordlists, broker }).await
}
