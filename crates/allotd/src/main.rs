//! allotd, the quota and usage collector daemon.
//!
//! One binary, four subcommands: `collect` runs the reconciliation loops
//! for one cluster, `serve` runs the read-only API, and the two `test-*`
//! commands exercise the plugins once without starting any loop.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

#[derive(Parser, Debug)]
#[command(name = "allotd", version, about = "Quota and usage collector for multi-tenant clouds")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all collector loops for one cluster.
    Collect {
        config: PathBuf,
        cluster_id: String,
        /// Run each loop for a single pass, then exit.
        #[arg(long)]
        once: bool,
    },
    /// Run the read-only API for one cluster.
    Serve { config: PathBuf, cluster_id: String },
    /// Scrape one project with every quota plugin and print the result.
    TestScrape {
        config: PathBuf,
        cluster_id: String,
        project_uuid: String,
    },
    /// Run one capacity pass and print the resulting capacity report.
    TestScanCapacity { config: PathBuf, cluster_id: String },
}

fn init_tracing() {
    // ALLOT_DEBUG raises the default level; an explicit RUST_LOG still
    // wins. ALLOT_DEBUG_SQL additionally traces every SQL statement.
    let mut default_directives = if std::env::var_os("ALLOT_DEBUG").is_some() {
        "debug".to_string()
    } else {
        "info".to_string()
    };
    if std::env::var_os("ALLOT_DEBUG_SQL").is_some() {
        default_directives.push_str(",sqlx::query=debug");
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Collect {
            config,
            cluster_id,
            once,
        } => commands::collect(&config, &cluster_id, once).await,
        Command::Serve { config, cluster_id } => commands::serve(&config, &cluster_id).await,
        Command::TestScrape {
            config,
            cluster_id,
            project_uuid,
        } => commands::test_scrape(&config, &cluster_id, &project_uuid).await,
        Command::TestScanCapacity { config, cluster_id } => {
            commands::test_scan_capacity(&config, &cluster_id).await
        }
    }
}
