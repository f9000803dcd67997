use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use granary::archiver::Archiver;
use granary::config::Config;
use granary::engine::memory::MemoryEngine;
use granary::fabric::memory::MemoryFabric;
use granary::query::{ParseError, QueryParser};
use granary::stores::MemDocStore;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the archiver
    Archiver {
        /// Path to the config file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Write a default config file in the current directory
    Mkconfig {
        /// Name of the config file
        #[arg(short, long, default_value = "granary-default.toml")]
        file: PathBuf,
    },
}

/// The query-language parser ships separately; the standalone binary
/// answers every query with a parse error until one is linked in.
struct UnlinkedParser;

impl QueryParser for UnlinkedParser {
    fn parse(&self, _query: &str) -> Result<granary::query::ParsedQuery, ParseError> {
        Err(ParseError {
            message: "no query parser linked".to_owned(),
            pos: 0,
        })
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Archiver { config } => run_archiver(&config),
        Commands::Mkconfig { file } => {
            std::fs::write(&file, Config::default_toml())
                .with_context(|| format!("could not create {}", file.display()))?;
            println!("{}", file.display());
            Ok(())
        }
    }
}

fn run_archiver(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("could not load config {}", config_path.display()))?;

    let runtime = tokio::runtime::Runtime::new().context("could not start runtime")?;
    runtime.block_on(async {
        // in-process seams; a deployment wires network-backed ones here
        let fabric = Arc::new(MemoryFabric::new("archiver"));
        let engine = Arc::new(MemoryEngine::new());
        let md = Arc::new(MemDocStore::new().context("could not create metadata indexes")?);
        let archiver = Archiver::new(config, fabric, md, engine, Arc::new(UnlinkedParser))
            .context("could not initialize archiver")?;
        archiver.serve().await.context("archiver failed")
    })
}
