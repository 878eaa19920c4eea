use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scriptcov::cache::CacheStore;
use scriptcov::cli;

/// Static coverage analysis and cache maintenance for script engines.
#[derive(Parser)]
#[command(name = "scriptcov", version, about)]
struct Cli {
    /// Path to the coverage cache (default: ./.scriptcov-cache.db)
    #[arg(long, global = true, default_value = ".scriptcov-cache.db")]
    cache: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the coverage map of an ESTree JSON dump (as produced by Reflect.parse).
    Analyze {
        /// Path to the JSON syntax tree.
        tree: PathBuf,
    },

    /// Inspect or transfer the coverage cache.
    #[command(subcommand)]
    Cache(CacheCommands),

    /// Show line, branch and function totals of an LCOV trace.
    Summary {
        /// Path to the trace file.
        trace: PathBuf,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Write every cache entry as a JSON blob.
    Export {
        /// Output file. If omitted, the blob goes to stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Merge a previously exported blob into the cache.
    Import {
        /// Path to the blob.
        blob: PathBuf,
    },

    /// List cache entries.
    List,

    /// Delete every cache entry.
    Clear,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("SCRIPTCOV_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_cache(path: &Path) -> Result<CacheStore> {
    CacheStore::open(path).with_context(|| format!("Failed to open cache {}", path.display()))
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let output = match cli.command {
        Commands::Analyze { tree } => cli::cmd_analyze(&tree)?,
        Commands::Summary { trace } => cli::cmd_summary(&trace)?,
        Commands::Cache(command) => {
            let mut store = open_cache(&cli.cache)?;
            match command {
                CacheCommands::Export { output } => cli::cmd_cache_export(&store, output.as_deref())?,
                CacheCommands::Import { blob } => cli::cmd_cache_import(&mut store, &blob)?,
                CacheCommands::List => cli::cmd_cache_list(&store)?,
                CacheCommands::Clear => cli::cmd_cache_clear(&mut store)?,
            }
        }
    };
    print!("{output}");
    Ok(())
}
