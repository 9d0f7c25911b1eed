//! # Artifact Catalog CLI (`acat`)
//!
//! The `acat` binary drives the catalog: it registers processors and root
//! sources, runs scan and parse passes, and inspects what was cataloged.
//!
//! ## Usage
//!
//! ```bash
//! acat --config ./config/catalog.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `acat init` | Create the SQLite database and run schema migrations |
//! | `acat processor add <reference>` | Register a processor implementation |
//! | `acat processor list` | List registered processors |
//! | `acat source add <processor> <uri> --root` | Register a root source |
//! | `acat source list` | List registered sources |
//! | `acat scan` | Walk every root source and catalog what it holds |
//! | `acat parse --type file` | Run parsers over cataloged URIs |
//! | `acat show <uri>` | Print a URI with its metadata and version as JSON |
//! | `acat stats` | Summarize the catalog |
//!
//! ## Examples
//!
//! ```bash
//! acat init
//! acat processor add scanner.filesystem
//! acat processor add parser.digest
//! acat source add filesystem_scanner ~/Documents --root
//! acat scan
//! acat parse --type file --type archived
//! acat show ~/Documents/report.txt
//! ```

use artifact_catalog::sources::AuthMode;
use artifact_catalog::{commands, config, logging, stats};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Artifact Catalog CLI: an incremental, versioned catalog of files and
/// archive entries.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/catalog.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "acat",
    about = "Artifact Catalog — an incremental, versioned catalog of files and archive entries",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/catalog.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Register or list processors.
    Processor {
        #[command(subcommand)]
        action: ProcessorAction,
    },

    /// Register or list sources.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Walk every registered root source and update the catalog.
    ///
    /// URIs under a cleanly walked root that were not seen in this pass are
    /// marked deleted.
    Scan,

    /// Run parse-capable processors over cataloged URIs.
    Parse {
        /// Artifact types to parse. Defaults to `file`.
        #[arg(long = "type")]
        types: Vec<String>,
    },

    /// Print one cataloged URI with its metadata and version.
    Show {
        uri: String,

        /// Container uri, for entries inside an archive.
        #[arg(long)]
        container: Option<String>,

        /// Version modification time (unix seconds). Defaults to the latest.
        #[arg(long)]
        modified: Option<i64>,
    },

    /// Show catalog statistics.
    Stats,
}

#[derive(Subcommand)]
enum ProcessorAction {
    /// Register the processor behind a reference (e.g. `scanner.filesystem`).
    Add { reference: String },
    /// List registered processors.
    List,
}

#[derive(Subcommand)]
enum SourceAction {
    /// Register a source for a processor (by name or reference).
    Add {
        processor: String,
        uri: String,

        /// Mark the source as a scan root.
        #[arg(long)]
        root: bool,

        /// Authentication mode: none, token, basic, oauth.
        #[arg(long, default_value = "none")]
        auth: AuthMode,
    },
    /// List registered sources.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
        }
        Commands::Processor { action } => match action {
            ProcessorAction::Add { reference } => {
                commands::run_processor_add(&cfg, &reference).await?;
            }
            ProcessorAction::List => {
                commands::run_processor_list(&cfg).await?;
            }
        },
        Commands::Source { action } => match action {
            SourceAction::Add {
                processor,
                uri,
                root,
                auth,
            } => {
                commands::run_source_add(&cfg, &processor, &uri, root, auth).await?;
            }
            SourceAction::List => {
                commands::run_source_list(&cfg).await?;
            }
        },
        Commands::Scan => {
            commands::run_scan(&cfg).await?;
        }
        Commands::Parse { types } => {
            commands::run_parse(&cfg, &types).await?;
        }
        Commands::Show {
            uri,
            container,
            modified,
        } => {
            commands::run_show(&cfg, &uri, container.as_deref(), modified).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
