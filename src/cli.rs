// src/cli.rs
//! CLI definitions for depotkeep
//!
//! Command implementations live in the `commands` module.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "depotkeep")]
#[command(version)]
#[command(about = "Manifest bundle ingestion and version-store reconciliation", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML); built-in defaults when omitted
    #[arg(short, long, global = true, env = "DEPOTKEEP_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ingest an uploaded archive and commit one bundle per title
    Ingest {
        /// Path to the archive (zip, tar, tar.gz, tar.zst, tar.xz)
        archive: PathBuf,
    },

    /// Reconcile stored revisions against the catalog
    Reconcile {
        /// Reconcile a single title within the on-demand budget
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Report DLC completeness for a title
    Analyze {
        title: String,
    },

    /// Run scheduled reconciliation passes until interrupted
    Daemon,

    /// Depot key table maintenance
    #[command(subcommand)]
    Keys(KeysCommands),
}

#[derive(Subcommand)]
pub enum KeysCommands {
    /// Import a depotkeys.json file into the key table
    Import {
        file: PathBuf,
    },

    /// Print the key stored for a depot
    Get {
        depot: String,
    },
}
