//! Command-line argument definitions for the cache storage tool.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Cli defines the root command for the cache storage binary.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Span configuration file listing the storage to operate on.
    #[arg(long, value_name = "FILE", env = "CACHESTORE_SPANS")]
    pub spans: Option<PathBuf>,

    /// Volume configuration file with allocation targets.
    #[arg(long, value_name = "FILE", env = "CACHESTORE_VOLUMES")]
    pub volumes: Option<PathBuf>,

    /// Enable writes to the underlying storage.
    #[arg(short, long, default_value_t = false)]
    pub write: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Command enumerates the supported subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// List elements of the cache.
    List {
        #[command(subcommand)]
        scope: Option<ListScope>,
    },

    /// Zero span headers on disk (requires --write).
    Clear,

    /// Simulate volume allocation and print what would happen.
    Volumes,

    /// Storage allocation.
    Alloc {
        #[command(subcommand)]
        target: AllocTarget,
    },
}

/// `ListScope` deepens the `list` output.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum ListScope {
    /// Include each stripe and validate its metadata.
    Stripes,
    /// Additionally load each directory and check its bucket chains.
    Directory,
}

/// `AllocTarget` selects what allocation operates on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum AllocTarget {
    /// Allocate storage on free (empty) spans and write headers.
    Free,
}
