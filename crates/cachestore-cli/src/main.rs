use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cachestore_rs::device::OpenMode;
use cachestore_rs::store::cache::DumpDepth;
use cli::{AllocTarget, Cli, Command, ListScope};

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    let mode = if cli.write {
        info!("writing to physical devices enabled");
        OpenMode::ReadWrite
    } else {
        OpenMode::ReadOnly
    };

    let spans = cli.spans.as_deref();
    let volumes = cli.volumes.as_deref();

    let zret = match cli.command {
        Command::List { scope } => {
            let depth = match scope {
                None => DumpDepth::Span,
                Some(ListScope::Stripes) => DumpDepth::Stripe,
                Some(ListScope::Directory) => DumpDepth::Directory,
            };
            commands::list(spans, mode, depth)
        }
        Command::Clear => commands::clear(spans, mode),
        Command::Volumes => commands::simulate(spans, volumes, mode),
        Command::Alloc {
            target: AllocTarget::Free,
        } => commands::alloc_free(spans, volumes, mode),
    };

    if !zret.is_empty() {
        eprint!("{zret}");
    }
    if zret.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();
}
