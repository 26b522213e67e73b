//! qed-ls binary entry point.
//!
//! stdout carries the protocol, so logs go to a file (or nowhere): the
//! primary location is `~/.qed-ls/logs/qed-ls.log`, with a workspace-local
//! fallback for constrained environments.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use qed_core::CmdLine;
use qed_prover::BasicProver;

#[derive(Debug, Parser)]
#[command(name = "qed-ls", version, about = "Language server for the qed proof assistant")]
struct Args {
    /// Append logs to this file instead of the default location.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Tracing filter, e.g. "info" or "qed_lsp=debug".
    #[arg(long)]
    log_filter: Option<String>,
    /// Enable prover debug mode for every workspace.
    #[arg(long)]
    debug: bool,
}

fn init_tracing(args: &Args) {
    let env_filter = args
        .log_filter
        .as_deref()
        .and_then(|filter| EnvFilter::try_new(filter).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file(args);

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No writable log location: prefer silence over corrupting the
    // protocol stream on stdout.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file(args: &Args) -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates(args) {
        if let Some(parent) = candidate.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warnings.push(format!("failed to create log dir {}: {e}", parent.display()));
                continue;
            }
        }
        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!("failed to open log file {}: {e}", candidate.display()));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates(args: &Args) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = &args.log_file {
        candidates.push(path.clone());
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(
            PathBuf::from(home)
                .join(".qed-ls")
                .join("logs")
                .join("qed-ls.log"),
        );
    }
    candidates.push(PathBuf::from(".qed-ls").join("logs").join("qed-ls.log"));
    candidates
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let cmdline = CmdLine {
        debug: args.debug,
        ..CmdLine::default()
    };

    let code = qed_lsp::run(
        BasicProver::new(),
        cmdline,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await?;

    std::process::exit(code);
}
