use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use rget::{commands, utils};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Number of parallel connections (defaults to number of logical CPUs)
    #[arg(short = 'n', long, global = true)]
    connections: Option<usize>,

    /// Skip TLS certificate verification for https
    #[arg(short = 'k', long, global = true)]
    skip_tls: bool,

    /// Directory holding in-progress task state (defaults to ~/.rget)
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a url into the current directory
    Get { url: String },
    /// Resume an interrupted task, by name or by original url
    Resume { task: String },
    /// List tasks that can be resumed
    Tasks,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let options = commands::Options {
        connections: args.connections.unwrap_or_else(num_cpus::get),
        skip_tls: args.skip_tls,
        work_dir: args.work_dir.unwrap_or_else(utils::default_work_dir),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let token = CancellationToken::new();
        let signal_token = token.clone();
        tokio::spawn(async move {
            // Cancellation is idempotent, so repeated Ctrl+C is harmless.
            if tokio::signal::ctrl_c().await.is_ok() {
                signal_token.cancel();
            }
        });

        match args.command {
            Command::Get { url } => commands::get(url, options, token).await,
            Command::Resume { task } => commands::resume(task, options, token).await,
            Command::Tasks => commands::tasks(options).await,
        }
    })
}
