use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use colored::Colorize;
use indicatif::{HumanBytes, MultiProgress, ProgressDrawTarget};
use std::path::PathBuf;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::downloader::{Downloader, TaskOutcome};
use crate::planner;
use crate::state::{self, StateStore, Task, STATE_FILE};
use crate::utils;

pub struct Options {
    pub connections: usize,
    pub skip_tls: bool,
    pub work_dir: PathBuf,
}

/// Fresh download: probe, plan, run. An existing working directory for the
/// same url is stale (or finished) and is removed first.
pub async fn get(url: String, options: Options, token: CancellationToken) -> Result<()> {
    if !utils::is_url(&url) {
        bail!("'{}' is not a valid http(s) url", url);
    }

    let store = StateStore::new(options.work_dir.clone());
    let name = utils::task_name_from_url(&url);
    let dir = store.task_dir(&name);

    let existed = dir.exists();
    fs::create_dir_all(&dir)
        .await
        .context("failed to create task directory")?;
    // Take the lock before touching anything: a second invocation for the
    // same url must fail fast, not clear a directory another run is using.
    let _lock = state::lock_task_dir(&dir)?;
    if existed {
        println!(
            "{}",
            "A task for this url already exists, removing it first".yellow()
        );
        state::clear_task_dir(&dir)
            .await
            .context("failed to clear existing task directory")?;
    }

    let downloader = Downloader::new(options.skip_tls, console_progress())?;
    let info = downloader.probe(&url).await?;
    if !info.resumable {
        println!(
            "{}",
            "Server does not accept range requests, downloading with a single connection".yellow()
        );
    }

    let segments = planner::plan(info.total_size, options.connections, info.resumable);
    let task = Task {
        url,
        resumable: info.resumable,
        segments,
        dir,
    };

    run_and_report(&downloader, task, &store, &name, token).await
}

/// Continues a checkpointed task, addressed either by its name or by the
/// original url.
pub async fn resume(target: String, options: Options, token: CancellationToken) -> Result<()> {
    let name = if utils::is_url(&target) {
        utils::task_name_from_url(&target)
    } else {
        target
    };

    let store = StateStore::new(options.work_dir.clone());
    let task = store.load(&name).await?;
    let _lock = state::lock_task_dir(&task.dir)?;

    let downloader = Downloader::new(options.skip_tls, console_progress())?;
    run_and_report(&downloader, task, &store, &name, token).await
}

/// Lists the tasks that still have a resume record under the tasks root.
pub async fn tasks(options: Options) -> Result<()> {
    let root = options.work_dir;
    if !root.exists() {
        println!("No ongoing tasks.");
        return Ok(());
    }

    println!(
        "{:<40} {:>12} {:>12} {:<17}",
        "Task", "Saved", "Total", "Checkpointed"
    );
    let mut found_any = false;

    let mut entries = fs::read_dir(&root)
        .await
        .with_context(|| format!("failed to read {}", root.display()))?;
    let store = StateStore::new(root.clone());
    while let Some(entry) = entries.next_entry().await? {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Ok(task) = store.load(&name).await else {
            continue;
        };

        let total = task
            .total_size()
            .map(|t| HumanBytes(t).to_string())
            .unwrap_or_else(|| "?".to_string());
        let checkpointed = fs::metadata(entry.path().join(STATE_FILE))
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(|mtime| {
                let local: DateTime<Local> = mtime.into();
                local.format("%Y-%m-%d %H:%M").to_string()
            })
            .unwrap_or_default();

        println!(
            "{:<40} {:>12} {:>12} {:<17}",
            name,
            HumanBytes(task.downloaded_bytes()).to_string(),
            total,
            checkpointed
        );
        found_any = true;
    }

    if !found_any {
        println!("No ongoing tasks.");
    }
    Ok(())
}

async fn run_and_report(
    downloader: &Downloader,
    task: Task,
    store: &StateStore,
    name: &str,
    token: CancellationToken,
) -> Result<()> {
    // The final file lands in the directory the user invoked us from.
    let destination = PathBuf::from(name);
    match downloader.run_task(task, store, &destination, token).await? {
        TaskOutcome::Completed(path) => {
            println!("Saved to {}", path.display());
        }
        TaskOutcome::Checkpointed => {
            println!(
                "{}",
                format!("Interrupted, resume later with: rget resume {}", name).yellow()
            );
        }
        TaskOutcome::Discarded => {
            println!(
                "{}",
                "Interrupted, but the source does not support resume; progress discarded".yellow()
            );
        }
    }
    Ok(())
}

fn console_progress() -> MultiProgress {
    let progress = MultiProgress::new();
    // Draw to stderr at a fixed rate so output stays sane when redirected.
    progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    progress
}
