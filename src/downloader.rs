use anyhow::{bail, Context, Result};
use futures::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reqwest::{header, Client, StatusCode};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::joiner;
use crate::state::{Segment, StateStore, Task};
use crate::utils::segment_file_name;

/// What the preliminary request told us about the resource.
pub struct ResourceInfo {
    pub total_size: Option<u64>,
    pub resumable: bool,
}

/// Terminal report of a single segment worker.
enum SegmentOutcome {
    Completed(Segment),
    Interrupted(Segment),
    Failed(Segment, anyhow::Error),
}

/// How a whole task ended, short of an error.
#[derive(Debug)]
pub enum TaskOutcome {
    /// All segments finished and were joined into the destination file.
    Completed(PathBuf),
    /// Cancelled mid-flight; progress was saved for a later resume.
    Checkpointed,
    /// Cancelled mid-flight, but the source does not support ranges, so the
    /// partial download was discarded.
    Discarded,
}

pub struct Downloader {
    client: Client,
    progress: MultiProgress,
}

impl Downloader {
    pub fn new(skip_tls: bool, progress: MultiProgress) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("rget/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(10))
            .danger_accept_invalid_certs(skip_tls)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client, progress })
    }

    /// Preliminary request: resource size and whether the server honors
    /// byte-range requests.
    pub async fn probe(&self, url: &str) -> Result<ResourceInfo> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;
        if !response.status().is_success() {
            bail!("server returned {} for {}", response.status(), url);
        }

        let resumable = response
            .headers()
            .get(header::ACCEPT_RANGES)
            .map(|v| v.as_bytes() == b"bytes")
            .unwrap_or(false);
        let total_size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        Ok(ResourceInfo {
            total_size,
            resumable,
        })
    }

    /// Runs the whole task to a terminal state: spawns one worker per
    /// segment, multiplexes their outcomes with the external cancellation
    /// signal, and finishes by joining, checkpointing, or discarding.
    ///
    /// A single failed segment aborts the task; nothing is written to the
    /// destination in that case.
    pub async fn run_task(
        &self,
        mut task: Task,
        store: &StateStore,
        destination: &Path,
        token: CancellationToken,
    ) -> Result<TaskOutcome> {
        let total_size = task.total_size();
        let pb = self.progress.add(ProgressBar::new(total_size.unwrap_or(0)));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
                .unwrap()
                .progress_chars("=>-"),
        );
        pb.set_message(format!("Downloading {}", task.url));
        pb.set_position(task.downloaded_bytes());

        let segments = std::mem::take(&mut task.segments);
        // Workers watch a child token: fail-fast can stop them without
        // cancelling the caller's token.
        let worker_token = token.child_token();
        let (tx, mut rx) = mpsc::channel::<SegmentOutcome>(segments.len().max(1));
        let mut pending = 0usize;
        let mut reported: Vec<Segment> = Vec::with_capacity(segments.len());

        for segment in segments {
            // A segment checkpointed as fully downloaded needs no worker.
            if segment.is_complete() {
                reported.push(segment);
                continue;
            }

            let client = self.client.clone();
            let url = task.url.clone();
            let path = task.dir.join(segment_file_name(segment.index));
            let resumable = task.resumable;
            let token = worker_token.clone();
            let pb = pb.clone();
            let tx = tx.clone();

            pending += 1;
            tokio::spawn(async move {
                let outcome = fetch_segment(client, url, segment, path, resumable, token, pb).await;
                // The receiver only goes away once every worker reported.
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        let mut failure: Option<anyhow::Error> = None;
        let mut interrupted = false;

        // Event loop: drain every worker outcome, even after a failure or a
        // cancellation, so the segment snapshot is accurate when we decide.
        while pending > 0 {
            let Some(outcome) = rx.recv().await else { break };
            pending -= 1;
            match outcome {
                SegmentOutcome::Completed(segment) => reported.push(segment),
                SegmentOutcome::Interrupted(segment) => {
                    interrupted = true;
                    reported.push(segment);
                }
                SegmentOutcome::Failed(segment, cause) => {
                    if failure.is_none() {
                        // Fail fast: stop the other workers, then keep
                        // draining until they all report.
                        worker_token.cancel();
                        failure =
                            Some(cause.context(format!("segment {} failed", segment.index)));
                    }
                    reported.push(segment);
                }
            }
        }

        if let Some(cause) = failure {
            pb.abandon_with_message("failed");
            if !task.resumable {
                // Nothing worth keeping for an unresumable task.
                let _ = fs::remove_dir_all(&task.dir).await;
            }
            return Err(cause);
        }

        reported.sort_by_key(|s| s.index);
        task.segments = reported;

        if interrupted || token.is_cancelled() {
            if task.resumable {
                store
                    .save(&task)
                    .await
                    .context("failed to save resume state")?;
                pb.abandon_with_message("interrupted, progress saved");
                return Ok(TaskOutcome::Checkpointed);
            }
            fs::remove_dir_all(&task.dir)
                .await
                .context("failed to remove task working directory")?;
            pb.abandon_with_message("interrupted, not resumable");
            return Ok(TaskOutcome::Discarded);
        }

        let files: Vec<PathBuf> = task
            .segments
            .iter()
            .map(|s| task.dir.join(segment_file_name(s.index)))
            .collect();
        joiner::join(&files, destination, total_size, &task.dir).await?;
        pb.finish_with_message(format!("Completed {}", destination.display()));
        Ok(TaskOutcome::Completed(destination.to_path_buf()))
    }
}

/// Downloads one segment into its temp file and reports exactly one outcome.
async fn fetch_segment(
    client: Client,
    url: String,
    mut segment: Segment,
    path: PathBuf,
    resumable: bool,
    token: CancellationToken,
    pb: ProgressBar,
) -> SegmentOutcome {
    match run_segment(&client, &url, &mut segment, &path, resumable, &token, &pb).await {
        Ok(true) => SegmentOutcome::Completed(segment),
        Ok(false) => SegmentOutcome::Interrupted(segment),
        Err(cause) => SegmentOutcome::Failed(segment, cause),
    }
}

/// Ok(true) when the segment finished, Ok(false) when it observed the
/// cancellation signal and stopped at a write boundary.
async fn run_segment(
    client: &Client,
    url: &str,
    segment: &mut Segment,
    path: &Path,
    resumable: bool,
    token: &CancellationToken,
    pb: &ProgressBar,
) -> Result<bool> {
    let mut request = client.get(url);
    let mut ranged = false;
    if resumable && (segment.downloaded_bytes > 0 || segment.range_end.is_some()) {
        // Start past the bytes a previous run already saved.
        let range = match segment.range_end {
            Some(end) => format!("bytes={}-{}", segment.next_byte(), end),
            None => format!("bytes={}-", segment.next_byte()),
        };
        request = request.header(header::RANGE, range);
        ranged = true;
    }

    let response = request
        .send()
        .await
        .context("failed to send range request")?;
    if ranged && response.status() != StatusCode::PARTIAL_CONTENT {
        // A 200 here would be the whole body, appended after bytes we
        // already saved.
        bail!("server ignored range request, answered {}", response.status());
    }
    if !response.status().is_success() {
        bail!("server returned {}", response.status());
    }

    // Append, never truncate: bytes before the cursor are already good.
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => {
                file.flush().await.context("failed to flush segment file")?;
                return Ok(false);
            }
            chunk = stream.next() => match chunk {
                Some(chunk) => chunk.context("error while reading body")?,
                None => break,
            },
        };

        file.write_all(&chunk)
            .await
            .context("error while writing segment file")?;
        segment.downloaded_bytes += chunk.len() as u64;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.context("failed to flush segment file")?;

    if let Some(len) = segment.len() {
        if segment.downloaded_bytes < len {
            bail!(
                "body ended early: got {} of {} bytes",
                segment.downloaded_bytes,
                len
            );
        }
    }
    Ok(true)
}
