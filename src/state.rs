use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

pub const STATE_FILE: &str = "state.json";
pub const LOCK_FILE: &str = ".lock";

/// One contiguous byte range of the resource, downloaded independently.
/// `range_end` is inclusive; it is absent when the total size is unknown
/// and the segment simply runs to the end of the body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub index: usize,
    pub range_start: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub range_end: Option<u64>,
    pub downloaded_bytes: u64,
}

impl Segment {
    pub fn new(index: usize, range_start: u64, range_end: Option<u64>) -> Self {
        Self {
            index,
            range_start,
            range_end,
            downloaded_bytes: 0,
        }
    }

    /// Total length of the range, when bounded.
    pub fn len(&self) -> Option<u64> {
        self.range_end.map(|end| end - self.range_start + 1)
    }

    pub fn is_complete(&self) -> bool {
        self.len().map_or(false, |len| self.downloaded_bytes >= len)
    }

    /// First byte a (re)started worker should request.
    pub fn next_byte(&self) -> u64 {
        self.range_start + self.downloaded_bytes
    }
}

/// One end-to-end download attempt for a given url.
#[derive(Debug, Clone)]
pub struct Task {
    pub url: String,
    pub resumable: bool,
    pub segments: Vec<Segment>,
    pub dir: PathBuf,
}

impl Task {
    /// Sum of all segment lengths, or None if any segment is unbounded.
    pub fn total_size(&self) -> Option<u64> {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.downloaded_bytes).sum()
    }
}

/// The persisted resume record. Written wholesale on checkpoint, read once
/// at resume. Kept as pretty-printed JSON so interrupted tasks can be
/// inspected and diffed by hand.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    source_url: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("no saved state for task '{0}'")]
    NotFound(String),
    #[error("saved state for task '{0}' is corrupt: {1}")]
    Corrupt(String, #[source] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads and writes the per-task resume record under a fixed tasks root.
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn task_dir(&self, task_name: &str) -> PathBuf {
        self.root.join(task_name)
    }

    /// Atomically overwrites the resume record for the task's working
    /// directory with the current segment snapshot.
    pub async fn save(&self, task: &Task) -> Result<()> {
        let state = PersistedState {
            source_url: task.url.clone(),
            segments: task.segments.clone(),
        };
        let content = serde_json::to_string_pretty(&state)?;
        let path = task.dir.join(STATE_FILE);
        let tmp = task.dir.join(format!("{}.tmp", STATE_FILE));
        fs::write(&tmp, content)
            .await
            .context("failed to write state file")?;
        fs::rename(&tmp, &path)
            .await
            .context("failed to replace state file")?;
        Ok(())
    }

    /// Reconstructs a resumable task exactly as last checkpointed, so
    /// workers pick up mid-segment instead of refetching saved bytes.
    pub async fn load(&self, task_name: &str) -> Result<Task, StateError> {
        let dir = self.task_dir(task_name);
        let path = dir.join(STATE_FILE);
        if !path.exists() {
            return Err(StateError::NotFound(task_name.to_string()));
        }
        let content = fs::read_to_string(&path).await?;
        let state: PersistedState = serde_json::from_str(&content)
            .map_err(|e| StateError::Corrupt(task_name.to_string(), e))?;
        Ok(Task {
            url: state.source_url,
            resumable: true,
            segments: state.segments,
            dir,
        })
    }
}

/// Advisory exclusive lock on a task working directory. Held for the whole
/// run so two invocations can never write the same directory; released when
/// dropped.
pub struct TaskLock {
    _file: std::fs::File,
}

pub fn lock_task_dir(dir: &Path) -> Result<TaskLock> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(dir.join(LOCK_FILE))
        .context("failed to open lock file")?;
    file.try_lock_exclusive()
        .context("task is already being downloaded by another process")?;
    Ok(TaskLock { _file: file })
}

/// Removes the previous contents of a task directory. The lock file stays:
/// replacing it would let a third invocation lock a fresh file while the
/// current one still holds the old one.
pub async fn clear_task_dir(dir: &Path) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .await
        .context("failed to read task directory")?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name() == LOCK_FILE {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_task(dir: PathBuf) -> Task {
        Task {
            url: "http://example.com/archive.tar.gz".to_string(),
            resumable: true,
            segments: vec![
                Segment {
                    index: 0,
                    range_start: 0,
                    range_end: Some(249),
                    downloaded_bytes: 250,
                },
                Segment {
                    index: 1,
                    range_start: 250,
                    range_end: Some(499),
                    downloaded_bytes: 100,
                },
                Segment {
                    index: 2,
                    range_start: 500,
                    range_end: None,
                    downloaded_bytes: 0,
                },
            ],
            dir,
        }
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let root = tempdir().unwrap();
        let store = StateStore::new(root.path().to_path_buf());
        let dir = store.task_dir("archive.tar.gz");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let task = sample_task(dir);

        store.save(&task).await.unwrap();
        let loaded = store.load("archive.tar.gz").await.unwrap();

        assert_eq!(loaded.url, task.url);
        assert!(loaded.resumable);
        assert_eq!(loaded.segments, task.segments);
    }

    #[tokio::test]
    async fn save_overwrites_previous_record() {
        let root = tempdir().unwrap();
        let store = StateStore::new(root.path().to_path_buf());
        let dir = store.task_dir("archive.tar.gz");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let mut task = sample_task(dir);

        store.save(&task).await.unwrap();
        task.segments[1].downloaded_bytes = 200;
        store.save(&task).await.unwrap();

        let loaded = store.load("archive.tar.gz").await.unwrap();
        assert_eq!(loaded.segments[1].downloaded_bytes, 200);
    }

    #[tokio::test]
    async fn load_missing_task_is_not_found() {
        let root = tempdir().unwrap();
        let store = StateStore::new(root.path().to_path_buf());
        match store.load("nope").await {
            Err(StateError::NotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("expected NotFound, got {:?}", other.map(|t| t.url)),
        }
    }

    #[tokio::test]
    async fn load_malformed_record_is_corrupt() {
        let root = tempdir().unwrap();
        let store = StateStore::new(root.path().to_path_buf());
        let dir = store.task_dir("broken");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(STATE_FILE), "{ not json")
            .await
            .unwrap();
        assert!(matches!(
            store.load("broken").await,
            Err(StateError::Corrupt(_, _))
        ));
    }

    #[tokio::test]
    async fn clear_task_dir_keeps_the_lock_file() {
        let dir = tempdir().unwrap();
        let held = lock_task_dir(dir.path()).unwrap();
        tokio::fs::write(dir.path().join("segment.0"), b"abc")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(STATE_FILE), b"{}")
            .await
            .unwrap();

        clear_task_dir(dir.path()).await.unwrap();

        assert!(!dir.path().join("segment.0").exists());
        assert!(!dir.path().join(STATE_FILE).exists());
        assert!(dir.path().join(LOCK_FILE).exists());
        // Still the same lock: a second taker keeps failing.
        assert!(lock_task_dir(dir.path()).is_err());
        drop(held);
    }

    #[test]
    fn lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let held = lock_task_dir(dir.path()).unwrap();
        assert!(lock_task_dir(dir.path()).is_err());
        drop(held);
        assert!(lock_task_dir(dir.path()).is_ok());
    }

    #[test]
    fn segment_progress_helpers() {
        let mut segment = Segment::new(1, 250, Some(499));
        assert_eq!(segment.len(), Some(250));
        assert!(!segment.is_complete());
        segment.downloaded_bytes = 100;
        assert_eq!(segment.next_byte(), 350);
        segment.downloaded_bytes = 250;
        assert!(segment.is_complete());

        let open_ended = Segment::new(0, 0, None);
        assert_eq!(open_ended.len(), None);
        assert!(!open_ended.is_complete());
    }
}
