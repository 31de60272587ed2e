use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{self, AsyncWriteExt};

/// Concatenates segment files, strictly in the given order, into the final
/// destination, then removes the task working directory. On any failure the
/// working directory is left untouched so the segments can be joined again.
pub async fn join(
    segment_files: &[PathBuf],
    destination: &Path,
    expected_size: Option<u64>,
    work_dir: &Path,
) -> Result<()> {
    let mut output = File::create(destination)
        .await
        .with_context(|| format!("failed to create {}", destination.display()))?;

    let mut written = 0u64;
    for path in segment_files {
        let mut segment = File::open(path)
            .await
            .with_context(|| format!("missing segment file {}", path.display()))?;
        written += io::copy(&mut segment, &mut output)
            .await
            .with_context(|| format!("failed to append {}", path.display()))?;
    }
    output
        .flush()
        .await
        .context("failed to flush destination file")?;
    drop(output);

    if let Some(expected) = expected_size {
        if written != expected {
            bail!(
                "joined file is {} bytes, expected {}",
                written,
                expected
            );
        }
    }

    fs::remove_dir_all(work_dir)
        .await
        .context("failed to remove task working directory")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn concatenates_segments_in_order() {
        let root = tempdir().unwrap();
        let work_dir = root.path().join("task");
        fs::create_dir_all(&work_dir).await.unwrap();

        let mut files = vec![];
        for (i, chunk) in [b"aaa".as_slice(), b"bb", b"cccc"].iter().enumerate() {
            let path = work_dir.join(format!("segment.{}", i));
            fs::write(&path, chunk).await.unwrap();
            files.push(path);
        }

        let dest = root.path().join("out.bin");
        join(&files, &dest, Some(9), &work_dir).await.unwrap();

        assert_eq!(fs::read(&dest).await.unwrap(), b"aaabbcccc");
        assert!(!work_dir.exists());
    }

    #[tokio::test]
    async fn missing_segment_preserves_working_directory() {
        let root = tempdir().unwrap();
        let work_dir = root.path().join("task");
        fs::create_dir_all(&work_dir).await.unwrap();

        let present = work_dir.join("segment.0");
        fs::write(&present, b"abc").await.unwrap();
        let missing = work_dir.join("segment.1");

        let dest = root.path().join("out.bin");
        let result = join(&[present, missing], &dest, None, &work_dir).await;

        assert!(result.is_err());
        assert!(work_dir.exists());
    }

    #[tokio::test]
    async fn size_mismatch_is_an_error() {
        let root = tempdir().unwrap();
        let work_dir = root.path().join("task");
        fs::create_dir_all(&work_dir).await.unwrap();

        let path = work_dir.join("segment.0");
        fs::write(&path, b"abc").await.unwrap();

        let dest = root.path().join("out.bin");
        let result = join(&[path], &dest, Some(10), &work_dir).await;

        assert!(result.is_err());
        assert!(work_dir.exists());
    }
}
