use sha2::{Digest, Sha256};
use std::path::PathBuf;
use url::Url;

pub fn is_url(candidate: &str) -> bool {
    match Url::parse(candidate) {
        Ok(url) => matches!(url.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

/// Deterministic task name for a url: the sanitized final path segment, or a
/// short digest of the url when the path has no usable file name. The same
/// url must always map to the same task directory or resume breaks.
pub fn task_name_from_url(url_str: &str) -> String {
    if let Ok(url) = Url::parse(url_str) {
        if let Some(segments) = url.path_segments() {
            if let Some(filename) = segments.last() {
                if !filename.is_empty() {
                    return sanitize_filename(filename);
                }
            }
        }
    }

    let digest = Sha256::digest(url_str.as_bytes());
    format!("task_{}", hex::encode(&digest[..6]))
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(
        |c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_',
        "_",
    )
}

pub fn segment_file_name(index: usize) -> String {
    format!("segment.{}", index)
}

pub fn default_work_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rget")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_http_urls() {
        assert!(is_url("http://example.com/a.iso"));
        assert!(is_url("https://example.com/a.iso"));
        assert!(!is_url("ftp://example.com/a.iso"));
        assert!(!is_url("a.iso"));
    }

    #[test]
    fn task_name_uses_final_path_segment() {
        assert_eq!(
            task_name_from_url("https://example.com/dir/ubuntu-24.04.iso"),
            "ubuntu-24.04.iso"
        );
    }

    #[test]
    fn task_name_sanitizes_special_characters() {
        assert_eq!(
            task_name_from_url("https://example.com/a%20b.iso"),
            "a_20b.iso"
        );
    }

    #[test]
    fn task_name_is_stable_for_bare_hosts() {
        let a = task_name_from_url("https://example.com/");
        let b = task_name_from_url("https://example.com/");
        assert_eq!(a, b);
        assert!(a.starts_with("task_"));
    }

    #[test]
    fn segment_files_are_named_by_index() {
        assert_eq!(segment_file_name(0), "segment.0");
        assert_eq!(segment_file_name(12), "segment.12");
    }
}
