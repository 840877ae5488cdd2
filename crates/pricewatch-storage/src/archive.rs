//! Hash-addressed archive of raw fetched HTML.
//!
//! Snapshots keep only the canonical payload; the archive keeps the page as
//! fetched so a blocked or suspicious extraction can be inspected by hand.
//! Pages land under `<domain>/<yyyymmdd>/<sha256>.html`, so identical bodies
//! collapse onto one path. Writes go through a scratch file and a rename;
//! losing the rename race just means someone else archived the same bytes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn page_relative_path(domain: &str, fetched_at: DateTime<Utc>, hash: &str) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        PathBuf::from(domain).join(day).join(format!("{hash}.html"))
    }

    /// Archive one raw page body.
    pub async fn store_page(
        &self,
        domain: &str,
        fetched_at: DateTime<Utc>,
        html: &str,
    ) -> Result<ArchivedPage> {
        let bytes = html.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::page_relative_path(domain, fetched_at, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .expect("page path always has a parent");

        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let already_archived = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        let deduplicated =
            already_archived || !write_once(parent, &absolute_path, bytes).await?;

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Land `bytes` at `target` via a scratch file and a rename. Returns true
/// when this call created the file, false when a concurrent writer got the
/// hash path first.
async fn write_once(parent: &Path, target: &Path, bytes: &[u8]) -> Result<bool> {
    let scratch = parent.join(format!("{}.part", Uuid::new_v4()));
    fs::write(&scratch, bytes)
        .await
        .with_context(|| format!("writing scratch archive file {}", scratch.display()))?;
    match fs::rename(&scratch, target).await {
        Ok(()) => Ok(true),
        Err(err) => {
            let _ = fs::remove_file(&scratch).await;
            if err.kind() == ErrorKind::AlreadyExists {
                Ok(false)
            } else {
                Err(err).with_context(|| {
                    format!("moving archived page into place at {}", target.display())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn same_body_is_archived_once() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at: DateTime<Utc> = "2026-03-01T08:00:00Z".parse().unwrap();

        let first = archive
            .store_page("acme.example", fetched_at, "<html>pricing</html>")
            .await
            .expect("first store");
        let second = archive
            .store_page("acme.example", fetched_at, "<html>pricing</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
        assert!(first.relative_path.starts_with("acme.example"));
    }

    #[tokio::test]
    async fn different_bodies_get_distinct_paths() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at: DateTime<Utc> = "2026-03-01T08:00:00Z".parse().unwrap();

        let a = archive
            .store_page("acme.example", fetched_at, "<html>starter $19</html>")
            .await
            .expect("store a");
        let b = archive
            .store_page("acme.example", fetched_at, "<html>pro $49</html>")
            .await
            .expect("store b");

        assert_ne!(a.absolute_path, b.absolute_path);
        assert!(!a.deduplicated);
        assert!(!b.deduplicated);
    }
}
