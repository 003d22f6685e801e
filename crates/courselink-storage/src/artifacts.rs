//! Immutable, content-addressed copies of fetched catalog pages.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    pub content_hash: String,
    /// Relative to the store root.
    pub relative_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes were already on disk for this kind and day.
    pub deduplicated: bool,
}

/// Pages land at `<root>/<kind>/<YYYY-MM-DD>/<hash[..2]>/<hash>.html` and are never rewritten.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_path(&self, fetched_at: DateTime<Utc>, page_kind: &str, content_hash: &str) -> PathBuf {
        let shard = content_hash.get(..2).unwrap_or("00");
        PathBuf::from(page_kind)
            .join(fetched_at.format("%Y-%m-%d").to_string())
            .join(shard)
            .join(format!("{content_hash}.html"))
    }

    /// Write `html` unless an identical page is already stored under the same kind and day.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        page_kind: &str,
        html: &[u8],
    ) -> anyhow::Result<StoredPage> {
        let content_hash = sha256_hex(html);
        let relative_path = self.page_path(fetched_at, page_kind, &content_hash);
        let target = self.root.join(&relative_path);
        let mut page = StoredPage {
            content_hash,
            relative_path,
            byte_size: html.len(),
            deduplicated: true,
        };

        if fs::try_exists(&target)
            .await
            .with_context(|| format!("checking {}", target.display()))?
        {
            return Ok(page);
        }

        let dir = target.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        // Staged beside the target, then linked in: the link fails rather than
        // clobber when a concurrent writer got there first.
        let staging = dir.join(format!(".{}.partial", Uuid::new_v4()));
        fs::write(&staging, html)
            .await
            .with_context(|| format!("writing {}", staging.display()))?;
        let linked = fs::hard_link(&staging, &target).await;
        let _ = fs::remove_file(&staging).await;
        match linked {
            Ok(()) => page.deduplicated = false,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err).with_context(|| format!("linking page into {}", target.display())),
        }
        Ok(page)
    }
}
