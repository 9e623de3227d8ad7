use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Result, SPIDER_INFO_FILENAME};

/// Persistent per-gallery metadata: how many pages the gallery has, how its
/// preview index is paginated, and every pToken observed so far.
///
/// The record is written through to two locations, `<download_dir>/.ehviewer`
/// and `<cache_dir>/<gid>`, and read back preferring the download-dir copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiderInfo {
    pub gid: u64,
    pub token: String,
    pub pages: u32,
    pub preview_pages: u32,
    pub preview_per_page: u32,
    /// Sparse page index -> pToken map. `"failed"` marks an exhausted index.
    pub tokens: BTreeMap<u32, String>,
}

impl SpiderInfo {
    pub fn download_path(download_dir: &Path) -> PathBuf {
        download_dir.join(SPIDER_INFO_FILENAME)
    }

    pub fn cache_path(cache_dir: &Path, gid: u64) -> PathBuf {
        cache_dir.join(gid.to_string())
    }

    pub async fn read_from(path: &Path) -> Result<SpiderInfo> {
        let data = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Load the record from the download directory, falling back to the cache
    /// directory. A missing or unreadable file and a record whose identity
    /// disagrees with `gid`/`token` both yield `None`.
    pub async fn load(
        download_dir: Option<&Path>,
        cache_dir: &Path,
        gid: u64,
        token: &str,
    ) -> Option<SpiderInfo> {
        let mut paths = Vec::new();
        if let Some(dir) = download_dir {
            paths.push(Self::download_path(dir));
        }
        paths.push(Self::cache_path(cache_dir, gid));

        for path in paths {
            match Self::read_from(&path).await {
                Ok(info) if info.gid == gid && info.token == token => return Some(info),
                Ok(info) => {
                    tracing::warn!(
                        "Discarded spider info at {}: expected gallery {}, found {}",
                        path.display(),
                        gid,
                        info.gid
                    );
                }
                Err(_) => {}
            }
        }
        None
    }

    /// Write the record to both locations. Both writes are best-effort: a
    /// failed write is logged and the spider keeps running on the in-memory
    /// copy.
    pub async fn write_through(&self, download_dir: Option<&Path>, cache_dir: &Path) {
        let mut paths = vec![Self::cache_path(cache_dir, self.gid)];
        if let Some(dir) = download_dir {
            paths.push(Self::download_path(dir));
        }

        let data = match serde_json::to_vec(self) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Cannot serialize spider info for gallery {}: {}", self.gid, e);
                return;
            }
        };
        for path in paths {
            if let Err(e) = tokio::fs::write(&path, &data).await {
                tracing::warn!("Cannot write spider info to {}: {}", path.display(), e);
            }
        }
    }
}
