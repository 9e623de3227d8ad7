use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use spider_core::{PageData, PageSink, PageStore, SpiderMode};

/// Two-tier filesystem page store.
///
/// Pages are files named `<index+1, zero-padded>.<ext>`. Download mode
/// writes into the gallery's download directory; read mode writes into the
/// cache directory. Lookups and removals cover both tiers, so a gallery
/// read before being downloaded keeps its cached pages usable.
pub struct SpiderDen {
    download_dir: Option<PathBuf>,
    cache_dir: PathBuf,
    mode: Mutex<SpiderMode>,
}

impl SpiderDen {
    pub fn new(cache_dir: impl Into<PathBuf>, download_dir: Option<PathBuf>) -> Self {
        SpiderDen {
            download_dir,
            cache_dir: cache_dir.into(),
            mode: Mutex::new(SpiderMode::Read),
        }
    }

    fn file_stem(index: u32) -> String {
        format!("{:08}", index + 1)
    }

    /// Directory new pages are written to under the current mode.
    fn active_dir(&self) -> &Path {
        match (*self.mode.lock().unwrap(), &self.download_dir) {
            (SpiderMode::Download, Some(dir)) => dir,
            _ => &self.cache_dir,
        }
    }

    fn tiers(&self) -> Vec<&Path> {
        let mut dirs = Vec::new();
        if let Some(dir) = &self.download_dir {
            dirs.push(dir.as_path());
        }
        dirs.push(self.cache_dir.as_path());
        dirs
    }

    /// Locate a stored page in either tier, whatever its extension.
    async fn find(&self, index: u32) -> Option<PathBuf> {
        let stem = Self::file_stem(index);
        for dir in self.tiers() {
            let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.file_stem().and_then(|s| s.to_str()) == Some(stem.as_str()) {
                    return Some(path);
                }
            }
        }
        None
    }
}

#[async_trait]
impl PageStore for SpiderDen {
    fn set_mode(&self, mode: SpiderMode) {
        *self.mode.lock().unwrap() = mode;
    }

    async fn contains(&self, index: u32) -> bool {
        self.find(index).await.is_some()
    }

    async fn open_output(&self, index: u32, extension: &str) -> Option<Box<dyn PageSink>> {
        let dir = self.active_dir().to_path_buf();
        if tokio::fs::create_dir_all(&dir).await.is_err() {
            return None;
        }
        let path = dir.join(format!("{}.{}", Self::file_stem(index), extension));
        match File::create(&path).await {
            Ok(file) => Some(Box::new(FileSink { file })),
            Err(e) => {
                tracing::warn!("Cannot create page file {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn open_input(&self, index: u32) -> Option<Box<dyn PageData>> {
        let path = self.find(index).await?;
        Some(Box::new(FileData { path }))
    }

    async fn remove(&self, index: u32) {
        let stem = Self::file_stem(index);
        for dir in self.tiers() {
            let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.file_stem().and_then(|s| s.to_str()) == Some(stem.as_str()) {
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
    }

    fn download_dir(&self) -> Option<PathBuf> {
        self.download_dir.clone()
    }
}

struct FileSink {
    file: File,
}

#[async_trait]
impl PageSink for FileSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush().await
    }
}

struct FileData {
    path: PathBuf,
}

#[async_trait]
impl PageData for FileData {
    async fn read_all(&mut self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }
}
