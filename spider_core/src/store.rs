use std::path::PathBuf;

use async_trait::async_trait;

/// How the gallery is being consumed. Download mode targets the persistent
/// download directory and drives the bulk cursor; read mode targets the
/// cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiderMode {
    Read,
    Download,
}

/// The page store: an external byte sink/source keyed by page index.
#[async_trait]
pub trait PageStore: Send + Sync + 'static {
    /// The store may switch its persistence target when the mode changes.
    fn set_mode(&self, mode: SpiderMode);

    async fn contains(&self, index: u32) -> bool;

    /// Open a sink for the page content. `None` means the store cannot take
    /// the page, which fails the download.
    async fn open_output(&self, index: u32, extension: &str) -> Option<Box<dyn PageSink>>;

    /// Open a stored page for reading. `None` when the page is absent.
    async fn open_input(&self, index: u32) -> Option<Box<dyn PageData>>;

    /// Drop whatever the store holds for the index, including partial writes.
    async fn remove(&self, index: u32);

    /// The download directory, when one backs the store. SpiderInfo is
    /// written through to it.
    fn download_dir(&self) -> Option<PathBuf>;
}

/// An exclusively owned page sink; closing is dropping.
#[async_trait]
pub trait PageSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()>;
    async fn flush(&mut self) -> std::io::Result<()>;
}

/// An exclusively owned page source.
#[async_trait]
pub trait PageData: Send {
    async fn read_all(&mut self) -> std::io::Result<Vec<u8>>;
}

/// Decodes a raw downloaded page into an in-memory image. Runs on a blocking
/// thread; `None` means the bytes are not a decodable image.
pub trait ImageDecoder: Send + Sync + 'static {
    fn decode(&self, data: &[u8]) -> Option<image::DynamicImage>;
}
