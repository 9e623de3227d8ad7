use async_trait::async_trait;

use crate::error::SourceError;

/// One `(page index, pToken)` pair scraped from a preview page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewEntry {
    pub index: u32,
    pub ptoken: String,
}

/// Parsed result of one gallery detail page: the counts and one preview set.
#[derive(Debug, Clone)]
pub struct GalleryPreviews {
    pub pages: u32,
    pub preview_pages: u32,
    pub previews: Vec<PreviewEntry>,
}

/// Parsed result of an image page: where the file actually lives, plus the
/// one-shot bypass key for retrying against a different source.
#[derive(Debug, Clone)]
pub struct ImagePage {
    pub image_url: String,
    pub skip_hath_key: Option<String>,
}

/// The gallery site: fetches and parses the HTML the spider needs. Failures
/// arrive pre-classified as [`SourceError`] so the worker can map them onto
/// page errors.
#[async_trait]
pub trait GallerySource: Send + Sync + 'static {
    /// Fetch and parse one page of the gallery's preview index.
    async fn preview_page(
        &self,
        gid: u64,
        token: &str,
        preview_index: u32,
    ) -> Result<GalleryPreviews, SourceError>;

    /// Fetch and parse the page that resolves one index to an image URL.
    /// `skip_hath_key` is appended as the `nl` bypass parameter on retry.
    async fn image_page(
        &self,
        gid: u64,
        index: u32,
        ptoken: &str,
        skip_hath_key: Option<&str>,
    ) -> Result<ImagePage, SourceError>;

    /// Open an image URL for streaming download.
    async fn open_image(&self, url: &str) -> Result<Box<dyn ImageBody>, SourceError>;
}

/// A streaming image response body.
#[async_trait]
pub trait ImageBody: Send {
    fn content_length(&self) -> Option<u64>;

    /// Next chunk of the body; `Ok(None)` on EOF.
    async fn chunk(&mut self) -> std::io::Result<Option<Vec<u8>>>;
}
