mod consts;
mod error;
mod parsing;
mod selectors;

use async_trait::async_trait;
use reqwest::{header, Client, Url};
use scraper::Html;

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use spider_core::{GalleryPreviews, GallerySource, ImageBody, ImagePage, SourceError};

use crate::consts::*;
pub use crate::error::Error;
use crate::error::Result;
use crate::parsing::*;

/// HTML client for the gallery site: builds detail and page URLs, fetches
/// them, and parses out what the spider engine needs.
#[derive(Debug, Clone)]
pub struct GalleryClient {
    pub cookie: GalleryCookie,
    client: reqwest::Client,
}

impl GalleryClient {
    pub fn new(cookie: GalleryCookie) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::COOKIE,
            header::HeaderValue::from_str(&cookie.to_string())
                .map_err(|_| Error::InvalidHTML("cookie".to_string()))?,
        );
        let client = Client::builder().default_headers(headers).build()?;
        Ok(GalleryClient { cookie, client })
    }

    /// One page of the gallery's preview index.
    pub async fn gallery(&self, gid: u64, token: &str, page: u32) -> Result<GalleryPreviews> {
        let path = format!("/g/{}/{}/", gid, token);
        let params = if page > 0 { vec![("p".to_string(), page.to_string())] } else { vec![] };
        let doc = self.fetch(&path, params).await?;
        parse_preview_page(&doc)
    }

    /// The page resolving one index to an image URL. `skip_hath_key` asks
    /// the site for a different file server.
    pub async fn image(
        &self,
        gid: u64,
        index: u32,
        ptoken: &str,
        skip_hath_key: Option<&str>,
    ) -> Result<ImagePage> {
        let path = format!("/s/{}/{}-{}", ptoken, gid, index + 1);
        let params = skip_hath_key
            .map(|key| vec![("nl".to_string(), key.to_string())])
            .unwrap_or_default();
        let doc = self.fetch(&path, params).await?;
        parse_image_page(&doc)
    }
}

impl GalleryClient {
    async fn fetch(&self, path: &str, query: impl IntoIterator<Item = (String, String)>) -> Result<Html> {
        let mut url = Url::parse(BASE_URL)?;
        url.set_path(path);
        url.query_pairs_mut().extend_pairs(query);

        let response = self.client.get(url).send().await?.error_for_status()?;
        let html = response.text().await?;
        log(path, &html).await?;

        let doc = Html::parse_document(&html);
        if let Some(s) = parse_ban(&doc) {
            tracing::warn!("Gallery site ban on {}: {}", path, s);
            return Err(Error::RateLimit(s));
        }
        Ok(doc)
    }
}

#[async_trait]
impl GallerySource for GalleryClient {
    async fn preview_page(
        &self,
        gid: u64,
        token: &str,
        preview_index: u32,
    ) -> std::result::Result<GalleryPreviews, SourceError> {
        self.gallery(gid, token, preview_index).await.map_err(Into::into)
    }

    async fn image_page(
        &self,
        gid: u64,
        index: u32,
        ptoken: &str,
        skip_hath_key: Option<&str>,
    ) -> std::result::Result<ImagePage, SourceError> {
        self.image(gid, index, ptoken, skip_hath_key).await.map_err(Into::into)
    }

    async fn open_image(&self, url: &str) -> std::result::Result<Box<dyn ImageBody>, SourceError> {
        let url = Url::parse(url).map_err(|e| SourceError::InvalidUrl(e.to_string()))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| SourceError::Network(e.to_string()))?;
        Ok(Box::new(ReqwestBody { content_length: response.content_length(), response }))
    }
}

struct ReqwestBody {
    content_length: Option<u64>,
    response: reqwest::Response,
}

#[async_trait]
impl ImageBody for ReqwestBody {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    async fn chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        match self.response.chunk().await {
            Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        }
    }
}

async fn log(path: &str, content: &str) -> Result<()> {
    use std::path::PathBuf;
    use tokio::{fs::File, io::AsyncWriteExt};

    if let Ok(dir) = std::env::var("CLIENT_LOG_DIR") {
        let name = path.strip_prefix('/').unwrap_or(path).replace('/', "_");
        let name = if name.is_empty() { "home" } else { &name };
        let time = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let filepath = PathBuf::from(dir).join(format!("gallery_{}_{}.html", name, time));
        let mut file = File::create(filepath).await?;
        file.write_all(content.as_bytes()).await?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct GalleryCookie {
    pub content: String,
}

impl Display for GalleryCookie {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.content)
    }
}

impl FromStr for GalleryCookie {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(GalleryCookie { content: s.to_string() })
    }
}
