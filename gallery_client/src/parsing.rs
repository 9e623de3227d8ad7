use scraper::{ElementRef, Html};

use spider_core::{GalleryPreviews, ImagePage, PreviewEntry};

use crate::error::{Error, Result};

pub fn parse_ban(doc: &Html) -> Option<String> {
    doc.root_element()
        .text()
        .find(|s| s.contains("The ban expires in"))
        .map(|s| s.to_string())
}

/// Parse one page of the gallery detail view: the image count, the preview
/// page count, and the preview set the page carries.
pub fn parse_preview_page(doc: &Html) -> Result<GalleryPreviews> {
    use super::selectors::gallery::*;

    fn parse_image_count(doc: &Html) -> Option<u32> {
        let text = doc.select(&IMAGE_COUNT).next()?.text().next()?.trim();
        text.split_whitespace().next()?.parse::<u32>().ok()
    }

    fn parse_preview_page_count(doc: &Html) -> Option<u32> {
        let text = doc.select(&PREVIEW_PAGE_COUNT).next()?.text().next()?.trim();
        text.split_whitespace().next()?.parse::<u32>().ok()
    }

    fn parse_preview(e: ElementRef) -> Option<PreviewEntry> {
        let url = e.value().attr("href")?;
        let ptoken = url.strip_prefix("https://")?.split('/').nth(2)?.to_string();
        let page = url.split('-').next_back()?.parse::<u32>().ok()?;
        Some(PreviewEntry { index: page - 1, ptoken })
    }

    let pages = parse_image_count(doc).ok_or(Error::InvalidHTML("image count".to_string()))?;
    let preview_pages =
        parse_preview_page_count(doc).ok_or(Error::InvalidHTML("preview page count".to_string()))?;
    let previews = doc
        .select(&PREVIEWS)
        .map(parse_preview)
        .collect::<Option<Vec<_>>>()
        .ok_or(Error::InvalidHTML("previews".to_string()))?;

    Ok(GalleryPreviews { pages, preview_pages, previews })
}

/// Parse an image page: the image URL and the optional one-shot bypass key
/// offered by the "click here if the image fails" link.
pub fn parse_image_page(doc: &Html) -> Result<ImagePage> {
    use super::selectors::image::*;

    fn parse_url(doc: &Html) -> Option<String> {
        Some(doc.select(&URL).next()?.value().attr("src")?.to_string())
    }

    fn parse_skip_hath_key(doc: &Html) -> Option<String> {
        let onclick = doc.select(&LOAD_FAIL).next()?.value().attr("onclick")?;
        let start = onclick.find("nl('")? + 4;
        let end = onclick[start..].find("')")? + start;
        (end > start).then(|| onclick[start..end].to_string())
    }

    let image_url = parse_url(doc).ok_or(Error::InvalidHTML("image url".to_string()))?;
    let skip_hath_key = parse_skip_hath_key(doc);

    Ok(ImagePage { image_url, skip_hath_key })
}
