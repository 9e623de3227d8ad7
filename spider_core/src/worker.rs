use std::sync::Arc;

use url::Url;

use crate::error::SourceError;
use crate::spider::GallerySpider;
use crate::token::PToken;
use crate::{text, PageState, ATTEMPTS_PER_PAGE, CHUNK_SIZE, URL_509_SUFFIXES};

/// Why a page download came up empty.
struct DownloadFailure {
    error: Option<String>,
    interrupted: bool,
}

enum StreamEnd {
    Done,
    IoError,
    Interrupted,
}

impl GallerySpider {
    pub(crate) async fn worker_main(self: Arc<Self>, slot_index: usize, id: u64) {
        tracing::debug!("Gallery {}: worker {} started", self.gid, slot_index);
        loop {
            if self.halt_token.is_cancelled() {
                break;
            }
            if !self.run_once().await {
                break;
            }
        }

        // Clear the slot only if it still holds this worker; a replacement
        // may already occupy it.
        let mut slots = self.workers.lock().unwrap();
        if let Some(slot) = &slots[slot_index] {
            if slot.id == id {
                slots[slot_index] = None;
            }
        }
        drop(slots);
        tracing::debug!("Gallery {}: worker {} exited", self.gid, slot_index);
    }

    /// One scheduling round. `false` sends the worker to exit: the scheduler
    /// is drained, or the worker was interrupted.
    async fn run_once(&self) -> bool {
        let Some(pages) = self.states.pages() else {
            return false;
        };

        // 1. Dequeue: force, interactive, preload, then the bulk cursor.
        let next = self.queues.lock().unwrap().next(pages);
        let Some((index, force)) = next else {
            return false;
        };
        if index >= pages {
            return true;
        }

        // 2. Claim the page; someone else may own or have settled it.
        if !self.states.begin_download(index, force) {
            return true;
        }

        // 3. Pages already in the store only need a state catch-up.
        if !force && self.store.contains(index).await {
            self.set_page_state(index, PageState::Finished, None);
            return true;
        }

        // 4. A forced retry gets a fresh token resolution.
        if force {
            if let Some(table) = self.tokens.lock().unwrap().as_mut() {
                table.clear_failed(index);
            }
        }

        // 5. Obtain the pToken, asking the queen when it is missing.
        let ptoken = loop {
            let notified = self.worker_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            enum Lookup {
                Got(String),
                Failed,
                Missing,
            }
            let lookup = {
                let tokens = self.tokens.lock().unwrap();
                match tokens.as_ref().and_then(|table| table.get(index)) {
                    Some(PToken::Token(token)) => Lookup::Got(token.clone()),
                    Some(PToken::Failed) => Lookup::Failed,
                    None => Lookup::Missing,
                }
            };
            match lookup {
                Lookup::Got(token) => break token,
                Lookup::Failed => {
                    self.set_page_state(
                        index,
                        PageState::Failed,
                        Some(text::ERROR_PTOKEN_FAILED.to_string()),
                    );
                    return true;
                }
                Lookup::Missing => {
                    self.token_requests.lock().unwrap().push_back(index);
                    self.queen_notify.notify_one();
                    tokio::select! {
                        _ = self.halt_token.cancelled() => {
                            self.set_page_state(index, PageState::Failed, None);
                            return false;
                        }
                        _ = &mut notified => {}
                    }
                }
            }
        };

        // 6. Download, with one streaming retry.
        match self.download_page(index, &ptoken).await {
            Ok(()) => {
                self.set_page_state(index, PageState::Finished, None);
                true
            }
            Err(failure) => {
                // Partial writes never survive a failed page.
                self.store.remove(index).await;
                self.set_page_state(index, PageState::Failed, failure.error);
                !failure.interrupted
            }
        }
    }

    /// Resolve the page to an image URL and stream the body into the store.
    ///
    /// Resolution failures, rate-limit sentinels, and a refused output pipe
    /// break out immediately; only an I/O failure while opening or streaming
    /// the body consumes the second attempt, which carries the bypass key
    /// from the first resolution.
    async fn download_page(&self, index: u32, ptoken: &str) -> Result<(), DownloadFailure> {
        let mut skip_hath_key: Option<String> = None;
        let mut last_error: Option<String> = None;
        let mut interrupted = false;

        'attempts: for attempt in 0..ATTEMPTS_PER_PAGE {
            if attempt > 0 {
                tracing::debug!("Gallery {}: retrying page {} on another source", self.gid, index);
            }

            // Resolve the image URL, with the bypass key on retry.
            let page = tokio::select! {
                _ = self.halt_token.cancelled() => {
                    interrupted = true;
                    break 'attempts;
                }
                result = self.source.image_page(self.gid, index, ptoken, skip_hath_key.as_deref()) => result,
            };
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!("Gallery {}: cannot resolve page {}: {}", self.gid, index, e);
                    last_error = Some(
                        match e {
                            SourceError::InvalidUrl(_) => text::ERROR_INVALID_URL,
                            SourceError::Network(_) => text::ERROR_SOCKET,
                            SourceError::Parse(_) => text::ERROR_PARSE,
                        }
                        .to_string(),
                    );
                    break 'attempts;
                }
            };
            if URL_509_SUFFIXES.iter().any(|suffix| page.image_url.ends_with(suffix)) {
                tracing::warn!("Gallery {}: page {} hit the 509 limit", self.gid, index);
                for listener in self.listeners.snapshot() {
                    listener.on_get_509(index);
                }
                last_error = Some(text::ERROR_509.to_string());
                break 'attempts;
            }
            skip_hath_key = page.skip_hath_key.clone();

            // Open the body; a network failure here is retryable.
            let body = tokio::select! {
                _ = self.halt_token.cancelled() => {
                    interrupted = true;
                    break 'attempts;
                }
                result = self.source.open_image(&page.image_url) => result,
            };
            let mut body = match body {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!("Gallery {}: cannot open image for page {}: {}", self.gid, index, e);
                    last_error = Some(text::ERROR_SOCKET.to_string());
                    continue 'attempts;
                }
            };

            let extension = image_extension(&page.image_url);
            let Some(mut sink) = self.store.open_output(index, &extension).await else {
                last_error = Some(text::ERROR_WRITE_FAILED.to_string());
                break 'attempts;
            };

            // Stream in fixed-size pieces, publishing progress per piece.
            let content_length = body.content_length();
            let mut received: u64 = 0;
            let end = 'stream: loop {
                let chunk = tokio::select! {
                    _ = self.halt_token.cancelled() => break 'stream StreamEnd::Interrupted,
                    chunk = body.chunk() => chunk,
                };
                match chunk {
                    Ok(Some(data)) => {
                        for piece in data.chunks(CHUNK_SIZE) {
                            let write = tokio::select! {
                                _ = self.halt_token.cancelled() => break 'stream StreamEnd::Interrupted,
                                write = sink.write_chunk(piece) => write,
                            };
                            if write.is_err() {
                                break 'stream StreamEnd::IoError;
                            }
                            received += piece.len() as u64;
                            if let Some(total) = content_length {
                                if total > 0 {
                                    self.states.update_percent(index, received as f32 / total as f32);
                                }
                            }
                            for listener in self.listeners.snapshot() {
                                listener.on_page_download(index, content_length, received, piece.len());
                            }
                        }
                    }
                    Ok(None) => {
                        if sink.flush().await.is_err() {
                            break 'stream StreamEnd::IoError;
                        }
                        break 'stream StreamEnd::Done;
                    }
                    Err(_) => break 'stream StreamEnd::IoError,
                }
            };
            match end {
                StreamEnd::Done => {
                    tracing::info!(
                        "Gallery {}: downloaded page {} ({} bytes)",
                        self.gid,
                        index,
                        received
                    );
                    return Ok(());
                }
                StreamEnd::IoError => {
                    tracing::warn!("Gallery {}: streaming page {} failed", self.gid, index);
                    last_error = Some(text::ERROR_SOCKET.to_string());
                    continue 'attempts;
                }
                StreamEnd::Interrupted => {
                    interrupted = true;
                    break 'attempts;
                }
            }
        }

        Err(DownloadFailure { error: last_error, interrupted })
    }
}

/// File extension of an image URL, for the store's output key.
fn image_extension(image_url: &str) -> String {
    let path = Url::parse(image_url)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| image_url.to_string());
    std::path::Path::new(&path)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("jpg")
        .to_lowercase()
}
