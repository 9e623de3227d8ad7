use std::sync::Arc;

use crate::spider::GallerySpider;
use crate::text;

impl GallerySpider {
    /// Single consumer of the decode-request stack. The stack is LIFO on
    /// purpose: a reader paging quickly cares about the page requested last.
    pub(crate) async fn decoder_main(self: Arc<Self>) {
        tracing::debug!("Gallery {}: decoder started", self.gid);
        loop {
            let next = self.decode_stack.lock().unwrap().pop();
            let Some(index) = next else {
                let notified = self.decoder_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if !self.decode_stack.lock().unwrap().is_empty() {
                    continue;
                }
                tokio::select! {
                    _ = self.halt_token.cancelled() => break,
                    _ = &mut notified => {}
                }
                continue;
            };
            self.decode_page(index).await;
        }
        tracing::debug!("Gallery {}: decoder exited", self.gid);
    }

    async fn decode_page(&self, index: u32) {
        let pages = self.states.pages().unwrap_or(0);
        if index >= pages {
            self.emit_image_failure(index, text::ERROR_OUT_OF_RANGE);
            return;
        }

        let Some(mut data) = self.store.open_input(index).await else {
            self.emit_image_failure(index, text::ERROR_NOT_FOUND);
            return;
        };
        let bytes = match data.read_all().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Gallery {}: cannot read page {}: {}", self.gid, index, e);
                self.emit_image_failure(index, text::ERROR_READ_FAILED);
                return;
            }
        };

        let decoder = self.image_decoder.clone();
        let image = tokio::task::spawn_blocking(move || decoder.decode(&bytes))
            .await
            .ok()
            .flatten();
        match image {
            Some(image) => {
                for listener in self.listeners.snapshot() {
                    listener.on_get_image_success(index, &image);
                }
            }
            None => {
                tracing::warn!("Gallery {}: cannot decode page {}", self.gid, index);
                self.emit_image_failure(index, text::ERROR_DECODE_FAILED);
            }
        }
    }
}
