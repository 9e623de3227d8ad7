use std::sync::{Arc, Mutex};

/// Observer of one spider's progress. All methods default to no-ops so a
/// consumer implements only what it needs; implementations must not block.
pub trait SpiderListener: Send + Sync {
    /// The page count is known; the spider is ready for requests.
    fn on_get_pages(&self, _pages: u32) {}

    /// The remote answered a page with its rate-limit sentinel image.
    fn on_get_509(&self, _index: u32) {}

    /// Streaming progress: total content length (when known), bytes received
    /// so far, and the size of the chunk just written.
    fn on_page_download(
        &self,
        _index: u32,
        _content_length: Option<u64>,
        _received: u64,
        _bytes_read: usize,
    ) {
    }

    fn on_page_success(&self, _index: u32) {}

    fn on_page_failure(&self, _index: u32, _error: &str) {}

    fn on_get_image_success(&self, _index: u32, _image: &image::DynamicImage) {}

    fn on_get_image_failure(&self, _index: u32, _error: &str) {}
}

/// Listener list. Notifications iterate over a snapshot taken under the
/// lock, so a listener may re-enter the spider (or this list) freely.
pub(crate) struct ListenerSet {
    inner: Mutex<Vec<Arc<dyn SpiderListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        ListenerSet { inner: Mutex::new(Vec::new()) }
    }

    pub fn add(&self, listener: Arc<dyn SpiderListener>) {
        self.inner.lock().unwrap().push(listener);
    }

    pub fn remove(&self, listener: &Arc<dyn SpiderListener>) {
        self.inner
            .lock()
            .unwrap()
            .retain(|other| !Arc::ptr_eq(other, listener));
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn SpiderListener>> {
        self.inner.lock().unwrap().clone()
    }
}
