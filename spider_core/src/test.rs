use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::{
    text, GalleryInfo, GalleryPreviews, GallerySize, GallerySource, ImageBody, ImageDecoder,
    ImagePage, PageData, PageSink, PageStore, PageUpdate, PreviewEntry, SpiderInfo,
    SpiderListener, SpiderMode, SpiderRegistry,
};

const GID: u64 = 618395;
const TOKEN: &str = "0439fa3666";
const IMAGE_BYTES: usize = 6000;

// MARK: Fake gallery site

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageBehavior {
    Normal,
    RateLimited,
    ParseError,
    /// The body stalls after its first chunk until cancellation.
    Stall,
}

struct FakeSource {
    pages: u32,
    preview_pages: u32,
    preview_per_page: u32,
    tokens: Mutex<BTreeMap<u32, String>>,
    behaviors: Mutex<HashMap<u32, ImageBehavior>>,
    fail_bootstrap: AtomicBool,
    preview_calls: Mutex<Vec<u32>>,
    /// Holds the first preview fetch until the test releases it, so
    /// listeners can be attached before the queen publishes.
    gate: Arc<tokio::sync::Semaphore>,
    gated: AtomicBool,
}

impl FakeSource {
    fn new(pages: u32, preview_pages: u32, preview_per_page: u32) -> Self {
        let tokens = (0..pages).map(|i| (i, format!("ptoken{:04}", i))).collect();
        FakeSource {
            pages,
            preview_pages,
            preview_per_page,
            tokens: Mutex::new(tokens),
            behaviors: Mutex::new(HashMap::new()),
            fail_bootstrap: AtomicBool::new(false),
            preview_calls: Mutex::new(Vec::new()),
            gate: Arc::new(tokio::sync::Semaphore::new(0)),
            gated: AtomicBool::new(false),
        }
    }

    fn keep_tokens_below(&self, bound: u32) {
        self.tokens.lock().unwrap().retain(|index, _| *index < bound);
    }

    fn restore_token(&self, index: u32) {
        self.tokens.lock().unwrap().insert(index, format!("ptoken{:04}", index));
    }

    fn set_behavior(&self, index: u32, behavior: ImageBehavior) {
        self.behaviors.lock().unwrap().insert(index, behavior);
    }

    fn gate_bootstrap(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    fn release_gate(&self) {
        self.gate.add_permits(1);
    }

    fn preview_fetches_of(&self, preview_index: u32) -> usize {
        self.preview_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|i| **i == preview_index)
            .count()
    }
}

#[async_trait]
impl GallerySource for FakeSource {
    async fn preview_page(
        &self,
        _gid: u64,
        _token: &str,
        preview_index: u32,
    ) -> Result<GalleryPreviews, SourceError> {
        if self.gated.swap(false, Ordering::SeqCst) {
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        self.preview_calls.lock().unwrap().push(preview_index);
        if self.fail_bootstrap.load(Ordering::SeqCst) {
            return Err(SourceError::Parse("preview page".to_string()));
        }

        let start = preview_index * self.preview_per_page;
        let end = (start + self.preview_per_page).min(self.pages);
        let tokens = self.tokens.lock().unwrap();
        let previews = (start..end)
            .filter_map(|index| {
                tokens.get(&index).map(|ptoken| PreviewEntry { index, ptoken: ptoken.clone() })
            })
            .collect();
        Ok(GalleryPreviews {
            pages: self.pages,
            preview_pages: self.preview_pages,
            previews,
        })
    }

    async fn image_page(
        &self,
        gid: u64,
        index: u32,
        _ptoken: &str,
        _skip_hath_key: Option<&str>,
    ) -> Result<ImagePage, SourceError> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&index)
            .copied()
            .unwrap_or(ImageBehavior::Normal);
        let image_url = match behavior {
            ImageBehavior::Normal => format!("https://img.example.org/{}/{}.jpg", gid, index),
            ImageBehavior::RateLimited => "https://img.example.org/g/509s.gif".to_string(),
            ImageBehavior::ParseError => {
                return Err(SourceError::Parse("image page".to_string()));
            }
            ImageBehavior::Stall => format!("https://img.example.org/stall/{}.jpg", index),
        };
        Ok(ImagePage { image_url, skip_hath_key: Some("bypass-key".to_string()) })
    }

    async fn open_image(&self, url: &str) -> Result<Box<dyn ImageBody>, SourceError> {
        Ok(Box::new(FakeBody {
            remaining: vec![0xEE; IMAGE_BYTES],
            stall: url.contains("/stall/"),
            sent: false,
        }))
    }
}

struct FakeBody {
    remaining: Vec<u8>,
    stall: bool,
    sent: bool,
}

#[async_trait]
impl ImageBody for FakeBody {
    fn content_length(&self) -> Option<u64> {
        Some(IMAGE_BYTES as u64)
    }

    async fn chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        // A stalling body yields one piece and then hangs until cancelled.
        if self.stall && self.sent {
            std::future::pending::<()>().await;
        }
        self.sent = true;
        if self.stall {
            let piece = self.remaining.drain(..1024).collect::<Vec<_>>();
            return Ok(Some(piece));
        }
        if self.remaining.is_empty() {
            return Ok(None);
        }
        // One oversized chunk; the worker re-chunks it for progress events.
        Ok(Some(std::mem::take(&mut self.remaining)))
    }
}

// MARK: Fake page store

#[derive(Default)]
struct FakeStore {
    files: Mutex<HashMap<u32, Vec<u8>>>,
    removed: Mutex<Vec<u32>>,
    modes: Mutex<Vec<SpiderMode>>,
    download_dir: Option<PathBuf>,
}

impl FakeStore {
    fn backed_by(download_dir: PathBuf) -> Self {
        FakeStore { download_dir: Some(download_dir), ..Default::default() }
    }

    fn insert(&self, index: u32, data: Vec<u8>) {
        self.files.lock().unwrap().insert(index, data);
    }

    fn delete(&self, index: u32) {
        self.files.lock().unwrap().remove(&index);
    }

    fn len_of(&self, index: u32) -> Option<usize> {
        self.files.lock().unwrap().get(&index).map(|data| data.len())
    }

    fn removed_contains(&self, index: u32) -> bool {
        self.removed.lock().unwrap().contains(&index)
    }
}

#[async_trait]
impl PageStore for Arc<FakeStore> {
    fn set_mode(&self, mode: SpiderMode) {
        self.modes.lock().unwrap().push(mode);
    }

    async fn contains(&self, index: u32) -> bool {
        self.files.lock().unwrap().contains_key(&index)
    }

    async fn open_output(&self, index: u32, _extension: &str) -> Option<Box<dyn PageSink>> {
        self.files.lock().unwrap().insert(index, Vec::new());
        Some(Box::new(FakeSink { store: self.clone(), index }))
    }

    async fn open_input(&self, index: u32) -> Option<Box<dyn PageData>> {
        let data = self.files.lock().unwrap().get(&index).cloned()?;
        Some(Box::new(FakeData { data }))
    }

    async fn remove(&self, index: u32) {
        self.files.lock().unwrap().remove(&index);
        self.removed.lock().unwrap().push(index);
    }

    fn download_dir(&self) -> Option<PathBuf> {
        self.download_dir.clone()
    }
}

struct FakeSink {
    store: Arc<FakeStore>,
    index: u32,
}

#[async_trait]
impl PageSink for FakeSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        let mut files = self.store.files.lock().unwrap();
        files.entry(self.index).or_default().extend_from_slice(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct FakeData {
    data: Vec<u8>,
}

#[async_trait]
impl PageData for FakeData {
    async fn read_all(&mut self) -> std::io::Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.data))
    }
}

struct FakeDecoder;

impl ImageDecoder for FakeDecoder {
    fn decode(&self, data: &[u8]) -> Option<image::DynamicImage> {
        (!data.is_empty()).then(|| image::DynamicImage::new_rgb8(1, 1))
    }
}

// MARK: Recording listener

#[derive(Default)]
struct Events {
    pages: Vec<u32>,
    rate_limited: Vec<u32>,
    success: Vec<u32>,
    failure: Vec<(u32, String)>,
    image_success: Vec<u32>,
    image_failure: Vec<(u32, String)>,
    download_bytes: HashMap<u32, u64>,
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Events>,
}

impl RecordingListener {
    fn success_contains(&self, index: u32) -> bool {
        self.events.lock().unwrap().success.contains(&index)
    }

    fn failure_of(&self, index: u32) -> Option<String> {
        let events = self.events.lock().unwrap();
        events
            .failure
            .iter()
            .rev()
            .find(|(i, _)| *i == index)
            .map(|(_, error)| error.clone())
    }

    fn streamed_bytes(&self, index: u32) -> u64 {
        self.events
            .lock()
            .unwrap()
            .download_bytes
            .get(&index)
            .copied()
            .unwrap_or(0)
    }
}

impl SpiderListener for RecordingListener {
    fn on_get_pages(&self, pages: u32) {
        self.events.lock().unwrap().pages.push(pages);
    }

    fn on_get_509(&self, index: u32) {
        self.events.lock().unwrap().rate_limited.push(index);
    }

    fn on_page_download(
        &self,
        index: u32,
        _content_length: Option<u64>,
        received: u64,
        _bytes_read: usize,
    ) {
        self.events.lock().unwrap().download_bytes.insert(index, received);
    }

    fn on_page_success(&self, index: u32) {
        self.events.lock().unwrap().success.push(index);
    }

    fn on_page_failure(&self, index: u32, error: &str) {
        self.events.lock().unwrap().failure.push((index, error.to_string()));
    }

    fn on_get_image_success(&self, index: u32, _image: &image::DynamicImage) {
        self.events.lock().unwrap().image_success.push(index);
    }

    fn on_get_image_failure(&self, index: u32, error: &str) {
        self.events.lock().unwrap().image_failure.push((index, error.to_string()));
    }
}

// MARK: Harness

struct Harness {
    registry: SpiderRegistry,
    source: Arc<FakeSource>,
    store: Arc<FakeStore>,
    listener: Arc<RecordingListener>,
    _cache: tempfile::TempDir,
}

fn harness(source: FakeSource) -> Harness {
    harness_with_store(source, FakeStore::default())
}

fn harness_with_store(source: FakeSource, store: FakeStore) -> Harness {
    let source = Arc::new(source);
    let store = Arc::new(store);
    let listener = Arc::new(RecordingListener::default());
    let cache = tempfile::tempdir().expect("temp cache dir");

    let store_for_factory = store.clone();
    let registry = SpiderRegistry::new(
        source.clone(),
        Arc::new(FakeDecoder),
        Arc::new(move |_info: &GalleryInfo, _mode: SpiderMode| {
            Arc::new(store_for_factory.clone()) as Arc<dyn PageStore>
        }),
        cache.path().to_path_buf(),
    );
    Harness { registry, source, store, listener, _cache: cache }
}

fn gallery() -> GalleryInfo {
    GalleryInfo { gid: GID, token: TOKEN.to_string() }
}

async fn wait_for(what: &str, mut pred: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    waited.unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

// MARK: Scenarios

#[tokio::test(flavor = "multi_thread")]
async fn cold_start_downloads_every_requested_page() {
    let source = FakeSource::new(10, 1, 20);
    source.gate_bootstrap();
    let h = harness(source);

    let spider = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();
    spider.add_listener(h.listener.clone());
    assert_eq!(spider.size(), GallerySize::Wait);

    // One request queued before the page count is known exercises the
    // bootstrap worker spawn.
    assert_eq!(spider.request(0), None);
    h.source.release_gate();
    wait_for("page count", || spider.size() == GallerySize::Pages(10)).await;
    wait_for("pages event", || h.listener.events.lock().unwrap().pages == vec![10]).await;

    for index in 1..10 {
        assert_eq!(spider.request(index), None);
    }
    wait_for("all pages finished", || spider.finished_pages() == 10).await;
    assert_eq!(spider.downloaded_pages(), 10);
    for index in 0..10 {
        assert_eq!(h.store.len_of(index), Some(IMAGE_BYTES));
    }
    assert_eq!(h.listener.streamed_bytes(3), IMAGE_BYTES as u64);

    // The record was written through to the cache tier.
    let info = SpiderInfo::load(None, h._cache.path(), GID, TOKEN).await.unwrap();
    assert_eq!(info.pages, 10);

    // A finished page decodes on re-request.
    assert_eq!(spider.request(0), None);
    wait_for("decoded image", || h.listener.events.lock().unwrap().image_success.contains(&0)).await;

    h.registry.release(&spider, SpiderMode::Read).unwrap();
    spider.stopped().await;
    assert!(!h.registry.contains(GID));
    assert_eq!(spider.size(), GallerySize::Error);
}

#[tokio::test(flavor = "multi_thread")]
async fn interactive_request_preloads_following_pages() {
    let h = harness(FakeSource::new(100, 5, 20));
    let spider = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();
    spider.add_listener(h.listener.clone());

    wait_for("page count", || spider.size() == GallerySize::Pages(100)).await;
    assert_eq!(spider.request(10), None);
    wait_for("page 10 and preloads", || {
        (10..16).all(|index| h.listener.success_contains(index))
    })
    .await;
    // Only the request and its five preloads were downloaded.
    assert_eq!(spider.downloaded_pages(), 6);

    assert_eq!(spider.request(40), None);
    wait_for("page 40 and preloads", || {
        (40..46).all(|index| h.listener.success_contains(index))
    })
    .await;

    h.registry.release(&spider, SpiderMode::Read).unwrap();
    spider.stopped().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limited_page_fails_with_509() {
    let source = FakeSource::new(10, 1, 20);
    source.set_behavior(3, ImageBehavior::RateLimited);
    let h = harness(source);
    let spider = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();
    spider.add_listener(h.listener.clone());
    wait_for("page count", || spider.size() == GallerySize::Pages(10)).await;

    assert_eq!(spider.request(3), None);
    wait_for("509 failure", || h.listener.failure_of(3).is_some()).await;
    assert_eq!(h.listener.failure_of(3), Some(text::ERROR_509.to_string()));
    assert_eq!(h.listener.events.lock().unwrap().rate_limited, vec![3]);
    // No partial file survives the failure.
    assert_eq!(h.store.len_of(3), None);
    assert!(h.store.removed_contains(3));
    assert_eq!(spider.request(3), Some(PageUpdate::Failed(text::ERROR_509.to_string())));

    // A forced retry against a recovered source succeeds.
    h.source.set_behavior(3, ImageBehavior::Normal);
    assert_eq!(spider.force_request(3), None);
    wait_for("forced retry success", || h.listener.success_contains(3)).await;
    assert_eq!(h.store.len_of(3), Some(IMAGE_BYTES));

    h.registry.release(&spider, SpiderMode::Read).unwrap();
    spider.stopped().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn parse_failure_surfaces_without_retry() {
    let source = FakeSource::new(10, 1, 20);
    source.set_behavior(2, ImageBehavior::ParseError);
    let h = harness(source);
    let spider = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();
    spider.add_listener(h.listener.clone());
    wait_for("page count", || spider.size() == GallerySize::Pages(10)).await;

    assert_eq!(spider.request(2), None);
    wait_for("parse failure", || h.listener.failure_of(2).is_some()).await;
    assert_eq!(h.listener.failure_of(2), Some(text::ERROR_PARSE.to_string()));

    h.registry.release(&spider, SpiderMode::Read).unwrap();
    spider.stopped().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn release_interrupts_streaming_worker() {
    let source = FakeSource::new(10, 1, 20);
    source.set_behavior(5, ImageBehavior::Stall);
    let h = harness(source);
    let spider = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();
    spider.add_listener(h.listener.clone());
    wait_for("page count", || spider.size() == GallerySize::Pages(10)).await;

    assert_eq!(spider.request(5), None);
    wait_for("streaming started", || h.listener.streamed_bytes(5) > 0).await;

    h.registry.release(&spider, SpiderMode::Read).unwrap();
    tokio::time::timeout(Duration::from_secs(10), spider.stopped())
        .await
        .expect("spider did not stop in time");

    // The interrupted partial write was dropped from the store, the
    // registry forgot the gallery, and the queen is observably gone.
    assert!(h.store.removed_contains(5));
    assert!(!h.registry.contains(GID));
    assert_eq!(spider.size(), GallerySize::Error);
    assert_eq!(spider.request(5), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn racing_requests_share_one_preview_fetch() {
    // With ten previews per page, the bootstrap only seeds tokens for pages
    // 0..10; preview page 2 covers 20..30 and is fetched on demand.
    let h = harness(FakeSource::new(30, 3, 10));
    let spider = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();
    spider.add_listener(h.listener.clone());
    wait_for("page count", || spider.size() == GallerySize::Pages(30)).await;

    assert_eq!(spider.request(25), None);
    assert_eq!(spider.request(26), None);
    wait_for("both pages finished", || {
        h.listener.success_contains(25) && h.listener.success_contains(26)
    })
    .await;
    assert_eq!(h.source.preview_fetches_of(2), 1);

    h.registry.release(&spider, SpiderMode::Read).unwrap();
    spider.stopped().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_token_fails_page_until_forced() {
    let source = FakeSource::new(10, 1, 20);
    source.keep_tokens_below(7);
    let h = harness(source);
    let spider = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();
    spider.add_listener(h.listener.clone());
    wait_for("page count", || spider.size() == GallerySize::Pages(10)).await;

    assert_eq!(spider.request(7), None);
    wait_for("ptoken failure", || h.listener.failure_of(7).is_some()).await;
    assert_eq!(h.listener.failure_of(7), Some(text::ERROR_PTOKEN_FAILED.to_string()));

    // The force path clears the failed marker and resolves again.
    h.source.restore_token(7);
    assert_eq!(spider.force_request(7), None);
    wait_for("forced token success", || h.listener.success_contains(7)).await;

    h.registry.release(&spider, SpiderMode::Read).unwrap();
    spider.stopped().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stored_page_short_circuits_to_finished() {
    let h = harness(FakeSource::new(4, 1, 20));
    h.store.insert(2, vec![1, 2, 3]);
    let spider = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();
    spider.add_listener(h.listener.clone());
    wait_for("page count", || spider.size() == GallerySize::Pages(4)).await;

    assert_eq!(spider.request(2), None);
    wait_for("catch-up success", || h.listener.success_contains(2)).await;
    // The stored copy was kept as is; nothing was streamed.
    assert_eq!(h.store.len_of(2), Some(3));
    assert_eq!(h.listener.streamed_bytes(2), 0);

    h.registry.release(&spider, SpiderMode::Read).unwrap();
    spider.stopped().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn download_mode_walks_the_whole_gallery() {
    let h = harness(FakeSource::new(8, 1, 20));
    let spider = h.registry.acquire(&gallery(), SpiderMode::Download).unwrap();
    spider.add_listener(h.listener.clone());

    wait_for("bulk download", || spider.finished_pages() == 8).await;
    for index in 0..8 {
        assert_eq!(h.store.len_of(index), Some(IMAGE_BYTES));
    }
    // The store was told about the download mode.
    assert!(h.store.modes.lock().unwrap().contains(&SpiderMode::Download));

    h.registry.release(&spider, SpiderMode::Download).unwrap();
    spider.stopped().await;
    assert!(!h.registry.contains(GID));
}

#[tokio::test(flavor = "multi_thread")]
async fn read_session_writes_through_to_the_download_tier() {
    let download = tempfile::tempdir().unwrap();
    let source = FakeSource::new(30, 3, 10);
    source.gate_bootstrap();
    let h = harness_with_store(source, FakeStore::backed_by(download.path().to_path_buf()));

    // A download session comes and goes before the queen publishes; the
    // spider carries on in read mode.
    let spider = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();
    let downloader = h.registry.acquire(&gallery(), SpiderMode::Download).unwrap();
    h.registry.release(&downloader, SpiderMode::Download).unwrap();
    spider.add_listener(h.listener.clone());
    h.source.release_gate();
    wait_for("page count", || spider.size() == GallerySize::Pages(30)).await;

    // Bootstrap already wrote the record to the download tier.
    let seeded = SpiderInfo::read_from(&SpiderInfo::download_path(download.path()))
        .await
        .unwrap();
    assert_eq!(seeded.gid, GID);
    assert!(!seeded.tokens.contains_key(&25));

    // Resolving a new preview page keeps both tiers current, downloading
    // or not.
    assert_eq!(spider.request(25), None);
    wait_for("page finished", || h.listener.success_contains(25)).await;
    let download_copy = SpiderInfo::read_from(&SpiderInfo::download_path(download.path()))
        .await
        .unwrap();
    let cache_copy = SpiderInfo::read_from(&SpiderInfo::cache_path(h._cache.path(), GID))
        .await
        .unwrap();
    assert!(download_copy.tokens.contains_key(&25));
    assert_eq!(download_copy, cache_copy);

    h.registry.release(&spider, SpiderMode::Read).unwrap();
    spider.stopped().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_failure_reports_error_size() {
    let source = FakeSource::new(10, 1, 20);
    source.fail_bootstrap.store(true, Ordering::SeqCst);
    let h = harness(source);
    let spider = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();

    wait_for("error size", || spider.size() == GallerySize::Error).await;
    assert_eq!(spider.request(0), None);

    h.registry.release(&spider, SpiderMode::Read).unwrap();
    assert!(!h.registry.contains(GID));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_stored_page_reports_not_found() {
    let h = harness(FakeSource::new(4, 1, 20));
    let spider = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();
    spider.add_listener(h.listener.clone());
    wait_for("page count", || spider.size() == GallerySize::Pages(4)).await;

    assert_eq!(spider.request(1), None);
    wait_for("page finished", || h.listener.success_contains(1)).await;

    // The file vanishes behind the spider's back; decoding reports it.
    h.store.delete(1);
    assert_eq!(spider.request(1), None);
    wait_for("not-found failure", || {
        h.listener
            .events
            .lock()
            .unwrap()
            .image_failure
            .contains(&(1, text::ERROR_NOT_FOUND.to_string()))
    })
    .await;

    h.registry.release(&spider, SpiderMode::Read).unwrap();
    spider.stopped().await;
}

// MARK: Registry lifecycle

#[tokio::test(flavor = "multi_thread")]
async fn second_download_reference_is_rejected() {
    let h = harness(FakeSource::new(4, 1, 20));
    let spider = h.registry.acquire(&gallery(), SpiderMode::Download).unwrap();

    assert!(h.registry.acquire(&gallery(), SpiderMode::Download).is_err());
    // Readers may still join, and the spider stays registered until the
    // last reference of either kind is gone.
    let reader = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();
    assert!(Arc::ptr_eq(&spider, &reader));

    h.registry.release(&spider, SpiderMode::Download).unwrap();
    assert!(h.registry.contains(GID));
    h.registry.release(&reader, SpiderMode::Read).unwrap();
    assert!(!h.registry.contains(GID));
    spider.stopped().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn refcount_underflow_is_an_invalid_state() {
    let h = harness(FakeSource::new(4, 1, 20));
    let spider = h.registry.acquire(&gallery(), SpiderMode::Read).unwrap();

    // Releasing a mode that holds no reference must not unregister.
    assert!(h.registry.release(&spider, SpiderMode::Download).is_err());
    assert!(h.registry.contains(GID));

    h.registry.release(&spider, SpiderMode::Read).unwrap();
    assert!(h.registry.release(&spider, SpiderMode::Read).is_err());
    spider.stopped().await;
}
