use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use itertools::Itertools;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SourceError};
use crate::listener::ListenerSet;
use crate::scheduler::RequestQueues;
use crate::state::{PageEvent, PageStates};
use crate::token::{PToken, TokenTable};
use crate::{
    text, GallerySource, ImageDecoder, PageState, PageStore, SpiderInfo, SpiderListener,
    SpiderMode, SPIDER_WORKER_COUNT,
};

/// What `size()` reports to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GallerySize {
    /// The queen is gone: startup failed or the spider was stopped.
    Error,
    /// The page count is not known yet.
    Wait,
    Pages(u32),
}

/// Immediate answer to a page request. `None` from `request` means the page
/// is on its way and the caller should wait for listener events.
#[derive(Debug, Clone, PartialEq)]
pub enum PageUpdate {
    /// Download in flight; the fraction is absent while the content length
    /// is unknown.
    Downloading(Option<f32>),
    Failed(String),
}

pub(crate) struct WorkerSlot {
    pub id: u64,
    pub handle: JoinHandle<()>,
}

/// Outcome of one token-resolution attempt.
enum TokenFetch {
    Got,
    /// Another resolver already owns the preview page; the requester keeps
    /// waiting without any token-table change.
    Wait,
    Failed,
    Interrupted,
}

/// The per-gallery coordinator.
///
/// One queen task bootstraps the gallery metadata and serves pToken
/// requests, up to [`SPIDER_WORKER_COUNT`] worker tasks download pages, and
/// one decoder task turns stored pages into images. All tasks share this
/// struct through an `Arc` and stop through cancellation tokens: `stop()`
/// cancels the queen, whose exit path halts everything else.
pub struct GallerySpider {
    pub(crate) gid: u64,
    pub(crate) token: String,
    cache_dir: PathBuf,
    mode: Mutex<SpiderMode>,

    pub(crate) source: Arc<dyn GallerySource>,
    pub(crate) store: Arc<dyn PageStore>,
    pub(crate) image_decoder: Arc<dyn ImageDecoder>,
    pub(crate) listeners: ListenerSet,

    pub(crate) states: PageStates,
    pub(crate) tokens: Mutex<Option<TokenTable>>,
    pub(crate) token_requests: Mutex<VecDeque<u32>>,
    pub(crate) queen_notify: Notify,
    pub(crate) worker_notify: Notify,
    fetching_previews: Mutex<HashSet<u32>>,

    pub(crate) queues: Mutex<RequestQueues>,

    pub(crate) decode_stack: Mutex<Vec<u32>>,
    pub(crate) decoder_notify: Notify,

    queen: Mutex<Option<JoinHandle<()>>>,
    pub(crate) workers: Mutex<Vec<Option<WorkerSlot>>>,
    worker_seq: AtomicU64,
    decoder_task: Mutex<Option<JoinHandle<()>>>,

    queen_token: CancellationToken,
    pub(crate) halt_token: CancellationToken,
    stopped_token: CancellationToken,
}

impl GallerySpider {
    /// Construct the spider and spawn its queen. Must run inside a tokio
    /// runtime.
    pub(crate) fn start(
        gid: u64,
        token: String,
        mode: SpiderMode,
        cache_dir: PathBuf,
        source: Arc<dyn GallerySource>,
        store: Arc<dyn PageStore>,
        image_decoder: Arc<dyn ImageDecoder>,
    ) -> Arc<Self> {
        let spider = Arc::new(GallerySpider {
            gid,
            token,
            cache_dir,
            mode: Mutex::new(mode),
            source,
            store,
            image_decoder,
            listeners: ListenerSet::new(),
            states: PageStates::new(),
            tokens: Mutex::new(None),
            token_requests: Mutex::new(VecDeque::new()),
            queen_notify: Notify::new(),
            worker_notify: Notify::new(),
            fetching_previews: Mutex::new(HashSet::new()),
            queues: Mutex::new(RequestQueues::new(mode)),
            decode_stack: Mutex::new(Vec::new()),
            decoder_notify: Notify::new(),
            queen: Mutex::new(None),
            workers: Mutex::new((0..SPIDER_WORKER_COUNT).map(|_| None).collect()),
            worker_seq: AtomicU64::new(0),
            decoder_task: Mutex::new(None),
            queen_token: CancellationToken::new(),
            halt_token: CancellationToken::new(),
            stopped_token: CancellationToken::new(),
        });

        // The handle is stored while the lock is held, so a queen that dies
        // immediately cannot null it out before it exists.
        {
            let mut queen = spider.queen.lock().unwrap();
            let this = spider.clone();
            *queen = Some(tokio::spawn(async move { this.queen_main().await }));
        }
        spider
    }

    pub fn gid(&self) -> u64 {
        self.gid
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn add_listener(&self, listener: Arc<dyn SpiderListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SpiderListener>) {
        self.listeners.remove(listener);
    }

    /// Count of pages that have left the `None` state.
    pub fn downloaded_pages(&self) -> usize {
        self.states.downloaded_pages()
    }

    /// Count of finished pages.
    pub fn finished_pages(&self) -> usize {
        self.states.finished_pages()
    }

    pub fn size(&self) -> GallerySize {
        if self.queen.lock().unwrap().is_none() {
            return GallerySize::Error;
        }
        match self.states.pages() {
            None => GallerySize::Wait,
            Some(pages) => GallerySize::Pages(pages),
        }
    }

    /// Ask for a page on behalf of a reader. Also schedules up to
    /// [`crate::PRELOAD_COUNT`] consecutive successors.
    pub fn request(self: &Arc<Self>, index: u32) -> Option<PageUpdate> {
        self.request_page(index, false)
    }

    /// Re-request a page, bypassing the finished/failed guards.
    pub fn force_request(self: &Arc<Self>, index: u32) -> Option<PageUpdate> {
        self.request_page(index, true)
    }

    fn request_page(self: &Arc<Self>, index: u32, force: bool) -> Option<PageUpdate> {
        if self.queen.lock().unwrap().is_none() {
            return None;
        }

        let mut state = self.states.get(index);
        if force && matches!(state, PageState::Finished | PageState::Failed) {
            state = PageState::None;
        }
        match state {
            PageState::None => {
                let pages = self.states.pages();
                {
                    let mut queues = self.queues.lock().unwrap();
                    if force {
                        queues.push_force(index);
                    } else {
                        queues.push_interactive(index, pages);
                    }
                }
                if pages.is_some() {
                    self.ensure_workers();
                }
                None
            }
            PageState::Downloading => Some(PageUpdate::Downloading(self.states.percent(index))),
            PageState::Failed => Some(PageUpdate::Failed(
                self.states
                    .error(index)
                    .unwrap_or_else(|| text::ERROR_UNKNOWN.to_string()),
            )),
            PageState::Finished => {
                self.decode_stack.lock().unwrap().push(index);
                self.decoder_notify.notify_one();
                None
            }
        }
    }

    /// Cancel the queen; its exit path tears down every other task.
    pub(crate) fn stop(&self) {
        self.queen_token.cancel();
    }

    /// Resolves once teardown has completed.
    pub async fn stopped(&self) {
        self.stopped_token.cancelled().await;
    }

    /// Apply a (re)derived usage mode: persistence target, bulk cursor, and
    /// workers for the bulk work a download switch creates.
    pub(crate) fn set_mode(self: &Arc<Self>, mode: SpiderMode) {
        *self.mode.lock().unwrap() = mode;
        self.store.set_mode(mode);
        self.queues.lock().unwrap().set_mode(mode);
        if self.states.published() {
            self.ensure_workers();
        }
    }

    /// Spawn any missing worker. Slots are identified so a worker can clear
    /// only its own slot on the way out.
    pub(crate) fn ensure_workers(self: &Arc<Self>) {
        if self.halt_token.is_cancelled() {
            return;
        }
        let mut slots = self.workers.lock().unwrap();
        for slot_index in 0..SPIDER_WORKER_COUNT {
            if slots[slot_index].is_none() {
                let id = self.worker_seq.fetch_add(1, Ordering::Relaxed);
                let this = self.clone();
                let handle = tokio::spawn(async move { this.worker_main(slot_index, id).await });
                slots[slot_index] = Some(WorkerSlot { id, handle });
            }
        }
    }

    /// Transition a page and fire the owed notification with no lock held.
    pub(crate) fn set_page_state(&self, index: u32, state: PageState, error: Option<String>) {
        if let Some(event) = self.states.transition(index, state, error) {
            match event {
                PageEvent::Success(index) => {
                    for listener in self.listeners.snapshot() {
                        listener.on_page_success(index);
                    }
                }
                PageEvent::Failure(index, message) => {
                    for listener in self.listeners.snapshot() {
                        listener.on_page_failure(index, &message);
                    }
                }
            }
        }
    }

    pub(crate) fn emit_image_failure(&self, index: u32, error: &str) {
        for listener in self.listeners.snapshot() {
            listener.on_get_image_failure(index, error);
        }
    }
}

// MARK: Queen

impl GallerySpider {
    async fn queen_main(self: Arc<Self>) {
        tracing::info!("Gallery {}: spider started", self.gid);
        match self.bootstrap().await {
            Ok(true) => self.serve_tokens().await,
            Ok(false) => {}
            Err(e) => tracing::error!("Gallery {}: spider bootstrap failed: {}", self.gid, e),
        }
        self.teardown().await;
    }

    /// Load or fetch the gallery metadata and bring the machinery up.
    /// `Ok(false)` means the queen was cancelled before publishing.
    async fn bootstrap(self: &Arc<Self>) -> Result<bool> {
        let mode = *self.mode.lock().unwrap();
        self.store.set_mode(mode);

        let download_dir = self.store.download_dir();
        let info = tokio::select! {
            _ = self.queen_token.cancelled() => return Ok(false),
            info = SpiderInfo::load(download_dir.as_deref(), &self.cache_dir, self.gid, &self.token) => info,
        };
        let info = match info {
            Some(info) => info,
            None => {
                let previews = tokio::select! {
                    _ = self.queen_token.cancelled() => return Ok(false),
                    result = self.source.preview_page(self.gid, &self.token, 0) => result?,
                };
                if previews.previews.is_empty() && previews.pages > 0 {
                    return Err(SourceError::Parse("empty preview set".to_string()).into());
                }
                let mut tokens = BTreeMap::new();
                for entry in &previews.previews {
                    if entry.index < previews.pages {
                        tokens.insert(entry.index, entry.ptoken.clone());
                    }
                }
                SpiderInfo {
                    gid: self.gid,
                    token: self.token.clone(),
                    pages: previews.pages,
                    preview_pages: previews.preview_pages,
                    preview_per_page: previews.previews.len() as u32,
                    tokens,
                }
            }
        };
        info.write_through(download_dir.as_deref(), &self.cache_dir).await;

        let pages = info.pages;
        *self.tokens.lock().unwrap() = Some(TokenTable::from_info(&info));
        self.states.publish(pages);
        tracing::info!("Gallery {}: {} pages", self.gid, pages);
        for listener in self.listeners.snapshot() {
            listener.on_get_pages(pages);
        }

        if self.queues.lock().unwrap().has_work() {
            self.ensure_workers();
        }

        let this = self.clone();
        *self.decoder_task.lock().unwrap() = Some(tokio::spawn(async move {
            this.decoder_main().await;
        }));
        Ok(true)
    }

    /// The pToken service loop: resolve queued indices by fetching preview
    /// pages, then wake the waiting workers.
    async fn serve_tokens(self: &Arc<Self>) {
        loop {
            let next = self.token_requests.lock().unwrap().pop_front();
            let Some(index) = next else {
                let notified = self.queen_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if !self.token_requests.lock().unwrap().is_empty() {
                    continue;
                }
                tokio::select! {
                    _ = self.queen_token.cancelled() => return,
                    _ = &mut notified => {}
                }
                continue;
            };

            // The table may have been filled while the request sat queued.
            let known = {
                let tokens = self.tokens.lock().unwrap();
                tokens.as_ref().is_some_and(|table| table.get(index).is_some())
            };
            if known {
                self.worker_notify.notify_waiters();
                continue;
            }

            match self.fetch_preview_for(index).await {
                TokenFetch::Got => self.worker_notify.notify_waiters(),
                TokenFetch::Failed => {
                    if let Some(table) = self.tokens.lock().unwrap().as_mut() {
                        table.mark_failed(index);
                    }
                    self.worker_notify.notify_waiters();
                }
                TokenFetch::Wait => {}
                TokenFetch::Interrupted => return,
            }
        }
    }

    /// Fetch the preview page covering `index` and fold its tokens into the
    /// table, writing the record through. At most one fetch runs per preview
    /// page; a losing racer gets `Wait` immediately.
    async fn fetch_preview_for(&self, index: u32) -> TokenFetch {
        let preview_index = {
            let tokens = self.tokens.lock().unwrap();
            match tokens.as_ref() {
                Some(table) => table.preview_index(index),
                None => return TokenFetch::Failed,
            }
        };
        if !self.fetching_previews.lock().unwrap().insert(preview_index) {
            return TokenFetch::Wait;
        }

        let result = tokio::select! {
            _ = self.queen_token.cancelled() => {
                self.fetching_previews.lock().unwrap().remove(&preview_index);
                return TokenFetch::Interrupted;
            }
            result = self.source.preview_page(self.gid, &self.token, preview_index) => result,
        };

        let fetch = match result {
            Ok(previews) => {
                let (record, written, got) = {
                    let mut tokens = self.tokens.lock().unwrap();
                    match tokens.as_mut() {
                        Some(table) => {
                            let written = table.populate(&previews.previews);
                            let got = matches!(table.get(index), Some(PToken::Token(_)));
                            (Some(table.to_info(self.gid, &self.token)), written, got)
                        }
                        None => (None, Vec::new(), false),
                    }
                };
                if !written.is_empty() {
                    tracing::debug!(
                        "Gallery {}: preview page {} covered pages {}",
                        self.gid,
                        preview_index,
                        written.iter().join(", ")
                    );
                }
                if let Some(record) = record {
                    record
                        .write_through(self.store.download_dir().as_deref(), &self.cache_dir)
                        .await;
                }
                if got {
                    TokenFetch::Got
                } else {
                    tracing::warn!(
                        "Gallery {}: preview page {} did not cover page {}",
                        self.gid,
                        preview_index,
                        index
                    );
                    TokenFetch::Failed
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Gallery {}: cannot fetch preview page {}: {}",
                    self.gid,
                    preview_index,
                    e
                );
                TokenFetch::Failed
            }
        };
        self.fetching_previews.lock().unwrap().remove(&preview_index);
        fetch
    }

    /// Halt workers and the decoder, await them, and null the queen handle so
    /// consumers observe the spider as gone.
    async fn teardown(&self) {
        self.halt_token.cancel();

        let workers = {
            let mut slots = self.workers.lock().unwrap();
            slots.iter_mut().filter_map(|slot| slot.take()).collect::<Vec<_>>()
        };
        for slot in workers {
            let _ = slot.handle.await;
        }
        let decoder = self.decoder_task.lock().unwrap().take();
        if let Some(handle) = decoder {
            let _ = handle.await;
        }

        *self.queen.lock().unwrap() = None;
        self.stopped_token.cancel();
        tracing::info!("Gallery {}: spider stopped", self.gid);
    }
}
