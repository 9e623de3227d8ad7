use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::text;

/// Download state of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    None,
    Downloading,
    Finished,
    Failed,
}

/// Notification owed to listeners after a state transition. Fired by the
/// caller once the state lock has been released, so a re-entrant listener
/// can read the table again.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PageEvent {
    Success(u32),
    Failure(u32, String),
}

struct PageTable {
    states: Vec<PageState>,
    /// Download progress per index; an entry exists only while Downloading.
    percent: HashMap<u32, f32>,
    /// Error message per index; an entry exists iff the page is Failed.
    errors: HashMap<u32, String>,
}

/// The per-index state table, published once the page count is known.
///
/// Every transition goes through [`PageStates::transition`], which keeps the
/// derived counters equal to the cardinalities they describe and the percent
/// and error maps consistent with the state array.
pub(crate) struct PageStates {
    table: Mutex<Option<PageTable>>,
    downloaded: AtomicUsize,
    finished: AtomicUsize,
}

impl PageStates {
    pub fn new() -> Self {
        PageStates {
            table: Mutex::new(None),
            downloaded: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn publish(&self, pages: u32) {
        let mut table = self.table.lock().unwrap();
        *table = Some(PageTable {
            states: vec![PageState::None; pages as usize],
            percent: HashMap::new(),
            errors: HashMap::new(),
        });
    }

    pub fn published(&self) -> bool {
        self.table.lock().unwrap().is_some()
    }

    /// Page count, once published.
    pub fn pages(&self) -> Option<u32> {
        let table = self.table.lock().unwrap();
        table.as_ref().map(|t| t.states.len() as u32)
    }

    /// An unpublished table and an out-of-range index both read as `None`.
    pub fn get(&self, index: u32) -> PageState {
        let table = self.table.lock().unwrap();
        table
            .as_ref()
            .and_then(|t| t.states.get(index as usize).copied())
            .unwrap_or(PageState::None)
    }

    pub fn percent(&self, index: u32) -> Option<f32> {
        let table = self.table.lock().unwrap();
        table.as_ref().and_then(|t| t.percent.get(&index).copied())
    }

    pub fn error(&self, index: u32) -> Option<String> {
        let table = self.table.lock().unwrap();
        table.as_ref().and_then(|t| t.errors.get(&index).cloned())
    }

    /// Record streaming progress. Ignored unless the page is Downloading.
    pub fn update_percent(&self, index: u32, percent: f32) {
        let mut table = self.table.lock().unwrap();
        if let Some(table) = table.as_mut() {
            if table.states.get(index as usize) == Some(&PageState::Downloading) {
                table.percent.insert(index, percent);
            }
        }
    }

    /// Claim a page for download. Refused when another worker already owns
    /// it, or when the page is settled and the request is not forced. The
    /// guard and the transition share one critical section.
    pub fn begin_download(&self, index: u32, force: bool) -> bool {
        let mut table = self.table.lock().unwrap();
        let Some(table) = table.as_mut() else { return false };
        let Some(state) = table.states.get(index as usize).copied() else { return false };
        match state {
            PageState::Downloading => return false,
            PageState::Finished | PageState::Failed if !force => return false,
            _ => {}
        }
        self.transition_locked(table, index, PageState::Downloading, None);
        true
    }

    /// The single mutation helper. Returns the listener notification owed for
    /// this transition, if any.
    pub fn transition(
        &self,
        index: u32,
        state: PageState,
        error: Option<String>,
    ) -> Option<PageEvent> {
        let mut table = self.table.lock().unwrap();
        let table = table.as_mut()?;
        self.transition_locked(table, index, state, error)
    }

    fn transition_locked(
        &self,
        table: &mut PageTable,
        index: u32,
        state: PageState,
        error: Option<String>,
    ) -> Option<PageEvent> {
        let slot = table.states.get_mut(index as usize)?;
        let old = *slot;
        *slot = state;

        if old == PageState::None && state != PageState::None {
            self.downloaded.fetch_add(1, Ordering::SeqCst);
        } else if old != PageState::None && state == PageState::None {
            self.downloaded.fetch_sub(1, Ordering::SeqCst);
        }
        if old != PageState::Finished && state == PageState::Finished {
            self.finished.fetch_add(1, Ordering::SeqCst);
        } else if old == PageState::Finished && state != PageState::Finished {
            self.finished.fetch_sub(1, Ordering::SeqCst);
        }

        match state {
            PageState::None => {
                table.percent.remove(&index);
                table.errors.remove(&index);
                None
            }
            PageState::Downloading => {
                table.errors.remove(&index);
                None
            }
            PageState::Finished => {
                table.percent.remove(&index);
                table.errors.remove(&index);
                Some(PageEvent::Success(index))
            }
            PageState::Failed => {
                table.percent.remove(&index);
                let message = error.unwrap_or_else(|| text::ERROR_UNKNOWN.to_string());
                table.errors.insert(index, message.clone());
                Some(PageEvent::Failure(index, message))
            }
        }
    }

    /// Count of indices whose state is not `None`.
    pub fn downloaded_pages(&self) -> usize {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Count of indices whose state is `Finished`.
    pub fn finished_pages(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cardinalities(states: &PageStates) -> (usize, usize) {
        let pages = states.pages().unwrap();
        let all = (0..pages).map(|i| states.get(i)).collect::<Vec<_>>();
        (
            all.iter().filter(|s| **s != PageState::None).count(),
            all.iter().filter(|s| **s == PageState::Finished).count(),
        )
    }

    #[test]
    fn counters_track_cardinalities() {
        let states = PageStates::new();
        states.publish(5);

        let steps = [
            (0, PageState::Downloading),
            (1, PageState::Downloading),
            (0, PageState::Finished),
            (1, PageState::Failed),
            (1, PageState::Downloading),
            (1, PageState::Finished),
            (2, PageState::Downloading),
        ];
        for (index, state) in steps {
            states.transition(index, state, None);
            let (downloaded, finished) = cardinalities(&states);
            assert_eq!(states.downloaded_pages(), downloaded);
            assert_eq!(states.finished_pages(), finished);
        }
    }

    #[test]
    fn percent_only_while_downloading() {
        let states = PageStates::new();
        states.publish(3);

        states.update_percent(0, 0.5);
        assert_eq!(states.percent(0), None);

        states.transition(0, PageState::Downloading, None);
        states.update_percent(0, 0.5);
        assert_eq!(states.percent(0), Some(0.5));

        states.transition(0, PageState::Finished, None);
        assert_eq!(states.percent(0), None);
    }

    #[test]
    fn error_entry_iff_failed() {
        let states = PageStates::new();
        states.publish(3);

        let event = states.transition(1, PageState::Failed, Some("boom".to_string()));
        assert_eq!(event, Some(PageEvent::Failure(1, "boom".to_string())));
        assert_eq!(states.error(1), Some("boom".to_string()));

        states.transition(1, PageState::Downloading, None);
        assert_eq!(states.error(1), None);
    }

    #[test]
    fn failed_without_message_reads_unknown() {
        let states = PageStates::new();
        states.publish(1);
        states.transition(0, PageState::Failed, None);
        assert_eq!(states.error(0), Some(text::ERROR_UNKNOWN.to_string()));
    }

    #[test]
    fn begin_download_claims_exclusively() {
        let states = PageStates::new();
        states.publish(2);

        assert!(states.begin_download(0, false));
        // A second worker must not claim a page that is being downloaded.
        assert!(!states.begin_download(0, false));
        assert!(!states.begin_download(0, true));

        states.transition(0, PageState::Finished, None);
        assert!(!states.begin_download(0, false));
        assert!(states.begin_download(0, true));

        states.transition(1, PageState::Failed, Some("boom".to_string()));
        assert!(states.begin_download(1, true));
        assert_eq!(states.error(1), None);
    }

    #[test]
    fn unpublished_table_reads_none_state() {
        let states = PageStates::new();
        assert_eq!(states.get(3), PageState::None);
        assert!(states.transition(3, PageState::Finished, None).is_none());
        assert_eq!(states.finished_pages(), 0);
    }
}
