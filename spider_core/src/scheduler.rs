use std::collections::VecDeque;

use crate::{SpiderMode, PRELOAD_COUNT};

/// The scheduler queues, all guarded by one mutex in the spider.
///
/// Dequeue priority is fixed: explicit re-requests, then interactive
/// requests, then preloads, then the bulk download cursor.
pub(crate) struct RequestQueues {
    force: VecDeque<u32>,
    interactive: VecDeque<u32>,
    preload: VecDeque<u32>,
    /// Next index of the bulk phase; -1 outside download mode. The bulk
    /// phase is over once the cursor reaches the page count.
    download_cursor: i32,
}

impl RequestQueues {
    pub fn new(mode: SpiderMode) -> Self {
        let mut queues = RequestQueues {
            force: VecDeque::new(),
            interactive: VecDeque::new(),
            preload: VecDeque::new(),
            download_cursor: -1,
        };
        queues.set_mode(mode);
        queues
    }

    pub fn set_mode(&mut self, mode: SpiderMode) {
        self.download_cursor = match mode {
            SpiderMode::Download => 0,
            SpiderMode::Read => -1,
        };
    }

    /// Whether any work is schedulable (used at queen bootstrap to decide if
    /// workers must be spawned right away).
    pub fn has_work(&self) -> bool {
        !self.force.is_empty()
            || !self.interactive.is_empty()
            || !self.preload.is_empty()
            || self.download_cursor >= 0
    }

    pub fn push_force(&mut self, index: u32) {
        self.force.push_back(index);
    }

    /// Queue an interactive request and replace the preload window with up to
    /// [`PRELOAD_COUNT`] consecutive successors. The window needs the page
    /// count for its bound, so no preloads are queued before it is known.
    pub fn push_interactive(&mut self, index: u32, pages: Option<u32>) {
        self.interactive.push_back(index);
        self.preload.clear();
        if let Some(pages) = pages {
            for preload in index + 1..=index.saturating_add(PRELOAD_COUNT) {
                if preload < pages {
                    self.preload.push_back(preload);
                }
            }
        }
    }

    /// Pop the next index to work on, with its force flag. The bulk cursor is
    /// post-incremented. `None` sends the calling worker to exit.
    pub fn next(&mut self, pages: u32) -> Option<(u32, bool)> {
        if let Some(index) = self.force.pop_front() {
            return Some((index, true));
        }
        if let Some(index) = self.interactive.pop_front() {
            return Some((index, false));
        }
        if let Some(index) = self.preload.pop_front() {
            return Some((index, false));
        }
        if self.download_cursor >= 0 && (self.download_cursor as u32) < pages {
            let index = self.download_cursor as u32;
            self.download_cursor += 1;
            return Some((index, false));
        }
        None
    }
}
