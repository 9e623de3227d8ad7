use std::collections::BTreeMap;

use crate::source::PreviewEntry;
use crate::SpiderInfo;

/// A resolved pToken slot. The in-flight "wait" sentinel is never stored
/// here; it only exists as a transient return of the token resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PToken {
    Token(String),
    /// Resolution was attempted and the preview page did not cover the index.
    Failed,
}

const FAILED_SENTINEL: &str = "failed";

/// Dense pToken table sized by the page count, guarded by the spider's token
/// mutex and flushed to disk through [`SpiderInfo`].
pub(crate) struct TokenTable {
    pages: u32,
    preview_pages: u32,
    preview_per_page: u32,
    slots: Vec<Option<PToken>>,
}

impl TokenTable {
    pub fn from_info(info: &SpiderInfo) -> Self {
        let mut slots = vec![None; info.pages as usize];
        for (&index, token) in &info.tokens {
            if let Some(slot) = slots.get_mut(index as usize) {
                *slot = Some(if token == FAILED_SENTINEL {
                    PToken::Failed
                } else {
                    PToken::Token(token.clone())
                });
            }
        }
        TokenTable {
            pages: info.pages,
            preview_pages: info.preview_pages,
            preview_per_page: info.preview_per_page,
            slots,
        }
    }

    pub fn to_info(&self, gid: u64, token: &str) -> SpiderInfo {
        let mut tokens = BTreeMap::new();
        for (index, slot) in self.slots.iter().enumerate() {
            match slot {
                Some(PToken::Token(t)) => {
                    tokens.insert(index as u32, t.clone());
                }
                Some(PToken::Failed) => {
                    tokens.insert(index as u32, FAILED_SENTINEL.to_string());
                }
                None => {}
            }
        }
        SpiderInfo {
            gid,
            token: token.to_string(),
            pages: self.pages,
            preview_pages: self.preview_pages,
            preview_per_page: self.preview_per_page,
            tokens,
        }
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// Which preview page covers the given page index.
    pub fn preview_index(&self, index: u32) -> u32 {
        if self.preview_per_page == 0 {
            0
        } else {
            index / self.preview_per_page
        }
    }

    pub fn get(&self, index: u32) -> Option<&PToken> {
        self.slots.get(index as usize).and_then(|slot| slot.as_ref())
    }

    /// Forget a Failed marker so resolution runs again.
    pub fn clear_failed(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            if *slot == Some(PToken::Failed) {
                *slot = None;
            }
        }
    }

    pub fn mark_failed(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            *slot = Some(PToken::Failed);
        }
    }

    /// Record every in-range entry of a preview set. Real tokens overwrite
    /// Failed markers. Returns the indices written, for logging.
    pub fn populate(&mut self, entries: &[PreviewEntry]) -> Vec<u32> {
        let mut written = Vec::new();
        for entry in entries {
            if let Some(slot) = self.slots.get_mut(entry.index as usize) {
                *slot = Some(PToken::Token(entry.ptoken.clone()));
                written.push(entry.index);
            }
        }
        written
    }
}
