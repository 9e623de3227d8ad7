use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::spider::GallerySpider;
use crate::{GallerySource, ImageDecoder, PageStore, SpiderMode};

/// Identity of a gallery as the consumer knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryInfo {
    pub gid: u64,
    pub token: String,
}

/// Builds the page store for a gallery in its initial mode.
pub type StoreFactory = Arc<dyn Fn(&GalleryInfo, SpiderMode) -> Arc<dyn PageStore> + Send + Sync>;

struct Entry {
    spider: Arc<GallerySpider>,
    read_refs: u32,
    download_refs: u32,
}

/// Process-wide map from gallery id to its live spider.
///
/// A spider is started on first acquire and stopped (and unregistered) when
/// its last reference of either kind is released. The two usage modes are
/// counted independently: any number of readers, at most one downloader.
pub struct SpiderRegistry {
    source: Arc<dyn GallerySource>,
    image_decoder: Arc<dyn ImageDecoder>,
    store_factory: StoreFactory,
    cache_dir: PathBuf,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl SpiderRegistry {
    pub fn new(
        source: Arc<dyn GallerySource>,
        image_decoder: Arc<dyn ImageDecoder>,
        store_factory: StoreFactory,
        cache_dir: PathBuf,
    ) -> Self {
        SpiderRegistry {
            source,
            image_decoder,
            store_factory,
            cache_dir,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Hand out the spider for a gallery, starting one if none is live, and
    /// take a reference in the given mode. The effective mode is re-derived
    /// from the reference counts: downloading wins over reading.
    pub fn acquire(&self, info: &GalleryInfo, mode: SpiderMode) -> Result<Arc<GallerySpider>> {
        let (spider, effective) = {
            let mut entries = self.entries.lock().unwrap();
            let entry = match entries.entry(info.gid) {
                std::collections::hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    let store = (self.store_factory)(info, mode);
                    let spider = GallerySpider::start(
                        info.gid,
                        info.token.clone(),
                        mode,
                        self.cache_dir.clone(),
                        self.source.clone(),
                        store,
                        self.image_decoder.clone(),
                    );
                    vacant.insert(Entry { spider, read_refs: 0, download_refs: 0 })
                }
            };
            match mode {
                SpiderMode::Download if entry.download_refs >= 1 => {
                    return Err(Error::InvalidState(format!(
                        "Gallery {} is already being downloaded",
                        info.gid
                    )));
                }
                SpiderMode::Download => entry.download_refs += 1,
                SpiderMode::Read => entry.read_refs += 1,
            }
            (entry.spider.clone(), derive_mode(entry))
        };
        spider.set_mode(effective);
        Ok(spider)
    }

    /// Give back a reference taken with [`acquire`](Self::acquire). Dropping
    /// the last reference of either kind stops and unregisters the spider.
    pub fn release(&self, spider: &Arc<GallerySpider>, mode: SpiderMode) -> Result<()> {
        let gid = spider.gid();
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&gid) else {
            return Err(Error::InvalidState(format!("Gallery {} is not registered", gid)));
        };
        if !Arc::ptr_eq(&entry.spider, spider) {
            return Err(Error::InvalidState(format!(
                "Gallery {} is registered to another spider",
                gid
            )));
        }
        match mode {
            SpiderMode::Download => {
                if entry.download_refs == 0 {
                    return Err(Error::InvalidState(format!(
                        "Gallery {} has no download reference",
                        gid
                    )));
                }
                entry.download_refs -= 1;
            }
            SpiderMode::Read => {
                if entry.read_refs == 0 {
                    return Err(Error::InvalidState(format!(
                        "Gallery {} has no read reference",
                        gid
                    )));
                }
                entry.read_refs -= 1;
            }
        }

        if entry.read_refs == 0 && entry.download_refs == 0 {
            let entry = entries.remove(&gid).expect("entry checked above");
            drop(entries);
            entry.spider.stop();
            tracing::info!("Gallery {}: unregistered", gid);
        } else {
            let effective = derive_mode(entry);
            let spider = entry.spider.clone();
            drop(entries);
            spider.set_mode(effective);
        }
        Ok(())
    }

    pub fn contains(&self, gid: u64) -> bool {
        self.entries.lock().unwrap().contains_key(&gid)
    }
}

fn derive_mode(entry: &Entry) -> SpiderMode {
    if entry.download_refs > 0 {
        SpiderMode::Download
    } else {
        SpiderMode::Read
    }
}
