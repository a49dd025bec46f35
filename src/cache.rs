//! Cached pages and their verification tags.
//!
//! Every page loaded from a backing store gets a fresh generation number, which serves as its
//! cache identity.  The [`TagTable`] remembers, per page index, the generation that was last
//! verified: a tag only counts if it matches the generation of the page being checked, so a
//! page that has been evicted and reloaded (or replaced by a write) is verified again.
//!
//! Both structures are bounded.  Dropping a page or a tag is always safe; it only costs a
//! repeated verification.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    io::Result,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use log::trace;

use crate::{store::BackingStore, PAGE_SIZE};

pub struct Page {
    index: u64,
    generation: u64,
    metadata_in_use: bool,
    data: Box<[u8]>,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("metadata_in_use", &self.metadata_in_use)
            .finish_non_exhaustive()
    }
}

impl Page {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the page's private metadata slot is already used by its store.  Such pages
    /// can't carry a verification tag.
    pub fn metadata_in_use(&self) -> bool {
        self.metadata_in_use
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Generations are unique across every cache in the process, so a page from one cache can
/// never match a tag set for a page from another.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct CacheInner {
    pages: HashMap<u64, Arc<Page>>,
    order: VecDeque<u64>,
}

/// A bounded, FIFO-evicted cache of pages read from one backing store.
pub struct PageCache {
    store: Arc<dyn BackingStore>,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl fmt::Debug for PageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl PageCache {
    pub fn new(store: Arc<dyn BackingStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            inner: Mutex::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads a page from the store, bypassing the cache.  The page gets a new identity.
    pub fn load(&self, index: u64) -> Result<Page> {
        let mut data = vec![0u8; PAGE_SIZE].into_boxed_slice();
        self.store.read_page(index, &mut data)?;
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        trace!("loaded page {index} as generation {generation}");
        Ok(Page {
            index,
            generation,
            metadata_in_use: self.store.metadata_in_use(),
            data,
        })
    }

    /// Returns the cached page for `index`, reading it from the store if needed.
    pub fn get(&self, index: u64) -> Result<Arc<Page>> {
        if let Some(page) = self.lock().pages.get(&index) {
            return Ok(Arc::clone(page));
        }

        // Read without holding the lock.  If someone else beat us to it, theirs wins.
        let page = Arc::new(self.load(index)?);

        let mut inner = self.lock();
        if let Some(existing) = inner.pages.get(&index) {
            return Ok(Arc::clone(existing));
        }
        while inner.pages.len() >= self.capacity {
            let Some(victim) = inner.order.pop_front() else {
                break;
            };
            inner.pages.remove(&victim);
        }
        inner.order.push_back(index);
        inner.pages.insert(index, Arc::clone(&page));
        Ok(page)
    }

    /// Drops the cached copy of a page, if any.  The next `get()` reloads it.
    pub fn invalidate(&self, index: u64) {
        let mut inner = self.lock();
        if inner.pages.remove(&index).is_some() {
            inner.order.retain(|&i| i != index);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Page index to verified generation.
#[derive(Debug)]
pub struct TagTable {
    capacity: usize,
    tags: Mutex<HashMap<u64, u64>>,
}

impl TagTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tags: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, u64>> {
        self.tags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_valid(&self, page: &Page) -> bool {
        !page.metadata_in_use && self.lock().get(&page.index) == Some(&page.generation)
    }

    /// Tags the page as verified.  Returns false if the page can't carry a tag.
    pub fn mark(&self, page: &Page) -> bool {
        if page.metadata_in_use {
            return false;
        }

        let mut tags = self.lock();
        if tags.len() >= self.capacity && !tags.contains_key(&page.index) {
            if let Some(victim) = tags.keys().next().copied() {
                tags.remove(&victim);
            }
        }
        tags.insert(page.index, page.generation);
        true
    }

    pub fn clear(&self, index: u64) {
        self.lock().remove(&index);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
