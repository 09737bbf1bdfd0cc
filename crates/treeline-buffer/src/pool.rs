//! Buffer pool: bounded page cache with NO-STEAL transaction semantics.

use crate::lock::{LockManager, LockMode};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, trace};
use treeline_common::{
    PageId, Result, StorageConfig, TransactionId, TreePage, TreelineError, PAGE_SIZE,
};

/// A cached page, shared between the pool and the callers holding its lock.
pub type PageHandle = Arc<RwLock<TreePage>>;

/// Backing store for one table's pages.
///
/// The pool loads missing pages and writes dirty pages back through this
/// trait; it never touches files itself.
pub trait PageSource: Send + Sync {
    /// Returns the table this source backs.
    fn table_id(&self) -> u32;

    /// Reads and decodes the page, or `ReadPastEnd` if the file is shorter.
    fn read_page(&self, pid: PageId) -> Result<TreePage>;

    /// Encodes and writes the page at its file offset.
    fn write_page(&self, page: &TreePage) -> Result<()>;
}

struct PoolInner {
    /// All cached pages.
    pages: HashMap<PageId, PageHandle>,
    /// Residency order, least recently used at the front.
    lru: VecDeque<PageId>,
    /// Dirty pages and the transaction that dirtied them.
    dirty: HashMap<PageId, TransactionId>,
}

impl PoolInner {
    fn touch(&mut self, pid: PageId) {
        if let Some(pos) = self.lru.iter().position(|p| *p == pid) {
            self.lru.remove(pos);
        }
        self.lru.push_back(pid);
    }

    /// Evicts the least recently used clean page.
    ///
    /// Dirty pages are never written here: under NO-STEAL an uncommitted
    /// page must not reach disk, so only clean pages are eviction victims.
    fn evict(&mut self) -> Result<()> {
        let victim = self
            .lru
            .iter()
            .copied()
            .find(|pid| !self.dirty.contains_key(pid));
        match victim {
            Some(pid) => {
                debug!(%pid, "evicting clean page");
                self.lru.retain(|p| *p != pid);
                self.pages.remove(&pid);
                Ok(())
            }
            None => Err(TreelineError::BufferPoolFull),
        }
    }
}

/// Bounded in-memory cache of pages with page-granular two-phase locking.
///
/// Every page access goes through [`BufferPool::get_page`], which acquires
/// the logical lock before the page is returned. Locks are held until
/// [`BufferPool::transaction_complete`] releases them in one batch; commit
/// flushes the transaction's dirty pages, abort restores their before
/// images in memory.
pub struct BufferPool {
    capacity: usize,
    locks: LockManager,
    sources: RwLock<HashMap<u32, Arc<dyn PageSource>>>,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Creates a pool caching at most `config.buffer_pool_pages` pages.
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            capacity: config.buffer_pool_pages,
            locks: LockManager::new(config.lock_timeout()),
            sources: RwLock::new(HashMap::new()),
            inner: Mutex::new(PoolInner {
                pages: HashMap::new(),
                lru: VecDeque::new(),
                dirty: HashMap::new(),
            }),
        }
    }

    /// Creates a pool sized to 25% of available system RAM, with a floor of
    /// 1,000 pages so caching stays useful on low-memory systems.
    pub fn auto_sized() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let buffer_pool_pages = (available_bytes / 4 / PAGE_SIZE).max(1_000);

        Self::new(&StorageConfig {
            buffer_pool_pages,
            ..StorageConfig::default()
        })
    }

    /// Registers the backing store for a table.
    pub fn register_source(&self, source: Arc<dyn PageSource>) {
        self.sources.write().insert(source.table_id(), source);
    }

    fn source_for(&self, table_id: u32) -> Result<Arc<dyn PageSource>> {
        self.sources
            .read()
            .get(&table_id)
            .cloned()
            .ok_or(TreelineError::NoSuchTable(table_id))
    }

    /// Returns the number of cached pages.
    pub fn cached_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Returns true if the page is resident.
    pub fn contains(&self, pid: PageId) -> bool {
        self.inner.lock().pages.contains_key(&pid)
    }

    /// Returns true if the page is dirty.
    pub fn is_dirty(&self, pid: PageId) -> bool {
        self.inner.lock().dirty.contains_key(&pid)
    }

    /// Fetches a page under the requested lock mode.
    ///
    /// Acquires the logical lock first, then serves the page from cache or
    /// loads it from the backing store, evicting a clean page if the pool is
    /// full. A read past the end of the file while the page is supposed to
    /// exist aborts the transaction.
    pub fn get_page(&self, tid: TransactionId, pid: PageId, mode: LockMode) -> Result<PageHandle> {
        self.locks.acquire(tid, pid, mode)?;

        let mut inner = self.inner.lock();
        if let Some(handle) = inner.pages.get(&pid).cloned() {
            inner.touch(pid);
            return Ok(handle);
        }

        let source = self.source_for(pid.table_id)?;
        if inner.pages.len() >= self.capacity {
            inner.evict()?;
        }

        let page = match source.read_page(pid) {
            Ok(page) => page,
            Err(TreelineError::ReadPastEnd { page_no }) => {
                return Err(TreelineError::TransactionAborted(format!(
                    "page {} does not exist on disk",
                    page_no
                )))
            }
            Err(e) => return Err(e),
        };
        trace!(%tid, %pid, "loaded page from disk");

        let handle: PageHandle = Arc::new(RwLock::new(page));
        inner.pages.insert(pid, handle.clone());
        inner.lru.push_back(pid);
        Ok(handle)
    }

    /// Installs a page dirtied by `tid`: cached if missing, moved to the MRU
    /// end, and recorded against the transaction.
    pub fn install_dirty(&self, tid: TransactionId, handle: &PageHandle) {
        let pid = handle.read().id();
        let mut inner = self.inner.lock();
        inner.pages.entry(pid).or_insert_with(|| handle.clone());
        inner.touch(pid);
        inner.dirty.insert(pid, tid);
    }

    /// Writes the page to disk if it is dirty, then clears the dirty flag.
    pub fn flush_page(&self, pid: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner, pid)
    }

    /// Flushes every page dirtied by `tid`.
    pub fn flush_pages(&self, tid: TransactionId) -> Result<()> {
        let mut inner = self.inner.lock();
        let pids: Vec<PageId> = inner
            .dirty
            .iter()
            .filter(|(_, dirtier)| **dirtier == tid)
            .map(|(pid, _)| *pid)
            .collect();
        for pid in pids {
            self.flush_locked(&mut inner, pid)?;
        }
        Ok(())
    }

    /// Flushes every dirty page.
    ///
    /// Writes uncommitted data to disk, so this breaks NO-STEAL; only call
    /// it when no transaction is in flight.
    pub fn flush_all_pages(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let pids: Vec<PageId> = inner.dirty.keys().copied().collect();
        for pid in pids {
            self.flush_locked(&mut inner, pid)?;
        }
        Ok(())
    }

    fn flush_locked(&self, inner: &mut PoolInner, pid: PageId) -> Result<()> {
        if !inner.dirty.contains_key(&pid) {
            return Ok(());
        }
        let handle = match inner.pages.get(&pid) {
            Some(handle) => handle.clone(),
            None => return Ok(()),
        };
        let source = self.source_for(pid.table_id)?;
        source.write_page(&handle.read())?;
        inner.dirty.remove(&pid);
        debug!(%pid, "flushed page");
        Ok(())
    }

    /// Drops the page from the cache without writing it.
    ///
    /// Used after merges free a page and when installing a fresh empty page
    /// over a recycled slot.
    pub fn discard_page(&self, pid: PageId) {
        let mut inner = self.inner.lock();
        inner.pages.remove(&pid);
        inner.lru.retain(|p| *p != pid);
        inner.dirty.remove(&pid);
    }

    /// Releases a single page lock early.
    ///
    /// This escapes strict two-phase locking; it exists for the scan
    /// iterator's page hand-over and must not be used on modified pages.
    pub fn release_page(&self, tid: TransactionId, pid: PageId) {
        self.locks.release(tid, pid);
    }

    /// Returns true if `tid` holds a lock on `pid`.
    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.locks.holds(tid, pid)
    }

    /// Commits or aborts a transaction, then releases all its locks.
    ///
    /// Commit flushes the transaction's dirty pages and refreshes their
    /// before images. Abort restores every dirtied page from its before
    /// image in memory; because eviction never writes dirty pages, nothing
    /// the transaction wrote can have reached disk.
    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let pids: Vec<PageId> = inner
                .dirty
                .iter()
                .filter(|(_, dirtier)| **dirtier == tid)
                .map(|(pid, _)| *pid)
                .collect();

            for pid in pids {
                if commit {
                    self.flush_locked(&mut inner, pid)?;
                    if let Some(handle) = inner.pages.get(&pid) {
                        handle.write().set_before_image();
                    }
                } else {
                    if let Some(handle) = inner.pages.get(&pid) {
                        let restored = handle.read().before_image()?;
                        *handle.write() = restored;
                    }
                    inner.dirty.remove(&pid);
                }
            }
        }
        debug!(%tid, commit, "transaction complete");
        self.locks.release_all(tid);
        Ok(())
    }
}
