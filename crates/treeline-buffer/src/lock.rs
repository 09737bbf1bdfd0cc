//! Page-granular lock manager.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use treeline_common::{PageId, Result, TransactionId, TreelineError};

/// Lock modes a transaction can request on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct LockTables {
    shared: HashMap<PageId, HashSet<TransactionId>>,
    exclusive: HashMap<PageId, TransactionId>,
}

impl LockTables {
    /// Attempts to grant the request, returning true on success.
    fn try_grant(&mut self, tid: TransactionId, pid: PageId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => match self.exclusive.get(&pid) {
                // Holding exclusive already covers shared.
                Some(holder) if *holder == tid => true,
                Some(_) => false,
                None => {
                    self.shared.entry(pid).or_default().insert(tid);
                    true
                }
            },
            LockMode::Exclusive => {
                match self.exclusive.get(&pid) {
                    Some(holder) if *holder == tid => return true,
                    Some(_) => return false,
                    None => {}
                }
                let upgradable = match self.shared.get(&pid) {
                    None => true,
                    Some(holders) => holders.is_empty() || (holders.len() == 1 && holders.contains(&tid)),
                };
                if upgradable {
                    if let Some(holders) = self.shared.get_mut(&pid) {
                        holders.remove(&tid);
                        if holders.is_empty() {
                            self.shared.remove(&pid);
                        }
                    }
                    self.exclusive.insert(pid, tid);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn release(&mut self, tid: TransactionId, pid: PageId) {
        if self.exclusive.get(&pid) == Some(&tid) {
            self.exclusive.remove(&pid);
        }
        if let Some(holders) = self.shared.get_mut(&pid) {
            holders.remove(&tid);
            if holders.is_empty() {
                self.shared.remove(&pid);
            }
        }
    }

    fn holds(&self, tid: TransactionId, pid: PageId) -> bool {
        self.exclusive.get(&pid) == Some(&tid)
            || self
                .shared
                .get(&pid)
                .map(|holders| holders.contains(&tid))
                .unwrap_or(false)
    }
}

/// Grants and releases page locks on behalf of transactions.
///
/// Shared and exclusive holders live in two maps behind one monitor. There
/// is no cycle detection; a request that cannot be granted within the
/// timeout fails with `TransactionAborted` and the caller is expected to
/// abort and retry.
pub struct LockManager {
    tables: Mutex<LockTables>,
    cond: Condvar,
    timeout: Duration,
}

impl LockManager {
    /// Creates a lock manager with the given acquisition timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(LockTables::default()),
            cond: Condvar::new(),
            timeout,
        }
    }

    /// Acquires a lock on `pid` for `tid`, blocking until granted.
    ///
    /// Re-acquiring a held lock at the same or lower mode is a no-op; a sole
    /// shared holder upgrades in place. Fails with `TransactionAborted` once
    /// the wait exceeds the timeout.
    pub fn acquire(&self, tid: TransactionId, pid: PageId, mode: LockMode) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut tables = self.tables.lock();
        loop {
            if tables.try_grant(tid, pid, mode) {
                trace!(%tid, %pid, ?mode, "lock granted");
                return Ok(());
            }
            if self.cond.wait_until(&mut tables, deadline).timed_out() {
                // One last try in case the holder left as we timed out.
                if tables.try_grant(tid, pid, mode) {
                    trace!(%tid, %pid, ?mode, "lock granted");
                    return Ok(());
                }
                debug!(%tid, %pid, ?mode, "lock wait timed out");
                return Err(TreelineError::TransactionAborted(format!(
                    "timed out waiting for {:?} lock on page {}",
                    mode, pid
                )));
            }
        }
    }

    /// Releases any lock `tid` holds on `pid`.
    pub fn release(&self, tid: TransactionId, pid: PageId) {
        let mut tables = self.tables.lock();
        tables.release(tid, pid);
        self.cond.notify_all();
    }

    /// Releases every lock held by `tid`.
    pub fn release_all(&self, tid: TransactionId) {
        let mut tables = self.tables.lock();
        let exclusive: Vec<PageId> = tables
            .exclusive
            .iter()
            .filter(|(_, holder)| **holder == tid)
            .map(|(pid, _)| *pid)
            .collect();
        for pid in exclusive {
            tables.exclusive.remove(&pid);
        }
        let shared: Vec<PageId> = tables
            .shared
            .iter()
            .filter(|(_, holders)| holders.contains(&tid))
            .map(|(pid, _)| *pid)
            .collect();
        for pid in shared {
            tables.release(tid, pid);
        }
        self.cond.notify_all();
    }

    /// Returns true if `tid` holds any lock on `pid`.
    pub fn holds(&self, tid: TransactionId, pid: PageId) -> bool {
        self.tables.lock().holds(tid, pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use treeline_common::PageKind;

    fn pid(page_no: u32) -> PageId {
        PageId::new(1, page_no, PageKind::Leaf)
    }

    fn manager() -> LockManager {
        LockManager::new(Duration::from_millis(50))
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = manager();
        let (a, b) = (TransactionId::new(), TransactionId::new());

        lm.acquire(a, pid(1), LockMode::Shared).unwrap();
        lm.acquire(b, pid(1), LockMode::Shared).unwrap();
        assert!(lm.holds(a, pid(1)));
        assert!(lm.holds(b, pid(1)));
    }

    #[test]
    fn test_exclusive_blocks_shared() {
        let lm = manager();
        let (a, b) = (TransactionId::new(), TransactionId::new());

        lm.acquire(a, pid(1), LockMode::Exclusive).unwrap();
        let err = lm.acquire(b, pid(1), LockMode::Shared).unwrap_err();
        assert!(err.is_abort());
    }

    #[test]
    fn test_shared_blocks_exclusive() {
        let lm = manager();
        let (a, b) = (TransactionId::new(), TransactionId::new());

        lm.acquire(a, pid(1), LockMode::Shared).unwrap();
        let err = lm.acquire(b, pid(1), LockMode::Exclusive).unwrap_err();
        assert!(err.is_abort());
    }

    #[test]
    fn test_reentrant_acquisition() {
        let lm = manager();
        let a = TransactionId::new();

        lm.acquire(a, pid(1), LockMode::Exclusive).unwrap();
        lm.acquire(a, pid(1), LockMode::Exclusive).unwrap();
        lm.acquire(a, pid(1), LockMode::Shared).unwrap();

        lm.acquire(a, pid(2), LockMode::Shared).unwrap();
        lm.acquire(a, pid(2), LockMode::Shared).unwrap();
    }

    #[test]
    fn test_sole_shared_holder_upgrades() {
        let lm = manager();
        let a = TransactionId::new();

        lm.acquire(a, pid(1), LockMode::Shared).unwrap();
        lm.acquire(a, pid(1), LockMode::Exclusive).unwrap();
        assert!(lm.holds(a, pid(1)));

        // Another shared holder now has to wait.
        let b = TransactionId::new();
        assert!(lm.acquire(b, pid(1), LockMode::Shared).is_err());
    }

    #[test]
    fn test_upgrade_blocked_by_other_reader() {
        let lm = manager();
        let (a, b) = (TransactionId::new(), TransactionId::new());

        lm.acquire(a, pid(1), LockMode::Shared).unwrap();
        lm.acquire(b, pid(1), LockMode::Shared).unwrap();
        assert!(lm.acquire(a, pid(1), LockMode::Exclusive).is_err());
    }

    #[test]
    fn test_release_unblocks_waiter() {
        let lm = Arc::new(LockManager::new(Duration::from_millis(500)));
        let (a, b) = (TransactionId::new(), TransactionId::new());

        lm.acquire(a, pid(1), LockMode::Exclusive).unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = std::thread::spawn(move || lm2.acquire(b, pid(1), LockMode::Exclusive));

        std::thread::sleep(Duration::from_millis(50));
        lm.release(a, pid(1));
        waiter.join().unwrap().unwrap();
        assert!(lm.holds(b, pid(1)));
        assert!(!lm.holds(a, pid(1)));
    }

    #[test]
    fn test_release_all() {
        let lm = manager();
        let (a, b) = (TransactionId::new(), TransactionId::new());

        lm.acquire(a, pid(1), LockMode::Exclusive).unwrap();
        lm.acquire(a, pid(2), LockMode::Shared).unwrap();
        lm.acquire(b, pid(2), LockMode::Shared).unwrap();

        lm.release_all(a);
        assert!(!lm.holds(a, pid(1)));
        assert!(!lm.holds(a, pid(2)));
        assert!(lm.holds(b, pid(2)));

        // Freed pages are acquirable again.
        lm.acquire(b, pid(1), LockMode::Exclusive).unwrap();
    }

    #[test]
    fn test_holds_reports_both_modes() {
        let lm = manager();
        let a = TransactionId::new();

        assert!(!lm.holds(a, pid(1)));
        lm.acquire(a, pid(1), LockMode::Shared).unwrap();
        assert!(lm.holds(a, pid(1)));

        lm.acquire(a, pid(2), LockMode::Exclusive).unwrap();
        assert!(lm.holds(a, pid(2)));
    }
}
