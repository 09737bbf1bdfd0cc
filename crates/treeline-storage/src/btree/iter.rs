//! Ordered full-scan and predicated index-scan iterators.
//!
//! Both iterators take shared locks on every page they visit and follow the
//! leaf chain rightward; under strict two-phase locking the locks stay held
//! until the enclosing transaction completes, which makes scans phantom-safe
//! against committed writers.

use super::index::BTreeIndex;
use std::collections::VecDeque;
use treeline_buffer::LockMode;
use treeline_common::{IndexPredicate, Op, PageId, Result, TransactionId, Tuple};

struct LeafCursor {
    buffer: VecDeque<Tuple>,
    next_leaf: Option<PageId>,
}

impl LeafCursor {
    fn empty() -> Self {
        Self {
            buffer: VecDeque::new(),
            next_leaf: None,
        }
    }
}

/// Full in-order scan over every tuple in the tree.
pub struct TreeIterator<'a> {
    index: &'a BTreeIndex,
    tid: TransactionId,
    cursor: Option<LeafCursor>,
}

impl<'a> TreeIterator<'a> {
    pub(crate) fn new(index: &'a BTreeIndex, tid: TransactionId) -> Self {
        Self {
            index,
            tid,
            cursor: None,
        }
    }

    /// Positions the scan on the leftmost leaf.
    pub fn open(&mut self) -> Result<()> {
        self.cursor = Some(open_cursor(self.index, self.tid, None)?);
        Ok(())
    }

    /// Returns the next tuple in key order, or None when exhausted.
    pub fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        let cursor = match &mut self.cursor {
            Some(cursor) => cursor,
            None => return Ok(None),
        };
        loop {
            if let Some(tuple) = cursor.buffer.pop_front() {
                return Ok(Some(tuple));
            }
            if !advance_leaf(self.index, self.tid, cursor)? {
                return Ok(None);
            }
        }
    }

    /// Restarts the scan from the beginning.
    pub fn rewind(&mut self) -> Result<()> {
        self.close();
        self.open()
    }

    /// Ends the scan. Page locks stay held until the transaction completes.
    pub fn close(&mut self) {
        self.cursor = None;
    }
}

/// Index scan returning tuples whose key satisfies a predicate.
pub struct TreeSearchIterator<'a> {
    index: &'a BTreeIndex,
    tid: TransactionId,
    predicate: IndexPredicate,
    cursor: Option<LeafCursor>,
}

impl<'a> TreeSearchIterator<'a> {
    pub(crate) fn new(index: &'a BTreeIndex, tid: TransactionId, predicate: IndexPredicate) -> Self {
        Self {
            index,
            tid,
            predicate,
            cursor: None,
        }
    }

    /// Positions the scan on the first leaf that can hold a match.
    ///
    /// Equality and greater-than predicates seek directly to the leftmost
    /// leaf possibly containing the probe value; the rest start from the
    /// leftmost leaf.
    pub fn open(&mut self) -> Result<()> {
        let probe = match self.predicate.op {
            Op::Equals | Op::GreaterThan | Op::GreaterThanOrEq => Some(&self.predicate.value),
            Op::LessThan | Op::LessThanOrEq | Op::NotEqual => None,
        };
        self.cursor = Some(open_cursor(self.index, self.tid, probe)?);
        Ok(())
    }

    /// Returns the next matching tuple, or None when no further tuple can
    /// match.
    ///
    /// Because keys are monotone along the leaf chain, less-than scans stop
    /// at the first failing tuple and equality scans stop once a key
    /// exceeds the probe value.
    pub fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        let cursor = match &mut self.cursor {
            Some(cursor) => cursor,
            None => return Ok(None),
        };
        let key_field = self.index.file.key_field();
        loop {
            while let Some(tuple) = cursor.buffer.pop_front() {
                let key = tuple.field(key_field);
                if key.compare(self.predicate.op, &self.predicate.value)? {
                    return Ok(Some(tuple));
                }
                match self.predicate.op {
                    Op::LessThan | Op::LessThanOrEq => return Ok(None),
                    Op::Equals => {
                        if key.compare(Op::GreaterThan, &self.predicate.value)? {
                            return Ok(None);
                        }
                    }
                    _ => {}
                }
            }
            if !advance_leaf(self.index, self.tid, cursor)? {
                return Ok(None);
            }
        }
    }

    /// Restarts the scan from the beginning.
    pub fn rewind(&mut self) -> Result<()> {
        self.close();
        self.open()
    }

    /// Ends the scan. Page locks stay held until the transaction completes.
    pub fn close(&mut self) {
        self.cursor = None;
    }
}

impl BTreeIndex {
    /// Returns a full in-order scan over this tree.
    pub fn scan(&self, tid: TransactionId) -> TreeIterator<'_> {
        TreeIterator::new(self, tid)
    }

    /// Returns a predicated scan over this tree's key field.
    pub fn index_scan(&self, tid: TransactionId, predicate: IndexPredicate) -> TreeSearchIterator<'_> {
        TreeSearchIterator::new(self, tid, predicate)
    }
}

fn open_cursor(
    index: &BTreeIndex,
    tid: TransactionId,
    probe: Option<&treeline_common::Field>,
) -> Result<LeafCursor> {
    let root_ptr = index.get_root_ptr_page(tid)?;
    let root_id = root_ptr.read().as_root_ptr()?.root_id();
    let root_id = match root_id {
        Some(root_id) => root_id,
        None => return Ok(LeafCursor::empty()),
    };

    let leaf = index.find_leaf(tid, probe, root_id, LockMode::Shared)?;
    let guard = leaf.read();
    let page = guard.as_leaf()?;
    Ok(LeafCursor {
        buffer: page.tuples().into(),
        next_leaf: page.right_sibling_id(),
    })
}

/// Moves the cursor to the next leaf; false when the chain ends.
fn advance_leaf(index: &BTreeIndex, tid: TransactionId, cursor: &mut LeafCursor) -> Result<bool> {
    let next = match cursor.next_leaf.take() {
        Some(next) => next,
        None => return Ok(false),
    };
    let leaf = index.pool.get_page(tid, next, LockMode::Shared)?;
    let guard = leaf.read();
    let page = guard.as_leaf()?;
    cursor.buffer = page.tuples().into();
    cursor.next_leaf = page.right_sibling_id();
    Ok(true)
}
