//! Tree consistency checker.
//!
//! Walks the whole tree under a transaction and verifies the structural
//! invariants: occupancy bounds, parent pointers, separator ordering, and
//! the doubly linked, key-sorted leaf chain. Intended for tests and
//! embedder assertions; every violation is reported as an error rather than
//! a panic.

use super::index::BTreeIndex;
use std::cmp::Ordering;
use treeline_buffer::LockMode;
use treeline_common::{Field, PageId, PageKind, Result, TransactionId, TreelineError};

fn violation(msg: String) -> TreelineError {
    TreelineError::Internal(format!("consistency violation: {}", msg))
}

/// Verifies the structural invariants of the whole tree.
pub fn check_tree(index: &BTreeIndex, tid: TransactionId) -> Result<()> {
    let root_ptr = index.get_root_ptr_page(tid)?;
    let root_id = root_ptr.read().as_root_ptr()?.root_id();
    let root_id = match root_id {
        Some(root_id) => root_id,
        None => return Ok(()),
    };

    let mut leaves = Vec::new();
    check_subtree(
        index,
        tid,
        root_id,
        PageId::root_ptr(index.table_id()),
        None,
        None,
        &mut leaves,
    )?;
    check_leaf_chain(index, tid, &leaves)
}

fn check_subtree(
    index: &BTreeIndex,
    tid: TransactionId,
    pid: PageId,
    expected_parent: PageId,
    lower: Option<&Field>,
    upper: Option<&Field>,
    leaves: &mut Vec<PageId>,
) -> Result<()> {
    let is_root = expected_parent.kind == PageKind::RootPtr;
    let handle = index.pool.get_page(tid, pid, LockMode::Shared)?;

    match pid.kind {
        PageKind::Leaf => {
            let guard = handle.read();
            let page = guard.as_leaf()?;
            if page.parent_id() != expected_parent {
                return Err(violation(format!(
                    "leaf {} has parent {}, expected {}",
                    pid,
                    page.parent_id(),
                    expected_parent
                )));
            }
            let min = page.capacity().div_ceil(2);
            if !is_root && page.tuple_count() < min {
                return Err(violation(format!(
                    "leaf {} holds {} tuples, minimum is {}",
                    pid,
                    page.tuple_count(),
                    min
                )));
            }
            let mut prev: Option<&Field> = None;
            for tuple in page.iter() {
                let key = page.key_of(tuple);
                if let Some(prev) = prev {
                    if prev.cmp_value(key)? == Ordering::Greater {
                        return Err(violation(format!("leaf {} keys out of order", pid)));
                    }
                }
                check_bounds(pid, key, lower, upper)?;
                prev = Some(key);
            }
            leaves.push(pid);
            Ok(())
        }
        PageKind::Internal => {
            let (entries, child_count) = {
                let guard = handle.read();
                let page = guard.as_internal()?;
                if page.parent_id() != expected_parent {
                    return Err(violation(format!(
                        "internal {} has parent {}, expected {}",
                        pid,
                        page.parent_id(),
                        expected_parent
                    )));
                }
                let min = page.capacity() / 2;
                if !is_root && page.entry_count() < min {
                    return Err(violation(format!(
                        "internal {} holds {} entries, minimum is {}",
                        pid,
                        page.entry_count(),
                        min
                    )));
                }
                if is_root && page.entry_count() == 0 {
                    return Err(violation(format!("root internal {} is empty", pid)));
                }
                (page.entries(), page.child_ids().len())
            };

            if child_count != entries.len() + 1 {
                return Err(violation(format!(
                    "internal {} has {} children for {} entries",
                    pid,
                    child_count,
                    entries.len()
                )));
            }
            for pair in entries.windows(2) {
                if pair[0].key.cmp_value(&pair[1].key)? == Ordering::Greater {
                    return Err(violation(format!("internal {} keys out of order", pid)));
                }
            }
            for entry in &entries {
                check_bounds(pid, &entry.key, lower, upper)?;
            }

            // Each child's keys fall between the separators around it.
            let mut child_lower = lower.cloned();
            for entry in &entries {
                check_subtree(
                    index,
                    tid,
                    entry.left_child,
                    pid,
                    child_lower.as_ref(),
                    Some(&entry.key),
                    leaves,
                )?;
                child_lower = Some(entry.key.clone());
            }
            if let Some(last) = entries.last() {
                check_subtree(
                    index,
                    tid,
                    last.right_child,
                    pid,
                    Some(&last.key),
                    upper,
                    leaves,
                )?;
            }
            Ok(())
        }
        kind => Err(violation(format!("page {} has kind {} inside the tree", pid, kind))),
    }
}

fn check_bounds(
    pid: PageId,
    key: &Field,
    lower: Option<&Field>,
    upper: Option<&Field>,
) -> Result<()> {
    if let Some(lower) = lower {
        if key.cmp_value(lower)? == Ordering::Less {
            return Err(violation(format!(
                "key {} on page {} is below separator {}",
                key, pid, lower
            )));
        }
    }
    if let Some(upper) = upper {
        if key.cmp_value(upper)? == Ordering::Greater {
            return Err(violation(format!(
                "key {} on page {} is above separator {}",
                key, pid, upper
            )));
        }
    }
    Ok(())
}

/// Verifies the doubly linked leaf chain matches the in-order leaf list.
fn check_leaf_chain(index: &BTreeIndex, tid: TransactionId, leaves: &[PageId]) -> Result<()> {
    for (i, pid) in leaves.iter().enumerate() {
        let handle = index.pool.get_page(tid, *pid, LockMode::Shared)?;
        let guard = handle.read();
        let page = guard.as_leaf()?;

        let expected_left = if i == 0 { None } else { Some(leaves[i - 1]) };
        let expected_right = if i + 1 == leaves.len() {
            None
        } else {
            Some(leaves[i + 1])
        };
        if page.left_sibling_id() != expected_left {
            return Err(violation(format!(
                "leaf {} left sibling is {:?}, expected {:?}",
                pid,
                page.left_sibling_id(),
                expected_left
            )));
        }
        if page.right_sibling_id() != expected_right {
            return Err(violation(format!(
                "leaf {} right sibling is {:?}, expected {:?}",
                pid,
                page.right_sibling_id(),
                expected_right
            )));
        }
    }
    Ok(())
}
