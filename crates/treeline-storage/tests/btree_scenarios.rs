//! End-to-end B+ tree scenarios: splits, merges, redistribution, page
//! recycling, aborts, and randomized workloads.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::tempdir;
use treeline_buffer::{BufferPool, LockMode};
use treeline_common::{
    Field, FieldType, IndexPredicate, Op, PageId, PageKind, StorageConfig, TransactionId, Tuple,
    TupleLayout,
};
use treeline_storage::{check_tree, BTreeIndex, TreeFile};

const TABLE_ID: u32 = 1;
const LEAF_CAPACITY: i32 = 502;

fn config(pool_pages: usize) -> StorageConfig {
    StorageConfig {
        buffer_pool_pages: pool_pages,
        lock_timeout_ms: 100,
        fsync_enabled: false,
    }
}

fn open_index(dir: &tempfile::TempDir, pool_pages: usize) -> BTreeIndex {
    let cfg = config(pool_pages);
    let layout = TupleLayout::new(vec![FieldType::Int, FieldType::Int]);
    let file = Arc::new(
        TreeFile::open(dir.path().join("tree.dat"), TABLE_ID, 0, layout, &cfg).unwrap(),
    );
    let pool = Arc::new(BufferPool::new(&cfg));
    BTreeIndex::new(file, pool)
}

fn tuple(key: i32) -> Tuple {
    Tuple::new(vec![Field::Int(key), Field::Int(key * 2)])
}

fn key_of(t: &Tuple) -> i32 {
    match t.field(0) {
        Field::Int(v) => *v,
        _ => unreachable!(),
    }
}

fn scan_keys(index: &BTreeIndex, tid: TransactionId) -> Vec<i32> {
    let mut iter = index.scan(tid);
    iter.open().unwrap();
    let mut keys = Vec::new();
    while let Some(t) = iter.next_tuple().unwrap() {
        keys.push(key_of(&t));
    }
    keys
}

/// Deletes the first `n` tuples in key order, one scan each, so record ids
/// are always fresh.
fn delete_first(index: &BTreeIndex, tid: TransactionId, n: usize) {
    for _ in 0..n {
        let mut iter = index.scan(tid);
        iter.open().unwrap();
        let first = iter.next_tuple().unwrap().expect("tree ran out of tuples");
        iter.close();
        index.delete(tid, &first).unwrap();
    }
}

/// Reads the root internal page's entries (root pointer -> root).
fn root_entries(index: &BTreeIndex, tid: TransactionId) -> Vec<treeline_common::page::Entry> {
    let root_ptr = index
        .pool()
        .get_page(tid, PageId::root_ptr(TABLE_ID), LockMode::Shared)
        .unwrap();
    let root_id = root_ptr.read().as_root_ptr().unwrap().root_id().unwrap();
    assert_eq!(root_id.kind, PageKind::Internal);
    let root = index.pool().get_page(tid, root_id, LockMode::Shared).unwrap();
    let guard = root.read();
    guard.as_internal().unwrap().entries()
}

fn leaf_tuple_count(index: &BTreeIndex, tid: TransactionId, pid: PageId) -> usize {
    let handle = index.pool().get_page(tid, pid, LockMode::Shared).unwrap();
    let guard = handle.read();
    guard.as_leaf().unwrap().tuple_count()
}

fn leaf_first_key(index: &BTreeIndex, tid: TransactionId, pid: PageId) -> i32 {
    let handle = index.pool().get_page(tid, pid, LockMode::Shared).unwrap();
    let guard = handle.read();
    let page = guard.as_leaf().unwrap();
    key_of(page.first_tuple().unwrap())
}

#[test]
fn test_first_split_builds_two_leaves() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);
    let tid = index.begin_transaction();

    for key in 1..=600 {
        index.insert(tid, tuple(key)).unwrap();
    }

    // Root internal plus two leaves.
    assert_eq!(index.num_pages().unwrap(), 3);
    assert_eq!(scan_keys(&index, tid), (1..=600).collect::<Vec<_>>());

    let entries = root_entries(&index, tid);
    assert_eq!(entries.len(), 1);
    let right_first = leaf_first_key(&index, tid, entries[0].right_child);
    assert_eq!(entries[0].key, Field::Int(right_first));

    check_tree(&index, tid).unwrap();
    index.transaction_complete(tid, true).unwrap();
}

#[test]
fn test_merge_collapses_root_to_leaf() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);
    let tid = index.begin_transaction();

    for key in 1..=600 {
        index.insert(tid, tuple(key)).unwrap();
    }
    index.transaction_complete(tid, true).unwrap();

    // Two leaves cannot hold fewer than capacity tuples; deleting down to
    // 100 forces a merge and a root collapse.
    let tid = index.begin_transaction();
    delete_first(&index, tid, 500);

    let root_ptr = index
        .pool()
        .get_page(tid, PageId::root_ptr(TABLE_ID), LockMode::Shared)
        .unwrap();
    let root_id = root_ptr.read().as_root_ptr().unwrap().root_id().unwrap();
    assert_eq!(root_id.kind, PageKind::Leaf);

    assert_eq!(scan_keys(&index, tid), (501..=600).collect::<Vec<_>>());
    check_tree(&index, tid).unwrap();
    index.transaction_complete(tid, true).unwrap();
}

#[test]
fn test_redistribution_instead_of_merge() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);
    let tid = index.begin_transaction();

    // Descending inserts leave the left leaf full and the right leaf at
    // minimum occupancy.
    for key in (1..=753).rev() {
        index.insert(tid, tuple(key)).unwrap();
    }
    let entries = root_entries(&index, tid);
    assert_eq!(entries.len(), 1);
    assert_eq!(
        leaf_tuple_count(&index, tid, entries[0].left_child),
        LEAF_CAPACITY as usize
    );
    assert_eq!(leaf_tuple_count(&index, tid, entries[0].right_child), 251);

    // One delete from the right leaf triggers a steal from the left.
    let mut iter = index.index_scan(tid, IndexPredicate::new(Op::Equals, Field::Int(753)));
    iter.open().unwrap();
    let victim = iter.next_tuple().unwrap().unwrap();
    iter.close();
    index.delete(tid, &victim).unwrap();

    let entries = root_entries(&index, tid);
    let left_count = leaf_tuple_count(&index, tid, entries[0].left_child);
    let right_count = leaf_tuple_count(&index, tid, entries[0].right_child);
    assert_eq!(left_count + right_count, 752);
    assert!(left_count.abs_diff(right_count) <= 1, "{left_count} vs {right_count}");

    // The separator was rewritten to the right leaf's new first key.
    let right_first = leaf_first_key(&index, tid, entries[0].right_child);
    assert_eq!(entries[0].key, Field::Int(right_first));

    check_tree(&index, tid).unwrap();
    index.transaction_complete(tid, true).unwrap();
}

#[test]
fn test_freed_pages_are_reused() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);

    let tid = index.begin_transaction();
    for key in 1..=600 {
        index.insert(tid, tuple(key)).unwrap();
    }
    assert_eq!(index.num_pages().unwrap(), 3);
    index.transaction_complete(tid, true).unwrap();

    // Deleting down to 100 tuples merges the leaves. Freeing the non-tail
    // leaf creates the first header page; the emptied root is freed too.
    let tid = index.begin_transaction();
    delete_first(&index, tid, 500);
    index.transaction_complete(tid, true).unwrap();
    let pages_after_merge = index.num_pages().unwrap();
    assert_eq!(pages_after_merge, 4);

    // Growing the tree again must recycle the freed slots instead of
    // extending the file.
    let tid = index.begin_transaction();
    for key in 601..=1200 {
        index.insert(tid, tuple(key)).unwrap();
    }
    check_tree(&index, tid).unwrap();
    assert_eq!(index.num_pages().unwrap(), pages_after_merge);
    assert_eq!(
        scan_keys(&index, tid),
        (501..=1200).collect::<Vec<_>>()
    );
    index.transaction_complete(tid, true).unwrap();
}

#[test]
fn test_equality_scan_touches_few_pages() {
    let dir = tempdir().unwrap();

    {
        let index = open_index(&dir, 256);
        let tid = index.begin_transaction();
        for key in 1..=6000 {
            index.insert(tid, tuple(key)).unwrap();
        }
        index.transaction_complete(tid, true).unwrap();
        index.pool().flush_all_pages().unwrap();
    }

    // Re-open with a cold pool so cached_pages counts exactly the pages the
    // scan reads: root pointer, root, and at most two leaves.
    let index = open_index(&dir, 256);
    let tid = index.begin_transaction();
    let mut iter = index.index_scan(tid, IndexPredicate::new(Op::Equals, Field::Int(3000)));
    iter.open().unwrap();
    let mut matches = 0;
    while let Some(t) = iter.next_tuple().unwrap() {
        assert_eq!(key_of(&t), 3000);
        matches += 1;
    }
    assert_eq!(matches, 1);
    assert!(
        index.pool().cached_pages() <= 4,
        "equality scan read {} pages",
        index.pool().cached_pages()
    );
    index.transaction_complete(tid, true).unwrap();
}

#[test]
fn test_range_scan_reads_only_matching_leaves() {
    let dir = tempdir().unwrap();

    {
        let index = open_index(&dir, 256);
        let tid = index.begin_transaction();
        for key in 1..=6000 {
            index.insert(tid, tuple(key)).unwrap();
        }
        index.transaction_complete(tid, true).unwrap();
        index.pool().flush_all_pages().unwrap();
    }

    let index = open_index(&dir, 256);
    let tid = index.begin_transaction();
    let mut iter = index.index_scan(
        tid,
        IndexPredicate::new(Op::GreaterThanOrEq, Field::Int(5500)),
    );
    iter.open().unwrap();
    let mut got = Vec::new();
    while let Some(t) = iter.next_tuple().unwrap() {
        got.push(key_of(&t));
    }
    assert_eq!(got, (5500..=6000).collect::<Vec<_>>());

    // Root pointer + root + the leaves holding 501 matching tuples (+1
    // boundary leaf).
    let leaves_needed = 501_usize.div_ceil(251) + 1;
    assert!(
        index.pool().cached_pages() <= 2 + leaves_needed,
        "range scan read {} pages",
        index.pool().cached_pages()
    );
    index.transaction_complete(tid, true).unwrap();
}

#[test]
fn test_abort_restores_pre_transaction_state() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);

    let tid = index.begin_transaction();
    for key in 1..=5 {
        index.insert(tid, tuple(key)).unwrap();
    }
    index.transaction_complete(tid, true).unwrap();

    let disk_before = std::fs::read(dir.path().join("tree.dat")).unwrap();

    // Transaction A inserts and aborts.
    let a = index.begin_transaction();
    for key in 6..=10 {
        index.insert(a, tuple(key)).unwrap();
    }
    assert_eq!(scan_keys(&index, a), (1..=10).collect::<Vec<_>>());
    index.transaction_complete(a, false).unwrap();

    // Nothing A wrote reached disk.
    let disk_after = std::fs::read(dir.path().join("tree.dat")).unwrap();
    assert_eq!(disk_before, disk_after);

    // A later transaction observes exactly the committed state.
    let b = index.begin_transaction();
    assert_eq!(scan_keys(&index, b), (1..=5).collect::<Vec<_>>());
    check_tree(&index, b).unwrap();
    index.transaction_complete(b, true).unwrap();
}

#[test]
fn test_abort_rolls_back_structural_changes() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);

    let tid = index.begin_transaction();
    for key in 1..=400 {
        index.insert(tid, tuple(key)).unwrap();
    }
    index.transaction_complete(tid, true).unwrap();

    // This transaction forces a split, then aborts.
    let a = index.begin_transaction();
    for key in 401..=700 {
        index.insert(a, tuple(key)).unwrap();
    }
    index.transaction_complete(a, false).unwrap();

    let b = index.begin_transaction();
    assert_eq!(scan_keys(&index, b), (1..=400).collect::<Vec<_>>());
    check_tree(&index, b).unwrap();
    index.transaction_complete(b, true).unwrap();
}

#[test]
fn test_conflicting_writers_serialize_or_abort() {
    let dir = tempdir().unwrap();
    let index = Arc::new(open_index(&dir, 256));

    let mut handles = Vec::new();
    for worker in 0..2 {
        let index = Arc::clone(&index);
        handles.push(std::thread::spawn(move || {
            let base = worker * 200;
            for chunk in 0..20 {
                // Retry each small transaction until it commits.
                loop {
                    let tid = index.begin_transaction();
                    let result = (0..10).try_for_each(|i| {
                        index
                            .insert(tid, tuple(base + chunk * 10 + i + 1))
                            .map(|_| ())
                    });
                    match result {
                        Ok(()) => {
                            index.transaction_complete(tid, true).unwrap();
                            break;
                        }
                        Err(e) if e.is_abort() => {
                            index.transaction_complete(tid, false).unwrap();
                        }
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let tid = index.begin_transaction();
    assert_eq!(scan_keys(&index, tid), (1..=400).collect::<Vec<_>>());
    check_tree(&index, tid).unwrap();
    index.transaction_complete(tid, true).unwrap();
}

#[test]
fn test_predicated_scans_match_filtered_full_scan() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);
    let tid = index.begin_transaction();

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..2000 {
        index.insert(tid, tuple(rng.gen_range(0..500))).unwrap();
    }

    let all = scan_keys(&index, tid);
    let probe = 250;
    for op in [
        Op::Equals,
        Op::NotEqual,
        Op::GreaterThan,
        Op::GreaterThanOrEq,
        Op::LessThan,
        Op::LessThanOrEq,
    ] {
        let mut iter = index.index_scan(tid, IndexPredicate::new(op, Field::Int(probe)));
        iter.open().unwrap();
        let mut got = Vec::new();
        while let Some(t) = iter.next_tuple().unwrap() {
            got.push(key_of(&t));
        }
        let expected: Vec<i32> = all
            .iter()
            .copied()
            .filter(|k| Field::Int(*k).compare(op, &Field::Int(probe)).unwrap())
            .collect();
        assert_eq!(got, expected, "mismatch for {:?}", op);
    }
    index.transaction_complete(tid, true).unwrap();
}

#[test]
fn test_duplicates_straddling_leaves_are_all_found() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);
    let tid = index.begin_transaction();

    // 600 equal keys force a split, so the duplicate run spans both leaves
    // and an equality scan must walk rightward across the boundary.
    for _ in 0..600 {
        index.insert(tid, tuple(7)).unwrap();
    }
    index.insert(tid, tuple(3)).unwrap();
    index.insert(tid, tuple(9)).unwrap();

    let mut iter = index.index_scan(tid, IndexPredicate::new(Op::Equals, Field::Int(7)));
    iter.open().unwrap();
    let mut matches = 0;
    while let Some(t) = iter.next_tuple().unwrap() {
        assert_eq!(key_of(&t), 7);
        matches += 1;
    }
    assert_eq!(matches, 600);

    check_tree(&index, tid).unwrap();
    index.transaction_complete(tid, true).unwrap();
}

#[test]
fn test_iterator_rewind() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);
    let tid = index.begin_transaction();

    for key in 1..=50 {
        index.insert(tid, tuple(key)).unwrap();
    }

    let mut iter = index.scan(tid);
    iter.open().unwrap();
    for _ in 0..20 {
        iter.next_tuple().unwrap().unwrap();
    }
    iter.rewind().unwrap();
    assert_eq!(key_of(&iter.next_tuple().unwrap().unwrap()), 1);
    iter.close();

    let mut search = index.index_scan(tid, IndexPredicate::new(Op::GreaterThan, Field::Int(45)));
    search.open().unwrap();
    assert_eq!(key_of(&search.next_tuple().unwrap().unwrap()), 46);
    search.rewind().unwrap();
    assert_eq!(key_of(&search.next_tuple().unwrap().unwrap()), 46);

    index.transaction_complete(tid, true).unwrap();
}

#[test]
fn test_scan_of_empty_tree_yields_nothing() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);
    let tid = index.begin_transaction();

    let mut iter = index.scan(tid);
    iter.open().unwrap();
    assert!(iter.next_tuple().unwrap().is_none());

    let mut search = index.index_scan(tid, IndexPredicate::new(Op::Equals, Field::Int(1)));
    search.open().unwrap();
    assert!(search.next_tuple().unwrap().is_none());

    index.transaction_complete(tid, true).unwrap();
}

#[test]
fn test_lock_timeout_aborts_then_retry_succeeds() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);

    // Writer A holds exclusive locks on the leaf until completed.
    let a = index.begin_transaction();
    index.insert(a, tuple(1)).unwrap();

    // B cannot reach the page within the timeout and must abort.
    let b = index.begin_transaction();
    let err = index.insert(b, tuple(2)).unwrap_err();
    assert!(err.is_abort());
    index.transaction_complete(b, false).unwrap();

    index.transaction_complete(a, true).unwrap();

    // After A commits and releases, a retry goes through.
    let b = index.begin_transaction();
    index.insert(b, tuple(2)).unwrap();
    assert_eq!(scan_keys(&index, b), vec![1, 2]);
    index.transaction_complete(b, true).unwrap();
}

#[test]
fn test_random_workload_keeps_tree_consistent() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 512);
    let mut rng = StdRng::seed_from_u64(42);

    // Multiset of live keys (duplicates allowed).
    let mut live: BTreeMap<i32, usize> = BTreeMap::new();

    for round in 0..20 {
        let tid = index.begin_transaction();
        for _ in 0..100 {
            let insert = live.is_empty() || rng.gen_bool(0.6);
            if insert {
                let key = rng.gen_range(0..1000);
                index.insert(tid, tuple(key)).unwrap();
                *live.entry(key).or_insert(0) += 1;
            } else {
                // Delete one existing tuple found through a scan.
                let nth = rng.gen_range(0..live.values().sum::<usize>());
                let mut iter = index.scan(tid);
                iter.open().unwrap();
                let mut victim = None;
                for _ in 0..=nth {
                    victim = iter.next_tuple().unwrap();
                }
                iter.close();
                let victim = victim.expect("scan shorter than live count");
                index.delete(tid, &victim).unwrap();
                let key = key_of(&victim);
                match live.get_mut(&key) {
                    Some(count) if *count > 1 => *count -= 1,
                    _ => {
                        live.remove(&key);
                    }
                }
            }
        }

        let expected: Vec<i32> = live
            .iter()
            .flat_map(|(k, n)| std::iter::repeat(*k).take(*n))
            .collect();
        assert_eq!(scan_keys(&index, tid), expected, "round {round}");
        check_tree(&index, tid).unwrap();
        index.transaction_complete(tid, true).unwrap();
    }
}

#[test]
fn test_delete_everything_then_reuse() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);

    let tid = index.begin_transaction();
    for key in 1..=700 {
        index.insert(tid, tuple(key)).unwrap();
    }
    index.transaction_complete(tid, true).unwrap();

    let tid = index.begin_transaction();
    delete_first(&index, tid, 700);
    assert!(scan_keys(&index, tid).is_empty());
    check_tree(&index, tid).unwrap();
    index.transaction_complete(tid, true).unwrap();

    // The empty tree is usable again and recycles its pages.
    let pages_when_empty = index.num_pages().unwrap();
    let tid = index.begin_transaction();
    for key in 1..=600 {
        index.insert(tid, tuple(key)).unwrap();
    }
    assert_eq!(scan_keys(&index, tid), (1..=600).collect::<Vec<_>>());
    check_tree(&index, tid).unwrap();
    assert!(index.num_pages().unwrap() <= pages_when_empty.max(3));
    index.transaction_complete(tid, true).unwrap();
}

#[test]
fn test_round_trip_of_all_pages_in_workload() {
    let dir = tempdir().unwrap();
    let index = open_index(&dir, 256);
    let layout = TupleLayout::new(vec![FieldType::Int, FieldType::Int]);

    let tid = index.begin_transaction();
    for key in 1..=1500 {
        index.insert(tid, tuple(key)).unwrap();
    }
    index.transaction_complete(tid, true).unwrap();
    index.pool().flush_all_pages().unwrap();

    // Every page produced by the workload decodes back to identical bytes.
    let file = TreeFile::open(
        dir.path().join("tree.dat"),
        TABLE_ID,
        0,
        layout.clone(),
        &config(16),
    )
    .unwrap();
    use treeline_buffer::PageSource;
    let bytes = std::fs::read(dir.path().join("tree.dat")).unwrap();
    let root_ptr = file.read_page(PageId::root_ptr(TABLE_ID)).unwrap();
    assert_eq!(
        root_ptr.encode().as_slice(),
        &bytes[..treeline_common::ROOT_PTR_SIZE]
    );

    for page_no in 1..=file.num_pages().unwrap() {
        // Kind is not self-describing; try the tree kinds in turn.
        let mut decoded = None;
        for kind in [PageKind::Leaf, PageKind::Internal, PageKind::Header] {
            let pid = PageId::new(TABLE_ID, page_no, kind);
            if let Ok(page) = file.read_page(pid) {
                let start = treeline_common::ROOT_PTR_SIZE
                    + (page_no as usize - 1) * treeline_common::PAGE_SIZE;
                let original = &bytes[start..start + treeline_common::PAGE_SIZE];
                if page.encode() == original {
                    decoded = Some(page);
                    break;
                }
            }
        }
        assert!(decoded.is_some(), "page {page_no} failed to round trip");
    }
}
