//! Integration tests for the B+ tree index engine.
//!
//! Covers the tree's public surface end to end: ordered traversal under
//! random workloads (checked against a reference model), duplicate-key
//! handling, all four range bounds, deletion down to the empty tree,
//! reopen durability, and the two-tree natural-join walk. Structural
//! invariants are re-verified along the way with `check_invariants`.

use lattice_common::types::{encode_i64, KeyType, PKey, RowId};
use lattice_common::TreeOptions;
use lattice_index::{BPlusTree, Bound};
use rand::Rng;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::tempdir;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn options(branching_factor: i32, pool_pages: usize) -> TreeOptions {
    TreeOptions {
        branching_factor,
        key_size: 8,
        key_type: KeyType::Int64,
        pool_pages,
        fsync_enabled: false,
    }
}

fn open_tree(path: &Path, branching_factor: i32) -> BPlusTree {
    BPlusTree::open(path, options(branching_factor, 32)).unwrap()
}

fn k(value: i64) -> [u8; 8] {
    encode_i64(value)
}

/// Inserts with the row locator equal to the pkey, which keeps scan
/// results easy to assert against.
fn insert(tree: &mut BPlusTree, key: i64, pkey: PKey) {
    assert!(tree.insert(&k(key), pkey, RowId(pkey as u32)).unwrap());
}

fn collect_entries(tree: &mut BPlusTree) -> Vec<(i64, PKey)> {
    let mut out = Vec::new();
    tree.traverse_entries(|key, pkey, _| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(key);
        out.push((i64::from_le_bytes(bytes), pkey));
        true
    })
    .unwrap();
    out
}

fn scan_rows(tree: &mut BPlusTree, bound: Bound<'_>) -> Vec<u32> {
    let mut rows = Vec::new();
    tree.range_scan(bound, |row| {
        rows.push(row.0);
        true
    })
    .unwrap();
    rows
}

// =========================================================================
// Concrete scenarios (B = 2)
// =========================================================================

/// Five inserts force two levels; traversal comes back in composite-key
/// order regardless of insertion order.
#[test]
fn test_scenario_initial_inserts() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir.path().join("s1.lat"), 2);

    for (key, pkey) in [(10, 1), (20, 2), (5, 3), (15, 4), (11, 5)] {
        insert(&mut tree, key, pkey);
    }

    assert_eq!(
        collect_entries(&mut tree),
        vec![(5, 3), (10, 1), (11, 5), (15, 4), (20, 2)]
    );
    assert_eq!(tree.depth().unwrap(), 2);
    tree.check_invariants().unwrap();
}

/// Duplicate-key inserts land in pkey order and are all reachable.
#[test]
fn test_scenario_duplicate_keys() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir.path().join("s2.lat"), 2);

    for (key, pkey) in [(10, 1), (20, 2), (5, 3), (15, 4), (11, 5)] {
        insert(&mut tree, key, pkey);
    }
    for pkey in 5..=9 {
        insert(&mut tree, 71, pkey);
    }

    assert!(tree.search(&k(71)).unwrap());

    let mut rows = Vec::new();
    tree.traverse_with_key(&k(71), |row| rows.push(row.0)).unwrap();
    assert_eq!(rows, vec![5, 6, 7, 8, 9]);
    tree.check_invariants().unwrap();
}

/// Builds the scenario tree: keys 5,10,11,11,15,20 and five 71s.
fn scenario_tree(path: &Path) -> BPlusTree {
    let mut tree = open_tree(path, 2);
    for (key, pkey) in [(10, 1), (20, 2), (5, 3), (15, 4), (11, 5)] {
        insert(&mut tree, key, pkey);
    }
    for pkey in 5..=9 {
        insert(&mut tree, 71, pkey);
    }
    insert(&mut tree, 11, 10);
    tree
}

/// Descending bounds: `LE 11` emits both 11s then 10 and 5; `LT 11`
/// omits the 11s.
#[test]
fn test_scenario_descending_bounds() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = scenario_tree(&dir.path().join("s3.lat"));

    // Entries <= 11 in descending composite order: (11,10), (11,5),
    // (10,1), (5,3).
    assert_eq!(scan_rows(&mut tree, Bound::Le(&k(11))), vec![10, 5, 1, 3]);
    assert_eq!(scan_rows(&mut tree, Bound::Lt(&k(11))), vec![1, 3]);
}

/// Ascending bounds around the duplicate run at the top of the key
/// space.
#[test]
fn test_scenario_ascending_bounds() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = scenario_tree(&dir.path().join("s4.lat"));

    assert_eq!(
        scan_rows(&mut tree, Bound::Ge(&k(71))),
        vec![5, 6, 7, 8, 9]
    );
    assert!(scan_rows(&mut tree, Bound::Gt(&k(71))).is_empty());
    assert_eq!(
        scan_rows(&mut tree, Bound::Ge(&k(20))),
        vec![2, 5, 6, 7, 8, 9]
    );
    assert_eq!(scan_rows(&mut tree, Bound::Eq(&k(11))), vec![5, 10]);
}

/// Deleting every duplicate shrinks the leaf chain (a merge must have
/// happened) and makes the key unsearchable.
#[test]
fn test_scenario_delete_duplicates() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = scenario_tree(&dir.path().join("s5.lat"));

    let leaves_before = tree.leaf_count().unwrap();
    for pkey in 5..=9 {
        assert!(tree.remove(&k(71), pkey).unwrap());
        tree.check_invariants().unwrap();
    }

    assert!(!tree.search(&k(71)).unwrap());
    assert!(tree.leaf_count().unwrap() < leaves_before);
    assert_eq!(
        collect_entries(&mut tree),
        vec![(5, 3), (10, 1), (11, 5), (11, 10), (15, 4), (20, 2)]
    );
}

// =========================================================================
// Universal properties
// =========================================================================

/// Random inserts and deletes against a reference model: traversal must
/// equal the model's ordered contents and invariants must hold
/// throughout.
#[test]
fn test_random_operations_match_model() {
    init_log();
    let dir = tempdir().unwrap();

    for branching_factor in [2, 4] {
        let path = dir.path().join(format!("model_b{}.lat", branching_factor));
        let mut tree = open_tree(&path, branching_factor);
        let mut model: BTreeMap<(i64, PKey), u32> = BTreeMap::new();
        let mut rng = rand::rng();

        for op in 0..600 {
            let key = rng.random_range(0..60);
            if rng.random_range(0..100) < 60 || model.is_empty() {
                let pkey = op as PKey;
                let row = 1000 + op as u32;
                assert!(tree.insert(&k(key), pkey, RowId(row)).unwrap());
                model.insert((key, pkey), row);
            } else {
                // Delete a key that may or may not exist.
                let expected = model
                    .range((key, PKey::MIN)..=(key, PKey::MAX))
                    .next()
                    .map(|(&composite, _)| composite);
                let removed = tree.remove_any(&k(key)).unwrap();
                assert_eq!(removed, expected.is_some());
                if let Some(composite) = expected {
                    model.remove(&composite);
                }
            }

            if op % 25 == 0 {
                tree.check_invariants().unwrap();
            }
        }

        tree.check_invariants().unwrap();

        let mut traversed = Vec::new();
        tree.traverse_entries(|key, pkey, row| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(key);
            traversed.push(((i64::from_le_bytes(bytes), pkey), row.0));
            true
        })
        .unwrap();
        let expected: Vec<((i64, PKey), u32)> =
            model.iter().map(|(&composite, &row)| (composite, row)).collect();
        assert_eq!(traversed, expected);

        // Every surviving entry is searchable by exact composite key.
        for &(key, pkey) in model.keys().take(50) {
            assert!(tree.search_entry(&k(key), pkey).unwrap());
        }
    }
}

/// Range scans agree with the model under random bounds: `GE` ascending,
/// `LE` descending.
#[test]
fn test_range_scans_match_model() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir.path().join("ranges.lat"), 2);
    let mut model: BTreeMap<(i64, PKey), u32> = BTreeMap::new();
    let mut rng = rand::rng();

    for op in 0..200 {
        let key = rng.random_range(0..40);
        let pkey = op as PKey;
        insert(&mut tree, key, pkey);
        model.insert((key, pkey), pkey as u32);
    }

    for _ in 0..20 {
        let bound = rng.random_range(-5..45);

        let ge: Vec<u32> = model
            .range((bound, PKey::MIN)..)
            .map(|(_, &row)| row)
            .collect();
        assert_eq!(scan_rows(&mut tree, Bound::Ge(&k(bound))), ge);

        let le: Vec<u32> = model
            .range(..=(bound, PKey::MAX))
            .rev()
            .map(|(_, &row)| row)
            .collect();
        assert_eq!(scan_rows(&mut tree, Bound::Le(&k(bound))), le);

        let gt: Vec<u32> = model
            .range((bound, PKey::MAX)..)
            .filter(|(&(key, _), _)| key > bound)
            .map(|(_, &row)| row)
            .collect();
        assert_eq!(scan_rows(&mut tree, Bound::Gt(&k(bound))), gt);

        let lt: Vec<u32> = model
            .range(..(bound, PKey::MIN))
            .rev()
            .map(|(_, &row)| row)
            .collect();
        assert_eq!(scan_rows(&mut tree, Bound::Lt(&k(bound))), lt);
    }
}

/// N inserts of one user key stay reachable as N entries.
#[test]
fn test_insert_is_multiset_union() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir.path().join("multiset.lat"), 2);

    for pkey in 0..50 {
        insert(&mut tree, 7, pkey);
    }
    insert(&mut tree, 3, 100);
    insert(&mut tree, 9, 101);

    let mut rows = Vec::new();
    tree.traverse_with_key(&k(7), |row| rows.push(row.0)).unwrap();
    assert_eq!(rows, (0..50).collect::<Vec<u32>>());
    tree.check_invariants().unwrap();
}

/// Insert-then-search and remove-then-search on exact composite keys.
#[test]
fn test_search_tracks_mutations() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir.path().join("mutations.lat"), 2);

    for key in 0..30 {
        insert(&mut tree, key, key);
    }
    for key in 0..30 {
        assert!(tree.search(&k(key)).unwrap(), "key {} after insert", key);
        assert!(tree.search_entry(&k(key), key).unwrap());
    }
    for key in (0..30).step_by(2) {
        assert!(tree.remove(&k(key), key).unwrap());
    }
    for key in 0..30 {
        let expected = key % 2 == 1;
        assert_eq!(tree.search(&k(key)).unwrap(), expected, "key {}", key);
        assert_eq!(tree.search_entry(&k(key), key).unwrap(), expected);
    }
    tree.check_invariants().unwrap();
}

/// Deleting everything contracts the tree to empty; it keeps working
/// afterwards.
#[test]
fn test_delete_to_empty_and_reuse() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir.path().join("drain.lat"), 2);

    for key in 0..40 {
        insert(&mut tree, key, key);
    }
    for key in 0..40 {
        assert!(tree.remove(&k(key), key).unwrap(), "key {}", key);
        tree.check_invariants().unwrap();
    }

    assert!(tree.is_empty());
    assert_eq!(tree.depth().unwrap(), 0);
    assert_eq!(tree.leaf_count().unwrap(), 0);
    assert!(!tree.traverse(|_| true).unwrap());

    // Freed pages get reused by subsequent inserts.
    for key in 0..10 {
        insert(&mut tree, key, 1000 + key);
    }
    assert_eq!(collect_entries(&mut tree).len(), 10);
    tree.check_invariants().unwrap();
}

// =========================================================================
// Durability
// =========================================================================

/// Reopening without mutation yields an identical traversal.
#[test]
fn test_reopen_round_trip() {
    init_log();
    let dir = tempdir().unwrap();
    let path = dir.path().join("durable.lat");
    let before;

    {
        let mut tree = open_tree(&path, 4);
        let mut rng = rand::rng();
        for pkey in 0..300 {
            let key = rng.random_range(0..100);
            insert(&mut tree, key, pkey);
        }
        before = collect_entries(&mut tree);
        tree.close().unwrap();
    }

    let mut tree = open_tree(&path, 4);
    assert_eq!(collect_entries(&mut tree), before);
    tree.check_invariants().unwrap();
}

/// Deletions survive a close/reopen cycle too.
#[test]
fn test_reopen_after_deletes() {
    init_log();
    let dir = tempdir().unwrap();
    let path = dir.path().join("durable_deletes.lat");

    {
        let mut tree = open_tree(&path, 2);
        for key in 0..50 {
            insert(&mut tree, key, key);
        }
        for key in (0..50).step_by(3) {
            assert!(tree.remove(&k(key), key).unwrap());
        }
        tree.close().unwrap();
    }

    let mut tree = open_tree(&path, 2);
    for key in 0..50 {
        assert_eq!(tree.search(&k(key)).unwrap(), key % 3 != 0, "key {}", key);
    }
    tree.check_invariants().unwrap();
}

/// A pool far smaller than the tree forces evictions mid-operation;
/// nothing may be lost.
#[test]
fn test_small_pool_evicts_under_load() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = BPlusTree::open(
        dir.path().join("tiny_pool.lat"),
        options(2, 8), // the minimum pool
    )
    .unwrap();

    for pkey in 0..400 {
        insert(&mut tree, pkey % 80, pkey);
    }
    tree.check_invariants().unwrap();

    let entries = collect_entries(&mut tree);
    assert_eq!(entries.len(), 400);
    assert!(entries.windows(2).all(|w| w[0] <= w[1]));
}

// =========================================================================
// remove_all, traversal control, BFS
// =========================================================================

#[test]
fn test_remove_all_reports_each_row() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir.path().join("remove_all.lat"), 2);

    for pkey in 0..20 {
        insert(&mut tree, 5, pkey);
    }
    insert(&mut tree, 1, 100);
    insert(&mut tree, 9, 101);

    let mut freed = Vec::new();
    assert!(tree.remove_all(&k(5), |row| freed.push(row.0)).unwrap());
    assert_eq!(freed, (0..20).collect::<Vec<u32>>());

    assert!(!tree.search(&k(5)).unwrap());
    assert_eq!(collect_entries(&mut tree), vec![(1, 100), (9, 101)]);
    tree.check_invariants().unwrap();

    // Nothing left to remove.
    assert!(!tree.remove_all(&k(5), |_| {}).unwrap());
}

#[test]
fn test_scan_stops_early() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir.path().join("early_stop.lat"), 2);

    for key in 0..30 {
        insert(&mut tree, key, key);
    }

    let mut rows = Vec::new();
    tree.range_scan(Bound::Ge(&k(0)), |row| {
        rows.push(row.0);
        rows.len() < 5
    })
    .unwrap();
    assert_eq!(rows, vec![0, 1, 2, 3, 4]);

    let mut count = 0;
    tree.traverse(|_| {
        count += 1;
        count < 7
    })
    .unwrap();
    assert_eq!(count, 7);
}

#[test]
fn test_bfs_visits_every_row() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir.path().join("bfs.lat"), 2);

    for key in 0..25 {
        insert(&mut tree, key, key);
    }

    let mut rows = Vec::new();
    tree.bfs(|row| {
        rows.push(row.0);
        true
    })
    .unwrap();

    assert_eq!(rows.len(), 25);
    rows.sort_unstable();
    assert_eq!(rows, (0..25).collect::<Vec<u32>>());
}

#[test]
fn test_empty_tree_operations() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = open_tree(&dir.path().join("empty.lat"), 2);

    assert!(tree.is_empty());
    assert!(!tree.search(&k(1)).unwrap());
    assert!(!tree.remove(&k(1), 1).unwrap());
    assert!(!tree.remove_any(&k(1)).unwrap());
    assert!(!tree.traverse(|_| true).unwrap());
    assert!(scan_rows(&mut tree, Bound::Ge(&k(0))).is_empty());
    assert!(scan_rows(&mut tree, Bound::Le(&k(0))).is_empty());
    tree.check_invariants().unwrap();
}

// =========================================================================
// Natural join
// =========================================================================

#[test]
fn test_natural_join_emits_cross_products() {
    init_log();
    let dir = tempdir().unwrap();
    let mut left = open_tree(&dir.path().join("join_left.lat"), 2);
    let mut right = open_tree(&dir.path().join("join_right.lat"), 2);

    // left keys:  1, 2(a=10), 2(a=11), 3, 5
    // right keys: 2(b=20), 2(b=21), 4, 5(b=22)
    left.insert(&k(1), 1, RowId(1)).unwrap();
    left.insert(&k(2), 2, RowId(10)).unwrap();
    left.insert(&k(2), 3, RowId(11)).unwrap();
    left.insert(&k(3), 4, RowId(3)).unwrap();
    left.insert(&k(5), 5, RowId(12)).unwrap();

    right.insert(&k(2), 1, RowId(20)).unwrap();
    right.insert(&k(2), 2, RowId(21)).unwrap();
    right.insert(&k(4), 3, RowId(4)).unwrap();
    right.insert(&k(5), 4, RowId(22)).unwrap();

    let mut pairs = Vec::new();
    left.natural_join(&mut right, |a, b| {
        pairs.push((a.0, b.0));
        true
    })
    .unwrap();

    assert_eq!(
        pairs,
        vec![(10, 20), (10, 21), (11, 20), (11, 21), (12, 22)]
    );
}

#[test]
fn test_natural_join_with_empty_side() {
    init_log();
    let dir = tempdir().unwrap();
    let mut left = open_tree(&dir.path().join("join_empty_l.lat"), 2);
    let mut right = open_tree(&dir.path().join("join_empty_r.lat"), 2);

    insert(&mut left, 1, 1);

    let mut pairs = 0;
    left.natural_join(&mut right, |_, _| {
        pairs += 1;
        true
    })
    .unwrap();
    assert_eq!(pairs, 0);
}

#[test]
fn test_natural_join_rejects_mismatched_trees() {
    init_log();
    let dir = tempdir().unwrap();
    let mut left = open_tree(&dir.path().join("join_mismatch_l.lat"), 2);
    let mut right = BPlusTree::open(
        dir.path().join("join_mismatch_r.lat"),
        TreeOptions {
            branching_factor: 2,
            key_size: 16,
            key_type: KeyType::Text,
            pool_pages: 32,
            fsync_enabled: false,
        },
    )
    .unwrap();

    assert!(left.natural_join(&mut right, |_, _| true).is_err());
}

// =========================================================================
// Alternative key types
// =========================================================================

#[test]
fn test_text_keys_ignore_padding() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = BPlusTree::open(
        dir.path().join("text.lat"),
        TreeOptions {
            branching_factor: 2,
            key_size: 8,
            key_type: KeyType::Text,
            pool_pages: 32,
            fsync_enabled: false,
        },
    )
    .unwrap();

    tree.insert(b"bob\0\0\0\0\0", 1, RowId(1)).unwrap();
    tree.insert(b"alice\0\0\0", 2, RowId(2)).unwrap();
    tree.insert(b"carol\0\0\0", 3, RowId(3)).unwrap();

    // Space padding compares equal to NUL padding.
    assert!(tree.search(b"bob     ").unwrap());

    let mut rows = Vec::new();
    tree.traverse(|row| {
        rows.push(row.0);
        true
    })
    .unwrap();
    assert_eq!(rows, vec![2, 1, 3]); // alice, bob, carol
}

#[test]
fn test_float_keys_order_numerically() {
    init_log();
    let dir = tempdir().unwrap();
    let mut tree = BPlusTree::open(
        dir.path().join("float.lat"),
        TreeOptions {
            branching_factor: 2,
            key_size: 8,
            key_type: KeyType::Float64,
            pool_pages: 32,
            fsync_enabled: false,
        },
    )
    .unwrap();

    for (i, value) in [2.5f64, -1.0, 0.25, 10.0, -3.5].iter().enumerate() {
        tree.insert(&value.to_le_bytes(), i as PKey, RowId(i as u32))
            .unwrap();
    }

    let mut rows = Vec::new();
    tree.traverse(|row| {
        rows.push(row.0);
        true
    })
    .unwrap();
    // -3.5, -1.0, 0.25, 2.5, 10.0
    assert_eq!(rows, vec![4, 1, 2, 0, 3]);
}
