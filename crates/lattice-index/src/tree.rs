//! B+ tree algorithm layer.
//!
//! Pure algorithms over node views obtained from the node manager:
//! search, insert with proactive splitting, delete with proactive
//! borrow/merge, leaf-chain range scans, traversals, and a two-tree
//! natural-join walk.
//!
//! Both mutating operations make a single root-to-leaf pass. Insert
//! splits any full node on the way down, so the leaf insertion never
//! cascades back up; remove repairs any minimum-occupancy node on the way
//! down, so the leaf deletion never underflows. The tree keeps page
//! numbers, never node handles, across calls that may allocate: a handle
//! whose page gets evicted would dangle, a page number is simply fetched
//! again.

use crate::manager::NodeManager;
use crate::node::NodeRef;
use bytes::Bytes;
use lattice_common::config::TreeOptions;
use lattice_common::page::PageNo;
use lattice_common::types::{compare_composite, KeyType, PKey, RowId, PKEY_MAX, PKEY_MIN};
use lattice_common::{LatticeError, Result};
use log::debug;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::path::Path;

/// Range-scan bound over the user key.
///
/// `Le` and `Lt` iterate in descending key order, the others ascending.
#[derive(Debug, Clone, Copy)]
pub enum Bound<'a> {
    /// Every entry with key >= the bound.
    Ge(&'a [u8]),
    /// Every entry with key > the bound.
    Gt(&'a [u8]),
    /// Every entry with key <= the bound.
    Le(&'a [u8]),
    /// Every entry with key < the bound.
    Lt(&'a [u8]),
    /// Every entry with key equal to the bound.
    Eq(&'a [u8]),
}

/// A position within a leaf: the leaf page and an entry index.
///
/// `index == entry_count` means "past the last entry of this leaf".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    page: PageNo,
    index: usize,
}

/// Entries spilled out of a node being split: the median that moves up
/// and the right half that moves into the new sibling.
struct SplitSpill {
    is_leaf: bool,
    median_key: Bytes,
    median_pkey: PKey,
    keys: Vec<Bytes>,
    pkeys: Vec<PKey>,
    /// Raw child slots: B−1 rows for a leaf, B child pages for an
    /// internal node.
    slots: Vec<u32>,
    right: PageNo,
}

/// A persistent B+ tree index mapping composite `(key, pkey)` pairs to
/// row locators.
pub struct BPlusTree {
    manager: NodeManager,
    key_type: KeyType,
}

impl BPlusTree {
    /// Opens an index file, creating it if necessary.
    pub fn open(path: impl AsRef<Path>, opts: TreeOptions) -> Result<Self> {
        let manager = NodeManager::open(path, &opts)?;
        Ok(Self {
            manager,
            key_type: opts.key_type,
        })
    }

    /// The branching factor B.
    pub fn branching_factor(&self) -> usize {
        self.manager.branching_factor()
    }

    /// Key size in bytes.
    pub fn key_size(&self) -> usize {
        self.manager.key_size()
    }

    /// The key comparator.
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.manager.root().is_none()
    }

    // =====================================================================
    // Insert
    // =====================================================================

    /// Inserts an entry. Duplicate user keys are permitted; they are
    /// ordered by `pkey`.
    pub fn insert(&mut self, key: &[u8], pkey: PKey, row: RowId) -> Result<bool> {
        self.check_key(key)?;
        let key_type = self.key_type;
        let max = self.manager.layout().max_entries();

        if self.manager.root().is_none() {
            let leaf = self.manager.alloc_node(true)?;
            {
                let mut node = self.manager.node_mut(leaf)?;
                node.set_entry(0, key, pkey);
                node.set_row(0, row);
                node.set_entry_count(1);
            }
            self.manager.set_root(leaf)?;
            debug!("created root leaf {}", leaf);
            return Ok(true);
        }

        let root = self.manager.root();
        if self.manager.node(root)?.entry_count() == max {
            self.split_root()?;
        }

        // Single pass down; every full node on the path is split before
        // we descend into it.
        let mut current = self.manager.root();
        loop {
            self.manager.pin(current);
            let (is_leaf, idx, child) = {
                let node = self.manager.node(current)?;
                if node.is_leaf() {
                    (true, 0, PageNo::NONE)
                } else {
                    let idx = lower_bound(&node, key_type, key, pkey);
                    (false, idx, node.child(idx))
                }
            };
            if is_leaf {
                self.manager.unpin(current);
                break;
            }

            let child_size = self.manager.node(child)?.entry_count();
            let next = if child_size == max {
                self.split_child(current, idx)?;
                // Pick a half by comparing against the promoted median.
                let node = self.manager.node(current)?;
                if compare_composite(key_type, key, pkey, node.key(idx), node.pkey(idx))
                    != Ordering::Greater
                {
                    node.child(idx)
                } else {
                    node.child(idx + 1)
                }
            } else {
                child
            };
            self.manager.unpin(current);
            current = next;
        }

        // The leaf has room: open a slot and write the entry.
        let mut node = self.manager.node_mut(current)?;
        let size = node.entry_count();
        let idx = lower_bound(&node.as_view(), key_type, key, pkey);
        node.shift_entries_right(idx, size);
        node.shift_children_right(idx, size);
        node.set_entry(idx, key, pkey);
        node.set_row(idx, row);
        node.set_entry_count(size + 1);
        Ok(true)
    }

    /// Splits a full root, growing the tree by one level.
    fn split_root(&mut self) -> Result<()> {
        let old_root = self.manager.root();
        let b = self.manager.branching_factor();
        let spill = self.read_split_spill(old_root)?;

        self.manager.pin(old_root);
        let result = self.split_root_pinned(old_root, b, &spill);
        self.manager.unpin(old_root);
        result
    }

    fn split_root_pinned(&mut self, old_root: PageNo, b: usize, spill: &SplitSpill) -> Result<()> {
        // Allocate both pages before linking anything, so an allocation
        // failure leaves the tree untouched.
        let new_root = self.manager.alloc_node(false)?;
        let sibling = self.manager.alloc_node(spill.is_leaf)?;

        self.write_sibling_from_spill(sibling, spill, old_root)?;

        {
            let mut node = self.manager.node_mut(old_root)?;
            // A split leaf retains the promoted median; an internal node
            // gives it up.
            node.set_entry_count(if spill.is_leaf { b } else { b - 1 });
            if spill.is_leaf {
                node.set_right_sibling(sibling);
            }
        }

        {
            let mut node = self.manager.node_mut(new_root)?;
            node.set_entry(0, &spill.median_key, spill.median_pkey);
            node.set_child(0, old_root);
            node.set_child(1, sibling);
            node.set_entry_count(1);
        }

        self.manager.set_root(new_root)?;
        debug!("split root {} into {} + {}", old_root, new_root, sibling);
        Ok(())
    }

    /// Splits the full child at `parent.children[idx]`, promoting its
    /// median into the parent at `idx`.
    fn split_child(&mut self, parent: PageNo, idx: usize) -> Result<()> {
        let b = self.manager.branching_factor();
        let child = self.manager.node(parent)?.child(idx);
        let spill = self.read_split_spill(child)?;

        self.manager.pin(parent);
        self.manager.pin(child);
        let result = self.split_child_pinned(parent, idx, child, b, &spill);
        self.manager.unpin(child);
        self.manager.unpin(parent);
        result
    }

    fn split_child_pinned(
        &mut self,
        parent: PageNo,
        idx: usize,
        child: PageNo,
        b: usize,
        spill: &SplitSpill,
    ) -> Result<()> {
        let sibling = self.manager.alloc_node(spill.is_leaf)?;

        self.write_sibling_from_spill(sibling, spill, child)?;

        {
            let mut node = self.manager.node_mut(child)?;
            node.set_entry_count(if spill.is_leaf { b } else { b - 1 });
            if spill.is_leaf {
                node.set_right_sibling(sibling);
            }
        }
        if spill.is_leaf && spill.right.is_some() {
            // Splice the sibling into the leaf chain.
            self.manager.node_mut(spill.right)?.set_left_sibling(sibling);
        }

        {
            let mut node = self.manager.node_mut(parent)?;
            let parent_size = node.entry_count();
            node.shift_entries_right(idx, parent_size);
            node.shift_children_right(idx + 1, parent_size + 1);
            node.set_entry(idx, &spill.median_key, spill.median_pkey);
            node.set_child(idx + 1, sibling);
            node.set_entry_count(parent_size + 1);
        }

        debug!("split {} into sibling {} under {}", child, sibling, parent);
        Ok(())
    }

    /// Copies the median and right half out of a full node.
    fn read_split_spill(&mut self, page_no: PageNo) -> Result<SplitSpill> {
        let b = self.manager.branching_factor();
        let max = 2 * b - 1;

        let node = self.manager.node(page_no)?;
        let is_leaf = node.is_leaf();

        let mut keys = Vec::with_capacity(b - 1);
        let mut pkeys = Vec::with_capacity(b - 1);
        for i in b..max {
            keys.push(Bytes::copy_from_slice(node.key(i)));
            pkeys.push(node.pkey(i));
        }
        let slots = if is_leaf {
            (b..max).map(|i| node.row(i).0).collect()
        } else {
            (b..=max).map(|i| node.child(i).0).collect()
        };

        Ok(SplitSpill {
            is_leaf,
            median_key: Bytes::copy_from_slice(node.key(b - 1)),
            median_pkey: node.pkey(b - 1),
            keys,
            pkeys,
            slots,
            right: node.right_sibling(),
        })
    }

    /// Fills a freshly allocated sibling with a spill's right half.
    fn write_sibling_from_spill(
        &mut self,
        sibling: PageNo,
        spill: &SplitSpill,
        chain_left: PageNo,
    ) -> Result<()> {
        let mut node = self.manager.node_mut(sibling)?;
        for (i, key) in spill.keys.iter().enumerate() {
            node.set_entry(i, key, spill.pkeys[i]);
        }
        if spill.is_leaf {
            for (i, &slot) in spill.slots.iter().enumerate() {
                node.set_row(i, RowId(slot));
            }
            node.set_left_sibling(chain_left);
            node.set_right_sibling(spill.right);
        } else {
            for (i, &slot) in spill.slots.iter().enumerate() {
                node.set_child(i, PageNo(slot));
            }
        }
        node.set_entry_count(spill.keys.len());
        Ok(())
    }

    // =====================================================================
    // Remove
    // =====================================================================

    /// Removes the entry matching `(key, pkey)` exactly. Returns false if
    /// no such entry exists.
    ///
    /// An exact composite probe always descends into the subtree holding
    /// its target, so no end-of-leaf adjustment is needed here.
    pub fn remove(&mut self, key: &[u8], pkey: PKey) -> Result<bool> {
        self.check_key(key)?;
        if self.manager.root().is_none() {
            return Ok(false);
        }

        let key_type = self.key_type;
        let min = self.manager.layout().min_entries();
        let probe_pkey = pkey;

        // Single pass down; every minimum-occupancy node on the path is
        // repaired before we descend into it.
        let mut current = self.manager.root();
        loop {
            self.manager.pin(current);
            let (is_leaf, idx, child, parent_size) = {
                let node = self.manager.node(current)?;
                if node.is_leaf() {
                    (true, 0, PageNo::NONE, 0)
                } else {
                    let idx = lower_bound(&node, key_type, key, probe_pkey);
                    (false, idx, node.child(idx), node.entry_count())
                }
            };
            if is_leaf {
                self.manager.unpin(current);
                break;
            }

            let child_size = self.manager.node(child)?.entry_count();
            if child_size > min {
                self.manager.unpin(current);
                current = child;
                continue;
            }

            let (left, right) = {
                let node = self.manager.node(current)?;
                (
                    if idx > 0 { Some(node.child(idx - 1)) } else { None },
                    if idx < parent_size {
                        Some(node.child(idx + 1))
                    } else {
                        None
                    },
                )
            };
            let left_size = match left {
                Some(page) => self.manager.node(page)?.entry_count(),
                None => 0,
            };
            let right_size = match right {
                Some(page) => self.manager.node(page)?.entry_count(),
                None => 0,
            };

            let next = if left.is_some() && left_size > min {
                self.borrow_from_left(current, idx)?;
                child
            } else if right.is_some() && right_size > min {
                self.borrow_from_right(current, idx)?;
                child
            } else {
                self.merge_with_sibling(current, idx)?
            };
            self.manager.unpin(current);
            current = next;
        }

        // The leaf has more than the minimum (or is the root): a plain
        // removal cannot underflow it.
        let found = {
            let node = self.manager.node(current)?;
            let idx = lower_bound(&node, key_type, key, probe_pkey);
            if idx < node.entry_count()
                && key_type.compare(key, node.key(idx)) == Ordering::Equal
                && node.pkey(idx) == pkey
            {
                Some(idx)
            } else {
                None
            }
        };

        match found {
            Some(idx) => {
                self.delete_at_leaf(current, idx)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes the first entry with the given user key, whatever its
    /// pkey. Returns false if the key is absent.
    pub fn remove_any(&mut self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        let key_type = self.key_type;

        // Resolve the concrete pkey of the first duplicate, then remove
        // by exact composite key so the descent repairs the right path.
        let target = match self.seek_forward(key, PKEY_MIN)? {
            None => None,
            Some(cursor) => {
                let node = self.manager.node(cursor.page)?;
                if key_type.compare(key, node.key(cursor.index)) == Ordering::Equal {
                    Some(node.pkey(cursor.index))
                } else {
                    None
                }
            }
        };
        match target {
            Some(pkey) => self.remove(key, pkey),
            None => Ok(false),
        }
    }

    /// Removes every entry with the given user key, walking the leaf
    /// chain from the first match and reporting each freed row. Returns
    /// true if at least one entry was removed.
    pub fn remove_all<F>(&mut self, key: &[u8], mut on_row: F) -> Result<bool>
    where
        F: FnMut(RowId),
    {
        self.check_key(key)?;
        let key_type = self.key_type;
        let mut removed = false;

        loop {
            let target = match self.seek_forward(key, PKEY_MIN)? {
                None => None,
                Some(cursor) => {
                    let node = self.manager.node(cursor.page)?;
                    if key_type.compare(key, node.key(cursor.index)) == Ordering::Equal {
                        Some((node.pkey(cursor.index), node.row(cursor.index)))
                    } else {
                        None
                    }
                }
            };
            let Some((pkey, row)) = target else { break };

            if !self.remove(key, pkey)? {
                return Err(LatticeError::InvariantViolated(
                    "entry disappeared during remove_all".to_string(),
                ));
            }
            on_row(row);
            removed = true;
        }
        Ok(removed)
    }

    /// Removes the leaf entry at `idx`, contracting the tree to empty if
    /// this was the last entry.
    fn delete_at_leaf(&mut self, leaf: PageNo, idx: usize) -> Result<()> {
        let size = self.manager.node(leaf)?.entry_count();

        if leaf == self.manager.root() && size == 1 {
            // Last entry anywhere: free the root and clear the
            // superblock pointer. The next insert starts from scratch.
            self.manager.set_root(PageNo::NONE)?;
            self.manager.free_node(leaf)?;
            debug!("removed last entry, tree is empty");
            return Ok(());
        }

        let mut node = self.manager.node_mut(leaf)?;
        node.shift_entries_left(idx, size);
        node.shift_children_left(idx, size);
        node.set_entry_count(size - 1);
        Ok(())
    }

    /// Rotates one entry from the left sibling through the parent
    /// separator into `parent.children[idx]`.
    fn borrow_from_left(&mut self, parent: PageNo, idx: usize) -> Result<()> {
        let (child, left) = {
            let node = self.manager.node(parent)?;
            (node.child(idx), node.child(idx - 1))
        };
        let (is_leaf, child_size) = {
            let node = self.manager.node(child)?;
            (node.is_leaf(), node.entry_count())
        };
        let left_size = self.manager.node(left)?.entry_count();

        if is_leaf {
            // The sibling's last entry moves to the child's front; the
            // sibling's new last entry becomes the separator.
            let (borrowed_key, borrowed_pkey, borrowed_row, sep_key, sep_pkey) = {
                let node = self.manager.node(left)?;
                (
                    Bytes::copy_from_slice(node.key(left_size - 1)),
                    node.pkey(left_size - 1),
                    node.row(left_size - 1),
                    Bytes::copy_from_slice(node.key(left_size - 2)),
                    node.pkey(left_size - 2),
                )
            };
            {
                let mut node = self.manager.node_mut(child)?;
                node.shift_entries_right(0, child_size);
                node.shift_children_right(0, child_size);
                node.set_entry(0, &borrowed_key, borrowed_pkey);
                node.set_row(0, borrowed_row);
                node.set_entry_count(child_size + 1);
            }
            self.manager
                .node_mut(parent)?
                .set_entry(idx - 1, &sep_key, sep_pkey);
        } else {
            // The separator rotates down, the sibling's last entry
            // rotates up, and the sibling's last child pointer moves.
            let (sep_key, sep_pkey) = {
                let node = self.manager.node(parent)?;
                (Bytes::copy_from_slice(node.key(idx - 1)), node.pkey(idx - 1))
            };
            let (borrowed_key, borrowed_pkey, borrowed_child) = {
                let node = self.manager.node(left)?;
                (
                    Bytes::copy_from_slice(node.key(left_size - 1)),
                    node.pkey(left_size - 1),
                    node.child(left_size),
                )
            };
            {
                let mut node = self.manager.node_mut(child)?;
                node.shift_entries_right(0, child_size);
                node.shift_children_right(0, child_size + 1);
                node.set_entry(0, &sep_key, sep_pkey);
                node.set_child(0, borrowed_child);
                node.set_entry_count(child_size + 1);
            }
            self.manager
                .node_mut(parent)?
                .set_entry(idx - 1, &borrowed_key, borrowed_pkey);
        }
        self.manager.node_mut(left)?.set_entry_count(left_size - 1);

        debug!("borrowed from left sibling into {}", child);
        Ok(())
    }

    /// Mirror image of `borrow_from_left` for the right sibling.
    fn borrow_from_right(&mut self, parent: PageNo, idx: usize) -> Result<()> {
        let (child, right) = {
            let node = self.manager.node(parent)?;
            (node.child(idx), node.child(idx + 1))
        };
        let (is_leaf, child_size) = {
            let node = self.manager.node(child)?;
            (node.is_leaf(), node.entry_count())
        };
        let right_size = self.manager.node(right)?.entry_count();

        if is_leaf {
            // The sibling's first entry moves to the child's back and
            // becomes the separator.
            let (borrowed_key, borrowed_pkey, borrowed_row) = {
                let node = self.manager.node(right)?;
                (
                    Bytes::copy_from_slice(node.key(0)),
                    node.pkey(0),
                    node.row(0),
                )
            };
            {
                let mut node = self.manager.node_mut(child)?;
                node.set_entry(child_size, &borrowed_key, borrowed_pkey);
                node.set_row(child_size, borrowed_row);
                node.set_entry_count(child_size + 1);
            }
            self.manager
                .node_mut(parent)?
                .set_entry(idx, &borrowed_key, borrowed_pkey);
            {
                let mut node = self.manager.node_mut(right)?;
                node.shift_entries_left(0, right_size);
                node.shift_children_left(0, right_size);
                node.set_entry_count(right_size - 1);
            }
        } else {
            let (sep_key, sep_pkey) = {
                let node = self.manager.node(parent)?;
                (Bytes::copy_from_slice(node.key(idx)), node.pkey(idx))
            };
            let (borrowed_key, borrowed_pkey, borrowed_child) = {
                let node = self.manager.node(right)?;
                (
                    Bytes::copy_from_slice(node.key(0)),
                    node.pkey(0),
                    node.child(0),
                )
            };
            {
                let mut node = self.manager.node_mut(child)?;
                node.set_entry(child_size, &sep_key, sep_pkey);
                node.set_child(child_size + 1, borrowed_child);
                node.set_entry_count(child_size + 1);
            }
            self.manager
                .node_mut(parent)?
                .set_entry(idx, &borrowed_key, borrowed_pkey);
            {
                let mut node = self.manager.node_mut(right)?;
                node.shift_entries_left(0, right_size);
                node.shift_children_left(0, right_size + 1);
                node.set_entry_count(right_size - 1);
            }
        }

        debug!("borrowed from right sibling into {}", child);
        Ok(())
    }

    /// Merges `parent.children[idx]` with a sibling, both at minimum
    /// occupancy. Returns the surviving node, which becomes the new root
    /// if the merge empties a root parent.
    fn merge_with_sibling(&mut self, parent: PageNo, idx: usize) -> Result<PageNo> {
        let parent_size = self.manager.node(parent)?.entry_count();

        // Prefer the left sibling; for the leftmost child absorb the
        // right one instead.
        let (survivor, absorbed, sep_idx) = {
            let node = self.manager.node(parent)?;
            if idx > 0 {
                (node.child(idx - 1), node.child(idx), idx - 1)
            } else {
                (node.child(idx), node.child(idx + 1), idx)
            }
        };
        let (sep_key, sep_pkey) = {
            let node = self.manager.node(parent)?;
            (
                Bytes::copy_from_slice(node.key(sep_idx)),
                node.pkey(sep_idx),
            )
        };

        // Copy the absorbed node out before rewriting anything.
        let (is_leaf, absorbed_size, keys, pkeys, slots, absorbed_right) = {
            let node = self.manager.node(absorbed)?;
            let size = node.entry_count();
            let mut keys = Vec::with_capacity(size);
            let mut pkeys = Vec::with_capacity(size);
            for i in 0..size {
                keys.push(Bytes::copy_from_slice(node.key(i)));
                pkeys.push(node.pkey(i));
            }
            let slots: Vec<u32> = if node.is_leaf() {
                (0..size).map(|i| node.row(i).0).collect()
            } else {
                (0..=size).map(|i| node.child(i).0).collect()
            };
            (
                node.is_leaf(),
                size,
                keys,
                pkeys,
                slots,
                node.right_sibling(),
            )
        };
        let survivor_size = self.manager.node(survivor)?.entry_count();

        if is_leaf {
            {
                let mut node = self.manager.node_mut(survivor)?;
                for j in 0..absorbed_size {
                    node.set_entry(survivor_size + j, &keys[j], pkeys[j]);
                    node.set_row(survivor_size + j, RowId(slots[j]));
                }
                node.set_entry_count(survivor_size + absorbed_size);
                node.set_right_sibling(absorbed_right);
            }
            if absorbed_right.is_some() {
                self.manager
                    .node_mut(absorbed_right)?
                    .set_left_sibling(survivor);
            }
        } else {
            // The separator comes down between the two halves.
            let mut node = self.manager.node_mut(survivor)?;
            node.set_entry(survivor_size, &sep_key, sep_pkey);
            node.set_child(survivor_size + 1, PageNo(slots[0]));
            for j in 0..absorbed_size {
                node.set_entry(survivor_size + 1 + j, &keys[j], pkeys[j]);
                node.set_child(survivor_size + 2 + j, PageNo(slots[j + 1]));
            }
            node.set_entry_count(survivor_size + 1 + absorbed_size);
        }

        {
            let mut node = self.manager.node_mut(parent)?;
            node.shift_entries_left(sep_idx, parent_size);
            node.shift_children_left(sep_idx + 1, parent_size + 1);
            node.set_entry_count(parent_size - 1);
        }
        self.manager.free_node(absorbed)?;
        debug!("merged {} into {}", absorbed, survivor);

        if parent_size - 1 == 0 {
            if parent != self.manager.root() {
                return Err(LatticeError::InvariantViolated(
                    "non-root internal node emptied by a merge".to_string(),
                ));
            }
            self.manager.set_root(survivor)?;
            self.manager.free_node(parent)?;
            debug!("merge collapsed the root into {}", survivor);
        }

        Ok(survivor)
    }

    // =====================================================================
    // Search and range scans
    // =====================================================================

    /// Returns true if any entry carries the given user key.
    ///
    /// Deletions can leave a parent separator equal on key to entries
    /// that now live one leaf to the right, so an end-of-leaf position
    /// steps to the right sibling before deciding (`seek_forward`).
    pub fn search(&mut self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        let key_type = self.key_type;
        let Some(cursor) = self.seek_forward(key, PKEY_MIN)? else {
            return Ok(false);
        };
        let node = self.manager.node(cursor.page)?;
        Ok(key_type.compare(key, node.key(cursor.index)) == Ordering::Equal)
    }

    /// Returns true if the exact `(key, pkey)` entry exists.
    pub fn search_entry(&mut self, key: &[u8], pkey: PKey) -> Result<bool> {
        self.check_key(key)?;
        let key_type = self.key_type;
        let Some(cursor) = self.seek(key, pkey)? else {
            return Ok(false);
        };
        let node = self.manager.node(cursor.page)?;
        Ok(cursor.index < node.entry_count()
            && key_type.compare(key, node.key(cursor.index)) == Ordering::Equal
            && node.pkey(cursor.index) == pkey)
    }

    /// Emits row locators within the bound. The callback returns false to
    /// stop the scan early.
    pub fn range_scan<F>(&mut self, bound: Bound<'_>, mut on_row: F) -> Result<()>
    where
        F: FnMut(RowId) -> bool,
    {
        match bound {
            Bound::Ge(key) => {
                self.check_key(key)?;
                let start = self.seek_forward(key, PKEY_MIN)?;
                self.iterate_right(start, &mut on_row)
            }
            Bound::Gt(key) => {
                self.check_key(key)?;
                let start = self.seek_forward(key, PKEY_MAX)?;
                self.iterate_right(start, &mut on_row)
            }
            Bound::Le(key) => {
                self.check_key(key)?;
                let start = self.seek_backward(key, PKEY_MAX)?;
                self.iterate_left(start, &mut on_row)
            }
            Bound::Lt(key) => {
                self.check_key(key)?;
                let start = self.seek_backward(key, PKEY_MIN)?;
                self.iterate_left(start, &mut on_row)
            }
            Bound::Eq(key) => {
                self.check_key(key)?;
                let start = self.seek_forward(key, PKEY_MIN)?;
                self.iterate_right_while_key(start, key, &mut on_row)
            }
        }
    }

    /// Emits the rows of every entry with the given user key, in pkey
    /// order.
    pub fn traverse_with_key<F>(&mut self, key: &[u8], mut on_row: F) -> Result<()>
    where
        F: FnMut(RowId),
    {
        self.range_scan(Bound::Eq(key), |row| {
            on_row(row);
            true
        })
    }

    /// Descends to the leaf position of the first entry `>= (key, pkey)`.
    /// The returned index may equal the leaf's entry count.
    fn seek(&mut self, key: &[u8], pkey: PKey) -> Result<Option<Cursor>> {
        let mut current = self.manager.root();
        if current.is_none() {
            return Ok(None);
        }
        let key_type = self.key_type;
        loop {
            let node = self.manager.node(current)?;
            let idx = lower_bound(&node, key_type, key, pkey);
            if node.is_leaf() {
                return Ok(Some(Cursor {
                    page: current,
                    index: idx,
                }));
            }
            current = node.child(idx);
        }
    }

    /// `seek` for ascending scans: an end-of-leaf position steps to the
    /// right sibling's first entry.
    fn seek_forward(&mut self, key: &[u8], pkey: PKey) -> Result<Option<Cursor>> {
        let Some(cursor) = self.seek(key, pkey)? else {
            return Ok(None);
        };
        let (size, right) = {
            let node = self.manager.node(cursor.page)?;
            (node.entry_count(), node.right_sibling())
        };
        if cursor.index < size {
            return Ok(Some(cursor));
        }
        if right.is_none() {
            return Ok(None);
        }
        Ok(Some(Cursor {
            page: right,
            index: 0,
        }))
    }

    /// `seek` for descending scans: positions on the last entry below the
    /// probe, crossing to the left sibling when the boundary falls on a
    /// leaf edge.
    fn seek_backward(&mut self, key: &[u8], pkey: PKey) -> Result<Option<Cursor>> {
        let Some(cursor) = self.seek(key, pkey)? else {
            return Ok(None);
        };
        let size = self.manager.node(cursor.page)?.entry_count();
        if cursor.index >= size {
            // Every entry in this leaf is below the probe.
            return Ok(Some(Cursor {
                page: cursor.page,
                index: size - 1,
            }));
        }
        self.step_left(cursor)
    }

    /// Moves a cursor one entry right, following the leaf chain.
    fn step_right(&mut self, cursor: Cursor) -> Result<Option<Cursor>> {
        let node = self.manager.node(cursor.page)?;
        if cursor.index + 1 < node.entry_count() {
            return Ok(Some(Cursor {
                page: cursor.page,
                index: cursor.index + 1,
            }));
        }
        let right = node.right_sibling();
        if right.is_none() {
            return Ok(None);
        }
        Ok(Some(Cursor {
            page: right,
            index: 0,
        }))
    }

    /// Moves a cursor one entry left, following the leaf chain.
    fn step_left(&mut self, cursor: Cursor) -> Result<Option<Cursor>> {
        if cursor.index > 0 {
            return Ok(Some(Cursor {
                page: cursor.page,
                index: cursor.index - 1,
            }));
        }
        let left = self.manager.node(cursor.page)?.left_sibling();
        if left.is_none() {
            return Ok(None);
        }
        let size = self.manager.node(left)?.entry_count();
        Ok(Some(Cursor {
            page: left,
            index: size - 1,
        }))
    }

    fn iterate_right<F>(&mut self, start: Option<Cursor>, on_row: &mut F) -> Result<()>
    where
        F: FnMut(RowId) -> bool,
    {
        let Some(mut cursor) = start else {
            return Ok(());
        };
        loop {
            let right = {
                let node = self.manager.node(cursor.page)?;
                for i in cursor.index..node.entry_count() {
                    if !on_row(node.row(i)) {
                        return Ok(());
                    }
                }
                node.right_sibling()
            };
            if right.is_none() {
                return Ok(());
            }
            cursor = Cursor {
                page: right,
                index: 0,
            };
        }
    }

    fn iterate_left<F>(&mut self, start: Option<Cursor>, on_row: &mut F) -> Result<()>
    where
        F: FnMut(RowId) -> bool,
    {
        let Some(mut cursor) = start else {
            return Ok(());
        };
        loop {
            let left = {
                let node = self.manager.node(cursor.page)?;
                for i in (0..=cursor.index).rev() {
                    if !on_row(node.row(i)) {
                        return Ok(());
                    }
                }
                node.left_sibling()
            };
            if left.is_none() {
                return Ok(());
            }
            let size = self.manager.node(left)?.entry_count();
            cursor = Cursor {
                page: left,
                index: size - 1,
            };
        }
    }

    fn iterate_right_while_key<F>(
        &mut self,
        start: Option<Cursor>,
        key: &[u8],
        on_row: &mut F,
    ) -> Result<()>
    where
        F: FnMut(RowId) -> bool,
    {
        let key_type = self.key_type;
        let Some(mut cursor) = start else {
            return Ok(());
        };
        loop {
            let right = {
                let node = self.manager.node(cursor.page)?;
                for i in cursor.index..node.entry_count() {
                    if key_type.compare(key, node.key(i)) != Ordering::Equal {
                        return Ok(());
                    }
                    if !on_row(node.row(i)) {
                        return Ok(());
                    }
                }
                node.right_sibling()
            };
            if right.is_none() {
                return Ok(());
            }
            cursor = Cursor {
                page: right,
                index: 0,
            };
        }
    }

    // =====================================================================
    // Traversals
    // =====================================================================

    /// Emits every row in ascending composite-key order. Returns false if
    /// the tree is empty.
    pub fn traverse<F>(&mut self, mut on_row: F) -> Result<bool>
    where
        F: FnMut(RowId) -> bool,
    {
        match self.leftmost_leaf()? {
            Some(leaf) => {
                self.iterate_right(
                    Some(Cursor {
                        page: leaf,
                        index: 0,
                    }),
                    &mut on_row,
                )?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Diagnostic traversal exposing the full composite key of every
    /// entry, in ascending order.
    pub fn traverse_entries<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], PKey, RowId) -> bool,
    {
        let Some(mut page) = self.leftmost_leaf()? else {
            return Ok(());
        };
        loop {
            let right = {
                let node = self.manager.node(page)?;
                for i in 0..node.entry_count() {
                    if !f(node.key(i), node.pkey(i), node.row(i)) {
                        return Ok(());
                    }
                }
                node.right_sibling()
            };
            if right.is_none() {
                return Ok(());
            }
            page = right;
        }
    }

    /// Emits rows level by level from the root down.
    pub fn bfs<F>(&mut self, mut on_row: F) -> Result<()>
    where
        F: FnMut(RowId) -> bool,
    {
        let root = self.manager.root();
        if root.is_none() {
            return Ok(());
        }
        let mut queue = VecDeque::from([root]);
        while let Some(page) = queue.pop_front() {
            let node = self.manager.node(page)?;
            let size = node.entry_count();
            if node.is_leaf() {
                for i in 0..size {
                    if !on_row(node.row(i)) {
                        return Ok(());
                    }
                }
            } else {
                for i in 0..=size {
                    queue.push_back(node.child(i));
                }
            }
        }
        Ok(())
    }

    /// Renders a level-order debug dump, one node per line in the form
    /// `size# key(pkey) ...`.
    pub fn dump(&mut self) -> Result<String> {
        use std::fmt::Write;

        let mut out = String::new();
        let root = self.manager.root();
        if root.is_none() {
            out.push_str("(empty)\n");
            return Ok(out);
        }
        let key_type = self.key_type;

        let mut queue = VecDeque::from([root]);
        while let Some(page) = queue.pop_front() {
            let node = self.manager.node(page)?;
            let size = node.entry_count();
            let _ = write!(out, "{}#", size);
            for i in 0..size {
                let _ = write!(
                    out,
                    " {}({})",
                    format_key(key_type, node.key(i)),
                    node.pkey(i)
                );
            }
            out.push('\n');
            if !node.is_leaf() {
                for i in 0..=size {
                    queue.push_back(node.child(i));
                }
            }
        }
        Ok(out)
    }

    /// Number of levels, 0 for an empty tree.
    pub fn depth(&mut self) -> Result<usize> {
        let mut current = self.manager.root();
        if current.is_none() {
            return Ok(0);
        }
        let mut depth = 1;
        loop {
            let node = self.manager.node(current)?;
            if node.is_leaf() {
                return Ok(depth);
            }
            current = node.child(0);
            depth += 1;
        }
    }

    /// Number of leaves on the leaf chain.
    pub fn leaf_count(&mut self) -> Result<usize> {
        let Some(mut page) = self.leftmost_leaf()? else {
            return Ok(0);
        };
        let mut count = 1;
        loop {
            let right = self.manager.node(page)?.right_sibling();
            if right.is_none() {
                return Ok(count);
            }
            count += 1;
            page = right;
        }
    }

    fn leftmost_leaf(&mut self) -> Result<Option<PageNo>> {
        let mut current = self.manager.root();
        if current.is_none() {
            return Ok(None);
        }
        loop {
            let node = self.manager.node(current)?;
            if node.is_leaf() {
                return Ok(Some(current));
            }
            current = node.child(0);
        }
    }

    // =====================================================================
    // Natural join
    // =====================================================================

    /// Joins two trees indexed on the same key type by a coordinated
    /// leaf-chain walk: the side with the smaller current key advances;
    /// equal-key runs emit their cross product. The callback returns
    /// false to stop the walk.
    pub fn natural_join<F>(&mut self, other: &mut BPlusTree, mut on_pair: F) -> Result<()>
    where
        F: FnMut(RowId, RowId) -> bool,
    {
        if self.key_type != other.key_type || self.manager.key_size() != other.manager.key_size()
        {
            return Err(LatticeError::InvalidConfig(
                "natural join requires identical key types and sizes".to_string(),
            ));
        }
        let key_type = self.key_type;

        let mut a = self.leftmost_leaf()?.map(|page| Cursor { page, index: 0 });
        let mut b = other.leftmost_leaf()?.map(|page| Cursor { page, index: 0 });

        while let (Some(cursor_a), Some(cursor_b)) = (a, b) {
            let key_a = self.read_key(cursor_a)?;
            let key_b = other.read_key(cursor_b)?;
            match key_type.compare(&key_a, &key_b) {
                Ordering::Less => a = self.step_right(cursor_a)?,
                Ordering::Greater => b = other.step_right(cursor_b)?,
                Ordering::Equal => {
                    let (rows_a, next_a) = self.collect_equal_run(cursor_a, &key_a)?;
                    let (rows_b, next_b) = other.collect_equal_run(cursor_b, &key_b)?;
                    for &row_a in &rows_a {
                        for &row_b in &rows_b {
                            if !on_pair(row_a, row_b) {
                                return Ok(());
                            }
                        }
                    }
                    a = next_a;
                    b = next_b;
                }
            }
        }
        Ok(())
    }

    fn read_key(&mut self, cursor: Cursor) -> Result<Bytes> {
        let node = self.manager.node(cursor.page)?;
        Ok(Bytes::copy_from_slice(node.key(cursor.index)))
    }

    /// Collects the rows of the equal-key run starting at `start` and
    /// returns the position just past it.
    fn collect_equal_run(&mut self, start: Cursor, key: &[u8]) -> Result<(Vec<RowId>, Option<Cursor>)> {
        let key_type = self.key_type;
        let mut rows = Vec::new();
        let mut cursor = start;
        loop {
            let row = {
                let node = self.manager.node(cursor.page)?;
                if key_type.compare(key, node.key(cursor.index)) != Ordering::Equal {
                    return Ok((rows, Some(cursor)));
                }
                node.row(cursor.index)
            };
            rows.push(row);
            match self.step_right(cursor)? {
                Some(next) => cursor = next,
                None => return Ok((rows, None)),
            }
        }
    }

    // =====================================================================
    // Maintenance
    // =====================================================================

    /// Walks the whole tree verifying the structural invariants:
    /// occupancy bounds, in-node ordering, child pointers, and the
    /// doubly linked leaf chain.
    pub fn check_invariants(&mut self) -> Result<()> {
        let root = self.manager.root();
        if root.is_none() {
            return Ok(());
        }
        let key_type = self.key_type;
        let max = self.manager.layout().max_entries();
        let min = self.manager.layout().min_entries();

        let mut bfs_leaves = 0usize;
        let mut queue = VecDeque::from([root]);
        while let Some(page) = queue.pop_front() {
            let node = self.manager.node(page)?;
            let size = node.entry_count();
            let is_root = page == root;

            if size > max || size < 1 || (!is_root && size < min) {
                return Err(LatticeError::InvariantViolated(format!(
                    "{} holds {} entries (allowed {}..={})",
                    page,
                    size,
                    if is_root { 1 } else { min },
                    max
                )));
            }
            for i in 1..size {
                if compare_composite(
                    key_type,
                    node.key(i - 1),
                    node.pkey(i - 1),
                    node.key(i),
                    node.pkey(i),
                ) == Ordering::Greater
                {
                    return Err(LatticeError::InvariantViolated(format!(
                        "entries out of order in {}",
                        page
                    )));
                }
            }

            if node.is_leaf() {
                bfs_leaves += 1;
            } else {
                for i in 0..=size {
                    let child = node.child(i);
                    if child.is_none() {
                        return Err(LatticeError::InvariantViolated(format!(
                            "missing child pointer {} in {}",
                            i, page
                        )));
                    }
                    queue.push_back(child);
                }
            }
        }

        // Leaf chain pass: length, ordering, and back links.
        let first = self
            .leftmost_leaf()?
            .ok_or_else(|| LatticeError::InvariantViolated("no leftmost leaf".to_string()))?;
        if self.manager.node(first)?.left_sibling().is_some() {
            return Err(LatticeError::InvariantViolated(
                "leftmost leaf has a left sibling".to_string(),
            ));
        }

        let mut chain_leaves = 0usize;
        let mut prev: Option<(Bytes, PKey)> = None;
        let mut page = first;
        loop {
            let (right, first_key, first_pkey, last_key, last_pkey) = {
                let node = self.manager.node(page)?;
                let size = node.entry_count();
                (
                    node.right_sibling(),
                    Bytes::copy_from_slice(node.key(0)),
                    node.pkey(0),
                    Bytes::copy_from_slice(node.key(size - 1)),
                    node.pkey(size - 1),
                )
            };
            if let Some((prev_key, prev_pkey)) = &prev {
                if compare_composite(key_type, prev_key, *prev_pkey, &first_key, first_pkey)
                    == Ordering::Greater
                {
                    return Err(LatticeError::InvariantViolated(format!(
                        "leaf chain out of order at {}",
                        page
                    )));
                }
            }
            prev = Some((last_key, last_pkey));
            chain_leaves += 1;

            if right.is_none() {
                break;
            }
            if self.manager.node(right)?.left_sibling() != page {
                return Err(LatticeError::InvariantViolated(format!(
                    "broken leaf back link between {} and {}",
                    page, right
                )));
            }
            page = right;
        }

        if chain_leaves != bfs_leaves {
            return Err(LatticeError::InvariantViolated(format!(
                "leaf chain has {} leaves but the tree has {}",
                chain_leaves, bfs_leaves
            )));
        }
        Ok(())
    }

    /// Flushes every dirty page and syncs the backing file.
    pub fn flush(&mut self) -> Result<()> {
        self.manager.flush_all()?;
        Ok(())
    }

    /// Flushes and releases the tree.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        let expected = self.manager.key_size();
        if key.len() != expected {
            return Err(LatticeError::KeySizeMismatch {
                expected,
                actual: key.len(),
            });
        }
        Ok(())
    }
}

/// Binary search for the smallest index `i` in `[0, size]` with
/// `(key, pkey) <= (keys[i], pkeys[i])`. Returns `size` if the probe is
/// greater than every entry.
fn lower_bound(node: &NodeRef<'_>, key_type: KeyType, key: &[u8], pkey: PKey) -> usize {
    let mut lo = 0;
    let mut hi = node.entry_count();
    while lo < hi {
        let mid = (lo + hi) / 2;
        match compare_composite(key_type, key, pkey, node.key(mid), node.pkey(mid)) {
            Ordering::Greater => lo = mid + 1,
            _ => hi = mid,
        }
    }
    lo
}

fn format_key(key_type: KeyType, key: &[u8]) -> String {
    match key_type {
        KeyType::Int64 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&key[..8]);
            i64::from_le_bytes(bytes).to_string()
        }
        KeyType::Float64 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&key[..8]);
            f64::from_le_bytes(bytes).to_string()
        }
        KeyType::Text => String::from_utf8_lossy(key)
            .trim_end_matches(['\0', ' '])
            .to_string(),
        KeyType::Bytes => key.iter().map(|b| format!("{:02x}", b)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::types::encode_i64;
    use tempfile::tempdir;

    fn small_tree(dir: &tempfile::TempDir) -> BPlusTree {
        BPlusTree::open(
            dir.path().join("index.lat"),
            TreeOptions {
                branching_factor: 2,
                key_size: 8,
                key_type: KeyType::Int64,
                pool_pages: 16,
                fsync_enabled: false,
            },
        )
        .unwrap()
    }

    fn insert_i64(tree: &mut BPlusTree, key: i64, pkey: PKey) {
        tree.insert(&encode_i64(key), pkey, RowId(pkey as u32)).unwrap();
    }

    fn collect_keys(tree: &mut BPlusTree) -> Vec<(i64, PKey)> {
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

    #[test]
    fn test_insert_then_search() {
        let dir = tempdir().unwrap();
        let mut tree = small_tree(&dir);

        assert!(tree.is_empty());
        insert_i64(&mut tree, 42, 1);
        assert!(!tree.is_empty());

        assert!(tree.search(&encode_i64(42)).unwrap());
        assert!(!tree.search(&encode_i64(43)).unwrap());
        assert!(tree.search_entry(&encode_i64(42), 1).unwrap());
        assert!(!tree.search_entry(&encode_i64(42), 2).unwrap());
    }

    #[test]
    fn test_inserts_stay_sorted_across_splits() {
        let dir = tempdir().unwrap();
        let mut tree = small_tree(&dir);

        for (i, key) in [10i64, 20, 5, 15, 11, 71, 3, 9, 40, 2].iter().enumerate() {
            insert_i64(&mut tree, *key, i as PKey);
        }

        let keys: Vec<i64> = collect_keys(&mut tree).iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![2, 3, 5, 9, 10, 11, 15, 20, 40, 71]);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_duplicates_order_by_pkey() {
        let dir = tempdir().unwrap();
        let mut tree = small_tree(&dir);

        for pkey in [9i64, 5, 7, 6, 8] {
            insert_i64(&mut tree, 71, pkey);
        }

        assert_eq!(
            collect_keys(&mut tree),
            vec![(71, 5), (71, 6), (71, 7), (71, 8), (71, 9)]
        );
    }

    #[test]
    fn test_remove_exact_entry() {
        let dir = tempdir().unwrap();
        let mut tree = small_tree(&dir);

        for key in [10i64, 20, 30] {
            insert_i64(&mut tree, key, key);
        }

        assert!(tree.remove(&encode_i64(20), 20).unwrap());
        assert!(!tree.remove(&encode_i64(20), 20).unwrap());
        assert!(!tree.search(&encode_i64(20)).unwrap());
        assert!(tree.search(&encode_i64(10)).unwrap());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_last_entry_empties_tree() {
        let dir = tempdir().unwrap();
        let mut tree = small_tree(&dir);

        insert_i64(&mut tree, 7, 1);
        assert!(tree.remove(&encode_i64(7), 1).unwrap());
        assert!(tree.is_empty());
        assert_eq!(tree.depth().unwrap(), 0);

        // The tree works again after contraction to empty.
        insert_i64(&mut tree, 8, 2);
        assert!(tree.search(&encode_i64(8)).unwrap());
    }

    #[test]
    fn test_remove_any_takes_first_duplicate() {
        let dir = tempdir().unwrap();
        let mut tree = small_tree(&dir);

        for pkey in [3i64, 1, 2] {
            insert_i64(&mut tree, 5, pkey);
        }

        assert!(tree.remove_any(&encode_i64(5)).unwrap());
        assert_eq!(collect_keys(&mut tree), vec![(5, 2), (5, 3)]);
    }

    #[test]
    fn test_key_size_is_enforced() {
        let dir = tempdir().unwrap();
        let mut tree = small_tree(&dir);

        assert!(matches!(
            tree.insert(b"xy", 1, RowId(1)),
            Err(LatticeError::KeySizeMismatch { .. })
        ));
        assert!(tree.search(b"xy").is_err());
    }

    #[test]
    fn test_dump_shows_levels() {
        let dir = tempdir().unwrap();
        let mut tree = small_tree(&dir);

        for key in [10i64, 20, 5, 15] {
            insert_i64(&mut tree, key, key);
        }

        let dump = tree.dump().unwrap();
        let first = dump.lines().next().unwrap();
        // The root line comes first and shows composite pairs.
        assert!(first.ends_with("10(10)"));
        assert!(dump.lines().count() >= 3);
    }

    #[test]
    fn test_dump_empty_tree() {
        let dir = tempdir().unwrap();
        let mut tree = small_tree(&dir);
        assert_eq!(tree.dump().unwrap(), "(empty)\n");
    }
}
