//! B+ tree node layout and typed page views.
//!
//! Every node page shares one layout:
//!
//! ```text
//! +---------------------------+ 0
//! | is_leaf: u8, pad: [u8; 3] | 4
//! | size: i32                 | 8
//! | left_sibling: u32         | 12
//! | right_sibling: u32        | 16 (HEADER_SIZE)
//! +---------------------------+
//! | keys:     (2B−1) × key_size bytes
//! | pkeys:    (2B−1) × 8 bytes
//! | children: 2B × 4 bytes
//! +---------------------------+
//! ```
//!
//! All integers are little-endian. In leaves the `children` slots hold row
//! locators for the parallel entries; in internal nodes they hold child
//! page numbers. Unused slots carry zero.

use lattice_common::page::{PageBuf, PageNo, PAGE_SIZE};
use lattice_common::types::{PKey, RowId};
use lattice_common::{LatticeError, Result};

/// Offsets of the node arrays, derived from `(B, key_size)`.
///
/// Computed once per tree; both the node manager and the tree layer go
/// through it so the two always agree byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    branching_factor: usize,
    key_size: usize,
    pkeys_off: usize,
    children_off: usize,
}

impl NodeLayout {
    /// Size of the node header in bytes.
    pub const HEADER_SIZE: usize = 16;

    const IS_LEAF_OFF: usize = 0;
    const SIZE_OFF: usize = 4;
    const LEFT_OFF: usize = 8;
    const RIGHT_OFF: usize = 12;

    /// Derives the layout, rejecting parameters whose arrays would not
    /// fit in a page.
    pub fn new(branching_factor: i32, key_size: usize) -> Result<Self> {
        if branching_factor < 2 {
            return Err(LatticeError::InvalidConfig(format!(
                "branching factor must be >= 2, got {}",
                branching_factor
            )));
        }
        if key_size == 0 {
            return Err(LatticeError::InvalidConfig(
                "key size must be at least 1 byte".to_string(),
            ));
        }

        let b = branching_factor as usize;
        let max_entries = 2 * b - 1;
        let pkeys_off = Self::HEADER_SIZE + max_entries * key_size;
        let children_off = pkeys_off + max_entries * 8;
        let end = children_off + 2 * b * 4;
        if end > PAGE_SIZE {
            return Err(LatticeError::InvalidConfig(format!(
                "node layout needs {} bytes but pages are {} bytes",
                end, PAGE_SIZE
            )));
        }

        Ok(Self {
            branching_factor: b,
            key_size,
            pkeys_off,
            children_off,
        })
    }

    /// The branching factor B.
    pub fn branching_factor(&self) -> usize {
        self.branching_factor
    }

    /// Key size in bytes.
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Maximum entries per node: 2B−1.
    pub fn max_entries(&self) -> usize {
        2 * self.branching_factor - 1
    }

    /// Minimum entries per non-root node: B−1.
    pub fn min_entries(&self) -> usize {
        self.branching_factor - 1
    }

    fn key_off(&self, index: usize) -> usize {
        Self::HEADER_SIZE + index * self.key_size
    }

    fn pkey_off(&self, index: usize) -> usize {
        self.pkeys_off + index * 8
    }

    fn child_off(&self, index: usize) -> usize {
        self.children_off + index * 4
    }
}

/// Read-only typed view of a node page.
pub struct NodeRef<'a> {
    data: &'a PageBuf,
    layout: &'a NodeLayout,
}

impl<'a> NodeRef<'a> {
    /// Wraps a page buffer in a node view.
    pub fn new(data: &'a PageBuf, layout: &'a NodeLayout) -> Self {
        Self { data, layout }
    }

    /// Returns true if this node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.data[NodeLayout::IS_LEAF_OFF] != 0
    }

    /// Returns the number of entries in this node.
    pub fn entry_count(&self) -> usize {
        let off = NodeLayout::SIZE_OFF;
        let size = i32::from_le_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ]);
        size.max(0) as usize
    }

    /// Returns the left sibling page, `PageNo::NONE` if none.
    pub fn left_sibling(&self) -> PageNo {
        PageNo(read_u32(self.data, NodeLayout::LEFT_OFF))
    }

    /// Returns the right sibling page, `PageNo::NONE` if none.
    pub fn right_sibling(&self) -> PageNo {
        PageNo(read_u32(self.data, NodeLayout::RIGHT_OFF))
    }

    /// Returns the key bytes at `index`.
    pub fn key(&self, index: usize) -> &'a [u8] {
        let off = self.layout.key_off(index);
        &self.data[off..off + self.layout.key_size]
    }

    /// Returns the primary key at `index`.
    pub fn pkey(&self, index: usize) -> PKey {
        let off = self.layout.pkey_off(index);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[off..off + 8]);
        i64::from_le_bytes(bytes)
    }

    /// Returns the child page number at `index` (internal nodes).
    pub fn child(&self, index: usize) -> PageNo {
        PageNo(read_u32(self.data, self.layout.child_off(index)))
    }

    /// Returns the row locator at `index` (leaf nodes).
    pub fn row(&self, index: usize) -> RowId {
        RowId(read_u32(self.data, self.layout.child_off(index)))
    }
}

/// Mutable typed view of a node page.
///
/// The frame backing this view is marked dirty when the view is handed
/// out, so every mutation path satisfies the dirty-bit invariant.
pub struct NodeMut<'a> {
    data: &'a mut PageBuf,
    layout: &'a NodeLayout,
}

impl<'a> NodeMut<'a> {
    /// Wraps a page buffer in a mutable node view.
    pub fn new(data: &'a mut PageBuf, layout: &'a NodeLayout) -> Self {
        Self { data, layout }
    }

    /// Returns a read-only view of the same node.
    pub fn as_view(&self) -> NodeRef<'_> {
        NodeRef {
            data: &*self.data,
            layout: self.layout,
        }
    }

    /// Returns true if this node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.data[NodeLayout::IS_LEAF_OFF] != 0
    }

    /// Returns the number of entries in this node.
    pub fn entry_count(&self) -> usize {
        self.as_view().entry_count()
    }

    /// Returns the key bytes at `index`.
    pub fn key(&self, index: usize) -> &[u8] {
        let off = self.layout.key_off(index);
        &self.data[off..off + self.layout.key_size]
    }

    /// Returns the primary key at `index`.
    pub fn pkey(&self, index: usize) -> PKey {
        self.as_view().pkey(index)
    }

    /// Returns the child page number at `index`.
    pub fn child(&self, index: usize) -> PageNo {
        self.as_view().child(index)
    }

    /// Returns the row locator at `index`.
    pub fn row(&self, index: usize) -> RowId {
        self.as_view().row(index)
    }

    /// Sets the leaf flag.
    pub fn set_is_leaf(&mut self, is_leaf: bool) {
        self.data[NodeLayout::IS_LEAF_OFF] = is_leaf as u8;
    }

    /// Sets the entry count. Shrinking the count zeroes the vacated
    /// slots, keeping the unused-slots-are-zero layout invariant.
    pub fn set_entry_count(&mut self, count: usize) {
        let old = self.entry_count();
        if count < old {
            self.zero_entries(count, old);
        }
        let off = NodeLayout::SIZE_OFF;
        self.data[off..off + 4].copy_from_slice(&(count as i32).to_le_bytes());
    }

    /// Zeroes entries `[from, to)` and their child slots: the slot range
    /// is shifted by one for internal nodes, which occupy size + 1 slots.
    fn zero_entries(&mut self, from: usize, to: usize) {
        self.data[self.layout.key_off(from)..self.layout.key_off(to)].fill(0);
        self.data[self.layout.pkey_off(from)..self.layout.pkey_off(to)].fill(0);
        if self.is_leaf() {
            self.data[self.layout.child_off(from)..self.layout.child_off(to)].fill(0);
        } else {
            self.data[self.layout.child_off(from + 1)..self.layout.child_off(to + 1)].fill(0);
        }
    }

    /// Sets the left sibling link.
    pub fn set_left_sibling(&mut self, page_no: PageNo) {
        write_u32(self.data, NodeLayout::LEFT_OFF, page_no.0);
    }

    /// Sets the right sibling link.
    pub fn set_right_sibling(&mut self, page_no: PageNo) {
        write_u32(self.data, NodeLayout::RIGHT_OFF, page_no.0);
    }

    /// Writes the key bytes at `index`.
    pub fn set_key(&mut self, index: usize, key: &[u8]) {
        debug_assert_eq!(key.len(), self.layout.key_size);
        let off = self.layout.key_off(index);
        self.data[off..off + self.layout.key_size].copy_from_slice(key);
    }

    /// Writes the primary key at `index`.
    pub fn set_pkey(&mut self, index: usize, pkey: PKey) {
        let off = self.layout.pkey_off(index);
        self.data[off..off + 8].copy_from_slice(&pkey.to_le_bytes());
    }

    /// Writes the composite `(key, pkey)` pair at `index`.
    pub fn set_entry(&mut self, index: usize, key: &[u8], pkey: PKey) {
        self.set_key(index, key);
        self.set_pkey(index, pkey);
    }

    /// Writes the child page number at `index`.
    pub fn set_child(&mut self, index: usize, page_no: PageNo) {
        write_u32(self.data, self.layout.child_off(index), page_no.0);
    }

    /// Writes the row locator at `index`.
    pub fn set_row(&mut self, index: usize, row: RowId) {
        write_u32(self.data, self.layout.child_off(index), row.0);
    }

    /// Shifts entries `[from, count)` one slot right, opening a hole at
    /// `from`. `count` is the current entry count.
    pub fn shift_entries_right(&mut self, from: usize, count: usize) {
        let ks = self.layout.key_size;
        let keys_start = self.layout.key_off(from);
        let keys_end = self.layout.key_off(count);
        self.data.copy_within(keys_start..keys_end, keys_start + ks);

        let pkeys_start = self.layout.pkey_off(from);
        let pkeys_end = self.layout.pkey_off(count);
        self.data
            .copy_within(pkeys_start..pkeys_end, pkeys_start + 8);
    }

    /// Shifts entries `[from + 1, count)` one slot left, removing the
    /// entry at `from`. `count` is the current entry count.
    pub fn shift_entries_left(&mut self, from: usize, count: usize) {
        let ks = self.layout.key_size;
        let keys_start = self.layout.key_off(from + 1);
        let keys_end = self.layout.key_off(count);
        self.data.copy_within(keys_start..keys_end, keys_start - ks);

        let pkeys_start = self.layout.pkey_off(from + 1);
        let pkeys_end = self.layout.pkey_off(count);
        self.data
            .copy_within(pkeys_start..pkeys_end, pkeys_start - 8);
    }

    /// Shifts child slots `[from, count)` one slot right. `count` is the
    /// number of occupied child slots (entries for a leaf, entries + 1
    /// for an internal node).
    pub fn shift_children_right(&mut self, from: usize, count: usize) {
        let start = self.layout.child_off(from);
        let end = self.layout.child_off(count);
        self.data.copy_within(start..end, start + 4);
    }

    /// Shifts child slots `[from + 1, count)` one slot left, removing the
    /// slot at `from`. `count` is the number of occupied child slots.
    pub fn shift_children_left(&mut self, from: usize, count: usize) {
        let start = self.layout.child_off(from + 1);
        let end = self.layout.child_off(count);
        self.data.copy_within(start..end, start - 4);
    }
}

fn read_u32(data: &PageBuf, off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn write_u32(data: &mut PageBuf, off: usize, value: u32) {
    data[off..off + 4].copy_from_slice(&value.to_le_bytes());
}
