//! Configuration structures for LatticeDB.

use crate::page::PAGE_SIZE;
use crate::types::KeyType;
use crate::{LatticeError, Result};
use serde::{Deserialize, Serialize};

/// Smallest useful buffer pool: root-to-leaf path plus the sibling pages a
/// split or merge touches, plus the superblock.
pub const MIN_POOL_PAGES: usize = 8;

/// Options for opening or creating a B+ tree index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeOptions {
    /// Branching factor B: every non-root node holds between B−1 and 2B−1
    /// entries. Fixed at creation time.
    pub branching_factor: i32,
    /// Key size in bytes. Fixed at creation time.
    pub key_size: usize,
    /// Comparator for the opaque key bytes.
    pub key_type: KeyType,
    /// Buffer pool capacity in pages.
    pub pool_pages: usize,
    /// Enable fsync after page writes.
    pub fsync_enabled: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            branching_factor: 64,
            key_size: 8,
            key_type: KeyType::Int64,
            pool_pages: 256, // 1 MB with 4 KB pages
            fsync_enabled: true,
        }
    }
}

impl TreeOptions {
    /// Validates the options before any file is touched.
    pub fn validate(&self) -> Result<()> {
        if self.branching_factor < 2 {
            return Err(LatticeError::InvalidConfig(format!(
                "branching factor must be >= 2, got {}",
                self.branching_factor
            )));
        }
        self.key_type.check_key_size(self.key_size)?;
        if self.pool_pages < MIN_POOL_PAGES {
            return Err(LatticeError::InvalidConfig(format!(
                "pool must hold at least {} pages, got {}",
                MIN_POOL_PAGES, self.pool_pages
            )));
        }
        let node_bytes = Self::node_bytes(self.branching_factor, self.key_size);
        if node_bytes > PAGE_SIZE {
            return Err(LatticeError::InvalidConfig(format!(
                "node layout needs {} bytes but pages are {} bytes",
                node_bytes, PAGE_SIZE
            )));
        }
        Ok(())
    }

    /// Bytes a node with the given parameters occupies: a 16-byte header,
    /// 2B−1 keys, 2B−1 pkeys, and 2B child slots.
    pub fn node_bytes(branching_factor: i32, key_size: usize) -> usize {
        let max_entries = (2 * branching_factor - 1) as usize;
        let max_children = (2 * branching_factor) as usize;
        16 + max_entries * key_size + max_entries * 8 + max_children * 4
    }
}
