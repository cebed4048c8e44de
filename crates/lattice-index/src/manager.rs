//! Node manager: typed node access above the buffer pool.

use crate::node::{NodeLayout, NodeMut, NodeRef};
use crate::superblock::{Superblock, SUPERBLOCK_PAGE};
use lattice_buffer::{BufferPool, BufferPoolConfig, PageFile};
use lattice_common::config::TreeOptions;
use lattice_common::page::PageNo;
use lattice_common::{LatticeError, Result};
use log::debug;
use std::path::Path;

/// Maps page numbers to typed node views and owns the superblock.
///
/// The manager computes key and child offsets from the parameters stored
/// in the superblock, allocates fresh node pages (reusing freed ones via
/// the free list), and rewrites the superblock whenever the root or the
/// free list head changes.
pub struct NodeManager {
    /// Buffer pool, exclusively owned.
    pool: BufferPool,
    /// Derived node layout, fixed for the lifetime of the file.
    layout: NodeLayout,
    /// Cached superblock; kept in sync with page 1.
    meta: Superblock,
}

impl NodeManager {
    /// Opens an index file, creating and initializing it if necessary.
    ///
    /// For an existing file the superblock's branching factor and key
    /// size are authoritative; the options' key type must agree with the
    /// stored key size.
    pub fn open(path: impl AsRef<Path>, opts: &TreeOptions) -> Result<Self> {
        opts.validate()?;

        let file = PageFile::open(path, opts.fsync_enabled)?;
        let mut pool = BufferPool::new(
            file,
            BufferPoolConfig {
                capacity: opts.pool_pages,
            },
        );

        if pool.is_fresh() {
            let page_no = pool.allocate()?;
            if page_no != SUPERBLOCK_PAGE {
                return Err(LatticeError::InvariantViolated(format!(
                    "fresh file allocated {} instead of the superblock page",
                    page_no
                )));
            }

            let meta = Superblock::new(opts.branching_factor, opts.key_size as i32);
            let layout = NodeLayout::new(opts.branching_factor, opts.key_size)?;

            let frame = pool.fetch(SUPERBLOCK_PAGE)?;
            meta.write_to(frame.data_mut());
            frame.set_dirty(true);

            debug!(
                "created index {} (B={}, key_size={})",
                SUPERBLOCK_PAGE, opts.branching_factor, opts.key_size
            );
            return Ok(Self { pool, layout, meta });
        }

        let frame = pool.fetch(SUPERBLOCK_PAGE)?;
        let meta = Superblock::read_from(frame.data())?;

        let layout = NodeLayout::new(meta.branching_factor, meta.key_size as usize)
            .map_err(|_| {
                LatticeError::corrupt(
                    SUPERBLOCK_PAGE.0,
                    "derived node layout exceeds page size",
                )
            })?;
        opts.key_type.check_key_size(meta.key_size as usize)?;

        Ok(Self { pool, layout, meta })
    }

    /// The derived node layout.
    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    /// The branching factor B.
    pub fn branching_factor(&self) -> usize {
        self.layout.branching_factor()
    }

    /// Key size in bytes.
    pub fn key_size(&self) -> usize {
        self.layout.key_size()
    }

    /// The current root page, `PageNo::NONE` for an empty tree.
    pub fn root(&self) -> PageNo {
        self.meta.root
    }

    /// Updates the root pointer and rewrites the superblock.
    pub fn set_root(&mut self, root: PageNo) -> Result<()> {
        self.meta.root = root;
        self.write_meta()
    }

    /// Returns a read-only view of a node page.
    pub fn node(&mut self, page_no: PageNo) -> Result<NodeRef<'_>> {
        self.check_page(page_no)?;
        let layout = &self.layout;
        let frame = self.pool.fetch(page_no)?;
        Ok(NodeRef::new(frame.data(), layout))
    }

    /// Returns a mutable view of a node page, marking it dirty.
    pub fn node_mut(&mut self, page_no: PageNo) -> Result<NodeMut<'_>> {
        self.check_page(page_no)?;
        let layout = &self.layout;
        let frame = self.pool.fetch(page_no)?;
        frame.set_dirty(true);
        Ok(NodeMut::new(frame.data_mut(), layout))
    }

    /// Allocates a page for a fresh node and initializes its header.
    ///
    /// Pops the free list when possible, otherwise extends the file.
    pub fn alloc_node(&mut self, is_leaf: bool) -> Result<PageNo> {
        let page_no = if self.meta.free_head.is_some() {
            let head = self.meta.free_head;
            let next = {
                let frame = self.pool.fetch(head)?;
                PageNo(u32::from_le_bytes([
                    frame.data()[0],
                    frame.data()[1],
                    frame.data()[2],
                    frame.data()[3],
                ]))
            };
            self.meta.free_head = next;
            self.write_meta()?;
            head
        } else {
            self.pool.allocate()?
        };

        let frame = self.pool.fetch(page_no)?;
        frame.data_mut().fill(0);
        frame.data_mut()[0] = is_leaf as u8;
        frame.set_dirty(true);

        debug!("allocated node {} (leaf={})", page_no, is_leaf);
        Ok(page_no)
    }

    /// Returns a node page to the free list.
    pub fn free_node(&mut self, page_no: PageNo) -> Result<()> {
        self.check_page(page_no)?;

        let next = self.meta.free_head;
        {
            let frame = self.pool.fetch(page_no)?;
            frame.data_mut().fill(0);
            frame.data_mut()[0..4].copy_from_slice(&next.0.to_le_bytes());
            frame.set_dirty(true);
        }
        self.meta.free_head = page_no;
        self.write_meta()?;

        debug!("freed node {}", page_no);
        Ok(())
    }

    /// Pins a node page against eviction for the current operation.
    pub fn pin(&mut self, page_no: PageNo) {
        self.pool.pin(page_no);
    }

    /// Releases one pin on a node page.
    pub fn unpin(&mut self, page_no: PageNo) {
        self.pool.unpin(page_no);
    }

    /// Flushes every dirty page and syncs the backing file.
    pub fn flush_all(&mut self) -> Result<usize> {
        let flushed = self.pool.flush_all()?;
        self.pool.sync()?;
        Ok(flushed)
    }

    fn write_meta(&mut self) -> Result<()> {
        let frame = self.pool.fetch(SUPERBLOCK_PAGE)?;
        self.meta.write_to(frame.data_mut());
        frame.set_dirty(true);
        Ok(())
    }

    fn check_page(&self, page_no: PageNo) -> Result<()> {
        if page_no.is_none() || page_no == SUPERBLOCK_PAGE || page_no.0 >= self.pool.num_pages() {
            return Err(LatticeError::corrupt(
                page_no.0,
                "page number out of range for a node",
            ));
        }
        Ok(())
    }
}
