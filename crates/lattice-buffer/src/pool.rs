//! Buffer pool manager.

use crate::file::PageFile;
use crate::frame::{Frame, FrameId};
use crate::replacer::{LruReplacer, Replacer};
use lattice_common::page::{PageNo, PAGE_SIZE};
use lattice_common::{LatticeError, Result};
use log::debug;
use std::collections::HashMap;
use sysinfo::System;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

impl BufferPoolConfig {
    /// Sizes the pool to 25% of available system RAM, with a floor of
    /// 1,000 frames so caching stays useful on low-memory systems.
    pub fn auto_sized() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let capacity = (target_bytes / PAGE_SIZE).max(1_000);

        Self { capacity }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub capacity: usize,
    /// Number of frames never used so far.
    pub free_frames: usize,
    /// Number of frames holding pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

/// Buffer pool manager.
///
/// Owns the backing page file and a fixed table of page frames:
/// - Page number to frame mapping
/// - Free frame list for cold frames
/// - Approximate-LRU replacement for eviction
/// - Pin counting to protect pages an operation still needs
///
/// Eviction prefers clean unpinned frames; when only dirty candidates
/// remain, the least recently used one is written back first. Pinned
/// frames are never evicted.
pub struct BufferPool {
    /// Backing file, exclusively owned.
    file: PageFile,
    /// Array of buffer frames.
    frames: Vec<Frame>,
    /// Page number to frame mapping.
    page_table: HashMap<PageNo, FrameId>,
    /// List of never-used frame IDs.
    free_list: Vec<FrameId>,
    /// Page replacement policy.
    replacer: LruReplacer,
}

impl BufferPool {
    /// Creates a new buffer pool over the given page file.
    pub fn new(file: PageFile, config: BufferPoolConfig) -> Self {
        let capacity = config.capacity;

        let frames: Vec<_> = (0..capacity)
            .map(|i| Frame::new(FrameId(i as u32)))
            .collect();

        // All frames start in the free list; popping hands them out in
        // ascending order.
        let free_list: Vec<_> = (0..capacity).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            file,
            frames,
            page_table: HashMap::with_capacity(capacity),
            free_list,
            replacer: LruReplacer::new(capacity),
        }
    }

    /// Returns the number of frames in the pool.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of never-used frames.
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Returns the number of pages currently resident.
    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Checks if a page is resident.
    pub fn contains(&self, page_no: PageNo) -> bool {
        self.page_table.contains_key(&page_no)
    }

    /// Returns the number of page slots in the backing file.
    pub fn num_pages(&self) -> u32 {
        self.file.num_pages()
    }

    /// Returns true if the backing file was just created.
    pub fn is_fresh(&self) -> bool {
        self.file.is_fresh()
    }

    /// Fetches a page, reading it from the backing file on a miss.
    ///
    /// The returned frame stays valid until the next call into the pool;
    /// callers that need a page to survive longer must `pin` it and keep
    /// its page number.
    pub fn fetch(&mut self, page_no: PageNo) -> Result<&mut Frame> {
        if let Some(&frame_id) = self.page_table.get(&page_no) {
            self.replacer.record_access(frame_id);
            return Ok(&mut self.frames[frame_id.0 as usize]);
        }

        // Miss: read from disk before touching any frame so an I/O error
        // leaves the pool untouched.
        let data = self.file.read_page(page_no)?;

        let frame_id = self.allocate_frame()?;
        let frame = &mut self.frames[frame_id.0 as usize];
        frame.reset();
        frame.set_page_no(Some(page_no));
        frame.copy_from(&data[..]);

        self.page_table.insert(page_no, frame_id);
        self.replacer.record_access(frame_id);
        Ok(&mut self.frames[frame_id.0 as usize])
    }

    /// Extends the file by one page and installs an empty, dirty frame
    /// for it. Returns the new 1-based page number.
    pub fn allocate(&mut self) -> Result<PageNo> {
        let frame_id = self.allocate_frame()?;

        let page_no = match self.file.allocate() {
            Ok(page_no) => page_no,
            Err(e) => {
                // Return the frame unused; nothing else was mutated.
                self.frames[frame_id.0 as usize].reset();
                self.free_list.push(frame_id);
                return Err(e);
            }
        };

        let frame = &mut self.frames[frame_id.0 as usize];
        frame.reset();
        frame.set_page_no(Some(page_no));
        frame.set_dirty(true);

        self.page_table.insert(page_no, frame_id);
        self.replacer.record_access(frame_id);

        debug!("allocated {} into {}", page_no, frame_id);
        Ok(page_no)
    }

    /// Pins a resident page against eviction. Returns false if the page
    /// is not resident.
    pub fn pin(&mut self, page_no: PageNo) -> bool {
        if let Some(&frame_id) = self.page_table.get(&page_no) {
            self.frames[frame_id.0 as usize].pin();
            return true;
        }
        false
    }

    /// Releases one pin on a resident page.
    pub fn unpin(&mut self, page_no: PageNo) {
        if let Some(&frame_id) = self.page_table.get(&page_no) {
            self.frames[frame_id.0 as usize].unpin();
        }
    }

    /// Writes a resident dirty page to the backing file and clears its
    /// dirty bit. Returns true if a write happened; absent or clean pages
    /// are a no-op.
    pub fn flush(&mut self, page_no: PageNo) -> Result<bool> {
        if let Some(&frame_id) = self.page_table.get(&page_no) {
            let frame = &mut self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                self.file.write_page(page_no, frame.data())?;
                frame.set_dirty(false);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Flushes every dirty frame. Returns the number of pages written.
    pub fn flush_all(&mut self) -> Result<usize> {
        let resident: Vec<(PageNo, FrameId)> =
            self.page_table.iter().map(|(&p, &f)| (p, f)).collect();

        let mut flushed = 0;
        for (page_no, frame_id) in resident {
            let frame = &mut self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                self.file.write_page(page_no, frame.data())?;
                frame.set_dirty(false);
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Syncs the backing file to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;
        for &frame_id in self.page_table.values() {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }

        BufferPoolStats {
            capacity: self.frames.len(),
            free_frames: self.free_list.len(),
            used_frames: self.page_table.len(),
            pinned_frames,
            dirty_frames,
        }
    }

    /// Finds a frame for a new page: free list first, then eviction.
    ///
    /// Eviction order: LRU clean unpinned frame, else LRU dirty unpinned
    /// frame after writing it back. Fails with `PoolExhausted` when every
    /// frame is pinned.
    fn allocate_frame(&mut self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.pop() {
            return Ok(frame_id);
        }

        let frames = &self.frames;
        let mut victim = self.replacer.victim(&|f| {
            let frame = &frames[f.0 as usize];
            !frame.is_pinned() && !frame.is_dirty()
        });
        if victim.is_none() {
            victim = self
                .replacer
                .victim(&|f| !frames[f.0 as usize].is_pinned());
        }

        let Some(frame_id) = victim else {
            return Err(LatticeError::PoolExhausted);
        };

        let frame = &mut self.frames[frame_id.0 as usize];
        if frame.is_dirty() {
            if let Some(page_no) = frame.page_no() {
                debug!("evicting dirty {} from {}", page_no, frame_id);
                self.file.write_page(page_no, frame.data())?;
                frame.set_dirty(false);
            }
        }
        if let Some(old_page) = frame.page_no() {
            self.page_table.remove(&old_page);
        }

        Ok(frame_id)
    }
}
