//! Bounded write-back LRU block cache.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use crate::cache::{read_window, PageCache};
use crate::error::Result;
use crate::file::Geometry;

struct Block {
    page_id: u32,
    data: Vec<u8>,
    dirty: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Caches up to `capacity` whole pages, evicting the least recently used.
///
/// Blocks live in an arena indexed by an identity map (page id → arena slot)
/// and a doubly linked recency list threaded through the blocks (head = most
/// recent). At most one resident block per page id, so memory stays bounded
/// at roughly `capacity * page_size`. Writes only mark the block dirty; bytes
/// reach the file on eviction or [`PageCache::sync`]. Block buffers are sized
/// per page, so the 128-byte header region (page 0) shares the cache with
/// data pages.
pub struct LruCache {
    file: File,
    geom: Geometry,
    capacity: usize,
    blocks: Vec<Block>,
    map: HashMap<u32, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruCache {
    pub fn new(file: File, geom: Geometry, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        LruCache {
            file,
            geom,
            capacity,
            blocks: Vec::with_capacity(capacity),
            map: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    /// Returns the arena slot holding `page_id`, loading or evicting as
    /// needed, and moves it to the front of the recency list.
    fn block_for(&mut self, page_id: u32) -> Result<usize> {
        if let Some(&idx) = self.map.get(&page_id) {
            self.touch(idx);
            return Ok(idx);
        }

        let idx = if self.map.len() >= self.capacity {
            let idx = self.tail.expect("non-empty cache has a tail");
            let evicted = self.blocks[idx].page_id;
            log::trace!(
                "evicting page {evicted} (dirty: {})",
                self.blocks[idx].dirty
            );
            self.write_back(idx)?;
            self.unlink(idx);
            self.map.remove(&evicted);
            idx
        } else if self.blocks.len() < self.capacity {
            self.blocks.push(Block {
                page_id: 0,
                data: Vec::new(),
                dirty: false,
                prev: None,
                next: None,
            });
            self.blocks.len() - 1
        } else {
            unreachable!("arena full but map below capacity")
        };

        let mut data = vec![0u8; self.geom.size_of(page_id)];
        read_window(&mut self.file, self.geom.page_offset(page_id), &mut data)?;
        self.blocks[idx] = Block {
            page_id,
            data,
            dirty: false,
            prev: None,
            next: None,
        };
        self.map.insert(page_id, idx);
        self.push_front(idx);
        Ok(idx)
    }

    fn write_back(&mut self, idx: usize) -> Result<()> {
        if !self.blocks[idx].dirty {
            return Ok(());
        }
        let offset = self.geom.page_offset(self.blocks[idx].page_id);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&self.blocks[idx].data)?;
        self.blocks[idx].dirty = false;
        Ok(())
    }

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.blocks[idx].prev, self.blocks[idx].next);
        match prev {
            Some(p) => self.blocks[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.blocks[n].prev = prev,
            None => self.tail = prev,
        }
        self.blocks[idx].prev = None;
        self.blocks[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.blocks[idx].prev = None;
        self.blocks[idx].next = self.head;
        if let Some(old) = self.head {
            self.blocks[old].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

impl PageCache for LruCache {
    fn read(&mut self, page_id: u32, pos: usize, len: usize) -> Result<Vec<u8>> {
        super::check_bounds(&self.geom, page_id, pos, len)?;
        let idx = self.block_for(page_id)?;
        Ok(self.blocks[idx].data[pos..pos + len].to_vec())
    }

    fn write(&mut self, page_id: u32, pos: usize, data: &[u8]) -> Result<()> {
        super::check_bounds(&self.geom, page_id, pos, data.len())?;
        let idx = self.block_for(page_id)?;
        self.blocks[idx].data[pos..pos + data.len()].copy_from_slice(data);
        self.blocks[idx].dirty = true;
        Ok(())
    }

    /// Flushes every dirty block without evicting, then fsyncs.
    fn sync(&mut self) -> Result<()> {
        for idx in 0..self.blocks.len() {
            self.write_back(idx)?;
        }
        self.file.sync_all()?;
        Ok(())
    }
}
