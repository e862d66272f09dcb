//! Page cache trait and the uncached passthrough implementation.

pub mod lru;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::file::Geometry;

pub use lru::LruCache;

/// Byte-range access to pages of the backing file.
///
/// Implementations own their file handle. `read` hands out an owned copy of
/// the requested range; callers never see cache-internal buffers. `sync` makes
/// every acknowledged write durable.
pub trait PageCache {
    fn read(&mut self, page_id: u32, pos: usize, len: usize) -> Result<Vec<u8>>;
    fn write(&mut self, page_id: u32, pos: usize, data: &[u8]) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// Reads `buf.len()` bytes at `offset`, zero-filling any part that lies past
/// the end of the file. Pages are materialized lazily on first write, so a
/// read of a not-yet-written page yields zeros rather than a short read.
pub(crate) fn read_window(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
    let file_len = file.metadata()?.len();
    let avail = file_len.saturating_sub(offset).min(buf.len() as u64) as usize;
    if avail > 0 {
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..avail])?;
    }
    buf[avail..].fill(0);
    Ok(())
}

fn check_bounds(geom: &Geometry, page_id: u32, pos: usize, len: usize) -> Result<()> {
    let page_size = geom.size_of(page_id);
    if pos + len > page_size {
        return Err(Error::Corrupt(format!(
            "access [{pos}, {}) out of bounds for page {page_id} ({page_size} bytes)",
            pos + len
        )));
    }
    Ok(())
}

/// Uncached cache: every call seeks and hits the file directly.
///
/// Used while a file is being created or recovered, before the LRU cache is
/// installed, and wherever deterministic pass-through behavior is wanted.
pub struct PassthroughCache {
    file: File,
    geom: Geometry,
}

impl PassthroughCache {
    pub fn new(file: File, geom: Geometry) -> Self {
        PassthroughCache { file, geom }
    }
}

impl PageCache for PassthroughCache {
    fn read(&mut self, page_id: u32, pos: usize, len: usize) -> Result<Vec<u8>> {
        check_bounds(&self.geom, page_id, pos, len)?;
        let offset = self.geom.page_offset(page_id) + pos as u64;
        let mut buf = vec![0u8; len];
        read_window(&mut self.file, offset, &mut buf)?;
        Ok(buf)
    }

    fn write(&mut self, page_id: u32, pos: usize, data: &[u8]) -> Result<()> {
        check_bounds(&self.geom, page_id, pos, data.len())?;
        let offset = self.geom.page_offset(page_id) + pos as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
