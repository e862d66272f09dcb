//! Overflow page chains: linked pages exposing one logical byte stream.

use crate::codec::{FieldDef, Fields, Layout};
use crate::error::{Error, Result};
use crate::file::DbFile;
use crate::page::PageType;

/// Bytes of per-page header before the body: type tag + next-page link.
pub const OVERFLOW_HEADER: usize = 5;

fn overflow_layout() -> Layout {
    Layout::new(vec![FieldDef::new("type", 1), FieldDef::new("next", 4)])
}

/// View over one page of an overflow chain.
pub struct OverflowPage<'a> {
    db: &'a DbFile,
    page_id: u32,
}

impl<'a> OverflowPage<'a> {
    /// Initializes a freshly allocated page as an empty chain head.
    pub fn create(db: &'a DbFile, page_id: u32) -> Result<Self> {
        let fields = Fields::new(db, page_id, overflow_layout());
        fields.set_u8("type", PageType::Overflow.as_u8())?;
        fields.set_u32("next", 0)?;
        Ok(OverflowPage { db, page_id })
    }

    pub fn open(db: &'a DbFile, page_id: u32) -> Result<Self> {
        let fields = Fields::new(db, page_id, overflow_layout());
        if fields.get_u8("type")? != PageType::Overflow.as_u8() {
            return Err(Error::Corrupt(format!(
                "page {page_id} is not an overflow page"
            )));
        }
        Ok(OverflowPage { db, page_id })
    }

    pub fn page_id(&self) -> u32 {
        self.page_id
    }

    pub fn next(&self) -> Result<u32> {
        Fields::new(self.db, self.page_id, overflow_layout()).get_u32("next")
    }

    pub fn set_next(&self, next: u32) -> Result<()> {
        Fields::new(self.db, self.page_id, overflow_layout()).set_u32("next", next)
    }

    fn body_size(&self) -> usize {
        self.db.page_size(self.page_id) - OVERFLOW_HEADER
    }

    /// Read cursor positioned `pos` bytes into the chain's logical stream.
    /// Returns `None` when the chain ends before `pos`; whether that is
    /// corruption is the caller's call.
    pub fn reader(&self, pos: u64) -> Result<Option<OverflowReader<'a>>> {
        let body = self.body_size() as u64;
        let mut page_id = self.page_id;
        let mut pos = pos;
        while pos >= body {
            let next = OverflowPage::open(self.db, page_id)?.next()?;
            if next == 0 {
                return Ok(None);
            }
            page_id = next;
            pos -= body;
        }
        Ok(Some(OverflowReader {
            db: self.db,
            page_id,
            pos: pos as usize,
        }))
    }

    /// Write cursor at logical position `pos`, allocating and linking fresh
    /// pages as the position (or a later write) runs past the chain end.
    pub fn writer(&self, pos: u64) -> Result<OverflowWriter<'a>> {
        let body = self.body_size() as u64;
        let mut page_id = self.page_id;
        let mut pos = pos;
        while pos >= body {
            page_id = extend_chain(self.db, page_id)?;
            pos -= body;
        }
        Ok(OverflowWriter {
            db: self.db,
            page_id,
            pos: pos as usize,
        })
    }

    /// Releases every page of the chain starting at `first`.
    pub fn release_chain(db: &DbFile, first: u32) -> Result<()> {
        let mut page_id = first;
        while page_id != 0 {
            // Releasing overwrites the link, so read it first.
            let next = OverflowPage::open(db, page_id)?.next()?;
            db.release_page(page_id)?;
            page_id = next;
        }
        Ok(())
    }
}

/// Follows the chain link of `page_id`, allocating a new tail page if the
/// chain ends there.
fn extend_chain(db: &DbFile, page_id: u32) -> Result<u32> {
    let page = OverflowPage::open(db, page_id)?;
    let next = page.next()?;
    if next != 0 {
        return Ok(next);
    }
    let fresh = db.alloc_page()?;
    OverflowPage::create(db, fresh)?;
    page.set_next(fresh)?;
    Ok(fresh)
}

/// Auto-advancing read cursor over an overflow chain.
pub struct OverflowReader<'a> {
    db: &'a DbFile,
    page_id: u32,
    pos: usize,
}

impl OverflowReader<'_> {
    /// Reads up to `buf.len()` bytes, stopping early at the end of the chain.
    /// Returns the number of bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let body = self.db.page_size(self.page_id) - OVERFLOW_HEADER;
            if self.pos == body {
                let next = OverflowPage::open(self.db, self.page_id)?.next()?;
                if next == 0 {
                    break;
                }
                self.page_id = next;
                self.pos = 0;
                continue;
            }
            let n = (buf.len() - done).min(body - self.pos);
            let bytes = self
                .db
                .read(self.page_id, OVERFLOW_HEADER + self.pos, n)?;
            buf[done..done + n].copy_from_slice(&bytes);
            self.pos += n;
            done += n;
        }
        Ok(done)
    }

    /// Reads exactly `buf.len()` bytes or reports corruption.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = self.read(buf)?;
        if n != buf.len() {
            return Err(Error::Corrupt(format!(
                "overflow chain ended after {n} of {} bytes",
                buf.len()
            )));
        }
        Ok(())
    }
}

/// Auto-advancing write cursor over an overflow chain.
pub struct OverflowWriter<'a> {
    db: &'a DbFile,
    page_id: u32,
    pos: usize,
}

impl OverflowWriter<'_> {
    /// Writes all of `data`, growing the chain as needed.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let body = self.db.page_size(self.page_id) - OVERFLOW_HEADER;
            if self.pos == body {
                self.page_id = extend_chain(self.db, self.page_id)?;
                self.pos = 0;
                continue;
            }
            let n = (data.len() - done).min(body - self.pos);
            self.db
                .write(self.page_id, OVERFLOW_HEADER + self.pos, &data[done..done + n])?;
            self.pos += n;
            done += n;
        }
        Ok(())
    }
}
