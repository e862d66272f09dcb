//! The database file: header, page allocation, and read/write routing.

use std::cell::{Cell, RefCell};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};

use crate::cache::{read_window, LruCache, PageCache, PassthroughCache};
use crate::codec::{FieldDef, Fields, Layout};
use crate::error::{Error, Result};
use crate::page::FreePage;
use crate::schema::Schema;
use crate::txn::{self, Txn, TxnState};

/// Size of the header region at the start of the file, addressed as page 0.
pub const HEADER_SIZE: usize = 128;

/// Magic string at offset 0 of every database file.
pub const MAGIC: &str = "leafdb format 1";

/// On-disk format version written to (and required in) the header.
pub const FORMAT_VERSION: u16 = 1;

/// Default page size exponent: pages of 2^12 = 4096 bytes.
pub const DEFAULT_PAGE_SIZE_EXP: u8 = 12;

/// Default LRU cache capacity in pages.
pub const DEFAULT_CACHE_CAPACITY: u32 = 128;

/// Layout of the fixed file header. Everything after these fields up to
/// [`HEADER_SIZE`] is reserved and zero.
pub(crate) fn header_layout() -> Layout {
    Layout::new(vec![
        FieldDef::new("file_id", 32),
        FieldDef::new("ver", 2),
        FieldDef::new("page_size", 1),
        FieldDef::new("page_count", 4),
        FieldDef::new("freelist_head", 4),
        FieldDef::new("freelist_count", 4),
        FieldDef::new("cache_count", 4),
        FieldDef::new("schema_page", 4),
    ])
}

/// Page addressing for one file: page 0 is the [`HEADER_SIZE`]-byte header
/// region, data pages follow back to back.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub page_size: usize,
}

impl Geometry {
    pub fn page_offset(&self, page_id: u32) -> u64 {
        if page_id == 0 {
            0
        } else {
            HEADER_SIZE as u64 + (page_id as u64 - 1) * self.page_size as u64
        }
    }

    pub fn size_of(&self, page_id: u32) -> usize {
        if page_id == 0 {
            HEADER_SIZE
        } else {
            self.page_size
        }
    }
}

/// An open database file.
///
/// All mutable state (cache, open transaction, read-only flag) lives behind
/// interior mutability, so every view over the file — pages, nodes, trees,
/// cursors — borrows `&DbFile` and methods take `&self`. The engine is
/// single-threaded; nothing here is `Sync`.
pub struct DbFile {
    path: PathBuf,
    geom: Geometry,
    cache: RefCell<Box<dyn PageCache>>,
    txn: RefCell<Option<Rc<TxnState>>>,
    readonly: Cell<bool>,
}

impl DbFile {
    /// Creates a new database file with default page size and cache capacity.
    pub fn create(path: &Path) -> Result<DbFile> {
        Self::create_with(path, DEFAULT_PAGE_SIZE_EXP, DEFAULT_CACHE_CAPACITY)
    }

    /// Creates a new database file with pages of `2^page_size_exp` bytes and
    /// an LRU cache of `cache_capacity` pages. Truncates any existing file.
    pub fn create_with(path: &Path, page_size_exp: u8, cache_capacity: u32) -> Result<DbFile> {
        if !(7..=24).contains(&page_size_exp) {
            return Err(Error::InvalidArgument(format!(
                "page size exponent {page_size_exp} out of range (7..=24)"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let geom = Geometry {
            page_size: 1usize << page_size_exp,
        };
        let db = DbFile {
            path: path.to_path_buf(),
            geom,
            cache: RefCell::new(Box::new(PassthroughCache::new(file, geom))),
            txn: RefCell::new(None),
            readonly: Cell::new(false),
        };

        let header = db.header();
        header.set_str("file_id", MAGIC)?;
        header.set_u16("ver", FORMAT_VERSION)?;
        header.set_u8("page_size", page_size_exp)?;
        header.set_u32("page_count", 1)?;
        header.set_u32("freelist_head", 0)?;
        header.set_u32("freelist_count", 0)?;
        header.set_u32("cache_count", cache_capacity)?;
        header.set_u32("schema_page", 0)?;

        db.use_lru_cache()?;
        Schema::bootstrap(&db)?;
        log::debug!("created {:?} (page size {})", db.path, geom.page_size);
        Ok(db)
    }

    /// Opens an existing database file, running crash recovery first when a
    /// leftover write-ahead file is found next to it.
    pub fn open(path: &Path) -> Result<DbFile> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; HEADER_SIZE];
        read_window(&mut file, 0, &mut header)?;
        let layout = header_layout();
        let magic = &header[..MAGIC.len()];
        if magic != MAGIC.as_bytes() {
            return Err(Error::Corrupt(format!("{path:?} is not a database file")));
        }
        let ver = BigEndian::read_u16(&header[layout.offset_of("ver")?..]);
        if ver != FORMAT_VERSION {
            return Err(Error::Corrupt(format!("unsupported format version {ver}")));
        }
        let page_size_exp = header[layout.offset_of("page_size")?];
        if !(7..=24).contains(&page_size_exp) {
            return Err(Error::Corrupt(format!(
                "header page size exponent {page_size_exp} out of range"
            )));
        }

        let geom = Geometry {
            page_size: 1usize << page_size_exp,
        };
        let db = DbFile {
            path: path.to_path_buf(),
            geom,
            cache: RefCell::new(Box::new(PassthroughCache::new(file, geom))),
            txn: RefCell::new(None),
            readonly: Cell::new(false),
        };

        if wal_path(path).exists() {
            txn::recover(&db)?;
        }
        db.use_lru_cache()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geom(&self) -> Geometry {
        self.geom
    }

    /// Byte size of a page (the header region for page 0).
    pub fn page_size(&self, page_id: u32) -> usize {
        self.geom.size_of(page_id)
    }

    /// Header fields, addressed as page 0.
    pub fn header(&self) -> Fields<'_> {
        Fields::new(self, 0, header_layout())
    }

    /// Reads `len` bytes at `pos` within a page. Routed through the open
    /// transaction's shadow pages when one exists.
    pub fn read(&self, page_id: u32, pos: usize, len: usize) -> Result<Vec<u8>> {
        match self.txn_state() {
            Some(txn) => txn.read(self, page_id, pos, len),
            None => self.cache_read(page_id, pos, len),
        }
    }

    /// Writes bytes at `pos` within a page, via the transaction when open.
    pub fn write(&self, page_id: u32, pos: usize, data: &[u8]) -> Result<()> {
        if self.readonly.get() {
            return Err(Error::ReadOnly);
        }
        match self.txn_state() {
            Some(txn) => txn.write(self, page_id, pos, data),
            None => self.cache_write(page_id, pos, data),
        }
    }

    /// Cache-level read, bypassing any open transaction.
    pub(crate) fn cache_read(&self, page_id: u32, pos: usize, len: usize) -> Result<Vec<u8>> {
        self.cache.borrow_mut().read(page_id, pos, len)
    }

    /// Cache-level write, bypassing any open transaction.
    pub(crate) fn cache_write(&self, page_id: u32, pos: usize, data: &[u8]) -> Result<()> {
        self.cache.borrow_mut().write(page_id, pos, data)
    }

    /// Allocates a page: pops the free list if non-empty, otherwise extends
    /// the file. The page is returned zero-filled either way.
    pub fn alloc_page(&self) -> Result<u32> {
        let header = self.header();
        let head = header.get_u32("freelist_head")?;
        if head != 0 {
            let next = FreePage::open(self, head)?.next_free()?;
            let count = header.get_u32("freelist_count")?;
            self.write(head, 0, &vec![0u8; self.geom.size_of(head)])?;
            header.set_u32("freelist_head", next)?;
            header.set_u32(
                "freelist_count",
                count
                    .checked_sub(1)
                    .ok_or_else(|| Error::Corrupt("freelist count underflow".into()))?,
            )?;
            log::trace!("allocated page {head} from free list");
            return Ok(head);
        }

        let page_id = header.get_u32("page_count")?;
        if let Some(txn) = self.txn_state() {
            txn.begin_new_page(self, page_id)?;
        }
        self.write(page_id, 0, &vec![0u8; self.geom.size_of(page_id)])?;
        header.set_u32("page_count", page_id + 1)?;
        log::trace!("allocated page {page_id} by extending the file");
        Ok(page_id)
    }

    /// Returns a page to the free list. Only the free-page header is written;
    /// the body keeps its old bytes.
    pub fn release_page(&self, page_id: u32) -> Result<()> {
        if page_id == 0 {
            return Err(Error::InvalidArgument("cannot release page 0".into()));
        }
        let header = self.header();
        let head = header.get_u32("freelist_head")?;
        let count = header.get_u32("freelist_count")?;
        FreePage::create(self, page_id, head)?;
        header.set_u32("freelist_head", page_id)?;
        header.set_u32("freelist_count", count + 1)?;
        log::trace!("released page {page_id}");
        Ok(())
    }

    /// Replaces the active cache, flushing the old one first.
    pub fn set_cache(&self, cache: Box<dyn PageCache>) -> Result<()> {
        let mut slot = self.cache.borrow_mut();
        slot.sync()?;
        *slot = cache;
        Ok(())
    }

    /// Installs an LRU cache sized from the header's `cache_count` field.
    pub fn use_lru_cache(&self) -> Result<()> {
        let capacity = self.header().get_u32("cache_count")? as usize;
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.set_cache(Box::new(LruCache::new(file, self.geom, capacity)))
    }

    /// Flushes the cache and makes all acknowledged writes durable.
    pub fn sync(&self) -> Result<()> {
        self.cache.borrow_mut().sync()
    }

    /// Syncs and drops the handle.
    pub fn close(self) -> Result<()> {
        self.sync()
    }

    /// Opens the schema table of this file.
    pub fn schema(&self) -> Result<Schema<'_>> {
        Schema::open(self)
    }

    /// Starts a transaction. Fails if one is already open on this handle or
    /// an unrecovered write-ahead file exists on disk.
    pub fn begin_transaction(&self) -> Result<Txn<'_>> {
        Txn::begin(self)
    }

    pub(crate) fn txn_state(&self) -> Option<Rc<TxnState>> {
        self.txn.borrow().clone()
    }

    pub(crate) fn install_txn(&self, state: Rc<TxnState>) {
        *self.txn.borrow_mut() = Some(state);
    }

    pub(crate) fn take_txn(&self) -> Option<Rc<TxnState>> {
        self.txn.borrow_mut().take()
    }

    pub(crate) fn set_readonly(&self, readonly: bool) {
        self.readonly.set(readonly);
    }
}

impl Drop for DbFile {
    fn drop(&mut self) {
        if let Err(e) = self.cache.borrow_mut().sync() {
            log::warn!("flush on close failed for {:?}: {e}", self.path);
        }
    }
}

/// Path of the write-ahead sibling file: the primary path plus `.wal`.
pub(crate) fn wal_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".wal");
    PathBuf::from(os)
}
