//! Shadow-paging transactions backed by a write-ahead sibling file.
//!
//! While a transaction is open, every page write is redirected into a
//! sibling database file at `<path>.wal`. The first touch of a page copies
//! its current bytes into two WAL pages, a pre-image and a post-image; all
//! further writes land on the post-image, and reads of a touched page come
//! from it. The primary file is never modified before commit, so rollback
//! is just deleting the WAL.
//!
//! Commit flags the WAL header `COMMITTING` and syncs it: that sync is the
//! durability point. Post-images are then copied back into the primary
//! file, the primary is synced, and the WAL is deleted. Opening a database
//! that still has a WAL next to it replays a flagged WAL (the crash hit
//! after the durability point) or discards an unflagged one.

use std::path::PathBuf;
use std::rc::Rc;

use crate::btree::payload::{FieldType, Payload, Value};
use crate::codec::{FieldDef, Fields, Layout};
use crate::error::{Error, Result};
use crate::file::{header_layout, wal_path, DbFile};
use crate::schema::Table;

/// WAL state field values: the default zero means "discard on recovery".
pub(crate) const W_ROLLBACK: u32 = 0;
pub(crate) const W_COMMITTING: u32 = 1;

/// Name of the page-image table inside the WAL file.
const RECORDS_TABLE: &str = "records";

/// The WAL file header: the common header plus the commit-state word.
pub(crate) fn wal_layout() -> Layout {
    header_layout().with(FieldDef::new("w_state", 4))
}

/// Live state of an open transaction, shared between the guard and the
/// owning [`DbFile`].
pub(crate) struct TxnState {
    wal: DbFile,
    wal_path: PathBuf,
}

impl TxnState {
    /// Page-image table: primary page id -> (pre-image page, post-image
    /// page), all ids in the WAL file.
    fn records(&self) -> Result<Table<'_>> {
        self.wal
            .schema()?
            .table(RECORDS_TABLE)?
            .ok_or_else(|| Error::Corrupt("write-ahead file has no records table".into()))
    }

    fn record(&self, page_id: u32) -> Result<Option<(u32, u32)>> {
        let key = record_key(page_id)?;
        match self.records()?.get(&key)? {
            Some(value) => {
                let pre = record_page(&value, 0)?;
                let post = record_page(&value, 1)?;
                Ok(Some((pre, post)))
            }
            None => Ok(None),
        }
    }

    /// Returns the page's shadow pair, capturing the current primary bytes
    /// into fresh pre- and post-image pages on first touch.
    fn ensure_record(&self, db: &DbFile, page_id: u32) -> Result<(u32, u32)> {
        if let Some(pair) = self.record(page_id)? {
            return Ok(pair);
        }
        let pre = self.wal.alloc_page()?;
        let post = self.wal.alloc_page()?;
        let image = db.cache_read(page_id, 0, db.page_size(page_id))?;
        self.wal.write(pre, 0, &image)?;
        self.wal.write(post, 0, &image)?;
        self.records()?.insert(
            &record_key(page_id)?,
            &Payload::from_values(
                &[FieldType::Int, FieldType::Int],
                &[Value::Int(pre as i32), Value::Int(post as i32)],
            )?,
        )?;
        log::trace!("shadowing page {page_id} (pre {pre}, post {post})");
        Ok((pre, post))
    }

    fn check_bounds(db: &DbFile, page_id: u32, pos: usize, len: usize) -> Result<()> {
        if pos + len > db.page_size(page_id) {
            return Err(Error::Corrupt(format!(
                "access past the end of page {page_id} ({pos}+{len})"
            )));
        }
        Ok(())
    }

    pub(crate) fn read(
        &self,
        db: &DbFile,
        page_id: u32,
        pos: usize,
        len: usize,
    ) -> Result<Vec<u8>> {
        Self::check_bounds(db, page_id, pos, len)?;
        match self.record(page_id)? {
            Some((_, post)) => self.wal.read(post, pos, len),
            None => db.cache_read(page_id, pos, len),
        }
    }

    pub(crate) fn write(&self, db: &DbFile, page_id: u32, pos: usize, data: &[u8]) -> Result<()> {
        Self::check_bounds(db, page_id, pos, data.len())?;
        let (_, post) = self.ensure_record(db, page_id)?;
        self.wal.write(post, pos, data)
    }

    /// Called when the file is about to grow by one page, so the new page is
    /// shadowed from its (all-zero) initial state like any other.
    pub(crate) fn begin_new_page(&self, db: &DbFile, page_id: u32) -> Result<()> {
        self.ensure_record(db, page_id)?;
        Ok(())
    }

    fn commit(self, db: &DbFile) -> Result<()> {
        Fields::new(&self.wal, 0, wal_layout()).set_u32("w_state", W_COMMITTING)?;
        self.wal.set_readonly(true);
        // Once this sync returns, the transaction is durable: recovery will
        // finish the write-back if we lose power below.
        self.wal.sync()?;
        write_back(db, &self.wal)?;
        db.sync()?;
        let path = self.wal_path.clone();
        drop(self.wal);
        std::fs::remove_file(&path)?;
        log::debug!("committed transaction on {:?}", db.path());
        Ok(())
    }

    fn rollback(self, db: &DbFile) -> Result<()> {
        let path = self.wal_path.clone();
        drop(self.wal);
        std::fs::remove_file(&path)?;
        log::debug!("rolled back transaction on {:?}", db.path());
        Ok(())
    }
}

fn record_key(page_id: u32) -> Result<Payload> {
    Payload::from_values(&[FieldType::Int], &[Value::Int(page_id as i32)])
}

fn record_page(value: &Payload, index: usize) -> Result<u32> {
    match value.get(index)? {
        Value::Int(v) => Ok(v as u32),
        other => Err(Error::Corrupt(format!(
            "records table holds a {} where a page id belongs",
            other.type_name()
        ))),
    }
}

/// Copies every post-image in the WAL back onto its primary page.
fn write_back(db: &DbFile, wal: &DbFile) -> Result<()> {
    let records = wal
        .schema()?
        .table(RECORDS_TABLE)?
        .ok_or_else(|| Error::Corrupt("write-ahead file has no records table".into()))?;
    for entry in records.iter()? {
        let (key, value) = entry?;
        let page_id = record_page(&key, 0)?;
        let post = record_page(&value, 1)?;
        let image = wal.read(post, 0, db.page_size(page_id))?;
        db.cache_write(page_id, 0, &image)?;
    }
    Ok(())
}

/// Finishes or discards a leftover WAL found while opening `db`.
pub(crate) fn recover(db: &DbFile) -> Result<()> {
    let path = wal_path(db.path());
    let wal = match DbFile::open(&path) {
        Ok(wal) => wal,
        Err(e) => {
            // A WAL that cannot even be opened died before its first sync;
            // nothing in it can have been acknowledged.
            log::warn!("discarding unreadable write-ahead file {path:?}: {e}");
            std::fs::remove_file(&path)?;
            return Ok(());
        }
    };

    let state = Fields::new(&wal, 0, wal_layout()).get_u32("w_state")?;
    if state == W_COMMITTING {
        log::info!("replaying committed write-ahead file {path:?}");
        write_back(db, &wal)?;
        db.sync()?;
    } else {
        log::info!("discarding uncommitted write-ahead file {path:?}");
    }
    drop(wal);
    std::fs::remove_file(&path)?;
    Ok(())
}

/// An open transaction. Dropping the guard rolls back unless
/// [`Txn::commit_on_close`] was called first.
pub struct Txn<'a> {
    db: &'a DbFile,
    done: bool,
    commit_on_close: bool,
}

impl<'a> Txn<'a> {
    pub(crate) fn begin(db: &'a DbFile) -> Result<Txn<'a>> {
        if db.txn_state().is_some() {
            return Err(Error::TransactionActive);
        }
        let path = wal_path(db.path());
        if path.exists() {
            return Err(Error::WalExists(path));
        }

        // The WAL mirrors the primary's page size so images copy one to one.
        let page_size_exp = db.header().get_u8("page_size")?;
        let cache_capacity = db.header().get_u32("cache_count")?;
        let wal = DbFile::create_with(&path, page_size_exp, cache_capacity)?;
        Fields::new(&wal, 0, wal_layout()).set_u32("w_state", W_ROLLBACK)?;
        wal.schema()?.create_table(
            RECORDS_TABLE,
            &[FieldType::Int],
            &[FieldType::Int, FieldType::Int],
        )?;

        db.install_txn(Rc::new(TxnState {
            wal,
            wal_path: path,
        }));
        log::debug!("began transaction on {:?}", db.path());
        Ok(Txn {
            db,
            done: false,
            commit_on_close: false,
        })
    }

    /// Makes the guard commit instead of roll back when dropped.
    pub fn commit_on_close(&mut self) {
        self.commit_on_close = true;
    }

    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.finish(true)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.done = true;
        self.finish(false)
    }

    fn finish(&mut self, commit: bool) -> Result<()> {
        let state = self
            .db
            .take_txn()
            .ok_or_else(|| Error::Corrupt("no transaction to finish".into()))?;
        let state = Rc::try_unwrap(state)
            .map_err(|_| Error::Corrupt("transaction state still shared".into()))?;
        if commit {
            state.commit(self.db)
        } else {
            state.rollback(self.db)
        }
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let commit = self.commit_on_close;
        if let Err(e) = self.finish(commit) {
            log::warn!("closing transaction on {:?} failed: {e}", self.db.path());
        }
    }
}
