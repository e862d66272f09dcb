//! Page type tags and the free-page view.

use crate::codec::{FieldDef, Fields, Layout};
use crate::error::{Error, Result};
use crate::file::DbFile;

/// First byte of every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Null = 0,
    Free = 1,
    Overflow = 2,
    BTreeNull = 3,
    BTreeInterior = 4,
    BTreeLeaf = 5,
}

impl PageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageType::Null),
            1 => Ok(PageType::Free),
            2 => Ok(PageType::Overflow),
            3 => Ok(PageType::BTreeNull),
            4 => Ok(PageType::BTreeInterior),
            5 => Ok(PageType::BTreeLeaf),
            other => Err(Error::Corrupt(format!("unknown page type {other}"))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Reads the type tag of a page.
pub fn page_type(db: &DbFile, page_id: u32) -> Result<PageType> {
    let bytes = db.read(page_id, 0, 1)?;
    PageType::from_u8(bytes[0])
}

fn free_page_layout() -> Layout {
    Layout::new(vec![FieldDef::new("type", 1), FieldDef::new("next_free", 4)])
}

/// View over a page on the file's free list.
///
/// Only the 5-byte header is meaningful; the rest of the page keeps whatever
/// bytes it held before release.
pub struct FreePage<'a> {
    fields: Fields<'a>,
}

impl<'a> FreePage<'a> {
    pub fn open(db: &'a DbFile, page_id: u32) -> Result<Self> {
        let fields = Fields::new(db, page_id, free_page_layout());
        if fields.get_u8("type")? != PageType::Free.as_u8() {
            return Err(Error::Corrupt(format!(
                "page {page_id} is on the free list but not tagged FREE"
            )));
        }
        Ok(FreePage { fields })
    }

    /// Tags a page as free, pointing at the previous list head.
    pub fn create(db: &'a DbFile, page_id: u32, next_free: u32) -> Result<Self> {
        let fields = Fields::new(db, page_id, free_page_layout());
        fields.set_u8("type", PageType::Free.as_u8())?;
        fields.set_u32("next_free", next_free)?;
        Ok(FreePage { fields })
    }

    pub fn next_free(&self) -> Result<u32> {
        self.fields.get_u32("next_free")
    }
}
