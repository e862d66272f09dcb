//! Fixed-size value heap stored on an overflow chain.
//!
//! Each leaf owns one of these: value payloads live in equal-sized units
//! addressed by unit id, allocated off a free list threaded through the
//! units themselves. Unit bytes are addressed through the chain's logical
//! stream, so a unit may straddle page boundaries.

use crate::codec::{FieldDef, Fields, Layout};
use crate::error::{Error, Result};
use crate::file::DbFile;
use crate::overflow::{OverflowPage, OVERFLOW_HEADER};

use super::payload::{FieldType, Payload};
use super::NO_ID;

/// A unit is never smaller than the free-list pointer it must be able to
/// hold.
const MIN_UNIT_SIZE: usize = 4;

fn storage_layout(value_count: usize) -> Layout {
    Layout::new(vec![
        FieldDef::new("type", 1),
        FieldDef::new("next", 4),
        FieldDef::new("unit_size", 4),
        FieldDef::new("unit_count", 4),
        FieldDef::new("free_unit", 4),
        FieldDef::new("value_count", 4),
        FieldDef::new("value_types", 4 * value_count),
    ])
}

pub(crate) struct CellStorage<'a> {
    db: &'a DbFile,
    root_page: u32,
    unit_size: usize,
    value_types: Vec<FieldType>,
    /// Logical stream offset of unit 0: the extension header minus the
    /// per-page overflow header the stream already skips.
    data_start: u64,
}

impl<'a> CellStorage<'a> {
    /// Writes the extension header onto an existing overflow chain head.
    pub fn create(
        db: &'a DbFile,
        root_page: u32,
        value_types: &[FieldType],
    ) -> Result<CellStorage<'a>> {
        OverflowPage::open(db, root_page)?;
        let layout = storage_layout(value_types.len());
        if layout.total_len() > db.page_size(root_page) {
            return Err(Error::InvalidArgument(format!(
                "{} value columns do not fit a {}-byte page",
                value_types.len(),
                db.page_size(root_page)
            )));
        }
        let fields = Fields::new(db, root_page, layout.clone());
        let unit_size = Payload::size_of(value_types).max(MIN_UNIT_SIZE);
        fields.set_u32("unit_size", unit_size as u32)?;
        fields.set_u32("unit_count", 0)?;
        fields.set_u32("free_unit", NO_ID)?;
        fields.set_u32("value_count", value_types.len() as u32)?;
        fields.set_u32_prefix(
            "value_types",
            &value_types.iter().map(|t| t.code()).collect::<Vec<_>>(),
        )?;

        Ok(CellStorage {
            db,
            root_page,
            unit_size,
            value_types: value_types.to_vec(),
            data_start: (layout.total_len() - OVERFLOW_HEADER) as u64,
        })
    }

    pub fn open(db: &'a DbFile, root_page: u32) -> Result<CellStorage<'a>> {
        OverflowPage::open(db, root_page)?;
        let prefix = Fields::new(db, root_page, storage_layout(0));
        let value_count = prefix.get_u32("value_count")? as usize;
        let layout = storage_layout(value_count);
        if layout.total_len() > db.page_size(root_page) {
            return Err(Error::Corrupt(format!(
                "value heap on page {root_page} declares {value_count} columns"
            )));
        }
        let fields = Fields::new(db, root_page, layout.clone());
        let value_types = fields
            .get_u32_prefix("value_types", value_count)?
            .into_iter()
            .map(FieldType::from_code)
            .collect::<Result<Vec<_>>>()?;
        let unit_size = fields.get_u32("unit_size")? as usize;
        if unit_size != Payload::size_of(&value_types).max(MIN_UNIT_SIZE) {
            return Err(Error::Corrupt(format!(
                "value heap on page {root_page} has unit size {unit_size}, columns need {}",
                Payload::size_of(&value_types).max(MIN_UNIT_SIZE)
            )));
        }

        Ok(CellStorage {
            db,
            root_page,
            unit_size,
            value_types,
            data_start: (layout.total_len() - OVERFLOW_HEADER) as u64,
        })
    }

    pub fn root_page(&self) -> u32 {
        self.root_page
    }

    pub fn value_types(&self) -> &[FieldType] {
        &self.value_types
    }

    fn fields(&self) -> Fields<'a> {
        Fields::new(
            self.db,
            self.root_page,
            storage_layout(self.value_types.len()),
        )
    }

    fn unit_pos(&self, unit: u32) -> u64 {
        self.data_start + unit as u64 * self.unit_size as u64
    }

    fn check_unit(&self, unit: u32) -> Result<()> {
        let count = self.fields().get_u32("unit_count")?;
        if unit >= count {
            return Err(Error::Corrupt(format!(
                "unit {unit} out of range on value heap {} ({count} units)",
                self.root_page
            )));
        }
        Ok(())
    }

    fn read_at(&self, unit: u32, buf: &mut [u8]) -> Result<()> {
        let chain = OverflowPage::open(self.db, self.root_page)?;
        let mut reader = chain.reader(self.unit_pos(unit))?.ok_or_else(|| {
            Error::Corrupt(format!(
                "value heap {} chain ends before unit {unit}",
                self.root_page
            ))
        })?;
        reader.read_exact(buf)
    }

    fn write_at(&self, unit: u32, data: &[u8]) -> Result<()> {
        let chain = OverflowPage::open(self.db, self.root_page)?;
        chain.writer(self.unit_pos(unit))?.write_all(data)
    }

    /// Pops the unit free list, or appends a fresh unit (growing the chain).
    /// The unit comes back zero-filled.
    pub fn allocate_unit(&self) -> Result<u32> {
        let fields = self.fields();
        let head = fields.get_u32("free_unit")?;
        if head != NO_ID {
            let mut next = [0u8; 4];
            self.read_at(head, &mut next)?;
            fields.set_u32("free_unit", u32::from_be_bytes(next))?;
            self.write_at(head, &vec![0u8; self.unit_size])?;
            return Ok(head);
        }

        let count = fields.get_u32("unit_count")?;
        self.write_at(count, &vec![0u8; self.unit_size])?;
        fields.set_u32("unit_count", count + 1)?;
        Ok(count)
    }

    /// Pushes a unit onto the free list; its first bytes become the link.
    pub fn release_unit(&self, unit: u32) -> Result<()> {
        self.check_unit(unit)?;
        let fields = self.fields();
        let head = fields.get_u32("free_unit")?;
        self.write_at(unit, &head.to_be_bytes())?;
        fields.set_u32("free_unit", unit)
    }

    pub fn read_unit(&self, unit: u32) -> Result<Payload> {
        self.check_unit(unit)?;
        let mut buf = vec![0u8; Payload::size_of(&self.value_types)];
        self.read_at(unit, &mut buf)?;
        Payload::new(self.value_types.clone(), buf)
    }

    pub fn write_unit(&self, unit: u32, value: &Payload) -> Result<()> {
        self.check_unit(unit)?;
        if !Payload::compatible(value.types(), &self.value_types)
            || value.size() != Payload::size_of(&self.value_types)
        {
            return Err(Error::TypeMismatch {
                expected: types_str(&self.value_types),
                actual: types_str(value.types()),
            });
        }
        self.write_at(unit, value.data())
    }
}

fn types_str(types: &[FieldType]) -> String {
    types
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::payload::Value;
    use anyhow::Result;
    use tempfile::tempdir;

    fn storage_on_fresh_chain<'a>(
        db: &'a DbFile,
        types: &[FieldType],
    ) -> Result<CellStorage<'a>> {
        let page = db.alloc_page()?;
        OverflowPage::create(db, page)?;
        Ok(CellStorage::create(db, page, types)?)
    }

    #[test]
    fn test_unit_size_floor() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        // A lone INT column needs 5 bytes, above the floor.
        let storage = storage_on_fresh_chain(&db, &[FieldType::Int])?;
        assert_eq!(storage.unit_size, 5);
        // No columns at all: the unit still holds a free-list pointer.
        let storage = storage_on_fresh_chain(&db, &[])?;
        assert_eq!(storage.unit_size, 4);
        Ok(())
    }

    #[test]
    fn test_value_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let types = [FieldType::Int, FieldType::Str(8)];
        let storage = storage_on_fresh_chain(&db, &types)?;

        let unit = storage.allocate_unit()?;
        let value = Payload::from_values(&types, &[Value::Int(7), Value::Str("hi".into())])?;
        storage.write_unit(unit, &value)?;

        let reopened = CellStorage::open(&db, storage.root_page())?;
        let back = reopened.read_unit(unit)?;
        assert_eq!(back.get(0)?, Value::Int(7));
        assert_eq!(back.get(1)?, Value::Str("hi".into()));
        Ok(())
    }

    #[test]
    fn test_free_list_reuse() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let storage = storage_on_fresh_chain(&db, &[FieldType::Long])?;

        let a = storage.allocate_unit()?;
        let b = storage.allocate_unit()?;
        let c = storage.allocate_unit()?;
        assert_eq!((a, b, c), (0, 1, 2));

        storage.release_unit(a)?;
        storage.release_unit(c)?;
        assert_eq!(storage.allocate_unit()?, c);
        assert_eq!(storage.allocate_unit()?, a);
        // Reused units are zeroed, not left holding stale links.
        assert_eq!(storage.read_unit(a)?.get(0)?, Value::Long(0));
        Ok(())
    }

    #[test]
    fn test_units_straddle_pages() -> Result<()> {
        let dir = tempdir()?;
        // 128-byte pages and 33-byte units: unit boundaries fall mid-page.
        let db = DbFile::create_with(&dir.path().join("test.db"), 7, 16)?;
        let types = [FieldType::Str(32)];
        let storage = storage_on_fresh_chain(&db, &types)?;

        let mut units = Vec::new();
        for i in 0..20 {
            let unit = storage.allocate_unit()?;
            let value = Payload::from_values(&types, &[Value::Str(format!("value-{i}"))])?;
            storage.write_unit(unit, &value)?;
            units.push(unit);
        }
        for (i, unit) in units.iter().enumerate() {
            let value = storage.read_unit(*unit)?;
            assert_eq!(value.get(0)?.as_str(), Some(format!("value-{i}").as_str()));
        }
        Ok(())
    }

    #[test]
    fn test_type_checked_writes() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let storage = storage_on_fresh_chain(&db, &[FieldType::Int])?;

        let unit = storage.allocate_unit()?;
        let wrong = Payload::from_values(&[FieldType::Long], &[Value::Long(1)])?;
        assert!(matches!(
            storage.write_unit(unit, &wrong),
            Err(Error::TypeMismatch { .. })
        ));
        Ok(())
    }
}
