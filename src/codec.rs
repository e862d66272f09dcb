//! Named fixed-width field layouts over a page range.
//!
//! Every on-disk structure in the engine (file header, page headers, node
//! headers) is a packed sequence of fixed-width big-endian fields. A [`Layout`]
//! names those fields and their widths; [`Fields`] binds a layout to a page of
//! an open [`DbFile`] and provides typed accessors addressed by field name.
//! Offsets are always computed from the layout, never hard-coded at call sites.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::file::DbFile;

/// One named field: a byte width at the next free offset of its layout.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub len: usize,
}

impl FieldDef {
    pub const fn new(name: &'static str, len: usize) -> Self {
        FieldDef { name, len }
    }
}

/// An ordered list of fields; field offsets are the running sum of widths.
#[derive(Debug, Clone)]
pub struct Layout {
    defs: Vec<FieldDef>,
}

impl Layout {
    pub fn new(defs: Vec<FieldDef>) -> Self {
        Layout { defs }
    }

    /// Appends a field, returning the layout for chained construction.
    pub fn with(mut self, def: FieldDef) -> Self {
        self.defs.push(def);
        self
    }

    fn find(&self, name: &str) -> Result<(usize, usize)> {
        let mut offset = 0;
        for def in &self.defs {
            if def.name == name {
                return Ok((offset, def.len));
            }
            offset += def.len;
        }
        Err(Error::InvalidArgument(format!("unknown field `{name}`")))
    }

    pub fn offset_of(&self, name: &str) -> Result<usize> {
        self.find(name).map(|(offset, _)| offset)
    }

    pub fn len_of(&self, name: &str) -> Result<usize> {
        self.find(name).map(|(_, len)| len)
    }

    /// Total byte length of all fields.
    pub fn total_len(&self) -> usize {
        self.defs.iter().map(|d| d.len).sum()
    }
}

/// A layout bound to one page of an open database file.
///
/// All reads and writes go through [`DbFile::read`] / [`DbFile::write`], so
/// field access is cache-backed and transaction-aware like any other page
/// access.
pub struct Fields<'a> {
    db: &'a DbFile,
    page_id: u32,
    layout: Layout,
}

impl<'a> Fields<'a> {
    pub fn new(db: &'a DbFile, page_id: u32, layout: Layout) -> Self {
        Fields {
            db,
            page_id,
            layout,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Raw bytes of a whole field.
    pub fn bytes(&self, name: &str) -> Result<Vec<u8>> {
        let (offset, len) = self.layout.find(name)?;
        self.db.read(self.page_id, offset, len)
    }

    /// Writes a field, zero-padding short values to the field width.
    pub fn set_bytes(&self, name: &str, value: &[u8]) -> Result<()> {
        let (offset, len) = self.layout.find(name)?;
        if value.len() > len {
            return Err(Error::ValueTooLong {
                field: name.to_string(),
                len: value.len(),
                max: len,
            });
        }
        let mut buf = vec![0u8; len];
        buf[..value.len()].copy_from_slice(value);
        self.db.write(self.page_id, offset, &buf)
    }

    pub fn get_u8(&self, name: &str) -> Result<u8> {
        let bytes = self.read_exactly(name, 1)?;
        Ok(bytes[0])
    }

    pub fn set_u8(&self, name: &str, value: u8) -> Result<()> {
        self.write_exactly(name, &[value])
    }

    pub fn get_u16(&self, name: &str) -> Result<u16> {
        let bytes = self.read_exactly(name, 2)?;
        Ok(BigEndian::read_u16(&bytes))
    }

    pub fn set_u16(&self, name: &str, value: u16) -> Result<()> {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.write_exactly(name, &buf)
    }

    pub fn get_u32(&self, name: &str) -> Result<u32> {
        let bytes = self.read_exactly(name, 4)?;
        Ok(BigEndian::read_u32(&bytes))
    }

    pub fn set_u32(&self, name: &str, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.write_exactly(name, &buf)
    }

    /// Reads entry `index` of a u32-array field.
    pub fn get_u32_at(&self, name: &str, index: usize) -> Result<u32> {
        let (offset, len) = self.array_entry(name, index)?;
        let bytes = self.db.read(self.page_id, offset, len)?;
        Ok(BigEndian::read_u32(&bytes))
    }

    /// Writes entry `index` of a u32-array field.
    pub fn set_u32_at(&self, name: &str, index: usize, value: u32) -> Result<()> {
        let (offset, _) = self.array_entry(name, index)?;
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.db.write(self.page_id, offset, &buf)
    }

    /// Reads the first `count` entries of a u32-array field.
    pub fn get_u32_prefix(&self, name: &str, count: usize) -> Result<Vec<u32>> {
        let (offset, len) = self.layout.find(name)?;
        if count * 4 > len {
            return Err(Error::InvalidArgument(format!(
                "field `{name}` holds {} entries, asked for {count}",
                len / 4
            )));
        }
        let bytes = self.db.read(self.page_id, offset, count * 4)?;
        Ok(bytes.chunks_exact(4).map(BigEndian::read_u32).collect())
    }

    /// Writes `values` over the first entries of a u32-array field.
    pub fn set_u32_prefix(&self, name: &str, values: &[u32]) -> Result<()> {
        let (offset, len) = self.layout.find(name)?;
        if values.len() * 4 > len {
            return Err(Error::InvalidArgument(format!(
                "field `{name}` holds {} entries, given {}",
                len / 4,
                values.len()
            )));
        }
        let mut buf = vec![0u8; values.len() * 4];
        for (chunk, value) in buf.chunks_exact_mut(4).zip(values) {
            BigEndian::write_u32(chunk, *value);
        }
        self.db.write(self.page_id, offset, &buf)
    }

    /// Reads a NUL-padded string field up to the first NUL byte.
    pub fn get_str(&self, name: &str) -> Result<String> {
        let bytes = self.bytes(name)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8(bytes[..end].to_vec())
            .map_err(|_| Error::Corrupt(format!("field `{name}` is not valid UTF-8")))
    }

    pub fn set_str(&self, name: &str, value: &str) -> Result<()> {
        self.set_bytes(name, value.as_bytes())
    }

    fn read_exactly(&self, name: &str, len: usize) -> Result<Vec<u8>> {
        let (offset, field_len) = self.layout.find(name)?;
        if field_len != len {
            return Err(Error::InvalidArgument(format!(
                "field `{name}` is {field_len} bytes, accessed as {len}"
            )));
        }
        self.db.read(self.page_id, offset, len)
    }

    fn write_exactly(&self, name: &str, value: &[u8]) -> Result<()> {
        let (offset, field_len) = self.layout.find(name)?;
        if field_len != value.len() {
            return Err(Error::InvalidArgument(format!(
                "field `{name}` is {field_len} bytes, accessed as {}",
                value.len()
            )));
        }
        self.db.write(self.page_id, offset, value)
    }

    fn array_entry(&self, name: &str, index: usize) -> Result<(usize, usize)> {
        let (offset, len) = self.layout.find(name)?;
        if (index + 1) * 4 > len {
            return Err(Error::InvalidArgument(format!(
                "index {index} out of range for field `{name}` ({} entries)",
                len / 4
            )));
        }
        Ok((offset + index * 4, 4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    fn test_layout() -> Layout {
        Layout::new(vec![
            FieldDef::new("tag", 1),
            FieldDef::new("count", 4),
            FieldDef::new("name", 8),
            FieldDef::new("slots", 12),
        ])
    }

    #[test]
    fn test_offsets() -> Result<()> {
        let layout = test_layout();
        assert_eq!(layout.offset_of("tag")?, 0);
        assert_eq!(layout.offset_of("count")?, 1);
        assert_eq!(layout.offset_of("name")?, 5);
        assert_eq!(layout.offset_of("slots")?, 13);
        assert_eq!(layout.total_len(), 25);
        assert!(layout.offset_of("missing").is_err());
        Ok(())
    }

    #[test]
    fn test_field_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let page = db.alloc_page()?;
        let fields = Fields::new(&db, page, test_layout());

        fields.set_u8("tag", 7)?;
        fields.set_u32("count", 0xDEAD_BEEF)?;
        fields.set_str("name", "hello")?;

        assert_eq!(fields.get_u8("tag")?, 7);
        assert_eq!(fields.get_u32("count")?, 0xDEAD_BEEF);
        assert_eq!(fields.get_str("name")?, "hello");
        Ok(())
    }

    #[test]
    fn test_big_endian_on_disk() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let page = db.alloc_page()?;
        let fields = Fields::new(&db, page, test_layout());

        fields.set_u32("count", 0x0102_0304)?;
        let raw = db.read(page, 1, 4)?;
        assert_eq!(raw, vec![1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_string_padding() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let page = db.alloc_page()?;
        let fields = Fields::new(&db, page, test_layout());

        fields.set_str("name", "ab")?;
        let raw = fields.bytes("name")?;
        assert_eq!(&raw, b"ab\0\0\0\0\0\0");
        assert_eq!(fields.get_str("name")?, "ab");

        // Too-long values are rejected, not truncated.
        assert!(fields.set_str("name", "unreasonably long").is_err());
        Ok(())
    }

    #[test]
    fn test_u32_array_entries() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let page = db.alloc_page()?;
        let fields = Fields::new(&db, page, test_layout());

        fields.set_u32_prefix("slots", &[10, 20])?;
        fields.set_u32_at("slots", 2, 30)?;
        assert_eq!(fields.get_u32_prefix("slots", 3)?, vec![10, 20, 30]);
        assert_eq!(fields.get_u32_at("slots", 1)?, 20);
        assert!(fields.get_u32_at("slots", 3).is_err());
        Ok(())
    }
}
