//! Common node machinery: header, slot directory, and the per-node cell heap.
//!
//! A node page is `[header | slot directory | cell area]`. The slot directory
//! is the sorted view (slot i → cell id of the i-th smallest key); cells are
//! allocated anywhere in the cell area and recycled through a per-node free
//! list threaded by cell id.

use byteorder::{BigEndian, ByteOrder};

use super::cell::{cell_size, Cell, CellType};
use super::payload::{FieldType, Payload};
use super::NO_ID;
use crate::codec::{FieldDef, Fields, Layout};
use crate::error::{Error, Result};
use crate::file::DbFile;
use crate::page::PageType;

/// A node must be able to hold at least this many keys, or its page size and
/// key width are rejected at creation.
pub(crate) const MIN_SLOTS: usize = 3;

/// Header fields common to both node kinds, plus the three role-specific
/// slots named for the given kind.
fn fixed_layout(page_type: PageType) -> Layout {
    let roles: [&'static str; 3] = match page_type {
        PageType::BTreeInterior => ["total", "tail_child", "reserved"],
        _ => ["overflow_page", "left_sibling", "right_sibling"],
    };
    Layout::new(vec![
        FieldDef::new("type", 1),
        FieldDef::new("hdr_size", 4),
        FieldDef::new("father", 4),
        FieldDef::new("cell_size", 4),
        FieldDef::new("cell_count", 4),
        FieldDef::new("free_cell", 4),
        FieldDef::new("key_count", 4),
        FieldDef::new("value_count", 4),
        FieldDef::new(roles[0], 4),
        FieldDef::new(roles[1], 4),
        FieldDef::new(roles[2], 4),
    ])
}

fn node_layout(
    page_type: PageType,
    key_count: usize,
    value_count: usize,
    slot_capacity: usize,
) -> Layout {
    fixed_layout(page_type)
        .with(FieldDef::new("key_types", 4 * key_count))
        .with(FieldDef::new("value_types", 4 * value_count))
        .with(FieldDef::new("slot_capacity", 4))
        .with(FieldDef::new("slot_count", 4))
        .with(FieldDef::new("slots", 4 * slot_capacity))
}

/// Slots a node with these columns gets on a `page_size`-byte page.
pub(crate) fn slot_capacity_for(
    page_size: usize,
    key_types: &[FieldType],
    value_types: &[FieldType],
) -> usize {
    let partial =
        node_layout(PageType::BTreeLeaf, key_types.len(), value_types.len(), 0).total_len();
    page_size.saturating_sub(partial) / (4 + cell_size(key_types))
}

/// View over one tree node page. Immutable geometry (types, cell size, slot
/// capacity) is read once at open; everything mutable goes through the page.
pub(crate) struct Node<'a> {
    pub db: &'a DbFile,
    pub page_id: u32,
    page_type: PageType,
    key_types: Vec<FieldType>,
    value_types: Vec<FieldType>,
    cell_size: usize,
    slot_capacity: usize,
    hdr_size: usize,
    fields: Fields<'a>,
}

impl<'a> Node<'a> {
    /// Lays out a fresh (zero-filled) page as an empty node.
    pub fn create(
        db: &'a DbFile,
        page_id: u32,
        page_type: PageType,
        key_types: &[FieldType],
        value_types: &[FieldType],
    ) -> Result<Node<'a>> {
        if !matches!(page_type, PageType::BTreeInterior | PageType::BTreeLeaf) {
            return Err(Error::InvalidArgument(format!(
                "{page_type:?} is not a node page type"
            )));
        }
        if key_types.is_empty() {
            return Err(Error::InvalidArgument("a node needs at least one key column".into()));
        }
        let page_size = db.page_size(page_id);
        let cell_size = cell_size(key_types);
        let partial = node_layout(page_type, key_types.len(), value_types.len(), 0).total_len();
        let slot_capacity = slot_capacity_for(page_size, key_types, value_types);
        if slot_capacity < MIN_SLOTS {
            return Err(Error::InvalidArgument(format!(
                "keys too large for {page_size}-byte pages: only {slot_capacity} slots fit"
            )));
        }
        let hdr_size = partial + 4 * slot_capacity;

        let layout = node_layout(page_type, key_types.len(), value_types.len(), slot_capacity);
        let fields = Fields::new(db, page_id, layout);
        fields.set_u8("type", page_type.as_u8())?;
        fields.set_u32("hdr_size", hdr_size as u32)?;
        fields.set_u32("cell_size", cell_size as u32)?;
        fields.set_u32("free_cell", NO_ID)?;
        fields.set_u32("key_count", key_types.len() as u32)?;
        fields.set_u32("value_count", value_types.len() as u32)?;
        fields.set_u32_prefix(
            "key_types",
            &key_types.iter().map(|t| t.code()).collect::<Vec<_>>(),
        )?;
        fields.set_u32_prefix(
            "value_types",
            &value_types.iter().map(|t| t.code()).collect::<Vec<_>>(),
        )?;
        fields.set_u32("slot_capacity", slot_capacity as u32)?;

        Ok(Node {
            db,
            page_id,
            page_type,
            key_types: key_types.to_vec(),
            value_types: value_types.to_vec(),
            cell_size,
            slot_capacity,
            hdr_size,
            fields,
        })
    }

    pub fn open(db: &'a DbFile, page_id: u32) -> Result<Node<'a>> {
        let tag = db.read(page_id, 0, 1)?[0];
        let page_type = PageType::from_u8(tag)?;
        if !matches!(page_type, PageType::BTreeInterior | PageType::BTreeLeaf) {
            return Err(Error::Corrupt(format!(
                "page {page_id} is not a tree node (type {tag})"
            )));
        }

        let prefix = Fields::new(db, page_id, fixed_layout(page_type));
        let key_count = prefix.get_u32("key_count")? as usize;
        let value_count = prefix.get_u32("value_count")? as usize;
        let page_size = db.page_size(page_id);
        if fixed_layout(page_type).total_len() + 4 * (key_count + value_count) + 8 > page_size {
            return Err(Error::Corrupt(format!(
                "node {page_id} declares {key_count}+{value_count} columns"
            )));
        }

        // The slot capacity sits right after the two type arrays.
        let partial = node_layout(page_type, key_count, value_count, 0);
        let cap_bytes = db.read(page_id, partial.offset_of("slot_capacity")?, 4)?;
        let slot_capacity = BigEndian::read_u32(&cap_bytes) as usize;

        let layout = node_layout(page_type, key_count, value_count, slot_capacity);
        if layout.total_len() > page_size {
            return Err(Error::Corrupt(format!(
                "node {page_id} declares slot capacity {slot_capacity}"
            )));
        }
        let fields = Fields::new(db, page_id, layout);

        let key_types = fields
            .get_u32_prefix("key_types", key_count)?
            .into_iter()
            .map(FieldType::from_code)
            .collect::<Result<Vec<_>>>()?;
        let value_types = fields
            .get_u32_prefix("value_types", value_count)?
            .into_iter()
            .map(FieldType::from_code)
            .collect::<Result<Vec<_>>>()?;
        let cell_size = fields.get_u32("cell_size")? as usize;
        if cell_size != super::cell::cell_size(&key_types) {
            return Err(Error::Corrupt(format!(
                "node {page_id} cell size {cell_size} does not match its key columns"
            )));
        }
        let hdr_size = fields.get_u32("hdr_size")? as usize;

        Ok(Node {
            db,
            page_id,
            page_type,
            key_types,
            value_types,
            cell_size,
            slot_capacity,
            hdr_size,
            fields,
        })
    }

    pub fn hdr(&self) -> &Fields<'a> {
        &self.fields
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn key_types(&self) -> &[FieldType] {
        &self.key_types
    }

    pub fn value_types(&self) -> &[FieldType] {
        &self.value_types
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    pub fn father(&self) -> Result<u32> {
        self.fields.get_u32("father")
    }

    pub fn set_father(&self, father: u32) -> Result<()> {
        self.fields.set_u32("father", father)
    }

    pub fn slot_count(&self) -> Result<usize> {
        Ok(self.fields.get_u32("slot_count")? as usize)
    }

    pub fn is_full(&self) -> Result<bool> {
        Ok(self.slot_count()? == self.slot_capacity)
    }

    /// Keys in this node's subtree: explicit on interior nodes, the slot
    /// count itself on leaves.
    pub fn total(&self) -> Result<u32> {
        match self.page_type {
            PageType::BTreeInterior => self.fields.get_u32("total"),
            _ => Ok(self.slot_count()? as u32),
        }
    }

    pub fn slot(&self, index: usize) -> Result<u32> {
        if index >= self.slot_count()? {
            return Err(Error::InvalidArgument(format!(
                "slot {index} out of range on page {}",
                self.page_id
            )));
        }
        self.fields.get_u32_at("slots", index)
    }

    pub fn slots(&self) -> Result<Vec<u32>> {
        self.fields.get_u32_prefix("slots", self.slot_count()?)
    }

    pub fn insert_slot(&self, index: usize, cell_id: u32) -> Result<()> {
        let mut slots = self.slots()?;
        if slots.len() >= self.slot_capacity {
            return Err(Error::Corrupt(format!(
                "slot directory overflow on page {}",
                self.page_id
            )));
        }
        if index > slots.len() {
            return Err(Error::InvalidArgument(format!(
                "slot index {index} out of range on page {}",
                self.page_id
            )));
        }
        slots.insert(index, cell_id);
        self.fields.set_u32_prefix("slots", &slots)?;
        self.fields.set_u32("slot_count", slots.len() as u32)
    }

    /// Unlinks a slot, returning the cell id it held.
    pub fn remove_slot(&self, index: usize) -> Result<u32> {
        let mut slots = self.slots()?;
        if index >= slots.len() {
            return Err(Error::InvalidArgument(format!(
                "slot index {index} out of range on page {}",
                self.page_id
            )));
        }
        let cell_id = slots.remove(index);
        self.fields.set_u32_prefix("slots", &slots)?;
        self.fields.set_u32("slot_count", slots.len() as u32)?;
        Ok(cell_id)
    }

    fn cell_offset(&self, cell_id: u32) -> Result<usize> {
        let cell_count = self.fields.get_u32("cell_count")?;
        let offset = self.hdr_size + cell_id as usize * self.cell_size;
        if cell_id >= cell_count || offset + self.cell_size > self.db.page_size(self.page_id) {
            return Err(Error::Corrupt(format!(
                "cell {cell_id} out of range on page {}",
                self.page_id
            )));
        }
        Ok(offset)
    }

    fn cell_bytes(&self, cell_id: u32) -> Result<Vec<u8>> {
        let offset = self.cell_offset(cell_id)?;
        self.db.read(self.page_id, offset, self.cell_size)
    }

    pub fn read_cell(&self, cell_id: u32) -> Result<Cell> {
        Cell::from_bytes(self.key_types.clone(), self.cell_bytes(cell_id)?)
    }

    pub fn write_cell(&self, cell_id: u32, cell: &Cell) -> Result<()> {
        let offset = self.cell_offset(cell_id)?;
        self.db.write(self.page_id, offset, cell.bytes())
    }

    /// Takes a cell off the free list, or extends the cell area. The cell
    /// comes back zero-filled.
    pub fn allocate_cell(&self) -> Result<u32> {
        let head = self.fields.get_u32("free_cell")?;
        if head != NO_ID {
            let bytes = self.cell_bytes(head)?;
            if bytes[0] != CellType::Free as u8 {
                return Err(Error::Corrupt(format!(
                    "free cell list of page {} points at a live cell",
                    self.page_id
                )));
            }
            let next = BigEndian::read_u32(&bytes[1..5]);
            self.fields.set_u32("free_cell", next)?;
            let offset = self.cell_offset(head)?;
            self.db.write(self.page_id, offset, &vec![0u8; self.cell_size])?;
            return Ok(head);
        }

        let cell_count = self.fields.get_u32("cell_count")?;
        let end = self.hdr_size + (cell_count as usize + 1) * self.cell_size;
        if end > self.db.page_size(self.page_id) {
            return Err(Error::Corrupt(format!(
                "cell area exhausted on page {}",
                self.page_id
            )));
        }
        self.fields.set_u32("cell_count", cell_count + 1)?;
        Ok(cell_count)
    }

    pub fn release_cell(&self, cell_id: u32) -> Result<()> {
        let offset = self.cell_offset(cell_id)?;
        let mut buf = vec![0u8; self.cell_size];
        buf[0] = CellType::Free as u8;
        BigEndian::write_u32(&mut buf[1..5], self.fields.get_u32("free_cell")?);
        self.db.write(self.page_id, offset, &buf)?;
        self.fields.set_u32("free_cell", cell_id)
    }

    /// Key stored at slot `index`.
    pub fn key(&self, index: usize) -> Result<Payload> {
        self.read_cell(self.slot(index)?)?.key()
    }

    /// All keys in slot order.
    pub fn keys(&self) -> Result<Vec<Payload>> {
        let mut keys = Vec::with_capacity(self.slot_count()?);
        for cell_id in self.slots()? {
            keys.push(self.read_cell(cell_id)?.key()?);
        }
        Ok(keys)
    }

    /// Binary search among this node's keys: `Ok(i)` on an exact match,
    /// `Err(i)` with the insertion point otherwise.
    pub fn search_keys(&self, key: &Payload) -> Result<std::result::Result<usize, usize>> {
        Ok(self.keys()?.binary_search_by(|probe| probe.key_cmp(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::payload::Value;
    use anyhow::Result;
    use tempfile::tempdir;

    fn node_on_fresh_page<'a>(db: &'a DbFile) -> Result<Node<'a>> {
        let page = db.alloc_page()?;
        Ok(Node::create(
            db,
            page,
            PageType::BTreeLeaf,
            &[FieldType::Int],
            &[FieldType::Str(16)],
        )?)
    }

    #[test]
    fn test_capacity_formula() -> Result<()> {
        let dir = tempdir()?;
        // 128-byte pages, INT key, one value column: fixed header 41 + 4 + 4
        // + 8 = 57 bytes, 10-byte cells -> (128 - 57) / 14 = 5 slots.
        let db = DbFile::create_with(&dir.path().join("test.db"), 7, 16)?;
        let page = db.alloc_page()?;
        let node = Node::create(
            &db,
            page,
            PageType::BTreeLeaf,
            &[FieldType::Int],
            &[FieldType::Int],
        )?;
        assert_eq!(node.slot_capacity(), 5);
        assert_eq!(node.cell_size(), 10);

        // Keys that cannot reach MIN_SLOTS are rejected outright.
        let page = db.alloc_page()?;
        assert!(Node::create(
            &db,
            page,
            PageType::BTreeLeaf,
            &[FieldType::Str(64)],
            &[FieldType::Int],
        )
        .is_err());
        Ok(())
    }

    #[test]
    fn test_create_then_open() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let created = node_on_fresh_page(&db)?;
        let page = created.page_id;

        let node = Node::open(&db, page)?;
        assert_eq!(node.page_type(), PageType::BTreeLeaf);
        assert_eq!(node.key_types(), &[FieldType::Int]);
        assert_eq!(node.value_types(), &[FieldType::Str(16)]);
        assert_eq!(node.slot_count()?, 0);
        assert_eq!(node.slot_capacity(), created.slot_capacity());
        Ok(())
    }

    #[test]
    fn test_cell_alloc_and_recycle() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let node = node_on_fresh_page(&db)?;

        let a = node.allocate_cell()?;
        let b = node.allocate_cell()?;
        assert_eq!((a, b), (0, 1));

        node.release_cell(a)?;
        node.release_cell(b)?;
        // LIFO reuse through the in-page free list.
        assert_eq!(node.allocate_cell()?, b);
        assert_eq!(node.allocate_cell()?, a);
        assert_eq!(node.hdr().get_u32("cell_count")?, 2);
        Ok(())
    }

    #[test]
    fn test_slot_directory_keeps_order() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let node = node_on_fresh_page(&db)?;

        for v in [30, 10, 20] {
            let cell_id = node.allocate_cell()?;
            let mut cell = Cell::new(CellType::Leaf, vec![FieldType::Int]);
            cell.set_key(&Payload::from_values(&[FieldType::Int], &[Value::Int(v)])?)?;
            node.write_cell(cell_id, &cell)?;
            let pos = node.search_keys(&cell.key()?)?.unwrap_err();
            node.insert_slot(pos, cell_id)?;
        }

        let keys: Vec<i32> = node
            .keys()?
            .iter()
            .map(|k| k.get(0).unwrap().as_int().unwrap())
            .collect();
        assert_eq!(keys, vec![10, 20, 30]);
        assert_eq!(node.search_keys(&Payload::from_values(
            &[FieldType::Int],
            &[Value::Int(20)]
        )?)?, Ok(1));

        let removed = node.remove_slot(1)?;
        node.release_cell(removed)?;
        assert_eq!(node.slot_count()?, 2);
        assert_eq!(node.key(1)?.get(0)?.as_int(), Some(30));
        Ok(())
    }
}
