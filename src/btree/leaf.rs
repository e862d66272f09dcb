//! Leaf node view: sorted entries plus the value heap that backs them.

use super::cell::{Cell, CellType};
use super::cell_storage::CellStorage;
use super::node::Node;
use super::payload::{FieldType, Payload};
use crate::error::{Error, Result};
use crate::file::DbFile;
use crate::overflow::OverflowPage;
use crate::page::PageType;

pub(crate) struct Leaf<'a> {
    pub node: Node<'a>,
    storage: CellStorage<'a>,
}

impl<'a> Leaf<'a> {
    /// Lays out a fresh page as an empty leaf and allocates its value heap.
    pub fn create(
        db: &'a DbFile,
        page_id: u32,
        key_types: &[FieldType],
        value_types: &[FieldType],
    ) -> Result<Leaf<'a>> {
        let node = Node::create(db, page_id, PageType::BTreeLeaf, key_types, value_types)?;
        let heap_page = db.alloc_page()?;
        OverflowPage::create(db, heap_page)?;
        let storage = CellStorage::create(db, heap_page, value_types)?;
        node.hdr().set_u32("overflow_page", heap_page)?;
        Ok(Leaf { node, storage })
    }

    pub fn open(db: &'a DbFile, page_id: u32) -> Result<Leaf<'a>> {
        Self::from_node(Node::open(db, page_id)?)
    }

    pub fn from_node(node: Node<'a>) -> Result<Leaf<'a>> {
        if node.page_type() != PageType::BTreeLeaf {
            return Err(Error::Corrupt(format!(
                "page {} is not a leaf node",
                node.page_id
            )));
        }
        let heap_page = node.hdr().get_u32("overflow_page")?;
        if heap_page == 0 {
            return Err(Error::Corrupt(format!(
                "leaf {} has no value heap",
                node.page_id
            )));
        }
        let storage = CellStorage::open(node.db, heap_page)?;
        Ok(Leaf { node, storage })
    }

    pub fn storage(&self) -> &CellStorage<'a> {
        &self.storage
    }

    pub fn overflow_page(&self) -> Result<u32> {
        self.node.hdr().get_u32("overflow_page")
    }

    pub fn left_sibling(&self) -> Result<u32> {
        self.node.hdr().get_u32("left_sibling")
    }

    pub fn set_left_sibling(&self, page_id: u32) -> Result<()> {
        self.node.hdr().set_u32("left_sibling", page_id)
    }

    pub fn right_sibling(&self) -> Result<u32> {
        self.node.hdr().get_u32("right_sibling")
    }

    pub fn set_right_sibling(&self, page_id: u32) -> Result<()> {
        self.node.hdr().set_u32("right_sibling", page_id)
    }

    /// Value-heap unit id stored at a slot.
    pub fn unit(&self, slot: usize) -> Result<u32> {
        Ok(self.node.read_cell(self.node.slot(slot)?)?.link())
    }

    pub fn value(&self, slot: usize) -> Result<Payload> {
        self.storage.read_unit(self.unit(slot)?)
    }

    pub fn set_value(&self, slot: usize, value: &Payload) -> Result<()> {
        self.storage.write_unit(self.unit(slot)?, value)
    }

    /// Key and value at a slot, read together for entry moves.
    pub fn entry(&self, slot: usize) -> Result<(Payload, Payload)> {
        let cell = self.node.read_cell(self.node.slot(slot)?)?;
        let value = self.storage.read_unit(cell.link())?;
        Ok((cell.key()?, value))
    }

    /// Inserts a key/value pair at an already-determined slot position.
    /// Callers guarantee the leaf is not full.
    pub fn insert_entry(&self, pos: usize, key: &Payload, value: &Payload) -> Result<()> {
        let unit = self.storage.allocate_unit()?;
        self.storage.write_unit(unit, value)?;
        let cell_id = self.node.allocate_cell()?;
        let mut cell = Cell::new(CellType::Leaf, self.node.key_types().to_vec());
        cell.set_link(unit);
        cell.set_key(key)?;
        self.node.write_cell(cell_id, &cell)?;
        self.node.insert_slot(pos, cell_id)
    }

    /// Removes an entry, recycling both its cell and its value unit.
    pub fn remove_entry(&self, pos: usize) -> Result<()> {
        let cell_id = self.node.remove_slot(pos)?;
        let cell = self.node.read_cell(cell_id)?;
        self.storage.release_unit(cell.link())?;
        self.node.release_cell(cell_id)
    }
}
