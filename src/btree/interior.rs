//! Interior node view: separator keys and child links.
//!
//! An interior node with k keys has k + 1 children: one per cell plus the
//! tail child. Child i covers keys up to and including key i; the tail child
//! covers everything greater. Every interior node maintains `total`, the
//! number of keys stored in its whole subtree.

use super::cell::{Cell, CellType};
use super::node::Node;
use super::payload::{FieldType, Payload};
use crate::error::{Error, Result};
use crate::file::DbFile;
use crate::page::PageType;

pub(crate) struct Interior<'a> {
    pub node: Node<'a>,
}

impl<'a> Interior<'a> {
    pub fn create(
        db: &'a DbFile,
        page_id: u32,
        key_types: &[FieldType],
        value_types: &[FieldType],
    ) -> Result<Interior<'a>> {
        let node = Node::create(db, page_id, PageType::BTreeInterior, key_types, value_types)?;
        Ok(Interior { node })
    }

    pub fn open(db: &'a DbFile, page_id: u32) -> Result<Interior<'a>> {
        Self::from_node(Node::open(db, page_id)?)
    }

    pub fn from_node(node: Node<'a>) -> Result<Interior<'a>> {
        if node.page_type() != PageType::BTreeInterior {
            return Err(Error::Corrupt(format!(
                "page {} is not an interior node",
                node.page_id
            )));
        }
        Ok(Interior { node })
    }

    pub fn total(&self) -> Result<u32> {
        self.node.hdr().get_u32("total")
    }

    pub fn set_total(&self, total: u32) -> Result<()> {
        self.node.hdr().set_u32("total", total)
    }

    pub fn tail_child(&self) -> Result<u32> {
        self.node.hdr().get_u32("tail_child")
    }

    pub fn set_tail_child(&self, page_id: u32) -> Result<()> {
        self.node.hdr().set_u32("tail_child", page_id)
    }

    /// Child page at position `index`; `index == slot_count` is the tail.
    pub fn child(&self, index: usize) -> Result<u32> {
        let count = self.node.slot_count()?;
        if index > count {
            return Err(Error::InvalidArgument(format!(
                "child index {index} out of range on page {}",
                self.node.page_id
            )));
        }
        if index == count {
            self.tail_child()
        } else {
            Ok(self.node.read_cell(self.node.slot(index)?)?.link())
        }
    }

    pub fn set_child(&self, index: usize, page_id: u32) -> Result<()> {
        let count = self.node.slot_count()?;
        if index > count {
            return Err(Error::InvalidArgument(format!(
                "child index {index} out of range on page {}",
                self.node.page_id
            )));
        }
        if index == count {
            self.set_tail_child(page_id)
        } else {
            let cell_id = self.node.slot(index)?;
            let mut cell = self.node.read_cell(cell_id)?;
            cell.set_link(page_id);
            self.node.write_cell(cell_id, &cell)
        }
    }

    /// Position of `page_id` among this node's children (tail included).
    pub fn child_index(&self, page_id: u32) -> Result<usize> {
        let count = self.node.slot_count()?;
        for index in 0..=count {
            if self.child(index)? == page_id {
                return Ok(index);
            }
        }
        Err(Error::Corrupt(format!(
            "page {page_id} is not a child of node {}",
            self.node.page_id
        )))
    }

    pub fn set_key(&self, index: usize, key: &Payload) -> Result<()> {
        let cell_id = self.node.slot(index)?;
        let mut cell = self.node.read_cell(cell_id)?;
        cell.set_key(key)?;
        self.node.write_cell(cell_id, &cell)
    }

    /// Inserts a separator cell at slot `pos` pointing at `child`.
    /// Callers guarantee the node is not full.
    pub fn insert_entry(&self, pos: usize, key: &Payload, child: u32) -> Result<()> {
        let cell_id = self.node.allocate_cell()?;
        let mut cell = Cell::new(CellType::Interior, self.node.key_types().to_vec());
        cell.set_link(child);
        cell.set_key(key)?;
        self.node.write_cell(cell_id, &cell)?;
        self.node.insert_slot(pos, cell_id)
    }

    /// Removes the separator at slot `pos`, recycling its cell. The child
    /// link stored in that cell disappears with it.
    pub fn remove_entry(&self, pos: usize) -> Result<()> {
        let cell_id = self.node.remove_slot(pos)?;
        self.node.release_cell(cell_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::payload::Value;
    use anyhow::Result;
    use tempfile::tempdir;

    const KEY: [FieldType; 1] = [FieldType::Int];

    fn key(v: i32) -> Result<Payload> {
        Ok(Payload::from_values(&KEY, &[Value::Int(v)])?)
    }

    #[test]
    fn test_children_and_tail() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let page = db.alloc_page()?;
        let node = Interior::create(&db, page, &KEY, &[FieldType::Int])?;

        // Children 11, 22, tail 33 separated by keys 10 and 20.
        node.insert_entry(0, &key(10)?, 11)?;
        node.insert_entry(1, &key(20)?, 22)?;
        node.set_tail_child(33)?;

        assert_eq!(node.child(0)?, 11);
        assert_eq!(node.child(1)?, 22);
        assert_eq!(node.child(2)?, 33);
        assert!(node.child(3).is_err());

        assert_eq!(node.child_index(22)?, 1);
        assert_eq!(node.child_index(33)?, 2);
        assert!(node.child_index(99).is_err());
        Ok(())
    }

    #[test]
    fn test_set_child_and_key() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let page = db.alloc_page()?;
        let node = Interior::create(&db, page, &KEY, &[FieldType::Int])?;

        node.insert_entry(0, &key(10)?, 11)?;
        node.set_tail_child(33)?;

        node.set_child(0, 44)?;
        node.set_child(1, 55)?;
        assert_eq!(node.child(0)?, 44);
        assert_eq!(node.tail_child()?, 55);

        node.set_key(0, &key(15)?)?;
        assert_eq!(node.node.key(0)?.get(0)?, Value::Int(15));
        Ok(())
    }

    #[test]
    fn test_remove_entry() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let page = db.alloc_page()?;
        let node = Interior::create(&db, page, &KEY, &[FieldType::Int])?;

        node.insert_entry(0, &key(10)?, 11)?;
        node.insert_entry(1, &key(20)?, 22)?;
        node.set_tail_child(33)?;

        node.remove_entry(0)?;
        assert_eq!(node.node.slot_count()?, 1);
        assert_eq!(node.child(0)?, 22);
        assert_eq!(node.child(1)?, 33);
        Ok(())
    }
}
