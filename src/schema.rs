//! The schema tree: maps table names to tree root pages.
//!
//! Every file carries one tree keyed by a fixed-width name column, rooted at
//! the header's `schema_page` field. The name column is as wide as the page
//! size allows, up to 64 bytes, so small-page files simply accept shorter
//! table names. Tree roots move as tables grow and shrink; [`Table`] writes
//! the new root back into its schema entry whenever that happens.

use std::cell::Cell;

use crate::btree::node::{slot_capacity_for, MIN_SLOTS};
use crate::btree::payload::{FieldType, Payload, Value};
use crate::btree::{BPlusTree, TreeIter};
use crate::error::{Error, Result};
use crate::file::DbFile;

/// Widest name column a schema tree will use.
const MAX_NAME_WIDTH: usize = 64;

/// Widest name column that still leaves schema nodes [`MIN_SLOTS`] keys on
/// pages of this size.
fn name_width(page_size: usize) -> Result<usize> {
    for width in (1..=MAX_NAME_WIDTH).rev() {
        let capacity =
            slot_capacity_for(page_size, &[FieldType::Str(width)], &[FieldType::Int]);
        if capacity >= MIN_SLOTS {
            return Ok(width);
        }
    }
    Err(Error::InvalidArgument(format!(
        "{page_size}-byte pages cannot hold a schema tree"
    )))
}

/// The table directory of one database file.
pub struct Schema<'a> {
    db: &'a DbFile,
    name_width: usize,
}

impl<'a> Schema<'a> {
    /// Creates the schema tree of a fresh file and records it in the header.
    pub(crate) fn bootstrap(db: &DbFile) -> Result<()> {
        let width = name_width(db.geom().page_size)?;
        let page = db.alloc_page()?;
        BPlusTree::create(db, page, &[FieldType::Str(width)], &[FieldType::Int])?;
        db.header().set_u32("schema_page", page)?;
        Ok(())
    }

    pub fn open(db: &'a DbFile) -> Result<Schema<'a>> {
        let root = db.header().get_u32("schema_page")?;
        if root == 0 {
            return Err(Error::Corrupt("file has no schema tree".into()));
        }
        let tree = BPlusTree::open(db, root)?;
        let name_width = match tree.key_types() {
            [FieldType::Str(width)] => *width,
            _ => {
                return Err(Error::Corrupt(
                    "schema tree has unexpected key columns".into(),
                ))
            }
        };
        Ok(Schema { db, name_width })
    }

    /// Longest table name this file accepts.
    pub fn name_width(&self) -> usize {
        self.name_width
    }

    fn tree(&self) -> Result<BPlusTree<'a>> {
        BPlusTree::open(self.db, self.db.header().get_u32("schema_page")?)
    }

    fn save_root(&self, tree: &BPlusTree<'a>) -> Result<()> {
        let header = self.db.header();
        if header.get_u32("schema_page")? != tree.root_page() {
            header.set_u32("schema_page", tree.root_page())?;
        }
        Ok(())
    }

    fn name_key(&self, name: &str) -> Result<Payload> {
        Payload::from_values(
            &[FieldType::Str(self.name_width)],
            &[Value::Str(name.to_string())],
        )
    }

    /// Creates an empty table. A name already in use is
    /// [`Error::DuplicateKey`].
    pub fn create_table(
        &self,
        name: &str,
        key_types: &[FieldType],
        value_types: &[FieldType],
    ) -> Result<Table<'a>> {
        let key = self.name_key(name)?;
        let page = self.db.alloc_page()?;
        let table_tree = BPlusTree::create(self.db, page, key_types, value_types)?;

        let tree = self.tree()?;
        let root_value =
            Payload::from_values(&[FieldType::Int], &[Value::Int(page as i32)])?;
        if let Err(e) = tree.insert(&key, &root_value) {
            table_tree.release()?;
            return Err(e);
        }
        self.save_root(&tree)?;
        log::debug!("created table {name:?} rooted at page {page}");
        Ok(Table {
            db: self.db,
            name: name.to_string(),
            root: Cell::new(page),
        })
    }

    /// Opens a table by name.
    pub fn table(&self, name: &str) -> Result<Option<Table<'a>>> {
        let tree = self.tree()?;
        let result = tree.search(&self.name_key(name)?)?;
        if !result.found() {
            return Ok(None);
        }
        Ok(Some(Table {
            db: self.db,
            name: name.to_string(),
            root: Cell::new(root_page_of(&tree.value(&result)?)?),
        }))
    }

    /// Releases every page of a table and removes its schema entry.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let tree = self.tree()?;
        let result = tree.search(&self.name_key(name)?)?;
        if !result.found() {
            return Err(Error::KeyNotFound);
        }
        let root = root_page_of(&tree.value(&result)?)?;
        BPlusTree::open(self.db, root)?.release()?;
        tree.delete(&result)?;
        self.save_root(&tree)?;
        log::debug!("dropped table {name:?}");
        Ok(())
    }

    /// Names of all tables, in sorted order.
    pub fn tables(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in self.tree()?.iter()? {
            let (key, _) = entry?;
            match key.get(0)? {
                Value::Str(name) => names.push(name),
                other => {
                    return Err(Error::Corrupt(format!(
                        "schema tree holds a {} where a name belongs",
                        other.type_name()
                    )))
                }
            }
        }
        Ok(names)
    }
}

fn root_page_of(value: &Payload) -> Result<u32> {
    match value.get(0)? {
        Value::Int(page) => Ok(page as u32),
        other => Err(Error::Corrupt(format!(
            "schema tree holds a {} where a root page belongs",
            other.type_name()
        ))),
    }
}

/// One named tree. Operations track the root as it moves and keep the
/// table's schema entry pointing at it.
pub struct Table<'a> {
    db: &'a DbFile,
    name: String,
    root: Cell<u32>,
}

impl<'a> Table<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_page(&self) -> u32 {
        self.root.get()
    }

    pub fn key_types(&self) -> Result<Vec<FieldType>> {
        Ok(self.tree()?.key_types().to_vec())
    }

    pub fn value_types(&self) -> Result<Vec<FieldType>> {
        Ok(self.tree()?.value_types().to_vec())
    }

    fn tree(&self) -> Result<BPlusTree<'a>> {
        BPlusTree::open(self.db, self.root.get())
    }

    fn save_root(&self, tree: &BPlusTree<'a>) -> Result<()> {
        let new_root = tree.root_page();
        if new_root == self.root.get() {
            return Ok(());
        }
        self.root.set(new_root);
        let schema = Schema::open(self.db)?;
        let schema_tree = schema.tree()?;
        let result = schema_tree.search(&schema.name_key(&self.name)?)?;
        schema_tree.set_value(
            &result,
            &Payload::from_values(&[FieldType::Int], &[Value::Int(new_root as i32)])?,
        )?;
        log::trace!("table {:?} root moved to page {new_root}", self.name);
        Ok(())
    }

    pub fn insert(&self, key: &Payload, value: &Payload) -> Result<()> {
        let tree = self.tree()?;
        tree.insert(key, value)?;
        self.save_root(&tree)
    }

    /// Removes a row; a missing key is [`Error::KeyNotFound`].
    pub fn delete(&self, key: &Payload) -> Result<()> {
        let tree = self.tree()?;
        let result = tree.search(key)?;
        tree.delete(&result)?;
        self.save_root(&tree)
    }

    pub fn get(&self, key: &Payload) -> Result<Option<Payload>> {
        let tree = self.tree()?;
        let result = tree.search(key)?;
        if result.found() {
            Ok(Some(tree.value(&result)?))
        } else {
            Ok(None)
        }
    }

    /// Overwrites the value of an existing row.
    pub fn set(&self, key: &Payload, value: &Payload) -> Result<()> {
        let tree = self.tree()?;
        let result = tree.search(key)?;
        tree.set_value(&result, value)
    }

    pub fn len(&self) -> Result<u32> {
        self.tree()?.total()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Ascending scan over all rows.
    pub fn iter(&self) -> Result<TreeIter<'a>> {
        self.tree()?.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    const KEY: [FieldType; 1] = [FieldType::Int];
    const VAL: [FieldType; 1] = [FieldType::Str(16)];

    fn key(v: i32) -> Payload {
        Payload::from_values(&KEY, &[Value::Int(v)]).unwrap()
    }

    fn val(v: &str) -> Payload {
        Payload::from_values(&VAL, &[Value::Str(v.into())]).unwrap()
    }

    #[test]
    fn test_name_width_adapts_to_page_size() -> Result<()> {
        // 4096-byte pages take the full width; 128-byte pages cannot.
        assert_eq!(name_width(4096)?, 64);
        assert_eq!(name_width(128)?, 13);
        Ok(())
    }

    #[test]
    fn test_create_and_reopen_table() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        {
            let db = DbFile::create(&path)?;
            let table = db.schema()?.create_table("users", &KEY, &VAL)?;
            table.insert(&key(1), &val("ada"))?;
            table.insert(&key(2), &val("grace"))?;
            db.close()?;
        }

        let db = DbFile::open(&path)?;
        let table = db.schema()?.table("users")?.unwrap();
        assert_eq!(table.len()?, 2);
        assert_eq!(table.get(&key(1))?.unwrap().get(0)?, Value::Str("ada".into()));
        assert_eq!(table.key_types()?, KEY.to_vec());
        assert!(db.schema()?.table("nope")?.is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_table_name_rejected() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let schema = db.schema()?;

        schema.create_table("t", &KEY, &VAL)?;
        let free_before = db.header().get_u32("freelist_count")?;
        let pages_before = db.header().get_u32("page_count")?;
        assert!(matches!(
            schema.create_table("t", &KEY, &VAL),
            Err(Error::DuplicateKey)
        ));
        // The half-built tree went back to the free list.
        let reclaimed = db.header().get_u32("freelist_count")? - free_before;
        assert_eq!(
            db.header().get_u32("page_count")? - pages_before,
            reclaimed
        );
        Ok(())
    }

    #[test]
    fn test_overlong_name_rejected() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let schema = db.schema()?;
        let name = "x".repeat(schema.name_width() + 1);
        assert!(matches!(
            schema.create_table(&name, &KEY, &VAL),
            Err(Error::ValueTooLong { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_root_tracking_across_growth() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        {
            // Tiny pages so both the table tree and the schema tree split.
            let db = DbFile::create_with(&path, 7, 32)?;
            let schema = db.schema()?;
            let table = schema.create_table("t", &KEY, &[FieldType::Int])?;
            let root_before = table.root_page();
            for v in 0..100 {
                table.insert(&key(v), &Payload::from_values(
                    &[FieldType::Int],
                    &[Value::Int(v)],
                )?)?;
            }
            assert_ne!(table.root_page(), root_before);
            db.close()?;
        }

        let db = DbFile::open(&path)?;
        let table = db.schema()?.table("t")?.unwrap();
        assert_eq!(table.len()?, 100);
        for v in 0..100 {
            assert!(table.get(&key(v))?.is_some());
        }
        Ok(())
    }

    #[test]
    fn test_drop_table_reclaims_pages() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let schema = db.schema()?;

        let pages_before = db.header().get_u32("page_count")?;
        let free_before = db.header().get_u32("freelist_count")?;
        let table = schema.create_table("t", &KEY, &VAL)?;
        for v in 0..200 {
            table.insert(&key(v), &val("row"))?;
        }
        schema.drop_table("t")?;

        assert!(schema.table("t")?.is_none());
        assert!(matches!(schema.drop_table("t"), Err(Error::KeyNotFound)));
        let grown = db.header().get_u32("page_count")? - pages_before;
        assert_eq!(db.header().get_u32("freelist_count")? - free_before, grown);
        Ok(())
    }

    #[test]
    fn test_tables_listing() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let schema = db.schema()?;

        for name in ["gamma", "alpha", "beta"] {
            schema.create_table(name, &KEY, &VAL)?;
        }
        assert_eq!(schema.tables()?, vec!["alpha", "beta", "gamma"]);
        Ok(())
    }

    #[test]
    fn test_update_in_place() -> Result<()> {
        let dir = tempdir()?;
        let db = DbFile::create(&dir.path().join("test.db"))?;
        let table = db.schema()?.create_table("t", &KEY, &VAL)?;

        table.insert(&key(1), &val("old"))?;
        table.set(&key(1), &val("new"))?;
        assert_eq!(table.get(&key(1))?.unwrap().get(0)?, Value::Str("new".into()));
        assert!(matches!(
            table.set(&key(2), &val("x")),
            Err(Error::KeyNotFound)
        ));
        table.delete(&key(1))?;
        assert!(table.is_empty()?);
        assert!(matches!(table.delete(&key(1)), Err(Error::KeyNotFound)));
        Ok(())
    }
}
