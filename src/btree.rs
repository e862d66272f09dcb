//! B+Tree index: typed keys in sorted order, values on leaf-owned heaps.
//!
//! Interior nodes hold separator keys and child links; leaves hold the
//! entries and are chained through sibling links for ordered scans. A leaf
//! split keeps the median key in the left leaf and duplicates it upward as
//! the separator; an interior split removes the median from both halves and
//! promotes it. Structure changes that climb the tree (ancestor splits on
//! insert, underflow fixes on delete) are driven iteratively through father
//! links, never by recursion.

pub mod payload;

pub(crate) mod cell;
pub(crate) mod cell_storage;
pub(crate) mod interior;
pub(crate) mod leaf;
pub(crate) mod node;

use std::cell::Cell as StdCell;
use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::file::DbFile;
use crate::overflow::OverflowPage;
use crate::page::PageType;

use interior::Interior;
use leaf::Leaf;
use node::Node;
use payload::{FieldType, Payload};

/// In-page id sentinel for "none" (cell ids, value-unit ids).
pub(crate) const NO_ID: u32 = u32::MAX;

/// Outcome of a key lookup: the root-to-leaf path walked, the descent index
/// at every interior level, and the key's position (or insertion point) in
/// the leaf.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub(crate) path: Vec<u32>,
    pub(crate) indices: Vec<usize>,
    pub(crate) leaf_pos: std::result::Result<usize, usize>,
}

impl SearchResult {
    pub fn found(&self) -> bool {
        self.leaf_pos.is_ok()
    }

    /// Slot of the matched key in its leaf, when found.
    pub fn slot(&self) -> Option<usize> {
        self.leaf_pos.ok()
    }

    pub(crate) fn leaf(&self) -> u32 {
        *self.path.last().expect("search path is never empty")
    }
}

/// A B+Tree rooted somewhere in a database file.
///
/// The root page moves when the root splits or collapses; callers that
/// persist the root (the schema table does) re-read [`BPlusTree::root_page`]
/// after mutations.
pub struct BPlusTree<'a> {
    db: &'a DbFile,
    root: StdCell<u32>,
    key_types: Vec<FieldType>,
    value_types: Vec<FieldType>,
}

impl<'a> BPlusTree<'a> {
    /// Lays out a freshly allocated page as the root leaf of a new tree.
    pub fn create(
        db: &'a DbFile,
        page_id: u32,
        key_types: &[FieldType],
        value_types: &[FieldType],
    ) -> Result<BPlusTree<'a>> {
        Leaf::create(db, page_id, key_types, value_types)?;
        Ok(BPlusTree {
            db,
            root: StdCell::new(page_id),
            key_types: key_types.to_vec(),
            value_types: value_types.to_vec(),
        })
    }

    /// Opens the tree rooted at `root_page`, reading its declared columns.
    pub fn open(db: &'a DbFile, root_page: u32) -> Result<BPlusTree<'a>> {
        let node = Node::open(db, root_page)?;
        Ok(BPlusTree {
            db,
            root: StdCell::new(root_page),
            key_types: node.key_types().to_vec(),
            value_types: node.value_types().to_vec(),
        })
    }

    pub fn root_page(&self) -> u32 {
        self.root.get()
    }

    pub fn key_types(&self) -> &[FieldType] {
        &self.key_types
    }

    pub fn value_types(&self) -> &[FieldType] {
        &self.value_types
    }

    /// Number of keys in the tree.
    pub fn total(&self) -> Result<u32> {
        Node::open(self.db, self.root.get())?.total()
    }

    fn check_key(&self, key: &Payload) -> Result<()> {
        if !Payload::compatible(key.types(), &self.key_types) {
            return Err(Error::TypeMismatch {
                expected: types_str(&self.key_types),
                actual: types_str(key.types()),
            });
        }
        Ok(())
    }

    /// Descends from the root: at every interior node, follow the child of
    /// the first key >= the target, or the tail child past the last key.
    pub fn search(&self, key: &Payload) -> Result<SearchResult> {
        self.check_key(key)?;
        let mut page_id = self.root.get();
        let mut path = Vec::new();
        let mut indices = Vec::new();
        loop {
            let node = Node::open(self.db, page_id)?;
            path.push(page_id);
            if node.page_type() == PageType::BTreeLeaf {
                let leaf_pos = node.search_keys(key)?;
                return Ok(SearchResult {
                    path,
                    indices,
                    leaf_pos,
                });
            }
            let index = match node.search_keys(key)? {
                Ok(i) => i,
                Err(i) => i,
            };
            indices.push(index);
            page_id = Interior::from_node(node)?.child(index)?;
        }
    }

    fn check_value(&self, value: &Payload) -> Result<()> {
        if !Payload::compatible(value.types(), &self.value_types)
            || value.size() != Payload::size_of(&self.value_types)
        {
            return Err(Error::TypeMismatch {
                expected: types_str(&self.value_types),
                actual: types_str(value.types()),
            });
        }
        Ok(())
    }

    /// Inserts a key/value pair; an existing equal key is an error.
    pub fn insert(&self, key: &Payload, value: &Payload) -> Result<()> {
        self.check_value(value)?;
        let result = self.search(key)?;
        if result.found() {
            return Err(Error::DuplicateKey);
        }

        let mut leaf = Leaf::open(self.db, result.leaf())?;
        let mut pos = result.leaf_pos.unwrap_err();
        if leaf.node.is_full()? {
            let (left_id, right_id, sep) = self.split_leaf(result.leaf())?;
            let target = if key.key_cmp(&sep) == Ordering::Greater {
                right_id
            } else {
                left_id
            };
            leaf = Leaf::open(self.db, target)?;
            pos = match leaf.node.search_keys(key)? {
                Ok(_) => return Err(Error::DuplicateKey),
                Err(p) => p,
            };
        }
        leaf.insert_entry(pos, key, value)?;
        self.bump_totals(leaf.node.father()?, 1)
    }

    /// Removes the entry a search found; a miss is [`Error::KeyNotFound`].
    pub fn delete(&self, result: &SearchResult) -> Result<()> {
        let slot = result.slot().ok_or(Error::KeyNotFound)?;
        let leaf_id = result.leaf();
        let leaf = Leaf::open(self.db, leaf_id)?;
        leaf.remove_entry(slot)?;
        self.bump_totals(leaf.node.father()?, -1)?;
        self.rebalance(leaf_id)
    }

    /// Value stored at a found key.
    pub fn value(&self, result: &SearchResult) -> Result<Payload> {
        let slot = result.slot().ok_or(Error::KeyNotFound)?;
        Leaf::open(self.db, result.leaf())?.value(slot)
    }

    /// Overwrites the value at a found key without touching the structure.
    pub fn set_value(&self, result: &SearchResult, value: &Payload) -> Result<()> {
        let slot = result.slot().ok_or(Error::KeyNotFound)?;
        Leaf::open(self.db, result.leaf())?.set_value(slot, value)
    }

    /// Ascending scan over all entries.
    pub fn iter(&self) -> Result<TreeIter<'a>> {
        let mut page_id = self.root.get();
        loop {
            let node = Node::open(self.db, page_id)?;
            if node.page_type() == PageType::BTreeLeaf {
                return Ok(TreeIter {
                    db: self.db,
                    leaf: page_id,
                    slot: 0,
                });
            }
            page_id = Interior::from_node(node)?.child(0)?;
        }
    }

    /// Returns every page of the tree (nodes and value heaps) to the free
    /// list, consuming the handle.
    pub fn release(self) -> Result<()> {
        let mut stack = vec![self.root.get()];
        while let Some(page_id) = stack.pop() {
            let node = Node::open(self.db, page_id)?;
            match node.page_type() {
                PageType::BTreeLeaf => {
                    let leaf = Leaf::from_node(node)?;
                    OverflowPage::release_chain(self.db, leaf.overflow_page()?)?;
                }
                _ => {
                    let interior = Interior::from_node(node)?;
                    for index in 0..=interior.node.slot_count()? {
                        stack.push(interior.child(index)?);
                    }
                }
            }
            self.db.release_page(page_id)?;
        }
        Ok(())
    }

    /// Adds `delta` to the subtree totals of every ancestor from `page_id`
    /// (an interior node or 0) up to the root.
    fn bump_totals(&self, page_id: u32, delta: i64) -> Result<()> {
        let mut page_id = page_id;
        while page_id != 0 {
            let node = Interior::open(self.db, page_id)?;
            let total = node.total()? as i64 + delta;
            if total < 0 {
                return Err(Error::Corrupt(format!(
                    "subtree total underflow on page {page_id}"
                )));
            }
            node.set_total(total as u32)?;
            page_id = node.node.father()?;
        }
        Ok(())
    }

    /// Splits a full leaf, returning both halves and the separator (the
    /// median key, which stays in the left leaf and is duplicated upward).
    fn split_leaf(&self, leaf_id: u32) -> Result<(u32, u32, Payload)> {
        self.split_full_ancestors(leaf_id)?;

        let left = Leaf::open(self.db, leaf_id)?;
        let count = left.node.slot_count()?;
        let mid = count / 2;
        let sep = left.node.key(mid)?;

        let right_id = self.db.alloc_page()?;
        let right = Leaf::create(self.db, right_id, &self.key_types, &self.value_types)?;
        for slot in mid + 1..count {
            let (key, value) = left.entry(slot)?;
            right.insert_entry(slot - (mid + 1), &key, &value)?;
        }
        for slot in (mid + 1..count).rev() {
            left.remove_entry(slot)?;
        }

        let old_right = left.right_sibling()?;
        left.set_right_sibling(right_id)?;
        right.set_left_sibling(leaf_id)?;
        right.set_right_sibling(old_right)?;
        if old_right != 0 {
            Leaf::open(self.db, old_right)?.set_left_sibling(right_id)?;
        }

        self.attach_split(leaf_id, right_id, &sep)?;
        log::trace!("split leaf {leaf_id}, new right sibling {right_id}");
        Ok((leaf_id, right_id, sep))
    }

    /// Makes room above a node about to split: collects the chain of
    /// consecutively full ancestors and splits them top-down, so every
    /// separator lands in a parent that already has a free slot.
    fn split_full_ancestors(&self, page_id: u32) -> Result<()> {
        let mut chain = Vec::new();
        let mut current = Node::open(self.db, page_id)?.father()?;
        while current != 0 {
            let node = Node::open(self.db, current)?;
            if !node.is_full()? {
                break;
            }
            chain.push(current);
            current = node.father()?;
        }
        for &page_id in chain.iter().rev() {
            self.split_interior(page_id)?;
        }
        Ok(())
    }

    /// Splits a full interior node whose own parent has room. The median is
    /// removed from both halves and promoted.
    fn split_interior(&self, page_id: u32) -> Result<()> {
        let left = Interior::open(self.db, page_id)?;
        let count = left.node.slot_count()?;
        let mid = count / 2;
        let sep = left.node.key(mid)?;

        let right_id = self.db.alloc_page()?;
        let right = Interior::create(self.db, right_id, &self.key_types, &self.value_types)?;
        let mut moved_total = 0u32;
        for slot in mid + 1..count {
            let cell = left.node.read_cell(left.node.slot(slot)?)?;
            let child_id = cell.link();
            right.insert_entry(slot - (mid + 1), &cell.key()?, child_id)?;
            let child = Node::open(self.db, child_id)?;
            moved_total += child.total()?;
            child.set_father(right_id)?;
        }
        let tail_id = left.tail_child()?;
        right.set_tail_child(tail_id)?;
        let tail = Node::open(self.db, tail_id)?;
        moved_total += tail.total()?;
        tail.set_father(right_id)?;
        right.set_total(moved_total)?;

        // The median's child becomes the left half's tail; the median cell
        // itself is promoted, not kept.
        let median_child = left.child(mid)?;
        left.set_tail_child(median_child)?;
        for slot in (mid..count).rev() {
            left.remove_entry(slot)?;
        }
        left.set_total(left.total()? - moved_total)?;

        self.attach_split(page_id, right_id, &sep)?;
        log::trace!("split interior {page_id}, new right sibling {right_id}");
        Ok(())
    }

    /// Hooks a freshly split pair into the tree: inserts the separator into
    /// the father (which is guaranteed to have room), or synthesizes a new
    /// root when the left half was the root.
    fn attach_split(&self, left_id: u32, right_id: u32, sep: &Payload) -> Result<()> {
        let father_id = Node::open(self.db, left_id)?.father()?;
        if father_id == 0 {
            let root_id = self.db.alloc_page()?;
            let root = Interior::create(self.db, root_id, &self.key_types, &self.value_types)?;
            root.insert_entry(0, sep, left_id)?;
            root.set_tail_child(right_id)?;
            let left_total = Node::open(self.db, left_id)?.total()?;
            let right_total = Node::open(self.db, right_id)?.total()?;
            root.set_total(left_total + right_total)?;
            Node::open(self.db, left_id)?.set_father(root_id)?;
            Node::open(self.db, right_id)?.set_father(root_id)?;
            self.root.set(root_id);
            log::trace!("new root {root_id}");
            return Ok(());
        }

        // The slot that pointed at the left half shifts one to the right and
        // must point at the new right half; a split never changes the number
        // of keys below the father, so its total stands.
        let father = Interior::open(self.db, father_id)?;
        let pos = father.child_index(left_id)?;
        father.insert_entry(pos, sep, left_id)?;
        father.set_child(pos + 1, right_id)?;
        Node::open(self.db, right_id)?.set_father(father_id)?;
        Ok(())
    }

    /// Walks upward from a node that may have emptied out, borrowing from or
    /// merging with siblings until the tree is balanced again.
    fn rebalance(&self, page_id: u32) -> Result<()> {
        let mut page_id = page_id;
        loop {
            let node = Node::open(self.db, page_id)?;
            let father_id = node.father()?;
            let count = node.slot_count()?;

            if father_id == 0 {
                // An interior root with no separators has a single child
                // left; that child becomes the root. An empty root leaf is
                // just an empty tree.
                if node.page_type() == PageType::BTreeInterior && count == 0 {
                    let child_id = Interior::from_node(node)?.tail_child()?;
                    Node::open(self.db, child_id)?.set_father(0)?;
                    self.db.release_page(page_id)?;
                    self.root.set(child_id);
                    log::trace!("root collapsed to page {child_id}");
                }
                return Ok(());
            }
            if count >= 1 {
                return Ok(());
            }

            let next = match node.page_type() {
                PageType::BTreeLeaf => self.fix_empty_leaf(page_id, father_id)?,
                _ => self.fix_empty_interior(page_id, father_id)?,
            };
            match next {
                Some(father_id) => page_id = father_id,
                None => return Ok(()),
            }
        }
    }

    /// Refills or splices out an empty non-root leaf. Returns the father when
    /// it became empty itself and the walk must continue.
    fn fix_empty_leaf(&self, leaf_id: u32, father_id: u32) -> Result<Option<u32>> {
        let father = Interior::open(self.db, father_id)?;
        let heir = father.child_index(leaf_id)?;
        let father_count = father.node.slot_count()?;
        if father_count == 0 {
            return Err(Error::Corrupt(format!(
                "interior node {father_id} has no separators"
            )));
        }

        // Borrow through the father: right sibling's first entry, else left
        // sibling's last. A lender must keep at least one entry.
        if heir < father_count {
            let right = Leaf::open(self.db, father.child(heir + 1)?)?;
            if right.node.slot_count()? > 1 {
                let leaf = Leaf::open(self.db, leaf_id)?;
                let (key, value) = right.entry(0)?;
                right.remove_entry(0)?;
                leaf.insert_entry(0, &key, &value)?;
                father.set_key(heir, &key)?;
                return Ok(None);
            }
        }
        if heir > 0 {
            let left = Leaf::open(self.db, father.child(heir - 1)?)?;
            let left_count = left.node.slot_count()?;
            if left_count > 1 {
                let leaf = Leaf::open(self.db, leaf_id)?;
                let (key, value) = left.entry(left_count - 1)?;
                left.remove_entry(left_count - 1)?;
                leaf.insert_entry(0, &key, &value)?;
                let new_last = left.node.key(left_count - 2)?;
                father.set_key(heir - 1, &new_last)?;
                return Ok(None);
            }
        }

        // No lender: splice the leaf out of the sibling chain and drop its
        // separator from the father.
        let leaf = Leaf::open(self.db, leaf_id)?;
        let left_sibling = leaf.left_sibling()?;
        let right_sibling = leaf.right_sibling()?;
        if left_sibling != 0 {
            Leaf::open(self.db, left_sibling)?.set_right_sibling(right_sibling)?;
        }
        if right_sibling != 0 {
            Leaf::open(self.db, right_sibling)?.set_left_sibling(left_sibling)?;
        }

        if heir == father_count {
            // The leaf was the tail: the previous child takes its place.
            let new_tail = father.child(heir - 1)?;
            father.remove_entry(heir - 1)?;
            father.set_tail_child(new_tail)?;
        } else {
            father.remove_entry(heir)?;
        }

        OverflowPage::release_chain(self.db, leaf.overflow_page()?)?;
        self.db.release_page(leaf_id)?;
        log::trace!("spliced out empty leaf {leaf_id}");

        if father.node.slot_count()? == 0 {
            Ok(Some(father_id))
        } else {
            Ok(None)
        }
    }

    /// Refills or merges away an interior node left with only its tail
    /// child. Returns the father when it became empty itself.
    fn fix_empty_interior(&self, page_id: u32, father_id: u32) -> Result<Option<u32>> {
        let father = Interior::open(self.db, father_id)?;
        let heir = father.child_index(page_id)?;
        let father_count = father.node.slot_count()?;
        if father_count == 0 {
            return Err(Error::Corrupt(format!(
                "interior node {father_id} has no separators"
            )));
        }
        let me = Interior::open(self.db, page_id)?;

        // Borrow the left sibling's tail child, rotating separators through
        // the father; else borrow the right sibling's first child.
        if heir > 0 {
            let left = Interior::open(self.db, father.child(heir - 1)?)?;
            let left_count = left.node.slot_count()?;
            if left_count >= 2 {
                let moved_id = left.tail_child()?;
                let promoted = left.node.key(left_count - 1)?;
                let new_left_tail = left.child(left_count - 1)?;
                let moved_total = Node::open(self.db, moved_id)?.total()?;
                left.set_tail_child(new_left_tail)?;
                left.remove_entry(left_count - 1)?;
                left.set_total(left.total()? - moved_total)?;

                let sep = father.node.key(heir - 1)?;
                me.insert_entry(0, &sep, moved_id)?;
                me.set_total(me.total()? + moved_total)?;
                Node::open(self.db, moved_id)?.set_father(page_id)?;
                father.set_key(heir - 1, &promoted)?;
                return Ok(None);
            }
        }
        if heir < father_count {
            let right = Interior::open(self.db, father.child(heir + 1)?)?;
            if right.node.slot_count()? >= 2 {
                let moved_id = right.child(0)?;
                let promoted = right.node.key(0)?;
                let moved_total = Node::open(self.db, moved_id)?.total()?;
                right.remove_entry(0)?;
                right.set_total(right.total()? - moved_total)?;

                let sep = father.node.key(heir)?;
                let my_tail = me.tail_child()?;
                me.insert_entry(0, &sep, my_tail)?;
                me.set_tail_child(moved_id)?;
                me.set_total(me.total()? + moved_total)?;
                Node::open(self.db, moved_id)?.set_father(page_id)?;
                father.set_key(heir, &promoted)?;
                return Ok(None);
            }
        }

        // No lender: hand the lone child to a sibling together with the
        // separator, and drop this node.
        let my_child = me.tail_child()?;
        let moved_total = Node::open(self.db, my_child)?.total()?;
        if heir > 0 {
            let left_id = father.child(heir - 1)?;
            let left = Interior::open(self.db, left_id)?;
            let sep = father.node.key(heir - 1)?;
            let pos = left.node.slot_count()?;
            left.insert_entry(pos, &sep, left.tail_child()?)?;
            left.set_tail_child(my_child)?;
            left.set_total(left.total()? + moved_total)?;
            Node::open(self.db, my_child)?.set_father(left_id)?;
            father.set_child(heir, left_id)?;
            father.remove_entry(heir - 1)?;
        } else {
            let right_id = father.child(heir + 1)?;
            let right = Interior::open(self.db, right_id)?;
            let sep = father.node.key(heir)?;
            right.insert_entry(0, &sep, my_child)?;
            right.set_total(right.total()? + moved_total)?;
            Node::open(self.db, my_child)?.set_father(right_id)?;
            father.remove_entry(heir)?;
        }
        self.db.release_page(page_id)?;
        log::trace!("merged away empty interior {page_id}");

        if father.node.slot_count()? == 0 {
            Ok(Some(father_id))
        } else {
            Ok(None)
        }
    }

    /// Verifies key order, father links, separator bounds and subtree totals
    /// over the whole tree. Returns the number of keys.
    pub fn check_consistency(&self) -> Result<u32> {
        let total = self.check_node(self.root.get(), 0, None, None)?;
        Ok(total)
    }

    fn check_node(
        &self,
        page_id: u32,
        expected_father: u32,
        lower: Option<&Payload>,
        upper: Option<&Payload>,
    ) -> Result<u32> {
        let node = Node::open(self.db, page_id)?;
        if node.father()? != expected_father {
            return Err(Error::Corrupt(format!(
                "page {page_id} has father {}, expected {expected_father}",
                node.father()?
            )));
        }
        let keys = node.keys()?;
        for pair in keys.windows(2) {
            if pair[0].key_cmp(&pair[1]) != Ordering::Less {
                return Err(Error::Corrupt(format!("keys out of order on page {page_id}")));
            }
        }
        for key in &keys {
            if let Some(lower) = lower {
                if key.key_cmp(lower) != Ordering::Greater {
                    return Err(Error::Corrupt(format!(
                        "key below its separator bound on page {page_id}"
                    )));
                }
            }
            if let Some(upper) = upper {
                if key.key_cmp(upper) == Ordering::Greater {
                    return Err(Error::Corrupt(format!(
                        "key above its separator bound on page {page_id}"
                    )));
                }
            }
        }

        if node.page_type() == PageType::BTreeLeaf {
            return Ok(keys.len() as u32);
        }

        let interior = Interior::from_node(node)?;
        let mut sum = 0u32;
        for index in 0..=keys.len() {
            let child_lower = if index == 0 { lower } else { Some(&keys[index - 1]) };
            let child_upper = if index == keys.len() { upper } else { Some(&keys[index]) };
            sum += self.check_node(interior.child(index)?, page_id, child_lower, child_upper)?;
        }
        let declared = interior.total()?;
        if declared != sum {
            return Err(Error::Corrupt(format!(
                "page {page_id} declares {declared} keys, subtree holds {sum}"
            )));
        }
        Ok(sum)
    }
}

fn types_str(types: &[FieldType]) -> String {
    types
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Ascending iterator over tree entries, following leaf sibling links.
pub struct TreeIter<'a> {
    db: &'a DbFile,
    leaf: u32,
    slot: usize,
}

impl Iterator for TreeIter<'_> {
    type Item = Result<(Payload, Payload)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.leaf == 0 {
                return None;
            }
            let leaf = match Leaf::open(self.db, self.leaf) {
                Ok(leaf) => leaf,
                Err(e) => {
                    self.leaf = 0;
                    return Some(Err(e));
                }
            };
            let count = match leaf.node.slot_count() {
                Ok(count) => count,
                Err(e) => {
                    self.leaf = 0;
                    return Some(Err(e));
                }
            };
            if self.slot < count {
                let entry = leaf.entry(self.slot);
                self.slot += 1;
                return Some(entry);
            }
            match leaf.right_sibling() {
                Ok(next) => {
                    self.leaf = next;
                    self.slot = 0;
                }
                Err(e) => {
                    self.leaf = 0;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::payload::Value;
    use super::*;
    use anyhow::Result;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use tempfile::tempdir;

    const KEY: [FieldType; 1] = [FieldType::Int];
    const VAL: [FieldType; 1] = [FieldType::Int];

    fn key(v: i32) -> Payload {
        Payload::from_values(&KEY, &[Value::Int(v)]).unwrap()
    }

    fn val(v: i32) -> Payload {
        Payload::from_values(&VAL, &[Value::Int(v)]).unwrap()
    }

    /// Small pages (5 entries per node) so a few dozen keys already build a
    /// tree several levels deep.
    fn small_tree(dir: &tempfile::TempDir) -> Result<DbFile> {
        Ok(DbFile::create_with(&dir.path().join("test.db"), 7, 32)?)
    }

    fn new_tree(db: &DbFile) -> Result<BPlusTree<'_>> {
        let page = db.alloc_page()?;
        Ok(BPlusTree::create(db, page, &KEY, &VAL)?)
    }

    #[test]
    fn test_insert_and_search() -> Result<()> {
        let dir = tempdir()?;
        let db = small_tree(&dir)?;
        let tree = new_tree(&db)?;

        for v in [5, 1, 9, 3, 7] {
            tree.insert(&key(v), &val(v * 10))?;
        }
        for v in [5, 1, 9, 3, 7] {
            let result = tree.search(&key(v))?;
            assert!(result.found());
            assert_eq!(tree.value(&result)?.get(0)?, Value::Int(v * 10));
        }
        assert!(!tree.search(&key(4))?.found());
        assert_eq!(tree.total()?, 5);
        Ok(())
    }

    #[test]
    fn test_duplicate_key_rejected() -> Result<()> {
        let dir = tempdir()?;
        let db = small_tree(&dir)?;
        let tree = new_tree(&db)?;

        tree.insert(&key(1), &val(1))?;
        assert!(matches!(
            tree.insert(&key(1), &val(2)),
            Err(Error::DuplicateKey)
        ));
        Ok(())
    }

    #[test]
    fn test_splits_keep_order_and_totals() -> Result<()> {
        let dir = tempdir()?;
        let db = small_tree(&dir)?;
        let tree = new_tree(&db)?;

        let mut keys: Vec<i32> = (0..200).collect();
        keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(42));
        for v in &keys {
            tree.insert(&key(*v), &val(*v))?;
            assert_eq!(tree.check_consistency()?, tree.total()?);
        }

        // The root must have split by now.
        let root = Node::open(&db, tree.root_page())?;
        assert_eq!(root.page_type(), PageType::BTreeInterior);
        assert_eq!(root.total()?, 200);
        let scanned: Vec<i32> = tree
            .iter()?
            .map(|entry| entry.unwrap().0.get(0).unwrap().as_int().unwrap())
            .collect();
        assert_eq!(scanned, (0..200).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_delete_rebalances() -> Result<()> {
        let dir = tempdir()?;
        let db = small_tree(&dir)?;
        let tree = new_tree(&db)?;

        let mut keys: Vec<i32> = (0..150).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        keys.shuffle(&mut rng);
        for v in &keys {
            tree.insert(&key(*v), &val(*v))?;
        }

        keys.shuffle(&mut rng);
        let (gone, kept) = keys.split_at(100);
        for v in gone {
            let result = tree.search(&key(*v))?;
            tree.delete(&result)?;
            assert_eq!(tree.check_consistency()?, tree.total()?);
        }

        for v in gone {
            assert!(!tree.search(&key(*v))?.found());
        }
        let mut expected: Vec<i32> = kept.to_vec();
        expected.sort_unstable();
        let scanned: Vec<i32> = tree
            .iter()?
            .map(|entry| entry.unwrap().0.get(0).unwrap().as_int().unwrap())
            .collect();
        assert_eq!(scanned, expected);
        Ok(())
    }

    #[test]
    fn test_delete_everything_collapses_root() -> Result<()> {
        let dir = tempdir()?;
        let db = small_tree(&dir)?;
        let tree = new_tree(&db)?;

        for v in 0..80 {
            tree.insert(&key(v), &val(v))?;
        }
        for v in 0..80 {
            let result = tree.search(&key(v))?;
            tree.delete(&result)?;
        }

        assert_eq!(tree.total()?, 0);
        // All the way back down to a single empty leaf.
        let root = Node::open(&db, tree.root_page())?;
        assert_eq!(root.page_type(), PageType::BTreeLeaf);
        assert_eq!(tree.iter()?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_delete_miss_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        let db = small_tree(&dir)?;
        let tree = new_tree(&db)?;

        tree.insert(&key(1), &val(1))?;
        let miss = tree.search(&key(2))?;
        assert!(matches!(tree.delete(&miss), Err(Error::KeyNotFound)));
        Ok(())
    }

    #[test]
    fn test_set_value_in_place() -> Result<()> {
        let dir = tempdir()?;
        let db = small_tree(&dir)?;
        let tree = new_tree(&db)?;

        for v in 0..30 {
            tree.insert(&key(v), &val(0))?;
        }
        let result = tree.search(&key(17))?;
        tree.set_value(&result, &val(99))?;
        assert_eq!(tree.value(&tree.search(&key(17))?)?.get(0)?, Value::Int(99));
        assert_eq!(tree.total()?, 30);
        Ok(())
    }

    #[test]
    fn test_mismatched_key_types_rejected() -> Result<()> {
        let dir = tempdir()?;
        let db = small_tree(&dir)?;
        let tree = new_tree(&db)?;

        let wrong = Payload::from_values(&[FieldType::Long], &[Value::Long(1)])?;
        assert!(matches!(
            tree.search(&wrong),
            Err(Error::TypeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_release_returns_every_page() -> Result<()> {
        let dir = tempdir()?;
        let db = small_tree(&dir)?;

        let allocated_before = db.header().get_u32("page_count")?;
        let free_before = db.header().get_u32("freelist_count")?;
        let tree = new_tree(&db)?;
        for v in 0..100 {
            tree.insert(&key(v), &val(v))?;
        }
        tree.release()?;

        let allocated_after = db.header().get_u32("page_count")?;
        let free_after = db.header().get_u32("freelist_count")?;
        assert_eq!(
            allocated_after - allocated_before,
            free_after - free_before
        );
        Ok(())
    }

    #[test]
    fn test_null_key_sorts_first() -> Result<()> {
        let dir = tempdir()?;
        let db = small_tree(&dir)?;
        let tree = new_tree(&db)?;

        tree.insert(&key(i32::MIN), &val(1))?;
        tree.insert(&Payload::from_values(&KEY, &[Value::Null])?, &val(0))?;
        tree.insert(&key(5), &val(2))?;

        let first = tree.iter()?.next().unwrap()?;
        assert!(first.0.get(0)?.is_null());
        assert!(tree
            .search(&Payload::from_values(&KEY, &[Value::Null])?)?
            .found());
        Ok(())
    }
}
