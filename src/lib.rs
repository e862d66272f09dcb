//! An embedded, single-file paged storage engine.
//!
//! A [`DbFile`] is a flat file of fixed-size pages fronted by an LRU page
//! cache. On top of the pages sit typed B+Trees ([`BPlusTree`]) whose rows
//! are [`Payload`]s of fixed-width columns, a [`Schema`] directory mapping
//! table names to tree roots, and shadow-paging transactions ([`Txn`]) with
//! crash recovery on open.

pub mod btree;
pub mod cache;
pub mod codec;
pub mod error;
pub mod file;
pub mod overflow;
pub mod page;
pub mod schema;
pub mod txn;

pub use btree::payload::{FieldType, Payload, Value};
pub use btree::{BPlusTree, SearchResult, TreeIter};
pub use error::{Error, Result};
pub use file::DbFile;
pub use schema::{Schema, Table};
pub use txn::Txn;
