//! LatticeDB persistent B+ tree index engine.
//!
//! Maps variable-length encoded keys to primary-key / row-locator pairs,
//! stores each tree node as a fixed-size page on disk, and supports
//! duplicate keys via secondary ordering on the primary key. Equality
//! lookup, range iteration, ordered traversal, and deletion sit on three
//! layers:
//!
//! 1. the buffer pool (`lattice-buffer`), which bounds the resident set
//!    and tracks dirty pages;
//! 2. the node manager, which turns fetched pages into typed node views
//!    and owns the superblock;
//! 3. the B+ tree algorithm layer, which makes single root-to-leaf
//!    passes with proactive splitting and merging.
//!
//! ```no_run
//! use lattice_common::{RowId, TreeOptions};
//! use lattice_common::types::encode_i64;
//! use lattice_index::{Bound, BPlusTree};
//!
//! # fn main() -> lattice_common::Result<()> {
//! let mut tree = BPlusTree::open("users_age.lat", TreeOptions::default())?;
//! tree.insert(&encode_i64(42), 1, RowId(17))?;
//! tree.range_scan(Bound::Ge(&encode_i64(40)), |row| {
//!     println!("{row}");
//!     true
//! })?;
//! tree.close()
//! # }
//! ```

pub mod manager;
pub mod node;
pub mod superblock;
pub mod tree;

pub use manager::NodeManager;
pub use node::{NodeLayout, NodeMut, NodeRef};
pub use superblock::Superblock;
pub use tree::{BPlusTree, Bound};
