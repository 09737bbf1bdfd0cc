//! Storage engine for Treeline.
//!
//! This crate provides:
//! - A single-file page store with the root-pointer-page layout
//! - The disk-backed B+ tree engine: search, insert, delete, split, merge,
//!   redistribution, and free-page recycling
//! - Ordered full-scan and predicated index-scan iterators
//! - A tree consistency checker for tests and embedders

mod btree;
mod file;

pub use btree::{check_tree, BTreeIndex, TreeIterator, TreeSearchIterator};
pub use file::TreeFile;
