//! Treeline common types, errors, and page codecs.
//!
//! This crate provides the definitions shared across all Treeline components:
//! the error taxonomy, storage configuration, transaction identifiers, the
//! fixed-width field/tuple model, and the four on-disk page kinds with their
//! bit-exact codecs.

pub mod config;
pub mod error;
pub mod page;
pub mod transaction;
pub mod tuple;
pub mod types;

pub use config::StorageConfig;
pub use error::{Result, TreelineError};
pub use page::{PageId, PageKind, TreePage, PAGE_SIZE, ROOT_PTR_SIZE};
pub use transaction::TransactionId;
pub use tuple::{RecordId, Tuple, TupleLayout};
pub use types::{Field, FieldType, IndexPredicate, Op};
