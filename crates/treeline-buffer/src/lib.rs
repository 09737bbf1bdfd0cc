//! Buffer management for Treeline.
//!
//! This crate provides:
//! - Page-granular shared/exclusive locking with timeout-based deadlock
//!   avoidance
//! - A bounded page cache with LRU eviction of clean pages (NO-STEAL)
//! - Transaction-scoped commit/abort with before-image restoration

mod lock;
mod pool;

pub use lock::{LockManager, LockMode};
pub use pool::{BufferPool, PageHandle, PageSource};
