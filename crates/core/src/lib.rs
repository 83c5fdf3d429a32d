//! Native filesystem primitives for dirwatch
//!
//! This crate provides:
//! - Byte-oriented path encoding (no assumed text encoding)
//! - Link-aware stat with allocated-size reporting
//! - Directory streams with explicit, checked close
//! - Physical tree walks reporting per-object sizes
//! - The shared error taxonomy used by the watcher crate

pub mod cancel;
pub mod dir;
pub mod error;
pub mod path;
pub mod stat;
pub mod walk;

// Re-exports
pub use cancel::CancelToken;
pub use dir::{list, DirEntry, Directory, ListOptions};
pub use error::{Error, Result};
pub use stat::{FileKind, NativeStat, Stat, StatProvider, Timestamp, BLOCK_SIZE};
pub use walk::{total_size, walk_sizes, SizeSample, TreeSize, TreeWalker};

use smallvec::SmallVec;

/// A single path component (directory entry or event name)
///
/// Names are raw bytes; most fit inline without a heap allocation.
pub type Name = SmallVec<[u8; 64]>;

/// How a streaming operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// Every entry was delivered
    Completed,
    /// The visitor asked to stop early
    Stopped,
}
