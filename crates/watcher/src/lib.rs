//! Change notification for dirwatch
//!
//! This crate provides:
//! - The kernel event mask and record decoder
//! - A watch table owning one event queue and its watches
//! - A blocking event reader with prompt, race-free stop
//! - Directory observation translated to create/delete/modify
//!
//! Linux only: built directly on inotify.

pub mod event;
pub mod mask;
pub mod observe;
pub mod reader;
pub mod table;
mod wake;

// Re-exports
pub use event::{decode, encode_record, ChangeEvent, Records, WatchId, HEADER_SIZE, MAX_NAME_LEN, MIN_BUFFER_SIZE};
pub use mask::EventMask;
pub use observe::{Observation, ObserveOptions, ObservedKind, Observer, CHILD_DIR_MASK, ROOT_MASK};
pub use reader::{
    ChannelSink, EventSink, EventStreamReader, ReaderState, ReaderStats, ReaderThread, StopHandle,
    DEFAULT_BUFFER_SIZE,
};
pub use table::{QueueHandle, WatchDescriptor, WatchTable};

pub use dirwatch_core::{Error, Result};
