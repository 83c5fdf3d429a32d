//! Kernel event record decoding
//!
//! Wire format, native endian:
//! ```text
//! watch_id: i32 | mask: u32 | cookie: u32 | name_length: u32 | name[name_length]
//! ```
//! `name` is NUL-padded and only present when `name_length > 0`. A single
//! read returns whole records back to back; the decoder walks the buffer
//! `HEADER_SIZE + name_length` bytes at a time.

use crate::mask::EventMask;
use dirwatch_core::Name;

/// Size of the fixed record header
pub const HEADER_SIZE: usize = 16;

/// Longest name the kernel reports (NAME_MAX)
pub const MAX_NAME_LEN: usize = 255;

/// Smallest read buffer guaranteed to hold one record
pub const MIN_BUFFER_SIZE: usize = HEADER_SIZE + MAX_NAME_LEN + 1;

/// Watch handle as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub i32);

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wd:{}", self.0)
    }
}

/// One decoded change record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub watch: WatchId,
    pub mask: EventMask,
    /// Pairs a MOVED_FROM with its MOVED_TO; zero otherwise
    pub cookie: u32,
    /// Child name, for events about an entry of a watched directory
    pub name: Option<Name>,
}

impl ChangeEvent {
    /// True when the event concerns a child rather than the watch itself
    pub fn is_child(&self) -> bool {
        self.name.is_some()
    }

    /// The kernel lost events; observers must rescan
    pub fn is_overflow(&self) -> bool {
        self.mask.contains(EventMask::QUEUE_OVERFLOWED)
    }
}

/// Iterator over the records in one read buffer
#[derive(Debug, Clone)]
pub struct Records<'a> {
    buf: &'a [u8],
    truncated: bool,
}

/// Decode the records in `buf`
pub fn decode(buf: &[u8]) -> Records<'_> {
    Records {
        buf,
        truncated: false,
    }
}

impl Records<'_> {
    /// True if trailing bytes did not form a whole record
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl Iterator for Records<'_> {
    type Item = ChangeEvent;

    fn next(&mut self) -> Option<ChangeEvent> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < HEADER_SIZE {
            self.truncated = true;
            self.buf = &[];
            return None;
        }

        let (header, rest) = self.buf.split_at(HEADER_SIZE);
        let field = |i: usize| -> [u8; 4] {
            [header[i], header[i + 1], header[i + 2], header[i + 3]]
        };
        let watch = WatchId(i32::from_ne_bytes(field(0)));
        let mask = EventMask::from_bits_retain(u32::from_ne_bytes(field(4)));
        let cookie = u32::from_ne_bytes(field(8));
        let name_len = u32::from_ne_bytes(field(12)) as usize;

        if rest.len() < name_len {
            self.truncated = true;
            self.buf = &[];
            return None;
        }

        let (raw_name, rest) = rest.split_at(name_len);
        self.buf = rest;

        let name = (name_len > 0).then(|| {
            let end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
            Name::from_slice(&raw_name[..end])
        });

        Some(ChangeEvent {
            watch,
            mask,
            cookie,
            name,
        })
    }
}

impl std::iter::FusedIterator for Records<'_> {}

/// Encode one record the way the kernel lays it out
///
/// The name is NUL-terminated and padded to a multiple of the header
/// alignment. Used to feed synthetic queues.
pub fn encode_record(watch: WatchId, mask: EventMask, cookie: u32, name: Option<&[u8]>) -> Vec<u8> {
    let name_len = match name {
        Some(name) => (name.len() + 1).next_multiple_of(4),
        None => 0,
    };

    let mut record = Vec::with_capacity(HEADER_SIZE + name_len);
    record.extend_from_slice(&watch.0.to_ne_bytes());
    record.extend_from_slice(&mask.bits().to_ne_bytes());
    record.extend_from_slice(&cookie.to_ne_bytes());
    record.extend_from_slice(&(name_len as u32).to_ne_bytes());
    if let Some(name) = name {
        record.extend_from_slice(name);
        record.resize(HEADER_SIZE + name_len, 0);
    }
    record
}
