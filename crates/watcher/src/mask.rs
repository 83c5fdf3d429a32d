//! Inotify event mask bits

use bitflags::bitflags;

bitflags! {
    /// Bitset carried by every change record, also used as the interest
    /// mask when adding a watch
    ///
    /// Values are the kernel's own, so masks pass through unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        /// File was read
        const ACCESSED = 0x0000_0001;
        /// File content was written
        const MODIFIED = 0x0000_0002;
        /// Metadata changed
        const ATTRIBUTE_CHANGED = 0x0000_0004;
        /// File opened for writing was closed
        const CLOSED_WRITE = 0x0000_0008;
        /// File opened read-only was closed
        const CLOSED_NO_WRITE = 0x0000_0010;
        /// File was opened
        const OPENED = 0x0000_0020;
        /// Child was moved out of the watched directory
        const MOVED_FROM = 0x0000_0040;
        /// Child was moved into the watched directory
        const MOVED_TO = 0x0000_0080;
        /// Child was created
        const CREATED = 0x0000_0100;
        /// Child was deleted
        const DELETED = 0x0000_0200;
        /// Watched object itself was deleted
        const SELF_DELETED = 0x0000_0400;
        /// Watched object itself was moved
        const SELF_MOVED = 0x0000_0800;

        /// Backing filesystem was unmounted
        const UNMOUNTED = 0x0000_2000;
        /// Kernel queue overflowed and events were lost
        const QUEUE_OVERFLOWED = 0x0000_4000;
        /// Watch was removed, explicitly or by the kernel
        const WATCH_IGNORED = 0x0000_8000;

        /// Only watch the path if it is a directory (add-watch flag)
        const ONLY_DIR = 0x0100_0000;
        /// Do not follow a trailing symlink (add-watch flag)
        const DONT_FOLLOW = 0x0200_0000;
        /// Merge into an existing watch's mask (add-watch flag)
        const MASK_ADD = 0x2000_0000;
        /// Subject of the event is a directory
        const IS_DIRECTORY = 0x4000_0000;
        /// Remove the watch after the first event
        const ONE_SHOT = 0x8000_0000;
    }
}

impl EventMask {
    /// Every event a watch can report
    pub const ALL_EVENTS: EventMask = EventMask::from_bits_truncate(0x0000_0fff);

    /// Mask for a flag-controlled add that refuses trailing symlinks
    pub fn follow(self, follow_symlink: bool) -> Self {
        if follow_symlink {
            self
        } else {
            self | EventMask::DONT_FOLLOW
        }
    }

    /// Names of the set bits, in bit order
    pub fn names(self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

impl std::fmt::Display for EventMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        f.write_str(&self.names().join("|"))
    }
}
