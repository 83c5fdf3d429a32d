//! Link-aware stat
//!
//! The walk and the observer only need a narrow slice of `struct stat`:
//! type, size, allocated blocks and times. `StatProvider` is the seam that
//! lets tests substitute a provider which fails on demand.

use crate::error::{Error, Result};
use nix::dir::Type;
use nix::fcntl::AtFlags;
use nix::sys::stat::{self as native, FileStat, SFlag};
use std::ffi::CStr;
use std::os::fd::RawFd;

/// Size in bytes of one unit of `st_blocks`
///
/// POSIX fixes this at 512 regardless of the filesystem block size.
pub const BLOCK_SIZE: u64 = 512;

/// Type of a filesystem object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Type not reported (some filesystems leave `d_type` empty)
    Unknown,
    /// Named pipe
    Fifo,
    /// Character device
    Char,
    /// Directory
    Dir,
    /// Block device
    Block,
    /// Regular file
    Regular,
    /// Symbolic link
    Link,
    /// Unix domain socket
    Socket,
}

impl FileKind {
    /// Interpret the type a directory stream reported, if any
    pub fn from_dir_type(kind: Option<Type>) -> Self {
        match kind {
            Some(Type::Fifo) => FileKind::Fifo,
            Some(Type::CharacterDevice) => FileKind::Char,
            Some(Type::Directory) => FileKind::Dir,
            Some(Type::BlockDevice) => FileKind::Block,
            Some(Type::File) => FileKind::Regular,
            Some(Type::Symlink) => FileKind::Link,
            Some(Type::Socket) => FileKind::Socket,
            None => FileKind::Unknown,
        }
    }

    /// Interpret the format bits of `st_mode`
    pub fn from_mode(mode: u32) -> Self {
        let format = SFlag::from_bits_truncate(mode) & SFlag::S_IFMT;
        [
            (SFlag::S_IFIFO, FileKind::Fifo),
            (SFlag::S_IFCHR, FileKind::Char),
            (SFlag::S_IFDIR, FileKind::Dir),
            (SFlag::S_IFBLK, FileKind::Block),
            (SFlag::S_IFREG, FileKind::Regular),
            (SFlag::S_IFLNK, FileKind::Link),
            (SFlag::S_IFSOCK, FileKind::Socket),
        ]
        .into_iter()
        .find(|(flag, _)| *flag == format)
        .map_or(FileKind::Unknown, |(_, kind)| kind)
    }

    pub fn is_dir(self) -> bool {
        self == FileKind::Dir
    }

    /// Single-letter tag in the style of `ls -l`
    pub fn symbol(self) -> char {
        match self {
            FileKind::Unknown => '?',
            FileKind::Fifo => 'p',
            FileKind::Char => 'c',
            FileKind::Dir => 'd',
            FileKind::Block => 'b',
            FileKind::Regular => '-',
            FileKind::Link => 'l',
            FileKind::Socket => 's',
        }
    }
}

/// Point in time as reported by stat
///
/// Every timestamp uses the same (seconds, nanoseconds) split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    /// Seconds since the Unix epoch
    pub secs: i64,
    /// Sub-second part, always < 1_000_000_000
    pub nanos: u32,
}

impl Timestamp {
    fn new(secs: i64, nanos: i64) -> Self {
        Self {
            secs,
            nanos: nanos.clamp(0, 999_999_999) as u32,
        }
    }
}

/// The parts of `struct stat` dirwatch cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub kind: FileKind,
    pub inode: u64,
    /// Permission bits and file format
    pub mode: u32,
    /// Logical size in bytes
    pub size: u64,
    /// Allocated blocks, in `BLOCK_SIZE` units
    pub blocks: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

impl Stat {
    /// Storage actually used, in bytes
    pub fn allocated_bytes(&self) -> u64 {
        self.blocks.saturating_mul(BLOCK_SIZE)
    }

    fn from_native(st: &FileStat) -> Self {
        let mode = st.st_mode as u32;
        Self {
            kind: FileKind::from_mode(mode),
            inode: st.st_ino as u64,
            mode,
            size: st.st_size.max(0) as u64,
            blocks: st.st_blocks.max(0) as u64,
            atime: Timestamp::new(st.st_atime as i64, st.st_atime_nsec as i64),
            mtime: Timestamp::new(st.st_mtime as i64, st.st_mtime_nsec as i64),
            ctime: Timestamp::new(st.st_ctime as i64, st.st_ctime_nsec as i64),
        }
    }
}

/// Source of stat information
pub trait StatProvider: Send + Sync {
    /// Stat without following a trailing symlink
    fn lstat(&self, path: &CStr) -> Result<Stat>;

    /// Stat following symlinks
    fn stat(&self, path: &CStr) -> Result<Stat>;

    /// Stat `name` inside the open directory `dirfd`, without following
    /// a trailing symlink
    fn lstat_at(&self, dirfd: RawFd, name: &[u8]) -> Result<Stat>;

    /// Dispatch on a follow flag
    fn stat_with(&self, path: &CStr, follow_symlink: bool) -> Result<Stat> {
        if follow_symlink {
            self.stat(path)
        } else {
            self.lstat(path)
        }
    }
}

/// Stat through the native calls
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeStat;

impl StatProvider for NativeStat {
    fn lstat(&self, path: &CStr) -> Result<Stat> {
        native::lstat(path)
            .map(|st| Stat::from_native(&st))
            .map_err(|e| Error::native("lstat", e))
    }

    fn stat(&self, path: &CStr) -> Result<Stat> {
        native::stat(path)
            .map(|st| Stat::from_native(&st))
            .map_err(|e| Error::native("stat", e))
    }

    fn lstat_at(&self, dirfd: RawFd, name: &[u8]) -> Result<Stat> {
        native::fstatat(dirfd, name, AtFlags::AT_SYMLINK_NOFOLLOW)
            .map(|st| Stat::from_native(&st))
            .map_err(|e| Error::native("fstatat", e))
    }
}
