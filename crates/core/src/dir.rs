//! Directory streams
//!
//! A `Directory` owns exactly one native stream. Closing takes the stream
//! out of the handle, so it is released once and a second close or a read
//! after close reports `AlreadyClosed` instead of touching a freed stream.

use crate::error::{Error, Result};
use crate::path;
use crate::stat::FileKind;
use crate::{Name, Traversal};
use nix::dir::{Dir, OwningIter};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, RawFd};
use tracing::warn;

/// One entry read from a directory stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (no NUL, no separator)
    pub name: Name,
    /// Inode number
    pub inode: u64,
    /// Type reported by the filesystem; may be `Unknown`
    pub kind: FileKind,
}

impl DirEntry {
    /// True for `.` and `..`
    pub fn is_self_or_parent(&self) -> bool {
        matches!(self.name.as_slice(), b"." | b"..")
    }
}

/// Open native directory stream
pub struct Directory {
    stream: Option<OwningIter>,
    path: Vec<u8>,
    include_dots: bool,
    exhausted: bool,
}

impl Directory {
    /// Open a directory stream
    ///
    /// With `follow_symlink` false a trailing symlink is refused by the
    /// kernel (ELOOP) instead of being resolved.
    pub fn open(path: &[u8], follow_symlink: bool) -> Result<Self> {
        let native = path::encode(path)?;
        let dir = retry_interrupted(|| {
            Dir::open(native.as_c_str(), open_flags(follow_symlink), Mode::empty())
        })
        .map_err(|e| Error::native("open", e))?;
        Ok(Self::from_dir(dir, path.to_vec()))
    }

    /// Open the subdirectory `name` of this stream
    ///
    /// `name` is resolved against this stream's descriptor rather than a
    /// joined path, so nesting depth is not bounded by PATH_MAX. A symlink
    /// named `name` is refused.
    pub fn open_child(&self, name: &[u8]) -> Result<Directory> {
        let dirfd = self.raw_fd()?;
        let dir = retry_interrupted(|| Dir::openat(dirfd, name, open_flags(false), Mode::empty()))
            .map_err(|e| Error::native("openat", e))?;
        Ok(Self::from_dir(dir, path::join(&self.path, name)))
    }

    fn from_dir(dir: Dir, path: Vec<u8>) -> Self {
        Self {
            stream: Some(dir.into_iter()),
            path,
            include_dots: false,
            exhausted: false,
        }
    }

    /// Surface `.` and `..` as regular entries
    pub fn include_dots(mut self, include: bool) -> Self {
        self.include_dots = include;
        self
    }

    /// Path this stream was opened on
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Descriptor backing the stream, for `*at` calls on its entries
    pub fn raw_fd(&self) -> Result<RawFd> {
        self.stream
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(Error::AlreadyClosed("directory"))
    }

    /// Advance the native cursor by one entry
    ///
    /// Returns `Ok(None)` at end of stream. Filtered dot entries consume a
    /// cursor step each but are never returned unless `include_dots` is set.
    pub fn next_entry(&mut self) -> Result<Option<DirEntry>> {
        let stream = self.stream.as_mut().ok_or(Error::AlreadyClosed("directory"))?;

        for raw in stream {
            let raw = raw.map_err(|e| Error::native("readdir", e))?;
            let entry = DirEntry {
                name: Name::from_slice(raw.file_name().to_bytes()),
                inode: raw.ino(),
                kind: FileKind::from_dir_type(raw.file_type()),
            };

            if !self.include_dots && entry.is_self_or_parent() {
                continue;
            }
            return Ok(Some(entry));
        }
        Ok(None)
    }

    /// Release the native stream
    ///
    /// The stream is taken out of the handle before `closedir` runs, so it
    /// is released exactly once.
    pub fn close(&mut self) -> Result<()> {
        let stream = self.stream.take().ok_or(Error::AlreadyClosed("directory"))?;
        drop(stream);
        Ok(())
    }
}

fn open_flags(follow_symlink: bool) -> OFlag {
    let mut flags = OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC;
    if !follow_symlink {
        flags |= OFlag::O_NOFOLLOW;
    }
    flags
}

fn retry_interrupted<T>(mut call: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match call() {
            Err(Errno::EINTR) => continue,
            result => return result,
        }
    }
}

impl Iterator for Directory {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted || self.stream.is_none() {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.exhausted = true;
                None
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for Directory {}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("path", &path::display(&self.path))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Options for a flat listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    /// Resolve a trailing symlink on the listed path
    pub follow_symlink: bool,
    /// Report `.` and `..`
    pub include_dots: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            follow_symlink: true,
            include_dots: false,
        }
    }
}

/// Stream the entries of one directory to a visitor
///
/// The stream is closed on every exit path: natural end, visitor stop, and
/// mid-stream failure.
pub fn list<F>(path: &[u8], options: ListOptions, mut visit: F) -> Result<Traversal>
where
    F: FnMut(&DirEntry) -> ControlFlow<()>,
{
    let mut dir = Directory::open(path, options.follow_symlink)?.include_dots(options.include_dots);

    let outcome = loop {
        match dir.next_entry() {
            Ok(Some(entry)) => {
                if visit(&entry).is_break() {
                    break Ok(Traversal::Stopped);
                }
            }
            Ok(None) => break Ok(Traversal::Completed),
            Err(e) => break Err(e),
        }
    };

    match (outcome, dir.close()) {
        (Ok(traversal), Ok(())) => Ok(traversal),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(e), close_result) => {
            if let Err(close_err) = close_result {
                warn!("Failed to close {} after error: {}", path::display(path), close_err);
            }
            Err(e)
        }
    }
}
