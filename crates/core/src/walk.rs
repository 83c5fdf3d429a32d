//! Physical tree walk with per-object size reporting
//!
//! The walk is depth-first and pre-order. Every object is reported once,
//! directories included; there is no second "directory finished" visit.
//! Symlinks below the root are reported as links and never descended into.
//!
//! Objects below the root are reached relative to their parent's open
//! stream (`fstatat`/`openat`), never through a joined path, so the depth
//! of a tree is not limited by PATH_MAX.

use crate::cancel::CancelToken;
use crate::dir::Directory;
use crate::error::{Error, Result};
use crate::path;
use crate::stat::{NativeStat, Stat, StatProvider};
use crate::Traversal;
use std::ops::ControlFlow;
use tracing::{debug, warn};

/// Sizes of one visited object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeSample {
    /// Logical size in bytes
    pub logical_size: u64,
    /// Allocated storage in bytes
    pub allocated_bytes: u64,
}

impl From<&Stat> for SizeSample {
    fn from(st: &Stat) -> Self {
        Self {
            logical_size: st.size,
            allocated_bytes: st.allocated_bytes(),
        }
    }
}

/// Aggregate of a completed walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeSize {
    pub objects: u64,
    pub logical_size: u64,
    pub allocated_bytes: u64,
}

impl TreeSize {
    pub fn add(&mut self, sample: SizeSample) {
        self.objects += 1;
        self.logical_size += sample.logical_size;
        self.allocated_bytes += sample.allocated_bytes;
    }
}

/// Configurable tree walker
///
/// Opening the root is the only hard failure besides closing a stream;
/// objects that vanish or cannot be read below the root are skipped.
#[derive(Debug, Clone)]
pub struct TreeWalker<S = NativeStat> {
    stat: S,
    follow_root_symlink: bool,
    cancel: Option<CancelToken>,
}

impl TreeWalker<NativeStat> {
    pub fn new() -> Self {
        Self::with_stat(NativeStat)
    }
}

impl Default for TreeWalker<NativeStat> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StatProvider> TreeWalker<S> {
    /// Walker using a custom stat provider
    pub fn with_stat(stat: S) -> Self {
        Self {
            stat,
            follow_root_symlink: false,
            cancel: None,
        }
    }

    /// Resolve a symlink at the root itself (never below it)
    pub fn follow_root_symlink(mut self, follow: bool) -> Self {
        self.follow_root_symlink = follow;
        self
    }

    /// Abort with `Error::Cancelled` once the token is tripped
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Walk `root`, reporting each object to `visit`
    ///
    /// Returns `Traversal::Stopped` when the visitor breaks. Every open
    /// stream is closed explicitly before returning, on every path; a
    /// close failure is reported unless the walk already failed.
    pub fn walk<F>(&self, root: &[u8], mut visit: F) -> Result<Traversal>
    where
        F: FnMut(SizeSample) -> ControlFlow<()>,
    {
        self.check_cancelled()?;

        let native = path::encode(root)?;
        let root_stat = self.stat.stat_with(&native, self.follow_root_symlink)?;
        if visit(SizeSample::from(&root_stat)).is_break() {
            return Ok(Traversal::Stopped);
        }
        if !root_stat.kind.is_dir() {
            return Ok(Traversal::Completed);
        }

        let mut stack = vec![Directory::open(root, self.follow_root_symlink)?];
        let outcome = self.descend(&mut stack, &mut visit);
        finish(&mut stack, outcome)
    }

    fn descend<F>(&self, stack: &mut Vec<Directory>, visit: &mut F) -> Result<Traversal>
    where
        F: FnMut(SizeSample) -> ControlFlow<()>,
    {
        loop {
            self.check_cancelled()?;

            let depth = stack.len();
            let Some(dir) = stack.last_mut() else {
                return Ok(Traversal::Completed);
            };

            let entry = match dir.next_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    if let Some(mut finished) = stack.pop() {
                        finished.close()?;
                    }
                    continue;
                }
                Err(e) if depth == 1 => return Err(e),
                Err(e) => {
                    debug!("Abandoning {}: {}", path::display(dir.path()), e);
                    if let Some(mut abandoned) = stack.pop() {
                        abandoned.close()?;
                    }
                    continue;
                }
            };

            let st = match dir.raw_fd().and_then(|fd| self.stat.lstat_at(fd, &entry.name)) {
                Ok(st) => st,
                Err(e) => {
                    // Typically the object was removed after readdir saw it
                    debug!(
                        "Skipping {}: {}",
                        path::display(&path::join(dir.path(), &entry.name)),
                        e
                    );
                    continue;
                }
            };

            if visit(SizeSample::from(&st)).is_break() {
                return Ok(Traversal::Stopped);
            }

            if st.kind.is_dir() {
                match dir.open_child(&entry.name) {
                    Ok(sub) => stack.push(sub),
                    Err(e) => debug!("Not descending into {}: {}", path::display(&entry.name), e),
                }
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Close whatever the walk left open
///
/// The walk's own error wins over a close failure; otherwise the first
/// close failure is the result.
fn finish(stack: &mut Vec<Directory>, outcome: Result<Traversal>) -> Result<Traversal> {
    match (outcome, close_all(stack)) {
        (Ok(traversal), Ok(())) => Ok(traversal),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!("Failed to close a directory after error: {}", close_err);
            Err(e)
        }
    }
}

/// Close every stream, innermost first, reporting the first failure
fn close_all(stack: &mut Vec<Directory>) -> Result<()> {
    let mut first_error = None;
    while let Some(mut dir) = stack.pop() {
        if let Err(e) = dir.close() {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Walk with the native stat provider
pub fn walk_sizes<F>(root: &[u8], follow_top_level_symlink: bool, visit: F) -> Result<Traversal>
where
    F: FnMut(SizeSample) -> ControlFlow<()>,
{
    TreeWalker::new()
        .follow_root_symlink(follow_top_level_symlink)
        .walk(root, visit)
}

/// Sum every object under `root`
pub fn total_size(root: &[u8], follow_top_level_symlink: bool) -> Result<TreeSize> {
    let mut total = TreeSize::default();
    walk_sizes(root, follow_top_level_symlink, |sample| {
        total.add(sample);
        ControlFlow::Continue(())
    })?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{self, OFlag};
    use nix::sys::stat::{mkdirat, Mode};
    use nix::unistd;
    use std::ffi::CStr;
    use std::fs;
    use std::os::fd::RawFd;
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn bytes(p: &Path) -> &[u8] {
        path::from_path(p)
    }

    /// Tree with 4 regular files and 3 directories (root included)
    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("top.txt"), vec![1u8; 1500]).unwrap();
        fs::write(root.join("a/one.txt"), vec![2u8; 10]).unwrap();
        fs::write(root.join("a/b/two.txt"), vec![3u8; 70_000]).unwrap();
        fs::write(root.join("a/b/empty"), b"").unwrap();
    }

    fn count(root: &[u8], follow: bool) -> usize {
        let mut visits = 0;
        walk_sizes(root, follow, |_| {
            visits += 1;
            ControlFlow::Continue(())
        })
        .unwrap();
        visits
    }

    #[test]
    fn test_visits_each_object_once() {
        let temp_dir = TempDir::new().unwrap();
        build_tree(temp_dir.path());

        let mut samples = Vec::new();
        let outcome = walk_sizes(bytes(temp_dir.path()), false, |s| {
            samples.push(s);
            ControlFlow::Continue(())
        })
        .unwrap();

        assert_eq!(outcome, Traversal::Completed);
        assert_eq!(samples.len(), 7);
    }

    #[test]
    fn test_sizes_match_independent_stat() {
        let temp_dir = TempDir::new().unwrap();
        build_tree(temp_dir.path());

        let (mut logical, mut allocated, mut objects) = (0u64, 0u64, 0u64);
        for entry in WalkDir::new(temp_dir.path()).follow_links(false) {
            let metadata = entry.unwrap().metadata().unwrap();
            logical += metadata.len();
            allocated += metadata.blocks() * 512;
            objects += 1;
        }

        let total = total_size(bytes(temp_dir.path()), false).unwrap();
        assert_eq!(total.objects, objects);
        assert_eq!(total.logical_size, logical);
        assert_eq!(total.allocated_bytes, allocated);
    }

    #[test]
    fn test_root_symlink_followed_only_on_request() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("x"), b"x").unwrap();
        fs::write(target.join("y"), b"y").unwrap();
        let link = temp_dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        // The link object alone
        assert_eq!(count(bytes(&link), false), 1);
        // Target directory plus its two files
        assert_eq!(count(bytes(&link), true), 3);
    }

    #[test]
    fn test_nested_symlink_never_followed() {
        let temp_dir = TempDir::new().unwrap();
        let outside = temp_dir.path().join("outside");
        fs::create_dir(&outside).unwrap();
        for i in 0..5 {
            fs::write(outside.join(format!("f{i}")), b"data").unwrap();
        }

        let root = temp_dir.path().join("root");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("file"), b"data").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();
        // A cycle back to the root must not be a problem either
        std::os::unix::fs::symlink(&root, root.join("loop")).unwrap();

        // root, file, link, loop
        assert_eq!(count(bytes(&root), false), 4);
        assert_eq!(count(bytes(&root), true), 4);
    }

    #[test]
    fn test_stop_after_k_objects() {
        let temp_dir = TempDir::new().unwrap();
        build_tree(temp_dir.path());

        for k in 1..=7 {
            let mut visits = 0;
            let outcome = walk_sizes(bytes(temp_dir.path()), false, |_| {
                visits += 1;
                if visits == k {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();

            assert_eq!(outcome, Traversal::Stopped);
            assert_eq!(visits, k);
        }
    }

    #[test]
    fn test_cancel_token_checked_at_every_node() {
        let temp_dir = TempDir::new().unwrap();
        build_tree(temp_dir.path());

        let token = CancelToken::new();
        let walker = TreeWalker::new().cancel_token(token.clone());

        let mut visits = 0;
        let result = walker.walk(bytes(temp_dir.path()), |_| {
            visits += 1;
            if visits == 2 {
                token.cancel();
            }
            ControlFlow::Continue(())
        });

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(visits, 2);
    }

    /// Fails lstat for any entry named "doomed", as if it vanished
    struct VanishingStat;

    impl StatProvider for VanishingStat {
        fn lstat(&self, path: &CStr) -> Result<Stat> {
            NativeStat.lstat(path)
        }

        fn stat(&self, path: &CStr) -> Result<Stat> {
            NativeStat.stat(path)
        }

        fn lstat_at(&self, dirfd: RawFd, name: &[u8]) -> Result<Stat> {
            if name == b"doomed" {
                return Err(Error::native("fstatat", nix::errno::Errno::ENOENT));
            }
            NativeStat.lstat_at(dirfd, name)
        }
    }

    #[test]
    fn test_vanished_object_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        build_tree(temp_dir.path());
        fs::create_dir(temp_dir.path().join("doomed")).unwrap();
        fs::write(temp_dir.path().join("doomed/hidden"), b"").unwrap();

        let mut visits = 0;
        let outcome = TreeWalker::with_stat(VanishingStat)
            .walk(bytes(temp_dir.path()), |_| {
                visits += 1;
                ControlFlow::Continue(())
            })
            .unwrap();

        // The skipped directory is neither reported nor descended into
        assert_eq!(outcome, Traversal::Completed);
        assert_eq!(visits, 7);
    }

    #[test]
    fn test_missing_root_is_hard_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = total_size(bytes(&temp_dir.path().join("missing")), false).unwrap_err();
        assert_eq!(err.errno(), Some(nix::errno::Errno::ENOENT));
    }

    #[test]
    fn test_regular_file_root() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("file");
        fs::write(&file, vec![0u8; 123]).unwrap();

        let total = total_size(bytes(&file), false).unwrap();
        assert_eq!(total.objects, 1);
        assert_eq!(total.logical_size, 123);
    }

    #[test]
    fn test_tree_deeper_than_path_max() {
        let temp_dir = TempDir::new().unwrap();
        let name = "d".repeat(200);
        let dir_flags = OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC;

        // 30 levels of 200-byte names is well past PATH_MAX, so the chain
        // has to be built one level at a time
        let mut fd = fcntl::open(temp_dir.path(), dir_flags, Mode::empty()).unwrap();
        for _ in 0..30 {
            mkdirat(fd, name.as_str(), Mode::S_IRWXU).unwrap();
            let next = fcntl::openat(fd, name.as_str(), dir_flags, Mode::empty()).unwrap();
            unistd::close(fd).unwrap();
            fd = next;
        }
        let leaf = fcntl::openat(
            fd,
            "leaf",
            OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .unwrap();
        unistd::write(leaf, b"bottom").unwrap();
        unistd::close(leaf).unwrap();
        unistd::close(fd).unwrap();

        let mut samples = Vec::new();
        let outcome = walk_sizes(bytes(temp_dir.path()), false, |s| {
            samples.push(s);
            ControlFlow::Continue(())
        })
        .unwrap();

        // The root, 30 directories and the leaf
        assert_eq!(outcome, Traversal::Completed);
        assert_eq!(samples.len(), 32);
        assert!(samples.iter().any(|s| s.logical_size == 6));
    }

    #[test]
    fn test_close_all_reports_first_failure() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("a")).unwrap();

        let outer = Directory::open(bytes(temp_dir.path()), false).unwrap();
        let mut already_closed = outer.open_child(b"a").unwrap();
        already_closed.close().unwrap();
        let inner = outer.open_child(b"a").unwrap();

        let mut stack = vec![outer, already_closed, inner];
        let err = close_all(&mut stack).unwrap_err();
        assert!(matches!(err, Error::AlreadyClosed("directory")));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_close_failure_surfaces_on_stop() {
        let temp_dir = TempDir::new().unwrap();
        let outer = Directory::open(bytes(temp_dir.path()), false).unwrap();
        let mut closed = Directory::open(bytes(temp_dir.path()), false).unwrap();
        closed.close().unwrap();

        let mut stack = vec![outer, closed];
        let err = finish(&mut stack, Ok(Traversal::Stopped)).unwrap_err();
        assert!(matches!(err, Error::AlreadyClosed(_)));

        // The walk's own error is kept over a close failure
        let mut closed = Directory::open(bytes(temp_dir.path()), false).unwrap();
        closed.close().unwrap();
        let mut stack = vec![closed];
        assert!(matches!(
            finish(&mut stack, Err(Error::Cancelled)),
            Err(Error::Cancelled)
        ));
    }
}
