//! Watch table: one kernel event queue plus the watches registered on it
//!
//! The table maps live watch ids back to the paths they were added for.
//! Every mutation goes through one lock, so concurrent add/remove callers
//! never corrupt the mapping. The queue descriptor itself is shared with
//! readers through [`QueueHandle`]; closing it wakes those readers first and
//! then releases the descriptor exactly once.

use crate::event::WatchId;
use crate::mask::EventMask;
use crate::wake::Waker;
use ahash::AHashMap;
use dirwatch_core::{path, Error, Result};
use nix::errno::Errno;
use nix::sys::inotify::{InitFlags, Inotify};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::ffi::CStr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Descriptor behind a queue
pub(crate) enum QueueFd {
    /// Kernel inotify instance
    Inotify(Inotify),
    /// Any other descriptor carrying wire-format records
    Stream(OwnedFd),
}

impl AsFd for QueueFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            QueueFd::Inotify(inotify) => inotify.as_fd(),
            QueueFd::Stream(fd) => fd.as_fd(),
        }
    }
}

struct Queue {
    fd: RwLock<Option<QueueFd>>,
    closed: AtomicBool,
    wakers: Mutex<Vec<Weak<Waker>>>,
}

/// Shared handle on a kernel event queue
///
/// Cloning is cheap; all clones refer to the same queue.
#[derive(Clone)]
pub struct QueueHandle {
    inner: Arc<Queue>,
}

impl QueueHandle {
    /// Wrap an already-open descriptor
    ///
    /// Anything that yields kernel-format records works, which lets tests
    /// drive a reader from a socket pair.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self::with_fd(Some(QueueFd::Stream(fd)))
    }

    fn from_inotify(inotify: Inotify) -> Self {
        Self::with_fd(Some(QueueFd::Inotify(inotify)))
    }

    /// A queue that is already closed and never had a descriptor
    pub(crate) fn detached() -> Self {
        let queue = Self::with_fd(None);
        queue.inner.closed.store(true, Ordering::Release);
        queue
    }

    fn with_fd(fd: Option<QueueFd>) -> Self {
        Self {
            inner: Arc::new(Queue {
                fd: RwLock::new(fd),
                closed: AtomicBool::new(false),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Raw descriptor, or `None` once closed
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.inner.fd.read().as_ref().map(|fd| fd.as_fd().as_raw_fd())
    }

    /// Release the queue
    ///
    /// Readers registered on the queue are woken and observe the closed
    /// state; the descriptor is closed once none of them is inside a read.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed("event queue"));
        }

        for waker in self.inner.wakers.lock().drain(..) {
            if let Some(waker) = waker.upgrade() {
                waker.wake();
            }
        }

        let fd = self.inner.fd.write().take();
        drop(fd);
        Ok(())
    }

    pub(crate) fn same_queue(&self, other: &QueueHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Hold the descriptor open for the duration of one syscall
    pub(crate) fn lock_fd(&self) -> RwLockReadGuard<'_, Option<QueueFd>> {
        self.inner.fd.read()
    }

    pub(crate) fn register_waker(&self, waker: &Arc<Waker>) {
        let mut wakers = self.inner.wakers.lock();
        wakers.retain(|w| w.strong_count() > 0);
        wakers.push(Arc::downgrade(waker));
    }
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("fd", &self.raw_fd())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A registered watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchDescriptor {
    pub id: WatchId,
    /// Path the watch was added for
    pub path: Vec<u8>,
}

#[derive(Default)]
struct TableState {
    queue: Option<QueueHandle>,
    watches: AHashMap<WatchId, Vec<u8>>,
    /// The queue was opened and closed; a table never reopens it
    retired: bool,
}

/// Registry of watches on a single event queue
#[derive(Default)]
pub struct WatchTable {
    state: Mutex<TableState>,
    watch_limit: Option<usize>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table that refuses more than `limit` live watches with ENOSPC
    pub fn with_watch_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            watch_limit: Some(limit),
        }
    }

    /// Get the table's queue, opening it on first use
    ///
    /// The descriptor is close-on-exec. With `nonblocking` a read on an
    /// empty queue fails with EAGAIN instead of blocking; the flag only
    /// matters for the call that opens the queue. Once the queue has been
    /// closed the table is spent and this reports `AlreadyClosed`.
    pub fn open_queue(&self, nonblocking: bool) -> Result<QueueHandle> {
        let mut state = self.state.lock();
        if state.retired || state.queue.as_ref().is_some_and(QueueHandle::is_closed) {
            return Err(Error::AlreadyClosed("event queue"));
        }
        if let Some(queue) = &state.queue {
            return Ok(queue.clone());
        }

        let mut flags = InitFlags::IN_CLOEXEC;
        if nonblocking {
            flags |= InitFlags::IN_NONBLOCK;
        }
        let inotify = Inotify::init(flags).map_err(|e| Error::native("inotify_init1", e))?;
        let fd = inotify.as_fd().as_raw_fd();
        let queue = QueueHandle::from_inotify(inotify);

        state.queue = Some(queue.clone());
        info!("Opened event queue (fd {})", fd);
        Ok(queue)
    }

    /// Register interest in `path`
    ///
    /// Adding a path that is already watched returns the same id with the
    /// mask replaced, as the kernel does.
    pub fn add(&self, queue: &QueueHandle, path: &[u8], mask: EventMask) -> Result<WatchDescriptor> {
        let native = path::encode(path)?;

        let mut state = self.state.lock();
        Self::check_queue(&state, queue, "inotify_add_watch")?;
        if let Some(limit) = self.watch_limit {
            if state.watches.len() >= limit {
                return Err(Error::native("inotify_add_watch", Errno::ENOSPC));
            }
        }

        let guard = queue.lock_fd();
        let fd = guard.as_ref().ok_or(Error::AlreadyClosed("event queue"))?;
        let wd = loop {
            match add_watch(fd.as_fd(), &native, mask) {
                Ok(wd) => break wd,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::native("inotify_add_watch", errno)),
            }
        };
        drop(guard);

        let id = WatchId(wd);
        state.watches.insert(id, path.to_vec());
        debug!("Watching {} as {} ({})", path::display(path), id, mask);

        Ok(WatchDescriptor {
            id,
            path: path.to_vec(),
        })
    }

    /// Remove a watch
    ///
    /// A descriptor the kernel already dropped (for example because the
    /// watched object was deleted) yields `InvalidDescriptor`; the entry is
    /// removed from the table either way and other watches are unaffected.
    pub fn remove(&self, queue: &QueueHandle, watch: &WatchDescriptor) -> Result<()> {
        self.remove_id(queue, watch.id)
    }

    /// Remove a watch by id
    pub fn remove_id(&self, queue: &QueueHandle, id: WatchId) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_queue(&state, queue, "inotify_rm_watch")?;

        let guard = queue.lock_fd();
        let fd = guard.as_ref().ok_or(Error::AlreadyClosed("event queue"))?;
        let result = loop {
            match rm_watch(fd.as_fd(), id) {
                Ok(_) => break Ok(()),
                Err(Errno::EINTR) => continue,
                Err(Errno::EINVAL) => break Err(Error::InvalidDescriptor(id.0)),
                Err(errno) => break Err(Error::native("inotify_rm_watch", errno)),
            }
        };
        drop(guard);

        if matches!(result, Ok(()) | Err(Error::InvalidDescriptor(_))) {
            state.watches.remove(&id);
        }
        match &result {
            Ok(()) => debug!("Removed {}", id),
            Err(e) => debug!("Removing {}: {}", id, e),
        }
        result
    }

    /// Drop a watch from the table without telling the kernel
    ///
    /// Used when the kernel has already reported the watch as ignored.
    pub fn forget(&self, id: WatchId) -> Option<Vec<u8>> {
        self.state.lock().watches.remove(&id)
    }

    /// Path a live watch was added for
    pub fn path_of(&self, id: WatchId) -> Option<Vec<u8>> {
        self.state.lock().watches.get(&id).cloned()
    }

    /// Number of live watches
    pub fn len(&self) -> usize {
        self.state.lock().watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release the queue and invalidate every watch on it
    pub fn close_queue(&self, queue: &QueueHandle) -> Result<()> {
        queue.close()?;

        let mut state = self.state.lock();
        if state.queue.as_ref().is_some_and(|q| q.same_queue(queue)) {
            let dropped = state.watches.len();
            state.queue = None;
            state.watches.clear();
            state.retired = true;
            info!("Closed event queue ({} watches dropped)", dropped);
        } else {
            warn!("Closed an event queue this table did not open");
        }
        Ok(())
    }

    fn check_queue(state: &TableState, queue: &QueueHandle, op: &'static str) -> Result<()> {
        if queue.is_closed() {
            return Err(Error::AlreadyClosed("event queue"));
        }
        match &state.queue {
            Some(own) if own.same_queue(queue) => Ok(()),
            _ => Err(Error::native(op, Errno::EBADF)),
        }
    }
}

/// Add a watch and return the kernel's numeric id
///
/// Decoded records carry that id, and nix's `WatchDescriptor` does not
/// expose it, so this goes to the syscall directly.
fn add_watch(queue: BorrowedFd<'_>, path: &CStr, mask: EventMask) -> nix::Result<i32> {
    // SAFETY: the descriptor is borrowed for the call, path is NUL-terminated
    Errno::result(unsafe { libc::inotify_add_watch(queue.as_raw_fd(), path.as_ptr(), mask.bits()) })
}

fn rm_watch(queue: BorrowedFd<'_>, id: WatchId) -> nix::Result<()> {
    // SAFETY: the descriptor is borrowed for the call
    Errno::result(unsafe { libc::inotify_rm_watch(queue.as_raw_fd(), id.0) }).map(drop)
}
