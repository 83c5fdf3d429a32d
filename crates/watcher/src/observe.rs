//! Directory observation
//!
//! Watches one directory and its immediate subdirectories and reports
//! changes as create/delete/modify notifications keyed by child name. The
//! root gets a full watch; each child directory gets a narrow watch whose
//! only purpose is to turn "something changed inside `child`" into a
//! modify notification for `child`.
//!
//! Each observation owns its own table, queue and reader thread.

use crate::event::{ChangeEvent, WatchId};
use crate::mask::EventMask;
use crate::reader::{EventStreamReader, ReaderThread, StopHandle, DEFAULT_BUFFER_SIZE};
use crate::table::{QueueHandle, WatchTable};
use ahash::AHashMap;
use dirwatch_core::{path, Directory, Error, FileKind, Name, NativeStat, Result, StatProvider};
use nix::errno::Errno;
use nix::sys::statfs::{statfs, PROC_SUPER_MAGIC};
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Interest mask for the observed directory itself
pub const ROOT_MASK: EventMask = EventMask::ATTRIBUTE_CHANGED
    .union(EventMask::CREATED)
    .union(EventMask::DELETED)
    .union(EventMask::SELF_DELETED)
    .union(EventMask::MODIFIED)
    .union(EventMask::SELF_MOVED)
    .union(EventMask::MOVED_FROM)
    .union(EventMask::MOVED_TO);

/// Interest mask for each immediate child directory
pub const CHILD_DIR_MASK: EventMask = EventMask::DONT_FOLLOW
    .union(EventMask::ONLY_DIR)
    .union(EventMask::CREATED)
    .union(EventMask::DELETED)
    .union(EventMask::MOVED_FROM)
    .union(EventMask::MOVED_TO);

/// What happened to the root or one of its children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedKind {
    Create,
    Delete,
    Modify,
}

/// Receiver of observation notifications
///
/// Called from the observation's reader thread. `child` is `None` when the
/// notification is about the observed directory itself.
pub trait Observer: Send + Sync {
    fn on_event(&self, kind: ObservedKind, child: Option<&[u8]>);

    /// Some changes will not be reported, for example because the watch
    /// limit was hit while adding child watches
    fn on_incomplete_observation(&self, cause: &Error) {
        warn!("Observation incomplete: {}", cause);
    }
}

impl<F> Observer for F
where
    F: Fn(ObservedKind, Option<&[u8]>) + Send + Sync,
{
    fn on_event(&self, kind: ObservedKind, child: Option<&[u8]>) {
        self(kind, child)
    }
}

/// Observation settings
#[derive(Debug, Clone)]
pub struct ObserveOptions {
    /// Resolve a symlink at the root
    pub follow_symlink: bool,
    /// Cap on live watches, root included
    pub watch_limit: Option<usize>,
    /// Open the queue in non-blocking mode
    pub nonblocking: bool,
    /// Reader buffer size
    pub buffer_size: usize,
}

impl Default for ObserveOptions {
    fn default() -> Self {
        Self {
            follow_symlink: true,
            watch_limit: None,
            nonblocking: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Child directory watches, looked up both ways
#[derive(Default)]
struct ChildDirs {
    by_watch: AHashMap<WatchId, Name>,
    by_name: AHashMap<Name, WatchId>,
}

impl ChildDirs {
    fn insert(&mut self, id: WatchId, name: Name) {
        if let Some(previous) = self.by_name.insert(name.clone(), id) {
            if previous != id {
                self.by_watch.remove(&previous);
            }
        }
        if let Some(stale) = self.by_watch.insert(id, name.clone()) {
            if stale != name {
                self.by_name.remove(&stale);
            }
        }
    }

    fn remove_name(&mut self, name: &[u8]) -> Option<WatchId> {
        let id = self.by_name.remove(name)?;
        self.by_watch.remove(&id);
        Some(id)
    }

    fn remove_watch(&mut self, id: WatchId) -> Option<Name> {
        let name = self.by_watch.remove(&id)?;
        self.by_name.remove(&name);
        Some(name)
    }

    fn drain(&mut self) -> Vec<WatchId> {
        self.by_name.clear();
        self.by_watch.drain().map(|(id, _)| id).collect()
    }
}

struct Shared {
    root: Vec<u8>,
    table: WatchTable,
    queue: QueueHandle,
    root_watch: WatchId,
    child_dirs: Mutex<ChildDirs>,
    /// Child watches were given up after running out of watches
    released: AtomicBool,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    observer: Arc<dyn Observer>,
    stop: OnceLock<StopHandle>,
}

impl Shared {
    fn new(
        root: &[u8],
        table: WatchTable,
        queue: QueueHandle,
        root_watch: WatchId,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            root: root.to_vec(),
            table,
            queue,
            root_watch,
            child_dirs: Mutex::new(ChildDirs::default()),
            released: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            observer,
            stop: OnceLock::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed; the first reason wins
    fn mark_closed(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.close_reason.lock() = Some(reason.to_string());
        if let Some(stop) = self.stop.get() {
            stop.request_stop();
        }
        true
    }

    fn notify(&self, kind: ObservedKind, child: Option<&[u8]>) {
        self.observer.on_event(kind, child);
    }

    fn add_child_dir(&self, name: &[u8]) -> Result<()> {
        if self.released.load(Ordering::Acquire) || self.is_closed() {
            return Ok(());
        }
        let child = path::join(&self.root, name);
        match self.table.add(&self.queue, &child, CHILD_DIR_MASK) {
            Ok(watch) => {
                self.child_dirs.lock().insert(watch.id, Name::from_slice(name));
                Ok(())
            }
            Err(e) => self.handle_add_child_failure(e),
        }
    }

    fn handle_add_child_failure(&self, err: Error) -> Result<()> {
        match err.errno() {
            // Gone again before we could watch it
            Some(Errno::ENOENT) => Ok(()),
            Some(Errno::ENOSPC) | Some(Errno::ENOMEM) => {
                self.release_child_dirs();
                self.observer.on_incomplete_observation(&err);
                Ok(())
            }
            Some(Errno::EACCES) => {
                self.observer.on_incomplete_observation(&err);
                Ok(())
            }
            _ => Err(err),
        }
    }

    /// Give up on child watches, keeping only the root watch
    fn release_child_dirs(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids = self.child_dirs.lock().drain();
        info!(
            "Releasing {} child watches of {}",
            ids.len(),
            path::display(&self.root)
        );
        for id in ids {
            if let Err(e) = self.table.remove_id(&self.queue, id) {
                debug!("Releasing {}: {}", id, e);
            }
        }
    }

    fn remove_child_dir(&self, name: &[u8]) {
        let Some(id) = self.child_dirs.lock().remove_name(name) else {
            return;
        };
        match self.table.remove_id(&self.queue, id) {
            Ok(()) => {}
            // The kernel dropped it with the directory
            Err(e) if e.is_benign() => {}
            Err(e) => warn!("Removing watch on {}: {}", path::display(name), e),
        }
    }

    fn on_watch_ignored(&self, id: WatchId) {
        self.table.forget(id);
        if id != self.root_watch {
            self.child_dirs.lock().remove_watch(id);
        }
    }

    fn handle_event(&self, event: ChangeEvent) -> anyhow::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if event.is_overflow() {
            warn!(
                "Event queue overflowed while observing {}",
                path::display(&self.root)
            );
            return Ok(());
        }
        if event.watch == self.root_watch {
            self.handle_root_event(event)
        } else {
            self.handle_child_dir_event(event);
            Ok(())
        }
    }

    fn handle_root_event(&self, event: ChangeEvent) -> anyhow::Result<()> {
        let mask = event.mask;
        let name = event.name.as_deref();

        match name {
            Some(name) if mask.intersects(EventMask::CREATED | EventMask::MOVED_TO) => {
                if mask.contains(EventMask::IS_DIRECTORY) {
                    self.add_child_dir(name)?;
                }
                self.notify(ObservedKind::Create, Some(name));
            }
            Some(name) if mask.intersects(EventMask::MOVED_FROM | EventMask::DELETED) => {
                if mask.contains(EventMask::IS_DIRECTORY) {
                    self.remove_child_dir(name);
                }
                self.notify(ObservedKind::Delete, Some(name));
            }
            Some(name)
                if mask.intersects(
                    EventMask::ATTRIBUTE_CHANGED | EventMask::MODIFIED | EventMask::CLOSED_WRITE,
                ) =>
            {
                self.notify(ObservedKind::Modify, Some(name));
            }
            None if mask.intersects(EventMask::SELF_DELETED | EventMask::SELF_MOVED) => {
                self.mark_closed("observed directory was deleted or moved");
                self.notify(ObservedKind::Delete, None);
            }
            None if mask.intersects(EventMask::ATTRIBUTE_CHANGED | EventMask::MODIFIED) => {
                self.notify(ObservedKind::Modify, None);
            }
            _ if mask.contains(EventMask::WATCH_IGNORED) => {
                self.on_watch_ignored(event.watch);
            }
            _ => anyhow::bail!(
                "unexpected event {} on {} ({})",
                mask,
                path::display(&self.root),
                event.watch
            ),
        }
        Ok(())
    }

    fn handle_child_dir_event(&self, event: ChangeEvent) {
        if event.mask.contains(EventMask::WATCH_IGNORED) {
            self.on_watch_ignored(event.watch);
            return;
        }
        let name = self.child_dirs.lock().by_watch.get(&event.watch).cloned();
        if let Some(name) = name {
            self.notify(ObservedKind::Modify, Some(name.as_slice()));
        }
    }
}

struct ObservationSink {
    shared: Arc<Shared>,
}

impl crate::reader::EventSink for ObservationSink {
    fn on_event(&mut self, event: ChangeEvent) -> anyhow::Result<()> {
        self.shared.handle_event(event)
    }
}

/// A live observation of one directory
///
/// Dropping it closes it.
pub struct Observation {
    shared: Arc<Shared>,
    reader: Option<ReaderThread>,
}

impl Observation {
    /// Start observing `root`
    ///
    /// Each current child of `root` is passed to `children` (full path)
    /// while child watches are being set up. If it breaks, the observation
    /// is closed again and `Error::Cancelled` is returned. A `root` on
    /// procfs is listed but not watched: the observation comes back
    /// already closed with reason "procfs not supported".
    pub fn start<F>(
        root: &[u8],
        options: ObserveOptions,
        observer: Arc<dyn Observer>,
        mut children: F,
    ) -> Result<Self>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        if is_procfs(root)? {
            return Self::start_unwatched(
                root,
                options.follow_symlink,
                observer,
                &mut children,
                "procfs not supported",
            );
        }

        let table = match options.watch_limit {
            Some(limit) => WatchTable::with_watch_limit(limit),
            None => WatchTable::new(),
        };
        let queue = table.open_queue(options.nonblocking)?;
        let root_watch = match table.add(&queue, root, ROOT_MASK.follow(options.follow_symlink)) {
            Ok(watch) => watch.id,
            Err(e) => {
                if let Err(close_err) = table.close_queue(&queue) {
                    debug!("Closing queue after failed setup: {}", close_err);
                }
                return Err(e);
            }
        };

        let shared = Arc::new(Shared::new(root, table, queue.clone(), root_watch, observer));

        let reader = EventStreamReader::new(
            queue,
            ObservationSink {
                shared: Arc::clone(&shared),
            },
        )?
        .with_buffer_size(options.buffer_size);
        let _ = shared.stop.set(reader.stop_handle());

        let mut observation = Self {
            shared,
            reader: Some(reader.spawn()?),
        };
        info!("Observing {}", path::display(root));

        if let Err(e) = observation.watch_children(options.follow_symlink, &mut children) {
            if let Err(close_err) = observation.close() {
                debug!("Closing observation after failed setup: {}", close_err);
            }
            return Err(e);
        }
        Ok(observation)
    }

    /// An observation that is closed from the start but still hands every
    /// child of `root` to `children`
    fn start_unwatched<F>(
        root: &[u8],
        follow_symlink: bool,
        observer: Arc<dyn Observer>,
        children: &mut F,
        reason: &str,
    ) -> Result<Self>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        let shared = Shared::new(
            root,
            WatchTable::new(),
            QueueHandle::detached(),
            WatchId(-1),
            observer,
        );
        shared.mark_closed(reason);
        info!("Not watching {}: {}", path::display(root), reason);

        let observation = Self {
            shared: Arc::new(shared),
            reader: None,
        };
        observation.watch_children(follow_symlink, children)?;
        Ok(observation)
    }

    fn watch_children<F>(&self, follow_symlink: bool, children: &mut F) -> Result<()>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        let shared = &self.shared;
        let native = path::encode(&shared.root)?;
        if !NativeStat.stat_with(&native, follow_symlink)?.kind.is_dir() {
            return Ok(());
        }

        let mut dir = Directory::open(&shared.root, follow_symlink)?;
        let result = (|| -> Result<()> {
            while let Some(entry) = dir.next_entry()? {
                let child = path::join(&shared.root, &entry.name);
                if children(&child).is_break() {
                    return Err(Error::Cancelled);
                }

                let is_dir = match entry.kind {
                    FileKind::Unknown => dir
                        .raw_fd()
                        .and_then(|fd| NativeStat.lstat_at(fd, &entry.name))
                        .is_ok_and(|st| st.kind.is_dir()),
                    kind => kind.is_dir(),
                };
                if is_dir {
                    shared.add_child_dir(&entry.name)?;
                }
            }
            Ok(())
        })();

        match (result, dir.close()) {
            (Err(e), _) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    pub fn root(&self) -> &[u8] {
        &self.shared.root
    }

    /// True once closed, including when the observed directory went away
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.shared.close_reason.lock().clone()
    }

    /// Number of child directories currently watched
    pub fn watched_children(&self) -> usize {
        self.shared.child_dirs.lock().by_watch.len()
    }

    /// Stop the reader and release every watch and the queue
    ///
    /// A second call reports `AlreadyClosed`, as does closing an
    /// observation that started out closed.
    pub fn close(&mut self) -> Result<()> {
        let Some(reader) = self.reader.take() else {
            return Err(Error::AlreadyClosed("observation"));
        };
        let shared = &self.shared;
        shared.mark_closed("closed");

        let mut first_error = None;
        if let Err(e) = reader.stop_and_join() {
            first_error = Some(e);
        }

        let mut ids = shared.child_dirs.lock().drain();
        ids.push(shared.root_watch);
        for id in ids {
            match shared.table.remove_id(&shared.queue, id) {
                Ok(()) => {}
                Err(e) if e.is_benign() => {}
                Err(e) => {
                    warn!("Removing {}: {}", id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Err(e) = shared.table.close_queue(&shared.queue) {
            first_error.get_or_insert(e);
        }

        info!("Stopped observing {}", path::display(&shared.root));
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        if self.reader.is_some() {
            if let Err(e) = self.close() {
                warn!("Closing observation of {}: {}", path::display(&self.shared.root), e);
            }
        }
    }
}

impl std::fmt::Debug for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation")
            .field("root", &path::display(&self.shared.root))
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn is_procfs(root: &[u8]) -> Result<bool> {
    let native = path::encode(root)?;
    let fs = statfs(native.as_c_str()).map_err(|e| Error::native("statfs", e))?;
    Ok(fs.filesystem_type() == PROC_SUPER_MAGIC)
}
