//! Event stream reader
//!
//! Pulls raw records off a queue, decodes them and hands each one to a
//! sink. The loop blocks in `poll` on two descriptors: the queue and a
//! private eventfd. A stop request or a queue close writes the eventfd, so
//! the reader wakes immediately instead of polling on a timer.
//!
//! State machine: `Running -> Stopping -> Closed`. `Closed` is reached on a
//! stop request, on end of stream, or on a fatal read error.

use crate::event::{self, ChangeEvent, MIN_BUFFER_SIZE};
use crate::table::QueueHandle;
use crate::wake::Waker;
use crossbeam_channel::Sender;
use dirwatch_core::{Error, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd;
use std::any::Any;
use std::os::fd::{AsFd, AsRawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Read buffer size used unless configured otherwise
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Consumer of decoded events
///
/// Errors and panics are logged and counted; they never stop the reader.
pub trait EventSink: Send {
    fn on_event(&mut self, event: ChangeEvent) -> anyhow::Result<()>;
}

impl<F> EventSink for F
where
    F: FnMut(ChangeEvent) -> anyhow::Result<()> + Send,
{
    fn on_event(&mut self, event: ChangeEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Sink forwarding every event into a channel
pub struct ChannelSink(pub Sender<ChangeEvent>);

impl EventSink for ChannelSink {
    fn on_event(&mut self, event: ChangeEvent) -> anyhow::Result<()> {
        self.0
            .send(event)
            .map_err(|_| anyhow::anyhow!("event receiver disconnected"))
    }
}

/// Lifecycle of a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Running,
    Stopping,
    Closed,
}

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const CLOSED: u8 = 2;

/// Counters reported when a reader finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Successful reads from the queue
    pub reads: u64,
    /// Records delivered to the sink
    pub events: u64,
    /// Records the sink failed or panicked on
    pub sink_errors: u64,
}

struct Shared {
    state: AtomicU8,
    waker: Arc<Waker>,
}

impl Shared {
    fn state(&self) -> ReaderState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => ReaderState::Running,
            STOPPING => ReaderState::Stopping,
            _ => ReaderState::Closed,
        }
    }
}

/// Handle for stopping a reader from another thread
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// Ask the reader to stop
    ///
    /// Returns immediately. A reader blocked in a read wakes up and exits;
    /// no events are delivered after it observes the request.
    pub fn request_stop(&self) {
        let _ = self.shared.state.compare_exchange(
            RUNNING,
            STOPPING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.shared.waker.wake();
    }

    pub fn state(&self) -> ReaderState {
        self.shared.state()
    }
}

enum ReadOutcome {
    Data(usize),
    Retry,
    Finished,
}

/// Blocking reader bound to one queue and one sink
pub struct EventStreamReader<S> {
    queue: QueueHandle,
    sink: S,
    shared: Arc<Shared>,
    buffer_size: usize,
}

impl<S: EventSink> EventStreamReader<S> {
    pub fn new(queue: QueueHandle, sink: S) -> Result<Self> {
        let waker = Arc::new(Waker::new()?);
        queue.register_waker(&waker);
        Ok(Self {
            queue,
            sink,
            shared: Arc::new(Shared {
                state: AtomicU8::new(RUNNING),
                waker,
            }),
            buffer_size: DEFAULT_BUFFER_SIZE,
        })
    }

    /// Set the read buffer size, raised to `MIN_BUFFER_SIZE` if smaller
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(MIN_BUFFER_SIZE);
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> ReaderState {
        self.shared.state()
    }

    /// Run the receive loop on the calling thread
    ///
    /// Returns when stopped, at end of stream, or when the queue is closed.
    /// A fatal read error moves the reader to `Closed` and is returned.
    pub fn run(&mut self) -> Result<ReaderStats> {
        if self.state() == ReaderState::Closed {
            return Err(Error::AlreadyClosed("event reader"));
        }

        let mut buf = vec![0u8; self.buffer_size];
        let mut stats = ReaderStats::default();
        debug!("Event reader started ({} byte buffer)", self.buffer_size);

        let result = self.receive_loop(&mut buf, &mut stats);
        self.shared.state.store(CLOSED, Ordering::Release);

        match &result {
            Ok(()) => info!(
                "Event reader finished: {} events, {} sink errors",
                stats.events, stats.sink_errors
            ),
            Err(e) => warn!("Event reader failed: {}", e),
        }
        result.map(|()| stats)
    }

    /// Run the loop on a dedicated thread
    pub fn spawn(self) -> Result<ReaderThread>
    where
        S: 'static,
    {
        let stop = self.stop_handle();
        let handle = std::thread::Builder::new()
            .name("dirwatch-events".into())
            .spawn(move || {
                let mut reader = self;
                reader.run()
            })
            .map_err(|e| {
                Error::native("spawn", e.raw_os_error().map_or(Errno::EAGAIN, Errno::from_i32))
            })?;
        Ok(ReaderThread { stop, handle })
    }

    fn stop_requested(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) != RUNNING
    }

    fn receive_loop(&mut self, buf: &mut [u8], stats: &mut ReaderStats) -> Result<()> {
        loop {
            if self.stop_requested() {
                return Ok(());
            }

            let len = match self.wait_and_read(buf)? {
                ReadOutcome::Data(len) => len,
                ReadOutcome::Retry => continue,
                ReadOutcome::Finished => return Ok(()),
            };
            stats.reads += 1;

            let mut records = event::decode(&buf[..len]);
            for event in records.by_ref() {
                if self.stop_requested() {
                    return Ok(());
                }
                stats.events += 1;
                let sink = &mut self.sink;
                match panic::catch_unwind(AssertUnwindSafe(|| sink.on_event(event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        stats.sink_errors += 1;
                        warn!("Event sink failed: {:#}", e);
                    }
                    Err(payload) => {
                        stats.sink_errors += 1;
                        warn!("Event sink panicked: {}", panic_message(&*payload));
                    }
                }
            }
            if records.truncated() {
                warn!("Discarded truncated record at end of a {} byte read", len);
            }
        }
    }

    /// Block until the queue or the waker is readable, then read once
    ///
    /// The queue descriptor stays locked for the poll and the read only, so
    /// a close cannot release it underneath us; sinks run unlocked.
    fn wait_and_read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let guard = self.queue.lock_fd();
        let Some(fd) = guard.as_ref() else {
            return Ok(ReadOutcome::Finished);
        };
        if self.queue.is_closed() {
            return Ok(ReadOutcome::Finished);
        }

        let waker = &*self.shared.waker;
        let mut fds = [
            PollFd::new(fd, PollFlags::POLLIN),
            PollFd::new(waker, PollFlags::POLLIN),
        ];
        match poll(&mut fds, -1) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(ReadOutcome::Retry),
            Err(errno) => return Err(Error::native("poll", errno)),
        }

        let woken = fds[1].revents().unwrap_or(PollFlags::empty());
        if woken.contains(PollFlags::POLLIN) {
            waker.drain();
            return Ok(ReadOutcome::Retry);
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLIN) {
            return match unistd::read(fd.as_fd().as_raw_fd(), buf) {
                Ok(0) => Ok(ReadOutcome::Finished),
                Ok(len) => Ok(ReadOutcome::Data(len)),
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => Ok(ReadOutcome::Retry),
                Err(errno) => Err(Error::native("read", errno)),
            };
        }
        if revents.contains(PollFlags::POLLNVAL) {
            return Err(Error::native("poll", Errno::EBADF));
        }
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            return Ok(ReadOutcome::Finished);
        }
        Ok(ReadOutcome::Retry)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// A reader running on its own thread
pub struct ReaderThread {
    stop: StopHandle,
    handle: JoinHandle<Result<ReaderStats>>,
}

impl ReaderThread {
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the reader to finish on its own
    pub fn join(self) -> Result<ReaderStats> {
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Request a stop and wait for the thread
    pub fn stop_and_join(self) -> Result<ReaderStats> {
        self.stop.request_stop();
        self.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{encode_record, WatchId};
    use crate::mask::EventMask;
    use crossbeam_channel::unbounded;
    use std::io::Write;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn synthetic_queue() -> (UnixStream, QueueHandle) {
        let (writer, reader) = UnixStream::pair().unwrap();
        (writer, QueueHandle::from_fd(OwnedFd::from(reader)))
    }

    #[test]
    fn test_delivers_records_in_order() {
        let (mut writer, queue) = synthetic_queue();
        let (tx, rx) = unbounded();
        let reader = EventStreamReader::new(queue, ChannelSink(tx)).unwrap();
        let thread = reader.spawn().unwrap();

        let mut buf = encode_record(WatchId(1), EventMask::CREATED, 0, Some(b"foo"));
        buf.extend(encode_record(WatchId(1), EventMask::SELF_DELETED, 0, None));
        writer.write_all(&buf).unwrap();

        let first = rx.recv_timeout(TIMEOUT).unwrap();
        let second = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(first.name.as_deref(), Some(&b"foo"[..]));
        assert_eq!(second.mask, EventMask::SELF_DELETED);

        let stats = thread.stop_and_join().unwrap();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.sink_errors, 0);
    }

    #[test]
    fn test_stop_while_blocked() {
        let (mut writer, queue) = synthetic_queue();
        let (tx, rx) = unbounded();
        let reader = EventStreamReader::new(queue, ChannelSink(tx)).unwrap();
        let stop = reader.stop_handle();
        let thread = reader.spawn().unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(stop.state(), ReaderState::Running);

        let stats = thread.stop_and_join().unwrap();
        assert_eq!(stats.events, 0);
        assert_eq!(stop.state(), ReaderState::Closed);

        // Nothing written after the stop reaches the sink
        let _ = writer.write_all(&encode_record(WatchId(1), EventMask::CREATED, 0, Some(b"late")));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_sink_error_does_not_stop_loop() {
        let (mut writer, queue) = synthetic_queue();
        let (tx, rx) = unbounded();
        let mut failed_once = false;
        let sink = move |event: ChangeEvent| -> anyhow::Result<()> {
            if !failed_once {
                failed_once = true;
                anyhow::bail!("first event rejected");
            }
            tx.send(event)?;
            Ok(())
        };
        let thread = EventStreamReader::new(queue, sink).unwrap().spawn().unwrap();

        let mut buf = encode_record(WatchId(1), EventMask::CREATED, 0, Some(b"a"));
        buf.extend(encode_record(WatchId(1), EventMask::CREATED, 0, Some(b"b")));
        writer.write_all(&buf).unwrap();

        let delivered = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(delivered.name.as_deref(), Some(&b"b"[..]));

        let stats = thread.stop_and_join().unwrap();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.sink_errors, 1);
    }

    #[test]
    fn test_sink_panic_does_not_stop_loop() {
        let (mut writer, queue) = synthetic_queue();
        let (tx, rx) = unbounded();
        let sink = move |event: ChangeEvent| -> anyhow::Result<()> {
            if event.name.as_deref() == Some(&b"a"[..]) {
                panic!("sink cannot handle {:?}", event.name);
            }
            tx.send(event)?;
            Ok(())
        };
        let thread = EventStreamReader::new(queue, sink).unwrap().spawn().unwrap();

        let mut buf = encode_record(WatchId(1), EventMask::CREATED, 0, Some(b"a"));
        buf.extend(encode_record(WatchId(1), EventMask::CREATED, 0, Some(b"b")));
        writer.write_all(&buf).unwrap();

        let delivered = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(delivered.name.as_deref(), Some(&b"b"[..]));

        // A later read is still consumed
        writer
            .write_all(&encode_record(WatchId(1), EventMask::DELETED, 0, Some(b"c")))
            .unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().mask, EventMask::DELETED);

        let stats = thread.stop_and_join().unwrap();
        assert_eq!(stats.events, 3);
        assert_eq!(stats.sink_errors, 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }

    #[test]
    fn test_end_of_stream_finishes_cleanly() {
        let (mut writer, queue) = synthetic_queue();
        let (tx, rx) = unbounded();
        let mut reader = EventStreamReader::new(queue, ChannelSink(tx)).unwrap();

        writer
            .write_all(&encode_record(WatchId(4), EventMask::MODIFIED, 0, Some(b"x")))
            .unwrap();
        drop(writer);

        let stats = reader.run().unwrap();
        assert_eq!(stats.events, 1);
        assert_eq!(rx.try_recv().unwrap().watch, WatchId(4));
        assert_eq!(reader.state(), ReaderState::Closed);
        assert!(matches!(reader.run(), Err(Error::AlreadyClosed(_))));
    }

    #[test]
    fn test_read_error_is_fatal() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        // A directory polls readable but read() fails with EISDIR
        let dir = std::fs::File::open(temp_dir.path()).unwrap();
        let queue = QueueHandle::from_fd(OwnedFd::from(dir));
        let mut reader =
            EventStreamReader::new(queue, |_event: ChangeEvent| -> anyhow::Result<()> { Ok(()) })
                .unwrap();

        let err = reader.run().unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EISDIR));
        assert_eq!(reader.state(), ReaderState::Closed);
    }

    #[test]
    fn test_queue_close_wakes_reader() {
        let (_writer, queue) = synthetic_queue();
        let (tx, _rx) = unbounded();
        let thread = EventStreamReader::new(queue.clone(), ChannelSink(tx))
            .unwrap()
            .spawn()
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        queue.close().unwrap();

        let stats = thread.join().unwrap();
        assert_eq!(stats.reads, 0);
        assert!(matches!(queue.close(), Err(Error::AlreadyClosed(_))));
    }

    #[test]
    fn test_buffer_size_clamped() {
        let (_writer, queue) = synthetic_queue();
        let reader = EventStreamReader::new(queue, ChannelSink(unbounded().0))
            .unwrap()
            .with_buffer_size(16);
        assert_eq!(reader.buffer_size(), MIN_BUFFER_SIZE);
    }
}
