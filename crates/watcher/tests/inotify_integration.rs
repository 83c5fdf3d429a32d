//! Watch table and reader against the real kernel queue

use crossbeam_channel::unbounded;
use dirwatch_core::path;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use watcher::{ChannelSink, Error, EventMask, EventStreamReader, ReaderState, WatchTable};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_create_reports_child_name() {
    let temp_dir = TempDir::new().unwrap();
    let table = WatchTable::new();
    let queue = table.open_queue(true).unwrap();
    let watch = table
        .add(&queue, path::from_path(temp_dir.path()), EventMask::ALL_EVENTS)
        .unwrap();

    let (tx, rx) = unbounded();
    let reader = EventStreamReader::new(queue.clone(), ChannelSink(tx)).unwrap();
    let stop = reader.stop_handle();
    let thread = reader.spawn().unwrap();

    fs::write(temp_dir.path().join("foo"), b"hello").unwrap();

    let event = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(event.watch, watch.id);
    assert!(event.mask.contains(EventMask::CREATED));
    assert_eq!(event.name.as_deref(), Some(&b"foo"[..]));

    let stats = thread.stop_and_join().unwrap();
    assert!(stats.events >= 1);
    assert_eq!(stop.state(), ReaderState::Closed);
    table.close_queue(&queue).unwrap();
}

#[test]
fn test_deleted_directory_invalidates_descriptor() {
    let temp_dir = TempDir::new().unwrap();
    let doomed = temp_dir.path().join("doomed");
    let kept = temp_dir.path().join("kept");
    fs::create_dir(&doomed).unwrap();
    fs::create_dir(&kept).unwrap();

    let table = WatchTable::new();
    let queue = table.open_queue(true).unwrap();
    let doomed_watch = table
        .add(&queue, path::from_path(&doomed), EventMask::ALL_EVENTS)
        .unwrap();
    let kept_watch = table
        .add(&queue, path::from_path(&kept), EventMask::ALL_EVENTS)
        .unwrap();

    let (tx, rx) = unbounded();
    let thread = EventStreamReader::new(queue.clone(), ChannelSink(tx))
        .unwrap()
        .spawn()
        .unwrap();

    fs::remove_dir(&doomed).unwrap();

    // The kernel drops the watch and reports it as ignored
    let mut saw_deleted = false;
    loop {
        let event = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(event.watch, doomed_watch.id);
        saw_deleted |= event.mask.contains(EventMask::SELF_DELETED);
        if event.mask.contains(EventMask::WATCH_IGNORED) {
            break;
        }
    }
    assert!(saw_deleted);

    let err = table.remove(&queue, &doomed_watch).unwrap_err();
    assert!(matches!(err, Error::InvalidDescriptor(_)));
    assert!(table.path_of(doomed_watch.id).is_none());

    // Unrelated watches keep working
    fs::write(kept.join("still-here"), b"").unwrap();
    let event = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(event.watch, kept_watch.id);
    assert_eq!(event.name.as_deref(), Some(&b"still-here"[..]));

    thread.stop_and_join().unwrap();
    table.close_queue(&queue).unwrap();
}

#[test]
fn test_move_pairs_share_cookie() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("old"), b"").unwrap();

    let table = WatchTable::new();
    let queue = table.open_queue(true).unwrap();
    table
        .add(
            &queue,
            path::from_path(temp_dir.path()),
            EventMask::MOVED_FROM | EventMask::MOVED_TO,
        )
        .unwrap();

    let (tx, rx) = unbounded();
    let thread = EventStreamReader::new(queue.clone(), ChannelSink(tx))
        .unwrap()
        .spawn()
        .unwrap();

    fs::rename(temp_dir.path().join("old"), temp_dir.path().join("new")).unwrap();

    let from = rx.recv_timeout(TIMEOUT).unwrap();
    let to = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(from.mask.contains(EventMask::MOVED_FROM));
    assert!(to.mask.contains(EventMask::MOVED_TO));
    assert_ne!(from.cookie, 0);
    assert_eq!(from.cookie, to.cookie);
    assert_eq!(to.name.as_deref(), Some(&b"new"[..]));

    thread.stop_and_join().unwrap();
    table.close_queue(&queue).unwrap();
}

#[test]
fn test_close_queue_stops_blocked_reader() {
    let temp_dir = TempDir::new().unwrap();
    let table = WatchTable::new();
    let queue = table.open_queue(false).unwrap();
    table
        .add(&queue, path::from_path(temp_dir.path()), EventMask::ALL_EVENTS)
        .unwrap();

    let (tx, _rx) = unbounded();
    let thread = EventStreamReader::new(queue.clone(), ChannelSink(tx))
        .unwrap()
        .spawn()
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));

    table.close_queue(&queue).unwrap();
    thread.join().unwrap();
    assert!(table.is_empty());
    assert_eq!(queue.raw_fd(), None);
}
