//! Eventfd used to interrupt a reader blocked in poll

use dirwatch_core::{Error, Result};
use nix::errno::Errno;
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use tracing::warn;

#[derive(Debug)]
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> Result<Self> {
        let fd = eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(|e| Error::native("eventfd", e))?;
        Ok(Self { fd })
    }

    /// Make the descriptor readable
    pub(crate) fn wake(&self) {
        match unistd::write(self.fd.as_raw_fd(), &1u64.to_ne_bytes()) {
            // A saturated counter is already readable
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(errno) => warn!("Failed to signal reader wakeup: {}", errno),
        }
    }

    /// Reset to non-readable
    pub(crate) fn drain(&self) {
        let mut count = [0u8; 8];
        match unistd::read(self.fd.as_raw_fd(), &mut count) {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(errno) => warn!("Failed to reset reader wakeup: {}", errno),
        }
    }
}

impl AsFd for Waker {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
