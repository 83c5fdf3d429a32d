//! Error taxonomy shared by every dirwatch crate
//!
//! Hard failures carry the native errno. The two known benign races
//! (double close, stale watch descriptor) and cooperative cancellation get
//! their own variants so callers can match on them instead of on messages.

use nix::errno::Errno;

/// Result type for dirwatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by dirwatch operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OS reported a failure
    #[error("{op} failed: {errno}")]
    Native {
        /// Name of the failing call
        op: &'static str,
        /// Native error code
        errno: Errno,
    },

    /// A resource was released twice, or used after release
    #[error("{0} is already closed")]
    AlreadyClosed(&'static str),

    /// The watch descriptor was already invalidated by the kernel
    #[error("watch descriptor {0} is no longer valid")]
    InvalidDescriptor(i32),

    /// The path cannot be handed to the OS
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A cooperative stop was requested mid-operation
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Build a `Native` error from an explicit errno
    pub fn native(op: &'static str, errno: Errno) -> Self {
        Error::Native { op, errno }
    }

    /// The native error code, if this is an OS failure
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Native { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// True for conditions callers may safely ignore
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Error::AlreadyClosed(_) | Error::InvalidDescriptor(_) | Error::Cancelled
        )
    }
}
