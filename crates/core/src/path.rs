//! Path codec
//!
//! Paths are opaque byte sequences. The only check made here is for an
//! embedded NUL, which cannot cross the C boundary; every other legality
//! question is left to the syscalls.

use crate::error::{Error, Result};
use std::borrow::Cow;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Encode a byte path for a native call
pub fn encode(path: &[u8]) -> Result<CString> {
    CString::new(path).map_err(|e| {
        Error::InvalidPath(format!(
            "embedded NUL at byte {} in {}",
            e.nul_position(),
            display(path)
        ))
    })
}

/// Decode a native path back into bytes
pub fn decode(native: &CStr) -> Vec<u8> {
    native.to_bytes().to_vec()
}

/// Bytes of a std path, without any re-encoding
pub fn from_path(path: &Path) -> &[u8] {
    path.as_os_str().as_bytes()
}

/// Append one component to a parent path
pub fn join(parent: &[u8], name: &[u8]) -> Vec<u8> {
    let mut joined = Vec::with_capacity(parent.len() + name.len() + 1);
    joined.extend_from_slice(parent);
    if !parent.is_empty() && !parent.ends_with(b"/") {
        joined.push(b'/');
    }
    joined.extend_from_slice(name);
    joined
}

/// Lossy rendering for logs and messages
pub fn display(path: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(path)
}
