// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Async-signal-safe buffered file output.
//!
//! This is the only way the collector touches the disk while a crash is being handled.  Every
//! operation here is restricted to the raw `open(2)`, `write(2)` and `close(2)` system calls
//! (all on the list in <https://man7.org/linux/man-pages/man7/signal-safety.7.html>), a fixed
//! in-struct buffer, and plain integer arithmetic.  Nothing allocates, nothing locks.

use libc::c_int;
use nix::errno::Errno;
use std::ffi::CStr;

/// Capacity of the in-memory buffer.  Writes are accumulated here and pushed out with a single
/// `write(2)` when the buffer would overflow.
pub const ASYNC_FILE_BUFFER_LEN: usize = 256;

/// `write(2)` may be interrupted before it transferred anything.  We retry, but only a bounded
/// number of times: a crash handler must not spin.
const MAX_EINTR_RETRIES: usize = 8;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum AsyncFileError {
    #[error("Failed to open crash file: {0}")]
    Open(Errno),
}

/// Append-only, size bounded output stream over a raw file descriptor.
///
/// `total_bytes` only counts bytes that a `write(2)` call accepted.  Bytes sitting in the buffer
/// are accounted against `limit_bytes` but are not "written" until flushed.  A failed flush
/// abandons the buffered bytes without touching the counter; the file keeps accepting writes.
///
/// # Invariants
/// - `total_bytes + buflen <= limit_bytes`
/// - `buflen <= ASYNC_FILE_BUFFER_LEN`
#[derive(Debug)]
pub struct AsyncFile {
    fd: c_int,
    limit_bytes: u64,
    total_bytes: u64,
    buflen: usize,
    buffer: [u8; ASYNC_FILE_BUFFER_LEN],
}

impl AsyncFile {
    /// Creates (or truncates) the file at `path` for writing.
    ///
    /// # Signal safety
    /// Only calls `open(2)`.  `path` must have been built ahead of time, outside of the signal
    /// handler.
    pub fn open(path: &CStr, limit_bytes: u64) -> Result<Self, AsyncFileError> {
        // SAFETY: `path` is a valid nul-terminated string for the duration of the call.
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
                0o644 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(AsyncFileError::Open(Errno::last()));
        }
        Ok(Self::from_raw_fd(fd, limit_bytes))
    }

    /// Wraps an already open descriptor.  The `AsyncFile` takes ownership and closes it.
    pub fn from_raw_fd(fd: c_int, limit_bytes: u64) -> Self {
        Self {
            fd,
            limit_bytes,
            total_bytes: 0,
            buflen: 0,
            buffer: [0; ASYNC_FILE_BUFFER_LEN],
        }
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    /// Bytes successfully handed to the kernel so far.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes the file can still accept before hitting its limit.
    pub fn remaining(&self) -> u64 {
        self.limit_bytes
            .saturating_sub(self.total_bytes)
            .saturating_sub(self.buflen as u64)
    }

    /// Appends `data`, silently dropping whatever does not fit under the byte limit.
    ///
    /// Returns the number of bytes accepted.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let accepted = std::cmp::min(data.len() as u64, self.remaining()) as usize;
        let mut data = &data[..accepted];

        // Does not fit in what is left of the buffer: make room first.
        if self.buflen + data.len() > ASYNC_FILE_BUFFER_LEN {
            self.flush();
        }

        // Larger than the whole buffer: stream it out directly, one buffer-sized chunk at a time,
        // so the limit accounting stays in one place.
        while data.len() > ASYNC_FILE_BUFFER_LEN {
            let (chunk, rest) = data.split_at(ASYNC_FILE_BUFFER_LEN);
            self.buffer.copy_from_slice(chunk);
            self.buflen = ASYNC_FILE_BUFFER_LEN;
            self.flush();
            data = rest;
        }

        self.buffer[self.buflen..self.buflen + data.len()].copy_from_slice(data);
        self.buflen += data.len();
        accepted
    }

    /// Pushes the buffered bytes to the descriptor.
    ///
    /// On failure the buffered bytes are abandoned and no counter moves.
    pub fn flush(&mut self) -> bool {
        if self.buflen == 0 {
            return true;
        }
        let ok = write_all(self.fd, &self.buffer[..self.buflen]);
        if ok {
            self.total_bytes += self.buflen as u64;
        }
        self.buflen = 0;
        ok
    }

    /// Final flush, then releases the descriptor.
    pub fn close(mut self) -> bool {
        let flushed = self.flush();
        // SAFETY: we own the descriptor.  Set it to -1 so `Drop` does not close it twice.
        let closed = unsafe { libc::close(self.fd) } == 0;
        self.fd = -1;
        flushed && closed
    }
}

impl Drop for AsyncFile {
    fn drop(&mut self) {
        if self.fd >= 0 {
            // Dropped without `close`: the buffered bytes are abandoned, as if the process had
            // died right here.
            // SAFETY: we own the descriptor.
            let _ = unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

/// Loops over partial writes.  Returns false if any byte could not be written.
fn write_all(fd: c_int, mut data: &[u8]) -> bool {
    let mut interrupted = 0;
    while !data.is_empty() {
        // SAFETY: `data` is a valid slice for the duration of the call.
        let rval = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if rval < 0 {
            if Errno::last() == Errno::EINTR && interrupted < MAX_EINTR_RETRIES {
                interrupted += 1;
                continue;
            }
            return false;
        }
        if rval == 0 {
            return false;
        }
        data = &data[rval as usize..];
    }
    true
}
