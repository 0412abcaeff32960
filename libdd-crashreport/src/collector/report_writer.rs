// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Incremental JSON emitter used while the process is crashing.
//!
//! The writer produces one JSON object per file.  All state lives in fixed-size arrays inside the
//! struct, numbers are formatted into stack buffers, and strings are escaped through a static
//! lookup table, so no operation allocates.

use super::async_file::AsyncFile;

/// Maximum number of simultaneously open containers, the root object included.
pub const MAX_CONTAINER_DEPTH: usize = 16;

/// The operations a crash callback may use to append data to the report being written.
///
/// Implementations are invoked from inside a signal handler.  Callers must restrict themselves
/// to async-signal-safe work while holding the writer.
pub trait CrashReportWriter {
    fn add_integer(&mut self, key: &str, value: i64);
    fn add_unsigned_integer(&mut self, key: &str, value: u64);
    fn add_string(&mut self, key: &str, value: &str);
    fn add_bool(&mut self, key: &str, value: bool);
    /// Opens a nested object under `key`.  Nesting past [`MAX_CONTAINER_DEPTH`] is a no-op and
    /// everything up to the matching `end_container` is dropped.
    fn begin_container(&mut self, key: &str);
    /// Opens a nested array under `key`.  Keys passed to entries of an array are ignored.
    fn begin_array(&mut self, key: &str);
    fn end_container(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContainerKind {
    Object,
    Array,
}

impl ContainerKind {
    fn open(self) -> &'static [u8] {
        match self {
            ContainerKind::Object => b"{",
            ContainerKind::Array => b"[",
        }
    }

    fn close(self) -> &'static [u8] {
        match self {
            ContainerKind::Object => b"}",
            ContainerKind::Array => b"]",
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ContainerFrame {
    kind: ContainerKind,
    /// True exactly when nothing was emitted into this container yet.
    first_entry: bool,
    added_elements: u32,
}

impl ContainerFrame {
    const fn new(kind: ContainerKind) -> Self {
        Self {
            kind,
            first_entry: true,
            added_elements: 0,
        }
    }
}

pub struct ReportWriter {
    file: AsyncFile,
    frames: [ContainerFrame; MAX_CONTAINER_DEPTH],
    depth: usize,
    /// Containers opened past the depth cap that have not been closed yet.
    overflow: usize,
    /// Containers at or below this depth cannot be closed through `end_container`.
    floor: usize,
    /// Set once an entry was dropped for lack of space.
    truncated: bool,
}

impl ReportWriter {
    /// Starts the root object of the report.
    pub fn new(mut file: AsyncFile) -> Self {
        file.write(ContainerKind::Object.open());
        Self {
            file,
            frames: [ContainerFrame::new(ContainerKind::Object); MAX_CONTAINER_DEPTH],
            depth: 1,
            overflow: 0,
            floor: 1,
            truncated: false,
        }
    }

    /// Number of open containers, the root object included.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Entries emitted so far into the innermost open container.
    pub fn added_elements(&self) -> u32 {
        self.frames[self.depth - 1].added_elements
    }

    /// Whether some entry was dropped because the byte limit was reached.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn file(&self) -> &AsyncFile {
        &self.file
    }

    /// Prevents `end_container` from closing any container that is currently open.
    ///
    /// Used to hand the writer to a crash callback: whatever the callback does, it cannot
    /// unbalance the report around it.  Returns the previous floor for [`Self::unlock_to`].
    pub fn lock_current_depth(&mut self) -> usize {
        let previous = self.floor;
        self.floor = self.depth;
        previous
    }

    /// Closes whatever the callback left open above the locked depth, then restores `floor`.
    pub fn unlock_to(&mut self, floor: usize) {
        self.overflow = 0;
        while self.depth > self.floor {
            self.close_innermost();
        }
        self.floor = floor.max(1);
    }

    /// Closes every open container, root included, and closes the file.
    ///
    /// Returns the number of bytes written, as reported by the underlying file.
    pub fn finish(mut self) -> u64 {
        self.overflow = 0;
        while self.depth > 0 {
            self.close_innermost();
        }
        self.file.flush();
        let total = self.file.total_bytes();
        self.file.close();
        total
    }

    fn close_innermost(&mut self) {
        let kind = self.frames[self.depth - 1].kind;
        self.file.write(kind.close());
        self.depth -= 1;
    }

    /// Writes the separator (if needed) and the key of a new entry whose value takes
    /// `value_len` bytes and leaves `closers` more bytes to be written later.
    ///
    /// Returns false when the entry must be dropped: either it lives in a container past the
    /// depth cap, or it would not fit whole in the space left once every open container is
    /// closed.  Entries are never cut in the middle, so a report that hits its byte limit is
    /// still a well formed document.
    fn begin_entry(&mut self, key: &str, value_len: usize, closers: usize) -> bool {
        if self.overflow > 0 {
            return false;
        }
        let index = self.depth - 1;
        let frame = self.frames[index];
        let mut needed = value_len + closers + self.depth;
        if !frame.first_entry {
            needed += 1;
        }
        if frame.kind == ContainerKind::Object {
            needed += escaped_len(key) + 1;
        }
        if needed as u64 > self.file.remaining() {
            self.truncated = true;
            return false;
        }

        self.frames[index].first_entry = false;
        self.frames[index].added_elements = frame.added_elements.saturating_add(1);
        if !frame.first_entry {
            self.file.write(b",");
        }
        if frame.kind == ContainerKind::Object {
            write_escaped(&mut self.file, key);
            self.file.write(b":");
        }
        true
    }

    fn open(&mut self, key: &str, kind: ContainerKind) {
        if self.depth == MAX_CONTAINER_DEPTH || !self.begin_entry(key, 1, 1) {
            self.overflow += 1;
            return;
        }
        self.file.write(kind.open());
        self.frames[self.depth] = ContainerFrame::new(kind);
        self.depth += 1;
    }
}

impl CrashReportWriter for ReportWriter {
    fn add_integer(&mut self, key: &str, value: i64) {
        let mut buf = [0u8; I64_MAX_LEN];
        let digits = format_i64(value, &mut buf);
        if self.begin_entry(key, digits.len(), 0) {
            self.file.write(digits);
        }
    }

    fn add_unsigned_integer(&mut self, key: &str, value: u64) {
        let mut buf = [0u8; U64_MAX_LEN];
        let digits = format_u64(value, &mut buf);
        if self.begin_entry(key, digits.len(), 0) {
            self.file.write(digits);
        }
    }

    fn add_string(&mut self, key: &str, value: &str) {
        if self.begin_entry(key, escaped_len(value), 0) {
            write_escaped(&mut self.file, value);
        }
    }

    fn add_bool(&mut self, key: &str, value: bool) {
        let literal: &[u8] = if value { b"true" } else { b"false" };
        if self.begin_entry(key, literal.len(), 0) {
            self.file.write(literal);
        }
    }

    fn begin_container(&mut self, key: &str) {
        self.open(key, ContainerKind::Object);
    }

    fn begin_array(&mut self, key: &str) {
        self.open(key, ContainerKind::Array);
    }

    fn end_container(&mut self) {
        if self.overflow > 0 {
            self.overflow -= 1;
            return;
        }
        if self.depth > self.floor {
            self.close_innermost();
        }
    }
}

const U64_MAX_LEN: usize = 20;
const I64_MAX_LEN: usize = 20;

/// Formats `value` in decimal at the end of `buf` and returns the used suffix.
pub(crate) fn format_u64(mut value: u64, buf: &mut [u8; U64_MAX_LEN]) -> &[u8] {
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &buf[pos..]
}

/// Like [`format_u64`], with a leading `-` for negative values only.
pub(crate) fn format_i64(value: i64, buf: &mut [u8; I64_MAX_LEN]) -> &[u8] {
    // i64::MIN has 19 digits, so there is always room for the sign.
    let mut digits = [0u8; U64_MAX_LEN];
    let len = format_u64(value.unsigned_abs(), &mut digits).len();
    let start = buf.len() - len;
    buf[start..].copy_from_slice(&digits[digits.len() - len..]);
    if value < 0 {
        buf[start - 1] = b'-';
        &buf[start - 1..]
    } else {
        &buf[start..]
    }
}

// Escape classes, in the style of serde_json's table.
const QU: u8 = b'"';
const BS: u8 = b'\\';
const BB: u8 = b'b';
const TT: u8 = b't';
const NN: u8 = b'n';
const FF: u8 = b'f';
const RR: u8 = b'r';
const UU: u8 = b'u';
const __: u8 = 0;

/// For each byte, the character that follows the backslash in its escape sequence, `u` for a
/// `\u00XX` escape, or 0 when the byte is written as is.
static ESCAPE: [u8; 256] = [
    //   1   2   3   4   5   6   7   8   9   A   B   C   D   E   F
    UU, UU, UU, UU, UU, UU, UU, UU, BB, TT, NN, UU, FF, RR, UU, UU, // 0
    UU, UU, UU, UU, UU, UU, UU, UU, UU, UU, UU, UU, UU, UU, UU, UU, // 1
    __, __, QU, __, __, __, __, __, __, __, __, __, __, __, __, __, // 2
    __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, // 3
    __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, // 4
    __, __, __, __, __, __, __, __, __, __, __, __, BS, __, __, __, // 5
    __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, // 6
    __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, UU, // 7
    __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, // 8
    __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, // 9
    __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, // A
    __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, // B
    __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, // C
    __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, // D
    __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, // E
    __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, __, // F
];

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Size of `value` once quoted and escaped.
fn escaped_len(value: &str) -> usize {
    value
        .bytes()
        .map(|byte| match ESCAPE[byte as usize] {
            0 => 1,
            UU => 6,
            _ => 2,
        })
        .sum::<usize>()
        + 2
}

/// Writes `value` as a quoted JSON string.  Runs of bytes that need no escaping are written
/// with a single call.
fn write_escaped(file: &mut AsyncFile, value: &str) {
    let bytes = value.as_bytes();
    file.write(b"\"");
    let mut start = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        let escape = ESCAPE[byte as usize];
        if escape == 0 {
            continue;
        }
        if start < i {
            file.write(&bytes[start..i]);
        }
        match escape {
            UU => {
                let seq = [
                    b'\\',
                    b'u',
                    b'0',
                    b'0',
                    HEX_DIGITS[(byte >> 4) as usize],
                    HEX_DIGITS[(byte & 0xF) as usize],
                ];
                file.write(&seq);
            }
            other => {
                file.write(&[b'\\', other]);
            }
        }
        start = i + 1;
    }
    if start < bytes.len() {
        file.write(&bytes[start..]);
    }
    file.write(b"\"");
}
