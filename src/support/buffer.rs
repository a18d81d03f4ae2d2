//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Petramap.
//
// Petramap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Petramap is distributed in the hope that  it will be useful, but WITHOUT
// ANY  WARRANTY; without  even the  implied warranty  of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Petramap. If not, see <http://www.gnu.org/licenses/>.

//! The per-connection read buffer.
//!
//! Bytes read from the socket are appended here, and the protocol servers
//! consume them a line or a literal at a time. `remove_line` performs the
//! framing for line-oriented input; `remove` extracts the exact byte counts
//! needed for IMAP literals.

/// A FIFO byte queue with line extraction.
///
/// Consumed bytes are dropped lazily; the storage is compacted whenever the
/// dead prefix grows past a threshold so that a long-lived connection does
/// not accumulate garbage.
#[derive(Default)]
pub struct Buffer {
    data: Vec<u8>,
    start: usize,
}

const COMPACT_THRESHOLD: usize = 16 * 1024;

impl Buffer {
    pub fn new() -> Self {
        Buffer::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Returns the number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Removes and returns the next LF-terminated line, without its line
    /// ending (either CRLF or a bare LF).
    ///
    /// Returns `None` if no complete line has arrived yet.
    pub fn remove_line(&mut self) -> Option<Vec<u8>> {
        let eol = memchr::memchr(b'\n', self.as_slice())?;
        let mut line = self.remove(eol + 1);
        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }
        Some(line)
    }

    /// Removes and returns exactly `n` bytes, which must be available.
    pub fn remove(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.len());
        let ret = self.data[self.start..self.start + n].to_vec();
        self.start += n;
        self.compact();
        ret
    }

    /// Drops everything currently buffered.
    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }

    fn compact(&mut self) {
        if self.start >= COMPACT_THRESHOLD || self.start == self.data.len() {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn line_extraction() {
        let mut buffer = Buffer::new();
        buffer.append(b"a1 NOOP\r\na2 CAPAB");

        assert_eq!(Some(b"a1 NOOP".to_vec()), buffer.remove_line());
        assert_eq!(None, buffer.remove_line());

        buffer.append(b"ILITY\nrest");
        assert_eq!(Some(b"a2 CAPABILITY".to_vec()), buffer.remove_line());
        assert_eq!(4, buffer.len());
    }

    #[test]
    fn exact_removal() {
        let mut buffer = Buffer::new();
        buffer.append(b"0123456789");
        assert_eq!(b"0123".to_vec(), buffer.remove(4));
        assert_eq!(b"456789".to_vec(), buffer.remove(6));
        assert!(buffer.is_empty());
    }

    #[test]
    fn empty_line() {
        let mut buffer = Buffer::new();
        buffer.append(b"\r\n");
        assert_eq!(Some(Vec::new()), buffer.remove_line());
    }
}
