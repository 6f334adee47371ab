/*
 * buffer.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Varco, an intercepting HTTP/HTTPS proxy.
 *
 * Varco is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Varco is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Varco.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Receive buffer: append-only byte accumulator with consume-from-front and
//! CRLF line framing (lone LF accepted). The parser and connection share this
//! instead of raw BytesMut so line scanning lives in one place.

use bytes::{Bytes, BytesMut};

/// Append-only read buffer. After `consume(k)`, the byte at index 0 is the
/// (k+1)-th byte ever written.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    buf: BytesMut,
    /// Total bytes ever appended (not reduced by consumption).
    total: u64,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            total: 0,
        }
    }

    /// Append bytes at the end. O(1) amortised.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.total += data.len() as u64;
    }

    /// Direct access for `AsyncReadExt::read_buf`. Callers that bypass
    /// `append` must call `note_appended` with the byte count read.
    pub fn inner_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn note_appended(&mut self, n: usize) {
        self.total += n as u64;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes ever appended, including consumed ones.
    pub fn total_appended(&self) -> u64 {
        self.total
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Remove and return the first `k` bytes. Panics if `k > len()`.
    pub fn consume(&mut self, k: usize) -> Bytes {
        self.buf.split_to(k).freeze()
    }

    /// Remove and return everything buffered.
    pub fn take_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Pop one line if a complete one is buffered. The line terminator is
    /// consumed but not returned; CRLF and lone LF both end a line.
    pub fn read_line(&mut self) -> Option<Bytes> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line = self.buf.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(line.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_preserves_order() {
        let mut b = RecvBuffer::new();
        b.append(b"abcdef");
        let head = b.consume(2);
        assert_eq!(&head[..], b"ab");
        assert_eq!(b.as_slice(), b"cdef");
        assert_eq!(b.total_appended(), 6);
    }

    #[test]
    fn read_line_crlf_and_lf() {
        let mut b = RecvBuffer::new();
        b.append(b"first\r\nsecond\npartial");
        assert_eq!(&b.read_line().unwrap()[..], b"first");
        assert_eq!(&b.read_line().unwrap()[..], b"second");
        assert!(b.read_line().is_none());
        assert_eq!(b.as_slice(), b"partial");
        b.append(b"\r\n");
        assert_eq!(&b.read_line().unwrap()[..], b"partial");
    }

    #[test]
    fn read_line_split_across_appends() {
        let mut b = RecvBuffer::new();
        b.append(b"GET / HT");
        assert!(b.read_line().is_none());
        b.append(b"TP/1.1\r");
        assert!(b.read_line().is_none());
        b.append(b"\n");
        assert_eq!(&b.read_line().unwrap()[..], b"GET / HTTP/1.1");
    }

    #[test]
    fn empty_line() {
        let mut b = RecvBuffer::new();
        b.append(b"\r\nrest");
        let line = b.read_line().unwrap();
        assert!(line.is_empty());
        assert_eq!(b.as_slice(), b"rest");
    }
}
