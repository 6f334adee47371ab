/*
 * parser.rs
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

//! Incremental HTTP/1.x message parser. Feed bytes as they arrive; the state
//! machine advances through start line, headers, and body regardless of how
//! the input is split. Outcomes are tagged results, never panics: `NeedMore`
//! is an `Ok` with an unfinished state, failure is `ParseError`.
//!
//! Deliberately lenient where RFC 7230 permits: lone LF ends a line, leading
//! blank lines before the start line are skipped, obs-fold is joined, chunk
//! extensions and trailers are accepted and discarded.

use std::fmt;

use bytes::Bytes;

use crate::buffer::RecvBuffer;
use crate::http::message::{HttpMessage, MessageKind, Version};
use crate::http::url::parse_request_target;

/// Parser progress. Monotonically non-decreasing for one message; after
/// `Complete`, remaining buffered bytes belong to the next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParserState {
    Initialized,
    LineRcvd,
    RcvingHeaders,
    HeadersComplete,
    RcvingBody,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Bad start line, header syntax, or chunk framing.
    Malformed(&'static str),
    /// Start line plus header block exceeded the configured cap.
    TooLarge,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Malformed(what) => write!(f, "malformed message: {}", what),
            ParseError::TooLarge => write!(f, "header block too large"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Body framing, decided once at the end of the header block. Chunked wins
/// over Content-Length when both are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Unset,
    None,
    ContentLength(u64),
    Chunked,
    UntilEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

/// Longest accepted chunk-size line; hex digits for a u64 plus extensions.
const MAX_CHUNK_SIZE_LINE: usize = 1024;

pub struct HttpParser {
    state: ParserState,
    msg: HttpMessage,
    max_header_bytes: usize,
    header_bytes: usize,
    framing: Framing,
    chunk: ChunkPhase,
    /// Responses to HEAD have headers but never a body.
    head_response: bool,
    eof: bool,
    body_bytes: u64,
}

impl HttpParser {
    pub fn request(max_header_bytes: usize) -> Self {
        Self::new(MessageKind::Request, max_header_bytes)
    }

    pub fn response(max_header_bytes: usize) -> Self {
        Self::new(MessageKind::Response, max_header_bytes)
    }

    fn new(kind: MessageKind, max_header_bytes: usize) -> Self {
        let msg = match kind {
            MessageKind::Request => HttpMessage::request(),
            MessageKind::Response => HttpMessage::response(0, ""),
        };
        Self {
            state: ParserState::Initialized,
            msg,
            max_header_bytes,
            header_bytes: 0,
            framing: Framing::Unset,
            chunk: ChunkPhase::Size,
            head_response: false,
            eof: false,
            body_bytes: 0,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn message(&self) -> &HttpMessage {
        &self.msg
    }

    pub fn message_mut(&mut self) -> &mut HttpMessage {
        &mut self.msg
    }

    pub fn into_message(self) -> HttpMessage {
        self.msg
    }

    /// Total decoded body bytes seen so far.
    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }

    /// Tell a response parser that the request was HEAD.
    pub fn set_head_response(&mut self, head: bool) {
        self.head_response = head;
    }

    /// Whether this message's body is delimited by connection close.
    pub fn body_until_eof(&self) -> bool {
        self.framing == Framing::UntilEof
    }

    pub fn is_chunked(&self) -> bool {
        self.framing == Framing::Chunked
    }

    /// Remove and return body bytes decoded so far. The proxy calls this on
    /// every tick to stream; full-body consumers read `message().body` after
    /// `Complete` instead.
    pub fn drain_body(&mut self) -> Bytes {
        self.msg.body.split().freeze()
    }

    /// Signal connection EOF. Completes a close-delimited response body;
    /// anything else mid-message stays unfinished for the caller to judge.
    pub fn mark_eof(&mut self) {
        self.eof = true;
        if self.state == ParserState::RcvingBody && self.framing == Framing::UntilEof {
            self.state = ParserState::Complete;
        }
    }

    /// Consume as much of `buf` as possible. Returns the state reached; the
    /// caller appends more bytes and calls again while unfinished. Pauses
    /// once at `HeadersComplete` so headers can be inspected before body
    /// decoding begins.
    pub fn feed(&mut self, buf: &mut RecvBuffer) -> Result<ParserState, ParseError> {
        loop {
            match self.state {
                ParserState::Initialized => {
                    let line = match buf.read_line() {
                        Some(l) => l,
                        None => return self.need_more(buf),
                    };
                    if line.iter().all(|&b| b == b' ' || b == b'\t') {
                        // RFC 7230 §3.5 robustness: skip blank and
                        // whitespace-only lines before the start line.
                        self.count_header_bytes(line.len())?;
                        continue;
                    }
                    self.count_header_bytes(line.len())?;
                    self.parse_start_line(&line)?;
                    self.state = ParserState::LineRcvd;
                }
                ParserState::LineRcvd | ParserState::RcvingHeaders => {
                    let line = match buf.read_line() {
                        Some(l) => l,
                        None => return self.need_more(buf),
                    };
                    self.count_header_bytes(line.len())?;
                    if line.is_empty() {
                        self.decide_framing()?;
                        self.state = ParserState::HeadersComplete;
                        return Ok(self.state);
                    }
                    self.parse_header_line(&line)?;
                    self.state = ParserState::RcvingHeaders;
                }
                ParserState::HeadersComplete => {
                    self.state = match self.framing {
                        Framing::None | Framing::ContentLength(0) => ParserState::Complete,
                        _ => ParserState::RcvingBody,
                    };
                }
                ParserState::RcvingBody => match self.framing {
                    Framing::ContentLength(remaining) => {
                        if buf.is_empty() {
                            return Ok(self.state);
                        }
                        let take = (remaining as usize).min(buf.len());
                        self.msg.body.extend_from_slice(&buf.consume(take));
                        self.body_bytes += take as u64;
                        let left = remaining - take as u64;
                        self.framing = Framing::ContentLength(left);
                        if left == 0 {
                            self.state = ParserState::Complete;
                        }
                    }
                    Framing::Chunked => {
                        if !self.step_chunk(buf)? {
                            return Ok(self.state);
                        }
                    }
                    Framing::UntilEof => {
                        if !buf.is_empty() {
                            let all = buf.take_all();
                            self.body_bytes += all.len() as u64;
                            self.msg.body.extend_from_slice(&all);
                        }
                        if self.eof {
                            self.state = ParserState::Complete;
                        }
                        return Ok(self.state);
                    }
                    Framing::None | Framing::Unset => {
                        self.state = ParserState::Complete;
                    }
                },
                ParserState::Complete => return Ok(self.state),
            }
        }
    }

    /// One chunk-machine step. Returns false when more input is needed.
    fn step_chunk(&mut self, buf: &mut RecvBuffer) -> Result<bool, ParseError> {
        match self.chunk {
            ChunkPhase::Size => {
                let line = match buf.read_line() {
                    Some(l) => l,
                    None => {
                        if buf.len() > MAX_CHUNK_SIZE_LINE {
                            return Err(ParseError::Malformed("chunk size line too long"));
                        }
                        return Ok(false);
                    }
                };
                let text = std::str::from_utf8(&line)
                    .map_err(|_| ParseError::Malformed("chunk size not ASCII"))?;
                let hex = text.split(';').next().unwrap_or("").trim();
                if hex.is_empty() || hex.len() > 16 {
                    return Err(ParseError::Malformed("bad chunk size"));
                }
                let size = u64::from_str_radix(hex, 16)
                    .map_err(|_| ParseError::Malformed("bad chunk size"))?;
                self.chunk = if size == 0 {
                    ChunkPhase::Trailers
                } else {
                    ChunkPhase::Data(size)
                };
                Ok(true)
            }
            ChunkPhase::Data(remaining) => {
                if buf.is_empty() {
                    return Ok(false);
                }
                let take = (remaining as usize).min(buf.len());
                self.msg.body.extend_from_slice(&buf.consume(take));
                self.body_bytes += take as u64;
                let left = remaining - take as u64;
                self.chunk = if left == 0 {
                    ChunkPhase::DataEnd
                } else {
                    ChunkPhase::Data(left)
                };
                Ok(true)
            }
            ChunkPhase::DataEnd => {
                let line = match buf.read_line() {
                    Some(l) => l,
                    None => return Ok(false),
                };
                if !line.is_empty() {
                    return Err(ParseError::Malformed("chunk data not ended by CRLF"));
                }
                self.chunk = ChunkPhase::Size;
                Ok(true)
            }
            ChunkPhase::Trailers => {
                let line = match buf.read_line() {
                    Some(l) => l,
                    None => return Ok(false),
                };
                self.count_header_bytes(line.len())?;
                if line.is_empty() {
                    self.state = ParserState::Complete;
                }
                // Non-empty trailer lines are accepted and discarded.
                Ok(true)
            }
        }
    }

    fn need_more(&self, buf: &RecvBuffer) -> Result<ParserState, ParseError> {
        if self.state <= ParserState::RcvingHeaders
            && self.header_bytes + buf.len() > self.max_header_bytes
        {
            return Err(ParseError::TooLarge);
        }
        Ok(self.state)
    }

    fn count_header_bytes(&mut self, line_len: usize) -> Result<(), ParseError> {
        self.header_bytes += line_len + 2;
        if self.header_bytes > self.max_header_bytes {
            return Err(ParseError::TooLarge);
        }
        Ok(())
    }

    fn parse_start_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let text = std::str::from_utf8(line)
            .map_err(|_| ParseError::Malformed("start line not valid UTF-8"))?;
        match self.msg.kind {
            MessageKind::Request => {
                let parts: Vec<&str> = text.split_whitespace().collect();
                if parts.len() != 3 {
                    return Err(ParseError::Malformed("request line"));
                }
                let method = parts[0];
                if method.is_empty() {
                    return Err(ParseError::Malformed("empty method"));
                }
                self.msg.version = parse_version(parts[2])?;
                let connect = method.eq_ignore_ascii_case("CONNECT");
                let target = parse_request_target(connect, parts[1])
                    .map_err(|_| ParseError::Malformed("request target"))?;
                self.msg.method = Some(method.to_string());
                self.msg.target = Some(target);
            }
            MessageKind::Response => {
                let mut parts = text.splitn(3, ' ');
                let version = parts.next().unwrap_or("");
                self.msg.version = parse_version(version)?;
                let code = parts
                    .next()
                    .and_then(|s| s.parse::<u16>().ok())
                    .ok_or(ParseError::Malformed("status code"))?;
                self.msg.code = Some(code);
                self.msg.reason = parts.next().map(|s| s.to_string());
            }
        }
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let text = std::str::from_utf8(line)
            .map_err(|_| ParseError::Malformed("header not valid UTF-8"))?;
        if text.starts_with(' ') || text.starts_with('\t') {
            // obs-fold: join onto the previous value with a single space.
            if !self.msg.headers.fold_into_last(text.trim()) {
                return Err(ParseError::Malformed("folded header with no predecessor"));
            }
            return Ok(());
        }
        let colon = text
            .find(':')
            .ok_or(ParseError::Malformed("header without colon"))?;
        let name = text[..colon].trim();
        if name.is_empty() {
            return Err(ParseError::Malformed("empty header name"));
        }
        let value = text[colon + 1..].trim();
        self.msg.headers.add(name, value);
        Ok(())
    }

    fn decide_framing(&mut self) -> Result<(), ParseError> {
        if self.msg.kind == MessageKind::Response {
            let code = self.msg.code.unwrap_or(0);
            if self.head_response || code == 204 || code == 304 || (100..200).contains(&code) {
                self.framing = Framing::None;
                return Ok(());
            }
        }
        if self.msg.headers.has_token("Transfer-Encoding", "chunked") {
            self.framing = Framing::Chunked;
            return Ok(());
        }
        if let Some(cl) = self.msg.headers.get("Content-Length") {
            let n: u64 = cl
                .trim()
                .parse()
                .map_err(|_| ParseError::Malformed("content-length"))?;
            self.framing = Framing::ContentLength(n);
            return Ok(());
        }
        self.framing = match self.msg.kind {
            MessageKind::Request => Framing::None,
            MessageKind::Response => Framing::UntilEof,
        };
        Ok(())
    }
}

fn parse_version(token: &str) -> Result<Version, ParseError> {
    if token == "HTTP/1.0" {
        Ok(Version::Http10)
    } else if token.starts_with("HTTP/") {
        // Lenient: treat unknown 1.x minors as 1.1.
        Ok(Version::Http11)
    } else {
        Err(ParseError::Malformed("protocol version"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::url::TargetForm;

    fn feed_all(parser: &mut HttpParser, bytes: &[u8]) -> Result<ParserState, ParseError> {
        let mut buf = RecvBuffer::new();
        buf.append(bytes);
        // Run through the HeadersComplete pause: feed until the state stops
        // moving.
        loop {
            let before = parser.state();
            let after = parser.feed(&mut buf)?;
            if after == before {
                return Ok(after);
            }
        }
    }

    #[test]
    fn simple_get_completes_at_blank_line() {
        let mut p = HttpParser::request(65536);
        let state = feed_all(&mut p, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(state, ParserState::Complete);
        let m = p.message();
        assert_eq!(m.method.as_deref(), Some("GET"));
        assert_eq!(m.target.as_ref().unwrap().path, "/hello");
        assert_eq!(m.headers.get("host"), Some("x"));
        assert!(m.body.is_empty());
    }

    #[test]
    fn incremental_split_equivalence() {
        let raw: &[u8] = b"POST /submit?x=1 HTTP/1.1\r\nHost: origin\r\nContent-Length: 11\r\nX-Multi: a\r\nX-Multi: b\r\n\r\nhello world";
        let mut whole = HttpParser::request(65536);
        feed_all(&mut whole, raw).unwrap();

        for split in 1..raw.len() {
            let mut p = HttpParser::request(65536);
            let mut buf = RecvBuffer::new();
            buf.append(&raw[..split]);
            let _ = p.feed(&mut buf).unwrap();
            let _ = p.feed(&mut buf).unwrap();
            buf.append(&raw[split..]);
            let _ = p.feed(&mut buf).unwrap();
            let _ = p.feed(&mut buf).unwrap();
            assert_eq!(p.state(), ParserState::Complete, "split at {}", split);
            assert_eq!(p.message().method, whole.message().method);
            assert_eq!(p.message().headers.len(), whole.message().headers.len());
            assert_eq!(&p.message().body[..], &whole.message().body[..]);
        }
    }

    #[test]
    fn byte_at_a_time() {
        let raw = b"GET http://h/ HTTP/1.1\r\nAccept: */*\r\n\r\n";
        let mut p = HttpParser::request(65536);
        let mut buf = RecvBuffer::new();
        for b in raw.iter() {
            buf.append(&[*b]);
            let _ = p.feed(&mut buf).unwrap();
            let _ = p.feed(&mut buf).unwrap();
        }
        assert_eq!(p.state(), ParserState::Complete);
        assert_eq!(
            p.message().target.as_ref().unwrap().form,
            TargetForm::Absolute
        );
    }

    #[test]
    fn chunked_body_with_extension_and_trailer() {
        let raw = b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: t\r\n\r\n";
        let mut p = HttpParser::request(65536);
        feed_all(&mut p, raw).unwrap();
        assert_eq!(p.state(), ParserState::Complete);
        assert_eq!(&p.message().body[..], b"hello world");
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let raw = b"POST /u HTTP/1.1\r\nContent-Length: 999\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n\r\n";
        let mut p = HttpParser::request(65536);
        feed_all(&mut p, raw).unwrap();
        assert_eq!(p.state(), ParserState::Complete);
        assert_eq!(&p.message().body[..], b"ok");
    }

    #[test]
    fn obs_fold_joined_with_space() {
        let raw = b"GET / HTTP/1.1\r\nX-Long: first\r\n  second part\r\n\r\n";
        let mut p = HttpParser::request(65536);
        feed_all(&mut p, raw).unwrap();
        assert_eq!(
            p.message().headers.get("x-long"),
            Some("first second part")
        );
    }

    #[test]
    fn leading_blank_lines_skipped() {
        let raw = b"\r\n\r\nGET / HTTP/1.1\r\n\r\n";
        let mut p = HttpParser::request(65536);
        feed_all(&mut p, raw).unwrap();
        assert_eq!(p.state(), ParserState::Complete);
        assert_eq!(p.message().method.as_deref(), Some("GET"));
    }

    #[test]
    fn response_until_eof_body() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\npartial body";
        let mut p = HttpParser::response(65536);
        feed_all(&mut p, raw).unwrap();
        assert_eq!(p.state(), ParserState::RcvingBody);
        assert!(p.body_until_eof());
        p.mark_eof();
        assert_eq!(p.state(), ParserState::Complete);
        assert_eq!(&p.message().body[..], b"partial body");
    }

    #[test]
    fn head_and_no_content_responses_have_no_body() {
        let mut p = HttpParser::response(65536);
        p.set_head_response(true);
        feed_all(&mut p, b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n").unwrap();
        assert_eq!(p.state(), ParserState::Complete);

        let mut p = HttpParser::response(65536);
        feed_all(&mut p, b"HTTP/1.1 304 Not Modified\r\n\r\n").unwrap();
        assert_eq!(p.state(), ParserState::Complete);
    }

    #[test]
    fn connect_authority_form() {
        let mut p = HttpParser::request(65536);
        feed_all(
            &mut p,
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
        )
        .unwrap();
        assert_eq!(p.state(), ParserState::Complete);
        let t = p.message().target.as_ref().unwrap();
        assert_eq!(t.form, TargetForm::Authority);
        assert_eq!(t.host.as_deref(), Some("example.com"));
        assert_eq!(t.port, 443);
    }

    #[test]
    fn bytes_after_complete_stay_buffered() {
        let mut p = HttpParser::request(65536);
        let mut buf = RecvBuffer::new();
        buf.append(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let _ = p.feed(&mut buf).unwrap();
        let _ = p.feed(&mut buf).unwrap();
        assert_eq!(p.state(), ParserState::Complete);
        assert_eq!(buf.as_slice(), b"GET /b HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn malformed_inputs() {
        let mut p = HttpParser::request(65536);
        assert!(matches!(
            feed_all(&mut p, b"GARBAGE\r\n\r\n"),
            Err(ParseError::Malformed(_))
        ));

        let mut p = HttpParser::request(65536);
        assert!(matches!(
            feed_all(&mut p, b"GET / HTTP/1.1\r\nbad header line\r\n\r\n"),
            Err(ParseError::Malformed(_))
        ));

        let mut p = HttpParser::request(65536);
        assert!(matches!(
            feed_all(
                &mut p,
                b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffffff\r\n"
            ),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn oversize_header_block_rejected() {
        let mut p = HttpParser::request(128);
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..16 {
            raw.extend_from_slice(format!("X-Pad-{}: {}\r\n", i, "y".repeat(16)).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        assert!(matches!(feed_all(&mut p, &raw), Err(ParseError::TooLarge)));
    }

    #[test]
    fn emit_round_trips_request() {
        let raw = b"GET http://origin:8080/x?q=2 HTTP/1.1\r\nHost: origin:8080\r\nAccept: */*\r\n\r\n";
        let mut p = HttpParser::request(65536);
        feed_all(&mut p, raw).unwrap();
        assert_eq!(&p.message().emit_headers()[..], &raw[..]);
    }

    #[test]
    fn content_length_streaming_drain() {
        let mut p = HttpParser::request(65536);
        let mut buf = RecvBuffer::new();
        buf.append(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n12345");
        let _ = p.feed(&mut buf).unwrap();
        let _ = p.feed(&mut buf).unwrap();
        assert_eq!(p.state(), ParserState::RcvingBody);
        assert_eq!(&p.drain_body()[..], b"12345");
        buf.append(b"67890");
        let _ = p.feed(&mut buf).unwrap();
        assert_eq!(p.state(), ParserState::Complete);
        assert_eq!(&p.drain_body()[..], b"67890");
        assert_eq!(p.body_bytes(), 10);
    }
}
