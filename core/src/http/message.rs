/*
 * message.rs
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

//! HTTP message record: request or response, ordered case-preserving header
//! multimap, body bytes. Serialisation re-emits headers with their original
//! names and order so a forwarded message stays recognisable.

use bytes::{Bytes, BytesMut};

use crate::http::url::RequestUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Ordered header list. Names keep their original case; lookup is
/// case-insensitive; duplicates are preserved in arrival order.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace all values of `name` with one value, keeping the position of
    /// the first occurrence; appends when absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut kept = false;
        self.entries.retain_mut(|(k, v)| {
            if k.eq_ignore_ascii_case(name) {
                if kept {
                    return false;
                }
                *v = value.clone();
                kept = true;
            }
            true
        });
        if !kept {
            self.entries.push((name.to_string(), value));
        }
    }

    /// Remove every occurrence of `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Join a continuation fragment onto the most recently added header
    /// value with a single space. Returns false when there is no header yet.
    pub fn fold_into_last(&mut self, fragment: &str) -> bool {
        match self.entries.last_mut() {
            Some((_, v)) => {
                v.push(' ');
                v.push_str(fragment);
                true
            }
            None => false,
        }
    }

    /// Append `value` to an existing comma-separated header, or add it.
    pub fn append_value(&mut self, name: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => {
                v.push_str(", ");
                v.push_str(value);
            }
            None => self.add(name, value),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when any value of `name` contains `token` as a comma-separated
    /// element, case-insensitively.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

/// One HTTP message. Requests carry `method`/`target`; responses carry
/// `code`/`reason`. The parser fills `body` with decoded body bytes; the
/// proxy drains it incrementally, the web server reads it whole.
#[derive(Debug)]
pub struct HttpMessage {
    pub kind: MessageKind,
    pub version: Version,
    pub method: Option<String>,
    pub target: Option<RequestUrl>,
    pub code: Option<u16>,
    pub reason: Option<String>,
    pub headers: Headers,
    pub body: BytesMut,
}

impl HttpMessage {
    pub fn request() -> Self {
        Self {
            kind: MessageKind::Request,
            version: Version::Http11,
            method: None,
            target: None,
            code: None,
            reason: None,
            headers: Headers::new(),
            body: BytesMut::new(),
        }
    }

    /// Build a response programmatically, e.g. for the web server or error
    /// replies. `reason` defaults from well-known codes.
    pub fn response(code: u16, reason: &str) -> Self {
        Self {
            kind: MessageKind::Response,
            version: Version::Http11,
            method: None,
            target: None,
            code: Some(code),
            reason: Some(reason.to_string()),
            headers: Headers::new(),
            body: BytesMut::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Set the body and a matching Content-Length.
    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.headers.set("Content-Length", body.len().to_string());
        self.body = BytesMut::from(body);
        self
    }

    pub fn method_is(&self, m: &str) -> bool {
        self.method
            .as_deref()
            .map(|x| x.eq_ignore_ascii_case(m))
            .unwrap_or(false)
    }

    /// Keep-alive determination: HTTP/1.1 unless `Connection: close`,
    /// HTTP/1.0 only with `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("Connection", "close"),
            Version::Http10 => self.headers.has_token("Connection", "keep-alive"),
        }
    }

    /// Serialise start line plus headers plus the blank line.
    pub fn emit_headers(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(256);
        match self.kind {
            MessageKind::Request => {
                let method = self.method.as_deref().unwrap_or("GET");
                let target = self
                    .target
                    .as_ref()
                    .map(|t| t.raw.as_str())
                    .unwrap_or("/");
                out.extend_from_slice(method.as_bytes());
                out.extend_from_slice(b" ");
                out.extend_from_slice(target.as_bytes());
                out.extend_from_slice(b" ");
                out.extend_from_slice(self.version.as_str().as_bytes());
            }
            MessageKind::Response => {
                out.extend_from_slice(self.version.as_str().as_bytes());
                out.extend_from_slice(b" ");
                out.extend_from_slice(self.code.unwrap_or(200).to_string().as_bytes());
                if let Some(reason) = &self.reason {
                    if !reason.is_empty() {
                        out.extend_from_slice(b" ");
                        out.extend_from_slice(reason.as_bytes());
                    }
                }
            }
        }
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.freeze()
    }

    /// Serialise the whole message, headers then body.
    pub fn emit(&self) -> Bytes {
        let headers = self.emit_headers();
        let mut out = BytesMut::with_capacity(headers.len() + self.body.len());
        out.extend_from_slice(&headers);
        out.extend_from_slice(&self.body);
        out.freeze()
    }
}
