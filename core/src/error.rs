/*
 * error.rs
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

//! Proxy error kinds. All errors within one connection are absorbed by its
//! handler; only startup failures (bind, unreadable CA material) propagate
//! out of `ProxyServer`.

use std::fmt;
use std::io;

/// Errors raised while serving one connection, or fatally at startup.
#[derive(Debug)]
pub enum ProxyError {
    /// Malformed request from the client. Reply 400 if bytes can still be
    /// sent, then close.
    ClientProtocol(String),
    /// DNS, TCP connect, or TLS handshake to the origin failed. Reply 502.
    UpstreamConnect(String),
    /// The origin returned malformed HTTP mid-response. Close both sides,
    /// no retry: response bytes may already be on the wire.
    UpstreamProtocol(String),
    /// Idle or connect timeout. Reply 504 if no response has started.
    Timeout(&'static str),
    /// Certificate synthesis or interception handshake failed. Close the
    /// client leg without a response.
    TlsIntercept(String),
    /// Plugin fault or other internal bug, caught at the plugin boundary.
    Internal(String),
}

impl ProxyError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::ClientProtocol(m) => write!(f, "client protocol error: {}", m),
            ProxyError::UpstreamConnect(m) => write!(f, "upstream connect error: {}", m),
            ProxyError::UpstreamProtocol(m) => write!(f, "upstream protocol error: {}", m),
            ProxyError::Timeout(what) => write!(f, "timeout: {}", what),
            ProxyError::TlsIntercept(m) => write!(f, "TLS interception error: {}", m),
            ProxyError::Internal(m) => write!(f, "internal error: {}", m),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}
