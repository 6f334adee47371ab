/*
 * web.rs
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

//! Embedded web server plugin: PAC document, static files, registered
//! routes, default 404. Routing is by path, in that order. Every built-in
//! response closes the connection.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use percent_encoding::percent_decode_str;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::HttpMessage;

/// A user-supplied route handler, matched by path prefix.
pub trait WebRoute: Send + Sync {
    /// Path prefix this route claims, e.g. `/api/`.
    fn prefix(&self) -> &str;

    /// Produce the response for a complete request.
    fn handle(&self, request: &HttpMessage) -> HttpMessage;
}

pub struct WebServer {
    pac_body: Option<Vec<u8>>,
    pac_path: String,
    static_root: Option<PathBuf>,
    routes: Vec<std::sync::Arc<dyn WebRoute>>,
}

impl WebServer {
    /// Resolve configuration once at startup: load the PAC document (file
    /// path or inline script) and canonicalise the static root.
    pub fn new(
        cfg: &ProxyConfig,
        routes: Vec<std::sync::Arc<dyn WebRoute>>,
    ) -> Result<Self, ProxyError> {
        let pac_body = match &cfg.pac_file {
            Some(value) => {
                let path = Path::new(value);
                if path.is_file() {
                    Some(std::fs::read(path).map_err(|e| {
                        ProxyError::internal(format!("PAC file unreadable: {}", e))
                    })?)
                } else {
                    Some(value.clone().into_bytes())
                }
            }
            None => None,
        };
        let static_root = if cfg.static_server_enabled {
            match &cfg.static_server_dir {
                Some(dir) => Some(dir.canonicalize().map_err(|e| {
                    ProxyError::internal(format!("static dir {}: {}", dir.display(), e))
                })?),
                None => None,
            }
        } else {
            None
        };
        Ok(Self {
            pac_body,
            pac_path: cfg.pac_path.clone(),
            static_root,
            routes,
        })
    }

    /// Route a complete request to a response.
    pub fn handle(&self, request: &HttpMessage) -> HttpMessage {
        let path = request
            .target
            .as_ref()
            .map(|t| t.path.as_str())
            .unwrap_or("/");

        if let Some(pac) = &self.pac_body {
            if path == self.pac_path {
                return HttpMessage::response(200, "OK")
                    .with_header("Content-Type", "application/x-ns-proxy-autoconfig")
                    .with_header("Connection", "close")
                    .with_body(pac);
            }
        }

        if let Some(root) = &self.static_root {
            match self.serve_static(root, path, request) {
                StaticOutcome::Served(resp) | StaticOutcome::Forbidden(resp) => return resp,
                StaticOutcome::NotFound => {}
            }
        }

        // Longest claimed prefix wins among registered routes.
        let mut best: Option<&dyn WebRoute> = None;
        for route in &self.routes {
            if path.starts_with(route.prefix())
                && best.map(|b| route.prefix().len() > b.prefix().len()).unwrap_or(true)
            {
                best = Some(route.as_ref());
            }
        }
        if let Some(route) = best {
            return route.handle(request);
        }

        not_found()
    }

    fn serve_static(&self, root: &Path, raw_path: &str, request: &HttpMessage) -> StaticOutcome {
        let decoded = percent_decode_str(raw_path).decode_utf8_lossy();
        let relative = decoded.trim_start_matches('/');
        let candidate = Path::new(relative);
        // Reject traversal before touching the filesystem.
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return StaticOutcome::Forbidden(not_found());
        }
        let mut full = root.join(candidate);
        if full.is_dir() {
            full = full.join("index.html");
        }
        // Symlink-canonicalised prefix check: the resolved file must still
        // live under the static root.
        let resolved = match full.canonicalize() {
            Ok(p) => p,
            Err(_) => return StaticOutcome::NotFound,
        };
        if !resolved.starts_with(root) {
            return StaticOutcome::Forbidden(not_found());
        }
        if !resolved.is_file() {
            return StaticOutcome::NotFound;
        }
        let content = match std::fs::read(&resolved) {
            Ok(c) => c,
            Err(_) => return StaticOutcome::NotFound,
        };

        let mime = mime_guess::from_path(&resolved).first_or_octet_stream();
        let gzip_ok = request.headers.has_token("Accept-Encoding", "gzip");
        let mut resp = HttpMessage::response(200, "OK")
            .with_header("Content-Type", mime.as_ref())
            .with_header("Cache-Control", "max-age=86400")
            .with_header("Connection", "close");
        if gzip_ok {
            match gzip(&content) {
                Ok(encoded) => {
                    resp = resp
                        .with_header("Content-Encoding", "gzip")
                        .with_body(&encoded);
                }
                Err(_) => {
                    resp = resp.with_body(&content);
                }
            }
        } else {
            resp = resp.with_body(&content);
        }
        StaticOutcome::Served(resp)
    }
}

enum StaticOutcome {
    Served(HttpMessage),
    /// Path-safety rejection: answered 404, no further routing.
    Forbidden(HttpMessage),
    /// Nothing at that path; later routes may still claim it.
    NotFound,
}

/// The default response when nothing claims a path.
pub fn not_found() -> HttpMessage {
    HttpMessage::response(404, "NOT FOUND")
        .with_header("Server", "varco")
        .with_header("Connection", "close")
        .with_body(b"")
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpParser;
    use std::io::Read;
    use std::sync::Arc;

    fn request(raw: &[u8]) -> HttpMessage {
        let mut parser = HttpParser::request(65536);
        let mut buf = crate::buffer::RecvBuffer::new();
        buf.append(raw);
        let _ = parser.feed(&mut buf).unwrap();
        let _ = parser.feed(&mut buf).unwrap();
        parser.into_message()
    }

    fn server_with(cfg: &ProxyConfig) -> WebServer {
        WebServer::new(cfg, Vec::new()).unwrap()
    }

    #[test]
    fn default_is_404_with_close() {
        let cfg = ProxyConfig::default();
        let server = server_with(&cfg);
        let resp = server.handle(&request(b"GET /hello HTTP/1.1\r\n\r\n"));
        let bytes = resp.emit();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 NOT FOUND\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn pac_served_from_inline_buffer() {
        let script =
            "function FindProxyForURL(url, host) { return \"PROXY localhost:8899; DIRECT\"; }";
        let cfg = ProxyConfig {
            pac_file: Some(script.to_string()),
            ..Default::default()
        };
        let server = server_with(&cfg);
        let resp = server.handle(&request(b"GET / HTTP/1.1\r\n\r\n"));
        assert_eq!(resp.code, Some(200));
        assert_eq!(
            resp.headers.get("content-type"),
            Some("application/x-ns-proxy-autoconfig")
        );
        assert_eq!(resp.headers.get("connection"), Some("close"));
        assert_eq!(&resp.body[..], script.as_bytes());
    }

    #[test]
    fn pac_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let pac_path = dir.path().join("proxy.pac");
        std::fs::write(&pac_path, b"function FindProxyForURL(u, h) { return \"DIRECT\"; }")
            .unwrap();
        let cfg = ProxyConfig {
            pac_file: Some(pac_path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let server = server_with(&cfg);
        let resp = server.handle(&request(b"GET / HTTP/1.1\r\n\r\n"));
        assert_eq!(resp.code, Some(200));
        assert!(std::str::from_utf8(&resp.body)
            .unwrap()
            .contains("FindProxyForURL"));
    }

    #[test]
    fn static_file_gzip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let body = b"<html><head></head><body><h1>Proxy Testing</h1></body></html>";
        std::fs::write(dir.path().join("index.html"), body).unwrap();
        let cfg = ProxyConfig {
            static_server_enabled: true,
            static_server_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let server = server_with(&cfg);
        let resp = server.handle(&request(
            b"GET /index.html HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n",
        ));
        assert_eq!(resp.code, Some(200));
        assert_eq!(resp.headers.get("content-type"), Some("text/html"));
        assert_eq!(resp.headers.get("cache-control"), Some("max-age=86400"));
        assert_eq!(resp.headers.get("content-encoding"), Some("gzip"));
        assert_eq!(resp.headers.get("connection"), Some("close"));
        assert_eq!(
            resp.headers.get("content-length"),
            Some(resp.body.len().to_string().as_str())
        );

        let mut decoder = flate2::read::GzDecoder::new(&resp.body[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn directory_index_expansion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"home").unwrap();
        let cfg = ProxyConfig {
            static_server_enabled: true,
            static_server_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let server = server_with(&cfg);
        let resp = server.handle(&request(b"GET / HTTP/1.1\r\n\r\n"));
        assert_eq!(resp.code, Some(200));
        assert_eq!(&resp.body[..], b"home");
    }

    #[test]
    fn traversal_is_rejected_with_404() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"home").unwrap();
        let cfg = ProxyConfig {
            static_server_enabled: true,
            static_server_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let server = server_with(&cfg);
        for path in [
            "/../etc/passwd",
            "/a/../../etc/passwd",
            "/%2e%2e/etc/passwd",
        ] {
            let raw = format!("GET {} HTTP/1.1\r\n\r\n", path);
            let resp = server.handle(&request(raw.as_bytes()));
            assert_eq!(resp.code, Some(404), "path {}", path);
        }
    }

    #[test]
    fn registered_route_longest_prefix_wins() {
        struct Fixed(&'static str, &'static str);
        impl WebRoute for Fixed {
            fn prefix(&self) -> &str {
                self.0
            }
            fn handle(&self, _request: &HttpMessage) -> HttpMessage {
                HttpMessage::response(200, "OK")
                    .with_header("Connection", "close")
                    .with_body(self.1.as_bytes())
            }
        }
        let cfg = ProxyConfig::default();
        let server = WebServer::new(
            &cfg,
            vec![Arc::new(Fixed("/api/", "api")), Arc::new(Fixed("/api/v2/", "v2"))],
        )
        .unwrap();
        let resp = server.handle(&request(b"GET /api/v2/thing HTTP/1.1\r\n\r\n"));
        assert_eq!(&resp.body[..], b"v2");
        let resp = server.handle(&request(b"GET /api/other HTTP/1.1\r\n\r\n"));
        assert_eq!(&resp.body[..], b"api");
        let resp = server.handle(&request(b"GET /elsewhere HTTP/1.1\r\n\r\n"));
        assert_eq!(resp.code, Some(404));
    }
}
