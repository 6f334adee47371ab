/*
 * url.rs
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

//! Request-target parsing. The three forms are detected by syntax, not by
//! method (with CONNECT as the one method-driven case): authority-form for
//! CONNECT, absolute-form when the target starts with a scheme, origin-form
//! otherwise. Hosts are lowercased and default ports filled by scheme.

/// Which request-target syntax the client used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetForm {
    /// `/path?query` — a request to the embedded web server.
    Origin,
    /// `http://host:port/path` — a forward-proxy request.
    Absolute,
    /// `host:port` — CONNECT.
    Authority,
}

/// Parsed request-target. `raw` keeps the exact bytes from the start line so
/// a message can be re-emitted unchanged; the proxy rewrites `raw` to
/// origin-form before forwarding.
#[derive(Debug, Clone)]
pub struct RequestUrl {
    pub form: TargetForm,
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
    pub raw: String,
}

impl RequestUrl {
    /// The origin-form rendering: path plus query, never empty.
    pub fn origin_form(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        match &self.query {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        }
    }
}

fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    }
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals. Empty host or an
/// unparsable port is an error.
fn split_host_port(authority: &str, fallback_port: u16) -> Result<(String, u16), ()> {
    // Drop userinfo if present; the last @ separates it from the host.
    let hostport = match authority.rfind('@') {
        Some(i) => &authority[i + 1..],
        None => authority,
    };
    if hostport.is_empty() {
        return Err(());
    }
    if let Some(rest) = hostport.strip_prefix('[') {
        // [::1] or [::1]:8080
        let close = rest.find(']').ok_or(())?;
        let host = rest[..close].to_ascii_lowercase();
        let after = &rest[close + 1..];
        if after.is_empty() {
            return Ok((host, fallback_port));
        }
        let port = after.strip_prefix(':').ok_or(())?.parse().map_err(|_| ())?;
        return Ok((host, port));
    }
    match hostport.rfind(':') {
        Some(i) => {
            let host = hostport[..i].to_ascii_lowercase();
            if host.is_empty() {
                return Err(());
            }
            let port = hostport[i + 1..].parse().map_err(|_| ())?;
            Ok((host, port))
        }
        None => Ok((hostport.to_ascii_lowercase(), fallback_port)),
    }
}

/// True when the target starts with `scheme://`.
fn has_scheme(target: &str) -> bool {
    match target.find("://") {
        Some(i) if i > 0 => target[..i]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'),
        _ => false,
    }
}

/// Parse a request-target from the start line. `connect` selects
/// authority-form handling.
pub fn parse_request_target(connect: bool, target: &str) -> Result<RequestUrl, ()> {
    if target.is_empty() {
        return Err(());
    }
    if connect {
        let (host, port) = split_host_port(target, 443)?;
        return Ok(RequestUrl {
            form: TargetForm::Authority,
            scheme: None,
            host: Some(host),
            port,
            path: String::new(),
            query: None,
            raw: target.to_string(),
        });
    }
    if has_scheme(target) {
        let sep = target.find("://").unwrap();
        let scheme = target[..sep].to_ascii_lowercase();
        let rest = &target[sep + 3..];
        let (authority, path_query) = match rest.find(['/', '?']) {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let (host, port) = split_host_port(authority, default_port(&scheme))?;
        let (path, query) = split_path_query(path_query);
        return Ok(RequestUrl {
            form: TargetForm::Absolute,
            scheme: Some(scheme),
            host: Some(host),
            port,
            path,
            query,
            raw: target.to_string(),
        });
    }
    if !target.starts_with('/') && target != "*" {
        return Err(());
    }
    let (path, query) = split_path_query(target);
    Ok(RequestUrl {
        form: TargetForm::Origin,
        scheme: None,
        host: None,
        port: 0,
        path,
        query,
        raw: target.to_string(),
    })
}

fn split_path_query(s: &str) -> (String, Option<String>) {
    match s.find('?') {
        Some(i) => (s[..i].to_string(), Some(s[i + 1..].to_string())),
        None => (s.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_form() {
        let u = parse_request_target(false, "/index.html?a=1&b=2").unwrap();
        assert_eq!(u.form, TargetForm::Origin);
        assert_eq!(u.path, "/index.html");
        assert_eq!(u.query.as_deref(), Some("a=1&b=2"));
        assert!(u.host.is_none());
        assert_eq!(u.origin_form(), "/index.html?a=1&b=2");
    }

    #[test]
    fn absolute_form_default_port() {
        let u = parse_request_target(false, "http://Example.COM/x").unwrap();
        assert_eq!(u.form, TargetForm::Absolute);
        assert_eq!(u.scheme.as_deref(), Some("http"));
        assert_eq!(u.host.as_deref(), Some("example.com"));
        assert_eq!(u.port, 80);
        assert_eq!(u.origin_form(), "/x");
    }

    #[test]
    fn absolute_form_https_explicit_port_and_empty_path() {
        let u = parse_request_target(false, "https://host:8443").unwrap();
        assert_eq!(u.port, 8443);
        assert_eq!(u.origin_form(), "/");
        let u = parse_request_target(false, "https://host/").unwrap();
        assert_eq!(u.port, 443);
    }

    #[test]
    fn authority_form_connect() {
        let u = parse_request_target(true, "example.com:443").unwrap();
        assert_eq!(u.form, TargetForm::Authority);
        assert_eq!(u.host.as_deref(), Some("example.com"));
        assert_eq!(u.port, 443);
        let u = parse_request_target(true, "example.com").unwrap();
        assert_eq!(u.port, 443);
    }

    #[test]
    fn ipv6_authority() {
        let u = parse_request_target(true, "[::1]:8443").unwrap();
        assert_eq!(u.host.as_deref(), Some("::1"));
        assert_eq!(u.port, 8443);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_request_target(false, "no-slash").is_err());
        assert!(parse_request_target(false, "").is_err());
        assert!(parse_request_target(true, ":443").is_err());
        assert!(parse_request_target(true, "host:notaport").is_err());
    }
}
