/*
 * config.rs
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

//! Settled proxy configuration. The core never reads flags or files; a
//! front-end deserializes or constructs this value once and each worker gets
//! an immutable shared copy.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// All options the core recognises. `Default` gives the documented defaults;
/// front-ends may deserialize the struct from any format.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address to accept on.
    pub listen_addr: String,
    pub listen_port: u16,
    pub listen_backlog: u32,
    /// Optional UNIX domain socket to accept on as well.
    pub unix_socket_path: Option<PathBuf>,

    /// Number of worker loops (>= 1).
    pub workers: usize,
    /// Hand accepted sockets to dedicated workers instead of serving them in
    /// the acceptor's own loop.
    pub threaded: bool,

    /// CA certificate and key; both present enables TLS interception.
    pub ca_cert: Option<PathBuf>,
    pub ca_key: Option<PathBuf>,
    /// Where synthesised per-host certificates are cached.
    pub cert_dir: Option<PathBuf>,
    pub cert_validity_days: u32,

    /// Fixed certificate for TLS on the listener itself.
    pub tls_listener_cert: Option<PathBuf>,
    pub tls_listener_key: Option<PathBuf>,

    /// PAC document: a file path, or the script itself inline.
    pub pac_file: Option<String>,
    /// Route the PAC document is served on.
    pub pac_path: String,

    pub static_server_enabled: bool,
    pub static_server_dir: Option<PathBuf>,

    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub pool_idle_ttl_secs: u64,
    pub pool_max_per_key: usize,

    /// Parser safety cap for the start line plus header block.
    pub max_header_bytes: usize,

    /// `user:password`; present enables the proxy Basic-auth sub-plugin.
    pub auth_credentials: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 8899,
            listen_backlog: 1024,
            unix_socket_path: None,
            workers: 1,
            threaded: false,
            ca_cert: None,
            ca_key: None,
            cert_dir: None,
            cert_validity_days: 365,
            tls_listener_cert: None,
            tls_listener_key: None,
            pac_file: None,
            pac_path: "/".to_string(),
            static_server_enabled: false,
            static_server_dir: None,
            idle_timeout_secs: 30,
            connect_timeout_secs: 10,
            pool_idle_ttl_secs: 60,
            pool_max_per_key: 8,
            max_header_bytes: 64 * 1024,
            auth_credentials: None,
        }
    }
}

impl ProxyConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pool_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.pool_idle_ttl_secs)
    }

    /// Interception is on only when both CA halves are configured.
    pub fn interception_enabled(&self) -> bool {
        self.ca_cert.is_some() && self.ca_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ProxyConfig::default();
        assert_eq!(c.listen_port, 8899);
        assert_eq!(c.idle_timeout(), Duration::from_secs(30));
        assert_eq!(c.connect_timeout(), Duration::from_secs(10));
        assert_eq!(c.pool_idle_ttl(), Duration::from_secs(60));
        assert_eq!(c.max_header_bytes, 65536);
        assert!(!c.interception_enabled());
    }

    #[test]
    fn deserializes_partial_config() {
        let c: ProxyConfig =
            serde_json::from_str(r#"{"listen_port": 3128, "workers": 4, "threaded": true}"#)
                .unwrap();
        assert_eq!(c.listen_port, 3128);
        assert_eq!(c.workers, 4);
        assert!(c.threaded);
        assert_eq!(c.max_header_bytes, 65536);
    }
}
