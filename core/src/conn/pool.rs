/*
 * pool.rs
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

//! Upstream connection pool: idle keep-alive connections keyed by
//! (host, port, tls). An entry handed out leaves the idle set; release
//! re-inserts it when still open and below the per-key cap. Expired entries
//! are evicted opportunistically on acquire. New connects are bounded by the
//! connect timeout and serialised per key so a burst cannot overshoot the
//! cap. Connecting (DNS included) is the one place the core may wait on the
//! world outside a socket readiness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::conn::connection::{PeerStream, TcpConn};
use crate::error::ProxyError;
use crate::net;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

struct IdleConn {
    conn: TcpConn,
    since: Instant,
}

#[derive(Default)]
struct KeyState {
    idle: Vec<IdleConn>,
    /// Serialises fresh connects for this key.
    gate: Arc<Mutex<()>>,
}

pub struct UpstreamPool {
    keys: Mutex<HashMap<PoolKey, KeyState>>,
    idle_ttl: Duration,
    max_per_key: usize,
    connect_timeout: Duration,
}

impl UpstreamPool {
    pub fn new(idle_ttl: Duration, max_per_key: usize, connect_timeout: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            idle_ttl,
            max_per_key,
            connect_timeout,
        }
    }

    /// Take an idle connection for the key, or dial a fresh one.
    pub async fn acquire(&self, host: &str, port: u16, tls: bool) -> Result<TcpConn, ProxyError> {
        let key = PoolKey {
            host: host.to_string(),
            port,
            tls,
        };
        let gate = {
            let mut keys = self.keys.lock().await;
            let state = keys.entry(key.clone()).or_default();
            let now = Instant::now();
            state
                .idle
                .retain(|e| now.duration_since(e.since) < self.idle_ttl && !e.conn.is_closed());
            if let Some(entry) = state.idle.pop() {
                return Ok(entry.conn);
            }
            state.gate.clone()
        };
        // Hold the per-key gate across the connect so concurrent acquires
        // for one key dial sequentially.
        let _serial = gate.lock().await;
        {
            let mut keys = self.keys.lock().await;
            if let Some(state) = keys.get_mut(&key) {
                if let Some(entry) = state.idle.pop() {
                    return Ok(entry.conn);
                }
            }
        }
        self.connect(host, port, tls).await
    }

    /// Dial without consulting the idle set. CONNECT tunnels use this: a
    /// tunneled socket can never be reused.
    pub async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<TcpConn, ProxyError> {
        let addr = format!("{}:{}", host, port);
        let tcp = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProxyError::Timeout("upstream connect"))?
            .map_err(|e| ProxyError::UpstreamConnect(format!("{}: {}", addr, e)))?;
        let stream = if tls {
            let tls_stream = timeout(self.connect_timeout, net::upgrade_to_tls(tcp, host))
                .await
                .map_err(|_| ProxyError::Timeout("upstream TLS handshake"))?
                .map_err(|e| ProxyError::UpstreamConnect(format!("TLS to {}: {}", addr, e)))?;
            PeerStream::ClientTls(Box::new(tls_stream))
        } else {
            PeerStream::Tcp(tcp)
        };
        Ok(TcpConn::server(stream))
    }

    /// Give a connection back. Reusable and open connections below the cap
    /// rejoin the idle set; everything else is closed.
    pub async fn release(&self, key: &PoolKey, mut conn: TcpConn, reusable: bool) {
        if !reusable || conn.is_closed() || conn.has_pending() {
            conn.close().await;
            return;
        }
        let mut keys = self.keys.lock().await;
        let state = keys.entry(key.clone()).or_default();
        if state.idle.len() < self.max_per_key {
            state.idle.push(IdleConn {
                conn,
                since: Instant::now(),
            });
        } else {
            drop(keys);
            conn.close().await;
        }
    }

    /// Number of idle connections currently held for a key.
    pub async fn idle_count(&self, key: &PoolKey) -> usize {
        let keys = self.keys.lock().await;
        keys.get(key).map(|s| s.idle.len()).unwrap_or(0)
    }

    /// Close every idle connection. Called on shutdown.
    pub async fn close_all(&self) {
        let mut keys = self.keys.lock().await;
        for (_, state) in keys.iter_mut() {
            for mut entry in state.idle.drain(..) {
                entry.conn.close().await;
            }
        }
    }
}
