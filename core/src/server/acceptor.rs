/*
 * acceptor.rs
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

//! Listener, acceptor, and workers. One acceptor hands sockets round-robin
//! to N workers over bounded queues; a full queue pauses accepting, pushing
//! backpressure into the kernel's accept backlog. Each worker drives its own
//! disjoint set of handlers. Shutdown is a watch flag: accepting stops,
//! handlers get a drain grace, stragglers are aborted, idle pool sockets
//! close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::ProxyConfig;
use crate::conn::{PeerStream, PrefixedStream, TcpConn, UpstreamPool};
use crate::error::ProxyError;
use crate::event::{EventSink, NoopSink};
use crate::plugin::proxy::ProxyAuthFactory;
use crate::plugin::web::WebServer;
use crate::plugin::PluginRegistry;
use crate::server::handler::ProtocolHandler;
use crate::tls::CertStore;

const HANDOFF_QUEUE: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything a worker needs to build handlers.
#[derive(Clone)]
struct WorkerDeps {
    cfg: Arc<ProxyConfig>,
    registry: Arc<PluginRegistry>,
    web: Arc<WebServer>,
    pool: Arc<UpstreamPool>,
    certs: Option<Arc<CertStore>>,
    events: Arc<dyn EventSink>,
    listener_tls: Option<TlsAcceptor>,
}

/// Cooperative stop signal for a running server.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

pub struct ProxyServer {
    deps: WorkerDeps,
    listener: TcpListener,
    #[cfg(unix)]
    unix_listener: Option<tokio::net::UnixListener>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ProxyServer {
    /// Bind listeners and resolve startup state. Fatal errors (bad address,
    /// unreadable CA material, missing static root) surface here, before
    /// any connection is accepted.
    pub async fn bind(
        cfg: ProxyConfig,
        mut registry: PluginRegistry,
        events: Option<Arc<dyn EventSink>>,
    ) -> Result<Self, ProxyError> {
        let events = events.unwrap_or_else(|| Arc::new(NoopSink));
        let certs = match (&cfg.ca_cert, &cfg.ca_key) {
            (Some(ca_cert), Some(ca_key)) => {
                let cert_dir = cfg
                    .cert_dir
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join("varco-certs"));
                Some(Arc::new(CertStore::load(
                    ca_cert,
                    ca_key,
                    &cert_dir,
                    cfg.cert_validity_days,
                )?))
            }
            _ => None,
        };
        if let Some(creds) = &cfg.auth_credentials {
            registry
                .proxy
                .insert(0, Arc::new(ProxyAuthFactory::new(creds)));
        }
        let web = Arc::new(WebServer::new(&cfg, registry.web_routes.clone())?);
        let pool = Arc::new(UpstreamPool::new(
            cfg.pool_idle_ttl(),
            cfg.pool_max_per_key,
            cfg.connect_timeout(),
        ));
        let listener_tls = listener_tls_config(&cfg)?;

        let ip: std::net::IpAddr = cfg
            .listen_addr
            .parse()
            .map_err(|e| ProxyError::internal(format!("listen address: {}", e)))?;
        let addr = SocketAddr::new(ip, cfg.listen_port);
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| ProxyError::internal(format!("socket: {}", e)))?;
        socket
            .set_reuseaddr(true)
            .map_err(|e| ProxyError::internal(format!("socket: {}", e)))?;
        socket
            .bind(addr)
            .map_err(|e| ProxyError::internal(format!("bind {}: {}", addr, e)))?;
        let listener = socket
            .listen(cfg.listen_backlog)
            .map_err(|e| ProxyError::internal(format!("listen {}: {}", addr, e)))?;

        #[cfg(unix)]
        let unix_listener = match &cfg.unix_socket_path {
            Some(path) => {
                let _ = std::fs::remove_file(path);
                Some(tokio::net::UnixListener::bind(path).map_err(|e| {
                    ProxyError::internal(format!("unix bind {}: {}", path.display(), e))
                })?)
            }
            None => None,
        };

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            deps: WorkerDeps {
                cfg: Arc::new(cfg),
                registry: Arc::new(registry),
                web,
                pool,
                certs,
                events,
                listener_tls,
            },
            listener,
            #[cfg(unix)]
            unix_listener,
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Accept until shutdown. Workers own disjoint handler sets; the only
    /// state shared between them is the pool and the certificate store.
    pub async fn run(self) -> Result<(), ProxyError> {
        let worker_count = if self.deps.cfg.threaded {
            self.deps.cfg.workers.max(1)
        } else {
            1
        };
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::channel::<(PeerStream, String)>(HANDOFF_QUEUE);
            let deps = self.deps.clone();
            let shutdown = self.shutdown.subscribe();
            workers.push(tokio::spawn(worker_loop(rx, deps, shutdown)));
            senders.push(tx);
        }

        let mut next = 0usize;
        loop {
            let accepted: Option<(PeerStream, String)> = tokio::select! {
                _ = shutdown_rx.changed() => None,
                r = self.listener.accept() => match r {
                    Ok((sock, addr)) => Some((PeerStream::Tcp(sock), addr.to_string())),
                    Err(e) => {
                        eprintln!("[server] accept error: {}", e);
                        continue;
                    }
                },
                r = accept_unix(&self), if has_unix(&self) => match r {
                    Some(stream) => Some(stream),
                    None => continue,
                },
            };
            let Some((stream, peer)) = accepted else {
                break;
            };
            // Round-robin; a full queue blocks here, which stops accepting.
            if senders[next % senders.len()]
                .send((stream, peer))
                .await
                .is_err()
            {
                break;
            }
            next = next.wrapping_add(1);
        }

        drop(senders);
        for worker in workers {
            let _ = worker.await;
        }
        self.deps.pool.close_all().await;
        Ok(())
    }
}

#[cfg(unix)]
fn has_unix(server: &ProxyServer) -> bool {
    server.unix_listener.is_some()
}

#[cfg(not(unix))]
fn has_unix(_server: &ProxyServer) -> bool {
    false
}

#[cfg(unix)]
async fn accept_unix(server: &ProxyServer) -> Option<(PeerStream, String)> {
    let listener = server.unix_listener.as_ref()?;
    match listener.accept().await {
        Ok((stream, _)) => Some((PeerStream::Unix(stream), "unix".to_string())),
        Err(e) => {
            eprintln!("[server] unix accept error: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
async fn accept_unix(_server: &ProxyServer) -> Option<(PeerStream, String)> {
    None
}

/// One worker: drive handlers for the sockets handed to it until the queue
/// closes or shutdown flips, then drain within the grace period.
async fn worker_loop(
    mut rx: mpsc::Receiver<(PeerStream, String)>,
    deps: WorkerDeps,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some((stream, peer)) => {
                    let deps = deps.clone();
                    handlers.spawn(handle_connection(deps, stream, peer));
                }
                None => break,
            },
            _ = shutdown.changed() => break,
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }
    let drained = timeout(SHUTDOWN_GRACE, async {
        while handlers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        handlers.abort_all();
    }
}

async fn handle_connection(deps: WorkerDeps, stream: PeerStream, peer: String) {
    // Fixed-certificate TLS on the listener happens here, off the acceptor.
    let stream = match (stream, &deps.listener_tls) {
        (PeerStream::Tcp(tcp), Some(acceptor)) => {
            match acceptor.accept(PrefixedStream::empty(tcp)).await {
                Ok(tls) => PeerStream::ServerTls(Box::new(tls)),
                Err(e) => {
                    eprintln!("[server] listener TLS handshake with {}: {}", peer, e);
                    return;
                }
            }
        }
        (stream, _) => stream,
    };
    let handler = ProtocolHandler::new(
        TcpConn::client(stream),
        peer,
        deps.cfg.clone(),
        deps.registry.clone(),
        deps.web.clone(),
        deps.pool.clone(),
        deps.certs.clone(),
        deps.events.clone(),
    );
    handler.run().await;
}

/// Fixed certificate for TLS on the listener itself, when configured.
fn listener_tls_config(cfg: &ProxyConfig) -> Result<Option<TlsAcceptor>, ProxyError> {
    let (Some(cert_path), Some(key_path)) = (&cfg.tls_listener_cert, &cfg.tls_listener_key) else {
        return Ok(None);
    };
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| ProxyError::internal(format!("listener cert: {}", e)))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| ProxyError::internal(format!("listener key: {}", e)))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| ProxyError::internal(format!("listener cert parse: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ProxyError::internal(format!("listener key parse: {}", e)))?
        .ok_or_else(|| ProxyError::internal("listener key file contains no key"))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::internal(format!("listener TLS config: {}", e)))?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
