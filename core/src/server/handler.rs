/*
 * handler.rs
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

//! Protocol handler: owns one client connection for its whole life. Reads
//! requests, selects the protocol plugin (forward proxy for CONNECT and
//! absolute-form targets, web server otherwise), runs the plugin chain, and
//! absorbs every error the connection produces. Teardown closes the socket
//! exactly once and delivers `on_client_connection_close` exactly once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;

use crate::config::ProxyConfig;
use crate::conn::{RecvState, TcpConn, UpstreamPool};
use crate::error::ProxyError;
use crate::event::{EventSink, ProxyEvent};
use crate::http::{HttpParser, ParserState, TargetForm};
use crate::plugin::proxy::{self, ProxyContext};
use crate::plugin::web::WebServer;
use crate::plugin::{PluginAction, PluginChain, PluginRegistry};
use crate::tls::CertStore;

/// Bound on the final flush of queued bytes during teardown.
const CLOSE_FLUSH_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of one handler. Monotonic per exchange except the loop back to
/// ReadingRequest on keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ReadingRequest,
    Dispatched,
    Tunneling,
    WritingResponse,
    Closing,
    Done,
}

pub struct ProtocolHandler {
    cfg: Arc<ProxyConfig>,
    registry: Arc<PluginRegistry>,
    web: Arc<WebServer>,
    pool: Arc<UpstreamPool>,
    certs: Option<Arc<CertStore>>,
    events: Arc<dyn EventSink>,
    client: TcpConn,
    peer: String,
    phase: Phase,
    chain: PluginChain,
    proxy_chain_added: bool,
}

impl ProtocolHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: TcpConn,
        peer: String,
        cfg: Arc<ProxyConfig>,
        registry: Arc<PluginRegistry>,
        web: Arc<WebServer>,
        pool: Arc<UpstreamPool>,
        certs: Option<Arc<CertStore>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let chain = PluginChain::from_factories(&registry.connection);
        Self {
            cfg,
            registry,
            web,
            pool,
            certs,
            events,
            client,
            peer,
            phase: Phase::ReadingRequest,
            chain,
            proxy_chain_added: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Serve the connection to completion and tear it down. Never returns an
    /// error: everything is absorbed here.
    pub async fn run(mut self) {
        self.events.emit(ProxyEvent::ConnectionAccepted {
            peer: self.peer.clone(),
            at: Utc::now(),
        });
        let reason = match self.serve().await {
            Ok(reason) => reason,
            Err(e) => {
                eprintln!("[handler] {}: {}", self.peer, e);
                match e {
                    ProxyError::ClientProtocol(_) => "client protocol error",
                    ProxyError::UpstreamConnect(_) => "upstream connect failed",
                    ProxyError::UpstreamProtocol(_) => "upstream protocol error",
                    ProxyError::Timeout(_) => "timeout",
                    ProxyError::TlsIntercept(_) => "tls interception failed",
                    ProxyError::Internal(_) => "internal error",
                }
            }
        };
        self.phase = Phase::Closing;
        if self.client.has_pending() {
            let _ = timeout(CLOSE_FLUSH_GRACE, self.client.flush()).await;
        }
        self.chain.close();
        self.client.close().await;
        self.phase = Phase::Done;
        self.events.emit(ProxyEvent::ConnectionTorndown {
            peer: self.peer.clone(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }

    async fn serve(&mut self) -> Result<&'static str, ProxyError> {
        loop {
            self.phase = Phase::ReadingRequest;
            let written_before = self.client.total_written();
            let cfg = self.cfg.clone();
            let pool = self.pool.clone();
            let certs = self.certs.clone();
            let events = self.events.clone();
            let peer = self.peer.clone();
            let ctx = ProxyContext {
                cfg: &cfg,
                pool: &pool,
                certs: certs.as_deref(),
                events: &*events,
                peer: &peer,
            };

            let mut parser = match proxy::read_request_headers(&ctx, &mut self.client).await {
                Ok(Some(p)) => p,
                Ok(None) => return Ok("client closed"),
                Err(e) => {
                    self.reply_error(&e, written_before).await;
                    return Err(e);
                }
            };

            let is_proxy = {
                let msg = parser.message();
                msg.method_is("CONNECT")
                    || msg
                        .target
                        .as_ref()
                        .map(|t| t.form == TargetForm::Absolute)
                        .unwrap_or(false)
            };
            if is_proxy && !self.proxy_chain_added {
                self.chain.extend_from(&self.registry.proxy);
                self.proxy_chain_added = true;
            }

            match self.chain.request_headers(parser.message_mut()) {
                PluginAction::Continue => {}
                PluginAction::ResponseReady(resp) => {
                    // Keep-alive only when the request carried no unread
                    // body; otherwise the leftovers would be misparsed as
                    // the next request.
                    let _ = parser.feed(&mut self.client.read_buf);
                    let keep = resp.keep_alive() && parser.state() == ParserState::Complete;
                    self.client.queue(resp.emit());
                    self.client.flush().await?;
                    if keep {
                        continue;
                    }
                    return Ok("plugin response");
                }
                PluginAction::Close => return Ok("plugin close"),
            }
            if let Some(name) = self.chain.take_fault() {
                let e = ProxyError::Internal(format!("plugin {} faulted", name));
                self.reply_error(&e, written_before).await;
                return Err(e);
            }

            if is_proxy {
                self.phase = if parser.message().method_is("CONNECT") {
                    Phase::Tunneling
                } else {
                    Phase::Dispatched
                };
                match proxy::serve(&ctx, &mut self.chain, &mut self.client, parser).await {
                    Ok(true) => continue,
                    Ok(false) => return Ok("exchange complete"),
                    Err(e) => {
                        self.reply_error(&e, written_before).await;
                        return Err(e);
                    }
                }
            } else {
                self.phase = Phase::Dispatched;
                if let Err(e) = self.read_request_body(&mut parser).await {
                    self.reply_error(&e, written_before).await;
                    return Err(e);
                }
                self.phase = Phase::WritingResponse;
                {
                    let msg = parser.message();
                    self.events.emit(ProxyEvent::RequestComplete {
                        peer: self.peer.clone(),
                        method: msg.method.clone().unwrap_or_default(),
                        target: msg
                            .target
                            .as_ref()
                            .map(|t| t.raw.clone())
                            .unwrap_or_default(),
                        at: Utc::now(),
                    });
                }
                let resp = self.web.handle(parser.message());
                let code = resp.code.unwrap_or(0);
                self.client.queue(resp.emit());
                self.client.flush().await?;
                self.events.emit(ProxyEvent::ResponseComplete {
                    peer: self.peer.clone(),
                    code,
                    at: Utc::now(),
                });
                // Built-in web responses all close the connection.
                return Ok("web response");
            }
        }
    }

    /// Read the remainder of a request destined for the web server; routes
    /// get the complete message.
    async fn read_request_body(&mut self, parser: &mut HttpParser) -> Result<(), ProxyError> {
        let idle = self.cfg.idle_timeout();
        loop {
            let before = (parser.state(), self.client.read_buf.len());
            let state = parser
                .feed(&mut self.client.read_buf)
                .map_err(|e| ProxyError::ClientProtocol(e.to_string()))?;
            if state == ParserState::Complete {
                return Ok(());
            }
            if (state, self.client.read_buf.len()) == before {
                match timeout(idle, self.client.recv()).await {
                    Err(_) => return Err(ProxyError::Timeout("client request body")),
                    Ok(Err(e)) => return Err(ProxyError::ClientProtocol(e.to_string())),
                    Ok(Ok(RecvState::Eof)) | Ok(Ok(RecvState::Closed)) => {
                        return Err(ProxyError::ClientProtocol(
                            "client closed mid-request".into(),
                        ))
                    }
                    Ok(Ok(RecvState::Data(_))) => {}
                }
            }
        }
    }

    /// Best-effort error reply, only when no response bytes have gone out
    /// for the current exchange.
    async fn reply_error(&mut self, error: &ProxyError, written_before: u64) {
        if self.client.is_closed() || self.client.total_written() != written_before {
            return;
        }
        let resp = match error {
            ProxyError::ClientProtocol(_) => crate::http::HttpMessage::response(400, "Bad Request"),
            ProxyError::UpstreamConnect(_) => {
                crate::http::HttpMessage::response(502, "Bad Gateway")
            }
            ProxyError::Timeout(_) => crate::http::HttpMessage::response(504, "Gateway Timeout"),
            ProxyError::Internal(_) => {
                crate::http::HttpMessage::response(500, "Internal Server Error")
            }
            // Partial responses and interception failures close silently.
            ProxyError::UpstreamProtocol(_) | ProxyError::TlsIntercept(_) => return,
        };
        let resp = resp.with_header("Connection", "close").with_body(b"");
        self.client.queue(resp.emit());
        let _ = self.client.flush().await;
    }
}
