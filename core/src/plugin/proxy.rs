/*
 * proxy.rs
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

//! Forward-proxy plugin: plain proxying with upstream pooling, CONNECT
//! passthrough tunnels, and TLS interception. Chunked bodies are decoded on
//! the way in and re-framed on the way out, so body-transforming plugins see
//! clean chunks on both legs.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tokio::time::{sleep, timeout};

use crate::config::ProxyConfig;
use crate::conn::{PoolKey, RecvState, TcpConn, UpstreamPool};
use crate::error::ProxyError;
use crate::event::{EventSink, ProxyEvent};
use crate::http::{Headers, HttpMessage, HttpParser, ParserState, TargetForm};
use crate::plugin::{HttpPlugin, PluginAction, PluginChain, PluginFactory};
use crate::tls::CertStore;

/// Stamped on proxied requests and responses.
const VIA_VALUE: &str = "1.1 varco";

/// Dropped on the forwarded leg in addition to whatever `Connection` lists.
/// Host is deliberately absent: it is preserved (or rewritten) instead.
const HOP_BY_HOP: [&str; 7] = [
    "Proxy-Connection",
    "Proxy-Authenticate",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
    "Keep-Alive",
];

/// Everything the proxy plugin needs besides the two connections.
pub struct ProxyContext<'a> {
    pub cfg: &'a ProxyConfig,
    pub pool: &'a UpstreamPool,
    pub certs: Option<&'a CertStore>,
    pub events: &'a dyn EventSink,
    pub peer: &'a str,
}

/// Serve one proxied request whose headers are already parsed. Returns true
/// when the client connection should be kept for another request.
pub async fn serve(
    ctx: &ProxyContext<'_>,
    chain: &mut PluginChain,
    client: &mut TcpConn,
    parser: HttpParser,
) -> Result<bool, ProxyError> {
    if parser.message().method_is("CONNECT") {
        if ctx.certs.is_some() {
            serve_intercepted(ctx, chain, client, parser).await
        } else {
            serve_connect_passthrough(ctx, chain, client, parser).await
        }
    } else {
        serve_forward(ctx, chain, client, parser).await
    }
}

/// Plain forward proxying of one absolute-form request.
async fn serve_forward(
    ctx: &ProxyContext<'_>,
    chain: &mut PluginChain,
    client: &mut TcpConn,
    mut parser: HttpParser,
) -> Result<bool, ProxyError> {
    let (host, port, tls) = {
        let target = parser
            .message()
            .target
            .as_ref()
            .ok_or_else(|| ProxyError::ClientProtocol("no request target".into()))?;
        let host = target
            .host
            .clone()
            .ok_or_else(|| ProxyError::ClientProtocol("proxy request without host".into()))?;
        let tls = target
            .scheme
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("https"))
            .unwrap_or(false);
        (host, target.port, tls)
    };
    let key = PoolKey {
        host: host.clone(),
        port,
        tls,
    };
    let mut upstream = match ctx.pool.acquire(&host, port, tls).await {
        Ok(u) => u,
        Err(e) => {
            ctx.events.emit(ProxyEvent::UpstreamConnectFailed {
                host: host.clone(),
                port,
                error: e.to_string(),
                at: Utc::now(),
            });
            return Err(e);
        }
    };

    let result = run_exchange(ctx, chain, client, &mut upstream, &mut parser).await;
    match result {
        Ok(outcome) => {
            ctx.pool
                .release(&key, upstream, outcome.upstream_reusable)
                .await;
            Ok(outcome.client_keep_alive)
        }
        Err(e) => {
            ctx.pool.release(&key, upstream, false).await;
            Err(e)
        }
    }
}

struct ExchangeOutcome {
    client_keep_alive: bool,
    upstream_reusable: bool,
}

/// Forward one request to the upstream and relay its response back. The
/// request parser is at `HeadersComplete` or later.
async fn run_exchange(
    ctx: &ProxyContext<'_>,
    chain: &mut PluginChain,
    client: &mut TcpConn,
    upstream: &mut TcpConn,
    parser: &mut HttpParser,
) -> Result<ExchangeOutcome, ProxyError> {
    let idle = ctx.cfg.idle_timeout();
    let req_chunked = parser.is_chunked();
    let head = parser.message().method_is("HEAD");
    // Decided before the rewrite drops the client's Connection header.
    let req_keep = parser.message().keep_alive();
    let (method, target_raw) = {
        let msg = parser.message_mut();
        rewrite_for_upstream(msg, req_chunked);
        (
            msg.method.clone().unwrap_or_default(),
            msg.target.as_ref().map(|t| t.raw.clone()).unwrap_or_default(),
        )
    };
    upstream.queue(parser.message().emit_headers());
    upstream
        .flush()
        .await
        .map_err(|e| ProxyError::UpstreamConnect(format!("request write: {}", e)))?;

    // Request body: decode, run through the chain, re-frame.
    loop {
        let before = (parser.state(), client.read_buf.len());
        let state = parser
            .feed(&mut client.read_buf)
            .map_err(|e| ProxyError::ClientProtocol(e.to_string()))?;
        let chunk = parser.drain_body();
        if !chunk.is_empty() {
            if let Some(out) = chain.request_chunk(chunk) {
                if req_chunked {
                    upstream.queue(chunk_frame(&out));
                } else {
                    upstream.queue(out);
                }
                upstream
                    .flush()
                    .await
                    .map_err(|e| ProxyError::UpstreamConnect(format!("body write: {}", e)))?;
            }
        }
        if state == ParserState::Complete {
            if req_chunked {
                upstream.queue(Bytes::from_static(b"0\r\n\r\n"));
                upstream
                    .flush()
                    .await
                    .map_err(|e| ProxyError::UpstreamConnect(format!("body write: {}", e)))?;
            }
            break;
        }
        if (state, client.read_buf.len()) == before {
            match timeout(idle, client.recv()).await {
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
    ctx.events.emit(ProxyEvent::RequestComplete {
        peer: ctx.peer.to_string(),
        method,
        target: target_raw,
        at: Utc::now(),
    });

    // Response leg.
    let mut rparser = HttpParser::response(ctx.cfg.max_header_bytes);
    rparser.set_head_response(head);
    let mut headers_sent = false;
    let mut resp_chunked = false;
    let mut resp_keep = false;
    let mut code = 0u16;
    'response: loop {
        loop {
            let before = (rparser.state(), upstream.read_buf.len());
            let state = rparser
                .feed(&mut upstream.read_buf)
                .map_err(|e| ProxyError::UpstreamProtocol(e.to_string()))?;
            if state >= ParserState::HeadersComplete && !headers_sent {
                resp_chunked = rparser.is_chunked();
                let until_eof = rparser.body_until_eof();
                code = rparser.message().code.unwrap_or(0);
                let resp = rparser.message_mut();
                chain.response_headers(resp);
                resp.headers.append_value("Via", VIA_VALUE);
                if resp_chunked {
                    resp.headers.set("Transfer-Encoding", "chunked");
                }
                client.queue(resp.emit_headers());
                client.flush().await?;
                headers_sent = true;
                resp_keep = rparser.message().keep_alive() && !until_eof;
            }
            if headers_sent {
                let chunk = rparser.drain_body();
                if !chunk.is_empty() {
                    if let Some(out) = chain.response_chunk(chunk) {
                        if resp_chunked {
                            client.queue(chunk_frame(&out));
                        } else {
                            client.queue(out);
                        }
                        client.flush().await?;
                    }
                }
            }
            if state == ParserState::Complete {
                if resp_chunked {
                    client.queue(Bytes::from_static(b"0\r\n\r\n"));
                    client.flush().await?;
                }
                break 'response;
            }
            if (state, upstream.read_buf.len()) == before {
                break;
            }
        }
        match timeout(idle, upstream.recv()).await {
            Err(_) => return Err(ProxyError::Timeout("upstream response")),
            Ok(Err(e)) => return Err(ProxyError::UpstreamProtocol(e.to_string())),
            Ok(Ok(RecvState::Eof)) | Ok(Ok(RecvState::Closed)) => {
                rparser.mark_eof();
                if rparser.state() != ParserState::Complete {
                    return Err(ProxyError::UpstreamProtocol(
                        "upstream closed mid-response".into(),
                    ));
                }
            }
            Ok(Ok(RecvState::Data(_))) => {}
        }
    }
    ctx.events.emit(ProxyEvent::ResponseComplete {
        peer: ctx.peer.to_string(),
        code,
        at: Utc::now(),
    });

    let client_keep_alive = req_keep && resp_keep;
    Ok(ExchangeOutcome {
        client_keep_alive,
        upstream_reusable: resp_keep,
    })
}

/// CONNECT without interception: confirm, then shovel bytes verbatim.
async fn serve_connect_passthrough(
    ctx: &ProxyContext<'_>,
    chain: &mut PluginChain,
    client: &mut TcpConn,
    parser: HttpParser,
) -> Result<bool, ProxyError> {
    let (host, port) = authority_of(&parser)?;
    let mut upstream = match ctx.pool.connect(&host, port, false).await {
        Ok(u) => u,
        Err(e) => {
            ctx.events.emit(ProxyEvent::UpstreamConnectFailed {
                host: host.clone(),
                port,
                error: e.to_string(),
                at: Utc::now(),
            });
            return Err(e);
        }
    };
    client.queue(Bytes::from_static(
        b"HTTP/1.1 200 Connection Established\r\n\r\n",
    ));
    client.flush().await?;

    let result = tunnel(ctx, chain, client, &mut upstream).await;
    upstream.close().await;
    result?;
    Ok(false)
}

/// Verbatim bidirectional copy with raw-byte plugin hooks. Returns on either
/// side's close or on idle timeout; the peer's close propagates because the
/// caller tears both connections down.
async fn tunnel(
    ctx: &ProxyContext<'_>,
    chain: &mut PluginChain,
    client: &mut TcpConn,
    upstream: &mut TcpConn,
) -> Result<(), ProxyError> {
    let idle = ctx.cfg.idle_timeout();

    // The client may have sent tunnel bytes together with the CONNECT.
    let leftover = client.read_buf.take_all();
    if !leftover.is_empty() {
        chain.client_data(&leftover);
        upstream.queue(leftover);
        upstream.flush().await?;
    }

    enum Wake {
        Client,
        Upstream,
        Done,
    }
    loop {
        let wake = tokio::select! {
            r = client.recv() => match r {
                Ok(RecvState::Data(_)) => Wake::Client,
                _ => Wake::Done,
            },
            r = upstream.recv() => match r {
                Ok(RecvState::Data(_)) => Wake::Upstream,
                _ => Wake::Done,
            },
            _ = sleep(idle) => Wake::Done,
        };
        match wake {
            Wake::Client => {
                let data = client.read_buf.take_all();
                chain.client_data(&data);
                upstream.queue(data);
                upstream.flush().await?;
            }
            Wake::Upstream => {
                let data = upstream.read_buf.take_all();
                chain.upstream_data(&data);
                client.queue(data);
                client.flush().await?;
            }
            Wake::Done => return Ok(()),
        }
    }
}

/// CONNECT with interception: TLS to the origin, synthesise a leaf, TLS to
/// the client, then ordinary proxying inside the tunnel.
async fn serve_intercepted(
    ctx: &ProxyContext<'_>,
    chain: &mut PluginChain,
    client: &mut TcpConn,
    parser: HttpParser,
) -> Result<bool, ProxyError> {
    let (host, port) = authority_of(&parser)?;
    let certs = ctx
        .certs
        .ok_or_else(|| ProxyError::internal("interception without CA"))?;
    let key = PoolKey {
        host: host.clone(),
        port,
        tls: true,
    };
    let mut upstream = match ctx.pool.acquire(&host, port, true).await {
        Ok(u) => u,
        Err(e) => {
            ctx.events.emit(ProxyEvent::UpstreamConnectFailed {
                host: host.clone(),
                port,
                error: e.to_string(),
                at: Utc::now(),
            });
            return Err(e);
        }
    };

    let peer_leaf = upstream
        .peer_certificates()
        .and_then(|certs| certs.into_iter().next());
    let server_config = match certs
        .server_config_for(&host, peer_leaf.as_ref().map(|c| c.as_ref()))
        .await
    {
        Ok(c) => c,
        Err(e) => {
            ctx.pool.release(&key, upstream, false).await;
            return Err(e);
        }
    };

    client.queue(Bytes::from_static(
        b"HTTP/1.1 200 Connection Established\r\n\r\n",
    ));
    client.flush().await?;
    if let Err(e) = client.upgrade_server_tls(server_config).await {
        ctx.events.emit(ProxyEvent::TlsHandshakeFailed {
            peer: ctx.peer.to_string(),
            host: host.clone(),
            error: e.to_string(),
            at: Utc::now(),
        });
        ctx.pool.release(&key, upstream, false).await;
        return Err(ProxyError::TlsIntercept(format!(
            "client handshake for {}: {}",
            host, e
        )));
    }
    eprintln!("[proxy] intercepting TLS for {} ({})", host, ctx.peer);

    // Request/response pairs inside the tunnel, visible to plugins exactly
    // as for plain proxying.
    let mut reusable = false;
    let result = loop {
        let mut inner = match read_request_headers(ctx, client).await {
            Ok(Some(p)) => p,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        match chain.request_headers(inner.message_mut()) {
            PluginAction::Continue => {}
            PluginAction::ResponseReady(resp) => {
                let _ = inner.feed(&mut client.read_buf);
                let keep = resp.keep_alive() && inner.state() == ParserState::Complete;
                client.queue(resp.emit());
                client.flush().await?;
                if keep {
                    continue;
                }
                break Ok(());
            }
            PluginAction::Close => break Ok(()),
        }
        match run_exchange(ctx, chain, client, &mut upstream, &mut inner).await {
            Ok(outcome) => {
                reusable = outcome.upstream_reusable;
                if !outcome.client_keep_alive || !outcome.upstream_reusable {
                    break Ok(());
                }
            }
            Err(e) => {
                reusable = false;
                break Err(e);
            }
        }
    };
    ctx.pool.release(&key, upstream, reusable).await;
    result?;
    Ok(false)
}

/// Read one request's headers off the client, with the idle timeout.
/// `None` means the client closed cleanly between requests.
pub(crate) async fn read_request_headers(
    ctx: &ProxyContext<'_>,
    client: &mut TcpConn,
) -> Result<Option<HttpParser>, ProxyError> {
    let mut parser = HttpParser::request(ctx.cfg.max_header_bytes);
    let idle = ctx.cfg.idle_timeout();
    loop {
        let state = parser
            .feed(&mut client.read_buf)
            .map_err(|e| ProxyError::ClientProtocol(e.to_string()))?;
        if state >= ParserState::HeadersComplete {
            return Ok(Some(parser));
        }
        match timeout(idle, client.recv()).await {
            Err(_) => return Err(ProxyError::Timeout("client request")),
            Ok(Err(e)) => return Err(ProxyError::ClientProtocol(e.to_string())),
            Ok(Ok(RecvState::Eof)) | Ok(Ok(RecvState::Closed)) => {
                if parser.state() == ParserState::Initialized {
                    return Ok(None);
                }
                return Err(ProxyError::ClientProtocol(
                    "client closed mid-request".into(),
                ));
            }
            Ok(Ok(RecvState::Data(_))) => {}
        }
    }
}

fn authority_of(parser: &HttpParser) -> Result<(String, u16), ProxyError> {
    let target = parser
        .message()
        .target
        .as_ref()
        .filter(|t| t.form == TargetForm::Authority)
        .ok_or_else(|| ProxyError::ClientProtocol("CONNECT without authority".into()))?;
    let host = target
        .host
        .clone()
        .ok_or_else(|| ProxyError::ClientProtocol("CONNECT without host".into()))?;
    Ok((host, target.port))
}

/// Rewrite a request for the origin: origin-form target, hop-by-hop headers
/// dropped, Host preserved or filled, Via stamped.
fn rewrite_for_upstream(msg: &mut HttpMessage, req_chunked: bool) {
    if let Some(target) = msg.target.as_mut() {
        if target.form == TargetForm::Absolute {
            target.raw = target.origin_form();
        }
        if !msg.headers.contains("Host") {
            if let Some(host) = &target.host {
                let value = match (target.scheme.as_deref(), target.port) {
                    (Some("http"), 80) | (Some("https"), 443) => host.clone(),
                    (_, 0) => host.clone(),
                    (_, p) => format!("{}:{}", host, p),
                };
                msg.headers.add("Host", value);
            }
        }
    }
    strip_hop_by_hop(&mut msg.headers);
    if req_chunked {
        // The body is re-framed as plain chunked regardless of what the
        // original Transfer-Encoding chain said.
        msg.headers.set("Transfer-Encoding", "chunked");
    }
    msg.headers.append_value("Via", VIA_VALUE);
}

/// Drop hop-by-hop headers: whatever `Connection` lists, plus the fixed set.
fn strip_hop_by_hop(headers: &mut Headers) {
    let listed: Vec<String> = headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    for name in listed {
        if name.eq_ignore_ascii_case("close") || name.eq_ignore_ascii_case("keep-alive") {
            continue;
        }
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("Connection");
}

fn chunk_frame(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out.freeze()
}

/// Basic proxy authentication sub-plugin. Validates `Proxy-Authorization`
/// against the configured credentials before any forwarding happens.
pub struct ProxyAuthPlugin {
    expected: String,
}

impl HttpPlugin for ProxyAuthPlugin {
    fn on_request_headers(&mut self, request: &mut HttpMessage) -> PluginAction {
        let presented = request
            .headers
            .get("Proxy-Authorization")
            .and_then(|v| v.trim().strip_prefix("Basic "))
            .map(|b64| b64.trim() == self.expected)
            .unwrap_or(false);
        if presented {
            request.headers.remove("Proxy-Authorization");
            return PluginAction::Continue;
        }
        PluginAction::ResponseReady(
            HttpMessage::response(407, "Proxy Authentication Required")
                .with_header("Proxy-Authenticate", "Basic realm=\"varco\"")
                .with_header("Connection", "close")
                .with_body(b""),
        )
    }
}

pub struct ProxyAuthFactory {
    expected: String,
}

impl ProxyAuthFactory {
    /// `credentials` is `user:password` as configured.
    pub fn new(credentials: &str) -> Self {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        Self {
            expected: STANDARD.encode(credentials),
        }
    }
}

impl PluginFactory for ProxyAuthFactory {
    fn name(&self) -> &str {
        "proxy-auth"
    }

    fn create(&self) -> Box<dyn HttpPlugin> {
        Box::new(ProxyAuthPlugin {
            expected: self.expected.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RecvBuffer;

    fn parse_request(raw: &[u8]) -> HttpParser {
        let mut parser = HttpParser::request(65536);
        let mut buf = RecvBuffer::new();
        buf.append(raw);
        let _ = parser.feed(&mut buf).unwrap();
        let _ = parser.feed(&mut buf).unwrap();
        parser
    }

    #[test]
    fn rewrite_absolute_to_origin_and_strip() {
        let mut parser = parse_request(
            b"GET http://origin:8080/x?q=1 HTTP/1.1\r\nProxy-Connection: keep-alive\r\nConnection: X-Flow, close\r\nX-Flow: abc\r\nAccept: */*\r\n\r\n",
        );
        let msg = parser.message_mut();
        rewrite_for_upstream(msg, false);
        assert_eq!(msg.target.as_ref().unwrap().raw, "/x?q=1");
        assert!(!msg.headers.contains("Proxy-Connection"));
        assert!(!msg.headers.contains("Connection"));
        assert!(!msg.headers.contains("X-Flow"));
        assert!(msg.headers.contains("Accept"));
        assert_eq!(msg.headers.get("Host"), Some("origin:8080"));
    }

    #[test]
    fn rewrite_preserves_existing_host() {
        let mut parser =
            parse_request(b"GET http://origin/x HTTP/1.1\r\nHost: origin\r\n\r\n");
        let msg = parser.message_mut();
        rewrite_for_upstream(msg, false);
        let hosts: Vec<&str> = msg.headers.get_all("host").collect();
        assert_eq!(hosts, vec!["origin"]);
    }

    #[test]
    fn chunked_request_reframed() {
        let mut parser = parse_request(
            b"POST /u HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
        );
        let chunked = parser.is_chunked();
        assert!(chunked);
        let msg = parser.message_mut();
        rewrite_for_upstream(msg, chunked);
        assert_eq!(msg.headers.get("transfer-encoding"), Some("chunked"));
    }

    #[test]
    fn chunk_frame_format() {
        assert_eq!(&chunk_frame(b"hello")[..], b"5\r\nhello\r\n");
        assert_eq!(&chunk_frame(&[0u8; 16])[..4], b"10\r\n");
    }

    #[test]
    fn auth_plugin_accepts_and_strips() {
        let factory = ProxyAuthFactory::new("user:secret");
        let mut plugin = factory.create();
        let mut parser = parse_request(
            b"GET http://o/ HTTP/1.1\r\nProxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n\r\n",
        );
        match plugin.on_request_headers(parser.message_mut()) {
            PluginAction::Continue => {}
            _ => panic!("valid credentials should continue"),
        }
        assert!(!parser.message().headers.contains("Proxy-Authorization"));
    }

    #[test]
    fn auth_plugin_rejects_with_407() {
        let factory = ProxyAuthFactory::new("user:secret");
        let mut plugin = factory.create();
        let mut parser = parse_request(b"GET http://o/ HTTP/1.1\r\n\r\n");
        match plugin.on_request_headers(parser.message_mut()) {
            PluginAction::ResponseReady(resp) => {
                assert_eq!(resp.code, Some(407));
                assert!(resp.headers.contains("Proxy-Authenticate"));
            }
            _ => panic!("missing credentials should 407"),
        }
    }

    #[test]
    fn authority_extraction() {
        let parser = parse_request(b"CONNECT example.com:8443 HTTP/1.1\r\n\r\n");
        let (host, port) = authority_of(&parser).unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8443);
    }
}
