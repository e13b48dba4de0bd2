//! Per-connection protocol selection and serving
//!
//! A connection is served entirely by one execution surface, picked when it
//! was accepted: [`serve_connection`] runs on a worker thread and blocks,
//! [`serve_connection_async`] runs as a task on the event loop.
//!
//! Either way the first decision is ALPN. A TLS connection that negotiated
//! `h2` goes straight to the HTTP/2 engine. Everything else starts as
//! HTTP/1.1: the first request may switch the connection to h2c or to
//! WebSocket, otherwise requests are served in a keep-alive loop until the
//! client asks to close, the idle timeout passes or a read fails.

use super::context::ServerContext;
use crate::handler::bare_context;
use crate::http::h2::{engine, H2Connection, H2Engine};
use crate::http::{
    read_full_request, read_full_request_async, write_response, write_response_async, Error, Method, Request,
    Response, Status, Version,
};
use crate::ws::handshake::is_upgrade_request;
use crate::ws::{validate_upgrade, SessionConfig, Upgrade, WebSocketSession};
use crate::xsocket::{self, event_loop, AsyncXSocket, SessionOps, XSocket};
use bytes::Bytes;
use std::net::TcpStream;
use std::sync::Arc;

/// What the first HTTP/1.1 request asks the connection to become
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    /// `Upgrade: h2c`
    H2c,
    /// `Upgrade: websocket`
    WebSocket,
}

/// Classify a request by its `Upgrade` header
pub fn detect_protocol(request: &Request) -> Protocol {
    if request.version() == Version::Http10 {
        return Protocol::Http1;
    }
    if is_upgrade_request(request) {
        Protocol::WebSocket
    } else if request.headers().has_token("Upgrade", "h2c") {
        Protocol::H2c
    } else {
        Protocol::Http1
    }
}

/// Whether ALPN settled on HTTP/2
pub fn negotiated_h2(alpn: Option<&[u8]>) -> bool {
    alpn == Some(b"h2".as_slice())
}

fn switching_to_h2c() -> Response {
    Response::new(Status::SWITCHING_PROTOCOLS)
        .header("Connection", "Upgrade")
        .header("Upgrade", "h2c")
}

/// Status answered when reading a request failed, `None` to just hang up
fn read_error_status(err: &Error) -> Option<Status> {
    match err {
        Error::HeadersTooLarge(_) => Some(Status::HEADERS_TOO_LARGE),
        Error::Timeout => None,
        e if e.is_malformed() => Some(Status::BAD_REQUEST),
        _ => None,
    }
}

/// Build the HTTP/2 connection for an upgrade; `None` when the settings are unusable
fn h2c_connection(ctx: &ServerContext, request: &Request) -> Option<H2Connection> {
    let mut conn = match H2Connection::new(ctx.config.http2.connection_config()) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "cannot create HTTP/2 connection");
            return None;
        }
    };
    match conn.initiate_upgrade(request.headers().get("HTTP2-Settings")) {
        Ok(()) => Some(conn),
        Err(e) => {
            tracing::debug!(peer = ?request.peer(), error = %e, "rejecting h2c upgrade");
            None
        }
    }
}

fn h2_connection(ctx: &ServerContext) -> Option<H2Connection> {
    match H2Connection::new(ctx.config.http2.connection_config()) {
        Ok(mut conn) => {
            conn.initiate_connection();
            Some(conn)
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot create HTTP/2 connection");
            None
        }
    }
}

/// Serve one accepted connection on the calling thread
pub fn serve_connection(stream: TcpStream, ctx: &ServerContext) {
    let timeout = ctx.config.timeouts.handshake();
    let socket = match &ctx.tls {
        Some(tls) => match XSocket::accept_tls(stream, tls, timeout) {
            Ok(socket) => socket,
            Err(e) => {
                xsocket::log_error("TLS handshake failed", &e, false);
                return;
            }
        },
        None => XSocket::accept_plain(stream),
    };

    if ctx.config.http2.enabled && negotiated_h2(socket.alpn_protocol()) {
        tracing::debug!(peer = ?socket.peer_addr(), "ALPN selected h2");
        if let Some(conn) = h2_connection(ctx) {
            serve_h2(socket, conn, ctx, None, Bytes::new());
        }
        return;
    }
    serve_http1(socket, ctx);
}

fn serve_http1(mut socket: XSocket, ctx: &ServerContext) {
    let peer = socket.peer_addr();
    let mut leftover = Bytes::new();
    let mut served = 0u64;

    loop {
        let opts = ctx.framing_options(served > 0);
        socket.set_timeout(Some(opts.request_timeout));
        let (mut request, rest) = match read_full_request(&mut socket, leftover, &opts) {
            Ok(Some(next)) => next,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(peer = ?peer, served, error = %e, "request read ended the connection");
                if let Some(status) = read_error_status(&e) {
                    let response = ctx.dispatcher.finalize(Response::error(status), &bare_context(Version::Http11, false));
                    let _ = write_response(&mut socket, response, Version::Http11, false);
                }
                break;
            }
        };
        served += 1;
        request.set_peer(peer);

        match detect_protocol(&request) {
            Protocol::H2c if ctx.config.http2.enabled => {
                let Some(conn) = h2c_connection(ctx, &request) else {
                    let response = ctx.dispatcher.finalize(Response::error(Status::BAD_REQUEST), &bare_context(Version::Http11, false));
                    let _ = write_response(&mut socket, response, Version::Http11, false);
                    break;
                };
                if let Err(e) = write_response(&mut socket, switching_to_h2c(), Version::Http11, false) {
                    tracing::debug!(peer = ?peer, error = %e, "h2c upgrade write failed");
                    break;
                }
                tracing::debug!(peer = ?peer, "switched to h2c");
                serve_h2(socket, conn, ctx, Some(request), rest);
                return;
            }
            Protocol::WebSocket => {
                serve_websocket(socket, ctx, request, rest);
                return;
            }
            _ => {}
        }

        let keep_alive = request.wants_keep_alive() && !ctx.is_shutting_down();
        let version = request.version();
        let head_only = request.method() == Method::Head;
        let response = ctx.dispatcher.dispatch_blocking(request, keep_alive);
        match write_response(&mut socket, response, version, head_only) {
            Ok(written) => {
                tracing::trace!(peer = ?peer, status = written.status, bytes = written.body_bytes, "response written");
                if written.close_delimited || !keep_alive {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(peer = ?peer, error = %e, "response write failed");
                break;
            }
        }
        leftover = rest;
    }

    if let Err(e) = socket.close() {
        xsocket::log_error("close failed", &e, true);
    }
}

fn serve_h2(socket: XSocket, conn: H2Connection, ctx: &ServerContext, upgrade: Option<Request>, leftover: Bytes) {
    let peer = socket.peer_addr();
    let result = engine::run_on_thread(
        socket,
        conn,
        Arc::clone(&ctx.dispatcher),
        ctx.engine_config(),
        upgrade,
        leftover,
        Some(ctx.shutdown_signal()),
    );
    match result {
        Ok(()) => tracing::debug!(peer = ?peer, "HTTP/2 connection finished"),
        Err(e) => tracing::debug!(peer = ?peer, error = %e, "HTTP/2 connection failed"),
    }
}

/// Validate a WebSocket upgrade; refusals are answered here
fn accept_upgrade(ctx: &ServerContext, request: &Request) -> Result<Upgrade, Response> {
    if ctx.ws_handler.is_none() {
        return Err(Response::error(Status::NOT_FOUND));
    }
    validate_upgrade(request, &ctx.config.websocket).map_err(|e| {
        tracing::info!(peer = ?request.peer(), error = %e, "WebSocket handshake refused");
        e.into_response()
    })
}

fn serve_websocket(mut socket: XSocket, ctx: &ServerContext, request: Request, rest: Bytes) {
    let peer = socket.peer_addr();
    let upgrade = match accept_upgrade(ctx, &request) {
        Ok(upgrade) => upgrade,
        Err(refusal) => {
            let response = ctx.dispatcher.finalize(refusal, &bare_context(request.version(), false));
            let _ = write_response(&mut socket, response, request.version(), false);
            let _ = socket.close();
            return;
        }
    };
    let Some(handler) = ctx.ws_handler.clone() else {
        return;
    };
    if let Err(e) = write_response(&mut socket, upgrade.response(), Version::Http11, false) {
        tracing::debug!(peer = ?peer, error = %e, "WebSocket handshake write failed");
        return;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "cannot start WebSocket event loop");
            return;
        }
    };
    let _mark = event_loop::enter();
    let config = SessionConfig::from_config(&ctx.config.websocket);
    let shutdown = ctx.shutdown_signal();
    let outcome = runtime.block_on(async move {
        let socket = match socket.into_async() {
            Ok(socket) => socket,
            Err(e) => return Err(crate::ws::Error::from(e)),
        };
        WebSocketSession::new(socket, config, upgrade.deflate, rest, peer)
            .with_shutdown(shutdown)
            .run(handler)
            .await
    });
    match outcome {
        Ok(code) => tracing::debug!(peer = ?peer, code = code.as_u16(), "WebSocket session closed"),
        Err(e) => tracing::debug!(peer = ?peer, error = %e, "WebSocket session failed"),
    }
}

/// Serve one accepted connection as an event loop task
pub async fn serve_connection_async(stream: tokio::net::TcpStream, ctx: Arc<ServerContext>) {
    let timeout = ctx.config.timeouts.handshake();
    let socket = match &ctx.tls {
        Some(tls) => match AsyncXSocket::accept_tls(stream, tls, timeout).await {
            Ok(socket) => socket,
            Err(e) => {
                xsocket::log_error("TLS handshake failed", &e, false);
                return;
            }
        },
        None => AsyncXSocket::from_tokio(stream),
    };

    if ctx.config.http2.enabled && negotiated_h2(socket.alpn_protocol()) {
        tracing::debug!(peer = ?socket.peer_addr(), "ALPN selected h2");
        if let Some(conn) = h2_connection(&ctx) {
            serve_h2_async(socket, conn, &ctx, None, Bytes::new()).await;
        }
        return;
    }
    serve_http1_async(socket, ctx).await;
}

async fn serve_http1_async(mut socket: AsyncXSocket, ctx: Arc<ServerContext>) {
    let peer = socket.peer_addr();
    let mut leftover = Bytes::new();
    let mut served = 0u64;

    loop {
        let opts = ctx.framing_options(served > 0);
        let (mut request, rest) = match read_full_request_async(&mut socket, leftover, &opts).await {
            Ok(Some(next)) => next,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(peer = ?peer, served, error = %e, "request read ended the connection");
                if let Some(status) = read_error_status(&e) {
                    let response = ctx.dispatcher.finalize(Response::error(status), &bare_context(Version::Http11, false));
                    let _ = write_response_async(&mut socket, response, Version::Http11, false).await;
                }
                break;
            }
        };
        served += 1;
        request.set_peer(peer);

        match detect_protocol(&request) {
            Protocol::H2c if ctx.config.http2.enabled => {
                let Some(conn) = h2c_connection(&ctx, &request) else {
                    let response = ctx.dispatcher.finalize(Response::error(Status::BAD_REQUEST), &bare_context(Version::Http11, false));
                    let _ = write_response_async(&mut socket, response, Version::Http11, false).await;
                    break;
                };
                if let Err(e) = write_response_async(&mut socket, switching_to_h2c(), Version::Http11, false).await {
                    tracing::debug!(peer = ?peer, error = %e, "h2c upgrade write failed");
                    break;
                }
                tracing::debug!(peer = ?peer, "switched to h2c");
                serve_h2_async(socket, conn, &ctx, Some(request), rest).await;
                return;
            }
            Protocol::WebSocket => {
                serve_websocket_async(socket, &ctx, request, rest).await;
                return;
            }
            _ => {}
        }

        let keep_alive = request.wants_keep_alive() && !ctx.is_shutting_down();
        let version = request.version();
        let head_only = request.method() == Method::Head;
        let response = ctx.dispatcher.dispatch(request, keep_alive).await;
        match write_response_async(&mut socket, response, version, head_only).await {
            Ok(written) => {
                tracing::trace!(peer = ?peer, status = written.status, bytes = written.body_bytes, "response written");
                if written.close_delimited || !keep_alive {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(peer = ?peer, error = %e, "response write failed");
                break;
            }
        }
        leftover = rest;
    }

    if let Err(e) = socket.close().await {
        xsocket::log_error("close failed", &e, true);
    }
}

async fn serve_h2_async(
    socket: AsyncXSocket,
    conn: H2Connection,
    ctx: &ServerContext,
    upgrade: Option<Request>,
    leftover: Bytes,
) {
    let peer = socket.peer_addr();
    let mut engine = H2Engine::new(socket, conn, Arc::clone(&ctx.dispatcher), ctx.engine_config())
        .with_initial_data(leftover)
        .with_shutdown(ctx.shutdown_signal())
        .with_peer(peer);
    if let Some(request) = upgrade {
        engine = engine.with_upgrade(request);
    }
    match engine.run().await {
        Ok(()) => tracing::debug!(peer = ?peer, "HTTP/2 connection finished"),
        Err(e) => tracing::debug!(peer = ?peer, error = %e, "HTTP/2 connection failed"),
    }
}

async fn serve_websocket_async(mut socket: AsyncXSocket, ctx: &ServerContext, request: Request, rest: Bytes) {
    let peer = socket.peer_addr();
    let upgrade = match accept_upgrade(ctx, &request) {
        Ok(upgrade) => upgrade,
        Err(refusal) => {
            let response = ctx.dispatcher.finalize(refusal, &bare_context(request.version(), false));
            let _ = write_response_async(&mut socket, response, request.version(), false).await;
            let _ = socket.close().await;
            return;
        }
    };
    let Some(handler) = ctx.ws_handler.clone() else {
        return;
    };
    if let Err(e) = write_response_async(&mut socket, upgrade.response(), Version::Http11, false).await {
        tracing::debug!(peer = ?peer, error = %e, "WebSocket handshake write failed");
        return;
    }

    let config = SessionConfig::from_config(&ctx.config.websocket);
    let session = WebSocketSession::new(socket, config, upgrade.deflate, rest, peer).with_shutdown(ctx.shutdown_signal());
    match session.run(handler).await {
        Ok(code) => tracing::debug!(peer = ?peer, code = code.as_u16(), "WebSocket session closed"),
        Err(e) => tracing::debug!(peer = ?peer, error = %e, "WebSocket session failed"),
    }
}
