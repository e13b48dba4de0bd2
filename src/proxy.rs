//! Streaming reverse proxy handler
//!
//! [`ProxyHandler`] forwards the client's request bytes to a backend, parses
//! the backend's response head as soon as `\r\n\r\n` arrives and hands back a
//! [`Response`] whose body is a lazy [`ProxyBody`]. The body reads from the
//! backend only when the writer pulls the next chunk.
//!
//! Failing to connect or to forward is a [`ProxyError`] and becomes a 502.
//! Once the response has started, backend failures just end the body early.

use crate::config::TimeoutConfig;
use crate::handler::{Handler, HandlerResult};
use crate::http::chunked::ChunkedDecoder;
use crate::http::parser::{find_head_end, parse_response_head};
use crate::http::{Body, Headers, Method, Request, Response, Status};
use crate::xsocket::{self, SessionOps, XSocket};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Largest backend response head accepted
const MAX_BACKEND_HEAD: usize = 64 * 1024;

const READ_SIZE: usize = 16 * 1024;

/// Headers that describe the backend connection, not the response
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Cannot connect to backend {target}: {source}")]
    Connect {
        target: SocketAddr,
        #[source]
        source: xsocket::Error,
    },

    #[error("Backend {target} failed before responding: {reason}")]
    Forward { target: SocketAddr, reason: String },
}

impl ProxyError {
    /// The 502 sent to the client
    pub fn into_response(self) -> Response {
        Response::error(Status::BAD_GATEWAY)
    }
}

pub struct ProxyHandler {
    target: SocketAddr,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl ProxyHandler {
    pub fn new(target: SocketAddr) -> Self {
        ProxyHandler {
            target,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
        }
    }

    /// Connect with the handshake timeout, read with the request timeout
    pub fn with_timeouts(mut self, timeouts: &TimeoutConfig) -> Self {
        self.connect_timeout = timeouts.handshake();
        self.read_timeout = timeouts.request_read();
        self
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Forward `request` and return once the backend's head arrived
    pub fn forward(&self, request: &Request) -> Result<Response, ProxyError> {
        let target = self.target;
        let forward_err = |reason: String| ProxyError::Forward { target, reason };

        let mut socket = XSocket::connect(target, self.connect_timeout)
            .map_err(|source| ProxyError::Connect { target, source })?;
        socket.set_timeout(Some(self.read_timeout));
        socket
            .send_all(&request.to_wire())
            .map_err(|e| forward_err(e.to_string()))?;

        let mut buf = Vec::with_capacity(READ_SIZE);
        let mut chunk = vec![0u8; READ_SIZE];
        let head_len = loop {
            if let Some(end) = find_head_end(&buf) {
                break end;
            }
            if buf.len() > MAX_BACKEND_HEAD {
                return Err(forward_err(format!("response head exceeds {} bytes", MAX_BACKEND_HEAD)));
            }
            match socket.receive(&mut chunk) {
                Ok(0) => return Err(forward_err("connection closed before the response head".to_string())),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(forward_err(e.to_string())),
            }
        };

        let head = parse_response_head(&buf[..head_len]).map_err(|e| forward_err(e.to_string()))?;
        let leftover = Bytes::copy_from_slice(&buf[head_len..]);
        tracing::debug!(
            backend = %target,
            status = head.status.code(),
            "backend responded"
        );

        let chunked = head.headers.has_token("Transfer-Encoding", "chunked");
        let length = head.headers.content_length().ok().flatten();
        let mut headers = Headers::new();
        for (name, value) in head.headers.iter() {
            if !HOP_BY_HOP.iter().any(|hop| name.eq_ignore_ascii_case(hop)) {
                headers.insert(name, value);
            }
        }

        let body = if request.method() == Method::Head {
            // Keeps the backend's Content-Length for the client
            Body::Stream(Box::new(std::iter::empty()))
        } else if !head.status.allows_body() {
            Body::empty()
        } else {
            let framing = if chunked {
                headers.remove("Content-Length");
                BodyFraming::Chunked(ChunkedDecoder::new())
            } else if let Some(len) = length {
                BodyFraming::Length { remaining: len }
            } else {
                BodyFraming::UntilClose
            };
            Body::Stream(Box::new(ProxyBody::new(socket, leftover, framing)))
        };

        let mut response = Response::with_body(head.status, body);
        *response.headers_mut() = headers;
        Ok(response)
    }
}

impl Handler for ProxyHandler {
    fn handle(&self, request: Request) -> HandlerResult {
        match self.forward(&request) {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::warn!(path = request.path(), error = %e, "bad gateway");
                Ok(e.into_response())
            }
        }
    }
}

impl std::fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandler").field("target", &self.target).finish()
    }
}

#[derive(Debug)]
enum BodyFraming {
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
    UntilClose,
}

/// Backend body, read one chunk per pull
///
/// Leftover bytes that arrived with the head come out first. The backend
/// socket is dropped as soon as the body is complete or fails.
pub struct ProxyBody {
    socket: Option<XSocket>,
    pending: Bytes,
    framing: BodyFraming,
}

impl ProxyBody {
    fn new(socket: XSocket, leftover: Bytes, framing: BodyFraming) -> Self {
        ProxyBody {
            socket: Some(socket),
            pending: leftover,
            framing,
        }
    }

    fn finish(&mut self) {
        self.socket = None;
        self.pending = Bytes::new();
    }

    /// Buffered bytes if any, else one read of at most `limit` bytes
    fn fill(&mut self, limit: usize) -> Option<Bytes> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(limit);
            return Some(self.pending.split_to(n));
        }
        self.read_more(limit)
    }

    fn read_more(&mut self, limit: usize) -> Option<Bytes> {
        let socket = self.socket.as_mut()?;
        let mut buf = vec![0u8; limit.clamp(1, READ_SIZE)];
        match socket.receive(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some(Bytes::from(buf))
            }
            Err(e) => {
                tracing::debug!(error = %e, "backend body ended early");
                None
            }
        }
    }
}

impl Iterator for ProxyBody {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.socket.is_none() && self.pending.is_empty() {
                return None;
            }
            match &mut self.framing {
                BodyFraming::Length { remaining } => {
                    if *remaining == 0 {
                        self.finish();
                        return None;
                    }
                    let limit = (*remaining).min(READ_SIZE as u64) as usize;
                    let Some(data) = self.fill(limit) else {
                        self.finish();
                        return None;
                    };
                    if let BodyFraming::Length { remaining } = &mut self.framing {
                        *remaining -= data.len() as u64;
                    }
                    return Some(Ok(data));
                }
                BodyFraming::Chunked(_) => {
                    let input = if self.pending.is_empty() {
                        match self.read_more(READ_SIZE) {
                            Some(data) => data,
                            None => {
                                self.finish();
                                return None;
                            }
                        }
                    } else {
                        std::mem::take(&mut self.pending)
                    };
                    let BodyFraming::Chunked(decoder) = &mut self.framing else {
                        return None;
                    };
                    let mut out = Vec::new();
                    let (consumed, done) = match decoder.decode_into(&input, &mut out) {
                        Ok(progress) => progress,
                        Err(e) => {
                            tracing::debug!(error = %e, "malformed chunked body from backend");
                            self.finish();
                            return None;
                        }
                    };
                    if done {
                        self.finish();
                    } else if consumed < input.len() {
                        // A split size line waits for the next read
                        let rest = input.slice(consumed..);
                        match self.read_more(READ_SIZE) {
                            Some(more) => {
                                let mut joined = Vec::with_capacity(rest.len() + more.len());
                                joined.extend_from_slice(&rest);
                                joined.extend_from_slice(&more);
                                self.pending = Bytes::from(joined);
                            }
                            None => {
                                self.finish();
                                if out.is_empty() {
                                    return None;
                                }
                            }
                        }
                    }
                    if !out.is_empty() {
                        return Some(Ok(Bytes::from(out)));
                    }
                    if done {
                        return None;
                    }
                }
                BodyFraming::UntilClose => {
                    return match self.fill(READ_SIZE) {
                        Some(data) => Some(Ok(data)),
                        None => {
                            self.finish();
                            None
                        }
                    };
                }
            }
        }
    }
}
