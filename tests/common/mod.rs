//! Shared helpers for the server integration tests
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use xserve::config::{ServerConfig, WorkerMode};
use xserve::handler::{AppHandler, HandlerResult};
use xserve::http::chunked::ChunkedDecoder;
use xserve::http::parser::{find_head_end, parse_response_head};
use xserve::http::{Headers, Request, Response, Status};
use xserve::server::{Server, ServerHandle};

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback config on an ephemeral port with short supervision intervals
pub fn config(mode: WorkerMode) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.address = "127.0.0.1".to_string();
    config.listener.port = 0;
    config.workers.mode = mode;
    config.workers.count = 2;
    config.workers.processes = 2;
    config.workers.monitor_interval_ms = 50;
    config.timeouts.keep_alive_ms = 2_000;
    config
}

pub fn start(config: ServerConfig, app: AppHandler) -> ServerHandle {
    Server::new(config, app).start().unwrap()
}

/// Answers `hello <path>`, or echoes the body of a POST
pub fn hello(request: Request) -> HandlerResult {
    if request.body().is_empty() {
        Ok(Response::text(Status::OK, format!("hello {}", request.path())))
    } else {
        Ok(Response::with_body(Status::OK, request.body_bytes().clone()))
    }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    stream
}

pub fn get(path: &str) -> String {
    format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path)
}

#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.body.clone()).unwrap()
    }
}

/// A blocking HTTP/1.1 client that keeps bytes read past one response
pub struct Client {
    pub stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        Client {
            stream: connect(addr),
            buf: Vec::new(),
        }
    }

    pub fn send(&mut self, data: &[u8]) {
        self.stream.write_all(data).unwrap();
    }

    fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 8192];
        let n = self.stream.read(&mut chunk).unwrap();
        self.buf.extend_from_slice(&chunk[..n]);
        n
    }

    /// Read one response; `head_only` for replies to HEAD
    pub fn read_reply(&mut self, head_only: bool) -> Reply {
        let head_len = loop {
            if let Some(end) = find_head_end(&self.buf) {
                break end;
            }
            assert!(self.fill() > 0, "connection closed before a response head");
        };
        let head = parse_response_head(&self.buf[..head_len]).unwrap();
        self.buf.drain(..head_len);

        let body = if head_only || !head.status.allows_body() {
            Vec::new()
        } else if head.headers.has_token("Transfer-Encoding", "chunked") {
            let mut decoder = ChunkedDecoder::new();
            let mut out = Vec::new();
            loop {
                let (consumed, done) = decoder.decode_into(&self.buf, &mut out).unwrap();
                self.buf.drain(..consumed);
                if done {
                    break;
                }
                assert!(self.fill() > 0, "connection closed inside a chunked body");
            }
            out
        } else if let Some(len) = head.headers.content_length().unwrap() {
            let len = len as usize;
            while self.buf.len() < len {
                assert!(self.fill() > 0, "connection closed inside a body");
            }
            self.buf.drain(..len).collect()
        } else {
            while self.fill() > 0 {}
            std::mem::take(&mut self.buf)
        };

        Reply {
            status: head.status.code(),
            headers: head.headers,
            body,
        }
    }

    pub fn request(&mut self, raw: &str) -> Reply {
        self.send(raw.as_bytes());
        self.read_reply(raw.starts_with("HEAD "))
    }

    /// True once the server closed its side
    pub fn is_closed(&mut self) -> bool {
        self.buf.is_empty() && self.fill() == 0
    }
}
