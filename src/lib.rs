//! xserve - a self-contained HTTP/1.1, HTTP/2 and WebSocket application server
//!
//! The crate owns the socket: it accepts plain and TLS connections, picks
//! HTTP/1.1 or HTTP/2 (ALPN or the h2c upgrade), frames request and response
//! bodies, upgrades connections to WebSocket and runs the application
//! [`Handler`](handler::Handler) on a thread pool, forked processes or a single
//! event loop.
//!
//! # Layout
//!
//! - [`xsocket`]: blocking and event loop sockets over plain TCP or TLS
//! - [`http`]: request framing, HTTP/1.1 messages, the HTTP/2 engine
//! - [`ws`]: WebSocket handshake, frames, permessage-deflate, sessions
//! - [`response`]: the finalizer pipeline (ranges, compression, headers)
//! - [`proxy`]: a streaming reverse proxy handler
//! - [`worker`]: supervised threads and processes, the hybrid executor
//! - [`server`]: listener, protocol detection and the run modes
//!
//! # Example
//!
//! ```no_run
//! use xserve::config::ServerConfig;
//! use xserve::handler::{AppHandler, HandlerResult};
//! use xserve::http::{Request, Response, Status};
//! use xserve::server::Server;
//!
//! fn hello(request: Request) -> HandlerResult {
//!     Ok(Response::text(Status::OK, format!("hello {}", request.path())))
//! }
//!
//! let config = ServerConfig::from_toml_str("[listener]\nport = 8080\n").unwrap();
//! xserve::logging::init(&config.logging);
//! Server::new(config, AppHandler::from_sync(hello)).run().unwrap();
//! ```

pub mod config;
pub mod handler;
pub mod http;
pub mod logging;
pub mod proxy;
pub mod response;
pub mod server;
pub mod worker;
pub mod ws;
pub mod xsocket;
