//! Everything a connection needs, built once and passed explicitly

use super::{Result, ServerError};
use crate::config::ServerConfig;
use crate::handler::{AppHandler, Dispatcher, MessageHandler};
use crate::http::h2::EngineConfig;
use crate::http::FramingOptions;
use crate::response::Finalizer;
use crate::worker::HybridExecutor;
use crate::xsocket::{TlsConfig, TlsVersion};
use std::sync::Arc;
use tokio::sync::watch;

/// Build the server TLS configuration, or `None` when TLS is off
pub fn build_tls(config: &ServerConfig) -> Result<Option<TlsConfig>> {
    let settings = &config.tls;
    if !settings.enabled() {
        return Ok(None);
    }

    let mut builder = TlsConfig::server()?.allow_builtin_cert(settings.allow_builtin_cert);
    if let Some(cert) = &settings.cert_file {
        builder = builder.cert_files(cert.as_path(), settings.key_file.as_deref())?;
    }
    if let Some(version) = &settings.min_version {
        builder = builder.min_version(TlsVersion::from_str(version)?)?;
    }
    let mut alpn: Vec<&str> = settings.alpn.iter().map(String::as_str).collect();
    if !config.http2.enabled {
        alpn.retain(|proto| *proto != "h2");
    }
    if !alpn.is_empty() {
        builder = builder.alpn(&alpn)?;
    }
    Ok(Some(builder.build()?))
}

/// Per-process server state
///
/// Threads spawned before a fork do not exist in the child, so process
/// workers build their own context after forking.
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub dispatcher: Arc<Dispatcher>,
    pub tls: Option<TlsConfig>,
    pub ws_handler: Option<Arc<dyn MessageHandler>>,
    executor: Arc<HybridExecutor>,
    shutdown: watch::Receiver<bool>,
}

impl ServerContext {
    pub fn new(
        config: Arc<ServerConfig>,
        app: AppHandler,
        ws_handler: Option<Arc<dyn MessageHandler>>,
        tls: Option<TlsConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let threads = config.workers.count.max(1);
        let prefix = format!("{}-exec", config.workers.name_prefix);
        let executor = Arc::new(HybridExecutor::new(threads, &prefix).map_err(ServerError::Io)?);
        let finalizer = Arc::new(Finalizer::new(&config));
        let dispatcher = Arc::new(Dispatcher::new(app, Arc::clone(&executor), finalizer));

        Ok(ServerContext {
            config,
            dispatcher,
            tls,
            ws_handler,
            executor,
            shutdown,
        })
    }

    pub fn framing_options(&self, keep_alive_wait: bool) -> FramingOptions {
        let timeouts = &self.config.timeouts;
        FramingOptions {
            request_timeout: if keep_alive_wait {
                timeouts.keep_alive()
            } else {
                timeouts.request_read()
            },
            stream_timeout: timeouts.stream_read(),
            max_header_bytes: self.config.buffers.max_header_bytes,
            read_size: self.config.buffers.read_size,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            idle_timeout: self.config.timeouts.h2_idle(),
            read_size: self.config.buffers.read_size,
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn executor(&self) -> &HybridExecutor {
        &self.executor
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("tls", &self.tls.is_some())
            .field("websocket", &self.ws_handler.is_some())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
