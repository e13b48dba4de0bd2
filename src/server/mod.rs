//! Server assembly and run modes
//!
//! [`Server::start`] validates the configuration, builds TLS, binds the
//! listener and starts serving in the mode chosen by `workers.mode`:
//!
//! - `thread`: a supervised pool of threads, each accepting from the shared
//!   listener and serving its connection to the end
//! - `process`: supervised forked processes that inherit the bound listener,
//!   each running `workers.count` accepting threads
//! - `async`: one event loop accepting and serving every connection as a task
//!
//! The mode is fixed for the life of the server. [`ServerHandle::shutdown`]
//! stops accepting, asks open HTTP/2 connections to GOAWAY and waits for the
//! workers.

pub mod acceptor;
pub mod context;
pub mod listener;

pub use acceptor::{detect_protocol, serve_connection, serve_connection_async, Protocol};
pub use context::{build_tls, ServerContext};
pub use listener::Listener;

use crate::config::{ConfigError, ServerConfig, WorkerMode};
use crate::handler::{AppHandler, MessageHandler};
use crate::worker::{
    heartbeat_predicate, HeartbeatTable, ProcessSpawner, SharedHeartbeats, Supervisor, SupervisorError,
    ThreadSpawner, WorkerContext, WorkerEntry,
};
use crate::xsocket::{self, event_loop};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// How long an accept loop waits before checking for shutdown
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// How long the event loop lets open connections finish after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Result type for server startup
pub type Result<T> = std::result::Result<T, ServerError>;

/// Startup failures; everything after startup stays per connection
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] xsocket::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker supervision failed: {0}")]
    Supervisor(#[from] SupervisorError),
}

pub struct Server {
    config: ServerConfig,
    app: AppHandler,
    ws_handler: Option<Arc<dyn MessageHandler>>,
}

impl Server {
    pub fn new(config: ServerConfig, app: AppHandler) -> Self {
        Server {
            config,
            app,
            ws_handler: None,
        }
    }

    /// Accept WebSocket upgrades and hand their messages to `handler`
    pub fn with_websocket(mut self, handler: impl MessageHandler) -> Self {
        self.ws_handler = Some(Arc::new(handler));
        self
    }

    /// Bind and start serving in the background
    pub fn start(self) -> Result<ServerHandle> {
        let Server {
            config,
            app,
            ws_handler,
        } = self;
        config.validate()?;
        let tls = build_tls(&config)?;
        let listener = Listener::bind(config.listener.socket_addr()?, config.listener.backlog)?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let config = Arc::new(config);

        tracing::info!(
            addr = %local_addr,
            mode = ?config.workers.mode,
            tls = tls.is_some(),
            http2 = config.http2.enabled,
            "server starting"
        );

        let runner = match config.workers.mode {
            WorkerMode::Thread => {
                let ctx = Arc::new(ServerContext::new(Arc::clone(&config), app, ws_handler, tls, shutdown_rx)?);
                Runner::Threads(start_threads(Arc::new(listener), ctx)?)
            }
            WorkerMode::Process => Runner::Processes(start_processes(listener, config, app, ws_handler, tls)?),
            WorkerMode::Async => {
                let ctx = Arc::new(ServerContext::new(Arc::clone(&config), app, ws_handler, tls, shutdown_rx)?);
                Runner::EventLoop(start_event_loop(listener, ctx)?)
            }
        };

        Ok(ServerHandle {
            local_addr,
            shutdown,
            runner: Some(runner),
        })
    }

    /// Serve until `SIGINT` or `SIGTERM`
    pub fn run(self) -> Result<()> {
        let handle = self.start()?;
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        runtime.block_on(wait_for_signal())?;
        tracing::info!("shutdown signal received");
        handle.shutdown();
        Ok(())
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

enum Runner {
    Threads(Supervisor<ThreadSpawner>),
    Processes(Supervisor<ProcessSpawner>),
    EventLoop(JoinHandle<()>),
}

/// A running server
///
/// Dropping the handle shuts the server down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    runner: Option<Runner>,
}

impl ServerHandle {
    /// The bound address, with the real port when port 0 was configured
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Restarts of worker slot `index`; `None` in async mode
    pub fn restart_count(&self, index: usize) -> Option<u32> {
        match self.runner.as_ref()? {
            Runner::Threads(supervisor) => supervisor.restart_count(index),
            Runner::Processes(supervisor) => supervisor.restart_count(index),
            Runner::EventLoop(_) => None,
        }
    }

    /// Stop accepting, let HTTP/2 connections GOAWAY and wait for the workers
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(runner) = self.runner.take() else {
            return;
        };
        let _ = self.shutdown.send(true);
        match runner {
            Runner::Threads(mut supervisor) => supervisor.stop(),
            Runner::Processes(mut supervisor) => supervisor.stop(),
            Runner::EventLoop(thread) => {
                if thread.join().is_err() {
                    tracing::error!("event loop thread panicked");
                }
            }
        }
        tracing::info!(addr = %self.local_addr, "server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("running", &self.runner.is_some())
            .finish()
    }
}

/// Accept and serve until the worker or the server is told to stop
fn accept_loop(listener: &Listener, ctx: &ServerContext, worker: &WorkerContext) {
    while !worker.should_stop() && !ctx.is_shutting_down() {
        worker.beat();
        match listener.accept_timeout(ACCEPT_POLL) {
            Ok(Some((stream, peer))) => {
                tracing::trace!(worker = %worker.name, peer = %peer, "accepted");
                let _serving = worker.serving();
                serve_connection(stream, ctx);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(worker = %worker.name, error = %e, "accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    tracing::debug!(worker = %worker.name, "accept loop finished");
}

fn start_threads(listener: Arc<Listener>, ctx: Arc<ServerContext>) -> Result<Supervisor<ThreadSpawner>> {
    let workers = ctx.config.workers.clone();
    let entry: WorkerEntry = Arc::new(move |worker: WorkerContext| accept_loop(&listener, &ctx, &worker));

    let mut spawner = ThreadSpawner::new(entry);
    let mut heartbeats = None;
    if let Some(max_age) = workers.heartbeat_max_age() {
        let store = Arc::new(HeartbeatTable::new(workers.count));
        spawner = spawner.with_heartbeats(store.clone());
        heartbeats = Some((store, max_age));
    }

    let mut supervisor = Supervisor::start(spawner, workers.count, &workers.name_prefix)?;
    if let Some((store, max_age)) = heartbeats {
        supervisor.set_health_check(heartbeat_predicate(store, max_age, workers.heartbeat_grace()));
    }
    supervisor.spawn_monitor(workers.monitor_interval())?;
    Ok(supervisor)
}

fn start_processes(
    listener: Listener,
    config: Arc<ServerConfig>,
    app: AppHandler,
    ws_handler: Option<Arc<dyn MessageHandler>>,
    tls: Option<xsocket::TlsConfig>,
) -> Result<Supervisor<ProcessSpawner>> {
    let workers = config.workers.clone();
    let listener = Arc::new(listener);
    let entry: WorkerEntry = Arc::new(move |worker: WorkerContext| {
        run_worker_process(&listener, &config, &app, &ws_handler, &tls, worker)
    });

    let mut spawner = ProcessSpawner::new(entry);
    let mut heartbeats = None;
    if let Some(max_age) = workers.heartbeat_max_age() {
        let store = Arc::new(SharedHeartbeats::new(workers.processes)?);
        spawner = spawner.with_heartbeats(store.clone());
        heartbeats = Some((store, max_age));
    }

    let mut supervisor = Supervisor::start(spawner, workers.processes, &workers.name_prefix)?;
    if let Some((store, max_age)) = heartbeats {
        supervisor.set_health_check(heartbeat_predicate(store, max_age, workers.heartbeat_grace()));
    }
    supervisor.spawn_monitor(workers.monitor_interval())?;
    Ok(supervisor)
}

/// Body of a forked worker: its own context, `workers.count` accept threads
fn run_worker_process(
    listener: &Arc<Listener>,
    config: &Arc<ServerConfig>,
    app: &AppHandler,
    ws_handler: &Option<Arc<dyn MessageHandler>>,
    tls: &Option<xsocket::TlsConfig>,
    worker: WorkerContext,
) {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let ctx = match ServerContext::new(Arc::clone(config), app.clone(), ws_handler.clone(), tls.clone(), shutdown_rx) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            tracing::error!(worker = %worker.name, error = %e, "worker process cannot start");
            return;
        }
    };

    let mut threads = Vec::with_capacity(config.workers.count);
    for index in 0..config.workers.count {
        let listener = Arc::clone(listener);
        let ctx = Arc::clone(&ctx);
        // The process loop below owns the heartbeat
        let thread_worker = worker.without_heartbeat();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", worker.name, index))
            .spawn(move || accept_loop(&listener, &ctx, &thread_worker));
        match spawned {
            Ok(thread) => threads.push(thread),
            Err(e) => tracing::error!(worker = %worker.name, error = %e, "cannot spawn accept thread"),
        }
    }

    while !worker.should_stop() {
        worker.beat();
        std::thread::sleep(ACCEPT_POLL);
    }
    let _ = shutdown.send(true);
    for thread in threads {
        let _ = thread.join();
    }
    ctx.executor().shutdown();
}

fn start_event_loop(listener: Listener, ctx: Arc<ServerContext>) -> Result<JoinHandle<()>> {
    let name = format!("{}-loop", ctx.config.workers.name_prefix);
    let thread = std::thread::Builder::new().name(name).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(error = %e, "cannot start event loop");
                return;
            }
        };
        let _mark = event_loop::enter();
        runtime.block_on(accept_async(listener, ctx));
    })?;
    Ok(thread)
}

async fn accept_async(listener: Listener, ctx: Arc<ServerContext>) {
    let listener = match listener.into_tokio() {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "cannot register listener with the event loop");
            return;
        }
    };
    let mut shutdown = ctx.shutdown_signal();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(peer = %peer, "accepted");
                    let _ = stream.set_nodelay(true);
                    connections.spawn(serve_connection_async(stream, Arc::clone(&ctx)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_POLL).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    let open = connections.len();
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::debug!(open, "closing connections still open after shutdown");
    }
    connections.shutdown().await;
}
