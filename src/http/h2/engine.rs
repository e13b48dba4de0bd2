//! Per-connection HTTP/2 stream engine
//!
//! [`H2Engine`] drives one [`H2Connection`] over an async socket. The engine
//! loop is the only reader and writer of the socket; everything else talks to
//! it through the shared connection state and a flush notification.
//!
//! Each stream gets its own task, started on the stream's `RequestReceived`
//! event and fed through a private queue, so events of one stream are handled
//! in arrival order while streams run concurrently. A stream task collects the
//! body, runs the application and writes the response in DATA frames sized to
//! the flow-control window. When the window is exhausted the task parks on
//! [`FlowWaiters`] until a WINDOW_UPDATE (or a SETTINGS change) wakes it.
//!
//! In thread mode the engine runs on a dedicated loop thread and blocking
//! handlers are posted back to the worker thread through a
//! [`HandoffQueue`]; see [`run_on_thread`].

use super::connection::H2Connection;
use super::error::{Error, ErrorCode, Result};
use super::events::Event;
use super::handoff::{HandoffQueue, HandoffSender};
use super::stream::StreamId;
use crate::handler::Dispatcher;
use crate::http::message::pull_chunk;
use crate::http::{Body, Headers, Method, Request, Response, Version};
use crate::xsocket::{self, event_loop, AsyncSessionOps, XSocket};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::{AbortHandle, JoinSet};

/// How often the worker thread checks whether a threaded engine finished
const HANDOFF_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Idle time with no open streams before the engine sends GOAWAY
    pub idle_timeout: Duration,
    pub read_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            idle_timeout: Duration::from_secs(30),
            read_size: 16 * 1024,
        }
    }
}

/// Senders parked on an exhausted flow-control window
///
/// Registration happens while the connection lock is held, so a window
/// update processed by the engine cannot slip in between the window check
/// and the registration.
#[derive(Debug, Default)]
pub struct FlowWaiters {
    waiting: Mutex<HashMap<StreamId, Vec<oneshot::Sender<()>>>>,
}

impl FlowWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park on `stream_id`; the receiver fails once the connection is gone
    pub fn register(&self, stream_id: StreamId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().entry(stream_id).or_default().push(tx);
        rx
    }

    /// Wake the senders of one stream; stream 0 wakes everyone
    pub fn wake(&self, stream_id: StreamId) {
        if stream_id == 0 {
            self.wake_all();
            return;
        }
        if let Some(waiters) = self.waiting.lock().remove(&stream_id) {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }

    pub fn wake_all(&self) {
        let all: Vec<_> = self.waiting.lock().drain().collect();
        for (_, waiters) in all {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }

    /// Drop every waiter without waking it
    pub fn clear(&self) {
        self.waiting.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State shared between the engine loop and its stream tasks
struct Shared {
    conn: Mutex<H2Connection>,
    flush: Notify,
    waiters: FlowWaiters,
}

impl Shared {
    fn wake_engine(&self) {
        self.flush.notify_one();
    }
}

#[derive(Debug)]
enum StreamInput {
    Data { data: Bytes, flow_len: usize },
    End,
}

struct StreamSlot {
    input: Option<mpsc::UnboundedSender<StreamInput>>,
    task: AbortHandle,
}

/// What a stream task needs besides the shared state
#[derive(Clone)]
struct StreamContext {
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    handoff: Option<HandoffSender>,
}

pub struct H2Engine<S: AsyncSessionOps> {
    socket: S,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
    handoff: Option<HandoffSender>,
    shutdown: Option<watch::Receiver<bool>>,
    upgrade: Option<Request>,
    initial: Bytes,
    peer: Option<SocketAddr>,
    streams: HashMap<StreamId, StreamSlot>,
    tasks: JoinSet<StreamId>,
}

impl<S: AsyncSessionOps> H2Engine<S> {
    /// `conn` must already be initiated (preface or upgrade queued)
    pub fn new(socket: S, conn: H2Connection, dispatcher: Arc<Dispatcher>, config: EngineConfig) -> Self {
        H2Engine {
            socket,
            shared: Arc::new(Shared {
                conn: Mutex::new(conn),
                flush: Notify::new(),
                waiters: FlowWaiters::new(),
            }),
            dispatcher,
            config,
            handoff: None,
            shutdown: None,
            upgrade: None,
            initial: Bytes::new(),
            peer: None,
            streams: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Run blocking handlers through `handoff` instead of the executor
    pub fn with_handoff(mut self, handoff: HandoffSender) -> Self {
        self.handoff = Some(handoff);
        self
    }

    /// Send GOAWAY(NO_ERROR) once `shutdown` turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Answer the HTTP/1.1 request that upgraded this connection on stream 1
    pub fn with_upgrade(mut self, request: Request) -> Self {
        self.upgrade = Some(request);
        self
    }

    /// Bytes already read from the socket, such as a preface pipelined
    /// behind the upgrade request
    pub fn with_initial_data(mut self, data: Bytes) -> Self {
        self.initial = data;
        self
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    /// Serve the connection until the peer leaves, an error ends it, or a
    /// GOAWAY has been sent and every stream finished
    pub async fn run(mut self) -> Result<()> {
        if let Some(mut request) = self.upgrade.take() {
            request.store_mut().insert("h2_handling", true);
            request.store_mut().insert("stream_id", 1);
            self.spawn_stream(1, request, None);
        }
        if !self.initial.is_empty() {
            let initial = std::mem::take(&mut self.initial);
            let received = self.shared.conn.lock().receive_data(&initial);
            match received {
                Ok(events) => {
                    for event in events {
                        self.handle_event(event);
                    }
                }
                Err(e) => {
                    let result = Err(e);
                    self.teardown(&result).await;
                    return result;
                }
            }
        }

        let mut buf = vec![0u8; self.config.read_size.max(1024)];
        let idle = self.config.idle_timeout;
        let result = loop {
            if let Err(e) = self.flush().await {
                break Err(e);
            }
            if self.tasks.is_empty() && self.shared.conn.lock().is_closing() {
                tracing::debug!(peer = ?self.peer, "HTTP/2 connection drained");
                break Ok(());
            }

            tokio::select! {
                _ = wait_shutdown(&mut self.shutdown), if self.shutdown.is_some() => {
                    self.shutdown = None;
                    tracing::debug!(peer = ?self.peer, "shutdown requested, sending GOAWAY");
                    self.shared.conn.lock().close_connection(ErrorCode::NoError);
                }
                _ = self.shared.flush.notified() => {}
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match joined {
                        Ok(stream_id) => {
                            self.streams.remove(&stream_id);
                        }
                        Err(e) => {
                            if e.is_panic() {
                                tracing::error!(peer = ?self.peer, "HTTP/2 stream task panicked");
                            }
                            self.streams.retain(|_, slot| !slot.task.is_finished());
                        }
                    }
                }
                read = tokio::time::timeout(idle, self.socket.receive(&mut buf)) => {
                    match read {
                        Err(_) => {
                            if self.tasks.is_empty() {
                                tracing::debug!(peer = ?self.peer, "HTTP/2 connection idle, sending GOAWAY");
                                self.shared.conn.lock().close_connection(ErrorCode::NoError);
                            }
                        }
                        Ok(Ok(0)) => break Ok(()),
                        Ok(Ok(n)) => {
                            let received = self.shared.conn.lock().receive_data(&buf[..n]);
                            match received {
                                Ok(events) => {
                                    for event in events {
                                        self.handle_event(event);
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!(peer = ?self.peer, error = %e, "HTTP/2 connection error");
                                    break Err(e);
                                }
                            }
                        }
                        Ok(Err(e)) => break Err(e.into()),
                    }
                }
            }
        };

        self.teardown(&result).await;
        result
    }

    async fn flush(&mut self) -> Result<()> {
        let pending = self.shared.conn.lock().data_to_send();
        if !pending.is_empty() {
            self.socket.send_all(&pending).await?;
        }
        Ok(())
    }

    /// GOAWAY if none went out yet, then release every stream and waiter
    async fn teardown(&mut self, result: &Result<()>) {
        let code = match result {
            Err(e) => e.code(),
            Ok(()) => ErrorCode::NoError,
        };
        let transport_failed = matches!(result, Err(Error::Transport(_)));
        let pending = {
            let mut conn = self.shared.conn.lock();
            conn.close_connection(code);
            conn.data_to_send()
        };
        if !transport_failed && !pending.is_empty() {
            let _ = self.socket.send_all(&pending).await;
        }

        self.tasks.abort_all();
        self.streams.clear();
        self.shared.waiters.clear();
        let _ = self.socket.close().await;
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::RequestReceived { stream_id, headers } => {
                match request_from_fields(stream_id, &headers, self.peer) {
                    Ok(request) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        let task = self.spawn_stream(stream_id, request, Some(rx));
                        self.streams.insert(
                            stream_id,
                            StreamSlot {
                                input: Some(tx),
                                task,
                            },
                        );
                    }
                    Err(e) => {
                        tracing::debug!(stream_id, error = %e, "rejecting HTTP/2 request");
                        self.shared.conn.lock().reset_stream(stream_id, ErrorCode::ProtocolError);
                    }
                }
            }
            Event::DataReceived {
                stream_id,
                data,
                flow_controlled_length,
            } => {
                let input = StreamInput::Data {
                    data,
                    flow_len: flow_controlled_length,
                };
                if !self.forward(stream_id, input) {
                    // Nobody will consume it; give the window back
                    self.shared
                        .conn
                        .lock()
                        .acknowledge_received_data(stream_id, flow_controlled_length);
                }
            }
            Event::StreamEnded { stream_id } => {
                self.forward(stream_id, StreamInput::End);
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.input = None;
                }
            }
            Event::StreamReset {
                stream_id,
                error_code,
                remote,
            } => {
                tracing::debug!(stream_id, code = %error_code.name(), remote, "HTTP/2 stream reset");
                if let Some(slot) = self.streams.remove(&stream_id) {
                    slot.task.abort();
                }
                self.shared.waiters.wake(stream_id);
            }
            Event::WindowUpdated { stream_id, .. } => self.shared.waiters.wake(stream_id),
            Event::RemoteSettingsChanged { .. } => self.shared.waiters.wake_all(),
            Event::SettingsAcknowledged => {}
            Event::ConnectionTerminated {
                error_code,
                last_stream_id,
            } => {
                tracing::debug!(
                    peer = ?self.peer,
                    code = %error_code.name(),
                    last_stream_id,
                    "peer sent GOAWAY"
                );
            }
        }
    }

    /// Queue an event for a stream task; false when the stream has none
    fn forward(&self, stream_id: StreamId, input: StreamInput) -> bool {
        let delivered = self
            .streams
            .get(&stream_id)
            .and_then(|slot| slot.input.as_ref())
            .is_some_and(|tx| tx.send(input).is_ok());
        if !delivered {
            tracing::debug!(stream_id, "event for a stream without a task");
        }
        delivered
    }

    fn spawn_stream(
        &mut self,
        stream_id: StreamId,
        request: Request,
        input: Option<mpsc::UnboundedReceiver<StreamInput>>,
    ) -> AbortHandle {
        let ctx = StreamContext {
            shared: Arc::clone(&self.shared),
            dispatcher: Arc::clone(&self.dispatcher),
            handoff: self.handoff.clone(),
        };
        self.tasks.spawn(serve_stream(ctx, stream_id, request, input))
    }
}

/// Resolves once the receiver sees `true`; never for `None` or a dropped sender
pub(crate) async fn wait_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            if rx.wait_for(|stop| *stop).await.is_err() {
                // Sender gone without a shutdown
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

/// Build the request a stream carries from its decoded header fields
fn request_from_fields(
    stream_id: StreamId,
    fields: &[(String, String)],
    peer: Option<SocketAddr>,
) -> crate::http::Result<Request> {
    let mut method = None;
    let mut path = None;
    let mut authority = None;
    let mut headers = Headers::new();
    for (name, value) in fields {
        match name.as_str() {
            ":method" => method = Some(Method::from_str(value)?),
            ":path" => path = Some(value.clone()),
            ":authority" => authority = Some(value.clone()),
            pseudo if pseudo.starts_with(':') => {}
            _ => headers.insert(name.clone(), value.clone()),
        }
    }
    if let Some(authority) = authority {
        headers.set_default("host", authority);
    }
    let method = method.ok_or_else(|| crate::http::Error::Parse("missing :method".to_string()))?;

    let mut request = Request::builder()
        .method(method)
        .uri(path.unwrap_or_else(|| "/".to_string()))
        .version(Version::Http2)
        .headers(headers)
        .peer(peer)
        .build();
    request.store_mut().insert("h2_handling", true);
    request.store_mut().insert("stream_id", stream_id);
    Ok(request)
}

/// One stream from first HEADERS to the final DATA frame
async fn serve_stream(
    ctx: StreamContext,
    stream_id: StreamId,
    mut request: Request,
    input: Option<mpsc::UnboundedReceiver<StreamInput>>,
) -> StreamId {
    if let Some(mut input) = input {
        let mut body = BytesMut::new();
        loop {
            match input.recv().await {
                Some(StreamInput::Data { data, flow_len }) => {
                    body.extend_from_slice(&data);
                    ctx.shared.conn.lock().acknowledge_received_data(stream_id, flow_len);
                    ctx.shared.wake_engine();
                }
                Some(StreamInput::End) => break,
                // The stream went away before its body was complete
                None => return stream_id,
            }
        }
        request.set_body(body.freeze());
    }

    let head_only = request.method() == Method::Head;
    let response = match ctx.handoff.as_ref().filter(|_| !ctx.dispatcher.is_async()) {
        Some(handoff) => {
            let dispatcher = Arc::clone(&ctx.dispatcher);
            match handoff.run(move || dispatcher.dispatch_blocking(request, true)).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(stream_id, error = %e, "handed-off handler did not answer");
                    ctx.shared.conn.lock().reset_stream(stream_id, ErrorCode::InternalError);
                    ctx.shared.wake_engine();
                    return stream_id;
                }
            }
        }
        None => ctx.dispatcher.dispatch(request, true).await,
    };

    match send_response(&ctx.shared, stream_id, response, head_only).await {
        Ok(()) => {}
        Err(Error::StreamClosed(_)) | Err(Error::ConnectionClosed) => {
            tracing::debug!(stream_id, "stream closed before the response finished");
        }
        Err(e) => {
            tracing::debug!(stream_id, error = %e, "resetting stream");
            ctx.shared.conn.lock().reset_stream(stream_id, ErrorCode::InternalError);
            ctx.shared.wake_engine();
        }
    }
    stream_id
}

async fn send_response(shared: &Shared, stream_id: StreamId, response: Response, head_only: bool) -> Result<()> {
    let (status, headers, body) = response.into_parts();
    let bodyless = head_only || !status.allows_body() || matches!(&body, Body::Fixed(b) if b.is_empty());
    shared.conn.lock().send_headers(stream_id, status.code(), &headers, bodyless)?;
    shared.wake_engine();
    if bodyless {
        return Ok(());
    }

    match body {
        Body::Fixed(bytes) => send_chunk(shared, stream_id, bytes).await?,
        other => {
            let mut chunks = other
                .into_stream()
                .map_err(|e| Error::Internal(format!("response body: {}", e)))?;
            loop {
                let (rest, item) = pull_chunk(chunks).await;
                chunks = rest;
                match item {
                    None => break,
                    Some(Ok(chunk)) => send_chunk(shared, stream_id, chunk).await?,
                    Some(Err(e)) => return Err(Error::Internal(format!("response body: {}", e))),
                }
            }
        }
    }

    shared.conn.lock().send_data(stream_id, &[], true)?;
    shared.wake_engine();
    Ok(())
}

/// Send `chunk` as DATA frames, parking whenever the window is exhausted
async fn send_chunk(shared: &Shared, stream_id: StreamId, mut chunk: Bytes) -> Result<()> {
    while !chunk.is_empty() {
        let parked = {
            let mut conn = shared.conn.lock();
            let window = conn.local_flow_control_window(stream_id)?;
            if window == 0 {
                Some(shared.waiters.register(stream_id))
            } else {
                let n = window.min(conn.max_outbound_frame_size()).min(chunk.len());
                conn.send_data(stream_id, &chunk[..n], false)?;
                chunk = chunk.slice(n..);
                None
            }
        };
        shared.wake_engine();
        if let Some(waiter) = parked {
            tracing::trace!(stream_id, "flow-control window exhausted");
            waiter.await.map_err(|_| Error::ConnectionClosed)?;
        }
    }
    Ok(())
}

/// Serve an HTTP/2 connection from a worker thread
///
/// The engine runs on a new `{thread}-h2` loop thread. Blocking handlers come
/// back to the calling thread, which drains them until the engine is done.
pub fn run_on_thread(
    socket: XSocket,
    conn: H2Connection,
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
    upgrade: Option<Request>,
    leftover: Bytes,
    shutdown: Option<watch::Receiver<bool>>,
) -> Result<()> {
    let (handoff, queue) = HandoffQueue::new();
    let name = format!("{}-h2", std::thread::current().name().unwrap_or("worker"));
    let peer = socket.peer_addr();

    let engine_thread = std::thread::Builder::new()
        .name(name)
        .spawn(move || -> Result<()> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::Transport(xsocket::Error::from_io(e)))?;
            let _mark = event_loop::enter();
            runtime.block_on(async move {
                let socket = socket.into_async()?;
                let mut engine = H2Engine::new(socket, conn, dispatcher, config)
                    .with_handoff(handoff)
                    .with_initial_data(leftover)
                    .with_peer(peer);
                if let Some(request) = upgrade {
                    engine = engine.with_upgrade(request);
                }
                if let Some(shutdown) = shutdown {
                    engine = engine.with_shutdown(shutdown);
                }
                engine.run().await
            })
        })
        .map_err(|e| Error::Transport(xsocket::Error::from_io(e)))?;

    let handled = queue.drain(HANDOFF_POLL, || engine_thread.is_finished());
    tracing::trace!(handled, "HTTP/2 handoff queue drained");
    engine_thread
        .join()
        .map_err(|_| Error::Internal("HTTP/2 engine thread panicked".to_string()))?
}
