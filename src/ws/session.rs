//! Upgraded WebSocket connections
//!
//! A session runs three activities:
//!
//! - the receive loop in [`WebSocketSession::run`], which owns the socket and
//!   parses one frame at a time
//! - the heartbeat task, which pings on an interval and gives up after
//!   `max_missed_pongs` consecutive misses, backing off between attempts
//! - one task per complete message, running the [`MessageHandler`]
//!
//! Everything else talks to the session through a [`WsHandle`]. Outgoing
//! messages are queued on the handle and written by the receive loop, so the
//! socket has a single writer.

use super::deflate::{DeflateParams, PerMessageDeflate};
use super::frame::{Frame, FrameCodec, OpCode};
use super::{CloseCode, Error, Message, Result};
use crate::config::WebSocketConfig;
use crate::handler::MessageHandler;
use crate::http::h2::engine::wait_shutdown;
use crate::xsocket::AsyncSessionOps;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_frame_size: usize,
    pub max_message_size: usize,
    /// Zero disables the heartbeat
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub max_missed_pongs: u32,
    pub backoff_cap: Duration,
    /// How long to wait for the peer's close frame after sending ours
    pub close_timeout: Duration,
    pub deflate_level: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::from_config(&WebSocketConfig::default())
    }
}

impl SessionConfig {
    pub fn from_config(config: &WebSocketConfig) -> Self {
        SessionConfig {
            max_frame_size: config.max_frame_size,
            max_message_size: config.max_message_size,
            ping_interval: Duration::from_millis(config.ping_interval_ms),
            pong_timeout: Duration::from_millis(config.pong_timeout_ms),
            max_missed_pongs: config.max_missed_pongs,
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            close_timeout: Duration::from_secs(5),
            deflate_level: 6,
        }
    }
}

#[derive(Debug)]
enum Command {
    Send(Message),
    Ping(Bytes),
    Close(CloseCode, String),
}

/// Cloneable sender side of a session
#[derive(Debug, Clone)]
pub struct WsHandle {
    commands: mpsc::UnboundedSender<Command>,
    closing: Arc<AtomicBool>,
    peer: Option<SocketAddr>,
}

impl WsHandle {
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::Send(Message::Text(text.into())))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Command::Send(Message::Binary(data.into())))
    }

    fn ping(&self, payload: Bytes) -> Result<()> {
        self.send(Command::Ping(payload))
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.commands.send(command).map_err(|_| Error::Closed)
    }

    /// Start the close handshake
    ///
    /// Only the first call on any clone of the handle has an effect; later
    /// calls, and calls after the session ended, return `Ok`.
    pub fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.commands.send(Command::Close(code, reason.to_string()));
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// The message being reassembled from fragments
struct Fragment {
    opcode: OpCode,
    compressed: bool,
    data: BytesMut,
}

enum Flow {
    Continue,
    Closed(CloseCode),
}

pub struct WebSocketSession<S> {
    socket: S,
    config: SessionConfig,
    codec: FrameCodec,
    deflate: Option<PerMessageDeflate>,
    read_buf: BytesMut,
    fragment: Option<Fragment>,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: WsHandle,
    pongs: watch::Sender<Instant>,
    shutdown: Option<watch::Receiver<bool>>,
    close_sent: bool,
    torn_down: bool,
}

impl<S: AsyncSessionOps> WebSocketSession<S> {
    /// Wrap an upgraded socket; `leftover` holds bytes read past the handshake
    pub fn new(
        socket: S,
        config: SessionConfig,
        deflate: Option<DeflateParams>,
        leftover: Bytes,
        peer: Option<SocketAddr>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pongs, _) = watch::channel(Instant::now());
        let mut read_buf = BytesMut::with_capacity(READ_CHUNK.max(leftover.len()));
        read_buf.extend_from_slice(&leftover);

        WebSocketSession {
            socket,
            codec: FrameCodec::server(config.max_frame_size, deflate.is_some()),
            deflate: deflate.map(|params| PerMessageDeflate::new(params, config.deflate_level)),
            config,
            read_buf,
            fragment: None,
            commands: rx,
            handle: WsHandle {
                commands: tx,
                closing: Arc::new(AtomicBool::new(false)),
                peer,
            },
            pongs,
            shutdown: None,
            close_sent: false,
            torn_down: false,
        }
    }

    /// Close with 1001 (going away) once `shutdown` turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn handle(&self) -> WsHandle {
        self.handle.clone()
    }

    /// Run until the close handshake finishes or the connection fails
    ///
    /// Returns the close code of an orderly close. Protocol violations,
    /// heartbeat failure and transport errors are returned as errors after a
    /// best-effort close frame; the socket is torn down exactly once either way.
    pub async fn run(mut self, handler: Arc<dyn MessageHandler>) -> Result<CloseCode> {
        handler.on_open(&self.handle);

        let mut tasks = JoinSet::new();
        let mut heartbeat = self.spawn_heartbeat();
        let outcome = self.drive(&handler, &mut tasks, &mut heartbeat).await;

        if let Some(task) = heartbeat.take() {
            task.abort();
        }
        // Handlers still running see their sends fail with Error::Closed
        tasks.abort_all();
        self.handle.closing.store(true, Ordering::Release);

        let code = match &outcome {
            Ok(code) => *code,
            Err(err) => {
                if !matches!(err, Error::Transport(_)) {
                    self.send_close(err.close_code(), &err.to_string()).await;
                }
                err.close_code()
            }
        };
        self.teardown().await;
        handler.on_close(code);
        outcome
    }

    async fn drive(
        &mut self,
        handler: &Arc<dyn MessageHandler>,
        tasks: &mut JoinSet<()>,
        heartbeat: &mut Option<JoinHandle<Error>>,
    ) -> Result<CloseCode> {
        let mut scratch = vec![0u8; READ_CHUNK];
        let mut close_deadline: Option<tokio::time::Instant> = None;

        // Frames that arrived together with the upgrade request
        if let Flow::Closed(code) = self.process_buffered(handler, tasks).await? {
            return Ok(code);
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send(message)) => self.send_message(message).await?,
                    Some(Command::Ping(payload)) => self.write_frame(&Frame::ping(payload)).await?,
                    Some(Command::Close(code, reason)) => {
                        self.send_close(code, &reason).await;
                        close_deadline = Some(tokio::time::Instant::now() + self.config.close_timeout);
                    }
                    // The session holds a handle itself
                    None => return Err(Error::Closed),
                },
                result = async {
                    match heartbeat.as_mut() {
                        Some(task) => task.await,
                        None => std::future::pending().await,
                    }
                }, if heartbeat.is_some() => {
                    *heartbeat = None;
                    return match result {
                        Ok(err) => Err(err),
                        Err(join) => Err(Error::Protocol(format!("heartbeat task failed: {}", join))),
                    };
                }
                received = self.socket.receive(&mut scratch) => {
                    let n = received?;
                    if n == 0 {
                        return Err(Error::Transport(crate::xsocket::Error::Closed));
                    }
                    self.read_buf.extend_from_slice(&scratch[..n]);
                    if let Flow::Closed(code) = self.process_buffered(handler, tasks).await? {
                        return Ok(code);
                    }
                }
                _ = wait_shutdown(&mut self.shutdown), if self.shutdown.is_some() => {
                    self.shutdown = None;
                    tracing::debug!(peer = ?self.handle.peer, "shutdown requested, closing websocket");
                    self.handle.closing.store(true, Ordering::Release);
                    self.send_close(CloseCode::GoingAway, "server shutting down").await;
                    close_deadline.get_or_insert(tokio::time::Instant::now() + self.config.close_timeout);
                }
                _ = async {
                    match close_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                }, if close_deadline.is_some() => {
                    tracing::debug!(peer = ?self.handle.peer, "peer did not answer close frame");
                    return Ok(CloseCode::Abnormal);
                }
            }

            while tasks.try_join_next().is_some() {}
        }
    }

    async fn process_buffered(
        &mut self,
        handler: &Arc<dyn MessageHandler>,
        tasks: &mut JoinSet<()>,
    ) -> Result<Flow> {
        while let Some(frame) = self.codec.parse(&mut self.read_buf)? {
            if let Flow::Closed(code) = self.on_frame(frame, handler, tasks).await? {
                return Ok(Flow::Closed(code));
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_frame(
        &mut self,
        frame: Frame,
        handler: &Arc<dyn MessageHandler>,
        tasks: &mut JoinSet<()>,
    ) -> Result<Flow> {
        match frame.opcode {
            OpCode::Ping => {
                if !self.close_sent {
                    self.write_frame(&Frame::pong(frame.payload)).await?;
                }
            }
            OpCode::Pong => {
                self.pongs.send_replace(Instant::now());
            }
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(Error::Protocol(
                        "new data frame while a fragmented message is open".to_string(),
                    ));
                }
                if frame.fin {
                    self.dispatch(frame.opcode, frame.rsv1, frame.payload, handler, tasks)?;
                } else {
                    self.check_size(frame.payload.len())?;
                    self.fragment = Some(Fragment {
                        opcode: frame.opcode,
                        compressed: frame.rsv1,
                        data: BytesMut::from(&frame.payload[..]),
                    });
                }
            }
            OpCode::Continuation => {
                if frame.rsv1 {
                    return Err(Error::Protocol("RSV1 on a continuation frame".to_string()));
                }
                let Some(fragment) = self.fragment.as_mut() else {
                    return Err(Error::Protocol("continuation without an open message".to_string()));
                };
                let total = fragment.data.len() + frame.payload.len();
                if total > self.config.max_message_size {
                    return Err(Error::MessageTooLarge(total));
                }
                fragment.data.extend_from_slice(&frame.payload);

                if frame.fin {
                    if let Some(done) = self.fragment.take() {
                        self.dispatch(done.opcode, done.compressed, done.data.freeze(), handler, tasks)?;
                    }
                }
            }
            OpCode::Close => {
                let (code, reason) = frame.close_reason()?;
                tracing::debug!(peer = ?self.handle.peer, code = %code, reason, "peer closed");
                self.handle.closing.store(true, Ordering::Release);
                if !self.close_sent {
                    // Echo the peer's code
                    let echo = if code == CloseCode::NoStatus {
                        Frame::new(OpCode::Close, Bytes::new(), true)
                    } else {
                        Frame::close(code, "")
                    };
                    self.close_sent = true;
                    let _ = self.write_frame(&echo).await;
                }
                return Ok(Flow::Closed(code));
            }
        }
        Ok(Flow::Continue)
    }

    fn check_size(&self, len: usize) -> Result<()> {
        if len > self.config.max_message_size {
            return Err(Error::MessageTooLarge(len));
        }
        Ok(())
    }

    /// Decode a complete message and hand it to its own task
    fn dispatch(
        &mut self,
        opcode: OpCode,
        compressed: bool,
        payload: Bytes,
        handler: &Arc<dyn MessageHandler>,
        tasks: &mut JoinSet<()>,
    ) -> Result<()> {
        let payload = match (compressed, self.deflate.as_mut()) {
            (true, Some(deflate)) => deflate.decompress(&payload, self.config.max_message_size)?,
            (true, None) => return Err(Error::Protocol("compressed message without extension".to_string())),
            (false, _) => payload,
        };
        self.check_size(payload.len())?;

        let message = match opcode {
            OpCode::Text => Message::Text(String::from_utf8(payload.to_vec()).map_err(|_| Error::InvalidUtf8)?),
            _ => Message::Binary(payload),
        };

        let handler = Arc::clone(handler);
        let ws = self.handle.clone();
        tasks.spawn(async move {
            handler.on_message(ws, message).await;
        });
        Ok(())
    }

    async fn send_message(&mut self, message: Message) -> Result<()> {
        if self.close_sent {
            return Ok(());
        }
        let (opcode, payload) = match message {
            Message::Text(text) => (OpCode::Text, Bytes::from(text)),
            Message::Binary(data) => (OpCode::Binary, data),
        };
        let (payload, compressed) = match self.deflate.as_mut() {
            Some(deflate) => (deflate.compress(&payload)?, true),
            None => (payload, false),
        };

        let mut out = BytesMut::with_capacity(payload.len() + 16);
        for frame in FrameCodec::fragment(opcode, payload, self.config.max_frame_size, compressed) {
            FrameCodec::encode(&frame, None, &mut out);
        }
        self.socket.send_all(&out).await?;
        Ok(())
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut out = BytesMut::with_capacity(frame.payload.len() + 4);
        FrameCodec::encode(frame, None, &mut out);
        self.socket.send_all(&out).await?;
        Ok(())
    }

    /// Best effort; at most one close frame per session
    async fn send_close(&mut self, code: CloseCode, reason: &str) {
        if self.close_sent || self.torn_down {
            return;
        }
        self.close_sent = true;
        let code = if code.is_sendable() { code } else { CloseCode::InternalError };
        if let Err(err) = self.write_frame(&Frame::close(code, reason)).await {
            tracing::debug!(error = %err, "close frame not delivered");
        }
    }

    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Err(err) = self.socket.close().await {
            crate::xsocket::log_error("websocket teardown", &err, true);
        }
    }

    fn spawn_heartbeat(&self) -> Option<JoinHandle<Error>> {
        if self.config.ping_interval.is_zero() {
            return None;
        }
        let handle = self.handle.clone();
        let pongs = self.pongs.subscribe();
        let config = self.config.clone();
        Some(tokio::spawn(heartbeat(handle, pongs, config)))
    }
}

/// Ping until the peer misses `max_missed_pongs` in a row
///
/// After a miss the wait before the next ping doubles, up to `backoff_cap`.
/// Returns the error that ends the session.
async fn heartbeat(ws: WsHandle, mut pongs: watch::Receiver<Instant>, config: SessionConfig) -> Error {
    let mut missed = 0u32;
    let mut wait = config.ping_interval;
    let mut sequence = 0u64;

    loop {
        tokio::time::sleep(wait).await;

        sequence += 1;
        pongs.borrow_and_update();
        if ws.ping(Bytes::copy_from_slice(&sequence.to_be_bytes())).is_err() {
            // Closing; the receive loop decides when the session ends
            return std::future::pending().await;
        }

        match tokio::time::timeout(config.pong_timeout, pongs.changed()).await {
            Ok(Ok(())) => {
                missed = 0;
                wait = config.ping_interval;
            }
            Ok(Err(_)) => return Error::Closed,
            Err(_) => {
                missed += 1;
                tracing::debug!(peer = ?ws.peer, missed, "pong missed");
                if missed >= config.max_missed_pongs {
                    tracing::info!(peer = ?ws.peer, missed, "closing unresponsive websocket");
                    return Error::HeartbeatTimeout(missed);
                }
                wait = config
                    .ping_interval
                    .saturating_mul(1u32 << missed.min(16))
                    .min(config.backoff_cap);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::BoxFuture;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Message>>,
        closed: Mutex<Option<CloseCode>>,
    }

    impl MessageHandler for Recorder {
        fn on_message<'a>(&'a self, ws: WsHandle, message: Message) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.messages.lock().push(message.clone());
                let _ = match message {
                    Message::Text(text) => ws.send_text(text),
                    Message::Binary(data) => ws.send_binary(data),
                };
            })
        }

        fn on_close(&self, code: CloseCode) {
            *self.closed.lock() = Some(code);
        }
    }

    struct Client {
        io: DuplexStream,
        buf: BytesMut,
        codec: FrameCodec,
    }

    impl Client {
        async fn send(&mut self, frame: Frame) {
            let mut out = BytesMut::new();
            FrameCodec::encode(&frame, Some([1, 2, 3, 4]), &mut out);
            self.io.write_all(&out).await.unwrap();
        }

        /// Next frame, or None once the server closed the pipe
        async fn next(&mut self) -> Option<Frame> {
            loop {
                if let Some(frame) = self.codec.parse(&mut self.buf).unwrap() {
                    return Some(frame);
                }
                let mut chunk = [0u8; 4096];
                let n = self.io.read(&mut chunk).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    fn quiet_config() -> SessionConfig {
        SessionConfig {
            ping_interval: Duration::ZERO,
            close_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        }
    }

    fn start(
        config: SessionConfig,
        deflate: Option<DeflateParams>,
    ) -> (Client, WsHandle, Arc<Recorder>, JoinHandle<Result<CloseCode>>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let session = WebSocketSession::new(server_io, config, deflate, Bytes::new(), None);
        let handle = session.handle();
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn MessageHandler> = recorder.clone();
        let task = tokio::spawn(session.run(handler));
        let client = Client {
            io: client_io,
            buf: BytesMut::new(),
            codec: FrameCodec::client(1 << 20, deflate.is_some()),
        };
        (client, handle, recorder, task)
    }

    #[tokio::test]
    async fn test_fragments_dispatch_once() {
        let (mut client, _handle, recorder, task) = start(quiet_config(), None);

        client.send(Frame::new(OpCode::Text, "Hel", false)).await;
        client.send(Frame::ping("mid")).await;
        client.send(Frame::new(OpCode::Continuation, "lo ", false)).await;
        client.send(Frame::new(OpCode::Continuation, "world", true)).await;

        let pong = client.next().await.unwrap();
        assert_eq!(pong.opcode, OpCode::Pong);
        assert_eq!(&pong.payload[..], b"mid");

        let echo = client.next().await.unwrap();
        assert_eq!(echo.opcode, OpCode::Text);
        assert_eq!(&echo.payload[..], b"Hello world");
        assert_eq!(*recorder.messages.lock(), vec![Message::Text("Hello world".to_string())]);

        client.send(Frame::close(CloseCode::Normal, "done")).await;
        let close = client.next().await.unwrap();
        assert_eq!(close.close_reason().unwrap().0, CloseCode::Normal);
        assert!(client.next().await.is_none());

        assert_eq!(task.await.unwrap().unwrap(), CloseCode::Normal);
        assert_eq!(*recorder.closed.lock(), Some(CloseCode::Normal));
    }

    #[tokio::test]
    async fn test_close_twice_tears_down_once() {
        let (mut client, handle, _recorder, task) = start(quiet_config(), None);

        handle.close(CloseCode::GoingAway, "restart").unwrap();
        handle.close(CloseCode::InternalError, "again").unwrap();
        assert!(handle.send_text("late").is_err());

        let close = client.next().await.unwrap();
        assert_eq!(close.opcode, OpCode::Close);
        assert_eq!(close.close_reason().unwrap(), (CloseCode::GoingAway, "restart".to_string()));

        client.send(Frame::close(CloseCode::GoingAway, "")).await;
        assert!(client.next().await.is_none());
        assert_eq!(task.await.unwrap().unwrap(), CloseCode::GoingAway);

        // After the session is gone closing is still harmless
        handle.close(CloseCode::Normal, "").unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_going_away() {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let (stop_tx, stop_rx) = watch::channel(false);
        let session = WebSocketSession::new(server_io, quiet_config(), None, Bytes::new(), None)
            .with_shutdown(stop_rx);
        let handle = session.handle();
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn MessageHandler> = recorder.clone();
        let task = tokio::spawn(session.run(handler));
        let mut client = Client {
            io: client_io,
            buf: BytesMut::new(),
            codec: FrameCodec::client(1 << 20, false),
        };

        client.send(Frame::new(OpCode::Text, "before", true)).await;
        assert_eq!(&client.next().await.unwrap().payload[..], b"before");

        stop_tx.send(true).unwrap();
        let close = client.next().await.unwrap();
        assert_eq!(close.opcode, OpCode::Close);
        assert_eq!(close.close_reason().unwrap().0, CloseCode::GoingAway);
        assert!(handle.send_text("late").is_err());

        client.send(Frame::close(CloseCode::GoingAway, "")).await;
        assert!(client.next().await.is_none());
        assert_eq!(task.await.unwrap().unwrap(), CloseCode::GoingAway);
        assert_eq!(*recorder.closed.lock(), Some(CloseCode::GoingAway));
    }

    #[tokio::test]
    async fn test_second_open_fragment_is_protocol_error() {
        let (mut client, _handle, recorder, task) = start(quiet_config(), None);

        client.send(Frame::new(OpCode::Binary, vec![1u8, 2], false)).await;
        client.send(Frame::new(OpCode::Text, "x", false)).await;

        let close = client.next().await.unwrap();
        assert_eq!(close.close_reason().unwrap().0, CloseCode::ProtocolError);
        assert!(client.next().await.is_none());
        assert!(matches!(task.await.unwrap(), Err(Error::Protocol(_))));
        assert!(recorder.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn test_continuation_without_fragment() {
        let (mut client, _handle, _recorder, task) = start(quiet_config(), None);
        client.send(Frame::new(OpCode::Continuation, "x", true)).await;
        let close = client.next().await.unwrap();
        assert_eq!(close.close_reason().unwrap().0, CloseCode::ProtocolError);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes_1007() {
        let (mut client, _handle, _recorder, task) = start(quiet_config(), None);
        client.send(Frame::new(OpCode::Text, vec![0xffu8, 0xfe], true)).await;
        let close = client.next().await.unwrap();
        assert_eq!(close.close_reason().unwrap().0, CloseCode::InvalidPayload);
        assert!(matches!(task.await.unwrap(), Err(Error::InvalidUtf8)));
    }

    #[tokio::test]
    async fn test_message_size_limit_closes_1009() {
        let config = SessionConfig {
            max_message_size: 8,
            max_frame_size: 8,
            ..quiet_config()
        };
        let (mut client, _handle, _recorder, task) = start(config, None);
        client.send(Frame::new(OpCode::Binary, vec![0u8; 6], false)).await;
        client.send(Frame::new(OpCode::Continuation, vec![0u8; 6], true)).await;
        let close = client.next().await.unwrap();
        assert_eq!(close.close_reason().unwrap().0, CloseCode::MessageTooBig);
        assert!(matches!(task.await.unwrap(), Err(Error::MessageTooLarge(12))));
    }

    #[tokio::test]
    async fn test_large_outbound_message_is_fragmented() {
        let config = SessionConfig {
            max_frame_size: 4,
            ..quiet_config()
        };
        let (mut client, handle, _recorder, _task) = start(config, None);
        handle.send_binary(Bytes::from_static(b"0123456789")).unwrap();

        let mut payload = Vec::new();
        let mut frames = 0;
        loop {
            let frame = client.next().await.unwrap();
            frames += 1;
            payload.extend_from_slice(&frame.payload);
            if frame.fin {
                break;
            }
        }
        assert_eq!(frames, 3);
        assert_eq!(payload, b"0123456789");
    }

    #[tokio::test]
    async fn test_deflate_roundtrip() {
        let params = DeflateParams::default();
        let (mut client, _handle, recorder, _task) = start(quiet_config(), Some(params));
        let mut client_deflate = PerMessageDeflate::new(params, 6);

        let text = "compress me ".repeat(50);
        let mut frame = Frame::new(OpCode::Text, client_deflate.compress(text.as_bytes()).unwrap(), true);
        frame.rsv1 = true;
        client.send(frame).await;

        let echo = client.next().await.unwrap();
        assert!(echo.rsv1);
        let inflated = client_deflate.decompress(&echo.payload, 1 << 20).unwrap();
        assert_eq!(&inflated[..], text.as_bytes());
        assert_eq!(*recorder.messages.lock(), vec![Message::Text(text)]);
    }

    #[tokio::test]
    async fn test_heartbeat_gives_up_after_missed_pongs() {
        let config = SessionConfig {
            ping_interval: Duration::from_millis(10),
            pong_timeout: Duration::from_millis(10),
            max_missed_pongs: 3,
            backoff_cap: Duration::from_millis(40),
            ..quiet_config()
        };
        let (mut client, _handle, _recorder, task) = start(config, None);

        let mut pings = 0;
        let close = loop {
            let frame = client.next().await.unwrap();
            match frame.opcode {
                OpCode::Ping => pings += 1,
                OpCode::Close => break frame,
                other => panic!("unexpected {:?}", other),
            }
        };
        assert_eq!(pings, 3);
        assert_eq!(close.close_reason().unwrap().0, CloseCode::GoingAway);
        assert!(matches!(task.await.unwrap(), Err(Error::HeartbeatTimeout(3))));
    }

    #[tokio::test]
    async fn test_pongs_keep_session_alive() {
        let config = SessionConfig {
            ping_interval: Duration::from_millis(10),
            pong_timeout: Duration::from_millis(200),
            max_missed_pongs: 1,
            ..quiet_config()
        };
        let (mut client, handle, _recorder, task) = start(config, None);

        for _ in 0..3 {
            let ping = client.next().await.unwrap();
            assert_eq!(ping.opcode, OpCode::Ping);
            client.send(Frame::pong(ping.payload)).await;
        }
        handle.close(CloseCode::Normal, "").unwrap();
        loop {
            let frame = client.next().await.unwrap();
            if frame.opcode == OpCode::Close {
                break;
            }
        }
        client.send(Frame::close(CloseCode::Normal, "")).await;
        assert_eq!(task.await.unwrap().unwrap(), CloseCode::Normal);
    }
}
