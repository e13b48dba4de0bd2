//! HTTP/2 stream state (RFC 7540 Section 5.1), server side
//!
//! Only peer-initiated (odd) streams exist: the server never pushes.

use super::error::{Error, ErrorCode, Result};
use super::flow_control::{RecvWindow, SendWindow};
use std::collections::HashMap;

/// Stream ID type
pub type StreamId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// The peer finished sending; we may still respond
    HalfClosedRemote,
    /// We finished responding; the peer may still send
    HalfClosedLocal,
    Closed,
}

impl StreamState {
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    pub(crate) send_window: SendWindow,
    pub(crate) recv_window: RecvWindow,
    headers_received: bool,
}

impl H2Stream {
    pub fn new(id: StreamId, send_initial: u32, recv_initial: u32) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            send_window: SendWindow::new(send_initial),
            recv_window: RecvWindow::new(recv_initial),
            headers_received: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// A HEADERS block arrived; the first one opens the stream, a later one is trailers
    pub fn receive_headers(&mut self, end_stream: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
            }
            StreamState::Open | StreamState::HalfClosedLocal if end_stream => {
                self.remote_end();
            }
            StreamState::Open | StreamState::HalfClosedLocal => {
                // Trailers must end the stream
                return Err(self.error(ErrorCode::ProtocolError));
            }
            _ => return Err(Error::StreamClosed(self.id)),
        }
        self.headers_received = true;
        Ok(())
    }

    /// A DATA frame of `len` flow-controlled bytes arrived
    pub fn receive_data(&mut self, len: usize, end_stream: bool) -> Result<()> {
        if !self.state.can_receive() {
            return Err(Error::StreamClosed(self.id));
        }
        self.recv_window
            .receive(len)
            .map_err(|_| self.error(ErrorCode::FlowControlError))?;
        if end_stream {
            self.remote_end();
        }
        Ok(())
    }

    pub fn send_headers(&mut self, end_stream: bool) -> Result<()> {
        if !self.state.can_send() {
            return Err(Error::StreamClosed(self.id));
        }
        if end_stream {
            self.local_end();
        }
        Ok(())
    }

    pub fn send_data(&mut self, len: usize, end_stream: bool) -> Result<()> {
        if !self.state.can_send() {
            return Err(Error::StreamClosed(self.id));
        }
        self.send_window.consume(len);
        if end_stream {
            self.local_end();
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
    }

    fn remote_end(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedLocal => StreamState::Closed,
            _ => StreamState::HalfClosedRemote,
        };
    }

    fn local_end(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedRemote => StreamState::Closed,
            _ => StreamState::HalfClosedLocal,
        };
    }

    fn error(&self, code: ErrorCode) -> Error {
        Error::Stream {
            stream_id: self.id,
            code,
        }
    }
}

/// The streams of one connection
#[derive(Debug)]
pub struct StreamManager {
    streams: HashMap<StreamId, H2Stream>,
    /// Highest stream id the peer opened, reported in GOAWAY
    last_remote_id: StreamId,
    max_concurrent_streams: Option<u32>,
}

impl StreamManager {
    pub fn new(max_concurrent_streams: Option<u32>) -> Self {
        StreamManager {
            streams: HashMap::new(),
            last_remote_id: 0,
            max_concurrent_streams,
        }
    }

    pub fn last_remote_id(&self) -> StreamId {
        self.last_remote_id
    }

    /// Open a stream the peer initiated
    ///
    /// The id must be odd and larger than every id seen so far. A stream over
    /// the concurrency limit still consumes its id and is refused.
    pub fn open_remote(
        &mut self,
        stream_id: StreamId,
        send_initial: u32,
        recv_initial: u32,
    ) -> Result<&mut H2Stream> {
        if stream_id % 2 == 0 {
            return Err(Error::Protocol(format!(
                "client opened even stream {}",
                stream_id
            )));
        }
        if stream_id <= self.last_remote_id {
            return Err(Error::Protocol(format!(
                "stream {} not above last stream {}",
                stream_id, self.last_remote_id
            )));
        }
        self.last_remote_id = stream_id;

        if let Some(max) = self.max_concurrent_streams {
            if self.active_count() >= max as usize {
                return Err(Error::RefusedStream(stream_id));
            }
        }

        let stream = self
            .streams
            .entry(stream_id)
            .or_insert_with(|| H2Stream::new(stream_id, send_initial, recv_initial));
        Ok(stream)
    }

    /// Whether an id was never opened by the peer
    pub fn is_idle(&self, stream_id: StreamId) -> bool {
        stream_id > self.last_remote_id
    }

    pub fn get(&self, stream_id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&stream_id)
    }

    pub fn remove(&mut self, stream_id: StreamId) -> Option<H2Stream> {
        self.streams.remove(&stream_id)
    }

    pub fn active_count(&self) -> usize {
        self.streams.values().filter(|s| !s.state().is_closed()).count()
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Apply a change of the peer's initial window size to every open stream
    pub fn adjust_send_windows(&mut self, delta: i64) -> Result<()> {
        for stream in self.streams.values_mut() {
            stream.send_window.adjust(delta)?;
        }
        Ok(())
    }

    /// Forget streams that reached the closed state
    pub fn cleanup_closed(&mut self) {
        self.streams.retain(|_, stream| !stream.state().is_closed());
    }
}
