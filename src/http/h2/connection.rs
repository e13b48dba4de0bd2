//! Sans-io HTTP/2 server connection
//!
//! [`H2Connection`] owns every piece of protocol state for one connection:
//! SETTINGS on both sides, HPACK contexts, stream states and flow-control
//! windows. It never touches a socket. Received bytes go into
//! [`H2Connection::receive_data`], which returns [`Event`]s; frames produced by
//! the `send_*` operations accumulate until [`H2Connection::data_to_send`]
//! takes them.

use super::codec::{FrameCodec, FrameDecoder};
use super::error::{Error, ErrorCode, Result};
use super::events::Event;
use super::flow_control::{RecvWindow, SendWindow};
use super::frames::*;
use super::settings::{Settings, SettingsBuilder};
use super::stream::{StreamId, StreamManager, StreamState};
use super::{
    CONNECTION_PREFACE, CONNECTION_STREAM_ID, DEFAULT_HEADER_TABLE_SIZE,
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE,
};
use crate::http::Headers;
use bytes::{BufMut, Bytes, BytesMut};
use hpack::{Decoder as HpackDecoder, Encoder as HpackEncoder};

/// Upper bound on a header block reassembled from CONTINUATION frames
const MAX_HEADER_BLOCK: usize = 256 * 1024;

/// Response headers that have no meaning in HTTP/2 (RFC 7540 Section 8.1.2.2)
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Server-side limits advertised in our SETTINGS
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub initial_window_size: u32,
    pub max_concurrent_streams: u32,
    pub max_frame_size: u32,
    pub header_table_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_concurrent_streams: 100,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_header_list_size: None,
        }
    }
}

impl ConnectionConfig {
    fn local_settings(&self) -> Result<Settings> {
        let mut builder = SettingsBuilder::new()
            .enable_push(false)
            .max_concurrent_streams(self.max_concurrent_streams)
            .initial_window_size(self.initial_window_size)
            .max_frame_size(self.max_frame_size)
            // The HPACK decoder keeps the default table size
            .header_table_size(self.header_table_size.min(DEFAULT_HEADER_TABLE_SIZE));
        if let Some(size) = self.max_header_list_size {
            builder = builder.max_header_list_size(size);
        }
        builder.build()
    }
}

/// A header block waiting for its CONTINUATION frames
#[derive(Debug)]
struct PendingHeaders {
    stream_id: StreamId,
    block: BytesMut,
    end_stream: bool,
}

pub struct H2Connection {
    config: ConnectionConfig,
    local: Settings,
    remote: Settings,
    decoder: FrameDecoder,
    outbound: BytesMut,
    preface_received: bool,
    settings_received: bool,
    hpack_encoder: HpackEncoder<'static>,
    hpack_decoder: HpackDecoder<'static>,
    streams: StreamManager,
    send_window: SendWindow,
    recv_window: RecvWindow,
    continuation: Option<PendingHeaders>,
    goaway_sent: bool,
    goaway_received: bool,
}

impl H2Connection {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        let local = config.local_settings()?;
        let recv_initial = config.initial_window_size.max(DEFAULT_INITIAL_WINDOW_SIZE);
        Ok(H2Connection {
            decoder: FrameDecoder::new(config.max_frame_size as usize),
            streams: StreamManager::new(Some(config.max_concurrent_streams)),
            local,
            remote: Settings::new(),
            outbound: BytesMut::with_capacity(16 * 1024),
            preface_received: false,
            settings_received: false,
            hpack_encoder: HpackEncoder::new(),
            hpack_decoder: HpackDecoder::new(),
            send_window: SendWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            recv_window: RecvWindow::new(recv_initial),
            continuation: None,
            goaway_sent: false,
            goaway_received: false,
            config,
        })
    }

    /// Queue the server connection preface: our SETTINGS, plus a connection
    /// WINDOW_UPDATE when the configured window exceeds the protocol default
    pub fn initiate_connection(&mut self) {
        let frame = SettingsFrame::new(self.local.clone());
        self.outbound.put_slice(&FrameCodec::encode_settings_frame(&frame));

        let initial = self.config.initial_window_size;
        if initial > DEFAULT_INITIAL_WINDOW_SIZE {
            let update = WindowUpdateFrame::new(CONNECTION_STREAM_ID, initial - DEFAULT_INITIAL_WINDOW_SIZE);
            self.outbound.put_slice(&FrameCodec::encode_window_update_frame(&update));
        }
    }

    /// Start a connection reached through an h2c upgrade
    ///
    /// `http2_settings` is the `HTTP2-Settings` header of the upgrade request.
    /// The upgrading request itself becomes stream 1, already half-closed by
    /// the client, so the response goes out on stream 1.
    pub fn initiate_upgrade(&mut self, http2_settings: Option<&str>) -> Result<()> {
        if let Some(value) = http2_settings {
            let settings = Settings::from_base64url(value)?;
            self.apply_remote_settings(&settings)?;
        }
        self.settings_received = true;
        self.initiate_connection();

        let send_initial = self.remote.initial_window_size();
        let recv_initial = self.config.initial_window_size;
        let stream = self.streams.open_remote(1, send_initial, recv_initial)?;
        stream.receive_headers(true)?;
        Ok(())
    }

    /// Feed bytes read from the socket
    ///
    /// Stream errors reset the offending stream and surface as
    /// [`Event::StreamReset`]. Connection errors queue a GOAWAY and are
    /// returned; the caller flushes [`H2Connection::data_to_send`] and closes.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<Vec<Event>> {
        self.decoder.feed(data);
        let mut events = Vec::new();

        if !self.preface_received {
            let buffered = self.decoder.peek();
            let n = buffered.len().min(CONNECTION_PREFACE.len());
            if buffered[..n] != CONNECTION_PREFACE[..n] {
                self.close_connection(ErrorCode::ProtocolError);
                return Err(Error::MissingPreface);
            }
            if n < CONNECTION_PREFACE.len() {
                return Ok(events);
            }
            self.decoder.take_buffered(CONNECTION_PREFACE.len());
            self.preface_received = true;
        }

        loop {
            let frame = match self.decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    self.close_connection(err.code());
                    return Err(err);
                }
            };

            if let Err(err) = self.process_frame(frame, &mut events) {
                match err.stream_id() {
                    Some(stream_id) => {
                        tracing::debug!(stream_id, error = %err, "resetting stream");
                        let error_code = err.code();
                        self.reset_stream(stream_id, error_code);
                        events.push(Event::StreamReset {
                            stream_id,
                            error_code,
                            remote: false,
                        });
                    }
                    None => {
                        self.close_connection(err.code());
                        return Err(err);
                    }
                }
            }
        }

        Ok(events)
    }

    fn process_frame(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        if !self.settings_received && frame.frame_type != FrameType::Settings {
            return Err(Error::Protocol(format!(
                "first frame is {} instead of SETTINGS",
                frame.frame_type
            )));
        }

        if let Some(pending) = &self.continuation {
            if frame.frame_type != FrameType::Continuation || frame.stream_id != pending.stream_id {
                return Err(Error::Protocol(format!(
                    "{} frame interrupts header block of stream {}",
                    frame.frame_type, pending.stream_id
                )));
            }
        }

        tracing::trace!(
            frame_type = %frame.frame_type,
            stream_id = frame.stream_id,
            len = frame.payload_len(),
            "received frame"
        );

        match frame.frame_type {
            FrameType::Data => self.on_data(&frame, events),
            FrameType::Headers => {
                let headers = HeadersFrame::parse(&frame)?;
                if headers.end_headers {
                    self.on_header_block(headers.stream_id, &headers.header_block, headers.end_stream, events)
                } else {
                    let mut block = BytesMut::with_capacity(headers.header_block.len() * 2);
                    block.put_slice(&headers.header_block);
                    self.continuation = Some(PendingHeaders {
                        stream_id: headers.stream_id,
                        block,
                        end_stream: headers.end_stream,
                    });
                    Ok(())
                }
            }
            FrameType::Continuation => {
                let Some(mut pending) = self.continuation.take() else {
                    return Err(Error::Protocol("CONTINUATION without HEADERS".to_string()));
                };
                pending.block.put_slice(&frame.payload);
                if pending.block.len() > MAX_HEADER_BLOCK {
                    return Err(Error::Protocol(format!(
                        "header block exceeds {} bytes",
                        MAX_HEADER_BLOCK
                    )));
                }
                if frame.flags.is_end_headers() {
                    self.on_header_block(pending.stream_id, &pending.block, pending.end_stream, events)
                } else {
                    self.continuation = Some(pending);
                    Ok(())
                }
            }
            FrameType::Priority => check_priority_frame(&frame).map(|_| ()),
            FrameType::RstStream => {
                let rst = RstStreamFrame::parse(&frame)?;
                if self.streams.is_idle(rst.stream_id) {
                    return Err(Error::Protocol(format!(
                        "RST_STREAM on idle stream {}",
                        rst.stream_id
                    )));
                }
                if let Some(mut stream) = self.streams.remove(rst.stream_id) {
                    stream.reset();
                    events.push(Event::StreamReset {
                        stream_id: rst.stream_id,
                        error_code: rst.error_code,
                        remote: true,
                    });
                }
                Ok(())
            }
            FrameType::Settings => {
                let settings = SettingsFrame::parse(&frame)?;
                if settings.ack {
                    events.push(Event::SettingsAcknowledged);
                } else {
                    self.settings_received = true;
                    self.apply_remote_settings(&settings.settings)?;
                    self.outbound
                        .put_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()));
                    events.push(Event::RemoteSettingsChanged {
                        changed: settings.settings,
                    });
                }
                Ok(())
            }
            FrameType::PushPromise => Err(Error::Protocol("client sent PUSH_PROMISE".to_string())),
            FrameType::Ping => {
                let ping = PingFrame::parse(&frame)?;
                if !ping.ack {
                    self.outbound
                        .put_slice(&FrameCodec::encode_ping_frame(&PingFrame::ack(ping.data)));
                }
                Ok(())
            }
            FrameType::Goaway => {
                let goaway = GoawayFrame::parse(&frame)?;
                self.goaway_received = true;
                events.push(Event::ConnectionTerminated {
                    error_code: goaway.error_code,
                    last_stream_id: goaway.last_stream_id,
                });
                Ok(())
            }
            FrameType::WindowUpdate => self.on_window_update(&frame, events),
        }
    }

    fn on_data(&mut self, frame: &Frame, events: &mut Vec<Event>) -> Result<()> {
        let data = DataFrame::parse(frame)?;
        self.recv_window.receive(data.flow_controlled_len)?;

        let Some(stream) = self.streams.get_mut(data.stream_id) else {
            if self.streams.is_idle(data.stream_id) {
                return Err(Error::Protocol(format!("DATA on idle stream {}", data.stream_id)));
            }
            // The bytes still count against the connection window
            self.acknowledge_connection(data.flow_controlled_len);
            return Err(Error::StreamClosed(data.stream_id));
        };

        if let Err(err) = stream.receive_data(data.flow_controlled_len, data.end_stream) {
            self.acknowledge_connection(data.flow_controlled_len);
            return Err(err);
        }

        if data.flow_controlled_len > 0 {
            events.push(Event::DataReceived {
                stream_id: data.stream_id,
                data: data.data,
                flow_controlled_length: data.flow_controlled_len,
            });
        }
        if data.end_stream {
            events.push(Event::StreamEnded {
                stream_id: data.stream_id,
            });
        }
        Ok(())
    }

    fn on_header_block(
        &mut self,
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        // Decoded even for refused streams so the HPACK context stays in sync
        let decoded = self
            .hpack_decoder
            .decode(block)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))?;
        let headers: Vec<(String, String)> = decoded
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect();

        if let Some(stream) = self.streams.get_mut(stream_id) {
            // Trailers
            stream.receive_headers(end_stream)?;
            if end_stream {
                events.push(Event::StreamEnded { stream_id });
            }
            return Ok(());
        }

        if !self.streams.is_idle(stream_id) {
            return Err(Error::StreamClosed(stream_id));
        }
        if self.goaway_sent {
            tracing::debug!(stream_id, "ignoring new stream after GOAWAY");
            return Ok(());
        }

        let send_initial = self.remote.initial_window_size();
        let recv_initial = self.config.initial_window_size;
        let stream = self.streams.open_remote(stream_id, send_initial, recv_initial)?;
        stream.receive_headers(end_stream)?;
        validate_request_headers(stream_id, &headers)?;

        events.push(Event::RequestReceived { stream_id, headers });
        if end_stream {
            events.push(Event::StreamEnded { stream_id });
        }
        Ok(())
    }

    fn on_window_update(&mut self, frame: &Frame, events: &mut Vec<Event>) -> Result<()> {
        let update = WindowUpdateFrame::parse(frame)?;
        if update.stream_id == CONNECTION_STREAM_ID {
            self.send_window.increase(update.size_increment)?;
        } else if let Some(stream) = self.streams.get_mut(update.stream_id) {
            stream
                .send_window
                .increase(update.size_increment)
                .map_err(|_| Error::Stream {
                    stream_id: update.stream_id,
                    code: ErrorCode::FlowControlError,
                })?;
        } else if self.streams.is_idle(update.stream_id) {
            return Err(Error::Protocol(format!(
                "WINDOW_UPDATE on idle stream {}",
                update.stream_id
            )));
        } else {
            // Closed stream; nothing waits on it
            return Ok(());
        }

        events.push(Event::WindowUpdated {
            stream_id: update.stream_id,
            delta: update.size_increment,
        });
        Ok(())
    }

    fn apply_remote_settings(&mut self, settings: &Settings) -> Result<()> {
        if let Some(new_initial) = settings.initial_window_size {
            let delta = new_initial as i64 - self.remote.initial_window_size() as i64;
            if delta != 0 {
                self.streams.adjust_send_windows(delta)?;
            }
        }
        self.remote.merge(settings);
        Ok(())
    }

    /// Queue response headers on a stream
    ///
    /// Names are lowercased and connection-specific fields dropped.
    pub fn send_headers(
        &mut self,
        stream_id: StreamId,
        status: u16,
        headers: &Headers,
        end_stream: bool,
    ) -> Result<()> {
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::StreamClosed(stream_id))?;
        stream.send_headers(end_stream)?;
        let closed = stream.state().is_closed();

        let status = status.to_string();
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(headers.len() + 1);
        fields.push((b":status".to_vec(), status.into_bytes()));
        for (name, value) in headers.iter() {
            let name = name.to_ascii_lowercase();
            if CONNECTION_SPECIFIC.contains(&name.as_str()) {
                continue;
            }
            fields.push((name.into_bytes(), value.as_bytes().to_vec()));
        }

        let mut block = Vec::with_capacity(256);
        self.hpack_encoder
            .encode_into(
                fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())),
                &mut block,
            )
            .map_err(|e| Error::Internal(format!("HPACK encode error: {}", e)))?;

        let max = self.max_outbound_frame_size();
        self.outbound
            .put_slice(&FrameCodec::encode_header_block(stream_id, &block, end_stream, max));
        if closed {
            self.streams.remove(stream_id);
        }
        Ok(())
    }

    /// Queue one DATA frame
    ///
    /// The payload must fit both [`H2Connection::local_flow_control_window`]
    /// and [`H2Connection::max_outbound_frame_size`].
    pub fn send_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) -> Result<()> {
        let max = self.max_outbound_frame_size();
        if data.len() > max {
            return Err(Error::FrameSize(format!(
                "DATA of {} bytes exceeds peer limit {}",
                data.len(),
                max
            )));
        }
        let available = self.local_flow_control_window(stream_id)?;
        if data.len() > available {
            return Err(Error::WindowExceeded {
                stream_id,
                requested: data.len(),
                available,
            });
        }

        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::StreamClosed(stream_id))?;
        stream.send_data(data.len(), end_stream)?;
        let closed = stream.state().is_closed();
        self.send_window.consume(data.len());

        let frame = DataFrame::new(stream_id, Bytes::copy_from_slice(data), end_stream);
        self.outbound.put_slice(&FrameCodec::encode_data_frame(&frame));
        if closed {
            self.streams.remove(stream_id);
        }
        Ok(())
    }

    /// Bytes that may be sent on a stream right now
    pub fn local_flow_control_window(&self, stream_id: StreamId) -> Result<usize> {
        let stream = self
            .streams
            .get(stream_id)
            .ok_or(Error::StreamClosed(stream_id))?;
        Ok(stream
            .send_window
            .available()
            .min(self.send_window.available()))
    }

    /// Largest DATA payload the peer accepts
    pub fn max_outbound_frame_size(&self) -> usize {
        self.remote.max_frame_size() as usize
    }

    /// Hand processed body bytes back to the peer's send window
    pub fn acknowledge_received_data(&mut self, stream_id: StreamId, len: usize) {
        self.acknowledge_connection(len);
        if let Some(stream) = self.streams.get_mut(stream_id) {
            if stream.state().can_receive() {
                if let Some(increment) = stream.recv_window.acknowledge(len) {
                    let update = WindowUpdateFrame::new(stream_id, increment);
                    self.outbound
                        .put_slice(&FrameCodec::encode_window_update_frame(&update));
                }
            }
        }
    }

    fn acknowledge_connection(&mut self, len: usize) {
        if let Some(increment) = self.recv_window.acknowledge(len) {
            let update = WindowUpdateFrame::new(CONNECTION_STREAM_ID, increment);
            self.outbound
                .put_slice(&FrameCodec::encode_window_update_frame(&update));
        }
    }

    /// Queue RST_STREAM and forget the stream
    pub fn reset_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        if let Some(mut stream) = self.streams.remove(stream_id) {
            stream.reset();
        }
        let frame = RstStreamFrame {
            stream_id,
            error_code,
        };
        self.outbound
            .put_slice(&FrameCodec::encode_rst_stream_frame(&frame));
    }

    /// Queue GOAWAY; later calls do nothing
    pub fn close_connection(&mut self, error_code: ErrorCode) {
        if self.goaway_sent {
            return;
        }
        self.goaway_sent = true;
        self.continuation = None;
        let frame = GoawayFrame::new(self.streams.last_remote_id(), error_code, Bytes::new());
        self.outbound.put_slice(&FrameCodec::encode_goaway_frame(&frame));
    }

    /// Take every frame queued so far
    pub fn data_to_send(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    pub fn has_data_to_send(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Either side sent GOAWAY
    pub fn is_closing(&self) -> bool {
        self.goaway_sent || self.goaway_received
    }

    pub fn stream_state(&self, stream_id: StreamId) -> Option<StreamState> {
        self.streams.get(stream_id).map(|s| s.state())
    }

    pub fn open_streams(&self) -> usize {
        self.streams.active_count()
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote
    }
}

/// Request pseudo-header rules from RFC 7540 Section 8.1.2
fn validate_request_headers(stream_id: StreamId, headers: &[(String, String)]) -> Result<()> {
    let malformed = || Error::Stream {
        stream_id,
        code: ErrorCode::ProtocolError,
    };

    let mut seen_regular = false;
    let mut method = None;
    let mut has_path = false;
    for (name, value) in headers {
        if let Some(pseudo) = name.strip_prefix(':') {
            if seen_regular {
                return Err(malformed());
            }
            match pseudo {
                "method" => method = Some(value.as_str()),
                "path" => has_path = !value.is_empty(),
                "scheme" | "authority" | "protocol" => {}
                _ => return Err(malformed()),
            }
        } else {
            seen_regular = true;
            if name.bytes().any(|b| b.is_ascii_uppercase())
                || CONNECTION_SPECIFIC[..3].contains(&name.as_str())
                || (name == "te" && value != "trailers")
            {
                return Err(malformed());
            }
        }
    }

    match method {
        Some("CONNECT") => Ok(()),
        Some(_) if has_path => Ok(()),
        _ => Err(malformed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal client side for driving the connection in tests
    struct Peer {
        encoder: HpackEncoder<'static>,
        decoder: HpackDecoder<'static>,
        frames: FrameDecoder,
    }

    impl Peer {
        fn new() -> Self {
            Peer {
                encoder: HpackEncoder::new(),
                decoder: HpackDecoder::new(),
                frames: FrameDecoder::new(1 << 20),
            }
        }

        fn preface(&self, settings: Settings) -> Vec<u8> {
            let mut out = CONNECTION_PREFACE.to_vec();
            out.extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::new(settings)));
            out
        }

        fn request(&mut self, stream_id: u32, method: &str, path: &str, end_stream: bool) -> Vec<u8> {
            let fields: Vec<(&[u8], &[u8])> = vec![
                (&b":method"[..], method.as_bytes()),
                (&b":scheme"[..], &b"http"[..]),
                (&b":path"[..], path.as_bytes()),
                (&b":authority"[..], &b"localhost"[..]),
            ];
            let block = self.encoder.encode(fields);
            FrameCodec::encode_header_block(stream_id, &block, end_stream, 16384).to_vec()
        }

        fn read(&mut self, bytes: &[u8]) -> Vec<Frame> {
            self.frames.feed(bytes);
            let mut out = Vec::new();
            while let Some(frame) = self.frames.next_frame().unwrap() {
                out.push(frame);
            }
            out
        }

        fn headers(&mut self, frame: &Frame) -> Vec<(String, String)> {
            self.decoder
                .decode(&frame.payload)
                .unwrap()
                .into_iter()
                .map(|(n, v)| {
                    (
                        String::from_utf8(n).unwrap(),
                        String::from_utf8(v).unwrap(),
                    )
                })
                .collect()
        }
    }

    fn connected(config: ConnectionConfig, peer: &mut Peer, settings: Settings) -> H2Connection {
        let mut conn = H2Connection::new(config).unwrap();
        conn.initiate_connection();
        conn.receive_data(&peer.preface(settings)).unwrap();
        conn.data_to_send();
        conn
    }

    #[test]
    fn test_preface_and_settings_ack() {
        let mut peer = Peer::new();
        let mut conn = H2Connection::new(ConnectionConfig::default()).unwrap();
        conn.initiate_connection();

        let preface = peer.preface(Settings::new());
        // Split inside the magic string
        assert!(conn.receive_data(&preface[..10]).unwrap().is_empty());
        let events = conn.receive_data(&preface[10..]).unwrap();
        assert!(matches!(events[0], Event::RemoteSettingsChanged { .. }));

        let frames = peer.read(&conn.data_to_send());
        assert_eq!(frames[0].frame_type, FrameType::Settings);
        assert!(!frames[0].flags.is_ack());
        assert_eq!(frames[1].frame_type, FrameType::Settings);
        assert!(frames[1].flags.is_ack());
    }

    #[test]
    fn test_bad_preface_sends_goaway() {
        let mut conn = H2Connection::new(ConnectionConfig::default()).unwrap();
        let err = conn.receive_data(b"GET / HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::MissingPreface));

        let mut peer = Peer::new();
        let frames = peer.read(&conn.data_to_send());
        assert_eq!(frames.last().unwrap().frame_type, FrameType::Goaway);
    }

    #[test]
    fn test_request_events() {
        let mut peer = Peer::new();
        let mut conn = connected(ConnectionConfig::default(), &mut peer, Settings::new());

        let mut bytes = peer.request(1, "POST", "/upload", false);
        bytes.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from_static(b"body"),
            true,
        )));
        let events = conn.receive_data(&bytes).unwrap();

        match &events[0] {
            Event::RequestReceived { stream_id, headers } => {
                assert_eq!(*stream_id, 1);
                assert_eq!(headers[0], (":method".to_string(), "POST".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            &events[1],
            Event::DataReceived { stream_id: 1, data, flow_controlled_length: 4 } if &data[..] == b"body"
        ));
        assert!(matches!(events[2], Event::StreamEnded { stream_id: 1 }));
        assert_eq!(conn.stream_state(1), Some(StreamState::HalfClosedRemote));
    }

    #[test]
    fn test_response_headers_and_data() {
        let mut peer = Peer::new();
        let mut conn = connected(ConnectionConfig::default(), &mut peer, Settings::new());
        conn.receive_data(&peer.request(1, "GET", "/", true)).unwrap();

        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        headers.insert("Connection", "keep-alive");
        conn.send_headers(1, 200, &headers, false).unwrap();
        conn.send_data(1, b"hello", false).unwrap();
        conn.send_data(1, b"", true).unwrap();
        assert_eq!(conn.stream_state(1), None);

        let frames = peer.read(&conn.data_to_send());
        assert_eq!(frames[0].frame_type, FrameType::Headers);
        let fields = peer.headers(&frames[0]);
        assert_eq!(fields[0], (":status".to_string(), "200".to_string()));
        assert!(fields.iter().any(|(n, v)| n == "content-type" && v == "text/plain"));
        assert!(!fields.iter().any(|(n, _)| n == "connection"));

        assert_eq!(&frames[1].payload[..], b"hello");
        assert!(frames[2].flags.is_end_stream());
        assert_eq!(frames[2].payload_len(), 0);
    }

    #[test]
    fn test_send_data_respects_window() {
        let mut peer = Peer::new();
        let settings = SettingsBuilder::new().initial_window_size(10).build().unwrap();
        let mut conn = connected(ConnectionConfig::default(), &mut peer, settings);
        conn.receive_data(&peer.request(1, "GET", "/", true)).unwrap();
        conn.send_headers(1, 200, &Headers::new(), false).unwrap();

        assert_eq!(conn.local_flow_control_window(1).unwrap(), 10);
        conn.send_data(1, b"0123456789", false).unwrap();
        assert_eq!(conn.local_flow_control_window(1).unwrap(), 0);
        assert!(matches!(
            conn.send_data(1, b"x", false),
            Err(Error::WindowExceeded { .. })
        ));

        let update = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(1, 5));
        let events = conn.receive_data(&update).unwrap();
        assert!(matches!(events[0], Event::WindowUpdated { stream_id: 1, delta: 5 }));
        assert_eq!(conn.local_flow_control_window(1).unwrap(), 5);
    }

    #[test]
    fn test_initial_window_change_adjusts_streams() {
        let mut peer = Peer::new();
        let mut conn = connected(ConnectionConfig::default(), &mut peer, Settings::new());
        conn.receive_data(&peer.request(1, "GET", "/", true)).unwrap();
        assert_eq!(conn.local_flow_control_window(1).unwrap(), 65535);

        let smaller = SettingsBuilder::new().initial_window_size(1000).build().unwrap();
        let frame = FrameCodec::encode_settings_frame(&SettingsFrame::new(smaller));
        conn.receive_data(&frame).unwrap();
        assert_eq!(conn.local_flow_control_window(1).unwrap(), 1000);
    }

    #[test]
    fn test_max_concurrent_streams_refused() {
        let mut peer = Peer::new();
        let config = ConnectionConfig {
            max_concurrent_streams: 1,
            ..ConnectionConfig::default()
        };
        let mut conn = connected(config, &mut peer, Settings::new());
        conn.receive_data(&peer.request(1, "GET", "/a", true)).unwrap();
        let events = conn.receive_data(&peer.request(3, "GET", "/b", true)).unwrap();

        assert!(matches!(
            events[0],
            Event::StreamReset {
                stream_id: 3,
                error_code: ErrorCode::RefusedStream,
                remote: false
            }
        ));
        let frames = peer.read(&conn.data_to_send());
        assert_eq!(frames[0].frame_type, FrameType::RstStream);
        assert_eq!(&frames[0].payload[..], &[0, 0, 0, 7]);
    }

    #[test]
    fn test_continuation_reassembly() {
        let mut peer = Peer::new();
        let mut conn = connected(ConnectionConfig::default(), &mut peer, Settings::new());
        let fields: Vec<(&[u8], &[u8])> = vec![
            (&b":method"[..], &b"GET"[..]),
            (&b":scheme"[..], &b"http"[..]),
            (&b":path"[..], &b"/split"[..]),
            (&b"x-long"[..], &[b'a'; 64][..]),
        ];
        let block = peer.encoder.encode(fields);
        let bytes = FrameCodec::encode_header_block(1, &block, true, 16);

        let events = conn.receive_data(&bytes).unwrap();
        match &events[0] {
            Event::RequestReceived { headers, .. } => {
                assert!(headers.iter().any(|(n, v)| n == ":path" && v == "/split"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_interrupted_header_block_is_connection_error() {
        let mut peer = Peer::new();
        let mut conn = connected(ConnectionConfig::default(), &mut peer, Settings::new());
        let headers = HeadersFrame::new(1, Bytes::from_static(b"\x82"), false, false);
        let mut bytes = FrameCodec::encode_headers_frame(&headers).to_vec();
        bytes.extend_from_slice(&FrameCodec::encode_ping_frame(&PingFrame::new([0; 8])));
        assert!(matches!(conn.receive_data(&bytes), Err(Error::Protocol(_))));
        assert!(conn.is_closing());
    }

    #[test]
    fn test_ping_is_acknowledged() {
        let mut peer = Peer::new();
        let mut conn = connected(ConnectionConfig::default(), &mut peer, Settings::new());
        conn.receive_data(&FrameCodec::encode_ping_frame(&PingFrame::new(*b"pingpong")))
            .unwrap();
        let frames = peer.read(&conn.data_to_send());
        assert_eq!(frames[0].frame_type, FrameType::Ping);
        assert!(frames[0].flags.is_ack());
        assert_eq!(&frames[0].payload[..], b"pingpong");
    }

    #[test]
    fn test_receive_window_replenished() {
        let mut peer = Peer::new();
        let mut conn = connected(ConnectionConfig::default(), &mut peer, Settings::new());
        let mut bytes = peer.request(1, "POST", "/", false);
        let chunk = vec![0u8; 16384];
        for _ in 0..2 {
            bytes.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(
                1,
                Bytes::from(chunk.clone()),
                false,
            )));
        }
        conn.receive_data(&bytes).unwrap();
        conn.acknowledge_received_data(1, 32768);

        let frames = peer.read(&conn.data_to_send());
        let updates: Vec<&Frame> = frames
            .iter()
            .filter(|f| f.frame_type == FrameType::WindowUpdate)
            .collect();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].stream_id, 0);
        assert_eq!(updates[1].stream_id, 1);
        assert_eq!(&updates[1].payload[..], &32768u32.to_be_bytes());
    }

    #[test]
    fn test_peer_reset_and_goaway() {
        let mut peer = Peer::new();
        let mut conn = connected(ConnectionConfig::default(), &mut peer, Settings::new());
        conn.receive_data(&peer.request(1, "GET", "/", false)).unwrap();

        let rst = FrameCodec::encode_rst_stream_frame(&RstStreamFrame {
            stream_id: 1,
            error_code: ErrorCode::Cancel,
        });
        let events = conn.receive_data(&rst).unwrap();
        assert!(matches!(
            events[0],
            Event::StreamReset { stream_id: 1, error_code: ErrorCode::Cancel, remote: true }
        ));
        assert!(conn.send_headers(1, 200, &Headers::new(), true).is_err());

        let goaway = FrameCodec::encode_goaway_frame(&GoawayFrame::new(0, ErrorCode::NoError, Bytes::new()));
        let events = conn.receive_data(&goaway).unwrap();
        assert!(matches!(events[0], Event::ConnectionTerminated { .. }));
        assert!(conn.is_closing());
    }

    #[test]
    fn test_close_connection_is_idempotent() {
        let mut peer = Peer::new();
        let mut conn = connected(ConnectionConfig::default(), &mut peer, Settings::new());
        conn.receive_data(&peer.request(5, "GET", "/", true)).unwrap();
        conn.close_connection(ErrorCode::NoError);
        conn.close_connection(ErrorCode::InternalError);

        let frames = peer.read(&conn.data_to_send());
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], &[0, 0, 0, 5, 0, 0, 0, 0]);
    }

    #[test]
    fn test_upgrade_opens_stream_one() {
        let mut conn = H2Connection::new(ConnectionConfig::default()).unwrap();
        conn.initiate_upgrade(Some("AAMAAABkAAQAAP__")).unwrap();
        assert_eq!(conn.stream_state(1), Some(StreamState::HalfClosedRemote));
        assert_eq!(conn.remote_settings().max_concurrent_streams, Some(100));

        conn.send_headers(1, 200, &Headers::new(), true).unwrap();
        let mut peer = Peer::new();
        let frames = peer.read(&conn.data_to_send());
        assert_eq!(frames[0].frame_type, FrameType::Settings);
        assert_eq!(frames.last().unwrap().stream_id, 1);

        // The client preface still follows the 101 response
        let events = conn.receive_data(&peer.preface(Settings::new())).unwrap();
        assert!(matches!(events[0], Event::RemoteSettingsChanged { .. }));
    }

    #[test]
    fn test_malformed_request_headers_reset_stream() {
        let mut peer = Peer::new();
        let mut conn = connected(ConnectionConfig::default(), &mut peer, Settings::new());
        let fields: Vec<(&[u8], &[u8])> = vec![(&b":method"[..], &b"GET"[..]), (&b"host"[..], &b"x"[..]), (&b":path"[..], &b"/"[..])];
        let block = peer.encoder.encode(fields);
        let events = conn
            .receive_data(&FrameCodec::encode_header_block(1, &block, true, 16384))
            .unwrap();
        assert!(matches!(
            events[0],
            Event::StreamReset { stream_id: 1, error_code: ErrorCode::ProtocolError, .. }
        ));
    }
}
