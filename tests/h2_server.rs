mod common;

use common::{config, hello, start, READ_TIMEOUT};
use hpack::{Decoder as HpackDecoder, Encoder as HpackEncoder};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use xserve::config::WorkerMode;
use xserve::handler::AppHandler;
use xserve::http::h2::codec::{FrameCodec, FrameDecoder};
use xserve::http::h2::frames::SettingsFrame;
use xserve::http::h2::{Frame, FrameType, Settings, SettingsBuilder, CONNECTION_PREFACE};
use xserve::http::parser::{find_head_end, parse_response_head};
use xserve::xsocket::{SessionOps, TlsConfig, XSocket};

trait Wire {
    fn send(&mut self, data: &[u8]);
    /// `None` on close, timeout or error
    fn recv(&mut self, buf: &mut [u8]) -> Option<usize>;
}

impl Wire for TcpStream {
    fn send(&mut self, data: &[u8]) {
        self.write_all(data).unwrap();
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        match self.read(buf) {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        }
    }
}

impl Wire for XSocket {
    fn send(&mut self, data: &[u8]) {
        self.send_all(data).unwrap();
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        match self.receive(buf) {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        }
    }
}

struct H2Client<W: Wire> {
    wire: W,
    encoder: HpackEncoder<'static>,
    decoder: HpackDecoder<'static>,
    frames: FrameDecoder,
}

impl<W: Wire> H2Client<W> {
    fn new(wire: W) -> Self {
        H2Client {
            wire,
            encoder: HpackEncoder::new(),
            decoder: HpackDecoder::new(),
            frames: FrameDecoder::new(1 << 20),
        }
    }

    fn preface(&mut self, settings: Settings) {
        let mut out = CONNECTION_PREFACE.to_vec();
        out.extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::new(settings)));
        self.wire.send(&out);
    }

    fn request(&mut self, stream_id: u32, path: &str) {
        let fields: Vec<(&[u8], &[u8])> = vec![
            (&b":method"[..], &b"GET"[..]),
            (&b":scheme"[..], &b"http"[..]),
            (&b":path"[..], path.as_bytes()),
            (&b":authority"[..], &b"localhost"[..]),
        ];
        let block = self.encoder.encode(fields);
        let frame = FrameCodec::encode_header_block(stream_id, &block, true, 16_384);
        self.wire.send(&frame);
    }

    /// Next frame that is not connection housekeeping
    fn next(&mut self) -> Option<Frame> {
        loop {
            while let Some(frame) = self.frames.next_frame().unwrap() {
                if !matches!(frame.frame_type, FrameType::Settings | FrameType::WindowUpdate) {
                    return Some(frame);
                }
            }
            let mut buf = [0u8; 8192];
            let n = self.wire.recv(&mut buf)?;
            self.frames.feed(&buf[..n]);
        }
    }

    /// Status and body of the response on `stream_id`
    fn response(&mut self, stream_id: u32) -> (String, Vec<u8>) {
        let headers = self.next().unwrap();
        assert_eq!(headers.frame_type, FrameType::Headers);
        assert_eq!(headers.stream_id, stream_id);
        let status = self
            .decoder
            .decode(&headers.payload)
            .unwrap()
            .into_iter()
            .find(|(name, _)| name == b":status")
            .map(|(_, value)| String::from_utf8(value).unwrap())
            .unwrap();

        let mut body = Vec::new();
        let mut ended = headers.flags.is_end_stream();
        while !ended {
            let frame = self.next().unwrap();
            assert_eq!(frame.stream_id, stream_id);
            assert_eq!(frame.frame_type, FrameType::Data);
            body.extend_from_slice(&frame.payload);
            ended = frame.flags.is_end_stream();
        }
        (status, body)
    }
}

fn tls_client(addr: SocketAddr, protocols: &[&str]) -> XSocket {
    let config = TlsConfig::client().unwrap().alpn(protocols).unwrap().verify_peer(false).build();
    let mut socket = XSocket::connect_tls(addr, &config, Some("localhost"), READ_TIMEOUT).unwrap();
    socket.set_timeout(Some(READ_TIMEOUT));
    socket
}

#[test]
fn test_h2c_upgrade_answers_on_stream_one() {
    let server = start(config(WorkerMode::Thread), AppHandler::from_sync(hello));
    let mut stream = common::connect(server.local_addr());

    let settings = SettingsBuilder::new().initial_window_size(65_535).build().unwrap();
    let upgrade = format!(
        "GET /up HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade, HTTP2-Settings\r\n\
         Upgrade: h2c\r\nHTTP2-Settings: {}\r\n\r\n",
        settings.to_base64url()
    );
    stream.write_all(upgrade.as_bytes()).unwrap();

    let mut buf = Vec::new();
    let head_len = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0);
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = parse_response_head(&buf[..head_len]).unwrap();
    assert_eq!(head.status.code(), 101);
    assert!(head.headers.has_token("Upgrade", "h2c"));

    let mut client = H2Client::new(stream);
    client.frames.feed(&buf[head_len..]);
    client.preface(Settings::new());

    let (status, body) = client.response(1);
    assert_eq!(status, "200");
    assert_eq!(body, b"hello /up");

    client.request(3, "/again");
    let (status, body) = client.response(3);
    assert_eq!(status, "200");
    assert_eq!(body, b"hello /again");
}

#[test]
fn test_prior_knowledge_without_upgrade_is_rejected_as_http1() {
    let server = start(config(WorkerMode::Thread), AppHandler::from_sync(hello));
    let mut stream = common::connect(server.local_addr());

    // Cleartext h2 is only reachable through the upgrade
    stream.write_all(CONNECTION_PREFACE).unwrap();
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out);
    assert!(out.starts_with(b"HTTP/1.1 400"));
}

#[test]
fn test_tls_alpn_selects_h2() {
    let mut config = config(WorkerMode::Thread);
    config.tls.allow_builtin_cert = true;
    let server = start(config, AppHandler::from_sync(hello));

    let socket = tls_client(server.local_addr(), &["h2", "http/1.1"]);
    assert_eq!(socket.alpn_protocol(), Some(&b"h2"[..]));

    let mut client = H2Client::new(socket);
    client.preface(Settings::new());
    client.request(1, "/secure");
    client.request(3, "/twice");

    let (status, body) = client.response(1);
    assert_eq!(status, "200");
    assert_eq!(body, b"hello /secure");
    let (_, body) = client.response(3);
    assert_eq!(body, b"hello /twice");
}

#[test]
fn test_tls_alpn_http1_fallback() {
    let mut config = config(WorkerMode::Thread);
    config.tls.allow_builtin_cert = true;
    let server = start(config, AppHandler::from_sync(hello));

    let mut socket = tls_client(server.local_addr(), &["http/1.1"]);
    assert_eq!(socket.alpn_protocol(), Some(&b"http/1.1"[..]));
    socket
        .send_all(b"GET /tls HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while let Some(n) = Wire::recv(&mut socket, &mut buf) {
        out.extend_from_slice(&buf[..n]);
    }
    let head_len = find_head_end(&out).unwrap();
    let head = parse_response_head(&out[..head_len]).unwrap();
    assert_eq!(head.status.code(), 200);
    assert_eq!(&out[head_len..], b"hello /tls");
}

#[test]
fn test_tls_h2_on_event_loop() {
    let mut config = config(WorkerMode::Async);
    config.tls.allow_builtin_cert = true;
    let server = start(config, AppHandler::from_sync(hello));

    let socket = tls_client(server.local_addr(), &["h2"]);
    let mut client = H2Client::new(socket);
    client.preface(Settings::new());
    client.request(1, "/loop");
    let (status, body) = client.response(1);
    assert_eq!(status, "200");
    assert_eq!(body, b"hello /loop");
    drop(client);
    server.shutdown();
}
