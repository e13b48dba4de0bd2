//! HTTP message types
//!
//! [`Request`] is what the framing layer and the HTTP/2 engine hand to
//! application handlers; [`Response`] is what handlers hand back. A response
//! body is either a fixed buffer, a lazy chunk producer, or a seekable source
//! the finalizer can serve byte ranges from.

use super::parser::RequestHead;
use super::{Error, Headers, Result, CRLF};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::net::SocketAddr;
use std::path::Path;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Parse method from string
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }

    /// Convert method to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }

    /// Whether a request with this method may carry an unframed body
    pub fn may_have_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
    Http2,
}

impl Version {
    /// Parse version from string
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }

    /// Convert version to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::Http2 => "HTTP/2",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a new status code
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            416 => "Range Not Satisfiable",
            426 => "Upgrade Required",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }

    /// Informational statuses and 204/304 never carry a body
    pub fn allows_body(&self) -> bool {
        !(self.is_informational() || self.code == 204 || self.code == 304)
    }

    /// Check if this is an informational status (1xx)
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Check if this is a success status (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Check if this is a client error status (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Check if this is a server error status (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code)
    }

    pub const SWITCHING_PROTOCOLS: Status = Status { code: 101 };
    pub const OK: Status = Status { code: 200 };
    pub const NO_CONTENT: Status = Status { code: 204 };
    pub const PARTIAL_CONTENT: Status = Status { code: 206 };
    pub const NOT_MODIFIED: Status = Status { code: 304 };
    pub const BAD_REQUEST: Status = Status { code: 400 };
    pub const FORBIDDEN: Status = Status { code: 403 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const REQUEST_TIMEOUT: Status = Status { code: 408 };
    pub const RANGE_NOT_SATISFIABLE: Status = Status { code: 416 };
    pub const UPGRADE_REQUIRED: Status = Status { code: 426 };
    pub const HEADERS_TOO_LARGE: Status = Status { code: 431 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };
    pub const BAD_GATEWAY: Status = Status { code: 502 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// Per-request key/value side channel
///
/// The protocol layers record metadata here (`h2_handling`, `stream_id`) for
/// handlers and the finalizer to read. When the CSP uses a nonce, `csp_nonce`
/// is set before the handler runs and the same value goes into the header.
#[derive(Debug, Clone, Default)]
pub struct RequestStore {
    values: HashMap<String, String>,
}

impl RequestStore {
    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Get a value parsed as `T`; `None` when absent or unparseable
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Boolean flag; `"true"` and `"1"` are set
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true") | Some("1"))
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }
}

/// An HTTP request as delivered to handlers
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: String,
    version: Version,
    headers: Headers,
    body: Bytes,
    raw: Bytes,
    store: RequestStore,
    peer: Option<SocketAddr>,
}

impl Request {
    /// Create a new request with no headers and no body
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Request {
            method,
            uri: uri.into(),
            version: Version::default(),
            headers: Headers::new(),
            body: Bytes::new(),
            raw: Bytes::new(),
            store: RequestStore::default(),
            peer: None,
        }
    }

    /// Assemble a request from a parsed head, its decoded body and the wire bytes
    pub fn from_head(head: RequestHead, body: Bytes, raw: Bytes) -> Self {
        Request {
            method: head.method,
            uri: head.uri,
            version: head.version,
            headers: head.headers,
            body,
            raw,
            store: RequestStore::default(),
            peer: None,
        }
    }

    /// Create a builder for constructing requests
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The URI without its query string
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or("")
    }

    /// The query string, if any
    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The decoded body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// The bytes this request arrived as (empty for HTTP/2 requests)
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn store(&self) -> &RequestStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut RequestStore {
        &mut self.store
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn set_peer(&mut self, peer: Option<SocketAddr>) {
        self.peer = peer;
    }

    /// Whether the client asked to keep the connection open
    ///
    /// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close.
    pub fn wants_keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        match self.version {
            Version::Http10 => self.headers.has_token("Connection", "keep-alive"),
            Version::Http11 | Version::Http2 => true,
        }
    }

    /// Serialize as an HTTP/1.1 request
    ///
    /// The raw wire bytes are returned when available; HTTP/2 requests are
    /// re-encoded with a Content-Length body.
    pub fn to_wire(&self) -> Vec<u8> {
        if !self.raw.is_empty() {
            return self.raw.to_vec();
        }

        let mut buf = Vec::with_capacity(256 + self.body.len());
        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.uri.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(Version::Http11.as_str().as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());

        for (name, value) in self.headers.iter() {
            // HTTP/2 pseudo headers and framing headers do not survive translation
            if name.starts_with(':')
                || name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF.as_bytes());
        }
        if !self.body.is_empty() || self.method.may_have_body() {
            buf.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.extend_from_slice(CRLF.as_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Builder for requests, used by the HTTP/2 engine and tests
#[derive(Debug, Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    version: Option<Version>,
    headers: Headers,
    body: Bytes,
    peer: Option<SocketAddr>,
}

impl RequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    /// Build the request
    pub fn build(self) -> Request {
        Request {
            method: self.method.unwrap_or(Method::Get),
            uri: self.uri.unwrap_or_else(|| "/".to_string()),
            version: self.version.unwrap_or_default(),
            headers: self.headers,
            body: self.body,
            raw: Bytes::new(),
            store: RequestStore::default(),
            peer: self.peer,
        }
    }
}

/// Lazy producer of body chunks
///
/// Pulling a chunk may block (file reads, backend sockets); event loop code
/// pulls through [`pull_chunk`].
pub type ChunkStream = Box<dyn Iterator<Item = io::Result<Bytes>> + Send>;

/// A body that can be served whole or in byte ranges
pub trait RangeSource: Send {
    /// Total length in bytes
    fn len(&self) -> u64;

    /// Stream `start..=end` (inclusive, already validated against `len`)
    fn open_range(self: Box<Self>, start: u64, end: u64) -> io::Result<ChunkStream>;
}

const SOURCE_CHUNK: usize = 64 * 1024;

/// In-memory range source
pub struct BytesSource(pub Bytes);

impl RangeSource for BytesSource {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    fn open_range(self: Box<Self>, start: u64, end: u64) -> io::Result<ChunkStream> {
        let slice = self.0.slice(start as usize..(end as usize + 1));
        let chunks: Vec<io::Result<Bytes>> = (0..slice.len())
            .step_by(SOURCE_CHUNK)
            .map(|offset| Ok(slice.slice(offset..(offset + SOURCE_CHUNK).min(slice.len()))))
            .collect();
        Ok(Box::new(chunks.into_iter()))
    }
}

/// File-backed range source
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(FileSource { file, len })
    }
}

impl RangeSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn open_range(self: Box<Self>, start: u64, end: u64) -> io::Result<ChunkStream> {
        let mut file = self.file;
        file.seek(SeekFrom::Start(start))?;
        let mut remaining = end + 1 - start;

        Ok(Box::new(std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let want = remaining.min(SOURCE_CHUNK as u64) as usize;
            let mut buf = vec![0u8; want];
            match file.read(&mut buf) {
                Ok(0) => {
                    remaining = 0;
                    Some(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file shrank while serving it",
                    )))
                }
                Ok(n) => {
                    remaining -= n as u64;
                    buf.truncate(n);
                    Some(Ok(Bytes::from(buf)))
                }
                Err(e) => {
                    remaining = 0;
                    Some(Err(e))
                }
            }
        })))
    }
}

/// Response body
pub enum Body {
    /// Fully buffered; its length is the Content-Length
    Fixed(Bytes),
    /// Lazy chunks of unknown total length
    Stream(ChunkStream),
    /// Seekable source eligible for byte-range serving
    Ranged(Box<dyn RangeSource>),
}

impl Body {
    pub fn empty() -> Self {
        Body::Fixed(Bytes::new())
    }

    /// Length when known without pulling anything
    pub fn known_len(&self) -> Option<u64> {
        match self {
            Body::Fixed(bytes) => Some(bytes.len() as u64),
            Body::Stream(_) => None,
            Body::Ranged(source) => Some(source.len()),
        }
    }

    /// Turn any body into a chunk producer
    pub fn into_stream(self) -> io::Result<ChunkStream> {
        match self {
            Body::Fixed(bytes) if bytes.is_empty() => Ok(Box::new(std::iter::empty())),
            Body::Fixed(bytes) => Ok(Box::new(std::iter::once(Ok(bytes)))),
            Body::Stream(stream) => Ok(stream),
            Body::Ranged(source) => {
                let len = source.len();
                if len == 0 {
                    Ok(Box::new(std::iter::empty()))
                } else {
                    source.open_range(0, len - 1)
                }
            }
        }
    }

    /// Pull the whole body into memory
    pub fn collect(self) -> io::Result<Bytes> {
        if let Body::Fixed(bytes) = self {
            return Ok(bytes);
        }
        let mut out = Vec::new();
        for chunk in self.into_stream()? {
            out.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(out))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Fixed(bytes) => write!(f, "Body::Fixed({} bytes)", bytes.len()),
            Body::Stream(_) => write!(f, "Body::Stream"),
            Body::Ranged(source) => write!(f, "Body::Ranged({} bytes)", source.len()),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Fixed(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Fixed(Bytes::from(bytes))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Fixed(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Fixed(Bytes::from(s))
    }
}

/// Pull the next chunk without blocking the event loop
///
/// The producer moves to the blocking pool for the pull and comes back with
/// the chunk.
pub async fn pull_chunk(mut stream: ChunkStream) -> (ChunkStream, Option<io::Result<Bytes>>) {
    let pulled = tokio::task::spawn_blocking(move || {
        let item = stream.next();
        (stream, item)
    })
    .await;

    match pulled {
        Ok(result) => result,
        Err(e) => (
            Box::new(std::iter::empty()),
            Some(Err(io::Error::other(format!("chunk producer failed: {}", e)))),
        ),
    }
}

/// An HTTP response as produced by handlers
#[derive(Debug)]
pub struct Response {
    status: Status,
    headers: Headers,
    body: Body,
}

impl Response {
    /// Create an empty response
    pub fn new(status: Status) -> Self {
        Response {
            status,
            headers: Headers::new(),
            body: Body::empty(),
        }
    }

    /// Create a response with a body
    pub fn with_body(status: Status, body: impl Into<Body>) -> Self {
        Response {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// Plain-text response
    pub fn text(status: Status, text: impl Into<String>) -> Self {
        Response::with_body(status, text.into()).header("Content-Type", "text/plain; charset=utf-8")
    }

    /// Streaming response of unknown length
    pub fn stream(status: Status, stream: ChunkStream) -> Self {
        Response::with_body(status, Body::Stream(stream))
    }

    /// Range-capable response
    pub fn ranged(status: Status, source: Box<dyn RangeSource>) -> Self {
        Response::with_body(status, Body::Ranged(source))
    }

    /// Minimal error response with the reason phrase as body
    pub fn error(status: Status) -> Self {
        Response::text(status, status.reason_phrase())
    }

    /// Add a header (builder style)
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Take the body, leaving an empty one
    pub fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::empty())
    }

    pub fn into_parts(self) -> (Status, Headers, Body) {
        (self.status, self.headers, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_method_from_str() {
        assert_eq!(Method::from_str("GET").unwrap(), Method::Get);
        assert_eq!(Method::from_str("PATCH").unwrap(), Method::Patch);
        assert!(Method::from_str("BREW").is_err());
        assert!(Method::Post.may_have_body());
        assert!(!Method::Get.may_have_body());
    }

    #[test]
    fn test_version_from_str() {
        assert_eq!(Version::from_str("HTTP/1.0").unwrap(), Version::Http10);
        assert_eq!(Version::from_str("HTTP/1.1").unwrap(), Version::Http11);
        assert!(Version::from_str("HTTP/2.0").is_err());
    }

    #[test]
    fn test_status_body_rules() {
        assert!(Status::OK.allows_body());
        assert!(!Status::NO_CONTENT.allows_body());
        assert!(!Status::NOT_MODIFIED.allows_body());
        assert!(!Status::SWITCHING_PROTOCOLS.allows_body());
        assert!(Status::new(99).is_err());
        assert_eq!(Status::RANGE_NOT_SATISFIABLE.reason_phrase(), "Range Not Satisfiable");
    }

    #[test]
    fn test_keep_alive_defaults() {
        let req = Request::builder().version(Version::Http11).build();
        assert!(req.wants_keep_alive());

        let req = Request::builder()
            .version(Version::Http11)
            .header("Connection", "close")
            .build();
        assert!(!req.wants_keep_alive());

        let req = Request::builder().version(Version::Http10).build();
        assert!(!req.wants_keep_alive());

        let req = Request::builder()
            .version(Version::Http10)
            .header("Connection", "Keep-Alive")
            .build();
        assert!(req.wants_keep_alive());
    }

    #[test]
    fn test_path_and_query() {
        let req = Request::new(Method::Get, "/search?q=rust&page=2");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query(), Some("q=rust&page=2"));
        assert_eq!(Request::new(Method::Get, "/").query(), None);
    }

    #[test]
    fn test_request_store() {
        let mut req = Request::new(Method::Get, "/");
        req.store_mut().insert("h2_handling", true);
        req.store_mut().insert("stream_id", 7u32);

        assert!(req.store().flag("h2_handling"));
        assert_eq!(req.store().get_parsed::<u32>("stream_id"), Some(7));
        assert!(!req.store().flag("missing"));
    }

    #[test]
    fn test_to_wire_reencodes_h2_request() {
        let req = Request::builder()
            .method(Method::Post)
            .uri("/submit")
            .version(Version::Http2)
            .header(":authority", "example.com")
            .header("host", "example.com")
            .body(&b"abc"[..])
            .build();

        let wire = String::from_utf8(req.to_wire()).unwrap();
        assert!(wire.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(!wire.contains(":authority"));
        assert!(wire.contains("Content-Length: 3\r\n"));
        assert!(wire.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn test_bytes_source_range() {
        let source = Box::new(BytesSource(Bytes::from_static(b"0123456789")));
        let body: Vec<u8> = source
            .open_range(2, 5)
            .unwrap()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        assert_eq!(body, b"2345");
    }

    #[test]
    fn test_file_source_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&content).unwrap();

        let source = Box::new(FileSource::open(file.path()).unwrap());
        assert_eq!(source.len(), 200_000);

        let range: Vec<u8> = source
            .open_range(1000, 150_999)
            .unwrap()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        assert_eq!(range, &content[1000..151_000]);
    }

    #[test]
    fn test_body_collect() {
        let stream: ChunkStream = Box::new(
            vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))].into_iter(),
        );
        assert_eq!(&Body::Stream(stream).collect().unwrap()[..], b"abcd");
        assert_eq!(Body::from("xyz").known_len(), Some(3));
    }

    #[tokio::test]
    async fn test_pull_chunk() {
        let stream: ChunkStream = Box::new(vec![Ok(Bytes::from_static(b"one"))].into_iter());
        let (stream, first) = pull_chunk(stream).await;
        assert_eq!(&first.unwrap().unwrap()[..], b"one");
        let (_, second) = pull_chunk(stream).await;
        assert!(second.is_none());
    }
}
