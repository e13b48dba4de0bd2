//! Request framing
//!
//! Reads exactly one request off a connection. Once the head terminator has
//! been seen the body strategy is picked in this order:
//!
//! 1. `Transfer-Encoding: chunked`, decoded until the zero-size chunk
//! 2. a parseable `Content-Length`, read until that many bytes arrived
//! 3. for methods that may carry a body, reads with a short stream timeout;
//!    the first timeout ends the body
//!
//! A peer that closes after the head is complete ends the body early and the
//! request is delivered with what arrived. Bytes received beyond the framed
//! body belong to the next pipelined request and are handed back to the
//! caller.
//!
//! [`RequestAccumulator`] holds the state machine; [`read_full_request`] and
//! [`read_full_request_async`] drive it from a blocking or event loop socket.

use super::message::Request;
use super::chunked::ChunkedDecoder;
use super::parser::{find_head_end, parse_request_head, RequestHead};
use super::{Error, Result};
use crate::xsocket::{self, AsyncSessionOps, PollEvents, SessionOps};
use bytes::{Bytes, BytesMut};
use std::time::Duration;

/// How the body of a request is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingStrategy {
    Chunked,
    ContentLength(u64),
    /// No framing headers; the body ends at the first stream timeout
    StreamTimeout,
    /// No body
    Empty,
}

impl FramingStrategy {
    /// Pick the body strategy for a parsed head
    pub fn detect(head: &RequestHead) -> Self {
        if head.headers.has_token("Transfer-Encoding", "chunked") {
            return FramingStrategy::Chunked;
        }

        match head.headers.content_length() {
            Ok(Some(length)) => return FramingStrategy::ContentLength(length),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unusable Content-Length");
            }
        }

        if head.method.may_have_body() {
            FramingStrategy::StreamTimeout
        } else {
            FramingStrategy::Empty
        }
    }
}

/// Result of feeding bytes to a [`RequestAccumulator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    NeedMore,
    Complete,
}

/// Incremental request assembly, independent of any socket
#[derive(Debug)]
pub struct RequestAccumulator {
    pending: BytesMut,
    raw: BytesMut,
    head: Option<RequestHead>,
    strategy: Option<FramingStrategy>,
    body: Vec<u8>,
    decoder: ChunkedDecoder,
    complete: bool,
    max_header_bytes: usize,
}

impl RequestAccumulator {
    pub fn new(max_header_bytes: usize) -> Self {
        RequestAccumulator {
            pending: BytesMut::new(),
            raw: BytesMut::new(),
            head: None,
            strategy: None,
            body: Vec::new(),
            decoder: ChunkedDecoder::new(),
            complete: false,
            max_header_bytes,
        }
    }

    /// Start from bytes left over by the previous request on the connection
    pub fn with_leftover(leftover: Bytes, max_header_bytes: usize) -> Self {
        let mut acc = Self::new(max_header_bytes);
        acc.pending.extend_from_slice(&leftover);
        acc
    }

    /// Feed newly received bytes; an empty slice re-examines buffered input
    pub fn feed(&mut self, data: &[u8]) -> Result<Progress> {
        if self.complete {
            self.pending.extend_from_slice(data);
            return Ok(Progress::Complete);
        }
        self.pending.extend_from_slice(data);

        if self.head.is_none() && !self.parse_head()? {
            return Ok(Progress::NeedMore);
        }

        self.advance_body()?;
        Ok(if self.complete {
            Progress::Complete
        } else {
            Progress::NeedMore
        })
    }

    fn parse_head(&mut self) -> Result<bool> {
        // Stray CRLFs between pipelined requests are skipped
        let skip = self
            .pending
            .chunks(2)
            .take_while(|pair| *pair == b"\r\n")
            .count()
            * 2;
        if skip > 0 {
            let _ = self.pending.split_to(skip);
        }

        let Some(head_len) = find_head_end(&self.pending) else {
            if self.pending.len() > self.max_header_bytes {
                return Err(Error::HeadersTooLarge(self.max_header_bytes));
            }
            return Ok(false);
        };
        if head_len > self.max_header_bytes {
            return Err(Error::HeadersTooLarge(self.max_header_bytes));
        }

        let head = parse_request_head(&self.pending[..head_len])?;
        let strategy = FramingStrategy::detect(&head);
        tracing::trace!(method = %head.method, uri = %head.uri, ?strategy, "Request head parsed");

        self.raw.extend_from_slice(&self.pending.split_to(head_len));
        self.head = Some(head);
        self.strategy = Some(strategy);
        Ok(true)
    }

    fn advance_body(&mut self) -> Result<()> {
        match self.strategy {
            None => {}
            Some(FramingStrategy::Empty) => self.complete = true,
            Some(FramingStrategy::ContentLength(length)) => {
                let missing = length.saturating_sub(self.body.len() as u64);
                let take = (missing.min(self.pending.len() as u64)) as usize;
                let chunk = self.pending.split_to(take);
                self.body.extend_from_slice(&chunk);
                self.raw.extend_from_slice(&chunk);
                self.complete = self.body.len() as u64 == length;
            }
            Some(FramingStrategy::Chunked) => {
                let (consumed, done) = self.decoder.decode_into(&self.pending, &mut self.body)?;
                self.raw.extend_from_slice(&self.pending.split_to(consumed));
                self.complete = done;
            }
            Some(FramingStrategy::StreamTimeout) => {
                let chunk = self.pending.split();
                self.body.extend_from_slice(&chunk);
                self.raw.extend_from_slice(&chunk);
            }
        }
        Ok(())
    }

    /// Whether the head terminator has been seen
    pub fn headers_complete(&self) -> bool {
        self.head.is_some()
    }

    /// The chosen body strategy, once the head is parsed
    pub fn strategy(&self) -> Option<FramingStrategy> {
        self.strategy
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether any bytes of this request have been received
    pub fn has_data(&self) -> bool {
        self.head.is_some() || !self.pending.is_empty()
    }

    /// Build the request and return it with the bytes that follow it
    ///
    /// Before completion this yields the partial body; the trailing bytes are
    /// then empty since nothing beyond the body can be trusted.
    pub fn into_request(self) -> Result<(Request, Bytes)> {
        let head = self.head.ok_or(Error::Incomplete)?;
        let leftover = if self.complete {
            self.pending.freeze()
        } else {
            Bytes::new()
        };
        let request = Request::from_head(head, Bytes::from(self.body), self.raw.freeze());
        Ok((request, leftover))
    }
}

/// Timeouts and limits for reading one request
#[derive(Debug, Clone)]
pub struct FramingOptions {
    /// Wait for the head and for framed body bytes
    pub request_timeout: Duration,
    /// Quiet period that ends an unframed body
    pub stream_timeout: Duration,
    pub max_header_bytes: usize,
    pub read_size: usize,
}

impl Default for FramingOptions {
    fn default() -> Self {
        FramingOptions {
            request_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_millis(200),
            max_header_bytes: 64 * 1024,
            read_size: 16 * 1024,
        }
    }
}

/// What one read attempt produced
enum ReadOutcome {
    Data(usize),
    Closed,
    TimedOut,
}

/// Apply one read outcome to the accumulator
///
/// `Ok(None)` asks for another read; `Ok(Some(..))` is the final answer.
fn step(
    acc: &mut Option<RequestAccumulator>,
    outcome: ReadOutcome,
    buf: &[u8],
) -> Result<Option<Option<(Request, Bytes)>>> {
    let Some(current) = acc.as_mut() else {
        return Err(Error::Incomplete);
    };

    match outcome {
        ReadOutcome::Data(n) => {
            if current.feed(&buf[..n])? == Progress::NeedMore {
                return Ok(None);
            }
        }
        ReadOutcome::Closed => {
            if !current.has_data() {
                return Ok(Some(None));
            }
            if !current.headers_complete() {
                return Err(Error::ConnectionClosed);
            }
            tracing::debug!("Peer closed before the body was complete");
        }
        ReadOutcome::TimedOut => {
            if current.strategy() != Some(FramingStrategy::StreamTimeout) {
                return Err(Error::Timeout);
            }
        }
    }

    match acc.take() {
        Some(done) => done.into_request().map(|request| Some(Some(request))),
        None => Err(Error::Incomplete),
    }
}

fn current_timeout(acc: &Option<RequestAccumulator>, opts: &FramingOptions) -> Duration {
    match acc.as_ref().and_then(|a| a.strategy()) {
        Some(FramingStrategy::StreamTimeout) => opts.stream_timeout,
        _ => opts.request_timeout,
    }
}

/// Read one complete request from a blocking session
///
/// Returns `Ok(None)` when the peer closed the connection before sending any
/// byte of a new request. The returned `Bytes` are pipelined input that
/// belongs to the next request.
pub fn read_full_request<S: SessionOps + ?Sized>(
    session: &mut S,
    leftover: Bytes,
    opts: &FramingOptions,
) -> Result<Option<(Request, Bytes)>> {
    let mut acc = Some(RequestAccumulator::with_leftover(leftover, opts.max_header_bytes));
    if let Some(current) = acc.as_mut() {
        if current.feed(&[])? == Progress::Complete {
            if let Some(done) = acc.take() {
                return done.into_request().map(Some);
            }
        }
    }

    let mut buf = vec![0u8; opts.read_size];
    loop {
        let timeout = current_timeout(&acc, opts);
        let outcome = match session.poll(PollEvents::Read, Some(timeout)) {
            Ok(true) => match session.read(&mut buf) {
                Ok(0) => ReadOutcome::Closed,
                Ok(n) => ReadOutcome::Data(n),
                Err(xsocket::Error::Timeout) => ReadOutcome::TimedOut,
                Err(e) => return Err(e.into()),
            },
            Ok(false) => ReadOutcome::TimedOut,
            Err(e) => return Err(e.into()),
        };

        if let Some(result) = step(&mut acc, outcome, &buf)? {
            return Ok(result);
        }
    }
}

/// Read one complete request from an event loop session
///
/// Same contract as [`read_full_request`].
pub async fn read_full_request_async<S: AsyncSessionOps + ?Sized>(
    session: &mut S,
    leftover: Bytes,
    opts: &FramingOptions,
) -> Result<Option<(Request, Bytes)>> {
    let mut acc = Some(RequestAccumulator::with_leftover(leftover, opts.max_header_bytes));
    if let Some(current) = acc.as_mut() {
        if current.feed(&[])? == Progress::Complete {
            if let Some(done) = acc.take() {
                return done.into_request().map(Some);
            }
        }
    }

    let mut buf = vec![0u8; opts.read_size];
    loop {
        let timeout = current_timeout(&acc, opts);
        let outcome = match tokio::time::timeout(timeout, session.receive(&mut buf)).await {
            Ok(Ok(0)) => ReadOutcome::Closed,
            Ok(Ok(n)) => ReadOutcome::Data(n),
            Ok(Err(xsocket::Error::Timeout)) | Err(_) => ReadOutcome::TimedOut,
            Ok(Err(e)) => return Err(e.into()),
        };

        if let Some(result) = step(&mut acc, outcome, &buf)? {
            return Ok(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use std::collections::VecDeque;

    /// Scripted session: `Some(bytes)` is one read, `None` one timeout
    struct Script {
        steps: VecDeque<Option<Vec<u8>>>,
    }

    impl Script {
        fn new(steps: Vec<Option<Vec<u8>>>) -> Self {
            Script {
                steps: steps.into_iter().collect(),
            }
        }
    }

    fn d(bytes: &[u8]) -> Option<Vec<u8>> {
        Some(bytes.to_vec())
    }

    impl SessionOps for Script {
        fn poll(&self, _: PollEvents, _: Option<Duration>) -> xsocket::Result<bool> {
            Ok(!matches!(self.steps.front(), Some(None)))
        }

        fn read(&mut self, buf: &mut [u8]) -> xsocket::Result<usize> {
            match self.steps.pop_front() {
                Some(Some(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(None) => Err(xsocket::Error::Timeout),
                None => Ok(0),
            }
        }

        fn write(&mut self, buf: &[u8]) -> xsocket::Result<usize> {
            Ok(buf.len())
        }

        fn close(&mut self) -> xsocket::Result<()> {
            Ok(())
        }
    }

    fn read(script: &mut Script) -> Result<Option<(Request, Bytes)>> {
        read_full_request(script, Bytes::new(), &FramingOptions::default())
    }

    #[test]
    fn test_content_length_in_small_writes() {
        let mut steps = vec![d(b"POST /p HTTP/1.1\r\nContent-Length: 10\r\n\r\n")];
        for byte in b"0123456789" {
            steps.push(d(&[*byte]));
        }
        let mut script = Script::new(steps);

        let (request, leftover) = read(&mut script).unwrap().unwrap();
        assert_eq!(request.body(), b"0123456789");
        assert!(leftover.is_empty());
    }

    #[test]
    fn test_chunked_body() {
        let mut script = Script::new(vec![
            d(b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWi"),
            d(b"ki\r\n5\r\npedia\r\n0\r\n"),
            d(b"\r\n"),
        ]);
        let (request, _) = read(&mut script).unwrap().unwrap();
        assert_eq!(request.body(), b"Wikipedia");
    }

    #[test]
    fn test_chunked_wins_over_content_length() {
        let mut acc = RequestAccumulator::new(8192);
        let progress = acc
            .feed(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n")
            .unwrap();
        assert_eq!(progress, Progress::Complete);
        assert_eq!(acc.strategy(), Some(FramingStrategy::Chunked));
    }

    #[test]
    fn test_stream_timeout_ends_unframed_body() {
        let mut script = Script::new(vec![
            d(b"POST /s HTTP/1.1\r\n\r\npart one "),
            d(b"part two"),
            None,
        ]);
        let (request, _) = read(&mut script).unwrap().unwrap();
        assert_eq!(request.body(), b"part one part two");
    }

    #[test]
    fn test_get_without_framing_has_no_body() {
        let mut acc = RequestAccumulator::new(8192);
        assert_eq!(
            acc.feed(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap(),
            Progress::Complete
        );
        assert_eq!(acc.strategy(), Some(FramingStrategy::Empty));
    }

    #[test]
    fn test_peer_close_after_headers_returns_partial_body() {
        let mut script = Script::new(vec![
            d(b"PUT /u HTTP/1.1\r\nContent-Length: 100\r\n\r\nonly this"),
        ]);
        let (request, leftover) = read(&mut script).unwrap().unwrap();
        assert_eq!(request.method(), Method::Put);
        assert_eq!(request.body(), b"only this");
        assert!(leftover.is_empty());
    }

    #[test]
    fn test_peer_close_right_after_headers_yields_empty_body() {
        let mut script = Script::new(vec![d(
            b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
        )]);
        let (request, leftover) = read(&mut script).unwrap().unwrap();
        assert_eq!(request.method(), Method::Post);
        assert_eq!(request.path(), "/c");
        assert!(request.body().is_empty());
        assert!(leftover.is_empty());
    }

    #[test]
    fn test_peer_close_before_headers_is_error() {
        let mut script = Script::new(vec![d(b"GET / HTTP/1.1\r\nHo")]);
        assert!(matches!(read(&mut script), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_clean_close_between_requests() {
        let mut script = Script::new(vec![]);
        assert!(read(&mut script).unwrap().is_none());
    }

    #[test]
    fn test_timeout_waiting_for_head() {
        let mut script = Script::new(vec![d(b"GET / HT"), None]);
        assert!(matches!(read(&mut script), Err(Error::Timeout)));
    }

    #[test]
    fn test_pipelined_leftover() {
        let mut script = Script::new(vec![d(
            b"POST /a HTTP/1.1\r\nContent-Length: 2\r\n\r\nokGET /b HTTP/1.1\r\n\r\n",
        )]);
        let (first, leftover) = read(&mut script).unwrap().unwrap();
        assert_eq!(first.uri(), "/a");
        assert_eq!(first.body(), b"ok");

        let (second, rest) =
            read_full_request(&mut script, leftover, &FramingOptions::default())
                .unwrap()
                .unwrap();
        assert_eq!(second.uri(), "/b");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_head_too_large() {
        let mut acc = RequestAccumulator::new(32);
        let result = acc.feed(b"GET /a-very-long-path-that-keeps-going HTTP/1.1\r\n");
        assert!(matches!(result, Err(Error::HeadersTooLarge(32))));
    }

    #[test]
    fn test_raw_bytes_kept() {
        let wire = b"POST /r HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1\r\nx\r\n0\r\n\r\n";
        let mut acc = RequestAccumulator::new(8192);
        acc.feed(wire).unwrap();
        let (request, _) = acc.into_request().unwrap();
        assert_eq!(request.raw(), &wire[..]);
        assert_eq!(request.body(), b"x");
    }

    #[tokio::test]
    async fn test_async_content_length() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            client
                .send_all(b"POST /x HTTP/1.1\r\nContent-Length: 6\r\n\r\n")
                .await
                .unwrap();
            for piece in [&b"ab"[..], b"cd", b"ef"] {
                tokio::time::sleep(Duration::from_millis(5)).await;
                client.send_all(piece).await.unwrap();
            }
            client
        });

        let (request, _) = read_full_request_async(&mut server, Bytes::new(), &FramingOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.body(), b"abcdef");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_async_stream_timeout() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .send_all(b"POST /x HTTP/1.1\r\n\r\nunframed")
            .await
            .unwrap();

        let opts = FramingOptions {
            stream_timeout: Duration::from_millis(30),
            ..FramingOptions::default()
        };
        let (request, _) = read_full_request_async(&mut server, Bytes::new(), &opts)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.body(), b"unframed");
        drop(client);
    }
}
