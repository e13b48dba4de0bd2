//! HTTP/1.x response serialization
//!
//! Fixed bodies go out with a Content-Length. Streamed bodies go out raw when
//! the finalizer fixed their length, chunked on HTTP/1.1 otherwise, and
//! close-delimited on HTTP/1.0.

use super::chunked::{encode_chunk, LAST_CHUNK};
use super::message::{pull_chunk, Body, ChunkStream, Response};
use super::{Headers, Result, Status, Version, CRLF};
use crate::xsocket::{AsyncSessionOps, SessionOps};

/// What was written, for access logging and connection reuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Written {
    pub status: u16,
    pub body_bytes: u64,
    /// The body is delimited by closing the connection
    pub close_delimited: bool,
}

/// Serialize a status line and headers
pub fn encode_head(version: Version, status: Status, headers: &Headers) -> Vec<u8> {
    let version = match version {
        Version::Http10 => Version::Http10,
        _ => Version::Http11,
    };
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(version.as_str().as_bytes());
    buf.extend_from_slice(format!(" {} {}", status.code(), status.reason_phrase()).as_bytes());
    buf.extend_from_slice(CRLF.as_bytes());
    headers.write_to(&mut buf);
    buf.extend_from_slice(CRLF.as_bytes());
    buf
}

enum Plan {
    HeadOnly,
    Fixed(bytes::Bytes),
    Raw(ChunkStream),
    Chunked(ChunkStream),
    CloseDelimited(ChunkStream),
}

fn plan(
    headers: &mut Headers,
    status: Status,
    body: Body,
    version: Version,
    head_only: bool,
) -> Result<Plan> {
    if head_only || !status.allows_body() {
        if let (Body::Fixed(bytes), true) = (&body, status.allows_body()) {
            headers.set_default("Content-Length", bytes.len().to_string());
        }
        return Ok(Plan::HeadOnly);
    }

    match body {
        Body::Fixed(bytes) => {
            headers.set_default("Content-Length", bytes.len().to_string());
            Ok(Plan::Fixed(bytes))
        }
        other => {
            let stream = other.into_stream()?;
            if headers.contains("Content-Length") {
                headers.remove("Transfer-Encoding");
                Ok(Plan::Raw(stream))
            } else if version == Version::Http10 {
                Ok(Plan::CloseDelimited(stream))
            } else {
                headers.set("Transfer-Encoding", "chunked");
                Ok(Plan::Chunked(stream))
            }
        }
    }
}

/// Write a response to a blocking session
pub fn write_response<S: SessionOps + ?Sized>(
    session: &mut S,
    response: Response,
    version: Version,
    head_only: bool,
) -> Result<Written> {
    let (status, mut headers, body) = response.into_parts();
    let plan = plan(&mut headers, status, body, version, head_only)?;
    let mut head = encode_head(version, status, &headers);
    let mut written = Written {
        status: status.code(),
        ..Written::default()
    };

    match plan {
        Plan::HeadOnly => session.send_all(&head)?,
        Plan::Fixed(bytes) => {
            head.extend_from_slice(&bytes);
            session.send_all(&head)?;
            written.body_bytes = bytes.len() as u64;
        }
        Plan::Raw(stream) | Plan::CloseDelimited(stream) => {
            written.close_delimited = !headers.contains("Content-Length");
            session.send_all(&head)?;
            for chunk in stream {
                let chunk = chunk?;
                session.send_all(&chunk)?;
                written.body_bytes += chunk.len() as u64;
            }
        }
        Plan::Chunked(stream) => {
            session.send_all(&head)?;
            for chunk in stream {
                let chunk = chunk?;
                if chunk.is_empty() {
                    continue;
                }
                session.send_all(&encode_chunk(&chunk))?;
                written.body_bytes += chunk.len() as u64;
            }
            session.send_all(LAST_CHUNK)?;
        }
    }

    Ok(written)
}

/// Write a response to an event loop session
///
/// Streamed chunks are pulled on the blocking pool.
pub async fn write_response_async<S: AsyncSessionOps + ?Sized>(
    session: &mut S,
    response: Response,
    version: Version,
    head_only: bool,
) -> Result<Written> {
    let (status, mut headers, body) = response.into_parts();
    let plan = plan(&mut headers, status, body, version, head_only)?;
    let mut head = encode_head(version, status, &headers);
    let mut written = Written {
        status: status.code(),
        ..Written::default()
    };

    let (mut stream, chunked) = match plan {
        Plan::HeadOnly => {
            session.send_all(&head).await?;
            return Ok(written);
        }
        Plan::Fixed(bytes) => {
            head.extend_from_slice(&bytes);
            session.send_all(&head).await?;
            written.body_bytes = bytes.len() as u64;
            return Ok(written);
        }
        Plan::Raw(stream) => (stream, false),
        Plan::CloseDelimited(stream) => {
            written.close_delimited = true;
            (stream, false)
        }
        Plan::Chunked(stream) => (stream, true),
    };

    session.send_all(&head).await?;
    loop {
        let (rest, item) = pull_chunk(stream).await;
        stream = rest;
        let chunk = match item {
            Some(chunk) => chunk?,
            None => break,
        };
        if chunk.is_empty() {
            continue;
        }
        if chunked {
            session.send_all(&encode_chunk(&chunk)).await?;
        } else {
            session.send_all(&chunk).await?;
        }
        written.body_bytes += chunk.len() as u64;
    }
    if chunked {
        session.send_all(LAST_CHUNK).await?;
    }

    Ok(written)
}
