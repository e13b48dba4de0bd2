//! The finalization pipeline

use super::compress::{compress_fixed, encode_stream, Compression, StreamEncoding};
use super::range::{ByteRange, RangeError};
use super::security::{generate_nonce, SecurityHeaders, NONCE_KEY};
use super::StepError;
use crate::config::{CompressionConfig, ServerConfig};
use crate::http::{Body, Headers, Method, Request, Response, Status, Version};
use bytes::Bytes;
use std::collections::HashMap;

/// What the finalizer needs to know about the request being answered
#[derive(Debug, Clone)]
pub struct FinalizeContext {
    pub method: Method,
    pub version: Version,
    pub headers: Headers,
    pub keep_alive: bool,
    /// Nonce the handler saw in the request store
    pub csp_nonce: Option<String>,
}

impl FinalizeContext {
    pub fn from_request(request: &Request, keep_alive: bool) -> Self {
        FinalizeContext {
            method: request.method(),
            version: request.version(),
            headers: request.headers().clone(),
            keep_alive,
            csp_nonce: request.store().get(NONCE_KEY).map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Steps {
    ranges: bool,
    compression: bool,
}

impl Steps {
    const ALL: Steps = Steps {
        ranges: true,
        compression: true,
    };

    const RETRY: Steps = Steps {
        ranges: false,
        compression: false,
    };
}

/// Outcome of the range step
enum RangeStep {
    Done,
    /// Replace the response and finalize again without ranges
    Replace(Response),
}

pub struct Finalizer {
    overrides: HashMap<u16, String>,
    security: SecurityHeaders,
    compression: CompressionConfig,
}

impl Finalizer {
    pub fn new(config: &ServerConfig) -> Self {
        Finalizer {
            overrides: config.status_override_map(),
            security: SecurityHeaders::from_config(&config.security),
            compression: config.compression.clone(),
        }
    }

    /// Give the request its CSP nonce before the handler sees it
    pub fn prepare(&self, request: &mut Request) {
        if self.security.uses_nonce() && request.store().get(NONCE_KEY).is_none() {
            request.store_mut().insert(NONCE_KEY, generate_nonce());
        }
    }

    pub fn finalize(&self, response: Response, ctx: &FinalizeContext) -> Response {
        self.run(response, ctx, Steps::ALL)
    }

    fn run(&self, mut response: Response, ctx: &FinalizeContext, steps: Steps) -> Response {
        self.apply_override(&mut response);
        let nonce = ctx.csp_nonce.as_deref();
        log_step("security headers", self.security.apply(response.headers_mut(), nonce).map_err(StepError::from));
        apply_connection(&mut response, ctx);
        response
            .headers_mut()
            .set_default("Date", chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string());

        if steps.ranges {
            match self.apply_range(&mut response, ctx) {
                RangeStep::Done => {}
                RangeStep::Replace(replacement) => return self.run(replacement, ctx, Steps::RETRY),
            }
        } else if let Body::Ranged(_) = response.body() {
            response.headers_mut().set_default("Accept-Ranges", "bytes");
        }

        if steps.compression {
            log_step("compression", self.apply_compression(&mut response, ctx));
        }
        apply_framing(&mut response);
        response
    }

    fn apply_override(&self, response: &mut Response) {
        let Some(body) = self.overrides.get(&response.status().code()) else {
            return;
        };
        let headers = response.headers_mut();
        headers.remove("Content-Length");
        headers.remove("Content-Encoding");
        headers.set("Content-Type", "text/html; charset=utf-8");
        response.set_body(Bytes::from(body.clone()));
    }

    fn apply_range(&self, response: &mut Response, ctx: &FinalizeContext) -> RangeStep {
        let total = match response.body() {
            Body::Ranged(source) => source.len(),
            _ => return RangeStep::Done,
        };
        response.headers_mut().set_default("Accept-Ranges", "bytes");

        let header = match ctx.headers.get("Range") {
            Some(header) if response.status() == Status::OK && matches!(ctx.method, Method::Get | Method::Head) => {
                header.to_string()
            }
            // No Range header; the body is served whole
            _ => return RangeStep::Done,
        };

        let range = match ByteRange::parse(&header, total) {
            Ok(Some(range)) => range,
            Ok(None) => return RangeStep::Done,
            Err(e) => {
                tracing::debug!(range = %header, error = %e, "range not satisfiable");
                return RangeStep::Replace(not_satisfiable(total, &e));
            }
        };

        let Body::Ranged(source) = response.take_body() else {
            return RangeStep::Done;
        };
        match source.open_range(range.start, range.end) {
            Ok(stream) => {
                response.set_status(Status::PARTIAL_CONTENT);
                response.set_body(Body::Stream(stream));
                let headers = response.headers_mut();
                headers.set("Content-Range", range.content_range(total));
                headers.set("Content-Length", range.len().to_string());
                RangeStep::Done
            }
            Err(e) => {
                tracing::warn!(range = %range, error = %e, "failed to open range");
                RangeStep::Replace(Response::error(Status::INTERNAL_SERVER_ERROR))
            }
        }
    }

    fn apply_compression(&self, response: &mut Response, ctx: &FinalizeContext) -> Result<(), StepError> {
        let config = &self.compression;
        if !config.enabled || !response.status().allows_body() || response.status() == Status::PARTIAL_CONTENT {
            return Ok(());
        }
        if matches!(response.body(), Body::Ranged(_)) {
            return Ok(());
        }
        let eligible = response
            .headers()
            .get("Content-Type")
            .is_some_and(|ct| config.mimetypes.iter().any(|prefix| ct.starts_with(prefix.as_str())));
        if !eligible {
            return Ok(());
        }
        let identity = response
            .headers()
            .get("Content-Encoding")
            .map_or(true, |enc| enc.trim().eq_ignore_ascii_case("identity"));
        if !identity {
            return Ok(());
        }
        response.headers_mut().set("Vary", "Accept-Encoding");

        let Some(coding) = ctx.headers.get("Accept-Encoding").and_then(Compression::negotiate) else {
            return Ok(());
        };

        match response.take_body() {
            Body::Fixed(bytes) => {
                if bytes.len() < config.min_size {
                    response.set_body(bytes);
                    return Ok(());
                }
                let compressed = match compress_fixed(&bytes, coding, config.level) {
                    Ok(compressed) => compressed,
                    Err(e) => {
                        response.set_body(bytes);
                        return Err(e.into());
                    }
                };
                response.set_body(compressed);
                let headers = response.headers_mut();
                headers.set("Content-Encoding", coding.as_str());
                headers.remove("Content-Length");
            }
            Body::Stream(stream) => {
                if coding != Compression::Gzip {
                    response.set_body(Body::Stream(stream));
                    return Ok(());
                }
                match encode_stream(stream, config.level, config.probe_size) {
                    StreamEncoding::Gzip(compressed) => {
                        response.set_body(Body::Stream(Box::new(compressed)));
                        let headers = response.headers_mut();
                        headers.set("Content-Encoding", "gzip");
                        headers.remove("Content-Length");
                    }
                    StreamEncoding::Identity(stream) => response.set_body(Body::Stream(stream)),
                }
            }
            other => response.set_body(other),
        }
        Ok(())
    }
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer")
            .field("overrides", &self.overrides.len())
            .field("compression", &self.compression.enabled)
            .finish()
    }
}

fn log_step(step: &str, result: Result<(), StepError>) {
    if let Err(e) = result {
        tracing::warn!(step, error = %e, "finalizer step skipped");
    }
}

fn apply_connection(response: &mut Response, ctx: &FinalizeContext) {
    let headers = response.headers_mut();
    match ctx.version {
        Version::Http2 => {
            headers.remove("Connection");
            headers.remove("Keep-Alive");
        }
        _ if ctx.keep_alive => headers.set("Connection", "keep-alive"),
        _ => headers.set("Connection", "close"),
    }
}

/// Length headers, and no body where the status forbids one
fn apply_framing(response: &mut Response) {
    if !response.status().allows_body() {
        response.set_body(Body::empty());
        let headers = response.headers_mut();
        headers.remove("Content-Length");
        headers.remove("Transfer-Encoding");
        return;
    }
    match response.body() {
        Body::Fixed(bytes) => {
            let len = bytes.len().to_string();
            response.headers_mut().set("Content-Length", len);
        }
        Body::Ranged(source) => {
            let len = source.len().to_string();
            response.headers_mut().set_default("Content-Length", len);
        }
        Body::Stream(_) => {}
    }
}

fn not_satisfiable(total: u64, err: &RangeError) -> Response {
    Response::text(Status::RANGE_NOT_SATISFIABLE, err.to_string())
        .header("Content-Range", format!("bytes */{}", total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::BytesSource;
    use flate2::read::GzDecoder;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::io::{self, Read};

    fn finalizer(config: ServerConfig) -> Finalizer {
        Finalizer::new(&config)
    }

    fn ctx(headers: &[(&str, &str)]) -> FinalizeContext {
        let mut map = Headers::new();
        for (name, value) in headers {
            map.insert(*name, *value);
        }
        FinalizeContext {
            method: Method::Get,
            version: Version::Http11,
            headers: map,
            keep_alive: true,
            csp_nonce: None,
        }
    }

    fn thousand_bytes() -> Response {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        Response::ranged(Status::OK, Box::new(BytesSource(Bytes::from(data))))
    }

    #[test]
    fn test_range_request_is_partial() {
        let f = finalizer(ServerConfig::default());
        let response = f.finalize(thousand_bytes(), &ctx(&[("Range", "bytes=0-99")]));
        assert_eq!(response.status(), Status::PARTIAL_CONTENT);
        assert_eq!(response.headers().get("Content-Range"), Some("bytes 0-99/1000"));
        assert_eq!(response.headers().get("Content-Length"), Some("100"));
        assert_eq!(response.headers().get("Accept-Ranges"), Some("bytes"));

        let (_, _, body) = response.into_parts();
        let body = body.collect().unwrap();
        assert_eq!(body.len(), 100);
        assert_eq!(body[99], 99);
    }

    #[test]
    fn test_invalid_range_degrades_to_416() {
        let f = finalizer(ServerConfig::default());
        let response = f.finalize(thousand_bytes(), &ctx(&[("Range", "bytes=zzz")]));
        assert_eq!(response.status(), Status::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers().get("Content-Range"), Some("bytes */1000"));
        assert!(response.headers().contains("Date"));

        let response = f.finalize(thousand_bytes(), &ctx(&[("Range", "bytes=5000-")]));
        assert_eq!(response.status(), Status::RANGE_NOT_SATISFIABLE);
    }

    #[test]
    fn test_no_range_serves_whole_body() {
        let f = finalizer(ServerConfig::default());
        let response = f.finalize(thousand_bytes(), &ctx(&[]));
        assert_eq!(response.status(), Status::OK);
        assert_eq!(response.headers().get("Content-Length"), Some("1000"));
        assert_eq!(response.headers().get("Accept-Ranges"), Some("bytes"));
    }

    #[test]
    fn test_fixed_body_compressed() {
        let f = finalizer(ServerConfig::default());
        let text = "compressible text ".repeat(100);
        let response = Response::text(Status::OK, text.clone());
        let response = f.finalize(response, &ctx(&[("Accept-Encoding", "gzip, deflate")]));

        assert_eq!(response.headers().get("Content-Encoding"), Some("gzip"));
        assert_eq!(response.headers().get("Vary"), Some("Accept-Encoding"));
        let len: usize = response.headers().get("Content-Length").unwrap().parse().unwrap();

        let (_, _, body) = response.into_parts();
        let body = body.collect().unwrap();
        assert_eq!(body.len(), len);
        let mut out = String::new();
        GzDecoder::new(&body[..]).read_to_string(&mut out).unwrap();
        assert_eq!(out, text);
    }

    #[test]
    fn test_compression_skipped() {
        let f = finalizer(ServerConfig::default());

        // Too small
        let response = f.finalize(Response::text(Status::OK, "tiny"), &ctx(&[("Accept-Encoding", "gzip")]));
        assert!(!response.headers().contains("Content-Encoding"));

        // Not an eligible type
        let response = Response::with_body(Status::OK, vec![0u8; 4096]).header("Content-Type", "image/png");
        let response = f.finalize(response, &ctx(&[("Accept-Encoding", "gzip")]));
        assert!(!response.headers().contains("Content-Encoding"));

        // Already encoded
        let response = Response::text(Status::OK, "x".repeat(4096)).header("Content-Encoding", "br");
        let response = f.finalize(response, &ctx(&[("Accept-Encoding", "gzip")]));
        assert_eq!(response.headers().get("Content-Encoding"), Some("br"));

        // Client did not ask
        let response = f.finalize(Response::text(Status::OK, "x".repeat(4096)), &ctx(&[]));
        assert!(!response.headers().contains("Content-Encoding"));
        assert_eq!(response.headers().get("Content-Length"), Some("4096"));
    }

    #[test]
    fn test_stream_compressed_without_length() {
        let f = finalizer(ServerConfig::default());
        let chunks: Vec<io::Result<Bytes>> = vec![Ok(Bytes::from("a".repeat(2000))), Ok(Bytes::from("b".repeat(2000)))];
        let response = Response::stream(Status::OK, Box::new(chunks.into_iter()))
            .header("Content-Type", "text/plain")
            .header("Content-Length", "4000");
        let response = f.finalize(response, &ctx(&[("Accept-Encoding", "gzip")]));
        assert_eq!(response.headers().get("Content-Encoding"), Some("gzip"));
        assert!(!response.headers().contains("Content-Length"));
    }

    #[test]
    fn test_incompressible_stream_sent_as_identity() {
        let f = finalizer(ServerConfig::default());
        let mut noise = vec![0u8; 2048];
        StdRng::seed_from_u64(11).fill_bytes(&mut noise);
        let chunks: Vec<io::Result<Bytes>> = vec![Ok(Bytes::from(noise.clone()))];
        let response = Response::stream(Status::OK, Box::new(chunks.into_iter())).header("Content-Type", "text/plain");
        let mut response = f.finalize(response, &ctx(&[("Accept-Encoding", "gzip")]));
        assert!(!response.headers().contains("Content-Encoding"));
        assert_eq!(response.headers().get("Vary"), Some("Accept-Encoding"));

        let Body::Stream(stream) = response.take_body() else {
            panic!("expected a stream");
        };
        let sent: Vec<u8> = stream.map(|c| c.unwrap()).collect::<Vec<_>>().concat();
        assert_eq!(sent, noise);
    }

    #[test]
    fn test_connection_and_status_override() {
        let mut config = ServerConfig::default();
        config.status_overrides.insert("404".to_string(), "<h1>gone fishing</h1>".to_string());
        let f = finalizer(config);

        let mut context = ctx(&[]);
        context.keep_alive = false;
        let response = f.finalize(Response::error(Status::NOT_FOUND), &context);
        assert_eq!(response.headers().get("Connection"), Some("close"));
        assert_eq!(response.headers().get("Content-Type"), Some("text/html; charset=utf-8"));
        assert_eq!(response.headers().get("Content-Length"), Some("21"));

        context.version = Version::Http2;
        let response = f.finalize(Response::new(Status::OK), &context);
        assert!(!response.headers().contains("Connection"));
    }

    #[test]
    fn test_bodiless_statuses() {
        let f = finalizer(ServerConfig::default());
        let response = Response::with_body(Status::NO_CONTENT, "ignored");
        let response = f.finalize(response, &ctx(&[]));
        assert!(!response.headers().contains("Content-Length"));
        assert_eq!(response.body().known_len(), Some(0));
    }
}
