//! Content-Encoding negotiation and compression
//!
//! Fixed bodies are compressed in one go with gzip or deflate (zlib
//! framing, as HTTP's `deflate` coding is defined). Streamed bodies are
//! gzip only: every chunk becomes an independent gzip member, so nothing of
//! the compressor survives between chunks and the concatenation is still a
//! valid gzip stream. A stream whose first chunk does not shrink is sent
//! without a content coding.

use crate::http::ChunkStream;
use bytes::Bytes;
use flate2::write::{GzEncoder, ZlibEncoder};
use std::io::{self, Write};

/// Compressed output must be below this share of the probe to be worth it
const WORTHWHILE_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Deflate,
}

impl Compression {
    /// Pick an encoding from an `Accept-Encoding` value
    ///
    /// Honours q-values; gzip wins ties and `*` counts as gzip. Encodings with
    /// `q=0` are refused.
    pub fn negotiate(accept_encoding: &str) -> Option<Self> {
        let mut best: Option<(Compression, f32)> = None;
        for part in accept_encoding.split(',') {
            let mut params = part.split(';');
            let coding = params.next().unwrap_or("").trim().to_ascii_lowercase();
            let q = params
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            if q <= 0.0 {
                continue;
            }
            let candidate = match coding.as_str() {
                "gzip" | "x-gzip" | "*" => Compression::Gzip,
                "deflate" => Compression::Deflate,
                _ => continue,
            };
            let better = match best {
                None => true,
                Some((current, best_q)) => {
                    q > best_q || (q == best_q && candidate == Compression::Gzip && current != Compression::Gzip)
                }
            };
            if better {
                best = Some((candidate, q));
            }
        }
        best.map(|(coding, _)| coding)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Deflate => "deflate",
        }
    }
}

/// Compress a whole body
pub fn compress_fixed(data: &[u8], coding: Compression, level: u32) -> io::Result<Vec<u8>> {
    let level = flate2::Compression::new(level.min(9));
    match coding {
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), level);
            encoder.write_all(data)?;
            encoder.finish()
        }
        Compression::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), level);
            encoder.write_all(data)?;
            encoder.finish()
        }
    }
}

/// Whether compressing `probe` saves enough to compress the rest
pub fn worth_compressing(probe: &[u8], level: u32) -> bool {
    if probe.is_empty() {
        return true;
    }
    match compress_fixed(probe, Compression::Gzip, level) {
        Ok(out) => (out.len() as f64) < probe.len() as f64 * WORTHWHILE_RATIO,
        Err(_) => false,
    }
}

/// How a streamed body goes on the wire
pub enum StreamEncoding {
    Gzip(CompressedStream),
    /// The probe did not shrink; the stream is passed through untouched
    Identity(ChunkStream),
}

/// Probe the first chunk of `inner` and decide whether to gzip the stream
///
/// The probed chunk is put back in front, so no data is lost either way. A
/// read error on the first chunk leaves the stream uncompressed and is
/// delivered in order.
pub fn encode_stream(mut inner: ChunkStream, level: u32, probe_size: usize) -> StreamEncoding {
    let first = loop {
        match inner.next() {
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            other => break other,
        }
    };
    let compress = match &first {
        Some(Ok(chunk)) => {
            let probe = &chunk[..chunk.len().min(probe_size.max(1))];
            let worth = worth_compressing(probe, level);
            if !worth {
                tracing::trace!(probe = probe.len(), "stream does not compress, sending identity");
            }
            worth
        }
        _ => false,
    };

    let rejoined: ChunkStream = Box::new(first.into_iter().chain(inner));
    if compress {
        StreamEncoding::Gzip(CompressedStream::new(rejoined, level))
    } else {
        StreamEncoding::Identity(rejoined)
    }
}

/// Gzip a chunk stream, one gzip member per chunk
pub struct CompressedStream {
    inner: ChunkStream,
    level: u32,
}

impl CompressedStream {
    pub fn new(inner: ChunkStream, level: u32) -> Self {
        CompressedStream { inner, level }
    }
}

impl Iterator for CompressedStream {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let chunk = match self.inner.next()? {
                Ok(chunk) => chunk,
                Err(e) => return Some(Err(e)),
            };
            if chunk.is_empty() {
                continue;
            }
            return Some(compress_fixed(&chunk, Compression::Gzip, self.level).map(Bytes::from));
        }
    }
}
