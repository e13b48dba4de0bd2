//! Chunked transfer coding
//!
//! The decoder is incremental: request framing feeds it whatever arrived from
//! the socket and keeps the unconsumed tail for the next read. The encoder
//! frames streamed response bodies of unknown length.

use super::parser::find_crlf;
use super::{Error, Result, CRLF};
use std::io::Write;

/// A chunk-size line longer than this is rejected
const MAX_SIZE_LINE: usize = 1024;

/// The terminating zero-size chunk with an empty trailer
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Frame one chunk; empty input frames nothing
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(data.len() + 12);
    out.extend_from_slice(format!("{:x}{}", data.len(), CRLF).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(CRLF.as_bytes());
    out
}

/// Chunked encoder over a writer
pub struct ChunkedEncoder<W: Write> {
    writer: W,
}

impl<W: Write> ChunkedEncoder<W> {
    pub fn new(writer: W) -> Self {
        ChunkedEncoder { writer }
    }

    /// Write a chunk of data; empty chunks are skipped since a zero size ends the body
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.writer.write_all(&encode_chunk(data))?;
        Ok(())
    }

    /// Write the final chunk
    pub fn finish(&mut self) -> Result<()> {
        self.writer.write_all(LAST_CHUNK)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Incremental chunked decoder
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecoderState,
    chunk_size: usize,
    chunk_read: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    ChunkSize,
    ChunkData,
    ChunkEnd,
    Trailer,
    Complete,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: DecoderState::ChunkSize,
            chunk_size: 0,
            chunk_read: 0,
        }
    }

    /// Decode from `input` into `output`
    ///
    /// Returns (bytes_consumed, bytes_decoded, is_complete). Unconsumed input
    /// holds an incomplete size line or chunk terminator and must be offered
    /// again together with the next read.
    pub fn decode(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize, bool)> {
        let mut input_pos = 0;
        let mut output_pos = 0;

        while input_pos < input.len() {
            match self.state {
                DecoderState::ChunkSize => {
                    let rest = &input[input_pos..];
                    let Some(crlf_pos) = find_crlf(rest) else {
                        if rest.len() > MAX_SIZE_LINE {
                            return Err(Error::InvalidChunkSize("size line too long".to_string()));
                        }
                        break;
                    };

                    let line = String::from_utf8_lossy(&rest[..crlf_pos]);
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    self.chunk_size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| Error::InvalidChunkSize(size_str.to_string()))?;

                    input_pos += crlf_pos + 2;
                    self.chunk_read = 0;
                    self.state = if self.chunk_size == 0 {
                        DecoderState::Trailer
                    } else {
                        DecoderState::ChunkData
                    };
                }

                DecoderState::ChunkData => {
                    let remaining_in_chunk = self.chunk_size - self.chunk_read;
                    let available_input = input.len() - input_pos;
                    let available_output = output.len() - output_pos;
                    let to_copy = remaining_in_chunk.min(available_input).min(available_output);
                    if to_copy == 0 {
                        break;
                    }

                    output[output_pos..output_pos + to_copy]
                        .copy_from_slice(&input[input_pos..input_pos + to_copy]);
                    input_pos += to_copy;
                    output_pos += to_copy;
                    self.chunk_read += to_copy;

                    if self.chunk_read == self.chunk_size {
                        self.state = DecoderState::ChunkEnd;
                    }
                }

                DecoderState::ChunkEnd => {
                    if input.len() - input_pos < 2 {
                        break;
                    }
                    if &input[input_pos..input_pos + 2] != b"\r\n" {
                        return Err(Error::Protocol("Expected CRLF after chunk".to_string()));
                    }
                    input_pos += 2;
                    self.state = DecoderState::ChunkSize;
                }

                DecoderState::Trailer => {
                    let rest = &input[input_pos..];
                    if rest.len() < 2 {
                        break;
                    }
                    if &rest[..2] == b"\r\n" {
                        input_pos += 2;
                        self.state = DecoderState::Complete;
                        break;
                    }
                    // Trailer fields are skipped
                    match find_crlf(rest) {
                        Some(crlf_pos) => input_pos += crlf_pos + 2,
                        None => break,
                    }
                }

                DecoderState::Complete => break,
            }
        }

        Ok((input_pos, output_pos, self.state == DecoderState::Complete))
    }

    /// Decode from `input`, appending to `output`
    ///
    /// Returns (bytes_consumed, is_complete).
    pub fn decode_into(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(usize, bool)> {
        let start = output.len();
        // Decoded data is never longer than its encoding
        output.resize(start + input.len(), 0);
        let result = self.decode(input, &mut output[start..]);
        match result {
            Ok((consumed, decoded, complete)) => {
                output.truncate(start + decoded);
                Ok((consumed, complete))
            }
            Err(e) => {
                output.truncate(start);
                Err(e)
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == DecoderState::Complete
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::ChunkSize;
        self.chunk_size = 0;
        self.chunk_read = 0;
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a complete chunked body
pub fn decode_chunked_body(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ChunkedDecoder::new();
    let mut output = Vec::with_capacity(input.len());
    let (_, complete) = decoder.decode_into(input, &mut output)?;
    if !complete {
        return Err(Error::Incomplete);
    }
    Ok(output)
}

/// Encode data as a chunked body split at `chunk_size`
pub fn encode_chunked_body(data: &[u8], chunk_size: usize) -> Result<Vec<u8>> {
    let mut encoder = ChunkedEncoder::new(Vec::new());
    for chunk in data.chunks(chunk_size.max(1)) {
        encoder.write_chunk(chunk)?;
    }
    encoder.finish()?;
    Ok(encoder.into_inner())
}
