//! permessage-deflate (RFC 7692)
//!
//! Messages are compressed as raw DEFLATE ended by a sync flush; the trailing
//! `00 00 ff ff` is stripped before sending and put back before inflating.
//! Window sizes other than the default 15 bits are declined during
//! negotiation.

use super::{Error, Result};
use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const EXTENSION: &str = "permessage-deflate";
const WINDOW_BITS: &str = "15";

/// Negotiated extension parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeflateParams {
    /// We reset our compressor after every message
    pub server_no_context_takeover: bool,
    /// The client resets its compressor, so we reset our inflater
    pub client_no_context_takeover: bool,
}

impl DeflateParams {
    /// `Sec-WebSocket-Extensions` value for the 101 response
    pub fn response_header(&self) -> String {
        let mut value = EXTENSION.to_string();
        if self.server_no_context_takeover {
            value.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            value.push_str("; client_no_context_takeover");
        }
        value
    }
}

/// Pick the first acceptable permessage-deflate offer
///
/// `header` is the client's `Sec-WebSocket-Extensions` value, which may list
/// several offers separated by commas.
pub fn negotiate_deflate(header: &str) -> Option<DeflateParams> {
    'offers: for offer in header.split(',') {
        let mut parts = offer.split(';').map(str::trim);
        if !parts.next().is_some_and(|name| name.eq_ignore_ascii_case(EXTENSION)) {
            continue;
        }

        let mut params = DeflateParams::default();
        for param in parts.filter(|p| !p.is_empty()) {
            let (name, value) = match param.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (param, None),
            };
            match (name, value) {
                ("server_no_context_takeover", None) => params.server_no_context_takeover = true,
                ("client_no_context_takeover", None) => params.client_no_context_takeover = true,
                ("server_max_window_bits", Some(WINDOW_BITS)) => {}
                ("client_max_window_bits", _) => {}
                _ => {
                    tracing::debug!(param, "declining permessage-deflate offer");
                    continue 'offers;
                }
            }
        }
        return Some(params);
    }
    None
}

/// Compression state for one session
pub struct PerMessageDeflate {
    params: DeflateParams,
    compress: Compress,
    decompress: Decompress,
}

impl PerMessageDeflate {
    pub fn new(params: DeflateParams, level: u32) -> Self {
        PerMessageDeflate {
            params,
            compress: Compress::new(Compression::new(level.min(9)), false),
            decompress: Decompress::new(false),
        }
    }

    pub fn params(&self) -> DeflateParams {
        self.params
    }

    /// Compress one outgoing message payload
    pub fn compress(&mut self, data: &[u8]) -> Result<Bytes> {
        if self.params.server_no_context_takeover {
            self.compress.reset();
        }

        let mut output = Vec::with_capacity(data.len() / 2 + 64);
        let start_in = self.compress.total_in();
        loop {
            if output.len() == output.capacity() {
                output.reserve(4096);
            }
            let consumed = (self.compress.total_in() - start_in) as usize;
            self.compress
                .compress_vec(&data[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;

            // The flush is done once all input is in and output space is left over
            let consumed = (self.compress.total_in() - start_in) as usize;
            if consumed == data.len() && output.len() < output.capacity() {
                break;
            }
        }

        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }
        Ok(Bytes::from(output))
    }

    /// Inflate one incoming message payload, failing past `max_size` bytes
    pub fn decompress(&mut self, data: &[u8], max_size: usize) -> Result<Bytes> {
        if self.params.client_no_context_takeover {
            self.decompress.reset(false);
        }

        let mut input = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let mut output = Vec::with_capacity((data.len() * 4).clamp(1024, max_size.max(1024)));
        let start_in = self.decompress.total_in();
        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(4096));
            }
            let consumed = (self.decompress.total_in() - start_in) as usize;
            let before_out = output.len();
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;

            if output.len() > max_size {
                return Err(Error::MessageTooLarge(output.len()));
            }
            let now_consumed = (self.decompress.total_in() - start_in) as usize;
            if status == Status::StreamEnd
                || (now_consumed == input.len() && output.len() < output.capacity())
            {
                break;
            }
            if now_consumed == consumed && output.len() == before_out {
                return Err(Error::Compression("truncated deflate stream".to_string()));
            }
        }
        Ok(Bytes::from(output))
    }
}
