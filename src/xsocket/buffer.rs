//! In-memory ciphertext buffers
//!
//! [`MemoryBio`] is the transport the TLS engine reads from and writes to.
//! Incoming ciphertext is fed by the socket layer; outgoing ciphertext is
//! drained by the socket layer and written to the network.

use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Ciphertext buffer pair
#[derive(Debug, Default)]
pub struct MemoryBio {
    incoming: BytesMut,
    outgoing: BytesMut,
    eof: bool,
}

impl MemoryBio {
    /// Create an empty buffer pair
    pub fn new() -> Self {
        Self::default()
    }

    /// Append ciphertext received from the network
    pub fn feed(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    /// Mark the network side as closed
    ///
    /// Once the incoming buffer drains, reads report end-of-stream instead of
    /// "would block".
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Whether the network side has closed
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Take all ciphertext waiting to be written to the network
    pub fn take_outgoing(&mut self) -> Bytes {
        self.outgoing.split().freeze()
    }

    /// Bytes of ciphertext waiting to be written
    pub fn pending_outgoing(&self) -> usize {
        self.outgoing.len()
    }

    /// Bytes of ciphertext not yet consumed by the engine
    pub fn pending_incoming(&self) -> usize {
        self.incoming.len()
    }
}

impl Read for MemoryBio {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            if self.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let n = buf.len().min(self.incoming.len());
        buf[..n].copy_from_slice(&self.incoming[..n]);
        self.incoming.advance(n);
        Ok(n)
    }
}

impl Write for MemoryBio {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
