//! Event loop sockets
//!
//! [`AsyncXSocket`] suspends on I/O instead of blocking. `receive` is safe to
//! use as a `select!` branch: the only await point is the network read, and
//! bytes are fed into the TLS engine synchronously after it completes.

use super::tls::{HandshakeStatus, PlainRead, TlsConfig, TlsEngine};
use super::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const READ_CHUNK: usize = 16 * 1024;

/// Session operations that suspend instead of blocking
pub trait AsyncSessionOps: Send {
    /// Receive up to `buf.len()` bytes; `Ok(0)` means the peer closed
    fn receive(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Write all of `data`
    fn send_all(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Close the session
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Plain or TLS socket driven by the event loop
pub struct AsyncXSocket {
    stream: TcpStream,
    tls: Option<TlsEngine>,
    peer: Option<SocketAddr>,
    scratch: Box<[u8]>,
}

impl AsyncXSocket {
    pub(crate) fn from_parts(
        stream: TcpStream,
        tls: Option<TlsEngine>,
        peer: Option<SocketAddr>,
    ) -> Self {
        AsyncXSocket {
            stream,
            tls,
            peer,
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Wrap an accepted tokio stream as a plain socket
    pub fn from_tokio(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self::from_parts(stream, None, peer)
    }

    /// Adopt a std stream accepted elsewhere; needs a running tokio runtime
    pub fn from_std(stream: std::net::TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::from_tokio(TcpStream::from_std(stream)?))
    }

    /// Connect to a plain TCP endpoint
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_tokio(stream))
    }

    /// Wrap an accepted stream and run the server side of the TLS handshake
    pub async fn accept_tls(stream: TcpStream, config: &TlsConfig, timeout: Duration) -> Result<Self> {
        let mut socket = Self::from_tokio(stream);
        socket.tls = Some(TlsEngine::server(config)?);
        socket.do_handshake(timeout).await?;
        Ok(socket)
    }

    /// Connect to a TLS endpoint and run the client side of the handshake
    pub async fn connect_tls(
        addr: SocketAddr,
        config: &TlsConfig,
        servername: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut socket = Self::connect(addr).await?;
        socket.tls = Some(TlsEngine::client(config, servername)?);
        socket.do_handshake(timeout).await?;
        Ok(socket)
    }

    /// Drive the TLS handshake to completion within `timeout`
    pub async fn do_handshake(&mut self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.handshake_inner()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn handshake_inner(&mut self) -> Result<()> {
        loop {
            let status = match self.tls.as_mut() {
                Some(engine) => engine.handshake_step()?,
                None => return Ok(()),
            };
            self.flush_ciphertext().await?;

            match status {
                HandshakeStatus::Complete => return Ok(()),
                HandshakeStatus::WantWrite => continue,
                HandshakeStatus::WantRead => {
                    if self.fill_ciphertext().await? == 0 {
                        return Err(Error::Closed);
                    }
                }
            }
        }
    }

    async fn flush_ciphertext(&mut self) -> Result<()> {
        if let Some(engine) = self.tls.as_mut() {
            if engine.has_ciphertext() {
                let data = engine.take_ciphertext();
                self.stream.write_all(&data).await?;
            }
        }
        Ok(())
    }

    async fn fill_ciphertext(&mut self) -> Result<usize> {
        let n = self.stream.read(&mut self.scratch).await?;
        if let Some(engine) = self.tls.as_mut() {
            if n == 0 {
                engine.feed_eof();
            } else {
                engine.feed_ciphertext(&self.scratch[..n]);
            }
        }
        Ok(n)
    }

    /// Peer address
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether this socket carries TLS
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Protocol negotiated through ALPN
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.tls.as_ref().and_then(|engine| engine.alpn_protocol())
    }

    /// Receive up to `buf.len()` bytes; `Ok(0)` means the peer closed
    ///
    /// Cancel safe. Ciphertext produced while decrypting (key updates and the
    /// like) is queued and goes out with the next `send_all`.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.tls.is_none() {
            return Ok(self.stream.read(buf).await?);
        }

        loop {
            let outcome = match self.tls.as_mut() {
                Some(engine) => engine.read_plaintext(buf)?,
                None => return Err(Error::Closed),
            };
            match outcome {
                PlainRead::Data(n) => return Ok(n),
                PlainRead::Eof => return Ok(0),
                PlainRead::WantRead => {
                    self.fill_ciphertext().await?;
                }
            }
        }
    }

    /// Write all of `data`
    pub async fn send_all(&mut self, mut data: &[u8]) -> Result<()> {
        if self.tls.is_none() {
            self.stream.write_all(data).await?;
            return Ok(());
        }

        while !data.is_empty() {
            let n = match self.tls.as_mut() {
                Some(engine) => engine.write_plaintext(data)?,
                None => return Err(Error::Closed),
            };
            data = &data[n..];
        }
        self.flush_ciphertext().await
    }

    /// Send close_notify if TLS and shut the write side down
    pub async fn close(&mut self) -> Result<()> {
        if let Some(engine) = self.tls.as_mut() {
            engine.shutdown();
        }
        let _ = self.flush_ciphertext().await;
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from_io(e)),
        }
    }
}

impl AsyncSessionOps for AsyncXSocket {
    fn receive(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send {
        AsyncXSocket::receive(self, buf)
    }

    fn send_all(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send {
        AsyncXSocket::send_all(self, data)
    }

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send {
        AsyncXSocket::close(self)
    }
}

/// In-memory pipes stand in for sockets in tests and local tooling
impl AsyncSessionOps for tokio::io::DuplexStream {
    fn receive(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send {
        async move { Ok(self.read(buf).await?) }
    }

    fn send_all(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send {
        async move { Ok(self.write_all(data).await?) }
    }

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send {
        async move { Ok(self.shutdown().await?) }
    }
}
