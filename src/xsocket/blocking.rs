//! Blocking transport sockets
//!
//! [`SessionOps`] is the blocking I/O surface worker threads program against.
//! [`XSocket`] implements it for plain TCP and for TLS over the memory-buffer
//! engine.

use super::event_loop::ensure_blocking_allowed;
use super::nonblocking::AsyncXSocket;
use super::tls::{HandshakeStatus, PlainRead, TlsConfig, TlsEngine};
use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

/// Size of one network read
const READ_CHUNK: usize = 16 * 1024;

/// Session operations trait
///
/// Blocking operations over a connected transport. Every call fails with
/// [`Error::BlockingOnEventLoop`] when made from an event loop thread.
pub trait SessionOps {
    /// Poll the session for events
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the session; `Ok(0)` means the peer closed
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Close the session
    fn close(&mut self) -> Result<()>;

    /// Write all of `data`
    fn send_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write(data)?;
            if n == 0 {
                return Err(Error::Closed);
            }
            data = &data[n..];
        }
        Ok(())
    }
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

fn poll_fd(stream: &TcpStream, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd: stream.as_raw_fd(),
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1); // -1 = infinite

    loop {
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::from_io(err));
        }
        return Ok(result > 0);
    }
}

/// Blocking plain or TLS socket
pub struct XSocket {
    stream: TcpStream,
    tls: Option<TlsEngine>,
    timeout: Option<Duration>,
    peer: Option<SocketAddr>,
    scratch: Box<[u8]>,
}

impl XSocket {
    fn from_parts(stream: TcpStream, tls: Option<TlsEngine>) -> Self {
        let peer = stream.peer_addr().ok();
        XSocket {
            stream,
            tls,
            timeout: Some(Duration::from_secs(10)),
            peer,
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Wrap an accepted plain TCP connection
    pub fn accept_plain(stream: TcpStream) -> Self {
        Self::from_parts(stream, None)
    }

    /// Wrap an accepted connection and run the server side of the TLS handshake
    pub fn accept_tls(stream: TcpStream, config: &TlsConfig, timeout: Duration) -> Result<Self> {
        let engine = TlsEngine::server(config)?;
        let mut socket = Self::from_parts(stream, Some(engine));
        socket.do_handshake(timeout)?;
        Ok(socket)
    }

    /// Connect to a plain TCP endpoint
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        ensure_blocking_allowed()?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self::from_parts(stream, None))
    }

    /// Connect to a TLS endpoint and run the client side of the handshake
    pub fn connect_tls(
        addr: SocketAddr,
        config: &TlsConfig,
        servername: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut socket = Self::connect(addr, timeout)?;
        socket.tls = Some(TlsEngine::client(config, servername)?);
        socket.do_handshake(timeout)?;
        Ok(socket)
    }

    /// Drive the TLS handshake to completion within `timeout`
    ///
    /// A no-op for plain sockets.
    pub fn do_handshake(&mut self, timeout: Duration) -> Result<()> {
        ensure_blocking_allowed()?;
        let deadline = Instant::now() + timeout;

        loop {
            let status = match self.tls.as_mut() {
                Some(engine) => engine.handshake_step()?,
                None => return Ok(()),
            };
            self.flush_ciphertext()?;

            match status {
                HandshakeStatus::Complete => {
                    if let Some(engine) = self.tls.as_ref() {
                        tracing::trace!(
                            version = engine.version(),
                            alpn = ?engine.alpn_protocol().map(String::from_utf8_lossy),
                            "TLS handshake complete"
                        );
                    }
                    return Ok(());
                }
                HandshakeStatus::WantWrite => continue,
                HandshakeStatus::WantRead => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::Timeout);
                    }
                    if self.fill_ciphertext(Some(remaining))? == 0 {
                        return Err(Error::Closed);
                    }
                }
            }
        }
    }

    /// Write pending ciphertext to the network
    fn flush_ciphertext(&mut self) -> Result<()> {
        if let Some(engine) = self.tls.as_mut() {
            if engine.has_ciphertext() {
                let data = engine.take_ciphertext();
                self.stream.write_all(&data)?;
            }
        }
        Ok(())
    }

    /// Read one batch of ciphertext from the network into the engine
    fn fill_ciphertext(&mut self, timeout: Option<Duration>) -> Result<usize> {
        if !poll_fd(&self.stream, PollEvents::Read, timeout)? {
            return Err(Error::Timeout);
        }
        let n = self.stream.read(&mut self.scratch)?;
        if let Some(engine) = self.tls.as_mut() {
            if n == 0 {
                engine.feed_eof();
            } else {
                engine.feed_ciphertext(&self.scratch[..n]);
            }
        }
        Ok(n)
    }

    /// Receive up to `buf.len()` bytes; `Ok(0)` means the peer closed
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read(buf)
    }

    /// Set the timeout for subsequent reads and writes
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Get the timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Peer address captured at accept/connect time
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

    /// Hand this connection to the event loop
    ///
    /// Must be called from within a tokio runtime. The TLS session, including
    /// any buffered ciphertext, moves with it.
    pub fn into_async(self) -> Result<AsyncXSocket> {
        self.stream.set_nonblocking(true)?;
        let stream = tokio::net::TcpStream::from_std(self.stream)?;
        Ok(AsyncXSocket::from_parts(stream, self.tls, self.peer))
    }
}

impl SessionOps for XSocket {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        if events != PollEvents::Write {
            if let Some(engine) = self.tls.as_ref() {
                if engine.has_buffered_input() {
                    return Ok(true);
                }
            }
        }
        poll_fd(&self.stream, events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        ensure_blocking_allowed()?;

        if self.tls.is_none() {
            if !poll_fd(&self.stream, PollEvents::Read, self.timeout)? {
                return Err(Error::Timeout);
            }
            return Ok(self.stream.read(buf)?);
        }

        loop {
            let outcome = match self.tls.as_mut() {
                Some(engine) => engine.read_plaintext(buf)?,
                None => return Err(Error::Closed),
            };
            self.flush_ciphertext()?;

            match outcome {
                PlainRead::Data(n) => return Ok(n),
                PlainRead::Eof => return Ok(0),
                PlainRead::WantRead => {
                    self.fill_ciphertext(self.timeout)?;
                }
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        ensure_blocking_allowed()?;

        if !poll_fd(&self.stream, PollEvents::Write, self.timeout)? {
            return Err(Error::Timeout);
        }

        match self.tls.as_mut() {
            Some(engine) => {
                let n = engine.write_plaintext(buf)?;
                self.flush_ciphertext()?;
                Ok(n)
            }
            None => Ok(self.stream.write(buf)?),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(engine) = self.tls.as_mut() {
            engine.shutdown();
        }
        // The peer may already be gone; close_notify is best effort
        let _ = self.flush_ciphertext();

        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from_io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xsocket::event_loop;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_plain_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut socket = XSocket::accept_plain(stream);
            let mut buf = [0u8; 5];
            let n = socket.receive(&mut buf).unwrap();
            socket.send_all(&buf[..n]).unwrap();
        });

        let mut client = XSocket::connect(addr, Duration::from_secs(1)).unwrap();
        client.send_all(b"Hello").unwrap();

        let mut buf = [0u8; 5];
        let n = client.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello");

        handle.join().unwrap();
    }

    #[test]
    fn test_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let _handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(1));
        });

        let mut client = XSocket::connect(addr, Duration::from_secs(1)).unwrap();
        client.set_timeout(Some(Duration::from_millis(100)));

        let mut buf = [0u8; 10];
        assert!(matches!(client.receive(&mut buf), Err(Error::Timeout)));
    }

    #[test]
    fn test_blocking_call_on_event_loop_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let mut socket = XSocket::accept_plain(stream);

        let _guard = event_loop::enter();
        let mut buf = [0u8; 4];
        assert!(matches!(
            socket.receive(&mut buf),
            Err(Error::BlockingOnEventLoop)
        ));
        assert!(matches!(socket.write(b"x"), Err(Error::BlockingOnEventLoop)));
    }

    #[test]
    fn test_tls_roundtrip() {
        let server_config = TlsConfig::server()
            .unwrap()
            .allow_builtin_cert(true)
            .alpn(&["http/1.1"])
            .unwrap()
            .build()
            .unwrap();
        let client_config = TlsConfig::client()
            .unwrap()
            .verify_peer(false)
            .alpn(&["http/1.1"])
            .unwrap()
            .build();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut socket =
                XSocket::accept_tls(stream, &server_config, Duration::from_secs(2)).unwrap();
            assert_eq!(socket.alpn_protocol(), Some(&b"http/1.1"[..]));

            let mut buf = [0u8; 32];
            let n = socket.receive(&mut buf).unwrap();
            socket.send_all(&buf[..n]).unwrap();
            socket.close().unwrap();
        });

        let mut client = XSocket::connect_tls(
            addr,
            &client_config,
            Some("example.com"),
            Duration::from_secs(2),
        )
        .unwrap();
        client.send_all(b"ping over tls").unwrap();

        let mut buf = [0u8; 32];
        let n = client.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping over tls");

        handle.join().unwrap();
    }

    #[test]
    fn test_tls_handshake_timeout() {
        let server_config = TlsConfig::server()
            .unwrap()
            .allow_builtin_cert(true)
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Client connects but never speaks TLS
        let _client = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();

        let result = XSocket::accept_tls(stream, &server_config, Duration::from_millis(100));
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
