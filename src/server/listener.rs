//! Listening socket

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;
use socket2::{Domain, Protocol, Socket, Type};

/// A bound, listening TCP socket shared by every accept loop
///
/// Clones share the same kernel socket, so threads and forked processes can
/// all accept from it.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind with `SO_REUSEADDR` and the given backlog
    pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog.max(1))?;
        // Acceptors poll first; a lost race must not block
        socket.set_nonblocking(true)?;

        let inner: TcpListener = socket.into();
        tracing::info!(addr = %inner.local_addr()?, backlog, "listening");
        Ok(Listener { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Listener {
            inner: self.inner.try_clone()?,
        })
    }

    /// Wait up to `timeout` for a connection
    ///
    /// `Ok(None)` when nothing arrived, so the caller can check for shutdown.
    /// With several acceptors on one socket a wakeup may find the connection
    /// already taken; that is also `Ok(None)`.
    pub fn accept_timeout(&self, timeout: Duration) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        let mut pfd = libc::pollfd {
            fd: self.inner.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        // SAFETY: one valid pollfd for the duration of the call
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::Interrupted => Ok(None),
                _ => Err(err),
            };
        }
        if ready == 0 {
            return Ok(None);
        }

        match self.inner.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Ok(Some((stream, peer)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Hand the socket to an event loop; needs a running tokio runtime
    pub fn into_tokio(self) -> io::Result<tokio::net::TcpListener> {
        tokio::net::TcpListener::from_std(self.inner)
    }
}
