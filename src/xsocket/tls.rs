//! TLS configuration and the memory-buffer TLS engine
//!
//! [`TlsConfig`] wraps an immutable OpenSSL context built once at startup.
//! [`TlsEngine`] is one TLS session running over a [`MemoryBio`]; it never
//! touches a socket, so the caller decides how ciphertext moves.

use super::buffer::MemoryBio;
use super::builtin_cert::DEV_CERT_PEM;
use super::{Error, Result};
use bytes::Bytes;
use openssl::pkey::PKey;
use openssl::ssl::{
    self, AlpnError, ErrorCode, Ssl, SslContext, SslContextBuilder, SslMethod, SslStream,
    SslVerifyMode, SslVersion,
};
use openssl::x509::X509;
use std::fs;
use std::io;
use std::path::Path;

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Parse TLS version from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(Error::InvalidTlsVersion(s.to_string())),
        }
    }

    fn to_openssl_version(self) -> SslVersion {
        match self {
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// Encode protocol names in ALPN wire format (length-prefixed)
fn alpn_wire(protocols: &[&str]) -> Vec<u8> {
    let mut wire = Vec::new();
    for proto in protocols {
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    wire
}

/// Pick the first server protocol the client offered
///
/// The match is returned as a sub-slice of `client_protos` so it lives as
/// long as OpenSSL's buffer does.
fn select_alpn<'a>(server_protos: &[Vec<u8>], client_protos: &'a [u8]) -> Option<&'a [u8]> {
    let mut offered = Vec::new();
    let mut pos = 0;
    while pos < client_protos.len() {
        let len = client_protos[pos] as usize;
        pos += 1;
        if pos + len > client_protos.len() {
            break;
        }
        offered.push(&client_protos[pos..pos + len]);
        pos += len;
    }

    server_protos
        .iter()
        .find_map(|proto| offered.iter().copied().find(|c| *c == proto.as_slice()))
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) is_server: bool,
}

impl TlsConfig {
    /// Create a server configuration builder
    pub fn server() -> Result<ServerConfigBuilder> {
        ServerConfigBuilder::new()
    }

    /// Create a client configuration builder
    pub fn client() -> Result<ClientConfigBuilder> {
        ClientConfigBuilder::new()
    }

    /// Whether this configuration accepts connections
    pub fn is_server(&self) -> bool {
        self.is_server
    }
}

/// Server configuration builder
pub struct ServerConfigBuilder {
    ctx_builder: SslContextBuilder,
    has_cert: bool,
    allow_builtin_cert: bool,
}

impl ServerConfigBuilder {
    fn new() -> Result<Self> {
        let ctx_builder = SslContextBuilder::new(SslMethod::tls_server())?;
        Ok(ServerConfigBuilder {
            ctx_builder,
            has_cert: false,
            allow_builtin_cert: false,
        })
    }

    /// Set the minimum accepted protocol version
    pub fn min_version(mut self, version: TlsVersion) -> Result<Self> {
        self.ctx_builder
            .set_min_proto_version(Some(version.to_openssl_version()))?;
        Ok(self)
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(mut self, ciphers: &str) -> Result<Self> {
        self.ctx_builder.set_cipher_list(ciphers)?;
        Ok(self)
    }

    /// Set ALPN protocols in server preference order
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self> {
        let server_protos: Vec<Vec<u8>> =
            protocols.iter().map(|p| p.as_bytes().to_vec()).collect();

        self.ctx_builder
            .set_alpn_select_callback(move |_ssl, client_protos| {
                select_alpn(&server_protos, client_protos).ok_or(AlpnError::NOACK)
            });

        Ok(self)
    }

    /// Load the certificate chain and private key
    ///
    /// `key` may be `None` when the key is bundled in the certificate PEM.
    pub fn cert_files<P: AsRef<Path>>(mut self, cert: P, key: Option<P>) -> Result<Self> {
        let cert_pem = fs::read(cert.as_ref()).map_err(|e| {
            Error::Certificate(format!("{}: {}", cert.as_ref().display(), e))
        })?;
        let key_pem = match key {
            Some(path) => fs::read(path.as_ref()).map_err(|e| {
                Error::Certificate(format!("{}: {}", path.as_ref().display(), e))
            })?,
            None => cert_pem.clone(),
        };

        self.load_pem(&cert_pem, &key_pem)?;
        Ok(self)
    }

    /// Fall back to the development certificate if no certificate is loaded
    pub fn allow_builtin_cert(mut self, allow: bool) -> Self {
        self.allow_builtin_cert = allow;
        self
    }

    fn load_pem(&mut self, cert_pem: &[u8], key_pem: &[u8]) -> Result<()> {
        let mut chain = X509::stack_from_pem(cert_pem)
            .map_err(|e| Error::Certificate(format!("Failed to load certificate: {}", e)))?
            .into_iter();

        let leaf = chain
            .next()
            .ok_or_else(|| Error::Certificate("No certificate found in PEM".to_string()))?;
        self.ctx_builder.set_certificate(&leaf)?;
        for extra in chain {
            self.ctx_builder.add_extra_chain_cert(extra)?;
        }

        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|e| Error::Certificate(format!("Failed to load private key: {}", e)))?;
        self.ctx_builder.set_private_key(&key)?;
        self.ctx_builder
            .check_private_key()
            .map_err(|e| Error::Certificate(format!("Key does not match certificate: {}", e)))?;

        self.has_cert = true;
        Ok(())
    }

    /// Build the TLS configuration
    pub fn build(mut self) -> Result<TlsConfig> {
        if !self.has_cert {
            if !self.allow_builtin_cert {
                return Err(Error::Certificate(
                    "No certificate configured".to_string(),
                ));
            }
            tracing::warn!("Using the built-in development certificate");
            self.load_pem(DEV_CERT_PEM.as_bytes(), DEV_CERT_PEM.as_bytes())?;
        }

        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: true,
        })
    }
}

/// Client configuration builder, used for TLS backends and tests
pub struct ClientConfigBuilder {
    ctx_builder: SslContextBuilder,
}

impl ClientConfigBuilder {
    fn new() -> Result<Self> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_client())?;
        ctx_builder.set_verify(SslVerifyMode::PEER);
        ctx_builder.set_default_verify_paths()?;
        Ok(ClientConfigBuilder { ctx_builder })
    }

    /// Set ALPN protocols
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self> {
        self.ctx_builder.set_alpn_protos(&alpn_wire(protocols))?;
        Ok(self)
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        let mode = if verify {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        };
        self.ctx_builder.set_verify(mode);
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> TlsConfig {
        TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: false,
        }
    }
}

/// Outcome of one handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Handshake finished; plaintext I/O may begin
    Complete,
    /// The engine needs more ciphertext from the peer
    WantRead,
    /// The engine produced ciphertext that must be flushed first
    WantWrite,
}

/// Outcome of a plaintext read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlainRead {
    /// This many plaintext bytes were produced
    Data(usize),
    /// More ciphertext is needed
    WantRead,
    /// The peer closed the TLS session or the transport
    Eof,
}

/// Reasons OpenSSL reports when the client, not the server, is at fault
const CLIENT_MISTAKE_REASONS: &[&str] = &[
    "http request",
    "https proxy request",
    "wrong version number",
    "unknown protocol",
    "unsupported protocol",
    "version too low",
    "no shared cipher",
    "unknown ca",
    "bad certificate",
    "certificate unknown",
    "unexpected eof",
];

fn classify(err: ssl::Error) -> Error {
    if let Some(io_err) = err.io_error() {
        return Error::from_io(io::Error::new(io_err.kind(), io_err.to_string()));
    }

    let message = err.to_string();
    let client_mistake = err
        .ssl_error()
        .map(|stack| {
            stack.errors().iter().any(|e| {
                e.reason()
                    .map(|reason| {
                        let reason = reason.to_ascii_lowercase();
                        CLIENT_MISTAKE_REASONS.iter().any(|m| reason.contains(m))
                    })
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);

    if client_mistake || err.code() == ErrorCode::SYSCALL {
        Error::TlsProtocol(message)
    } else {
        Error::Tls(message)
    }
}

/// One TLS session over an in-memory ciphertext buffer pair
pub struct TlsEngine {
    stream: SslStream<MemoryBio>,
    is_server: bool,
    handshake_done: bool,
    failed: bool,
}

impl TlsEngine {
    /// Create the server side of a session
    pub fn server(config: &TlsConfig) -> Result<Self> {
        let ssl = Ssl::new(&config.ctx)?;
        Ok(TlsEngine {
            stream: SslStream::new(ssl, MemoryBio::new())?,
            is_server: true,
            handshake_done: false,
            failed: false,
        })
    }

    /// Create the client side of a session
    pub fn client(config: &TlsConfig, servername: Option<&str>) -> Result<Self> {
        let mut ssl = Ssl::new(&config.ctx)?;
        if let Some(name) = servername {
            ssl.set_hostname(name)?;
        }
        Ok(TlsEngine {
            stream: SslStream::new(ssl, MemoryBio::new())?,
            is_server: false,
            handshake_done: false,
            failed: false,
        })
    }

    /// Advance the handshake as far as the buffered ciphertext allows
    pub fn handshake_step(&mut self) -> Result<HandshakeStatus> {
        if self.handshake_done {
            return Ok(HandshakeStatus::Complete);
        }

        let result = if self.is_server {
            self.stream.accept()
        } else {
            self.stream.connect()
        };

        match result {
            Ok(()) => {
                self.handshake_done = true;
                Ok(HandshakeStatus::Complete)
            }
            Err(e) => match e.code() {
                ErrorCode::WANT_READ if self.stream.get_ref().is_eof() => {
                    self.failed = true;
                    Err(Error::Closed)
                }
                ErrorCode::WANT_READ => Ok(HandshakeStatus::WantRead),
                ErrorCode::WANT_WRITE => Ok(HandshakeStatus::WantWrite),
                _ => {
                    self.failed = true;
                    Err(classify(e))
                }
            },
        }
    }

    /// Whether the handshake has completed
    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_done
    }

    /// Feed ciphertext received from the network
    pub fn feed_ciphertext(&mut self, data: &[u8]) {
        self.stream.get_mut().feed(data);
    }

    /// Record that the network side closed
    pub fn feed_eof(&mut self) {
        self.stream.get_mut().set_eof();
    }

    /// Take ciphertext that must be written to the network
    pub fn take_ciphertext(&mut self) -> Bytes {
        self.stream.get_mut().take_outgoing()
    }

    /// Whether ciphertext is waiting to be written
    pub fn has_ciphertext(&self) -> bool {
        self.stream.get_ref().pending_outgoing() > 0
    }

    /// Whether a read could make progress without touching the network
    pub fn has_buffered_input(&self) -> bool {
        self.stream.ssl().pending() > 0 || self.stream.get_ref().pending_incoming() > 0
    }

    /// Encrypt plaintext into the outgoing buffer
    pub fn write_plaintext(&mut self, data: &[u8]) -> Result<usize> {
        if !self.handshake_done {
            return Err(Error::HandshakeIncomplete);
        }
        if data.is_empty() {
            return Ok(0);
        }

        match self.stream.ssl_write(data) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(classify(e))
            }
        }
    }

    /// Decrypt buffered ciphertext into `buf`
    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<PlainRead> {
        if !self.handshake_done {
            return Err(Error::HandshakeIncomplete);
        }
        if buf.is_empty() {
            return Ok(PlainRead::Data(0));
        }

        match self.stream.ssl_read(buf) {
            Ok(0) => Ok(PlainRead::Eof),
            Ok(n) => Ok(PlainRead::Data(n)),
            Err(e) => match e.code() {
                ErrorCode::ZERO_RETURN => Ok(PlainRead::Eof),
                ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
                    if self.stream.get_ref().is_eof() {
                        Ok(PlainRead::Eof)
                    } else {
                        Ok(PlainRead::WantRead)
                    }
                }
                ErrorCode::SYSCALL if e.io_error().is_none() => Ok(PlainRead::Eof),
                _ => {
                    self.failed = true;
                    Err(classify(e))
                }
            },
        }
    }

    /// Queue a close_notify alert unless the session already failed
    pub fn shutdown(&mut self) {
        if self.handshake_done && !self.failed {
            let _ = self.stream.shutdown();
        }
    }

    /// Protocol selected through ALPN, if any
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.stream.ssl().selected_alpn_protocol()
    }

    /// Negotiated protocol version, for logging
    pub fn version(&self) -> &'static str {
        self.stream.ssl().version_str()
    }
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("is_server", &self.is_server)
            .field("handshake_done", &self.handshake_done)
            .field("failed", &self.failed)
            .finish()
    }
}
