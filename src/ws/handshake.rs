//! Opening handshake (RFC 6455 Section 4.2)

use super::deflate::{negotiate_deflate, DeflateParams};
use crate::config::WebSocketConfig;
use crate::http::{Method, Request, Response, Status, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

/// Appended to the client key before hashing
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Lowest `Sec-WebSocket-Version` accepted
pub const MIN_VERSION: u32 = 13;

/// `Sec-WebSocket-Accept` for a client key
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Whether a request asks for a WebSocket upgrade at all
pub fn is_upgrade_request(request: &Request) -> bool {
    request.headers().has_token("Upgrade", "websocket")
}

/// Why an upgrade was refused; answered with a plain HTTP response
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("WebSocket support is disabled")]
    Disabled,

    #[error("Not a WebSocket upgrade: {0}")]
    NotUpgrade(&'static str),

    #[error("Missing or malformed Sec-WebSocket-Key")]
    BadKey,

    #[error("Unsupported WebSocket version {0:?}")]
    UnsupportedVersion(Option<String>),

    #[error("Origin {0} is not allowed")]
    OriginRejected(String),
}

impl HandshakeError {
    pub fn status(&self) -> Status {
        match self {
            HandshakeError::Disabled => Status::NOT_FOUND,
            HandshakeError::NotUpgrade(_) | HandshakeError::BadKey => Status::BAD_REQUEST,
            HandshakeError::UnsupportedVersion(_) => Status::UPGRADE_REQUIRED,
            HandshakeError::OriginRejected(_) => Status::FORBIDDEN,
        }
    }

    pub fn into_response(self) -> Response {
        let status = self.status();
        let response = Response::text(status, self.to_string());
        match self {
            HandshakeError::UnsupportedVersion(_) => {
                response.header("Sec-WebSocket-Version", MIN_VERSION.to_string())
            }
            _ => response,
        }
    }
}

/// An accepted upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upgrade {
    pub accept: String,
    pub deflate: Option<DeflateParams>,
}

impl Upgrade {
    /// The `101 Switching Protocols` response
    pub fn response(&self) -> Response {
        let mut response = Response::new(Status::SWITCHING_PROTOCOLS)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Accept", self.accept.clone());
        if let Some(params) = &self.deflate {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Extensions", params.response_header());
        }
        response
    }
}

/// Check an upgrade request against RFC 6455 and the configured origins
pub fn validate_upgrade(request: &Request, config: &WebSocketConfig) -> Result<Upgrade, HandshakeError> {
    if !config.enabled {
        return Err(HandshakeError::Disabled);
    }
    if request.method() != Method::Get {
        return Err(HandshakeError::NotUpgrade("method is not GET"));
    }
    if request.version() == Version::Http10 {
        return Err(HandshakeError::NotUpgrade("HTTP/1.0 cannot upgrade"));
    }

    let headers = request.headers();
    if !headers.has_token("Upgrade", "websocket") {
        return Err(HandshakeError::NotUpgrade("missing Upgrade: websocket"));
    }
    if !headers.has_token("Connection", "upgrade") {
        return Err(HandshakeError::NotUpgrade("missing Connection: Upgrade"));
    }

    let version = headers.get("Sec-WebSocket-Version").map(str::trim);
    match version.and_then(|v| v.parse::<u32>().ok()) {
        Some(v) if v >= MIN_VERSION => {}
        _ => {
            return Err(HandshakeError::UnsupportedVersion(
                version.map(str::to_string),
            ))
        }
    }

    let key = headers
        .get("Sec-WebSocket-Key")
        .map(str::trim)
        .ok_or(HandshakeError::BadKey)?;
    match BASE64.decode(key) {
        Ok(raw) if raw.len() == 16 => {}
        _ => return Err(HandshakeError::BadKey),
    }

    if let Some(origin) = headers.get("Origin") {
        let allowed = config
            .allowed_origins
            .iter()
            .any(|o| o == "*" || o.eq_ignore_ascii_case(origin.trim()));
        if !allowed {
            return Err(HandshakeError::OriginRejected(origin.to_string()));
        }
    }

    let deflate = if config.permessage_deflate {
        headers
            .get_all("Sec-WebSocket-Extensions")
            .into_iter()
            .find_map(negotiate_deflate)
    } else {
        None
    };

    Ok(Upgrade {
        accept: accept_key(key),
        deflate,
    })
}
