//! HTTP/1.x head parsing
//!
//! Request heads arrive on the server side, response heads on the reverse
//! proxy's backend connection. Both are parsed only once the `\r\n\r\n`
//! terminator has been seen.

use super::{Error, Headers, Method, Result, Status, Version};

/// Find the next CRLF in a buffer
pub fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Length of the head including the blank line, once it is complete
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Parse HTTP request line
///
/// Format: METHOD URI VERSION
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() != 3 {
        return Err(Error::Parse(format!(
            "Invalid request line: expected 3 parts, got {}",
            parts.len()
        )));
    }

    let method = Method::from_str(parts[0])?;
    let uri = parts[1].to_string();
    let version = Version::from_str(parts[2])?;

    Ok((method, uri, version))
}

/// Parse HTTP response status line
///
/// Format: VERSION STATUS [REASON]
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    if parts.len() < 2 {
        return Err(Error::Parse(format!(
            "Invalid status line: expected at least 2 parts, got {}",
            parts.len()
        )));
    }

    let version = Version::from_str(parts[0])?;
    let status_code = parts[1]
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("Invalid status code: {}", parts[1])))?;
    let status = Status::new(status_code)?;
    let reason = match parts.get(2) {
        Some(reason) => reason.to_string(),
        None => status.reason_phrase().to_string(),
    };

    Ok((version, status, reason))
}

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
    /// Bytes consumed by the head, blank line included
    pub head_len: usize,
}

/// Parsed status line and headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: Status,
    pub reason: String,
    pub headers: Headers,
    pub head_len: usize,
}

fn head_lines(buf: &[u8]) -> Result<(Vec<String>, usize)> {
    let head_len = find_head_end(buf).ok_or(Error::Incomplete)?;
    let text = std::str::from_utf8(&buf[..head_len - 4])
        .map_err(|_| Error::Parse("Head is not valid UTF-8".to_string()))?;
    Ok((text.split("\r\n").map(str::to_string).collect(), head_len))
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a String>) -> Result<Headers> {
    let mut headers = Headers::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(Error::InvalidHeader("Obsolete line folding".to_string()));
        }
        let (name, value) = Headers::parse_header_line(line)?;
        headers.try_insert(name, value)?;
    }
    Ok(headers)
}

/// Parse a complete request head
///
/// Fails with [`Error::Incomplete`] when the terminator has not arrived yet.
pub fn parse_request_head(buf: &[u8]) -> Result<RequestHead> {
    let (lines, head_len) = head_lines(buf)?;
    let mut lines = lines.iter();
    let request_line = lines
        .next()
        .ok_or_else(|| Error::Parse("Empty request head".to_string()))?;
    let (method, uri, version) = parse_request_line(request_line)?;
    let headers = parse_header_lines(lines)?;

    Ok(RequestHead {
        method,
        uri,
        version,
        headers,
        head_len,
    })
}

/// Parse a complete response head
pub fn parse_response_head(buf: &[u8]) -> Result<ResponseHead> {
    let (lines, head_len) = head_lines(buf)?;
    let mut lines = lines.iter();
    let status_line = lines
        .next()
        .ok_or_else(|| Error::Parse("Empty response head".to_string()))?;
    let (version, status, reason) = parse_status_line(status_line)?;
    let headers = parse_header_lines(lines)?;

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        head_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let (method, uri, version) = parse_request_line("GET /index.html HTTP/1.1").unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(uri, "/index.html");
        assert_eq!(version, Version::Http11);

        assert!(parse_request_line("GET /").is_err());
    }

    #[test]
    fn test_parse_status_line() {
        let (version, status, reason) = parse_status_line("HTTP/1.1 200 OK").unwrap();
        assert_eq!(version, Version::Http11);
        assert_eq!(status.code(), 200);
        assert_eq!(reason, "OK");

        let (_, status, reason) = parse_status_line("HTTP/1.0 404").unwrap();
        assert_eq!(status.code(), 404);
        assert_eq!(reason, "Not Found");
    }

    #[test]
    fn test_parse_request_head() {
        let buf = b"POST /form HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nabc";
        let head = parse_request_head(buf).unwrap();

        assert_eq!(head.method, Method::Post);
        assert_eq!(head.uri, "/form");
        assert_eq!(head.headers.get("host"), Some("example.com"));
        assert_eq!(&buf[head.head_len..], b"abc");
    }

    #[test]
    fn test_incomplete_head() {
        let result = parse_request_head(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert!(matches!(result, Err(Error::Incomplete)));
    }

    #[test]
    fn test_line_folding_rejected() {
        let buf = b"GET / HTTP/1.1\r\nX-A: one\r\n two\r\n\r\n";
        assert!(parse_request_head(buf).is_err());
    }

    #[test]
    fn test_parse_response_head() {
        let buf = b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-1/10\r\n\r\n01";
        let head = parse_response_head(buf).unwrap();
        assert_eq!(head.status.code(), 206);
        assert_eq!(head.reason, "Partial Content");
        assert_eq!(head.headers.get("content-range"), Some("bytes 0-1/10"));
        assert_eq!(head.head_len, buf.len() - 2);
    }

    #[test]
    fn test_find_crlf() {
        assert_eq!(find_crlf(b"Hello\r\nWorld"), Some(5));
        assert_eq!(find_crlf(b"NoEOL"), None);
        assert_eq!(find_head_end(b"A\r\n\r\nB"), Some(5));
    }
}
