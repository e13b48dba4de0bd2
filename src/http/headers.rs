//! HTTP header collection
//!
//! Insertion-ordered, case-insensitive, multi-valued. Used for HTTP/1.1 heads,
//! HTTP/2 header blocks (lowercased on the wire) and proxied backend
//! responses alike.

use super::{Error, Result, MAX_HEADERS};
use std::fmt;

/// HTTP headers collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty headers collection
    pub fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    /// Append a header value, keeping any existing values for the name
    ///
    /// Headers beyond [`MAX_HEADERS`] are dropped; use [`Headers::try_insert`]
    /// when the limit must be reported.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let _ = self.try_insert(name, value);
    }

    /// Append a header value, failing once the collection is full
    pub fn try_insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        if self.entries.len() >= MAX_HEADERS {
            return Err(Error::InvalidHeader(format!(
                "more than {} headers",
                MAX_HEADERS
            )));
        }
        self.entries.push((name.into(), value.into()));
        Ok(())
    }

    /// Replace every value of `name` with a single value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.entries.iter().position(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= first || !n.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.insert(name, value),
        }
    }

    /// Set `name` only if it is not present yet
    pub fn set_default(&mut self, name: &str, value: impl Into<String>) {
        if !self.contains(name) {
            self.insert(name, value);
        }
    }

    /// Get the first value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get all values for a header (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Whether a comma-separated header carries `token` (case-insensitive)
    ///
    /// `Connection: keep-alive, Upgrade` has the tokens `keep-alive` and
    /// `upgrade`. Parameters after `;` are ignored.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).iter().any(|value| {
            value.split(',').any(|item| {
                item.split(';')
                    .next()
                    .map(|t| t.trim().eq_ignore_ascii_case(token))
                    .unwrap_or(false)
            })
        })
    }

    /// Parse `Content-Length`
    ///
    /// `None` when absent. Conflicting duplicate values are an error.
    pub fn content_length(&self) -> Result<Option<u64>> {
        let mut found: Option<u64> = None;
        for value in self.get_all("Content-Length") {
            let parsed = value
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::InvalidHeader(format!("Invalid Content-Length: {}", value)))?;
            match found {
                Some(previous) if previous != parsed => {
                    return Err(Error::InvalidHeader(
                        "Conflicting Content-Length values".to_string(),
                    ));
                }
                _ => found = Some(parsed),
            }
        }
        Ok(found)
    }

    /// Remove all instances of a header (case-insensitive)
    pub fn remove(&mut self, name: &str) -> usize {
        let initial_len = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        initial_len - self.entries.len()
    }

    /// Get the number of headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Append `Name: value\r\n` lines to `buf`
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }

    /// Parse a header line into name and value
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let colon_pos = line
            .find(':')
            .ok_or_else(|| Error::InvalidHeader(format!("No colon in header: {}", line)))?;

        let name = &line[..colon_pos];
        // Whitespace before the colon is a request smuggling vector
        if name.is_empty() || name.ends_with(' ') || name.ends_with('\t') {
            return Err(Error::InvalidHeader(format!("Bad header name: {:?}", name)));
        }

        Ok((name.to_string(), line[colon_pos + 1..].trim().to_string()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}
