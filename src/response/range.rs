//! Single byte-range requests (RFC 7233)

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("Malformed Range header: {0}")]
    Malformed(String),

    #[error("Range not satisfiable for a {len}-byte resource")]
    Unsatisfiable { len: u64 },
}

/// An inclusive byte range, validated against the resource length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Parse a `Range` header against a resource of `len` bytes
    ///
    /// Supports `bytes=a-b`, `bytes=a-` and `bytes=-n`. A request for several
    /// ranges returns `Ok(None)`: the whole resource is served instead.
    pub fn parse(header: &str, len: u64) -> Result<Option<ByteRange>, RangeError> {
        let malformed = || RangeError::Malformed(header.to_string());
        let unsatisfiable = RangeError::Unsatisfiable { len };

        let (unit, spec) = header.trim().split_once('=').ok_or_else(malformed)?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return Err(malformed());
        }
        if spec.contains(',') {
            return Ok(None);
        }
        let (first, last) = spec.trim().split_once('-').ok_or_else(malformed)?;
        let (first, last) = (first.trim(), last.trim());
        let number = |s: &str| s.parse::<u64>().map_err(|_| malformed());

        let range = match (first.is_empty(), last.is_empty()) {
            (true, true) => return Err(malformed()),
            // Suffix: the last n bytes
            (true, false) => {
                let n = number(last)?;
                if n == 0 || len == 0 {
                    return Err(unsatisfiable);
                }
                ByteRange {
                    start: len.saturating_sub(n),
                    end: len - 1,
                }
            }
            (false, true) => {
                let start = number(first)?;
                if start >= len {
                    return Err(unsatisfiable);
                }
                ByteRange { start, end: len - 1 }
            }
            (false, false) => {
                let start = number(first)?;
                let end = number(last)?;
                if end < start {
                    return Err(malformed());
                }
                if start >= len {
                    return Err(unsatisfiable);
                }
                ByteRange {
                    start,
                    end: end.min(len - 1),
                }
            }
        };
        Ok(Some(range))
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a resource of `total` bytes
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let r = ByteRange::parse("bytes=0-99", 1000).unwrap().unwrap();
        assert_eq!((r.start, r.end, r.len()), (0, 99, 100));
        assert_eq!(r.content_range(1000), "bytes 0-99/1000");

        let r = ByteRange::parse("bytes=900-", 1000).unwrap().unwrap();
        assert_eq!((r.start, r.end), (900, 999));

        let r = ByteRange::parse("bytes=-10", 1000).unwrap().unwrap();
        assert_eq!((r.start, r.end), (990, 999));

        // Suffix longer than the resource covers all of it
        let r = ByteRange::parse("bytes=-5000", 1000).unwrap().unwrap();
        assert_eq!((r.start, r.end), (0, 999));

        // End past the resource is clamped
        let r = ByteRange::parse("bytes=500-5000", 1000).unwrap().unwrap();
        assert_eq!(r.end, 999);
    }

    #[test]
    fn test_multiple_ranges_ignored() {
        assert_eq!(ByteRange::parse("bytes=0-1,5-6", 1000).unwrap(), None);
    }

    #[test]
    fn test_malformed() {
        for header in ["bytes=abc", "items=0-1", "bytes=5-2", "bytes=-", "0-99", "bytes=1-x"] {
            assert!(
                matches!(ByteRange::parse(header, 1000), Err(RangeError::Malformed(_))),
                "{}",
                header
            );
        }
    }

    #[test]
    fn test_unsatisfiable() {
        assert_eq!(
            ByteRange::parse("bytes=1000-", 1000),
            Err(RangeError::Unsatisfiable { len: 1000 })
        );
        assert_eq!(
            ByteRange::parse("bytes=-0", 1000),
            Err(RangeError::Unsatisfiable { len: 1000 })
        );
        assert!(ByteRange::parse("bytes=0-0", 0).is_err());
    }
}
