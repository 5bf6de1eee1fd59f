//! `Content-Range` header parsing (RFC 7233 byte ranges)

use std::fmt;

use super::types::UploadError;

/// An inclusive byte range `start..=end` with an optional total size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the header carries `*` for the total
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn new(start: u64, end: u64, total: u64) -> Self {
        Self {
            start,
            end,
            total: Some(total),
        }
    }

    /// Number of bytes covered by the range
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Parse a header value such as `bytes 0-1023/4096`
    pub fn parse(header: &str) -> Result<Self, UploadError> {
        let invalid = |msg: &str| UploadError::InvalidContentRange(msg.to_string());

        let header = header.trim();
        if header.is_empty() {
            return Err(invalid("content-range header is empty"));
        }

        let value = header
            .strip_prefix("bytes ")
            .ok_or_else(|| invalid("content-range must use the bytes unit"))?;

        let (range, total) = value
            .split_once('/')
            .ok_or_else(|| invalid("missing total size"))?;

        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| invalid("missing range separator"))?;

        let start: u64 = start
            .trim()
            .parse()
            .map_err(|_| invalid("invalid start value"))?;
        let end: u64 = end
            .trim()
            .parse()
            .map_err(|_| invalid("invalid end value"))?;

        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse::<u64>().map_err(|_| invalid("invalid total size"))?),
        };

        if start > end {
            return Err(invalid("start cannot be greater than end"));
        }

        if let Some(total) = total {
            if end >= total {
                return Err(invalid("end must be less than total size"));
            }
        }

        Ok(Self { start, end, total })
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "bytes {}-{}/{}", self.start, self.end, total),
            None => write!(f, "bytes {}-{}/*", self.start, self.end),
        }
    }
}
