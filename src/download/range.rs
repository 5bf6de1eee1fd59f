//! `Range` request header handling for single-file downloads
//!
//! Only one `bytes=` range per request is honoured. Multiple ranges and
//! malformed headers fall back to the full file.

/// What part of a file to send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    Full,
    /// Inclusive byte range, already clamped to the file size
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

impl ByteRange {
    pub fn content_range(&self, size: u64) -> Option<String> {
        match self {
            ByteRange::Full => None,
            ByteRange::Partial { start, end } => Some(format!("bytes {}-{}/{}", start, end, size)),
            ByteRange::Unsatisfiable => Some(format!("bytes */{}", size)),
        }
    }
}

/// Select the range to serve for a file of `size` bytes
pub fn parse_range(header: Option<&str>, size: u64) -> ByteRange {
    let Some(value) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };

    if value.contains(',') {
        return ByteRange::Full;
    }

    let Some((first, last)) = value.split_once('-') else {
        return ByteRange::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    // Suffix range: the final `n` bytes
    if first.is_empty() {
        return match last.parse::<u64>() {
            Ok(0) => ByteRange::Unsatisfiable,
            Ok(_) if size == 0 => ByteRange::Unsatisfiable,
            Ok(n) => ByteRange::Partial {
                start: size.saturating_sub(n),
                end: size - 1,
            },
            Err(_) => ByteRange::Full,
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return ByteRange::Full;
    };

    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return ByteRange::Full,
        }
    };

    if start >= size {
        return ByteRange::Unsatisfiable;
    }

    ByteRange::Partial {
        start,
        end: end.map_or(size - 1, |end| end.min(size - 1)),
    }
}
