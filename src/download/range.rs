//! HTTP Range header parsing.

use crate::{Result, StrataError};

/// An inclusive byte range within an object of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Parse a `Range` header against an object of `size` bytes.
///
/// Accepted forms: `bytes=a-b`, `bytes=a-` (to the end), `bytes=-n` (the
/// final `n` bytes, clamped to the object). Rejected: missing `bytes=`
/// prefix, multiple ranges, `a > b`, `b >= size`, both bounds missing.
pub fn parse_range_header(header: &str, size: u64) -> Result<ByteRange> {
    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| StrataError::InvalidRange(format!("unsupported unit in {header:?}")))?;

    if spec.contains(',') {
        return Err(StrataError::InvalidRange(
            "multiple ranges are not supported".into(),
        ));
    }
    if size == 0 {
        return Err(StrataError::InvalidRange("empty object".into()));
    }

    let (start_str, end_str) = spec
        .split_once('-')
        .ok_or_else(|| StrataError::InvalidRange(format!("malformed range {spec:?}")))?;
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    match (start_str.is_empty(), end_str.is_empty()) {
        // bytes=a-b
        (false, false) => {
            let start = parse_bound(start_str)?;
            let end = parse_bound(end_str)?;
            if start > end {
                return Err(StrataError::InvalidRange(format!(
                    "start {start} after end {end}"
                )));
            }
            if end >= size {
                return Err(StrataError::InvalidRange(format!(
                    "end {end} beyond object of {size} bytes"
                )));
            }
            Ok(ByteRange { start, end })
        }
        // bytes=a-
        (false, true) => {
            let start = parse_bound(start_str)?;
            if start >= size {
                return Err(StrataError::InvalidRange(format!(
                    "start {start} beyond object of {size} bytes"
                )));
            }
            Ok(ByteRange {
                start,
                end: size - 1,
            })
        }
        // bytes=-n
        (true, false) => {
            let suffix = parse_bound(end_str)?;
            if suffix == 0 {
                return Err(StrataError::InvalidRange("zero-length suffix".into()));
            }
            Ok(ByteRange {
                start: size.saturating_sub(suffix),
                end: size - 1,
            })
        }
        (true, true) => Err(StrataError::InvalidRange("both bounds missing".into())),
    }
}

fn parse_bound(s: &str) -> Result<u64> {
    s.parse::<u64>()
        .map_err(|_| StrataError::InvalidRange(format!("non-numeric bound {s:?}")))
}
