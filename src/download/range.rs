//! HTTP `Range` header handling.

use crate::{Result, TelestoreError};

/// Inclusive byte range within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte.
    pub start: u64,
    /// Last byte, inclusive.
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false: a range covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` value for an object of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// A single range as written by the client, before the object size is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-b`
    Bounded(u64, u64),
    /// `bytes=a-`
    From(u64),
    /// `bytes=-n`, the last `n` bytes.
    Suffix(u64),
}

/// Result of parsing a `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedRange {
    /// No usable range: serve the whole object.
    Whole,
    /// One range.
    Single(RangeSpec),
    /// Syntactically invalid.
    Invalid,
}

/// Parse a `Range` header value.
///
/// Multi-range requests are answered with the whole object.
pub fn parse_range_header(value: &str) -> ParsedRange {
    let value = value.trim();
    let Some((unit, ranges)) = value.split_once('=') else {
        return ParsedRange::Invalid;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return ParsedRange::Invalid;
    }
    if ranges.contains(',') {
        return ParsedRange::Whole;
    }

    let Some((first, last)) = ranges.trim().split_once('-') else {
        return ParsedRange::Invalid;
    };
    let (first, last) = (first.trim(), last.trim());

    let spec = match (first.is_empty(), last.is_empty()) {
        (true, true) => return ParsedRange::Invalid,
        (true, false) => last.parse().map(RangeSpec::Suffix),
        (false, true) => first.parse().map(RangeSpec::From),
        (false, false) => first
            .parse()
            .and_then(|a| last.parse().map(|b| RangeSpec::Bounded(a, b))),
    };

    match spec {
        Ok(spec) => ParsedRange::Single(spec),
        Err(_) => ParsedRange::Invalid,
    }
}

/// Resolve a range against an object of `total` bytes.
///
/// The end is clamped to the last byte. Ranges starting past the end,
/// inverted ranges and empty suffixes are not satisfiable.
pub fn resolve(spec: RangeSpec, total: u64) -> Result<ByteRange> {
    let unsatisfiable = || TelestoreError::RangeNotSatisfiable { total };
    if total == 0 {
        return Err(unsatisfiable());
    }
    let last = total - 1;

    match spec {
        RangeSpec::Bounded(start, end) if start <= end && start <= last => Ok(ByteRange {
            start,
            end: end.min(last),
        }),
        RangeSpec::From(start) if start <= last => Ok(ByteRange { start, end: last }),
        RangeSpec::Suffix(n) if n > 0 => Ok(ByteRange {
            start: total.saturating_sub(n),
            end: last,
        }),
        _ => Err(unsatisfiable()),
    }
}

/// Work out the range to serve for an optional header.
///
/// `Ok(None)` means the whole object.
pub fn select(header: Option<&str>, total: u64) -> Result<Option<ByteRange>> {
    match header.map(parse_range_header) {
        None | Some(ParsedRange::Whole) => Ok(None),
        Some(ParsedRange::Single(spec)) => resolve(spec, total).map(Some),
        Some(ParsedRange::Invalid) => Err(TelestoreError::RangeNotSatisfiable { total }),
    }
}
