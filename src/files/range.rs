//! `Range` header parsing and multipart/byteranges framing

use crate::errors::HttpError;

/// One satisfiable byte range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Outcome of parsing a `Range` request against a resource of known size.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RangeOutcome {
    /// No usable `Range` header; serve the whole resource.
    Full,
    /// One valid range: `206` with `Content-Range`.
    Single(ByteRange),
    /// Several valid ranges: `206` with `multipart/byteranges`.
    Multi(Vec<ByteRange>),
}

/// Parses `bytes=a-b,c-d,...`.
///
/// Pieces with a missing or unparseable start are skipped, as are starts past
/// the end of the resource; a missing or unparseable end means end-of-file.
/// A reversed range or any overlap between sorted ranges fails the whole
/// request with [`HttpError::RangeInvalid`] (`400`); a header in which no
/// piece is satisfiable fails with [`HttpError::RangeUnsatisfiable`] (`416`).
pub(crate) fn parse_ranges(header: &str, size: u64) -> Result<RangeOutcome, HttpError> {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return Ok(RangeOutcome::Full);
    };
    if size == 0 {
        return Err(HttpError::RangeUnsatisfiable);
    }

    let mut ranges = Vec::new();
    for piece in spec.split(',') {
        let piece = piece.trim();
        let Some((start_text, end_text)) = piece.split_once('-') else {
            continue;
        };

        let Ok(start) = start_text.trim().parse::<u64>() else {
            continue;
        };
        if start > size - 1 {
            continue;
        }

        let end = match end_text.trim() {
            "" => size - 1,
            text => match text.parse::<u64>() {
                Ok(end) => end.min(size - 1),
                Err(_) => size - 1,
            },
        };

        if end < start {
            return Err(HttpError::RangeInvalid);
        }
        ranges.push(ByteRange { start, end });
    }

    if ranges.is_empty() {
        return Err(HttpError::RangeUnsatisfiable);
    }

    ranges.sort_by_key(|r| r.start);
    for window in ranges.windows(2) {
        if window[0].end >= window[1].start {
            return Err(HttpError::RangeInvalid);
        }
    }

    if ranges.len() == 1 {
        Ok(RangeOutcome::Single(ranges[0]))
    } else {
        Ok(RangeOutcome::Multi(ranges))
    }
}

/// Honors `If-Range`: when present, the range request only applies if the
/// validator matches the current ETag (exactly) or `Last-Modified`
/// (case-insensitively).
pub(crate) fn if_range_matches(
    if_range: &str,
    etag: Option<&str>,
    last_modified: Option<&str>,
) -> bool {
    if let Some(etag) = etag {
        if if_range == etag {
            return true;
        }
    }
    if let Some(last_modified) = last_modified {
        if if_range.eq_ignore_ascii_case(last_modified) {
            return true;
        }
    }
    false
}

fn digits(mut n: u64) -> u64 {
    let mut count = 1;
    while n >= 10 {
        n /= 10;
        count += 1;
    }
    count
}

/// Per-part header block, literal bytes:
/// `--BOUNDARY\r\nContent-Type: T\r\nContent-Range: bytes S-E/TOTAL\r\n\r\n`.
pub(crate) fn part_header(boundary: &str, content_type: &str, range: ByteRange, total: u64) -> Vec<u8> {
    format!(
        "--{boundary}\r\nContent-Type: {content_type}\r\nContent-Range: bytes {}-{}/{total}\r\n\r\n",
        range.start, range.end
    )
    .into_bytes()
}

/// The trailing `\r\n` after each part's bytes.
pub(crate) const PART_TAIL: &[u8] = b"\r\n";

/// The final terminator `--BOUNDARY--`.
pub(crate) fn terminator(boundary: &str) -> Vec<u8> {
    format!("--{boundary}--").into_bytes()
}

/// The exact `Content-Length` of a multipart/byteranges body: per range the
/// payload plus a 49-byte framing constant plus the variable-width fields,
/// and the final terminator.
pub(crate) fn multipart_content_length(
    ranges: &[ByteRange],
    boundary: &str,
    content_type: &str,
    total: u64,
) -> u64 {
    let mut length = 0;
    for range in ranges {
        length += range.len()
            + 49
            + boundary.len() as u64
            + content_type.len() as u64
            + digits(range.start)
            + digits(range.end)
            + digits(total);
    }
    length + boundary.len() as u64 + 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_table() {
        #[rustfmt::skip]
        let cases = [
            ("bytes=0-99",          1000, RangeOutcome::Single(ByteRange { start: 0, end: 99 })),
            ("bytes=0-",            1000, RangeOutcome::Single(ByteRange { start: 0, end: 999 })),
            ("bytes=950-2000",      1000, RangeOutcome::Single(ByteRange { start: 950, end: 999 })),
            ("bytes=0-99,200-299",  1000, RangeOutcome::Multi(vec![
                ByteRange { start: 0, end: 99 },
                ByteRange { start: 200, end: 299 },
            ])),
            // out-of-order input sorts ascending
            ("bytes=200-299,0-99",  1000, RangeOutcome::Multi(vec![
                ByteRange { start: 0, end: 99 },
                ByteRange { start: 200, end: 299 },
            ])),
            // skipped pieces: suffix form, garbage start, start past EOF
            ("bytes=-500,0-9",      1000, RangeOutcome::Single(ByteRange { start: 0, end: 9 })),
            ("bytes=x-9,5-9",       1000, RangeOutcome::Single(ByteRange { start: 5, end: 9 })),
            ("bytes=5000-,1-2",     1000, RangeOutcome::Single(ByteRange { start: 1, end: 2 })),
            // unparseable end clamps to EOF
            ("bytes=10-zz",         100,  RangeOutcome::Single(ByteRange { start: 10, end: 99 })),
            // not a bytes range: ignored entirely
            ("items=0-5",           1000, RangeOutcome::Full),
            ("",                    1000, RangeOutcome::Full),
        ];

        for (header, size, expected) in cases {
            assert_eq!(parse_ranges(header, size).unwrap(), expected, "{header}");
        }
    }

    #[test]
    fn reversed_and_overlapping_fail_the_request() {
        for header in ["bytes=9-5", "bytes=0-99,50-150", "bytes=0-50,50-99", "bytes=1-2,9-5"] {
            assert!(
                matches!(parse_ranges(header, 1000), Err(HttpError::RangeInvalid)),
                "{header}"
            );
        }
    }

    #[test]
    fn nothing_satisfiable_is_an_error() {
        // no usable piece, and the degenerate empty resource
        for (header, size) in [("bytes=5000-6000", 1000), ("bytes=-1,-2", 1000), ("bytes=0-", 0)] {
            assert!(
                matches!(parse_ranges(header, size), Err(HttpError::RangeUnsatisfiable)),
                "{header} against {size}"
            );
        }
    }

    #[test]
    fn if_range_validators() {
        assert!(if_range_matches("\"abc\"", Some("\"abc\""), None));
        assert!(!if_range_matches("\"abc\"", Some("\"def\""), None));
        assert!(if_range_matches(
            "Wed, 21 Oct 2015 07:28:00 GMT",
            None,
            Some("WED, 21 OCT 2015 07:28:00 GMT")
        ));
        assert!(!if_range_matches("x", None, None));
    }

    #[test]
    fn multipart_length_formula_matches_the_bytes() {
        let ranges = [
            ByteRange { start: 0, end: 99 },
            ByteRange { start: 200, end: 299 },
        ];
        let boundary = "18f2a3b";
        let content_type = "text/plain";
        let total = 1000;

        let mut body = Vec::new();
        for range in &ranges {
            body.extend_from_slice(&part_header(boundary, content_type, *range, total));
            body.extend_from_slice(&vec![b'x'; range.len() as usize]);
            body.extend_from_slice(PART_TAIL);
        }
        body.extend_from_slice(&terminator(boundary));

        assert_eq!(
            body.len() as u64,
            multipart_content_length(&ranges, boundary, content_type, total)
        );
    }
}
