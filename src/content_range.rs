//! A tolerant parser for the `Content-Range` response header.
//!
//! Accepts `bytes FIRST-LAST/LEN` with an optional `bytes` token (and some
//! ancient-server laxity around a trailing `:` and whitespace), and `LEN`
//! may be `*` for an unknown entity length. Returns `None` rather than an
//! error: the header is advisory input the response processor decides
//! whether to trust.

/// The parsed triple of a `Content-Range: bytes FIRST-LAST/LEN` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub first_byte_pos: u64,
    pub last_byte_pos: u64,
    pub entity_length: Option<u64>,
}

/// Parses a `Content-Range` header value.
///
/// Returns `None` if the header is malformed, if `last < first`, or if the
/// entity length is known but `len <= last`.
pub fn parse_content_range(hdr: &str) -> Option<ContentRange> {
    let mut hdr = hdr;

    // Ancient version of Netscape proxy server don't have the "bytes" specifier.
    if let Some(rest) = hdr.strip_prefix("bytes") {
        hdr = rest;
        // JavaWebServer/1.1.1 sends "bytes: x-y/z"
        if let Some(rest) = hdr.strip_prefix(':') {
            hdr = rest;
        }
        hdr = hdr.trim_start();
        if hdr.is_empty() {
            return None;
        }
    }

    let bytes = hdr.as_bytes();
    let mut idx = 0usize;

    let first_byte_pos = parse_num(bytes, &mut idx, b'-')?;
    let last_byte_pos = parse_num(bytes, &mut idx, b'/')?;

    let entity_length = if bytes.get(idx) == Some(&b'*') {
        idx += 1;
        None
    } else {
        let mut num = 0u64;
        let mut any = false;
        while let Some(&c) = bytes.get(idx) {
            if c.is_ascii_digit() {
                any = true;
                num = num.checked_mul(10)?.checked_add(u64::from(c - b'0'))?;
                idx += 1;
            } else {
                break;
            }
        }
        if !any {
            return None;
        }
        Some(num)
    };

    if last_byte_pos < first_byte_pos {
        return None;
    }
    if let Some(len) = entity_length {
        if len <= last_byte_pos {
            return None;
        }
    }

    Some(ContentRange {
        first_byte_pos,
        last_byte_pos,
        entity_length,
    })
}

/// Parses a run of ASCII digits followed by `postchar`, advancing `idx`.
/// Returns `None` (parse error) if there are no digits or `postchar` is missing.
fn parse_num(bytes: &[u8], idx: &mut usize, postchar: u8) -> Option<u64> {
    let start = *idx;
    let mut num = 0u64;
    while let Some(&c) = bytes.get(*idx) {
        if c.is_ascii_digit() {
            num = num.checked_mul(10)?.checked_add(u64::from(c - b'0'))?;
            *idx += 1;
        } else {
            break;
        }
    }
    if *idx == start {
        return None;
    }
    if bytes.get(*idx) != Some(&postchar) {
        return None;
    }
    *idx += 1;
    Some(num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_range() {
        let cr = parse_content_range("bytes 5-9/10").unwrap();
        assert_eq!(cr.first_byte_pos, 5);
        assert_eq!(cr.last_byte_pos, 9);
        assert_eq!(cr.entity_length, Some(10));
    }

    #[test]
    fn parses_unknown_length() {
        let cr = parse_content_range("bytes 0-4/*").unwrap();
        assert_eq!(cr.entity_length, None);
    }

    #[test]
    fn tolerates_missing_bytes_token() {
        let cr = parse_content_range("0-4/5").unwrap();
        assert_eq!(cr.first_byte_pos, 0);
        assert_eq!(cr.last_byte_pos, 4);
        assert_eq!(cr.entity_length, Some(5));
    }

    #[test]
    fn tolerates_colon_after_bytes() {
        let cr = parse_content_range("bytes: 0-4/5").unwrap();
        assert_eq!(cr.first_byte_pos, 0);
    }

    #[test]
    fn rejects_last_before_first() {
        assert!(parse_content_range("bytes 9-5/10").is_none());
    }

    #[test]
    fn rejects_length_not_greater_than_last() {
        assert!(parse_content_range("bytes 0-9/9").is_none());
        assert!(parse_content_range("bytes 0-9/5").is_none());
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse_content_range("bytes garbage").is_none());
        assert!(parse_content_range("bytes 5/10").is_none());
        assert!(parse_content_range("").is_none());
    }
}
