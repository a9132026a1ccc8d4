//! The streaming content-decoding abstraction that survives across TCP
//! reconnects.
//!
//! A content-encoded body cannot resume decompression from a fresh window
//! on a new connection, so the decompressor's internal state is kept as a
//! first-class, movable value owned by `HttpStat` rather than by the
//! response/connection. `flate2`'s `Decompress` is a plain owned struct
//! that can be fed further input across unrelated `Read`s: it is moved out
//! of one attempt's response, stored on `HttpStat::decoder`, and fed the
//! next attempt's bytes.

use std::io;

use flate2::{Decompress, FlushDecompress, Status};

/// The set of `Content-Encoding` tokens this crate can actually decode.
/// `identity` is always supported trivially. Anything else passes through
/// undecoded -- bytes are still counted and streamed, just not decompressed,
/// matching that the original decoder is whatever the underlying HTTP
/// library natively understands.
pub fn supported_encodings() -> &'static [&'static str] {
    &["identity", "gzip", "deflate"]
}

/// Tracks how much of a gzip member's 10+ byte header (plus optional
/// FEXTRA/FNAME/FCOMMENT/FHCRC fields) has been consumed, since a raw
/// `Decompress` only understands the deflate stream that follows it.
#[derive(Debug, Default)]
struct GzipHeaderState {
    done: bool,
    // Buffers header bytes until enough have arrived to know the full
    // header length (FEXTRA/FNAME/FCOMMENT are variable-length and
    // NUL/length terminated).
    buf: Vec<u8>,
}

impl GzipHeaderState {
    /// Consumes as much of `input` as belongs to the gzip header, returning
    /// the remainder (deflate-coded bytes), or `None` if the header is not
    /// yet fully buffered.
    fn strip<'a>(&mut self, input: &'a [u8]) -> Option<&'a [u8]> {
        if self.done {
            return Some(input);
        }
        self.buf.extend_from_slice(input);
        let consumed_from_input = match gzip_header_len(&self.buf) {
            Some(len) if len <= self.buf.len() => len,
            _ => return None,
        };
        self.done = true;
        let already_had = self.buf.len() - input.len();
        let from_this_call = consumed_from_input.saturating_sub(already_had);
        Some(&input[from_this_call..])
    }
}

/// Returns the total gzip header length in bytes if `buf` contains enough
/// data to determine it, else `None`.
fn gzip_header_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 10 {
        return None;
    }
    if buf[0] != 0x1f || buf[1] != 0x8b {
        // Not a recognizable gzip header; treat the whole thing as opaque
        // so we at least don't panic -- decoding will simply fail softly.
        return Some(10);
    }
    let flg = buf[3];
    let mut idx = 10usize;

    const FEXTRA: u8 = 1 << 2;
    const FNAME: u8 = 1 << 3;
    const FCOMMENT: u8 = 1 << 4;
    const FHCRC: u8 = 1 << 1;

    if flg & FEXTRA != 0 {
        if buf.len() < idx + 2 {
            return None;
        }
        let xlen = u16::from_le_bytes([buf[idx], buf[idx + 1]]) as usize;
        idx += 2 + xlen;
    }
    if flg & FNAME != 0 {
        let nul = buf.get(idx..)?.iter().position(|&b| b == 0)?;
        idx += nul + 1;
    }
    if flg & FCOMMENT != 0 {
        let nul = buf.get(idx..)?.iter().position(|&b| b == 0)?;
        idx += nul + 1;
    }
    if flg & FHCRC != 0 {
        idx += 2;
    }
    if buf.len() < idx {
        return None;
    }
    Some(idx)
}

/// A resumable streaming decompressor, or the no-op identity pass-through.
pub enum Decoder {
    Identity,
    Gzip(Decompress, GzipHeaderState),
    Deflate(Decompress),
}

impl Decoder {
    /// Builds a fresh decoder for the (already-normalized) encoding tokens
    /// of a response. Only the last non-identity token is honored, matching
    /// practice for the single-coding case this crate targets; multiple
    /// stacked codings beyond one non-identity layer are not decoded.
    pub fn for_tokens(tokens: &[String]) -> Decoder {
        match tokens
            .iter()
            .rev()
            .find(|t| !t.eq_ignore_ascii_case("identity"))
            .map(|t| t.to_ascii_lowercase())
            .as_deref()
        {
            Some("gzip") | Some("x-gzip") => {
                Decoder::Gzip(Decompress::new(false), GzipHeaderState::default())
            }
            Some("deflate") => Decoder::Deflate(Decompress::new(true)),
            _ => Decoder::Identity,
        }
    }

    /// Feeds `input` through the decoder, appending decoded bytes to `out`.
    ///
    /// For `Identity` this is a plain copy. For gzip/deflate, `Decompress`
    /// is fed incrementally; its internal window and bit-reader state
    /// persist across calls, including across a `Decoder` that was moved
    /// out to `HttpStat` and back in for a reconnected attempt.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Decoder::Identity => {
                out.extend_from_slice(input);
                Ok(())
            }
            Decoder::Gzip(d, hdr) => match hdr.strip(input) {
                Some(rest) => inflate(d, rest, out),
                None => Ok(()), // still buffering the gzip header
            },
            Decoder::Deflate(d) => inflate(d, input, out),
        }
    }

    /// Tokens, normalized (trimmed, comma-split) for comparison across
    /// attempts. Lives next to the decoder for convenience but is a pure
    /// function of the raw header value.
    pub fn normalize_tokens(remote_encoding: Option<&str>) -> Option<Vec<String>> {
        remote_encoding.map(|enc| enc.split(',').map(|t| t.trim().to_string()).collect())
    }

    /// Whether the normalized token list represents no real encoding.
    pub fn is_identity(tokens: &Option<Vec<String>>) -> bool {
        match tokens {
            None => true,
            Some(ts) => ts.is_empty() || ts.iter().all(|t| t.eq_ignore_ascii_case("identity")),
        }
    }
}

fn inflate(d: &mut Decompress, mut input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        if input.is_empty() {
            return Ok(());
        }
        let before_in = d.total_in();
        let before_out = d.total_out();
        let status = d
            .decompress(input, &mut buf, FlushDecompress::None)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let produced = (d.total_out() - before_out) as usize;
        let consumed = (d.total_in() - before_in) as usize;
        out.extend_from_slice(&buf[..produced]);
        input = &input[consumed..];
        match status {
            Status::StreamEnd => return Ok(()),
            Status::BufError if consumed == 0 && produced == 0 => return Ok(()),
            _ => {
                if consumed == 0 && produced == 0 {
                    return Ok(());
                }
            }
        }
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decoder::Identity => write!(f, "Decoder::Identity"),
            Decoder::Gzip(..) => write!(f, "Decoder::Gzip(..)"),
            Decoder::Deflate(_) => write!(f, "Decoder::Deflate(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_tokens_detected() {
        assert!(Decoder::is_identity(&None));
        assert!(Decoder::is_identity(&Some(vec![])));
        assert!(Decoder::is_identity(&Some(vec!["identity".to_string()])));
        assert!(Decoder::is_identity(&Some(vec![
            "identity".to_string(),
            "IDENTITY".to_string()
        ])));
        assert!(!Decoder::is_identity(&Some(vec!["gzip".to_string()])));
    }

    #[test]
    fn normalize_trims_and_splits() {
        let tokens = Decoder::normalize_tokens(Some(" gzip , identity ")).unwrap();
        assert_eq!(tokens, vec!["gzip".to_string(), "identity".to_string()]);
    }

    #[test]
    fn identity_decode_is_copy() {
        let mut d = Decoder::Identity;
        let mut out = Vec::new();
        d.decode(b"hello", &mut out).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn gzip_roundtrip_across_two_feeds() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"hello world, this is a streamed gzip payload")
            .unwrap();
        let compressed = enc.finish().unwrap();

        // Split the compressed bytes to simulate two TCP sessions feeding
        // the same decoder.
        let mid = compressed.len() / 2;
        let (first, second) = compressed.split_at(mid);

        let mut d = Decoder::for_tokens(&["gzip".to_string()]);
        let mut out = Vec::new();
        d.decode(first, &mut out).unwrap();
        d.decode(second, &mut out).unwrap();
        assert_eq!(out, b"hello world, this is a streamed gzip payload");
    }
}
