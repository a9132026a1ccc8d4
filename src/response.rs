//! The response processor: validates one HTTP response, decides the
//! continuation verdict, and streams the body to the part file.
//!
//! This is the largest component; the numbered comments below walk through
//! the ordered checks one at a time, each short-circuiting on failure.

use std::io::{Read, Write};

use reqwest::header::{
    HeaderName, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LAST_MODIFIED, SERVER,
};
use reqwest::StatusCode;

use crate::content_range::parse_content_range;
use crate::decoder::Decoder;
use crate::error::{BadResponseSnafu, Error, RangeErrorSnafu};
use crate::hosts::{authority_of, HostRegistry};
use crate::logger::Logger;
use crate::pool::FetchResponse;
use crate::retry::RetryCounter;
use crate::stat::HttpStat;
use crate::util::parse_http_date;

const HTTP_CHUNK_SIZE: usize = 1024 * 1024;

/// The tri-state return of the response processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Non-fatal error, try again.
    RetrIncomplete,
    /// Nothing more to do; return without finalizing.
    RetrUnneeded,
    /// This attempt completed the retrieval.
    RetrFinished,
}

fn x_archive_orig_last_modified() -> HeaderName {
    HeaderName::from_static("x-archive-orig-last-modified")
}

/// Processes one live HTTP response against `hstat`, mutating it in place
/// and returning the verdict (or a terminal [`Error`]).
#[allow(clippy::too_many_arguments)]
pub fn process_response(
    url: &str,
    hstat: &mut HttpStat,
    logger: &Logger,
    retry_counter: &mut RetryCounter,
    hosts: &HostRegistry,
    fetch: FetchResponse,
) -> Result<Verdict, Error> {
    let FetchResponse {
        current_url: _,
        mut response,
    } = fetch;

    // `bytes_read`/`contlen` are per-attempt values until the commit step
    // below sets them for real, not carried over from a previous attempt.
    // This matters for the early-return restarts further down: they set
    // `restval := 0` expecting the *next* loop iteration's
    // `restval := bytes_read` to see a zero `bytes_read` too, not the prior
    // attempt's total.
    hstat.bytes_read = 0;
    hstat.contlen = None;

    // 1. Multipart guard.
    if let Some(ct) = response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        let base = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        if base == "multipart/byteranges" {
            return BadResponseSnafu {
                url: url.to_string(),
                message: "Server sent multipart response, but multiple ranges were not requested"
                    .to_string(),
            }
            .fail();
        }
    }

    // 2. Length discovery.
    let status = response.status();
    let mut contlen = if status_permits_body(status) {
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
    } else {
        None
    };

    let crange_header = response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let crange_parsed = crange_header.as_deref().and_then(parse_content_range);
    let contrange = if let Some(cr) = crange_parsed {
        contlen = Some(cr.last_byte_pos - cr.first_byte_pos + 1);
        cr.first_byte_pos
    } else {
        0
    };

    // 3. Timestamp.
    hstat.last_modified = response
        .headers()
        .get(LAST_MODIFIED)
        .or_else(|| response.headers().get(x_archive_orig_last_modified()))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    hstat.remote_time = hstat.last_modified.as_deref().and_then(parse_http_date);

    // 4. Encoding continuity.
    let remote_encoding_raw = response
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let new_tokens = Decoder::normalize_tokens(remote_encoding_raw.as_deref());

    if hstat.restval > 0 && hstat.remote_encoding != new_tokens {
        hstat.restval = 0;
        retry_counter.increment(
            logger,
            url,
            hstat.bytes_read,
            hstat.restval,
            "Inconsistent Content-Encoding, must start over",
        )?;
        return Ok(Verdict::RetrIncomplete);
    }
    hstat.remote_encoding = new_tokens.clone();
    hstat.enc_is_identity = Decoder::is_identity(&new_tokens);

    // 5. Status classification.
    hstat.statcode = status.as_u16();
    let retrokf = (200..300).contains(&hstat.statcode) && hstat.statcode != 207;

    // 6. 204 No Content.
    if hstat.statcode == 204 {
        hstat.bytes_read = 0;
        hstat.restval = 0;
        return Ok(Verdict::RetrFinished);
    }

    // 7. Non-OK.
    if !retrokf {
        let err = Error::wrong_code(url, status, response.status_text_or_reason(), response.headers());
        if response.headers().get(SERVER).and_then(|v| v.to_str().ok()) == Some("cloudflare")
            && matches!(hstat.statcode, 521 | 522 | 523 | 525 | 526)
        {
            let authority = authority_of(&reqwest::Url::parse(url).unwrap_or_else(|_| response.url().clone()));
            hosts.condemn(authority.clone());
            return Err(Error::UnreachableHost {
                url: url.to_string(),
                host: authority.clone(),
                message: format!(
                    "Error connecting to origin of host {}. From now on it will be ignored.",
                    authority
                ),
                cause: Some(err.to_string()),
            });
        }
        return Err(err);
    }

    // 8. Shrink detection.
    let mut shrunk = false;
    if hstat.statcode == 416 {
        shrunk = true;
    } else if hstat.statcode == 200 {
        if let Some(cl) = contlen {
            if cl != 0 && contrange == 0 && hstat.restval >= cl {
                shrunk = true;
            }
        }
    }
    if shrunk {
        hstat.restval = 0;
        retry_counter.increment(
            logger,
            url,
            hstat.bytes_read,
            hstat.restval,
            "Resume with Range failed, must start over",
        )?;
        return Ok(Verdict::RetrIncomplete);
    }

    // 9. Range sanity.
    if contrange != 0 && contrange != hstat.restval {
        return RangeErrorSnafu {
            url: url.to_string(),
            message: format!(
                "Server provided unexpected Content-Range: Requested {}, got {}",
                hstat.restval, contrange
            ),
        }
        .fail();
    }
    if hstat.statcode == 206 && hstat.restval > 0 && contrange == 0 {
        let crange_status = if crange_header.is_none() {
            "not provided"
        } else if crange_parsed.is_none() {
            "invalid"
        } else {
            "zero"
        };
        return RangeErrorSnafu {
            url: url.to_string(),
            message: format!(
                "Requested a Range and server sent HTTP 206 Partial Contents, but Content-Range is {}!",
                crange_status
            ),
        }
        .fail();
    }

    // 10. Commit expectations.
    hstat.contlen = contlen.map(|c| c + contrange);

    // 11. Zero-length OK (unreachable in practice after step 7, kept for fidelity).
    if !retrokf {
        hstat.bytes_read = 0;
        hstat.restval = 0;
        return Ok(Verdict::RetrFinished);
    }

    // 12. Skip strategy. `restval` counts decoded bytes (see `HttpStat`), so
    // the skip must happen in decoded space, after this attempt's own
    // decoder has produced output -- not by slicing undecoded bytes off the
    // raw chunk. Skipping raw bytes only agrees with skipping decoded bytes
    // for an identity encoding; for gzip/deflate the server resent the
    // whole compressed entity from its own byte 0, so the first raw bytes
    // are that entity's header, not a prefix of previously-seen payload.
    let mut decoded_to_skip = if hstat.restval > 0 && contrange == 0 {
        hstat.restval
    } else {
        0
    };

    hstat.bytes_read = hstat.restval;

    // 13. Resume decoder. A real resume (the server honored Range and
    // `contrange == restval`) continues the wire stream exactly where the
    // prior attempt left off, so the prior decoder's window must carry
    // over. Anything else -- a fresh start (`restval == 0`) or the server
    // ignoring Range and resending the entity from its own byte 0
    // (`contrange == 0`) -- is a brand new raw stream with its own framing
    // (e.g. its own gzip header), so the decoder must be rebuilt rather
    // than fed into a decoder that already consumed a previous header.
    if hstat.restval > 0 && contrange != 0 {
        if hstat.decoder.is_none() {
            hstat.decoder = Some(Decoder::for_tokens(new_tokens.as_deref().unwrap_or(&[])));
        }
    } else {
        hstat.decoder = Some(Decoder::for_tokens(new_tokens.as_deref().unwrap_or(&[])));
    }

    // 14. Materialize part file.
    hstat.init_part_file().map_err(|source| Error::Io {
        url: url.to_string(),
        source,
        recoverable: false,
    })?;

    // 15. Stream loop.
    let mut raw_buf = vec![0u8; HTTP_CHUNK_SIZE];
    let mut decoded = Vec::with_capacity(HTTP_CHUNK_SIZE);
    loop {
        let n = match response.read(&mut raw_buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(read_err) => {
                return handle_stream_error(url, hstat, logger, true, read_err.into());
            }
        };

        let raw_chunk = &raw_buf[..n];
        decoded.clear();
        if !raw_chunk.is_empty() {
            let decoder = hstat.decoder.as_mut().expect("decoder materialized above");
            if let Err(e) = decoder.decode(raw_chunk, &mut decoded) {
                return handle_stream_error(url, hstat, logger, true, e);
            }
        }

        let mut fresh = decoded.as_slice();
        if decoded_to_skip > 0 {
            let skip_now = decoded_to_skip.min(fresh.len() as u64) as usize;
            fresh = &fresh[skip_now..];
            decoded_to_skip -= skip_now as u64;
        }

        if !fresh.is_empty() {
            hstat.bytes_read += fresh.len() as u64;
            let part_file = hstat.part_file.as_mut().expect("part file materialized above");
            if let Err(write_err) = part_file.write_all(fresh) {
                return handle_stream_error(url, hstat, logger, false, write_err);
            }
            hstat.bytes_written += fresh.len() as u64;
        }
    }

    // 16. Clean finish.
    hstat.decoder = None;
    Ok(Verdict::RetrFinished)
}

fn status_permits_body(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

fn handle_stream_error(
    url: &str,
    hstat: &mut HttpStat,
    logger: &Logger,
    is_read_error: bool,
    err: std::io::Error,
) -> Result<Verdict, Error> {
    let length_known = hstat.contlen.is_some() && (is_read_error || hstat.enc_is_identity);
    let byte_pos = if is_read_error {
        hstat.bytes_read
    } else {
        hstat.bytes_written
    };
    logger.warn(
        url,
        &format!(
            "{} error at byte {}{}",
            if is_read_error { "Read" } else { "Write" },
            byte_pos,
            if length_known {
                format!("/{}", hstat.contlen.unwrap())
            } else {
                String::new()
            }
        ),
    );

    // This propagates up to the retrieve loop, which is the single place a
    // retry slot for transport errors gets consumed. `hstat.decoder`
    // already holds this attempt's decompressor (materialized in place, not
    // inside a separate response object), so it survives the unwind
    // automatically and is ready to resume on the next attempt when one is
    // granted. Write failures are marked unrecoverable: a local disk fault
    // is not a transient remote condition, so it isn't retried the way a
    // read failure is (see DESIGN.md).
    Err(Error::Io {
        url: url.to_string(),
        source: err,
        recoverable: is_read_error,
    })
}

trait StatusTextExt {
    fn status_text_or_reason(&self) -> String;
}

impl StatusTextExt for reqwest::blocking::Response {
    fn status_text_or_reason(&self) -> String {
        self.status()
            .canonical_reason()
            .unwrap_or("Unknown Reason")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FetchResponse;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn get(url: &str) -> reqwest::blocking::Response {
        reqwest::blocking::Client::new().get(url).send().unwrap()
    }

    fn fetch(response: reqwest::blocking::Response) -> FetchResponse {
        FetchResponse {
            current_url: response.url().clone(),
            response,
        }
    }

    fn hstat_with_part_file(dir: &std::path::Path) -> HttpStat {
        let mut hstat = HttpStat::new();
        let dir = dir.to_path_buf();
        hstat.make_part_file = Some(Box::new(move || {
            tempfile::Builder::new().prefix(".part.").rand_bytes(8).tempfile_in(&dir)
        }));
        hstat
    }

    fn logger(url: &str) -> Logger {
        Logger::with_log_crate(url.to_string())
    }

    #[test]
    fn no_content_finishes_with_zero_bytes() {
        let mut server = mockito::Server::new();
        let _m = server.mock("GET", "/empty").with_status(204).create();
        let url = format!("{}/empty", server.url());

        let dir = tempdir().unwrap();
        let mut hstat = hstat_with_part_file(dir.path());
        let log = logger(&url);
        let mut retry = RetryCounter::new();
        let hosts = HostRegistry::new();

        let verdict = process_response(&url, &mut hstat, &log, &mut retry, &hosts, fetch(get(&url))).unwrap();
        assert_eq!(verdict, Verdict::RetrFinished);
        assert_eq!(hstat.bytes_read, 0);
        assert_eq!(hstat.restval, 0);
    }

    #[test]
    fn multipart_byteranges_rejected() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/multi")
            .with_status(206)
            .with_header("content-type", "multipart/byteranges; boundary=THIS_STRING_SEPARATES")
            .with_body("irrelevant")
            .create();
        let url = format!("{}/multi", server.url());

        let dir = tempdir().unwrap();
        let mut hstat = hstat_with_part_file(dir.path());
        let log = logger(&url);
        let mut retry = RetryCounter::new();
        let hosts = HostRegistry::new();

        let err = process_response(&url, &mut hstat, &log, &mut retry, &hosts, fetch(get(&url))).unwrap_err();
        assert!(matches!(err, Error::BadResponse { .. }));
    }

    #[test]
    fn range_mismatch_is_reported() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/partial")
            .with_status(206)
            .with_header("content-range", "bytes 5-9/10")
            .with_body("fghij")
            .create();
        let url = format!("{}/partial", server.url());

        let dir = tempdir().unwrap();
        let mut hstat = hstat_with_part_file(dir.path());
        hstat.restval = 2;
        let log = logger(&url);
        let mut retry = RetryCounter::new();
        let hosts = HostRegistry::new();

        let err = process_response(&url, &mut hstat, &log, &mut retry, &hosts, fetch(get(&url))).unwrap_err();
        match err {
            Error::RangeError { message, .. } => {
                assert!(message.contains("Requested 2, got 5"));
            }
            other => panic!("expected RangeError, got {:?}", other),
        }
    }

    #[test]
    fn requested_range_not_satisfiable_is_a_wrong_code_error() {
        // Status classification runs before shrink detection, so a
        // non-2xx status -- including 416 -- is always reported as
        // `WrongCode` rather than reaching the shrink-restart path; the 416
        // branch of shrink detection is structurally unreachable.
        let mut server = mockito::Server::new();
        let _m = server.mock("GET", "/shrunk").with_status(416).create();
        let url = format!("{}/shrunk", server.url());

        let dir = tempdir().unwrap();
        let mut hstat = hstat_with_part_file(dir.path());
        hstat.restval = 100;
        hstat.bytes_read = 100;
        let log = logger(&url);
        let mut retry = RetryCounter::new();
        let hosts = HostRegistry::new();

        let err = process_response(&url, &mut hstat, &log, &mut retry, &hosts, fetch(get(&url))).unwrap_err();
        match err {
            Error::WrongCode { status, .. } => assert_eq!(status, 416),
            other => panic!("expected WrongCode, got {:?}", other),
        }
    }

    #[test]
    fn shrunk_content_length_on_200_restarts() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/shrunk200")
            .with_status(200)
            .with_header("content-length", "5")
            .with_body("hello")
            .create();
        let url = format!("{}/shrunk200", server.url());

        let dir = tempdir().unwrap();
        let mut hstat = hstat_with_part_file(dir.path());
        // A prior attempt believes it already has more bytes than the
        // server now claims the whole entity is -- the entity shrunk
        // between attempts.
        hstat.restval = 100;
        hstat.bytes_read = 100;
        let log = logger(&url);
        let mut retry = RetryCounter::new();
        let hosts = HostRegistry::new();

        let verdict = process_response(&url, &mut hstat, &log, &mut retry, &hosts, fetch(get(&url))).unwrap();
        assert_eq!(verdict, Verdict::RetrIncomplete);
        assert_eq!(hstat.restval, 0);
    }

    #[test]
    fn inconsistent_encoding_on_resume_restarts() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/resume")
            .with_status(200)
            .with_body("whole file again")
            .create();
        let url = format!("{}/resume", server.url());

        let dir = tempdir().unwrap();
        let mut hstat = hstat_with_part_file(dir.path());
        hstat.restval = 10;
        hstat.bytes_read = 10;
        hstat.remote_encoding = Some(vec!["gzip".to_string()]);
        let log = logger(&url);
        let mut retry = RetryCounter::new();
        let hosts = HostRegistry::new();

        let verdict = process_response(&url, &mut hstat, &log, &mut retry, &hosts, fetch(get(&url))).unwrap();
        assert_eq!(verdict, Verdict::RetrIncomplete);
        assert_eq!(hstat.restval, 0);
    }

    #[test]
    fn cloudflare_523_condemns_host() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/origin-down")
            .with_status(523)
            .with_header("server", "cloudflare")
            .create();
        let url = format!("{}/origin-down", server.url());

        let dir = tempdir().unwrap();
        let mut hstat = hstat_with_part_file(dir.path());
        let log = logger(&url);
        let mut retry = RetryCounter::new();
        let hosts = HostRegistry::new();

        let err = process_response(&url, &mut hstat, &log, &mut retry, &hosts, fetch(get(&url))).unwrap_err();
        assert!(matches!(err, Error::UnreachableHost { .. }));
        let parsed = reqwest::Url::parse(&url).unwrap();
        assert!(hosts.is_condemned(&authority_of(&parsed)));
    }

    #[test]
    fn successful_identity_fetch_streams_body() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/a.bin")
            .with_status(200)
            .with_header("content-length", "5")
            .with_body("hello")
            .create();
        let url = format!("{}/a.bin", server.url());

        let dir = tempdir().unwrap();
        let mut hstat = hstat_with_part_file(dir.path());
        let log = logger(&url);
        let mut retry = RetryCounter::new();
        let hosts = HostRegistry::new();

        let verdict = process_response(&url, &mut hstat, &log, &mut retry, &hosts, fetch(get(&url))).unwrap();
        assert_eq!(verdict, Verdict::RetrFinished);
        assert_eq!(hstat.bytes_read, 5);
        assert_eq!(hstat.contlen, Some(5));

        let mut contents = String::new();
        std::fs::File::open(hstat.part_file.as_ref().unwrap().path())
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "hello");
    }

    #[test]
    fn gzip_body_is_decoded_while_streaming() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"hello, gzipped").unwrap();
        let compressed = enc.finish().unwrap();

        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/a.gz")
            .with_status(200)
            .with_header("content-encoding", "gzip")
            .with_body(compressed)
            .create();
        let url = format!("{}/a.gz", server.url());

        let dir = tempdir().unwrap();
        let mut hstat = hstat_with_part_file(dir.path());
        let log = logger(&url);
        let mut retry = RetryCounter::new();
        let hosts = HostRegistry::new();

        let verdict = process_response(&url, &mut hstat, &log, &mut retry, &hosts, fetch(get(&url))).unwrap();
        assert_eq!(verdict, Verdict::RetrFinished);
        assert_eq!(hstat.bytes_read, "hello, gzipped".len() as u64);

        let mut contents = String::new();
        std::fs::File::open(hstat.part_file.as_ref().unwrap().path())
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "hello, gzipped");
    }
}
