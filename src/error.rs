//! The error taxonomy for a single retrieval attempt and for the loop as a whole.
//!
//! Every variant corresponds to one of the error classes raised by the retrieval
//! loop: protocol rejection, host condemnation, malformed/unexpected HTTP
//! responses, and retry exhaustion. All carry the URL in play and a message;
//! most carry an underlying `source`.

use reqwest::StatusCode;
use snafu::Snafu;
use std::fmt;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while retrieving a single resource.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
#[non_exhaustive]
pub enum Error {
    /// The target URL did not use the `http` or `https` scheme.
    #[snafu(display("Error retrieving '{}': non-HTTP(S) protocols are not implemented", url))]
    BadProtocol { url: String },

    /// The authority is condemned, or a fresh failure caused it to be condemned.
    #[snafu(display("Error retrieving '{}': host {} is unreachable: {}", url, host, message))]
    UnreachableHost {
        url: String,
        host: String,
        message: String,
        /// The underlying transport failure that caused condemnation, if any,
        /// rendered eagerly since the original error is not always `'static`.
        cause: Option<String>,
    },

    /// The server sent a multipart response to a single-range request.
    #[snafu(display("Error retrieving '{}': bad response: {}", url, message))]
    BadResponse { url: String, message: String },

    /// The server returned an HTTP status outside the success range.
    #[snafu(display(
        "Error retrieving '{}': unexpected response status: HTTP {} {}{}",
        url,
        status,
        reason,
        headers_suffix
    ))]
    WrongCode {
        url: String,
        status: u16,
        reason: String,
        /// Pre-formatted ", Headers: {...}" suffix, omitted for 403/404 per spec.
        headers_suffix: String,
    },

    /// The server sent an incoherent `Content-Range`.
    #[snafu(display("Error retrieving '{}': range error: {}", url, message))]
    RangeError { url: String, message: String },

    /// The retry budget was exhausted.
    #[snafu(display(
        "Error retrieving '{}': retrieval failed after {} tries: {}",
        url,
        tries,
        cause
    ))]
    MaxRetry {
        url: String,
        tries: u32,
        cause: String,
    },

    /// A low-level I/O failure: either a body-read failure from the
    /// transport, or a local disk failure (part-file write, rename,
    /// fsync). `recoverable` is true only for read failures, which the
    /// retrieve loop treats like any other transport hiccup and retries;
    /// local disk failures are not retried (see DESIGN.md).
    #[snafu(display("Error retrieving '{}': I/O error: {}", url, source))]
    Io {
        url: String,
        source: std::io::Error,
        recoverable: bool,
    },

    /// The underlying HTTP client could not even build or send a request.
    #[snafu(display("Error retrieving '{}': transport error: {}", url, source))]
    Transport {
        url: String,
        source: reqwest::Error,
    },
}

impl Error {
    /// The URL this error pertains to, for logging at the unwind point.
    pub fn url(&self) -> &str {
        match self {
            Error::BadProtocol { url }
            | Error::UnreachableHost { url, .. }
            | Error::BadResponse { url, .. }
            | Error::WrongCode { url, .. }
            | Error::RangeError { url, .. }
            | Error::MaxRetry { url, .. }
            | Error::Io { url, .. }
            | Error::Transport { url, .. } => url,
        }
    }

    /// True if this error represents the retry budget having been exhausted.
    pub fn is_max_retry(&self) -> bool {
        matches!(self, Error::MaxRetry { .. })
    }

    /// True if this error represents a recoverable body-read failure, as
    /// opposed to a local disk fault. Non-`Io` variants are never
    /// considered recoverable by this accessor.
    pub fn is_recoverable_io(&self) -> bool {
        matches!(self, Error::Io { recoverable: true, .. })
    }

    pub(crate) fn wrong_code(
        url: impl Into<String>,
        status: StatusCode,
        reason: impl fmt::Display,
        headers: &reqwest::header::HeaderMap,
    ) -> Self {
        let status_u16 = status.as_u16();
        let headers_suffix = if status_u16 == 403 || status_u16 == 404 {
            String::new()
        } else {
            format!(", Headers: {:?}", headers)
        };
        Error::WrongCode {
            url: url.into(),
            status: status_u16,
            reason: reason.to_string(),
            headers_suffix,
        }
    }
}
