//! The connection pool adapter: a `reqwest::blocking`-based HTTP(S) client
//! with a few deliberate deviations from a stock client.
//!
//! Returns per-response metadata the response processor needs -- the
//! effective post-redirect URL -- and fails fast on condemned hosts before
//! any connection is attempted. Connection reuse is a single long-lived
//! `Client`, built once, so the `Connection: keep-alive` contract actually
//! pools sockets across calls.

use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{Client, ClientBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, CONNECTION, RANGE, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{StatusCode, Url};

use crate::decoder::supported_encodings;
use crate::hosts::{authority_of, HostRegistry};

const DEFAULT_USER_AGENT: &str = concat!("resumable-fetch/", env!("CARGO_PKG_VERSION"));

/// Settings for the HTTP client.
#[derive(Clone, Debug)]
pub struct ClientSettings {
    /// Connect + read timeout for one request (default: 90s).
    pub timeout: Duration,
    /// Whether TLS certificate validation is enabled.
    pub ssl_verify: bool,
    /// Overrides the default `User-Agent` header.
    pub user_agent: Option<String>,
    /// Internal transport-level retry budget (distinct from the outer
    /// `RetryCounter`): total attempts within one `fetch` call.
    pub transport_tries: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            ssl_verify: true,
            user_agent: None,
            transport_tries: 3,
        }
    }
}

/// Statuses the transport-level retry always forces a retry on, regardless
/// of connect/non-connect distinction.
const FORCE_RETRY_STATUSES: [u16; 3] = [500, 503, 504];
/// Statuses whose `Retry-After` header is honored before retrying.
const RETRY_AFTER_STATUSES: [u16; 2] = [413, 429];

/// A pooled HTTP(S) client that fails fast on condemned hosts.
#[derive(Clone)]
pub struct ConnectionPool {
    client: Client,
    settings: ClientSettings,
    hosts: Arc<HostRegistry>,
}

/// The outcome of acquiring a connection pool for a URL: either the pool is
/// usable, or the authority is (now) condemned.
pub enum PoolResult {
    Ready(ConnectionPool),
    Condemned { authority: String },
}

impl ConnectionPool {
    /// Builds the shared client. Call once per process/job; clone cheaply
    /// thereafter (both `Client` and `HostRegistry` are internally `Arc`'d).
    pub fn new(settings: ClientSettings, hosts: Arc<HostRegistry>) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            ACCEPT_ENCODING,
            HeaderValue::from_str(&supported_encodings().join(", ")).unwrap(),
        );
        let ua = settings.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
        headers.insert(USER_AGENT, HeaderValue::from_str(ua).unwrap());

        let client = ClientBuilder::new()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .danger_accept_invalid_certs(!settings.ssl_verify)
            .default_headers(headers)
            .redirect(redirect_policy())
            .build()?;

        Ok(Self {
            client,
            settings,
            hosts,
        })
    }

    /// Checks host condemnation before issuing any network I/O: if the
    /// authority is already condemned, no TCP attempt is made.
    pub fn for_url(&self, url: &Url) -> PoolResult {
        let authority = authority_of(url);
        if self.hosts.is_condemned(&authority) {
            return PoolResult::Condemned { authority };
        }
        PoolResult::Ready(self.clone())
    }

    pub fn hosts(&self) -> &Arc<HostRegistry> {
        &self.hosts
    }

    pub fn transport_tries(&self) -> u32 {
        self.settings.transport_tries
    }

    /// Issues one GET, honoring `restval` as a `Range: bytes={restval}-`
    /// request header, and internally retrying transport failures and
    /// forced-retry status codes per `ClientSettings::transport_tries`.
    ///
    /// Returns the raw `reqwest::blocking::Response` (no content-decoding
    /// applied -- the response processor owns that) plus the effective URL
    /// reqwest followed redirects to.
    pub fn fetch(&self, url: &Url, restval: u64) -> Result<FetchResponse, FetchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut req = self.client.get(url.clone());
            if restval > 0 {
                req = req.header(RANGE, format!("bytes={}-", restval));
            }

            let result = req.send();
            match result {
                Ok(response) => {
                    let status = response.status();
                    if FORCE_RETRY_STATUSES.contains(&status.as_u16())
                        && attempt < self.settings.transport_tries
                    {
                        continue;
                    }
                    if RETRY_AFTER_STATUSES.contains(&status.as_u16())
                        && attempt < self.settings.transport_tries
                    {
                        if let Some(secs) = retry_after_seconds(&response) {
                            std::thread::sleep(Duration::from_secs(secs));
                        }
                        continue;
                    }
                    let current_url = response.url().clone();
                    return Ok(FetchResponse {
                        current_url,
                        response,
                    });
                }
                Err(err) => {
                    if err.is_connect() {
                        // Never retried internally; the caller (retrieve
                        // loop) decides whether to condemn the host.
                        return Err(FetchError::Connect(err));
                    }
                    if attempt < self.settings.transport_tries {
                        continue;
                    }
                    return Err(FetchError::Exhausted(err));
                }
            }
        }
    }
}

fn retry_after_seconds(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

fn redirect_policy() -> Policy {
    // 300 is treated as a redirect in addition to reqwest's stock set
    // (301/302/303/307/308).
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 10 {
            return attempt.error("too many redirects");
        }
        match attempt.status() {
            StatusCode::MULTIPLE_CHOICES
            | StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT => attempt.follow(),
            _ => attempt.stop(),
        }
    })
}

/// One successful (at the transport level) HTTP response, not yet
/// validated by the response processor.
pub struct FetchResponse {
    pub current_url: Url,
    pub response: Response,
}

/// A transport-level failure from [`ConnectionPool::fetch`].
#[derive(Debug)]
pub enum FetchError {
    /// Connect-timeout or name/address resolution failure -- a candidate
    /// for host condemnation.
    Connect(reqwest::Error),
    /// `transport_tries` internal attempts were exhausted without a usable
    /// response. There is no other path to this variant: the caller should
    /// treat it as a fatal, non-retryable-by-it failure, not spend one of
    /// its own retry slots on it.
    Exhausted(reqwest::Error),
}

impl FetchError {
    pub fn into_inner(self) -> reqwest::Error {
        match self {
            FetchError::Connect(e) | FetchError::Exhausted(e) => e,
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Connect(e) => write!(f, "connect failed: {}", e),
            FetchError::Exhausted(e) => write!(f, "transport error (internal retries exhausted): {}", e),
        }
    }
}
