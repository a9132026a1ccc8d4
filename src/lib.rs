//! A resilient single-resource HTTP(S) downloader tailored for archival
//! crawling of user-generated content.
//!
//! Given a target URL and a destination file path, [`retrieve`] (or a
//! reusable [`Retriever`]) produces -- atomically and durably -- a local
//! file whose contents equal the remote entity, tolerating partial reads,
//! connection drops, transient 5xx errors, inconsistent content encodings,
//! range-request quirks, and unreachable origins.
//!
//! This crate covers the retrieval loop only: byte-range resumption across
//! attempts, content-encoding continuity across reconnects, partial-file
//! management with atomic rename, unreachable-host quarantining, and the
//! retry/backoff policy. Command-line parsing, configuration loading, TLS
//! library setup, DNS probing beyond a best-effort default, process-wide
//! logging sinks, and the higher-level crawler that decides which URLs to
//! fetch are treated as injected capabilities or left to the caller.
//!
//! ```no_run
//! use std::path::Path;
//! use resumable_fetch::{retrieve, RetrieveOptions};
//!
//! let mut options = RetrieveOptions::default();
//! options.use_server_timestamps = true;
//! let hstat = retrieve(
//!     "https://example.com/image.jpg",
//!     Path::new("/archive/image.jpg"),
//!     options,
//!     None,
//!     None,
//! )?;
//! println!("wrote {} bytes", hstat.bytes_read);
//! # Ok::<(), resumable_fetch::Error>(())
//! ```

mod content_range;
mod decoder;
mod error;
mod hosts;
mod logger;
mod options;
mod pool;
mod response;
mod retrieve;
mod retry;
mod stat;
mod util;

pub use content_range::{parse_content_range, ContentRange};
pub use error::{Error, Result};
pub use hosts::{authority_of, HostRegistry};
pub use logger::{Level, LogCrateSink, LogSink, Logger};
pub use options::{
    AlwaysOnline, DnsProbe, NoInternetSignal, PollingNoInternetSignal, RetrieveOptions, Switchable,
    TcpDnsProbe,
};
pub use pool::{ClientSettings, ConnectionPool};
pub use retrieve::{retrieve, AdjustBasename, Retriever};
pub use retry::{RetryCounter, MAX_RETRY_WAIT, TRY_LIMIT};
pub use stat::HttpStat;
