//! The retrieve loop and entry point: the orchestrator that drives the
//! response processor to completion, and the per-call setup/teardown of
//! temp file, directory handle, and `HttpStat` around it.
//!
//! `Retriever` is constructed once from `RetrieveOptions` (and the injected
//! capabilities), then called per-resource, sharing a connection pool and
//! host registry across calls.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;

use crate::error::{BadProtocolSnafu, Error, MaxRetrySnafu};
use crate::hosts::{authority_of, HostRegistry};
use crate::logger::{LogCrateSink, LogSink, Logger};
use crate::options::{DnsProbe, NoInternetSignal, PollingNoInternetSignal, RetrieveOptions, TcpDnsProbe};
use crate::pool::{ClientSettings, ConnectionPool, FetchError, PoolResult};
use crate::response::{process_response, Verdict};
use crate::retry::RetryCounter;
use crate::stat::HttpStat;

#[cfg(unix)]
use crate::util::posix;

/// A closure invoked exactly once after download, before rename: given the
/// original basename and a readable view of the finished part file, it
/// returns the basename the file should be published under.
pub type AdjustBasename<'a> = dyn Fn(&str, &mut File) -> std::io::Result<String> + 'a;

/// The primary API of this crate: a configured functor that retrieves one
/// resource at a time, sharing a connection pool and host-condemnation
/// registry across calls.
pub struct Retriever {
    pool: ConnectionPool,
    hosts: Arc<HostRegistry>,
    dns_probe: Arc<dyn DnsProbe>,
    no_internet: Arc<dyn NoInternetSignal>,
    log_sink: Arc<dyn LogSink>,
    options: RetrieveOptions,
}

impl Retriever {
    /// Builds a `Retriever` against the process-wide [`HostRegistry`], the
    /// default TCP-based DNS probe, and the `log` crate facade.
    pub fn new(options: RetrieveOptions) -> Result<Self, Error> {
        Self::with_capabilities(
            options,
            Arc::new(HostRegistry::new()),
            Arc::new(TcpDnsProbe),
            Arc::new(LogCrateSink),
        )
    }

    /// Builds a `Retriever` against a caller-supplied host registry, DNS
    /// probe, and log sink -- for a crawler that wants to share
    /// condemnation state across many `Retriever`s, or capture logs itself.
    pub fn with_capabilities(
        options: RetrieveOptions,
        hosts: Arc<HostRegistry>,
        dns_probe: Arc<dyn DnsProbe>,
        log_sink: Arc<dyn LogSink>,
    ) -> Result<Self, Error> {
        let settings = ClientSettings {
            timeout: options.timeout,
            ssl_verify: options.ssl_verify,
            user_agent: options.user_agent.clone(),
            ..ClientSettings::default()
        };
        let pool = ConnectionPool::new(settings, Arc::clone(&hosts)).map_err(|source| Error::Transport {
            url: "<client setup>".to_string(),
            source,
        })?;
        let no_internet = Arc::new(PollingNoInternetSignal::new(Arc::clone(&dns_probe)));
        Ok(Self {
            pool,
            hosts,
            dns_probe,
            no_internet,
            log_sink,
            options,
        })
    }

    /// The process-wide shared [`HostRegistry`] this retriever condemns
    /// hosts into, for callers that want to inspect or share it.
    pub fn hosts(&self) -> &Arc<HostRegistry> {
        &self.hosts
    }

    /// Retrieves `url` into `dest_path`, atomically and durably.
    ///
    /// `post_timestamp` is combined with the remote mtime by minimum when
    /// `use_server_timestamps` is set and both are present.
    /// `adjust_basename`, if supplied, is called exactly once after
    /// download and before rename.
    pub fn retrieve(
        &self,
        url: &str,
        dest_path: &Path,
        post_timestamp: Option<i64>,
        adjust_basename: Option<&AdjustBasename<'_>>,
    ) -> Result<HttpStat, Error> {
        let mut hstat = HttpStat::new();
        let result = self.run(&mut hstat, url, dest_path, post_timestamp, adjust_basename);

        // Every exit path releases the directory fd and, if the part file
        // was never consumed by a successful finalize, unlinks it.
        #[cfg(unix)]
        {
            hstat.dest_dir.take();
        }
        if let Some(part_file) = hstat.part_file.take() {
            drop(part_file); // `NamedTempFile::drop` unlinks it.
        }

        result.map(|()| hstat)
    }

    fn run(
        &self,
        hstat: &mut HttpStat,
        url: &str,
        dest_path: &Path,
        post_timestamp: Option<i64>,
        adjust_basename: Option<&AdjustBasename<'_>>,
    ) -> Result<(), Error> {
        let parsed = Url::parse(url).map_err(|_| BadProtocolSnafu { url: url.to_string() }.build())?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return BadProtocolSnafu { url: url.to_string() }.fail();
        }

        let authority = authority_of(&parsed);
        if self.hosts.is_condemned(&authority) {
            return Err(Error::UnreachableHost {
                url: url.to_string(),
                host: authority.clone(),
                message: format!("Host {} is ignored.", authority),
                cause: None,
            });
        }

        let dest_dirname = dest_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let dest_basename = dest_path
            .file_name()
            .ok_or_else(|| BadProtocolSnafu { url: url.to_string() }.build())?
            .to_string_lossy()
            .into_owned();

        #[cfg(unix)]
        {
            hstat.dest_dir = Some(posix::open_dir(&dest_dirname).map_err(|source| Error::Io {
                url: url.to_string(),
                source,
                recoverable: false,
            })?);
        }

        let prefix = format!(".{}.", dest_basename);
        let factory_dir = dest_dirname.clone();
        hstat.make_part_file = Some(Box::new(move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .rand_bytes(8)
                .tempfile_in(&factory_dir)
        }));

        let logger = Logger::new(url.to_string(), Arc::clone(&self.log_sink));
        let mut retry_counter = RetryCounter::new();
        let mut url = url.to_string();

        loop {
            hstat.restval = hstat.bytes_read;

            let parsed = match Url::parse(&url) {
                Ok(u) => u,
                Err(_) => return BadProtocolSnafu { url: url.clone() }.fail(),
            };

            let conn = match self.pool.for_url(&parsed) {
                PoolResult::Ready(conn) => conn,
                PoolResult::Condemned { authority } => {
                    return Err(Error::UnreachableHost {
                        url: url.clone(),
                        host: authority.clone(),
                        message: format!("Host {} is ignored.", authority),
                        cause: None,
                    });
                }
            };

            let fetch = match conn.fetch(&parsed, hstat.restval) {
                Ok(fetch) => fetch,
                Err(FetchError::Connect(e)) => {
                    if !self.dns_probe.is_dns_working(Duration::from_secs(5)) {
                        // Not a genuine HTTP error -- spin until connectivity
                        // returns, then re-issue the same request.
                        self.no_internet.wait_for_connectivity();
                        continue;
                    }
                    let authority = authority_of(&parsed);
                    self.hosts.condemn(authority.clone());
                    return Err(Error::UnreachableHost {
                        url: url.clone(),
                        host: authority.clone(),
                        message: format!(
                            "Error connecting to host {}. From now on it will be ignored.",
                            authority
                        ),
                        cause: Some(e.to_string()),
                    });
                }
                Err(FetchError::Exhausted(e)) => {
                    // The pool already spent its own internal retry budget
                    // on this attempt; there is nothing left to gain by
                    // spending one of ours too, so this fails fatally
                    // rather than going through `retry_counter`.
                    return Err(MaxRetrySnafu {
                        url: url.clone(),
                        tries: conn.transport_tries(),
                        cause: e.to_string(),
                    }
                    .build());
                }
            };

            // The effective URL is cached before the response is processed,
            // so host condemnation and error/log URLs reflect the
            // post-redirect origin, not the one this attempt's request was
            // addressed to.
            hstat.current_url = Some(fetch.current_url.to_string());
            url = fetch.current_url.to_string();
            let verdict = process_response(&url, hstat, &logger, &mut retry_counter, &self.hosts, fetch);

            let verdict = match verdict {
                Ok(v) => v,
                Err(Error::Io { recoverable: true, source, .. }) => {
                    retry_counter.increment(
                        &logger,
                        &url,
                        hstat.bytes_read,
                        hstat.restval,
                        &format!("{}", source),
                    )?;
                    continue;
                }
                Err(other) => return Err(other),
            };

            match verdict {
                Verdict::RetrIncomplete => continue,
                Verdict::RetrUnneeded => return Ok(()),
                Verdict::RetrFinished => {
                    // `contlen` is a wire quantity (Content-Length/Content-Range
                    // describe the bytes transmitted, which for a non-identity
                    // encoding is the *compressed* size), while `bytes_read`
                    // counts decoded bytes (see `HttpStat::bytes_read`'s doc
                    // comment and the `bytes_written <= bytes_read` invariant,
                    // which only holds if `bytes_read` is decoded-sized). The
                    // two are only on the same scale for identity-encoded
                    // bodies, so the truncation check below only applies then;
                    // for a recognized non-identity encoding, an early EOF
                    // inside the decoder already surfaces as a hard decode
                    // error in `process_response`'s stream loop rather than a
                    // silently short `RetrFinished`.
                    if hstat.enc_is_identity {
                        if let Some(cl) = hstat.contlen {
                            if hstat.bytes_read < cl {
                                retry_counter.increment(
                                    &logger,
                                    &url,
                                    hstat.bytes_read,
                                    hstat.restval,
                                    "Server closed connection before Content-Length was reached.",
                                )?;
                                continue;
                            }
                        }
                        debug_assert!(hstat.contlen.is_none() || hstat.contlen == Some(hstat.bytes_read));
                    }
                    break;
                }
            }
        }

        self.finalize(
            hstat,
            &url,
            &logger,
            &dest_dirname,
            &dest_basename,
            post_timestamp,
            adjust_basename,
        )
    }

    fn finalize(
        &self,
        hstat: &mut HttpStat,
        url: &str,
        logger: &Logger,
        dest_dirname: &Path,
        dest_basename: &str,
        post_timestamp: Option<i64>,
        adjust_basename: Option<&AdjustBasename<'_>>,
    ) -> Result<(), Error> {
        let io_err = |source: std::io::Error| Error::Io {
            url: url.to_string(),
            source,
            recoverable: false,
        };

        let mut part_file = hstat.part_file.take().expect("part file present at finalize");

        #[cfg(unix)]
        posix::fchmod_0644(part_file.as_file()).map_err(io_err)?;

        if self.options.use_server_timestamps && hstat.remote_time.is_none() {
            let detail = match &hstat.last_modified {
                None => "missing".to_string(),
                Some(raw) => format!("invalid: {}", raw),
            };
            logger.warn(url, &format!("Last-Modified header is {}", detail));
        }

        // Flush the userspace buffer so a subsequent mtime set isn't
        // clobbered by a later implicit flush.
        part_file.flush().map_err(io_err)?;

        let tstamp = match (hstat.remote_time, post_timestamp) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        if self.options.use_server_timestamps {
            if let Some(ts) = tstamp {
                #[cfg(unix)]
                {
                    if let Some(dir_fd) = hstat.dest_dir.as_ref() {
                        let basename = part_file
                            .path()
                            .file_name()
                            .expect("part file has a basename")
                            .to_os_string();
                        posix::set_mtime(dir_fd, &basename, ts).map_err(io_err)?;
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = ts;
                }
            }
        }

        let new_basename = if let Some(hook) = adjust_basename {
            // A freshly opened read-only handle on the same path: simpler
            // than duplicating the write fd, and starts at offset 0 rather
            // than wherever the append cursor landed.
            let mut view = File::open(part_file.path()).map_err(io_err)?;
            hook(dest_basename, &mut view).map_err(io_err)?
        } else {
            dest_basename.to_string()
        };

        #[cfg(unix)]
        posix::fsync(part_file.as_file()).map_err(io_err)?;
        #[cfg(not(unix))]
        part_file.as_file().sync_all().map_err(io_err)?;

        let old_basename = part_file
            .path()
            .file_name()
            .expect("part file has a basename")
            .to_os_string();
        let (file, temp_path) = part_file.into_parts();
        drop(file); // Close before rename.

        #[cfg(unix)]
        {
            if let Some(dir_fd) = hstat.dest_dir.as_ref() {
                posix::rename_within(dir_fd, &old_basename, std::ffi::OsStr::new(&new_basename))
                    .map_err(io_err)?;
            } else {
                std::fs::rename(&*temp_path, dest_dirname.join(&new_basename)).map_err(io_err)?;
            }
        }
        #[cfg(not(unix))]
        std::fs::rename(&*temp_path, dest_dirname.join(&new_basename)).map_err(io_err)?;

        // The rename already moved the file; disarm `TempPath`'s drop-time
        // unlink rather than let it race a removal of the (now gone) old name.
        let _ = temp_path.keep();

        #[cfg(unix)]
        {
            if let Some(dir_fd) = hstat.dest_dir.as_ref() {
                posix::fdatasync(dir_fd).map_err(io_err)?;
            }
        }

        Ok(())
    }
}

/// Convenience one-shot call: builds a default [`Retriever`] and retrieves
/// a single resource. Prefer [`Retriever::new`] directly when making more
/// than one call, so the connection pool and host registry are shared.
pub fn retrieve(
    url: &str,
    dest_path: &Path,
    options: RetrieveOptions,
    post_timestamp: Option<i64>,
    adjust_basename: Option<&AdjustBasename<'_>>,
) -> Result<HttpStat, Error> {
    let retriever = Retriever::new(options)?;
    retriever.retrieve(url, dest_path, post_timestamp, adjust_basename)
}
