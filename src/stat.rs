//! `HttpStat`: the per-retrieval mutable state owned by the entry point and
//! threaded by `&mut` reference through the retrieve loop and response
//! processor.

use std::io;

use tempfile::NamedTempFile;

use crate::decoder::Decoder;

#[cfg(unix)]
use std::os::unix::io::OwnedFd;

/// One-shot factory for the part file: not invoked until the first
/// response is confirmed writable, so validation failures leave the
/// destination directory untouched.
pub type PartFileFactory = Box<dyn FnOnce() -> io::Result<NamedTempFile> + Send>;

/// The per-retrieval mutable state.
pub struct HttpStat {
    /// The most recent effective URL after redirects.
    pub current_url: Option<String>,
    /// Decoded bytes appended so far across all attempts.
    pub bytes_read: u64,
    /// Bytes actually flushed to the part file; always `<= bytes_read`.
    pub bytes_written: u64,
    /// The byte offset the next attempt requests resumption from.
    pub restval: u64,
    /// Remote total entity length, if known.
    pub contlen: Option<u64>,
    /// Raw `Last-Modified` (or `X-Archive-Orig-last-modified`) header value.
    pub last_modified: Option<String>,
    /// Parsed mtime, seconds since epoch.
    pub remote_time: Option<i64>,
    /// Last HTTP status; 0 if unparseable.
    pub statcode: u16,
    /// Normalized `Content-Encoding` tokens of the last response.
    pub remote_encoding: Option<Vec<String>>,
    /// True iff `remote_encoding` is empty/absent or all tokens are `identity`.
    pub enc_is_identity: bool,
    /// Resumable decompressor snapshot, carried across attempts.
    pub decoder: Option<Decoder>,
    /// Open directory descriptor for the destination directory (POSIX only).
    #[cfg(unix)]
    pub dest_dir: Option<OwnedFd>,
    #[cfg(not(unix))]
    pub dest_dir: Option<()>,
    /// Append-mode handle to the temporary part file, once materialized.
    pub part_file: Option<NamedTempFile>,
    /// One-shot deferred factory for `part_file`.
    pub make_part_file: Option<PartFileFactory>,
}

impl HttpStat {
    pub fn new() -> Self {
        Self {
            current_url: None,
            bytes_read: 0,
            bytes_written: 0,
            restval: 0,
            contlen: None,
            last_modified: None,
            remote_time: None,
            statcode: 0,
            remote_encoding: None,
            enc_is_identity: true,
            decoder: None,
            dest_dir: None,
            part_file: None,
            make_part_file: None,
        }
    }

    /// Invokes the deferred factory if the part file doesn't exist yet.
    /// Never recreates an already-materialized part file within one
    /// retrieval.
    pub fn init_part_file(&mut self) -> io::Result<()> {
        if self.part_file.is_none() {
            if let Some(factory) = self.make_part_file.take() {
                self.part_file = Some(factory()?);
            }
        }
        Ok(())
    }
}

impl Default for HttpStat {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HttpStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStat")
            .field("current_url", &self.current_url)
            .field("bytes_read", &self.bytes_read)
            .field("bytes_written", &self.bytes_written)
            .field("restval", &self.restval)
            .field("contlen", &self.contlen)
            .field("last_modified", &self.last_modified)
            .field("remote_time", &self.remote_time)
            .field("statcode", &self.statcode)
            .field("remote_encoding", &self.remote_encoding)
            .field("enc_is_identity", &self.enc_is_identity)
            .field("decoder", &self.decoder)
            .field("has_part_file", &self.part_file.is_some())
            .finish()
    }
}
