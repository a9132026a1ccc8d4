//! Small platform-facing helpers: tolerant HTTP-date parsing, and POSIX
//! durability primitives (`fsync`/`fdatasync`/directory-fd rename) with a
//! portable fallback.

use chrono::{DateTime, NaiveDateTime};

/// Parses an HTTP date header value, tolerant of the three formats RFC 7231
/// obliges servers to accept on the wire: RFC 1123 (`Sun, 06 Nov 1994
/// 08:49:37 GMT`), the obsolete RFC 850 (`Sunday, 06-Nov-94 08:49:37 GMT`),
/// and ANSI C's `asctime` (`Sun Nov  6 08:49:37 1994`). Returns `None` on
/// parse failure rather than erroring.
pub fn parse_http_date(s: &str) -> Option<i64> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%A, %d-%b-%y %H:%M:%S GMT") {
        return Some(ndt.timestamp());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%a %b %e %H:%M:%S %Y") {
        return Some(ndt.timestamp());
    }
    None
}

#[cfg(unix)]
pub mod posix {
    use std::ffi::OsStr;
    use std::fs::File;
    use std::io;
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::path::Path;

    use nix::fcntl::{self, OFlag};
    use nix::sys::stat::{utimensat, Mode, UtimensatFlags};
    use nix::sys::time::TimeSpec;
    use nix::unistd;

    /// Opens `dir` with `O_RDONLY|O_DIRECTORY`.
    pub fn open_dir(dir: &Path) -> io::Result<OwnedFd> {
        let fd = fcntl::open(dir, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
            .map_err(nix_to_io)?;
        // Safety: `open` returned a freshly-owned, valid fd.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub fn fsync(file: &File) -> io::Result<()> {
        unistd::fsync(file.as_raw_fd()).map_err(nix_to_io)
    }

    #[cfg(target_os = "linux")]
    pub fn fdatasync(dir: &OwnedFd) -> io::Result<()> {
        unistd::fdatasync(dir.as_raw_fd()).map_err(nix_to_io)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn fdatasync(dir: &OwnedFd) -> io::Result<()> {
        // fdatasync is Linux-specific; fall back to the stronger fsync
        // elsewhere (e.g. the BSDs, which don't distinguish the two).
        unistd::fsync(dir.as_raw_fd()).map_err(nix_to_io)
    }

    /// Sets the file's mode to 0644; temp files are created 0600 by
    /// default.
    pub fn fchmod_0644(file: &File) -> io::Result<()> {
        nix::sys::stat::fchmod(
            file.as_raw_fd(),
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        )
        .map_err(nix_to_io)
    }

    /// Sets mtime (and atime := now) on `basename` within `dir_fd`.
    pub fn set_mtime(dir_fd: &OwnedFd, basename: &OsStr, mtime: i64) -> io::Result<()> {
        let now_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let now = TimeSpec::seconds(now_secs);
        let mtime_spec = TimeSpec::seconds(mtime);
        utimensat(
            Some(dir_fd.as_raw_fd()),
            basename,
            &now,
            &mtime_spec,
            UtimensatFlags::FollowSymlink,
        )
        .map_err(nix_to_io)
    }

    /// Atomically renames `old_basename` to `new_basename`, both resolved
    /// relative to `dir_fd`, using directory-fd-based rename.
    pub fn rename_within(
        dir_fd: &OwnedFd,
        old_basename: &OsStr,
        new_basename: &OsStr,
    ) -> io::Result<()> {
        fcntl::renameat(
            Some(dir_fd.as_raw_fd()),
            old_basename,
            Some(dir_fd.as_raw_fd()),
            new_basename,
        )
        .map_err(nix_to_io)
    }

    fn nix_to_io(e: nix::Error) -> io::Error {
        io::Error::from_raw_os_error(e as i32)
    }

    /// Only used by tests/non-POSIX fallback paths that want a raw fd
    /// without going through `File`.
    #[allow(dead_code)]
    pub fn raw(fd: &OwnedFd) -> RawFd {
        fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc1123() {
        assert_eq!(
            parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"),
            Some(784111777)
        );
    }

    #[test]
    fn parses_rfc850() {
        assert_eq!(
            parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT"),
            Some(784111777)
        );
    }

    #[test]
    fn parses_asctime() {
        assert_eq!(
            parse_http_date("Sun Nov  6 08:49:37 1994"),
            Some(784111777)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_http_date("not a date"), None);
    }
}
