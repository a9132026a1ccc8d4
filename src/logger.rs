//! A URL-aware logger that annotates messages with redirect transitions.
//!
//! The first message logged for a retrieval is preceded by a line naming
//! the original URL, and every subsequent message logged against a
//! different (redirected) URL is preceded by a line naming the new current
//! URL. By default messages are forwarded to the `log` crate facade;
//! callers that want to capture records themselves (e.g. a crawler
//! aggregating per-resource logs) can supply a [`LogSink`] instead.

use std::cell::RefCell;
use std::sync::Arc;

/// Severity of a single log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// A sink that receives fully-formatted log lines from [`Logger`].
///
/// The default sink forwards to the `log` crate; implement this trait to
/// capture records elsewhere (a per-job log buffer, a channel, etc).
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

/// Forwards to the `log` crate facade (`log::info!`/`warn!`/`error!`).
#[derive(Debug, Default)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Info => log::info!("{}", message),
            Level::Warn => log::warn!("{}", message),
            Level::Error => log::error!("{}", message),
        }
    }
}

/// Annotates log lines with the original URL and, on redirect, the current
/// effective URL, exactly once per transition.
pub struct Logger {
    original_url: String,
    sink: Arc<dyn LogSink>,
    prev_log_url: RefCell<Option<String>>,
}

impl Logger {
    pub fn new(original_url: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            original_url: original_url.into(),
            sink,
            prev_log_url: RefCell::new(None),
        }
    }

    /// Convenience constructor forwarding to the `log` crate.
    pub fn with_log_crate(original_url: impl Into<String>) -> Self {
        Self::new(original_url, Arc::new(LogCrateSink))
    }

    fn log(&self, level: Level, url: &str, msg: &str) {
        let mut qmsg = String::new();
        let mut prev = self.prev_log_url.borrow_mut();
        if prev.is_none() {
            qmsg.push_str(&format!(
                "[wget] {}URL is {}\n",
                if url == self.original_url { "" } else { "Original " },
                self.original_url
            ));
            *prev = Some(self.original_url.clone());
        }
        if prev.as_deref() != Some(url) {
            qmsg.push_str(&format!("[wget] Current redirect URL is {}\n", url));
            *prev = Some(url.to_string());
        }
        qmsg.push_str(&format!("[wget] {}\n", msg));
        self.sink.log(level, &qmsg);
    }

    pub fn info(&self, url: &str, msg: &str) {
        self.log(Level::Info, url, msg);
    }

    pub fn warn(&self, url: &str, msg: &str) {
        self.log(Level::Warn, url, msg);
    }

    pub fn error(&self, url: &str, msg: &str) {
        self.log(Level::Error, url, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<(Level, String)>>,
    }

    impl LogSink for RecordingSink {
        fn log(&self, level: Level, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_string()));
        }
    }

    #[test]
    fn announces_original_url_once() {
        let sink = Arc::new(RecordingSink::default());
        let logger = Logger::new("http://a/x", sink.clone());
        logger.info("http://a/x", "first");
        logger.info("http://a/x", "second");
        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].1.contains("URL is http://a/x"));
        assert!(!lines[1].1.contains("URL is"));
    }

    #[test]
    fn announces_redirect_transition() {
        let sink = Arc::new(RecordingSink::default());
        let logger = Logger::new("http://a/x", sink.clone());
        logger.info("http://a/x", "first");
        logger.info("http://b/y", "after redirect");
        let lines = sink.lines.lock().unwrap();
        assert!(lines[1].1.contains("Current redirect URL is http://b/y"));
    }
}
