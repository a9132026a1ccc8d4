//! The outer, bounded retry budget that drives the retrieve loop's
//! give-up/backoff policy.
//!
//! A monotonic count, a hard limit, and a linear-capped sleep between
//! attempts. Distinct from the connection pool adapter's internal
//! transport-level retries (`crate::pool`), which retry within a single
//! `fetch` call before ever consuming a slot here.

use std::thread;
use std::time::Duration;

use crate::error::{Error, MaxRetrySnafu};
use crate::logger::Logger;

/// Retries exhaust after this many slots.
pub const TRY_LIMIT: u32 = 20;
/// The backoff between retries never exceeds this many seconds.
pub const MAX_RETRY_WAIT: u64 = 10;

/// Tracks how many retry slots have been consumed during one retrieval.
///
/// Not reset during a single call to [`crate::retrieve`]; a fresh counter is
/// created per retrieval.
#[derive(Debug, Clone, Copy)]
pub struct RetryCounter {
    count: u32,
}

impl RetryCounter {
    pub fn new() -> Self {
        Self { count: 0 }
    }

    /// Whether another attempt is still within budget.
    pub fn should_retry(&self) -> bool {
        self.count < TRY_LIMIT
    }

    /// Consumes one retry slot, sleeping before returning if budget remains.
    ///
    /// `bytes_read` and `restval` determine whether the consumed attempt is
    /// logged as "incomplete" (some progress was made) or "failed" (none
    /// was). Returns `Err(Error::MaxRetry)` once the budget is exhausted;
    /// the caller must propagate that error without sleeping again.
    pub fn increment(
        &mut self,
        logger: &Logger,
        url: &str,
        bytes_read: u64,
        restval: u64,
        cause: &str,
    ) -> Result<(), Error> {
        self.count += 1;
        let status = if bytes_read > restval {
            "incomplete"
        } else {
            "failed"
        };
        let msg = format!("because of {} retrieval: {}", status, cause);

        if !self.should_retry() {
            logger.warn(url, &format!("Gave up {}", msg));
            return Err(MaxRetrySnafu {
                url: url.to_string(),
                tries: TRY_LIMIT,
                cause: cause.to_string(),
            }
            .build());
        }

        logger.info(
            url,
            &format!("Retrying ({}/{}) {}", self.count, TRY_LIMIT, msg),
        );
        thread::sleep(Duration::from_secs(u64::from(self.count).min(MAX_RETRY_WAIT)));
        Ok(())
    }
}

impl Default for RetryCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_retry_until_limit() {
        let mut counter = RetryCounter::new();
        counter.count = TRY_LIMIT - 1;
        assert!(counter.should_retry());
        counter.count = TRY_LIMIT;
        assert!(!counter.should_retry());
    }
}
