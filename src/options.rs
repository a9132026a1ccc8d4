//! Injected capabilities and options treated as external collaborators:
//! DNS-availability probing, the "no internet" blocking signal, and the
//! option surface threaded through one retrieval.
//!
//! Default implementations are provided so `Retriever::new` works out of
//! the box; callers that want the crawler's own DNS/connectivity machinery
//! can supply their own via the trait objects.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Options recognized by one retrieval.
#[derive(Clone, Debug)]
pub struct RetrieveOptions {
    /// When false, disables certificate validation.
    pub ssl_verify: bool,
    /// Overrides the default `User-Agent` header.
    pub user_agent: Option<String>,
    /// When true, the remote `Last-Modified` (or caller-supplied
    /// `post_timestamp`) is applied to the final file.
    pub use_server_timestamps: bool,
    /// Connect + read timeout for one request (default: 90s).
    pub timeout: Duration,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            ssl_verify: true,
            user_agent: None,
            use_server_timestamps: false,
            timeout: Duration::from_secs(90),
        }
    }
}

/// Distinguishes "no internet at all" from "this one host is down": a
/// DNS-unavailable condition is not an error at all, and the client spins
/// on the no-internet signal until connectivity returns.
pub trait DnsProbe: Send + Sync {
    fn is_dns_working(&self, timeout: Duration) -> bool;
}

/// Blocks the calling thread until connectivity is believed restored.
pub trait NoInternetSignal: Send + Sync {
    fn wait_for_connectivity(&self);
}

/// Best-effort default: attempts a TCP connect to a small set of
/// well-known resolvers' DNS ports. Reasonable and replaceable; callers
/// with a more authoritative connectivity signal should supply their own.
#[derive(Debug, Default)]
pub struct TcpDnsProbe;

const PROBE_TARGETS: [&str; 2] = ["1.1.1.1:53", "8.8.8.8:53"];

impl DnsProbe for TcpDnsProbe {
    fn is_dns_working(&self, timeout: Duration) -> bool {
        for target in PROBE_TARGETS {
            if let Ok(mut addrs) = target.to_socket_addrs() {
                if let Some(addr) = addrs.next() {
                    if TcpStream::connect_timeout(&addr, timeout).is_ok() {
                        return true;
                    }
                }
            }
        }
        false
    }
}

/// Polls a [`DnsProbe`] in a capped sleep loop until it reports success.
pub struct PollingNoInternetSignal {
    probe: Arc<dyn DnsProbe>,
    poll_interval: Duration,
    max_wait: Duration,
}

impl PollingNoInternetSignal {
    pub fn new(probe: Arc<dyn DnsProbe>) -> Self {
        Self {
            probe,
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(300),
        }
    }
}

impl NoInternetSignal for PollingNoInternetSignal {
    fn wait_for_connectivity(&self) {
        let mut waited = Duration::ZERO;
        while !self.probe.is_dns_working(Duration::from_secs(5)) {
            if waited >= self.max_wait {
                return;
            }
            std::thread::sleep(self.poll_interval);
            waited += self.poll_interval;
        }
    }
}

/// A [`DnsProbe`] that always reports connectivity -- useful for tests and
/// for callers that have their own external connectivity guarantee and
/// don't want the default TCP probe making network calls.
#[derive(Debug, Default)]
pub struct AlwaysOnline;

impl DnsProbe for AlwaysOnline {
    fn is_dns_working(&self, _timeout: Duration) -> bool {
        true
    }
}

impl NoInternetSignal for AlwaysOnline {
    fn wait_for_connectivity(&self) {}
}

/// A [`DnsProbe`]/[`NoInternetSignal`] pair that can be flipped for tests
/// exercising the "spin until connectivity returns" path without a real
/// network dependency.
#[derive(Debug, Default)]
pub struct Switchable {
    online: AtomicBool,
}

impl Switchable {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl DnsProbe for Switchable {
    fn is_dns_working(&self, _timeout: Duration) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

impl NoInternetSignal for Switchable {
    fn wait_for_connectivity(&self) {
        while !self.online.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
