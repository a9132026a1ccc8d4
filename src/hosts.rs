//! Process-wide registry of condemned (unreachable) origin authorities.
//!
//! Membership is additive and never cleared during a process's lifetime.
//! Exposed here as an injectable, thread-safe handle so multiple concurrent
//! retrievals can share condemnation state, with a process-wide default for
//! callers that don't care to manage one themselves.

use std::collections::HashSet;
use std::sync::{OnceLock, RwLock};

use url::Url;

/// A thread-safe set of condemned `host:port` authorities.
///
/// Once an authority is inserted it remains condemned for the lifetime of
/// the registry; there is no eviction.
#[derive(Debug, Default)]
pub struct HostRegistry {
    condemned: RwLock<HashSet<String>>,
}

impl HostRegistry {
    /// Creates a fresh, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default registry, shared by every call to
    /// [`crate::retrieve`] that does not supply its own.
    pub fn global() -> &'static HostRegistry {
        static GLOBAL: OnceLock<HostRegistry> = OnceLock::new();
        GLOBAL.get_or_init(HostRegistry::new)
    }

    /// Condemns `authority` (a `host:port` string), if not already condemned.
    pub fn condemn(&self, authority: impl Into<String>) {
        let mut set = self.condemned.write().unwrap_or_else(|e| e.into_inner());
        set.insert(authority.into());
    }

    /// Returns true if `authority` has been condemned.
    pub fn is_condemned(&self, authority: &str) -> bool {
        let set = self.condemned.read().unwrap_or_else(|e| e.into_inner());
        set.contains(authority)
    }
}

/// Computes the `"{host}:{port}"` authority key for a URL, filling in the
/// default port (80 for `http`, 443 for `https`) when the URL omits one.
pub fn authority_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    let port = url.port().unwrap_or_else(|| default_port(url.scheme()));
    format!("{}:{}", host, port)
}

/// Computes the authority key from raw parts, as used when the only thing
/// available is a hostname/port pair (e.g. from a transport-level connect
/// failure rather than a parsed `Url`).
pub fn authority_of_parts(scheme: &str, host: &str, port: Option<u16>) -> String {
    let port = port.unwrap_or_else(|| default_port(scheme));
    format!("{}:{}", host, port)
}

fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_defaults_http_port() {
        let url = Url::parse("http://example.com/a").unwrap();
        assert_eq!(authority_of(&url), "example.com:80");
    }

    #[test]
    fn authority_defaults_https_port() {
        let url = Url::parse("https://example.com/a").unwrap();
        assert_eq!(authority_of(&url), "example.com:443");
    }

    #[test]
    fn authority_respects_explicit_port() {
        let url = Url::parse("http://example.com:8080/a").unwrap();
        assert_eq!(authority_of(&url), "example.com:8080");
    }

    #[test]
    fn condemnation_is_additive_and_sticky() {
        let reg = HostRegistry::new();
        assert!(!reg.is_condemned("cf:443"));
        reg.condemn("cf:443");
        assert!(reg.is_condemned("cf:443"));
        // condemning again is a no-op, not an error
        reg.condemn("cf:443");
        assert!(reg.is_condemned("cf:443"));
    }
}
