//! End-to-end coverage of `Retriever::retrieve` against a mock origin,
//! exercising the scenarios that a sequence of complete mocked responses can
//! express: a plain fetch, a `204`, a redirect followed to completion, and
//! Cloudflare-origin condemnation plus the fast-fail it causes on a second
//! call. Mid-body connection drops, range-resumption restarts, and genuine
//! multi-try backoff timing are covered instead by the colocated unit tests
//! in `src/response.rs` and `src/retry.rs`, since `mockito` only ever serves
//! complete responses per match and can't simulate a body-read fault.

use std::fs;
use std::sync::Arc;

use resumable_fetch::{HostRegistry, Retriever, RetrieveOptions};

#[test]
fn fetches_a_small_file() {
    let mut server = mockito::Server::new();
    let _m = server
        .mock("GET", "/a.bin")
        .with_status(200)
        .with_header("content-length", "5")
        .with_body("hello")
        .create();

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("a.bin");

    let retriever = Retriever::new(RetrieveOptions::default()).unwrap();
    let hstat = retriever
        .retrieve(&format!("{}/a.bin", server.url()), &dest, None, None)
        .unwrap();

    assert_eq!(hstat.bytes_read, 5);
    assert_eq!(fs::read(&dest).unwrap(), b"hello");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }
}

#[test]
fn no_content_writes_an_empty_file() {
    let mut server = mockito::Server::new();
    let _m = server.mock("GET", "/empty").with_status(204).create();

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("empty.bin");

    let retriever = Retriever::new(RetrieveOptions::default()).unwrap();
    let hstat = retriever
        .retrieve(&format!("{}/empty", server.url()), &dest, None, None)
        .unwrap();

    assert_eq!(hstat.bytes_read, 0);
    assert_eq!(fs::read(&dest).unwrap(), Vec::<u8>::new());
}

#[test]
fn follows_a_redirect_to_completion() {
    let mut server = mockito::Server::new();
    let _redirect = server
        .mock("GET", "/old.bin")
        .with_status(302)
        .with_header("location", &format!("{}/new.bin", server.url()))
        .create();
    let _target = server
        .mock("GET", "/new.bin")
        .with_status(200)
        .with_header("content-length", "5")
        .with_body("hello")
        .create();

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("redirected.bin");

    let retriever = Retriever::new(RetrieveOptions::default()).unwrap();
    let hstat = retriever
        .retrieve(&format!("{}/old.bin", server.url()), &dest, None, None)
        .unwrap();

    assert_eq!(hstat.bytes_read, 5);
    assert_eq!(fs::read(&dest).unwrap(), b"hello");
    assert!(hstat.current_url.unwrap().ends_with("/new.bin"));
}

#[test]
fn cloudflare_origin_down_condemns_host_and_fails_fast_next_time() {
    let mut server = mockito::Server::new();
    let _m = server
        .mock("GET", "/down.bin")
        .with_status(523)
        .with_header("server", "cloudflare")
        .create();

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("down.bin");
    let hosts = Arc::new(HostRegistry::new());

    let retriever = Retriever::with_capabilities(
        RetrieveOptions::default(),
        Arc::clone(&hosts),
        Arc::new(resumable_fetch::AlwaysOnline),
        Arc::new(resumable_fetch::LogCrateSink),
    )
    .unwrap();

    let url = format!("{}/down.bin", server.url());
    let err = retriever.retrieve(&url, &dest, None, None).unwrap_err();
    assert!(matches!(err, resumable_fetch::Error::UnreachableHost { .. }));

    // The second call must not hit the mock server at all: the host is
    // condemned up front, before any connection is attempted.
    let err2 = retriever.retrieve(&url, &dest, None, None).unwrap_err();
    assert!(matches!(err2, resumable_fetch::Error::UnreachableHost { .. }));
}

#[test]
fn non_http_scheme_is_rejected_without_any_network_io() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("f.bin");

    let retriever = Retriever::new(RetrieveOptions::default()).unwrap();
    let err = retriever
        .retrieve("ftp://example.com/f.bin", &dest, None, None)
        .unwrap_err();
    assert!(matches!(err, resumable_fetch::Error::BadProtocol { .. }));
}
