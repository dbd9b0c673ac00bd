//! Directory listing integration tests

mod common;

use common::{handler_for, sandbox_for, Reply, TestClient};
use sftp_jail::protocol::StatusCode;
use sftp_jail::request_server::READDIR_PAGE;
use std::collections::BTreeSet;

/// A large directory is delivered in READDIR pages, then EOF
#[tokio::test]
async fn test_readdir_pages() {
    let (temp_dir, sandbox) = sandbox_for(&["alice"]);
    let root = temp_dir.path().join("base/alice");
    let total = READDIR_PAGE * 2 + 50;
    for i in 0..total {
        std::fs::write(root.join(format!("file_{:04}", i)), b"x").unwrap();
    }

    let (mut client, _server) = TestClient::spawn(handler_for(&sandbox, "alice")).await;
    let handle = match client.opendir("/").await {
        Reply::Handle(handle) => handle,
        other => panic!("unexpected reply: {:?}", other),
    };

    let mut page_sizes = Vec::new();
    let mut names = BTreeSet::new();
    loop {
        match client.readdir(&handle).await {
            Reply::Name(entries) => {
                page_sizes.push(entries.len());
                for entry in entries {
                    assert!(entry.longname.ends_with(&entry.filename));
                    names.insert(entry.filename);
                }
            }
            reply => {
                assert_eq!(reply.status_code(), Some(StatusCode::Eof));
                break;
            }
        }
    }

    assert_eq!(page_sizes, vec![READDIR_PAGE, READDIR_PAGE, 50]);
    assert_eq!(names.len(), total);

    // drained handles keep answering EOF
    let again = client.readdir(&handle).await;
    assert_eq!(again.status_code(), Some(StatusCode::Eof));
}

/// READDIR returns entries sorted by name, whatever order they were created in
#[tokio::test]
async fn test_readdir_sorted_by_name() {
    let (temp_dir, sandbox) = sandbox_for(&["alice"]);
    let root = temp_dir.path().join("base/alice");
    for name in ["zeta.txt", "mid.txt", "up.bin", "alpha.txt"] {
        std::fs::write(root.join(name), name).unwrap();
    }
    std::fs::create_dir(root.join("docs")).unwrap();

    let (mut client, _server) = TestClient::spawn(handler_for(&sandbox, "alice")).await;
    let names = client.list_dir("/").await;
    assert_eq!(names, ["alpha.txt", "docs", "mid.txt", "up.bin", "zeta.txt"]);
}

/// Entries created after OPENDIR are not in that listing, only in the next one
#[tokio::test]
async fn test_listing_is_a_snapshot() {
    let (temp_dir, sandbox) = sandbox_for(&["alice"]);
    let root = temp_dir.path().join("base/alice");
    std::fs::write(root.join("before.txt"), b"1").unwrap();

    let (mut client, _server) = TestClient::spawn(handler_for(&sandbox, "alice")).await;
    let handle = match client.opendir("/").await {
        Reply::Handle(handle) => handle,
        other => panic!("unexpected reply: {:?}", other),
    };

    std::fs::write(root.join("after.txt"), b"2").unwrap();

    let names: Vec<String> = match client.readdir(&handle).await {
        Reply::Name(entries) => entries.into_iter().map(|e| e.filename).collect(),
        other => panic!("unexpected reply: {:?}", other),
    };
    assert_eq!(names, vec!["before.txt".to_string()]);
    assert!(client.close(&handle).await.is_ok());

    let mut fresh = client.list_dir("/").await;
    fresh.sort();
    assert_eq!(fresh, vec!["after.txt".to_string(), "before.txt".to_string()]);
}

/// Empty directories answer EOF on the first READDIR
#[tokio::test]
async fn test_empty_directory() {
    let (_temp_dir, sandbox) = sandbox_for(&["alice"]);
    let (mut client, _server) = TestClient::spawn(handler_for(&sandbox, "alice")).await;
    assert!(client.list_dir("/").await.is_empty());
}

/// Subdirectories show up with a directory mode and can be listed
#[tokio::test]
async fn test_nested_directories() {
    let (temp_dir, sandbox) = sandbox_for(&["alice"]);
    let root = temp_dir.path().join("base/alice");
    std::fs::create_dir_all(root.join("docs/2024")).unwrap();
    std::fs::write(root.join("docs/2024/report.txt"), b"q4").unwrap();

    let (mut client, _server) = TestClient::spawn(handler_for(&sandbox, "alice")).await;

    let handle = match client.opendir("/").await {
        Reply::Handle(handle) => handle,
        other => panic!("unexpected reply: {:?}", other),
    };
    match client.readdir(&handle).await {
        Reply::Name(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].filename, "docs");
            assert!(entries[0].attrs.is_dir());
            assert!(entries[0].longname.starts_with('d'));
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    assert_eq!(client.list_dir("/docs/2024").await, vec!["report.txt".to_string()]);
    assert_eq!(
        client.download("docs/2024/../2024/./report.txt").await,
        b"q4"
    );
}

/// OPENDIR on a missing directory fails without closing the channel
#[tokio::test]
async fn test_opendir_missing() {
    let (_temp_dir, sandbox) = sandbox_for(&["alice"]);
    let (mut client, _server) = TestClient::spawn(handler_for(&sandbox, "alice")).await;

    let reply = client.opendir("/missing").await;
    assert_eq!(reply.status_code(), Some(StatusCode::NoSuchFile));
    assert!(client.list_dir("/").await.is_empty());
}

/// REALPATH is lexical and rooted at the sandbox
#[tokio::test]
async fn test_realpath() {
    let (_temp_dir, sandbox) = sandbox_for(&["alice"]);
    let (mut client, _server) = TestClient::spawn(handler_for(&sandbox, "alice")).await;

    for (input, expected) in [
        (".", "/"),
        ("", "/"),
        ("/a/b/../c", "/a/c"),
        ("../../../etc", "/etc"),
        ("does/not/exist", "/does/not/exist"),
    ] {
        match client.realpath(input).await {
            Reply::Name(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].filename, expected, "realpath({:?})", input);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
