//! Path confinement tests
//!
//! Every path a client sends must stay under `<base>/<username>`, whatever it
//! contains.

mod common;

use common::{handler_for, sandbox_for, Reply, TestClient};
use sftp_jail::protocol::{OpenFlags, StatusCode};
use std::path::Path;

const TRAVERSALS: &[&str] = &[
    "../secret.txt",
    "../../secret.txt",
    "/../secret.txt",
    "/../../../../../../secret.txt",
    "a/../../secret.txt",
    "./../secret.txt",
    "..//..//secret.txt",
    "../bob/private.txt",
    "/../bob/private.txt",
    "../../base/bob/private.txt",
];

fn plant_targets(base: &Path) {
    std::fs::write(base.join("secret.txt"), b"base secret").unwrap();
    std::fs::write(base.parent().unwrap().join("secret.txt"), b"outer secret").unwrap();
    std::fs::write(base.join("bob/private.txt"), b"bob only").unwrap();
}

/// Traversal paths never read files outside the caller's root
#[tokio::test]
async fn test_traversal_reads_stay_inside() {
    let (temp_dir, sandbox) = sandbox_for(&["alice", "bob"]);
    let base = temp_dir.path().join("base");
    plant_targets(&base);

    let (mut client, _server) = TestClient::spawn(handler_for(&sandbox, "alice")).await;
    for path in TRAVERSALS {
        let reply = client.open(path, OpenFlags::READ).await;
        assert_eq!(
            reply.status_code(),
            Some(StatusCode::NoSuchFile),
            "{:?} opened something: {:?}",
            path,
            reply
        );
    }
}

/// Traversal writes land inside the caller's root
#[tokio::test]
async fn test_traversal_writes_stay_inside() {
    let (temp_dir, sandbox) = sandbox_for(&["alice", "bob"]);
    let base = temp_dir.path().join("base");
    plant_targets(&base);

    let (mut client, _server) = TestClient::spawn(handler_for(&sandbox, "alice")).await;
    client.upload("../../secret.txt", b"overwritten?").await;

    // resolves to alice/bob/private.txt, whose parent does not exist
    let reply = client
        .open("../bob/private.txt", OpenFlags::WRITE | OpenFlags::CREAT)
        .await;
    assert_eq!(reply.status_code(), Some(StatusCode::NoSuchFile));

    assert_eq!(std::fs::read(base.join("secret.txt")).unwrap(), b"base secret");
    assert_eq!(
        std::fs::read(temp_dir.path().join("secret.txt")).unwrap(),
        b"outer secret"
    );
    assert_eq!(std::fs::read(base.join("bob/private.txt")).unwrap(), b"bob only");

    assert_eq!(
        std::fs::read(base.join("alice/secret.txt")).unwrap(),
        b"overwritten?"
    );
    assert!(!base.join("alice/bob").exists());
}

/// Traversal removes and listings cannot reach other roots
#[tokio::test]
async fn test_traversal_remove_and_list() {
    let (temp_dir, sandbox) = sandbox_for(&["alice", "bob"]);
    let base = temp_dir.path().join("base");
    plant_targets(&base);

    let (mut client, _server) = TestClient::spawn(handler_for(&sandbox, "alice")).await;
    for path in TRAVERSALS {
        let reply = client.remove(path).await;
        assert_eq!(reply.status_code(), Some(StatusCode::NoSuchFile), "{:?}", path);
    }
    assert!(base.join("bob/private.txt").exists());
    assert!(base.join("secret.txt").exists());

    // "/.." lists alice's own (empty) root, not the base directory
    assert!(client.list_dir("/..").await.is_empty());
    assert!(client.list_dir("../..").await.is_empty());

    let reply = client.stat("../bob").await;
    assert_eq!(reply.status_code(), Some(StatusCode::NoSuchFile));
}

/// Two users with the same relative path see separate files
#[tokio::test]
async fn test_users_are_isolated() {
    let (temp_dir, sandbox) = sandbox_for(&["alice", "bob"]);
    let (mut alice, _a) = TestClient::spawn(handler_for(&sandbox, "alice")).await;
    let (mut bob, _b) = TestClient::spawn(handler_for(&sandbox, "bob")).await;

    alice.upload("/shared-name.txt", b"from alice").await;
    bob.upload("/shared-name.txt", b"from bob").await;

    assert_eq!(alice.download("/shared-name.txt").await, b"from alice");
    assert_eq!(bob.download("/shared-name.txt").await, b"from bob");
    assert_eq!(
        std::fs::read(temp_dir.path().join("base/alice/shared-name.txt")).unwrap(),
        b"from alice"
    );
}

/// NUL bytes are rejected before touching the filesystem
#[tokio::test]
async fn test_nul_in_path() {
    let (_temp_dir, sandbox) = sandbox_for(&["alice"]);
    let (mut client, _server) = TestClient::spawn(handler_for(&sandbox, "alice")).await;

    let reply = client.open("evil\0.txt", OpenFlags::WRITE | OpenFlags::CREAT).await;
    assert_eq!(reply.status_code(), Some(StatusCode::BadMessage));
    match reply {
        Reply::Status { message, .. } => assert_eq!(message, "Invalid path"),
        other => panic!("unexpected reply: {:?}", other),
    }
}
