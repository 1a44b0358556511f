//! Failure paths: unreachable or slow remotes, lost commit races, busy
//! clients, corrupt records on someone else's branch.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bsync_core::artifact::{Addr, Comment, FunctionHeader, LastChange};
use bsync_core::client::ClientState;
use bsync_core::codec::encode_snapshot;
use bsync_core::snapshot::Snapshot;
use bsync_core::store::branch_name;
use bsync_core::transport::{
    BranchRelation, CommitRequest, MemoryRemote, MemoryTransport, TimeoutTransport, Transport,
};
use bsync_core::{ErrorCode, Scope, SyncClient, SyncError};

fn connected(user: &str, remote: &MemoryRemote) -> (SyncClient, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::connected(remote));
    let client = SyncClient::new(user, Arc::clone(&transport) as Arc<dyn Transport>);
    (client, transport)
}

fn comment(addr: u64, text: &str) -> bsync_core::artifact::AnyArtifact {
    Comment::new(Addr(addr), text).into()
}

#[test]
fn offline_pull_serves_last_view_marked_stale() {
    let remote = MemoryRemote::new();
    let (alice, _) = connected("alice", &remote);
    let (bob, _) = connected("bob", &remote);
    bob.report_edit(comment(0x10, "from bob")).unwrap();
    bob.push().unwrap();

    let fresh = alice.pull(&Scope::All).unwrap();
    assert!(!fresh.stale);

    remote.set_available(false);
    let report = alice.pull(&Scope::All).unwrap();
    assert!(report.stale);
    assert!(report.view.stale);
    assert_eq!(report.view.artifacts, fresh.view.artifacts);
}

#[test]
fn offline_first_pull_merges_local_state() {
    let remote = MemoryRemote::new();
    remote.set_available(false);
    let (alice, _) = connected("alice", &remote);
    alice.report_edit(comment(0x10, "draft")).unwrap();

    let report = alice.pull(&Scope::All).unwrap();
    assert!(report.stale);
    assert_eq!(report.view.pending_edits, 1);
    assert!(report.view.get::<Comment>(&Addr(0x10)).is_some());
}

#[test]
fn offline_push_commits_locally_and_publishes_later() {
    let remote = MemoryRemote::new();
    let (alice, _) = connected("alice", &remote);
    remote.set_available(false);

    alice.report_edit(comment(0x10, "offline note")).unwrap();
    let report = alice.push().unwrap();
    assert!(report.version.is_some());
    assert!(!report.published);
    assert!(!alice.has_pending());
    assert!(remote.tip(&branch_name("alice")).is_none());
    assert_eq!(alice.status().unwrap().branch, BranchRelation::LocalOnly);

    remote.set_available(true);
    let report = alice.push().unwrap();
    assert_eq!(report.committed, 0);
    assert!(report.published);
    assert!(remote.tip(&branch_name("alice")).is_some());
}

#[test]
fn lost_commit_races_are_retried() {
    let remote = MemoryRemote::new();
    let (alice, transport) = connected("alice", &remote);
    alice.report_edit(comment(0x10, "note")).unwrap();

    transport.force_conflicts(1);
    let report = alice.push().unwrap();
    assert_eq!(report.attempts, 2);
    assert_eq!(report.committed, 1);
    assert!(report.published);
}

#[test]
fn push_gives_up_and_keeps_edits_pending() {
    let remote = MemoryRemote::new();
    let (alice, transport) = connected("alice", &remote);
    let alice = alice.with_push_attempts(3);
    alice.report_edit(comment(0x10, "note")).unwrap();

    transport.force_conflicts(10);
    let err = alice.push().unwrap_err();
    assert!(matches!(err, SyncError::PushFailed { attempts: 3, .. }));
    assert_eq!(err.code(), ErrorCode::PushFailed);
    assert!(alice.has_pending());

    transport.force_conflicts(0);
    let report = alice.push().unwrap();
    assert_eq!(report.committed, 1);
    assert!(!alice.has_pending());
}

#[test]
fn second_operation_during_slow_pull_is_busy() {
    let remote = MemoryRemote::new();
    let (alice, _) = connected("alice", &remote);
    let alice = Arc::new(alice);
    remote.set_delay(Duration::from_millis(300));

    let puller = {
        let alice = Arc::clone(&alice);
        thread::spawn(move || alice.pull(&Scope::All))
    };
    let deadline = Instant::now() + Duration::from_secs(2);
    while alice.state() == ClientState::Idle && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }

    let err = alice.push().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Busy);
    assert!(err.is_transient());
    assert!(puller.join().unwrap().is_ok());
    assert_eq!(alice.state(), ClientState::Idle);
}

#[test]
fn slow_remote_times_out_as_unavailable() {
    let remote = MemoryRemote::new();
    let inner = Arc::new(MemoryTransport::connected(&remote));
    let transport = Arc::new(TimeoutTransport::new(inner, Duration::from_millis(50)));
    let alice = SyncClient::new("alice", transport);
    remote.set_delay(Duration::from_millis(400));

    let pulled = alice.pull(&Scope::All).unwrap();
    assert!(pulled.stale);

    alice.report_edit(FunctionHeader::new(Addr(0x40_1000), "main").into()).unwrap();
    let pushed = alice.push().unwrap();
    let version = pushed.version.clone().unwrap();
    assert!(!pushed.published);

    remote.set_delay(Duration::ZERO);
    alice.push().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while remote.tip(&branch_name("alice")).as_ref() != Some(&version) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(remote.tip(&branch_name("alice")), Some(version));
}

#[test]
fn corrupt_records_are_skipped_and_reported() {
    let remote = MemoryRemote::new();
    let mallory = MemoryTransport::connected(&remote);
    let mut snapshot = Snapshot::new("mallory");
    snapshot
        .artifacts
        .put(Comment::new(Addr(0x10), "fine"), LastChange::new("mallory", 10));
    snapshot
        .artifacts
        .put(Comment::new(Addr(0x20), "broken"), LastChange::new("mallory", 10));
    let mut tree = encode_snapshot(&snapshot).unwrap();
    tree.insert(
        "comments.toml".to_string(),
        b"[\"0x10\"]\ntext = \"fine\"\n\n[\"0x20\"]\ndecompiled = true\n".to_vec(),
    );
    let branch = branch_name("mallory");
    mallory
        .commit(CommitRequest {
            branch: branch.clone(),
            parents: Vec::new(),
            expected: None,
            tree,
            message: "bsync(mallory): +2 ~0 -0".to_string(),
            author: "mallory".to_string(),
        })
        .unwrap();
    mallory.publish(&branch).unwrap();

    let (alice, _) = connected("alice", &remote);
    let view = alice.pull(&Scope::All).unwrap().view;
    assert_eq!(view.get::<Comment>(&Addr(0x10)).map(|c| c.text.as_str()), Some("fine"));
    assert!(view.get::<Comment>(&Addr(0x20)).is_none());
    assert_eq!(view.skipped.len(), 1);
    assert_eq!(view.skipped[0].user, "mallory");
    assert_eq!(view.skipped[0].code, ErrorCode::CorruptArtifact.code());
}
