//! End-to-end sync through real git repositories and a bare remote.

use std::path::Path;

use bsync_core::artifact::{Addr, ArtifactKind, Comment, FunctionHeader, Struct, StructMember, TypeRef};
use bsync_core::config::EffectiveConfig;
use bsync_core::store::branch_name;
use bsync_core::transport::{BranchRelation, GitTransport};
use bsync_core::{ErrorCode, Outcome, Scope, SyncClient};
use git2::Repository;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Repository::init_bare(dir.path().join("remote.git")).unwrap();
        Self { dir }
    }

    fn url(&self) -> String {
        self.dir.path().join("remote.git").to_string_lossy().into_owned()
    }

    /// A fresh workspace clone named `name`, opened as `user`.
    fn client(&self, name: &str, user: &str) -> SyncClient {
        let workspace = self.dir.path().join(name);
        let url = self.url();
        GitTransport::init(&workspace, Some(("origin", url.as_str()))).unwrap();
        let mut config = EffectiveConfig::new(&workspace, user);
        config.lock_timeout_secs = 0;
        SyncClient::open(&config).unwrap()
    }

    fn remote_tip(&self, user: &str) -> Option<git2::Oid> {
        let repo = Repository::open_bare(self.dir.path().join("remote.git")).unwrap();
        repo.refname_to_id(&format!("refs/heads/{}", branch_name(user))).ok()
    }
}

fn packet() -> Struct {
    Struct::new("Packet", 8)
        .with_member(StructMember::new(Addr(0), "magic", TypeRef::primitive("u32"), 4))
        .with_member(StructMember::new(Addr(4), "len", TypeRef::primitive("u32"), 4))
}

#[test]
fn edits_travel_between_workspaces() {
    let fx = Fixture::new();
    let alice = fx.client("alice", "alice");
    let bob = fx.client("bob", "bob");

    alice.report_edit(FunctionHeader::new(Addr(0x40_1000), "parse_header").into()).unwrap();
    alice.report_edit(packet().into()).unwrap();
    let pushed = alice.push().unwrap();
    assert!(pushed.published);
    assert_eq!(pushed.committed, 2);
    assert!(fx.remote_tip("alice").is_some());

    let view = bob.pull(&Scope::All).unwrap().view;
    assert_eq!(
        view.get::<FunctionHeader>(&Addr(0x40_1000)).map(|f| f.name.as_str()),
        Some("parse_header")
    );
    let packet = view.get::<Struct>(&"Packet".to_string()).unwrap();
    assert_eq!(packet.member(Addr(4)).map(|m| m.name.as_str()), Some("len"));
    assert_eq!(view.sources.len(), 1);

    let history = bob.store().history("alice", 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].message, "bsync(alice): +2 ~0 -0");
}

#[test]
fn second_client_on_a_workspace_is_locked_out() {
    let fx = Fixture::new();
    let first = fx.client("ws", "alice");
    assert!(first.lock_path().is_some_and(Path::exists));

    let mut config = EffectiveConfig::new(fx.dir.path().join("ws"), "alice");
    config.lock_timeout_secs = 0;
    let err = SyncClient::open(&config).unwrap_err();
    assert_eq!(err.code(), ErrorCode::LockContention);

    drop(first);
    assert!(SyncClient::open(&config).is_ok());
}

#[test]
fn same_user_on_two_machines_reconciles() {
    let fx = Fixture::new();
    let laptop = fx.client("laptop", "alice");
    let desktop = fx.client("desktop", "alice");

    laptop.report_edit(Comment::new(Addr(0x10), "from laptop").into()).unwrap();
    laptop.push().unwrap();
    desktop.report_edit(Comment::new(Addr(0x20), "from desktop").into()).unwrap();
    let report = desktop.push().unwrap();
    assert!(report.attempts >= 2);
    assert!(report.published);
    assert_eq!(desktop.store().relation("alice").unwrap(), BranchRelation::Equal);

    let view = laptop.pull(&Scope::All).unwrap().view;
    assert!(view.get::<Comment>(&Addr(0x10)).is_some());
    assert!(view.get::<Comment>(&Addr(0x20)).is_some());
}

#[test]
fn deletes_propagate_as_tombstones() {
    let fx = Fixture::new();
    let alice = fx.client("alice", "alice");
    let bob = fx.client("bob", "bob");

    alice.report_edit(Comment::new(Addr(0x10), "stale note").into()).unwrap();
    alice.push().unwrap();
    bob.pull(&Scope::All).unwrap();
    bob.report_delete(ArtifactKind::Comment, "0x10").unwrap();
    bob.push().unwrap();

    let view = alice.pull(&Scope::All).unwrap().view;
    assert!(view.get::<Comment>(&Addr(0x10)).is_none());
    let resolution = view.resolution(ArtifactKind::Comment, "0x10").unwrap();
    assert_eq!(resolution.outcome, Outcome::Deleted);
    assert_eq!(resolution.winner.author, "bob");
}
