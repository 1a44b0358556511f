//! Multi-user convergence over a shared in-memory remote.

use std::sync::Arc;

use bsync_core::artifact::{
    Addr, ArtifactKind, Comment, Composite, Enum, FunctionHeader, Struct, StructMember, TypeRef,
};
use bsync_core::clock::{LogicalClock, ManualTime};
use bsync_core::transport::{MemoryRemote, MemoryTransport};
use bsync_core::{MergedView, Outcome, Scope, SyncClient};

const FUNC: Addr = Addr(0x40_1000);

fn client(user: &str, remote: &MemoryRemote, start: u64) -> (SyncClient, ManualTime) {
    let (clock, time) = LogicalClock::manual(start);
    let client = SyncClient::new(user, Arc::new(MemoryTransport::connected(remote))).with_clock(clock);
    (client, time)
}

fn pull(client: &SyncClient) -> Arc<MergedView> {
    client.pull(&Scope::All).unwrap().view
}

fn packet(size: u64, members: &[(u64, &str)]) -> Struct {
    members.iter().fold(Struct::new("Packet", size), |s, (offset, name)| {
        s.with_member(StructMember::new(Addr(*offset), *name, TypeRef::primitive("u32"), 4))
    })
}

#[test]
fn later_rename_wins_by_recency() {
    let remote = MemoryRemote::new();
    let (alice, _) = client("alice", &remote, 100);
    let (bob, _) = client("bob", &remote, 150);

    alice.report_edit(FunctionHeader::new(FUNC, "parse_header").into()).unwrap();
    alice.push().unwrap();
    bob.report_edit(FunctionHeader::new(FUNC, "parse_hdr").into()).unwrap();
    bob.push().unwrap();

    for view in [pull(&alice), pull(&bob)] {
        assert_eq!(view.get::<FunctionHeader>(&FUNC).map(|f| f.name.as_str()), Some("parse_hdr"));
        let resolution = view.resolution(ArtifactKind::Function, "0x401000").unwrap();
        assert_eq!(resolution.outcome, Outcome::ResolvedByRecency);
        assert_eq!(resolution.winner.author, "bob");
        assert_eq!(resolution.overridden.len(), 1);
        assert_eq!(resolution.overridden[0].author, "alice");
    }
}

#[test]
fn equal_timestamps_tie_break_on_author() {
    let remote = MemoryRemote::new();
    let (alice, _) = client("alice", &remote, 500);
    let (bob, _) = client("bob", &remote, 500);

    alice.report_edit(Comment::new(FUNC, "entry point").into()).unwrap();
    bob.report_edit(Comment::new(FUNC, "main loop").into()).unwrap();
    alice.push().unwrap();
    bob.push().unwrap();

    let view = pull(&alice);
    assert_eq!(view.get::<Comment>(&FUNC).map(|c| c.text.as_str()), Some("main loop"));
    let ties: Vec<_> = view.tie_breaks().collect();
    assert_eq!(ties.len(), 1);
    assert!(ties[0].ambiguous);
    assert_eq!(pull(&bob).artifacts, view.artifacts);
}

#[test]
fn newer_delete_removes_struct_with_older_member_edits() {
    let remote = MemoryRemote::new();
    let (alice, _) = client("alice", &remote, 190);
    let (bob, _) = client("bob", &remote, 200);

    alice.report_edit(packet(16, &[(0, "magic"), (4, "len")]).into()).unwrap();
    alice.push().unwrap();
    bob.report_delete(ArtifactKind::Struct, "Packet").unwrap();
    bob.push().unwrap();

    for view in [pull(&alice), pull(&bob)] {
        assert!(view.get::<Struct>(&"Packet".to_string()).is_none());
        let resolution = view.resolution(ArtifactKind::Struct, "Packet").unwrap();
        assert_eq!(resolution.outcome, Outcome::Deleted);
        assert!(view.resolution(ArtifactKind::StructMember, "Packet.0x0").is_none());
    }
}

#[test]
fn members_edited_by_different_users_both_survive() {
    let remote = MemoryRemote::new();
    let (alice, alice_time) = client("alice", &remote, 100);
    let (bob, bob_time) = client("bob", &remote, 100);

    alice.report_edit(packet(16, &[(0, "magic"), (4, "len")]).into()).unwrap();
    alice.push().unwrap();
    pull(&bob);

    alice_time.set(300);
    bob_time.set(400);
    alice.report_edit(packet(16, &[(0, "signature"), (4, "len")]).into()).unwrap();
    bob.report_edit(packet(16, &[(0, "magic"), (4, "length")]).into()).unwrap();
    alice.push().unwrap();
    bob.push().unwrap();

    let view = pull(&alice);
    let merged = view.get::<Struct>(&"Packet".to_string()).unwrap();
    let names: Vec<_> = merged
        .members
        .values()
        .filter_map(|m| m.value.as_ref().map(|v| v.name.as_str()))
        .collect();
    assert_eq!(names, ["signature", "length"]);
    assert_eq!(pull(&bob).artifacts, view.artifacts);
}

#[test]
fn member_added_without_a_pull_keeps_a_concurrent_resize() {
    let remote = MemoryRemote::new();
    let (alice, alice_time) = client("alice", &remote, 100);
    let (bob, bob_time) = client("bob", &remote, 100);

    alice.report_edit(packet(16, &[(0, "magic"), (4, "len")]).into()).unwrap();
    alice.push().unwrap();
    pull(&bob);

    alice_time.set(300);
    alice.report_edit(packet(32, &[(0, "magic"), (4, "len")]).into()).unwrap();
    alice.push().unwrap();

    // bob has not seen the resize and still reports the old size.
    bob_time.set(400);
    bob.report_edit(packet(16, &[(0, "magic"), (4, "len"), (8, "crc")]).into()).unwrap();
    bob.push().unwrap();

    for view in [pull(&alice), pull(&bob)] {
        let merged = view.get::<Struct>(&"Packet".to_string()).unwrap();
        assert_eq!(merged.size, 32);
        assert_eq!(merged.live_members().count(), 3);
        assert_eq!(merged.member(Addr(8)).map(|m| m.name.as_str()), Some("crc"));
        let header = view.resolution(ArtifactKind::Struct, "Packet").unwrap();
        assert_eq!(header.winner.author, "alice");
    }
}

#[test]
fn three_clients_converge_after_interleaved_pushes() {
    let remote = MemoryRemote::new();
    let clients: Vec<_> = ["amy", "bob", "cat"]
        .into_iter()
        .zip(0_u64..)
        .map(|(user, i)| client(user, &remote, 1_000 + i))
        .collect();

    for round in 0..4_u32 {
        for (i, (c, time)) in (0_u32..).zip(&clients) {
            time.advance(10);
            let addr = Addr(0x1000 + u64::from((round + i) % 3) * 0x10);
            c.report_edit(Comment::new(addr, format!("{} round {round}", c.user())).into())
                .unwrap();
            if (round + i) % 2 == 0 {
                c.report_edit(Enum::new("Color").with_member("RED", i64::from(round)).into())
                    .unwrap();
            }
            c.push().unwrap();
            if i == 1 {
                pull(c);
            }
        }
    }

    let views: Vec<_> = clients.iter().map(|(c, _)| pull(c)).collect();
    for view in &views[1..] {
        assert_eq!(view.artifacts, views[0].artifacts);
        assert_eq!(view.log, views[0].log);
    }
    assert_eq!(views[0].sources.len(), 3);
}

#[test]
fn scoped_pull_ignores_other_users() {
    let remote = MemoryRemote::new();
    let (alice, _) = client("alice", &remote, 100);
    let (bob, _) = client("bob", &remote, 200);
    let (cat, _) = client("cat", &remote, 300);

    bob.report_edit(Comment::new(Addr(0x10), "from bob").into()).unwrap();
    bob.push().unwrap();
    cat.report_edit(Comment::new(Addr(0x20), "from cat").into()).unwrap();
    cat.push().unwrap();

    let view = alice.pull(&Scope::users(["bob"])).unwrap().view;
    assert!(view.get::<Comment>(&Addr(0x10)).is_some());
    assert!(view.get::<Comment>(&Addr(0x20)).is_none());
    assert!(view.sources.contains_key("bob"));
    assert!(!view.sources.contains_key("cat"));
}

#[test]
fn merged_view_serializes_for_adapters() {
    let remote = MemoryRemote::new();
    let (alice, _) = client("alice", &remote, 100);
    alice.report_edit(FunctionHeader::new(FUNC, "main").into()).unwrap();
    alice.push().unwrap();

    let view = pull(&alice);
    let json = serde_json::to_value(&*view).unwrap();
    assert_eq!(json["artifacts"]["functions"]["0x401000"]["value"]["name"], "main");
    assert_eq!(json["log"][0]["outcome"], "resolved");
    assert_eq!(json["stale"], false);
}
