#![allow(dead_code)]

use std::collections::BTreeMap;

use bsync_core::artifact::{
    Addr, Comment, Enum, EnumMember, FunctionHeader, LastChange, Struct, StructMember, Tracked,
    TypeRef,
};
use bsync_core::snapshot::ArtifactSet;
use proptest::prelude::*;

/// Small timestamp and author spaces so that ties actually happen.
pub fn arb_stamp() -> impl Strategy<Value = LastChange> {
    (1_u64..6, prop::sample::select(vec!["amy", "bob", "cat"]))
        .prop_map(|(ts, author)| LastChange::new(author, ts))
}

pub fn arb_tracked<S>(value: S) -> impl Strategy<Value = Tracked<S::Value>>
where
    S: Strategy,
{
    (arb_stamp(), prop::option::weighted(0.8, value))
        .prop_map(|(last_change, value)| Tracked { last_change, value })
}

fn arb_name() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["main", "parse", "init", "loop"]).prop_map(String::from)
}

pub fn arb_functions() -> impl Strategy<Value = BTreeMap<Addr, Tracked<FunctionHeader>>> {
    prop::collection::btree_map(0_u64..4, arb_tracked(arb_name()), 0..4).prop_map(|m| {
        m.into_iter()
            .map(|(addr, t)| {
                let addr = Addr(0x1000 + addr * 0x10);
                let value = t.value.map(|name| FunctionHeader::new(addr, name));
                (addr, Tracked { last_change: t.last_change, value })
            })
            .collect()
    })
}

pub fn arb_comments() -> impl Strategy<Value = BTreeMap<Addr, Tracked<Comment>>> {
    prop::collection::btree_map(0_u64..4, arb_tracked(arb_name()), 0..4).prop_map(|m| {
        m.into_iter()
            .map(|(addr, t)| {
                let addr = Addr(0x1000 + addr * 0x10);
                let value = t.value.map(|text| Comment::new(addr, text));
                (addr, Tracked { last_change: t.last_change, value })
            })
            .collect()
    })
}

fn arb_struct_members() -> impl Strategy<Value = BTreeMap<Addr, Tracked<StructMember>>> {
    prop::collection::btree_map(0_u64..3, arb_tracked(arb_name()), 0..3).prop_map(|m| {
        m.into_iter()
            .map(|(slot, t)| {
                let offset = Addr(slot * 4);
                let value =
                    t.value.map(|name| StructMember::new(offset, name, TypeRef::primitive("u32"), 4));
                (offset, Tracked { last_change: t.last_change, value })
            })
            .collect()
    })
}

pub fn arb_structs() -> impl Strategy<Value = BTreeMap<String, Tracked<Struct>>> {
    let header = (prop::sample::select(vec![8_u64, 12, 16]), arb_struct_members(), arb_stamp());
    prop::collection::btree_map(
        prop::sample::select(vec!["Packet", "Header"]).prop_map(String::from),
        arb_tracked(header),
        0..3,
    )
    .prop_map(|m| {
        m.into_iter()
            .map(|(name, t)| {
                let value = t.value.map(|(size, members, header_change)| {
                    let mut s = Struct::new(name.clone(), size);
                    s.members = members;
                    s.header_change = header_change;
                    s
                });
                (name, Tracked { last_change: t.last_change, value })
            })
            .collect()
    })
}

pub fn arb_enums() -> impl Strategy<Value = BTreeMap<String, Tracked<Enum>>> {
    let members = (
        prop::collection::btree_map(
            prop::sample::select(vec!["RED", "GREEN"]).prop_map(String::from),
            arb_tracked(0_i64..3),
            0..3,
        ),
        arb_stamp(),
    );
    prop::collection::btree_map(Just("Color".to_string()), arb_tracked(members), 0..2).prop_map(
        |m| {
            m.into_iter()
                .map(|(name, t)| {
                    let value = t.value.map(|(members, header_change)| {
                        let mut e = Enum::new(name.clone());
                        e.header_change = header_change;
                        e.members = members
                            .into_iter()
                            .map(|(k, mt)| {
                                let v = mt.value.map(|n| EnumMember::new(k.clone(), n));
                                (k, Tracked { last_change: mt.last_change, value: v })
                            })
                            .collect();
                        e
                    });
                    (name, Tracked { last_change: t.last_change, value })
                })
                .collect()
        },
    )
}

/// One user's artifact set, restricted to a few kinds with clashing keys.
pub fn arb_set() -> impl Strategy<Value = ArtifactSet> {
    (arb_functions(), arb_comments(), arb_structs(), arb_enums()).prop_map(
        |(functions, comments, structs, enums)| ArtifactSet {
            functions,
            comments,
            structs,
            enums,
            ..ArtifactSet::default()
        },
    )
}
