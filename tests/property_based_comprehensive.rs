//! Property-based accounting invariants
//!
//! Random but well-formed event streams are replayed through a session and
//! the settled call trees are checked for accounting invariants:
//! 1. self + children total == total at every node
//! 2. `called` counts every call event exactly once
//! 3. pause/resume idempotence
//! 4. dump/load round-trips
//! 5. arbitrary (unbalanced) streams never panic
//! 6. self + children total + wait == total across thread switches,
//!    pauses and excluded calls, with self never negative

use callprof::{
    Entity, MethodKey, ProfileConfig, ProfileDump, ProfileEvent, ProfileSession, ThreadContext,
};
use proptest::prelude::*;
use std::collections::BTreeSet;

const MEMBERS: [&str; 5] = ["alpha", "beta", "gamma", "delta", "epsilon"];
const EXCLUDED: &str = "noise";

#[derive(Debug, Clone)]
enum Op {
    Call(usize),
    Return,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..MEMBERS.len()).prop_map(Op::Call),
        2 => Just(Op::Return),
    ]
}

/// Operations on a multi-threaded, pausable session
#[derive(Debug, Clone)]
enum MixedOp {
    Call(usize),
    CallExcluded,
    Return,
    Switch(u64),
    Pause,
    Resume,
}

fn mixed_op_strategy() -> impl Strategy<Value = MixedOp> {
    prop_oneof![
        4 => (0..MEMBERS.len()).prop_map(MixedOp::Call),
        1 => Just(MixedOp::CallExcluded),
        3 => Just(MixedOp::Return),
        2 => (1u64..4).prop_map(MixedOp::Switch),
        1 => Just(MixedOp::Pause),
        1 => Just(MixedOp::Resume),
    ]
}

/// Replay `ops` across threads; stop settles whatever is still open
fn replay_mixed(ops: &[MixedOp], steps: &[u32]) -> ProfileSession {
    let mut session = ProfileSession::new(ProfileConfig::default()).unwrap();
    session
        .exclude_method(&Entity::Plain("P".into()), EXCLUDED)
        .unwrap();
    session.start_at(0.0).unwrap();
    let mut now = 0.0;
    let mut thread = 1;
    for (i, op) in ops.iter().enumerate() {
        now += f64::from(steps[i % steps.len()]);
        let event = match op {
            MixedOp::Call(m) => ProfileEvent::call(Entity::Plain("P".into()), MEMBERS[*m])
                .source("p.rb", 1),
            MixedOp::CallExcluded => ProfileEvent::call(Entity::Plain("P".into()), EXCLUDED),
            MixedOp::Return => ProfileEvent::ret(),
            MixedOp::Switch(to) => {
                thread = *to;
                continue;
            }
            MixedOp::Pause => {
                session.pause_at(now).unwrap();
                continue;
            }
            MixedOp::Resume => {
                session.resume_at(now).unwrap();
                continue;
            }
        };
        session.handle_event(&event.on(thread, 0).at(now)).unwrap();
    }
    session.stop_at(now + 1.0).unwrap();
    session
}

/// Replay `ops` on one context, closing every open frame at the end
fn replay(ops: &[Op], steps: &[u32]) -> (ProfileSession, u64) {
    let mut session = ProfileSession::new(ProfileConfig::default()).unwrap();
    session.start_at(0.0).unwrap();
    let mut now = 0.0;
    let mut depth = 0usize;
    let mut calls = 0u64;
    for (i, op) in ops.iter().enumerate() {
        now += f64::from(steps[i % steps.len()]);
        match op {
            Op::Call(m) => {
                let event = ProfileEvent::call(Entity::Plain("P".into()), MEMBERS[*m])
                    .source("p.rb", 1)
                    .at(now);
                session.handle_event(&event).unwrap();
                depth += 1;
                calls += 1;
            }
            Op::Return if depth > 0 => {
                session.handle_event(&ProfileEvent::ret().at(now)).unwrap();
                depth -= 1;
            }
            Op::Return => {}
        }
    }
    for _ in 0..depth {
        now += 1.0;
        session.handle_event(&ProfileEvent::ret().at(now)).unwrap();
    }
    session.stop_at(now + 1.0).unwrap();
    (session, calls)
}

fn only_context(session: &ProfileSession) -> Option<&ThreadContext> {
    session.threads().next().map(|(_, ctx)| ctx)
}

/// (method, parent method) pairs of every call-tree node
fn edges(ctx: &ThreadContext) -> BTreeSet<(MethodKey, Option<MethodKey>)> {
    let tree = ctx.call_tree();
    tree.walk_all()
        .into_iter()
        .map(|id| {
            let node = &tree[id];
            (node.method_key, node.parent.map(|p| tree[p].method_key))
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_self_plus_children_equals_total(
        ops in prop::collection::vec(op_strategy(), 1..60),
        steps in prop::collection::vec(1u32..50, 1..10),
    ) {
        let (session, _) = replay(&ops, &steps);
        if let Some(ctx) = only_context(&session) {
            let tree = ctx.call_tree();
            for id in tree.walk_all() {
                let node = &tree[id];
                let children: f64 = node
                    .children()
                    .iter()
                    .map(|&c| tree[c].measurement.total_time)
                    .sum();
                let lhs = node.measurement.self_time + children;
                prop_assert!((lhs - node.measurement.total_time).abs() < 1e-6,
                    "self {} + children {} != total {}",
                    node.measurement.self_time, children, node.measurement.total_time);
                prop_assert_eq!(node.visits(), 0);
                prop_assert!(node.measurement.self_time >= 0.0);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_called_counts_every_call_once(
        ops in prop::collection::vec(op_strategy(), 1..60),
        steps in prop::collection::vec(1u32..50, 1..10),
    ) {
        let (session, calls) = replay(&ops, &steps);
        let (node_calls, method_calls) = match only_context(&session) {
            Some(ctx) => (
                ctx.call_tree()
                    .walk_all()
                    .into_iter()
                    .map(|id| ctx.call_tree()[id].measurement.called)
                    .sum::<u64>(),
                ctx.methods()
                    .iter()
                    .map(|(_, r)| r.measurement.called)
                    .sum::<u64>(),
            ),
            None => (0, 0),
        };
        prop_assert_eq!(node_calls, calls);
        prop_assert_eq!(method_calls, calls);
        if let Some(ctx) = only_context(&session) {
            for id in ctx.call_tree().walk_all() {
                prop_assert!(ctx.call_tree()[id].measurement.called >= 1);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_double_pause_equals_single_pause(
        pause_at in 1u32..40,
        extra in 0u32..10,
        length in 1u32..40,
    ) {
        let run = |double: bool| {
            let mut s = ProfileSession::new(ProfileConfig::default()).unwrap();
            s.start_at(0.0).unwrap();
            s.handle_event(&ProfileEvent::call(Entity::Plain("P".into()), "work").at(0.0)).unwrap();
            let paused = f64::from(pause_at);
            s.pause_at(paused).unwrap();
            if double {
                s.pause_at(paused + f64::from(extra)).unwrap();
            }
            let resumed = paused + f64::from(extra) + f64::from(length);
            s.resume_at(resumed).unwrap();
            if double {
                s.resume_at(resumed + 1.0).unwrap();
            }
            s.handle_event(&ProfileEvent::ret().at(resumed + 5.0)).unwrap();
            s.stop_at(resumed + 5.0).unwrap();
            only_context(&s).map(|ctx| ctx.total_time()).unwrap_or_default()
        };
        prop_assert_eq!(run(false), run(true));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_dump_round_trip_preserves_shape_and_sums(
        ops in prop::collection::vec(op_strategy(), 1..40),
        steps in prop::collection::vec(1u32..50, 1..10),
        msgpack in any::<bool>(),
    ) {
        let (session, _) = replay(&ops, &steps);
        let dump = session.dump();
        let restored = if msgpack {
            ProfileDump::from_msgpack(&dump.to_msgpack().unwrap()).unwrap()
        } else {
            ProfileDump::from_json(&dump.to_json().unwrap()).unwrap()
        };
        let loaded = ProfileSession::from_dump(restored).unwrap();

        match (only_context(&session), only_context(&loaded)) {
            (Some(before), Some(after)) => {
                prop_assert_eq!(edges(before), edges(after));
                prop_assert_eq!(before.total_time(), after.total_time());
                for (_, record) in before.methods().iter() {
                    let id = after.methods().find(record.key).unwrap();
                    prop_assert_eq!(after.methods()[id].measurement, record.measurement);
                }
            }
            (None, None) => {}
            _ => prop_assert!(false, "context lost across dump/load"),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_arbitrary_streams_never_panic(
        kinds in prop::collection::vec(0u8..6, 0..80),
        threads in prop::collection::vec(0u64..3, 1..5),
    ) {
        let mut s = ProfileSession::new(ProfileConfig {
            track_allocations: true,
            ..ProfileConfig::default()
        }).unwrap();
        s.start_at(0.0).unwrap();
        for (i, kind) in kinds.iter().enumerate() {
            let at = i as f64;
            let thread = threads[i % threads.len()];
            let event = match kind {
                0 => ProfileEvent::call(Entity::Plain("P".into()), MEMBERS[i % 5]).source("p.rb", 1),
                1 => ProfileEvent::native_call(Entity::ModuleSingleton("N".into()), "n"),
                2 => ProfileEvent::ret(),
                3 => ProfileEvent::native_ret(),
                4 => ProfileEvent::line("p.rb", i as u32),
                _ => ProfileEvent::allocation("Obj", 8, "p.rb", i as u32),
            };
            s.handle_event(&event.on(thread, 0).at(at)).unwrap();
        }
        s.stop_at(kinds.len() as f64).unwrap();
        for (_, ctx) in s.threads() {
            prop_assert!(ctx.stack().is_empty());
            prop_assert!(ctx.total_time() >= 0.0);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_wait_and_pause_never_overlap(
        ops in prop::collection::vec(mixed_op_strategy(), 1..80),
        steps in prop::collection::vec(1u32..50, 1..10),
    ) {
        let session = replay_mixed(&ops, &steps);
        for (_, ctx) in session.threads() {
            prop_assert!(ctx.stack().is_empty());
            let tree = ctx.call_tree();
            for id in tree.walk_all() {
                let m = tree[id].measurement;
                let children: f64 = tree[id]
                    .children()
                    .iter()
                    .map(|&c| tree[c].measurement.total_time)
                    .sum();
                prop_assert!(m.self_time >= -1e-6, "negative self {}", m.self_time);
                prop_assert!(m.wait_time >= -1e-6, "negative wait {}", m.wait_time);
                prop_assert!(
                    (m.self_time + children + m.wait_time - m.total_time).abs() < 1e-6,
                    "self {} + children {} + wait {} != total {}",
                    m.self_time, children, m.wait_time, m.total_time
                );
            }
            for (_, record) in ctx.methods().iter() {
                if record.excluded {
                    prop_assert!(record.call_tree_nodes().is_empty());
                    prop_assert_eq!(record.measurement.called, 0);
                }
                prop_assert!(record.measurement.self_time >= -1e-6);
            }
        }
    }
}
