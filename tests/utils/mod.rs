// Shared helpers for driving a session with deterministic measurements

#![allow(dead_code)]

use callprof::{
    CallTreeNode, Entity, MethodRecord, NodeId, ProfileConfig, ProfileEvent, ProfileSession,
    ThreadContext,
};

/// Feeds hand-written event streams into a running session
pub struct Recorder {
    pub session: ProfileSession,
    thread_id: u64,
    fiber_id: u64,
}

impl Recorder {
    pub fn new() -> Self {
        Self::with_config(ProfileConfig::default())
    }

    pub fn with_config(config: ProfileConfig) -> Self {
        let mut session = ProfileSession::new(config).expect("valid config");
        session.start_at(0.0).expect("session starts");
        Self::from_session(session)
    }

    /// Wrap a session the caller already configured and started
    pub fn from_session(session: ProfileSession) -> Self {
        Self {
            session,
            thread_id: 0,
            fiber_id: 0,
        }
    }

    /// Route subsequent events to another thread/fiber
    pub fn on(&mut self, thread_id: u64, fiber_id: u64) -> &mut Self {
        self.thread_id = thread_id;
        self.fiber_id = fiber_id;
        self
    }

    pub fn call(&mut self, member: &str, at: f64) -> &mut Self {
        let event = ProfileEvent::call(Entity::Plain("App".into()), member)
            .source("app.rb", 1)
            .on(self.thread_id, self.fiber_id)
            .at(at);
        self.send(event)
    }

    pub fn ret(&mut self, at: f64) -> &mut Self {
        let event = ProfileEvent::ret().on(self.thread_id, self.fiber_id).at(at);
        self.send(event)
    }

    pub fn send(&mut self, event: ProfileEvent) -> &mut Self {
        self.session.handle_event(&event).expect("event accepted");
        self
    }

    pub fn stop(&mut self, at: f64) -> &mut Self {
        self.session.stop_at(at).expect("session stops");
        self
    }
}

pub fn context(session: &ProfileSession, thread_id: u64, fiber_id: u64) -> &ThreadContext {
    let handle = session
        .find_thread(thread_id, fiber_id)
        .expect("context exists");
    session.thread(handle).expect("context live")
}

pub fn record<'a>(ctx: &'a ThreadContext, member: &str) -> &'a MethodRecord {
    ctx.methods()
        .iter()
        .map(|(_, record)| record)
        .find(|record| &*record.member == member)
        .unwrap_or_else(|| panic!("no method {}", member))
}

/// Every node bound to `member`
pub fn nodes<'a>(ctx: &'a ThreadContext, member: &str) -> Vec<(NodeId, &'a CallTreeNode)> {
    record(ctx, member)
        .call_tree_nodes()
        .iter()
        .map(|&id| (id, &ctx.call_tree()[id]))
        .collect()
}

/// The single node bound to `member`
pub fn node<'a>(ctx: &'a ThreadContext, member: &str) -> &'a CallTreeNode {
    let found = nodes(ctx, member);
    assert_eq!(found.len(), 1, "expected one node for {}", member);
    found[0].1
}

/// Member name of a node's parent, if any
pub fn parent_member(ctx: &ThreadContext, node: &CallTreeNode) -> Option<String> {
    node.parent
        .map(|p| ctx.methods()[ctx.call_tree()[p].method].member.to_string())
}
