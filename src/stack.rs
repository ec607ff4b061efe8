//! Per-context stack of active invocations
//!
//! Every real frame is bound to a call-tree node. When a frame is popped its
//! cost is settled into both the node and the node's method record:
//!
//! ```text
//! total = now - start - dead_time
//! self  = total - child_time - wait_time
//! ```
//!
//! `total` is only added when the pop brings the node's (or method's) visit
//! count back to zero, so recursive re-entries never count inclusive cost
//! twice. Popping an empty stack is tolerated and returns `None`: the event
//! source cannot report every frame unwound by a non-local exit.

use crate::call_tree::{CallTree, NodeId};
use crate::method::{MethodId, MethodRegistry};
use std::sync::Arc;

/// Initial number of frame slots
pub const DEFAULT_STACK_CAPACITY: usize = 8;

/// One active (possibly paused) invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub node: NodeId,
    pub method: MethodId,
    pub start: f64,
    /// Sample at which the frame was paused; None while running
    pub pause_time: Option<f64>,
    /// Sample at which another context became active while this one waited
    pub switch_time: Option<f64>,
    /// Dead time accrued up to `switch_time`
    pub switch_dead: f64,
    /// Settled total cost of completed children
    pub child_time: f64,
    /// Time spent paused, excluded from all timing math
    pub dead_time: f64,
    /// Time spent while another context was running
    pub wait_time: f64,
    /// Current source position inside this invocation
    pub source_file: Option<Arc<str>>,
    pub line: u32,
    /// Return events still to be absorbed for excluded callees
    pub passes: u32,
}

impl Frame {
    fn new(node: NodeId, method: MethodId, start: f64) -> Self {
        Self {
            node,
            method,
            start,
            pause_time: None,
            switch_time: None,
            switch_dead: 0.0,
            child_time: 0.0,
            dead_time: 0.0,
            wait_time: 0.0,
            source_file: None,
            line: 0,
            passes: 0,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_time.is_some()
    }

    /// Whether return events are currently absorbed by this slot
    pub fn is_pass(&self) -> bool {
        self.passes > 0
    }

    /// Pause the frame; a no-op when already paused
    pub fn pause(&mut self, measurement: f64) {
        if self.pause_time.is_none() {
            self.pause_time = Some(measurement);
        }
    }

    /// Unpause the frame, folding the paused interval into dead time
    pub fn unpause(&mut self, measurement: f64) {
        if let Some(paused_at) = self.pause_time.take() {
            self.dead_time += measurement - paused_at;
        }
    }

    /// Dead time up to `measurement`, counting a pause that is still open
    pub fn dead_until(&self, measurement: f64) -> f64 {
        let open = self
            .pause_time
            .map_or(0.0, |paused_at| measurement - paused_at);
        self.dead_time + open
    }

    /// Mark the start of a wait: another context became active
    pub fn switch_out(&mut self, measurement: f64) {
        self.switch_time = Some(measurement);
        self.switch_dead = self.dead_until(measurement);
    }

    /// End a wait, charging the time spent waiting but not paused
    pub fn switch_in(&mut self, measurement: f64) {
        if let Some(switched_at) = self.switch_time.take() {
            let dead = self.dead_until(measurement) - self.switch_dead;
            self.wait_time += measurement - switched_at - dead;
            self.switch_dead = 0.0;
        }
    }
}

/// Growable stack of frames for one thread context
#[derive(Debug)]
pub struct Stack {
    frames: Vec<Frame>,
}

impl Default for Stack {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_STACK_CAPACITY)
    }
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity.max(1)),
        }
    }

    /// Push a frame for `node`
    ///
    /// The current top (the caller) is unpaused first: a caller cannot stay
    /// paused while it spawns an active child. If the profiler is paused
    /// (`start_paused`) the new frame starts paused instead.
    pub fn push(
        &mut self,
        tree: &mut CallTree,
        methods: &mut MethodRegistry,
        node: NodeId,
        measurement: f64,
        start_paused: bool,
    ) -> &mut Frame {
        if let Some(parent) = self.frames.last_mut() {
            parent.unpause(measurement);
        }

        if self.frames.len() == self.frames.capacity() {
            let grow_by = self.frames.capacity().max(1);
            self.frames.reserve_exact(grow_by);
        }

        let tree_node = &mut tree[node];
        tree_node.measurement.called += 1;
        tree_node.visits += 1;
        let method = tree_node.method;

        let record = &mut methods[method];
        if record.visits > 0 {
            record.recursive = true;
        }
        record.measurement.called += 1;
        record.visits += 1;

        let mut frame = Frame::new(node, method, measurement);
        if start_paused {
            frame.pause(measurement);
        }
        self.frames.push(frame);
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Pop the top frame and settle its cost
    ///
    /// A pass slot absorbs the return instead: its pass count is decremented
    /// and the frame stays on the stack.
    pub fn pop(
        &mut self,
        tree: &mut CallTree,
        methods: &mut MethodRegistry,
        measurement: f64,
    ) -> Option<Frame> {
        let top = self.frames.last_mut()?;
        if top.is_pass() {
            top.passes -= 1;
            return Some(top.clone());
        }

        let mut frame = self.frames.pop()?;
        frame.unpause(measurement);
        let total = measurement - frame.start - frame.dead_time;
        let self_time = total - frame.child_time - frame.wait_time;

        let record = &mut methods[frame.method];
        record.measurement.self_time += self_time;
        record.measurement.wait_time += frame.wait_time;
        if record.visits == 1 {
            record.measurement.total_time += total;
        }
        record.visits = record.visits.saturating_sub(1);

        let node = &mut tree[frame.node];
        node.measurement.self_time += self_time;
        node.measurement.wait_time += frame.wait_time;
        if node.visits == 1 {
            node.measurement.total_time += total;
        }
        node.visits = node.visits.saturating_sub(1);

        if let Some(parent) = self.frames.last_mut() {
            parent.child_time += total;
            parent.dead_time += frame.dead_time;
        }
        Some(frame)
    }

    /// Absorb the next return event in the top frame without pushing
    ///
    /// Returns false when the stack is empty and there is nothing to attach
    /// the pass to.
    pub fn pass(&mut self) -> bool {
        match self.frames.last_mut() {
            Some(top) => {
                top.passes += 1;
                true
            }
            None => false,
        }
    }

    /// Pause the active leaf
    pub fn pause(&mut self, measurement: f64) {
        if let Some(top) = self.frames.last_mut() {
            top.pause(measurement);
        }
    }

    /// Unpause the active leaf
    pub fn unpause(&mut self, measurement: f64) {
        if let Some(top) = self.frames.last_mut() {
            top.unpause(measurement);
        }
    }

    pub fn peek(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn peek_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Innermost active method whose body lexically encloses `file:line`
    ///
    /// Scans from the top down for a frame whose method is defined in
    /// `source_file` at or above `source_line`.
    pub fn find_method(
        &self,
        methods: &MethodRegistry,
        source_file: &str,
        source_line: u32,
    ) -> Option<MethodId> {
        self.frames.iter().rev().find_map(|frame| {
            let source = methods.get(frame.method)?.source.as_ref()?;
            (&*source.file == source_file && source_line >= source.line).then_some(frame.method)
        })
    }

    /// Frames from the bottom of the stack to the top
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_tree::CallSite;
    use crate::entity::Entity;
    use crate::filter::MethodExclusions;
    use crate::method::SourceLocation;

    struct Fixture {
        tree: CallTree,
        methods: MethodRegistry,
        stack: Stack,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tree: CallTree::new(),
                methods: MethodRegistry::new(),
                stack: Stack::new(),
            }
        }

        fn method(&mut self, name: &str, source: Option<(&str, u32)>) -> MethodId {
            self.methods.lookup_or_create(
                &Entity::Plain("Obj".into()),
                name,
                false,
                source.map(|(file, line)| SourceLocation {
                    file: Arc::from(file),
                    line,
                }),
                &MethodExclusions::new(),
            )
        }

        fn call(&mut self, method: MethodId, at: f64) -> NodeId {
            let parent = self.stack.peek().map(|f| f.node);
            let node = self
                .tree
                .get_or_create_child(parent, &mut self.methods, method, CallSite::default());
            self.stack
                .push(&mut self.tree, &mut self.methods, node, at, false);
            node
        }

        fn ret(&mut self, at: f64) -> Option<Frame> {
            self.stack.pop(&mut self.tree, &mut self.methods, at)
        }
    }

    #[test]
    fn test_nested_settlement() {
        let mut fx = Fixture::new();
        let outer = fx.method("outer", None);
        let inner = fx.method("inner", None);

        let n_outer = fx.call(outer, 0.0);
        let n_inner = fx.call(inner, 10.0);
        fx.ret(40.0);
        fx.ret(100.0);

        let o = fx.tree[n_outer].measurement;
        assert_eq!(o.total_time, 100.0);
        assert_eq!(o.self_time, 70.0);
        let i = fx.tree[n_inner].measurement;
        assert_eq!(i.total_time, 30.0);
        assert_eq!(i.self_time, 30.0);
        assert_eq!(fx.methods[outer].measurement.total_time, 100.0);
        assert!(fx.stack.is_empty());
    }

    #[test]
    fn test_pop_empty_is_tolerated() {
        let mut fx = Fixture::new();
        assert!(fx.ret(5.0).is_none());
    }

    #[test]
    fn test_pause_is_idempotent_and_excluded_from_time() {
        let mut fx = Fixture::new();
        let m = fx.method("m", None);
        let node = fx.call(m, 0.0);
        fx.stack.pause(10.0);
        fx.stack.pause(15.0);
        fx.stack.unpause(30.0);
        fx.stack.unpause(35.0);
        fx.ret(50.0);
        // 20 units paused (10..30)
        assert_eq!(fx.tree[node].measurement.total_time, 30.0);
    }

    #[test]
    fn test_push_unpauses_parent_and_child_starts_paused() {
        let mut fx = Fixture::new();
        let parent = fx.method("parent", None);
        let child = fx.method("child", None);
        let pn = fx.call(parent, 0.0);
        fx.stack.pause(10.0);

        let cn = fx
            .tree
            .get_or_create_child(Some(pn), &mut fx.methods, child, CallSite::default());
        fx.stack.push(&mut fx.tree, &mut fx.methods, cn, 20.0, true);
        assert!(fx.stack.peek().unwrap().is_paused());
        let parent_frame = fx.stack.iter().next().unwrap();
        assert!(!parent_frame.is_paused());
        assert_eq!(parent_frame.dead_time, 10.0);

        fx.stack.unpause(30.0);
        fx.ret(35.0);
        fx.ret(40.0);
        // Child: 20..35 with 10 dead => 5
        assert_eq!(fx.tree[cn].measurement.total_time, 5.0);
        // Parent: 0..40 minus own dead 10 minus inherited 10 => 20
        assert_eq!(fx.tree[pn].measurement.total_time, 20.0);
        assert_eq!(fx.tree[pn].measurement.self_time, 15.0);
    }

    #[test]
    fn test_recursion_counts_total_once() {
        let mut fx = Fixture::new();
        let fib = fx.method("fib", None);
        let root = fx.tree.get_or_create_child(None, &mut fx.methods, fib, CallSite::default());
        for depth in 0..3 {
            fx.stack
                .push(&mut fx.tree, &mut fx.methods, root, depth as f64, false);
        }
        assert_eq!(fx.tree[root].visits(), 3);
        fx.ret(10.0);
        fx.ret(20.0);
        fx.ret(30.0);

        let record = &fx.methods[fib];
        assert!(record.recursive);
        assert_eq!(record.measurement.called, 3);
        assert_eq!(record.measurement.total_time, 30.0);
        assert_eq!(fx.tree[root].measurement.total_time, 30.0);
        assert_eq!(fx.tree[root].measurement.self_time, 30.0);
        assert_eq!(fx.tree[root].visits(), 0);
    }

    #[test]
    fn test_pass_absorbs_return() {
        let mut fx = Fixture::new();
        let m = fx.method("m", None);
        let node = fx.call(m, 0.0);
        assert!(fx.stack.pass());
        let absorbed = fx.ret(5.0).unwrap();
        assert_eq!(absorbed.passes, 0);
        assert_eq!(fx.stack.len(), 1);
        assert_eq!(fx.tree[node].measurement.total_time, 0.0);
        fx.ret(10.0);
        assert!(fx.stack.is_empty());
        assert_eq!(fx.tree[node].measurement.total_time, 10.0);
    }

    #[test]
    fn test_wait_excludes_pause_inside_switch() {
        let mut fx = Fixture::new();
        let m = fx.method("m", None);
        let node = fx.call(m, 0.0);
        let frame = fx.stack.peek_mut().unwrap();
        frame.switch_out(10.0);
        frame.pause(11.0);
        frame.unpause(100.0);
        frame.switch_in(101.0);
        assert_eq!(frame.wait_time, 2.0);
        fx.ret(101.0);

        let measurement = fx.tree[node].measurement;
        assert_eq!(measurement.total_time, 12.0);
        assert_eq!(measurement.self_time, 10.0);
        assert_eq!(measurement.wait_time, 2.0);
    }

    #[test]
    fn test_wait_clips_pause_open_across_switch() {
        let mut fx = Fixture::new();
        let m = fx.method("m", None);
        fx.call(m, 0.0);
        let frame = fx.stack.peek_mut().unwrap();
        // Paused before the switch and still paused when it ends
        frame.pause(5.0);
        frame.switch_out(8.0);
        frame.switch_in(20.0);
        assert_eq!(frame.wait_time, 0.0);
        assert!(frame.is_paused());
    }

    #[test]
    fn test_pass_on_empty_stack() {
        let mut stack = Stack::new();
        assert!(!stack.pass());
    }

    #[test]
    fn test_growth_preserves_frames() {
        let mut fx = Fixture::new();
        fx.stack = Stack::with_capacity(8);
        let methods: Vec<MethodId> = (0..40).map(|i| fx.method(&format!("m{}", i), None)).collect();
        for (i, m) in methods.iter().enumerate() {
            fx.call(*m, i as f64);
        }
        assert_eq!(fx.stack.len(), 40);
        assert!(fx.stack.capacity() >= 40);
        for (i, frame) in fx.stack.iter().enumerate() {
            assert_eq!(frame.method, methods[i]);
            assert_eq!(frame.start, i as f64);
        }
    }

    #[test]
    fn test_find_method_is_lexical() {
        let mut fx = Fixture::new();
        let build = fx.method("build", Some(("app.rb", 10)));
        let helper = fx.method("new", Some(("lib.rb", 1)));
        fx.call(build, 0.0);
        fx.call(helper, 1.0);

        assert_eq!(fx.stack.find_method(&fx.methods, "app.rb", 12), Some(build));
        assert_eq!(fx.stack.find_method(&fx.methods, "lib.rb", 3), Some(helper));
        assert_eq!(fx.stack.find_method(&fx.methods, "app.rb", 5), None);
        assert_eq!(fx.stack.find_method(&fx.methods, "other.rb", 1), None);
    }
}
