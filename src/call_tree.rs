//! Call tree: one node per distinct (method, parent call path)
//!
//! Nodes live in a per-context arena and are addressed by [`NodeId`]. Each
//! node indexes its children by callee [`MethodKey`], so a call through an
//! already-seen path is an O(1) lookup. Nodes are never removed while the
//! owning context exists, which keeps every `NodeId` held by a frame valid.
//!
//! # Example
//!
//! ```text
//! main (total 100, self 10)
//! ├─ parse (total 60, self 60)
//! └─ eval  (total 30, self 20)
//!    └─ parse (total 10, self 10)   <- distinct node: different call path
//! ```
//!
//! Tree walks (merge, copy, dump) use explicit worklists, never recursion,
//! so pathological call depths cannot overflow the native stack.

use crate::entity::MethodKey;
use crate::measurement::Measurement;
use crate::method::{MethodId, MethodRecord, MethodRegistry};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// Index of a node within its call tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Location of the call expression that created a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub file: Option<Arc<str>>,
    pub line: u32,
}

/// One edge of the call graph
#[derive(Debug, Clone)]
pub struct CallTreeNode {
    pub method: MethodId,
    pub method_key: MethodKey,
    pub parent: Option<NodeId>,
    /// Cost along this exact call path
    pub measurement: Measurement,
    pub call_site: CallSite,
    /// Recursion depth on this path, > 0 while active
    pub(crate) visits: u32,
    children: FnvHashMap<MethodKey, NodeId>,
}

impl CallTreeNode {
    fn new(method: MethodId, method_key: MethodKey, parent: Option<NodeId>, call_site: CallSite) -> Self {
        Self {
            method,
            method_key,
            parent,
            measurement: Measurement::default(),
            call_site,
            visits: 0,
            children: FnvHashMap::default(),
        }
    }

    pub fn visits(&self) -> u32 {
        self.visits
    }

    pub fn child(&self, key: MethodKey) -> Option<NodeId> {
        self.children.get(&key).copied()
    }

    /// Children ordered by node id, i.e. by first call
    pub fn children(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.children.values().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

/// Measurement aggregated over all edges to or from one method
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateEdge {
    pub method: MethodId,
    pub measurement: Measurement,
}

/// Arena of call-tree nodes for one thread context
#[derive(Debug, Default)]
pub struct CallTree {
    nodes: Vec<CallTreeNode>,
    roots: FnvHashMap<MethodKey, NodeId>,
}

impl Index<NodeId> for CallTree {
    type Output = CallTreeNode;

    fn index(&self, id: NodeId) -> &CallTreeNode {
        &self.nodes[id.0]
    }
}

impl IndexMut<NodeId> for CallTree {
    fn index_mut(&mut self, id: NodeId) -> &mut CallTreeNode {
        &mut self.nodes[id.0]
    }
}

impl CallTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the node for `method` under `parent` (or among the roots),
    /// creating and linking it on first call through this path
    pub fn get_or_create_child(
        &mut self,
        parent: Option<NodeId>,
        methods: &mut MethodRegistry,
        method: MethodId,
        call_site: CallSite,
    ) -> NodeId {
        let key = methods[method].key;
        let existing = match parent {
            Some(p) => self.nodes[p.0].child(key),
            None => self.roots.get(&key).copied(),
        };
        match existing {
            Some(id) => id,
            None => self.attach(parent, methods, method, call_site),
        }
    }

    /// Create a node and link it under `parent` unconditionally
    pub(crate) fn attach(
        &mut self,
        parent: Option<NodeId>,
        methods: &mut MethodRegistry,
        method: MethodId,
        call_site: CallSite,
    ) -> NodeId {
        let key = methods[method].key;
        let id = NodeId(self.nodes.len());
        self.nodes.push(CallTreeNode::new(method, key, parent, call_site));
        match parent {
            Some(p) => {
                self.nodes[p.0].children.insert(key, id);
            }
            None => {
                self.roots.insert(key, id);
            }
        }
        methods[method].call_tree_nodes.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&CallTreeNode> {
        self.nodes.get(id.0)
    }

    /// Root nodes ordered by first call
    pub fn roots(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.roots.values().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn root(&self, key: MethodKey) -> Option<NodeId> {
        self.roots.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Distance from `id` to its root (roots have depth 0)
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = self.nodes.get(id.0).and_then(|n| n.parent);
        while let Some(parent) = current {
            depth += 1;
            current = self.nodes[parent.0].parent;
        }
        depth
    }

    /// Nodes of the subtree rooted at `id` in pre-order (parents first)
    pub fn walk(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut worklist = vec![id];
        while let Some(current) = worklist.pop() {
            order.push(current);
            let mut children = self.nodes[current.0].children();
            children.reverse();
            worklist.extend(children);
        }
        order
    }

    /// Pre-order walk over every tree, roots in first-call order
    pub fn walk_all(&self) -> Vec<NodeId> {
        self.roots().into_iter().flat_map(|root| self.walk(root)).collect()
    }

    /// Sum of the total cost of every root
    pub fn total_time(&self) -> f64 {
        self.roots
            .values()
            .map(|id| self.nodes[id.0].measurement.total_time)
            .sum()
    }

    /// Merge the subtree at `other_node` of `other` into `self_node`
    ///
    /// Both nodes must be bound to the same method and have structurally
    /// equal parents (both roots, or parents bound to the same method);
    /// otherwise nothing happens and `false` is returned. Methods are matched
    /// by owner and member, since keys are only unique within one registry.
    /// A child only present in `other` is deep-copied
    /// with its methods remapped through `methods`.
    pub fn merge(
        &mut self,
        self_node: NodeId,
        other: &CallTree,
        other_node: NodeId,
        other_methods: &MethodRegistry,
        methods: &mut MethodRegistry,
    ) -> bool {
        let (Some(mine), Some(theirs)) = (self.node(self_node), other.node(other_node)) else {
            return false;
        };
        let (my_method, my_parent) = (mine.method, mine.parent.map(|p| self.nodes[p.0].method));
        if methods.lookup_record(other_methods, theirs.method) != Some(my_method) {
            return false;
        }
        let their_parent = theirs
            .parent
            .map(|p| methods.lookup_record(other_methods, other.nodes[p.0].method));
        match (my_parent, their_parent) {
            (None, None) => {}
            (Some(mine), Some(Some(theirs))) if mine == theirs => {}
            _ => return false,
        }

        let mut worklist = vec![(self_node, other_node)];
        while let Some((dest, src)) = worklist.pop() {
            let src_node = &other.nodes[src.0];
            self.nodes[dest.0].measurement.merge(&src_node.measurement);
            for other_child in src_node.children() {
                let key = Self::local_key(other, other_child, other_methods, methods);
                match key.and_then(|key| self.nodes[dest.0].child(key)) {
                    Some(existing) => worklist.push((existing, other_child)),
                    None => {
                        self.copy_subtree(Some(dest), other, other_child, other_methods, methods);
                    }
                }
            }
        }
        true
    }

    /// Merge every tree of `other` into this one, root by root
    pub fn merge_tree(
        &mut self,
        other: &CallTree,
        other_methods: &MethodRegistry,
        methods: &mut MethodRegistry,
    ) {
        for other_root in other.roots() {
            let key = Self::local_key(other, other_root, other_methods, methods);
            match key.and_then(|key| self.root(key)) {
                Some(mine) => {
                    self.merge(mine, other, other_root, other_methods, methods);
                }
                None => {
                    self.copy_subtree(None, other, other_root, other_methods, methods);
                }
            }
        }
    }

    /// Key under which this tree indexes the method of `other`'s node
    fn local_key(
        other: &CallTree,
        node: NodeId,
        other_methods: &MethodRegistry,
        methods: &MethodRegistry,
    ) -> Option<MethodKey> {
        methods
            .lookup_record(other_methods, other.nodes[node.0].method)
            .map(|id| methods[id].key)
    }

    /// Deep-copy a subtree of `other` under `parent`, remapping methods
    fn copy_subtree(
        &mut self,
        parent: Option<NodeId>,
        other: &CallTree,
        other_node: NodeId,
        other_methods: &MethodRegistry,
        methods: &mut MethodRegistry,
    ) -> NodeId {
        let copied_root = self.copy_node(parent, other, other_node, other_methods, methods);
        let mut worklist: Vec<(NodeId, NodeId)> = other.nodes[other_node.0]
            .children()
            .into_iter()
            .map(|child| (copied_root, child))
            .collect();
        while let Some((dest_parent, src)) = worklist.pop() {
            let id = self.copy_node(Some(dest_parent), other, src, other_methods, methods);
            worklist.extend(other.nodes[src.0].children().into_iter().map(|child| (id, child)));
        }
        copied_root
    }

    fn copy_node(
        &mut self,
        parent: Option<NodeId>,
        other: &CallTree,
        src: NodeId,
        other_methods: &MethodRegistry,
        methods: &mut MethodRegistry,
    ) -> NodeId {
        let src_node = &other.nodes[src.0];
        let method = methods.import(&other_methods[src_node.method]);
        let id = self.attach(parent, methods, method, src_node.call_site.clone());
        self.nodes[id.0].measurement = src_node.measurement;
        id
    }

    /// Cost of `record` grouped by calling method
    pub fn callers(&self, record: &MethodRecord) -> Vec<AggregateEdge> {
        let mut grouped: FnvHashMap<MethodId, Measurement> = FnvHashMap::default();
        for &id in record.call_tree_nodes() {
            let node = &self.nodes[id.0];
            if let Some(parent) = node.parent {
                grouped
                    .entry(self.nodes[parent.0].method)
                    .or_default()
                    .merge(&node.measurement);
            }
        }
        Self::sorted_edges(grouped)
    }

    /// Cost of methods called by `record`, grouped by callee
    pub fn callees(&self, record: &MethodRecord) -> Vec<AggregateEdge> {
        let mut grouped: FnvHashMap<MethodId, Measurement> = FnvHashMap::default();
        for &id in record.call_tree_nodes() {
            for child in self.nodes[id.0].children.values() {
                let child_node = &self.nodes[child.0];
                grouped
                    .entry(child_node.method)
                    .or_default()
                    .merge(&child_node.measurement);
            }
        }
        Self::sorted_edges(grouped)
    }

    fn sorted_edges(grouped: FnvHashMap<MethodId, Measurement>) -> Vec<AggregateEdge> {
        let mut edges: Vec<AggregateEdge> = grouped
            .into_iter()
            .map(|(method, measurement)| AggregateEdge {
                method,
                measurement,
            })
            .collect();
        edges.sort_by(|a, b| {
            b.measurement
                .total_time
                .partial_cmp(&a.measurement.total_time)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.method.cmp(&b.method))
        });
        edges
    }
}
