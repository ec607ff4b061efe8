//! Thread/fiber contexts and switch accounting
//!
//! Each logical execution context (thread x fiber) owns its own method
//! registry, call tree and stack. The table remembers which context was
//! active last; when an event arrives from a different context, the waiting
//! context's top frame is stamped with the switch time and the resuming
//! context's top frame is charged the wait since its own last switch-out,
//! less any time it spent paused in between.

use crate::call_tree::{CallSite, CallTree};
use crate::error::{ProfileError, Result};
use crate::event::{EventKind, ProfileEvent};
use crate::filter::{MethodExclusions, ThreadFilter};
use crate::method::{MethodId, MethodRecord, MethodRegistry, SourceLocation};
use crate::stack::{Frame, Stack};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// Identity of a logical execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey {
    pub thread_id: u64,
    pub fiber_id: u64,
}

impl ContextKey {
    pub fn new(thread_id: u64, fiber_id: u64) -> Self {
        Self {
            thread_id,
            fiber_id,
        }
    }
}

/// Handle to a context within a session's thread table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextHandle(pub(crate) usize);

/// Profiling state of one thread x fiber
#[derive(Debug)]
pub struct ThreadContext {
    key: ContextKey,
    trace: bool,
    methods: MethodRegistry,
    call_tree: CallTree,
    stack: Stack,
    files: HashSet<Arc<str>>,
}

impl ThreadContext {
    pub fn new(key: ContextKey, trace: bool, stack_capacity: usize) -> Self {
        Self {
            key,
            trace,
            methods: MethodRegistry::new(),
            call_tree: CallTree::new(),
            stack: Stack::with_capacity(stack_capacity),
            files: HashSet::new(),
        }
    }

    /// Rebuild a context from already-settled parts (used when loading dumps)
    pub(crate) fn from_parts(key: ContextKey, methods: MethodRegistry, call_tree: CallTree) -> Self {
        Self {
            key,
            trace: true,
            methods,
            call_tree,
            stack: Stack::new(),
            files: HashSet::new(),
        }
    }

    pub fn key(&self) -> ContextKey {
        self.key
    }

    pub fn thread_id(&self) -> u64 {
        self.key.thread_id
    }

    pub fn fiber_id(&self) -> u64 {
        self.key.fiber_id
    }

    /// Whether events for this context are recorded
    pub fn is_traced(&self) -> bool {
        self.trace
    }

    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    pub fn method(&self, id: MethodId) -> Option<&MethodRecord> {
        self.methods.get(id)
    }

    pub fn call_tree(&self) -> &CallTree {
        &self.call_tree
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Inclusive cost of everything recorded on this context
    pub fn total_time(&self) -> f64 {
        self.call_tree.total_time()
    }

    fn intern(&mut self, file: &str) -> Arc<str> {
        if let Some(existing) = self.files.get(file) {
            return Arc::clone(existing);
        }
        let interned: Arc<str> = Arc::from(file);
        self.files.insert(Arc::clone(&interned));
        interned
    }

    /// Handle a call or native-call event
    pub(crate) fn on_call(
        &mut self,
        event: &ProfileEvent,
        exclusions: &MethodExclusions,
        paused: bool,
    ) {
        let (Some(entity), Some(member)) = (&event.entity, &event.member) else {
            // Unnamed frames fold into the caller; the pass absorbs their return
            trace!(thread = self.key.thread_id, "call event without method identity");
            self.stack.pass();
            return;
        };
        let file = event.source_file.as_deref().map(|f| self.intern(f));
        let source = file.clone().map(|file| SourceLocation {
            file,
            line: event.line,
        });
        let is_native = event.kind == EventKind::NativeCall;
        let method = self
            .methods
            .lookup_or_create(entity, member, is_native, source, exclusions);

        if self.methods[method].excluded {
            self.stack.pass();
            return;
        }

        let node = match self.stack.peek() {
            // Direct self-recursion re-enters the active node
            Some(frame) if frame.method == method => frame.node,
            Some(frame) => {
                let call_site = CallSite {
                    file: frame.source_file.clone(),
                    line: frame.line,
                };
                let parent = frame.node;
                self.call_tree
                    .get_or_create_child(Some(parent), &mut self.methods, method, call_site)
            }
            None => {
                self.methods[method].root = true;
                self.call_tree.get_or_create_child(
                    None,
                    &mut self.methods,
                    method,
                    CallSite::default(),
                )
            }
        };

        let frame = self.stack.push(
            &mut self.call_tree,
            &mut self.methods,
            node,
            event.measurement,
            paused,
        );
        frame.source_file = file;
        frame.line = event.line;
    }

    /// Handle a return or native-return event
    pub(crate) fn on_return(&mut self, measurement: f64, paused: bool) -> Option<Frame> {
        let popped = self
            .stack
            .pop(&mut self.call_tree, &mut self.methods, measurement);
        if paused {
            // The caller is the active leaf again and must stay paused
            self.stack.pause(measurement);
        }
        popped
    }

    /// Track the current line of the active frame
    pub(crate) fn on_line(&mut self, event: &ProfileEvent) {
        let file = event.source_file.as_deref().map(|f| self.intern(f));
        if let Some(frame) = self.stack.peek_mut() {
            if file.is_some() {
                frame.source_file = file;
            }
            frame.line = event.line;
        }
    }

    /// Attribute an allocation to the lexically enclosing active method
    pub(crate) fn on_allocation(&mut self, event: &ProfileEvent) {
        let (Some(file), Some(object)) = (event.source_file.as_deref(), &event.allocation) else {
            return;
        };
        if let Some(method) = self.stack.find_method(&self.methods, file, event.line) {
            self.methods[method].record_allocation(&object.class_name, file, event.line, object.size);
        }
    }

    pub(crate) fn pause(&mut self, measurement: f64) {
        self.stack.pause(measurement);
    }

    pub(crate) fn resume(&mut self, measurement: f64) {
        self.stack.unpause(measurement);
    }

    /// Settle every open frame at `measurement`; returns the number of
    /// return events consumed
    pub(crate) fn unwind(&mut self, measurement: f64) -> usize {
        let mut consumed = 0;
        while self
            .stack
            .pop(&mut self.call_tree, &mut self.methods, measurement)
            .is_some()
        {
            consumed += 1;
        }
        consumed
    }

    /// Fold another (quiesced) context into this one
    ///
    /// Method aggregates are summed through this context's registry and the
    /// other call tree is merged root by root.
    pub fn merge(&mut self, other: &ThreadContext) {
        for (_, record) in other.methods.iter() {
            let id = self.methods.import(record);
            let dest = &mut self.methods[id];
            dest.measurement.merge(&record.measurement);
            dest.recursive |= record.recursive;
            dest.root |= record.root;
            for allocation in record.allocations() {
                dest.merge_allocation(allocation);
            }
        }
        self.call_tree
            .merge_tree(&other.call_tree, &other.methods, &mut self.methods);
    }
}

/// All contexts of a session, addressed by [`ContextHandle`]
#[derive(Debug, Default)]
pub struct ThreadTable {
    slots: Vec<Option<ThreadContext>>,
    index: FnvHashMap<ContextKey, usize>,
    last: Option<usize>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `key` the active context, creating it on first sight
    ///
    /// Returns the context's handle. Switching from another context runs
    /// the wait-time accounting described in the module docs.
    pub fn activate(
        &mut self,
        key: ContextKey,
        measurement: f64,
        filter: &ThreadFilter,
        stack_capacity: usize,
    ) -> ContextHandle {
        if let Some(last) = self.last {
            if self.slots[last].as_ref().map(|c| c.key) == Some(key) {
                return ContextHandle(last);
            }
        }

        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let trace = filter.should_trace(key.thread_id);
                trace!(
                    thread = key.thread_id,
                    fiber = key.fiber_id,
                    trace,
                    "creating thread context"
                );
                self.insert(ThreadContext::new(key, trace, stack_capacity))
            }
        };
        self.switch_to(slot, measurement);
        ContextHandle(slot)
    }

    fn switch_to(&mut self, slot: usize, measurement: f64) {
        if let Some(frame) = self.slots[slot].as_mut().and_then(|c| c.stack.peek_mut()) {
            frame.switch_in(measurement);
        }
        if let Some(last) = self.last {
            if let Some(frame) = self.slots[last].as_mut().and_then(|c| c.stack.peek_mut()) {
                frame.switch_out(measurement);
            }
            trace!(from = last, to = slot, "context switch");
        }
        self.last = Some(slot);
    }

    /// Insert a context (replacing nothing); returns its slot
    pub(crate) fn insert(&mut self, context: ThreadContext) -> usize {
        let slot = self.slots.len();
        self.index.insert(context.key, slot);
        self.slots.push(Some(context));
        slot
    }

    pub fn find(&self, key: ContextKey) -> Option<ContextHandle> {
        self.index.get(&key).map(|&slot| ContextHandle(slot))
    }

    pub fn get(&self, handle: ContextHandle) -> Result<&ThreadContext> {
        self.slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(ProfileError::AlreadyFreed {
                what: "thread context",
            })
    }

    pub fn get_mut(&mut self, handle: ContextHandle) -> Result<&mut ThreadContext> {
        self.slots
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(ProfileError::AlreadyFreed {
                what: "thread context",
            })
    }

    /// Release a context; its handle reports `AlreadyFreed` afterwards
    pub fn remove(&mut self, handle: ContextHandle) -> Option<ThreadContext> {
        let context = self.slots.get_mut(handle.0)?.take()?;
        self.index.remove(&context.key);
        if self.last == Some(handle.0) {
            self.last = None;
        }
        Some(context)
    }

    /// Forget the active context without touching any frame
    pub fn reset_last(&mut self) {
        self.last = None;
    }

    /// Every live context, traced or not
    pub fn iter_all(&self) -> impl Iterator<Item = (ContextHandle, &ThreadContext)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, c)| c.as_ref().map(|c| (ContextHandle(slot), c)))
    }

    /// Live, trace-enabled contexts
    pub fn iter(&self) -> impl Iterator<Item = (ContextHandle, &ThreadContext)> {
        self.iter_all().filter(|(_, c)| c.is_traced())
    }

    pub(crate) fn handles(&self) -> Vec<ContextHandle> {
        self.iter_all().map(|(handle, _)| handle).collect()
    }

    /// Release every context
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.index.clear();
        self.last = None;
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
