//! Per-thread method registry
//!
//! Each thread context owns one registry mapping a [`MethodKey`] to a
//! [`MethodRecord`] holding the method's aggregate cost across every call
//! path. Records live in an arena and are addressed by [`MethodId`]; they are
//! never removed while the owning context exists.
//!
//! A key hit is only trusted once the record's owner and member match. When
//! two methods hash to the same key the later one moves on to the next free key, so
//! keys stay unique within a registry.

use crate::call_tree::NodeId;
use crate::entity::{Entity, MethodKey, ResolvedEntity};
use crate::filter::MethodExclusions;
use crate::measurement::Measurement;
use fnv::{FnvHashMap, FnvHasher};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// Index of a method record within its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub usize);

/// Source location of a method definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: Arc<str>,
    pub line: u32,
}

/// Objects allocated from one source line of a method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub class_name: Arc<str>,
    pub source_file: Arc<str>,
    pub line: u32,
    pub count: u64,
    pub memory: u64,
}

fn allocation_key(source_file: &str, line: u32, class_name: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    source_file.hash(&mut hasher);
    line.hash(&mut hasher);
    class_name.hash(&mut hasher);
    hasher.finish()
}

/// Aggregate statistics for one method within one thread
#[derive(Debug, Clone)]
pub struct MethodRecord {
    pub key: MethodKey,
    /// Canonical owning entity
    pub owner: ResolvedEntity,
    pub member: Arc<str>,
    /// Definition site; absent for native and excluded methods
    pub source: Option<SourceLocation>,
    pub measurement: Measurement,
    /// Set once the method was seen re-entering itself
    pub recursive: bool,
    /// Set once the method was seen with no caller
    pub root: bool,
    /// Cost folded into the nearest real caller
    pub excluded: bool,
    /// Current recursion depth, > 0 while on the stack
    pub(crate) visits: u32,
    /// Call-tree nodes bound to this method
    pub(crate) call_tree_nodes: Vec<NodeId>,
    allocations: FnvHashMap<u64, Allocation>,
}

impl MethodRecord {
    pub fn new(key: MethodKey, owner: ResolvedEntity, member: &str) -> Self {
        Self {
            key,
            owner,
            member: Arc::from(member),
            source: None,
            measurement: Measurement::default(),
            recursive: false,
            root: false,
            excluded: false,
            visits: 0,
            call_tree_nodes: Vec::new(),
            allocations: FnvHashMap::default(),
        }
    }

    /// Whether this record belongs to `owner#member`
    pub fn is_method(&self, owner: &ResolvedEntity, member: &str) -> bool {
        self.owner == *owner && &*self.member == member
    }

    /// Display name as `Owner#member`
    pub fn full_name(&self) -> String {
        format!("{}#{}", self.owner.display_name(), self.member)
    }

    pub fn visits(&self) -> u32 {
        self.visits
    }

    /// Call-tree entry points of this method
    pub fn call_tree_nodes(&self) -> &[NodeId] {
        &self.call_tree_nodes
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values()
    }

    /// Record one allocated object attributed to this method
    pub fn record_allocation(&mut self, class_name: &str, source_file: &str, line: u32, size: u64) {
        let key = allocation_key(source_file, line, class_name);
        let entry = self.allocations.entry(key).or_insert_with(|| Allocation {
            class_name: Arc::from(class_name),
            source_file: Arc::from(source_file),
            line,
            count: 0,
            memory: 0,
        });
        entry.count += 1;
        entry.memory += size;
    }

    /// Fold an allocation aggregate (from a dump or another context) in
    pub fn merge_allocation(&mut self, allocation: &Allocation) {
        let key = allocation_key(&allocation.source_file, allocation.line, &allocation.class_name);
        let entry = self.allocations.entry(key).or_insert_with(|| Allocation {
            count: 0,
            memory: 0,
            ..allocation.clone()
        });
        entry.count += allocation.count;
        entry.memory += allocation.memory;
    }

    /// Copy identity and flags without measurements, nodes or allocations
    fn detached_copy(&self) -> Self {
        Self {
            source: self.source.clone(),
            excluded: self.excluded,
            ..Self::new(self.key, self.owner.clone(), &self.member)
        }
    }
}

/// Arena of method records keyed by method identity
#[derive(Debug, Default)]
pub struct MethodRegistry {
    records: Vec<MethodRecord>,
    index: FnvHashMap<MethodKey, MethodId>,
}

impl Index<MethodId> for MethodRegistry {
    type Output = MethodRecord;

    fn index(&self, id: MethodId) -> &MethodRecord {
        &self.records[id.0]
    }
}

impl IndexMut<MethodId> for MethodRegistry {
    fn index_mut(&mut self, id: MethodId) -> &mut MethodRecord {
        &mut self.records[id.0]
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the record for a method, creating it on first sight
    ///
    /// New records are checked against the exclusion table; excluded
    /// records carry no source location.
    pub fn lookup_or_create(
        &mut self,
        entity: &Entity,
        member: &str,
        is_native_call: bool,
        source: Option<SourceLocation>,
        exclusions: &MethodExclusions,
    ) -> MethodId {
        let owner = entity.resolve();
        let key = match self.locate(&owner, member) {
            Ok(id) => return id,
            Err(free) => free,
        };

        let mut record = MethodRecord::new(key, owner, member);
        if exclusions.contains(&record.owner, member) {
            record.excluded = true;
        } else if !is_native_call {
            record.source = source;
        }
        self.push(record)
    }

    /// Search for `owner#member`: its id when present, else the first free key
    fn locate(&self, owner: &ResolvedEntity, member: &str) -> Result<MethodId, MethodKey> {
        let mut key = MethodKey::new(owner, member);
        while let Some(&id) = self.index.get(&key) {
            if self.records[id.0].is_method(owner, member) {
                return Ok(id);
            }
            key = key.next_candidate();
        }
        Err(key)
    }

    fn push(&mut self, record: MethodRecord) -> MethodId {
        let id = MethodId(self.records.len());
        self.index.insert(record.key, id);
        self.records.push(record);
        id
    }

    /// Add a fully-formed record; an existing record for the same method wins
    ///
    /// The record's key is re-derived against this registry.
    pub fn insert(&mut self, mut record: MethodRecord) -> MethodId {
        match self.locate(&record.owner, &record.member) {
            Ok(id) => id,
            Err(free) => {
                record.key = free;
                self.push(record)
            }
        }
    }

    /// Map a record from another registry into this one
    pub fn import(&mut self, record: &MethodRecord) -> MethodId {
        match self.locate(&record.owner, &record.member) {
            Ok(id) => id,
            Err(_) => self.insert(record.detached_copy()),
        }
    }

    /// Record for `owner#member`, if seen
    pub fn lookup(&self, owner: &ResolvedEntity, member: &str) -> Option<MethodId> {
        self.locate(owner, member).ok()
    }

    /// This registry's record for the method `id` of another registry
    pub fn lookup_record(&self, other: &MethodRegistry, id: MethodId) -> Option<MethodId> {
        let record = other.get(id)?;
        self.lookup(&record.owner, &record.member)
    }

    pub fn find(&self, key: MethodKey) -> Option<MethodId> {
        self.index.get(&key).copied()
    }

    pub fn get(&self, id: MethodId) -> Option<&MethodRecord> {
        self.records.get(id.0)
    }

    pub fn get_mut(&mut self, id: MethodId) -> Option<&mut MethodRecord> {
        self.records.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (MethodId, &MethodRecord)> {
        self.records.iter().enumerate().map(|(i, r)| (MethodId(i), r))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
