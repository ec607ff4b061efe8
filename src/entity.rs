//! Method identity and owning-entity resolution
//!
//! The event source reports the entity a method was dispatched through, which
//! may be a view of the real definer: an included module seen through the
//! including type, or the singleton/metaobject of a class, module or
//! instance. Resolution happens once, when a method record is created, and
//! collapses all views of logically-the-same method onto one [`MethodKey`].

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Entity view as reported by the event source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Entity {
    /// Ordinary type or module defining the method
    Plain(String),
    /// Singleton of a class; carries the attached class name
    ClassSingleton(String),
    /// Singleton of a module; carries the attached module name
    ModuleSingleton(String),
    /// Singleton of an instance; carries the class of the attached instance
    InstanceSingleton(String),
    /// Singleton attached to something that is neither class, module nor instance
    OtherSingleton(String),
    /// Included module seen through an including type; carries the module name
    ModuleInclusion(String),
}

impl Entity {
    /// Collapse the view onto its canonical defining entity
    pub fn resolve(&self) -> ResolvedEntity {
        let (kind, name) = match self {
            Entity::Plain(name) | Entity::ModuleInclusion(name) => (EntityKind::Plain, name),
            Entity::ClassSingleton(name) => (EntityKind::ClassSingleton, name),
            Entity::ModuleSingleton(name) => (EntityKind::ModuleSingleton, name),
            Entity::InstanceSingleton(name) => (EntityKind::InstanceSingleton, name),
            Entity::OtherSingleton(name) => (EntityKind::OtherSingleton, name),
        };
        ResolvedEntity {
            kind,
            name: Arc::from(name.as_str()),
        }
    }
}

/// Sentinel distinguishing plain definers from the singleton flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Plain,
    ClassSingleton,
    ModuleSingleton,
    InstanceSingleton,
    OtherSingleton,
}

impl EntityKind {
    pub fn is_singleton(self) -> bool {
        self != EntityKind::Plain
    }
}

/// Canonical defining entity, cached on the method record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub kind: EntityKind,
    pub name: Arc<str>,
}

impl ResolvedEntity {
    /// Name used when displaying the owner of a method
    pub fn display_name(&self) -> String {
        match self.kind {
            EntityKind::Plain => self.name.to_string(),
            EntityKind::ClassSingleton => format!("<Class::{}>", self.name),
            EntityKind::ModuleSingleton => format!("<Module::{}>", self.name),
            EntityKind::InstanceSingleton => format!("<Object::{}>", self.name),
            EntityKind::OtherSingleton => format!("<{}>", self.name),
        }
    }
}

/// Opaque, stable identity of a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodKey(pub u64);

impl MethodKey {
    /// Derive the key from a resolved owner and member name
    pub fn new(owner: &ResolvedEntity, member: &str) -> Self {
        let mut hasher = FnvHasher::default();
        owner.kind.hash(&mut hasher);
        owner.name.hash(&mut hasher);
        member.hash(&mut hasher);
        MethodKey(hasher.finish())
    }

    /// Resolve an entity view and derive the key in one step
    pub fn of(entity: &Entity, member: &str) -> Self {
        Self::new(&entity.resolve(), member)
    }

    /// Next candidate when this key is already taken by another method
    pub(crate) fn next_candidate(self) -> Self {
        let mut hasher = FnvHasher::default();
        self.0.hash(&mut hasher);
        MethodKey(hasher.finish())
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
