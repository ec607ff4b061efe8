//! Thread and method filters
//!
//! Thread filters are consulted once, when a thread context is created.
//! Method exclusions are consulted once, when a method record is created.
//!
//! Thread filter expressions accepted by [`ThreadFilter::from_expr`]:
//! - `include=1,2,3` profile only these threads
//! - `exclude=4,5` profile every thread except these

use crate::entity::{Entity, MethodKey, ResolvedEntity};
use crate::error::{ProfileError, Result};
use fnv::FnvHashSet;
use std::collections::HashSet;
use std::sync::Arc;

/// Decides which threads are traced
#[derive(Debug, Clone, Default)]
pub struct ThreadFilter {
    /// Threads to trace (None = no include restriction)
    include: Option<HashSet<u64>>,
    /// Threads never traced (None = no exclusions)
    exclude: Option<HashSet<u64>>,
}

impl ThreadFilter {
    /// A filter that traces every thread
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(include: Option<Vec<u64>>, exclude: Option<Vec<u64>>) -> Self {
        Self {
            include: include.map(|ids| ids.into_iter().collect()),
            exclude: exclude.map(|ids| ids.into_iter().collect()),
        }
    }

    /// Parse an expression like "include=1,2" or "exclude=3"
    pub fn from_expr(expr: &str) -> Result<Self> {
        if let Some(spec) = expr.strip_prefix("include=") {
            Ok(Self::new(Some(Self::parse_ids(spec)?), None))
        } else if let Some(spec) = expr.strip_prefix("exclude=") {
            Ok(Self::new(None, Some(Self::parse_ids(spec)?)))
        } else {
            Err(ProfileError::InvalidConfig(format!(
                "Invalid thread filter expression: {}. Expected include=IDS or exclude=IDS",
                expr
            )))
        }
    }

    fn parse_ids(spec: &str) -> Result<Vec<u64>> {
        spec.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u64>().map_err(|_| {
                    ProfileError::InvalidConfig(format!("Invalid thread id: {}", part))
                })
            })
            .collect()
    }

    /// Check if events from a thread should be recorded
    ///
    /// An include set takes precedence: threads outside it are never traced.
    /// Threads inside it are still dropped if also named in the exclude set.
    pub fn should_trace(&self, thread_id: u64) -> bool {
        if let Some(include) = &self.include {
            if !include.contains(&thread_id) {
                return false;
            }
        }
        match &self.exclude {
            Some(exclude) => !exclude.contains(&thread_id),
            None => true,
        }
    }
}

/// Methods whose cost is folded into their nearest real caller
///
/// Matched on the resolved owner and member, never on the hashed key alone.
#[derive(Debug, Clone, Default)]
pub struct MethodExclusions {
    keys: FnvHashSet<(ResolvedEntity, Arc<str>)>,
}

impl MethodExclusions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method as excluded
    pub fn insert(&mut self, entity: &Entity, member: &str) -> MethodKey {
        let owner = entity.resolve();
        let key = MethodKey::new(&owner, member);
        self.keys.insert((owner, Arc::from(member)));
        key
    }

    pub fn contains(&self, owner: &ResolvedEntity, member: &str) -> bool {
        self.keys.contains(&(owner.clone(), Arc::from(member)))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
