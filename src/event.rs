//! Typed events delivered by the external event source
//!
//! One event per observed call, return, line or allocation. Every event
//! carries the identity of the thread and fiber it was raised on plus the
//! measurer sample taken when it fired.

use crate::entity::Entity;
use serde::{Deserialize, Serialize};

/// Kind of observed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Call,
    Return,
    /// Call into a method with no source location (foreign/native code)
    NativeCall,
    NativeReturn,
    /// Execution moved to a new source line
    Line,
    /// An object was allocated
    Allocation,
}

impl EventKind {
    pub fn is_call(self) -> bool {
        matches!(self, EventKind::Call | EventKind::NativeCall)
    }

    pub fn is_return(self) -> bool {
        matches!(self, EventKind::Return | EventKind::NativeReturn)
    }
}

/// Object allocated by an allocation event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatedObject {
    /// Name of the allocated object's type
    pub class_name: String,
    /// Size of the object in bytes
    #[serde(default)]
    pub size: u64,
}

/// One event from the event source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEvent {
    pub kind: EventKind,
    #[serde(default)]
    pub thread_id: u64,
    #[serde(default)]
    pub fiber_id: u64,
    /// Raw measurer sample taken when the event fired
    pub measurement: f64,
    /// Entity the method was dispatched through (call events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Entity>,
    /// Member name of the method (call events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    /// Source file of the event, absent for native calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default)]
    pub line: u32,
    /// Allocated object (allocation events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocatedObject>,
}

impl ProfileEvent {
    fn bare(kind: EventKind) -> Self {
        Self {
            kind,
            thread_id: 0,
            fiber_id: 0,
            measurement: 0.0,
            entity: None,
            member: None,
            source_file: None,
            line: 0,
            allocation: None,
        }
    }

    /// Call into a method defined in source
    pub fn call(entity: Entity, member: impl Into<String>) -> Self {
        Self {
            entity: Some(entity),
            member: Some(member.into()),
            ..Self::bare(EventKind::Call)
        }
    }

    /// Call into a native method
    pub fn native_call(entity: Entity, member: impl Into<String>) -> Self {
        Self {
            entity: Some(entity),
            member: Some(member.into()),
            ..Self::bare(EventKind::NativeCall)
        }
    }

    pub fn ret() -> Self {
        Self::bare(EventKind::Return)
    }

    pub fn native_ret() -> Self {
        Self::bare(EventKind::NativeReturn)
    }

    /// Execution reached `line` of `file`
    pub fn line(file: impl Into<String>, line: u32) -> Self {
        Self {
            source_file: Some(file.into()),
            line,
            ..Self::bare(EventKind::Line)
        }
    }

    /// An object of `class_name` was allocated at `file:line`
    pub fn allocation(
        class_name: impl Into<String>,
        size: u64,
        file: impl Into<String>,
        line: u32,
    ) -> Self {
        Self {
            source_file: Some(file.into()),
            line,
            allocation: Some(AllocatedObject {
                class_name: class_name.into(),
                size,
            }),
            ..Self::bare(EventKind::Allocation)
        }
    }

    /// Set the source location
    pub fn source(mut self, file: impl Into<String>, line: u32) -> Self {
        self.source_file = Some(file.into());
        self.line = line;
        self
    }

    /// Set the thread and fiber the event was raised on
    pub fn on(mut self, thread_id: u64, fiber_id: u64) -> Self {
        self.thread_id = thread_id;
        self.fiber_id = fiber_id;
        self
    }

    /// Set the measurer sample
    pub fn at(mut self, measurement: f64) -> Self {
        self.measurement = measurement;
        self
    }
}
