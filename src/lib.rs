//! callprof - call-stack profiling engine
//!
//! This library turns a stream of call, return, line and allocation events
//! into per-thread call trees with self, wait and total cost per method and
//! per call path, with pause/resume, thread/fiber switch accounting and
//! method exclusion.

pub mod alloc_counter;
pub mod call_tree;
pub mod cli;
pub mod config;
pub mod dump;
pub mod entity;
pub mod error;
pub mod event;
pub mod filter;
pub mod measurement;
pub mod measurer;
pub mod method;
pub mod profile;
pub mod stack;
pub mod thread;

pub use call_tree::{AggregateEdge, CallSite, CallTree, CallTreeNode, NodeId};
pub use config::ProfileConfig;
pub use dump::{DumpFormat, ProfileDump};
pub use entity::{Entity, EntityKind, MethodKey, ResolvedEntity};
pub use error::{ProfileError, Result};
pub use event::{AllocatedObject, EventKind, ProfileEvent};
pub use filter::{MethodExclusions, ThreadFilter};
pub use measurement::Measurement;
pub use measurer::{MeasureMode, Measurer};
pub use method::{Allocation, MethodId, MethodRecord, MethodRegistry, SourceLocation};
pub use profile::{ProfileSession, SessionState};
pub use stack::{Frame, Stack};
pub use thread::{ContextHandle, ContextKey, ThreadContext, ThreadTable};
