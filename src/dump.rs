//! Profile dump and load
//!
//! A dump is a plain serde tree: per context, the method table in registry
//! order and the call-tree nodes in pre-order, each node naming its method
//! by table index and its parent by node index. Pre-order guarantees every
//! parent appears before its children, so loading is a single forward pass.

use crate::call_tree::{CallSite, CallTree, NodeId};
use crate::config::ProfileConfig;
use crate::entity::{MethodKey, ResolvedEntity};
use crate::error::{ProfileError, Result};
use crate::measurement::Measurement;
use crate::measurer::MeasureMode;
use crate::method::{Allocation, MethodId, MethodRecord, MethodRegistry, SourceLocation};
use crate::profile::ProfileSession;
use crate::thread::{ContextKey, ThreadContext};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Layout version written into every dump
pub const DUMP_VERSION: u32 = 1;

/// On-disk encoding of a dump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DumpFormat {
    #[default]
    Json,
    #[value(name = "msgpack")]
    MessagePack,
}

/// Complete profile of a stopped session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDump {
    pub version: u32,
    /// Crate version that wrote the dump
    pub callprof_version: String,
    pub measure_mode: MeasureMode,
    pub threads: Vec<ThreadDump>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadDump {
    pub thread_id: u64,
    pub fiber_id: u64,
    pub methods: Vec<MethodDump>,
    /// Call-tree nodes in pre-order
    pub nodes: Vec<NodeDump>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDump {
    pub key: MethodKey,
    pub owner: ResolvedEntity,
    pub member: String,
    #[serde(default)]
    pub source: Option<SourceLocation>,
    pub measurement: Measurement,
    pub recursive: bool,
    pub root: bool,
    pub excluded: bool,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDump {
    /// Index into the thread's `methods`
    pub method: usize,
    /// Index of the parent within `nodes`; None for roots
    #[serde(default)]
    pub parent: Option<usize>,
    pub measurement: Measurement,
    #[serde(default)]
    pub call_site: CallSite,
}

impl MethodDump {
    fn from_record(record: &MethodRecord) -> Self {
        let mut allocations: Vec<Allocation> = record.allocations().cloned().collect();
        allocations.sort_by(|a, b| {
            (&a.source_file, a.line, &a.class_name).cmp(&(&b.source_file, b.line, &b.class_name))
        });
        Self {
            key: record.key,
            owner: record.owner.clone(),
            member: record.member.to_string(),
            source: record.source.clone(),
            measurement: record.measurement,
            recursive: record.recursive,
            root: record.root,
            excluded: record.excluded,
            allocations,
        }
    }

    fn into_record(self) -> MethodRecord {
        let mut record = MethodRecord::new(self.key, self.owner, &self.member);
        record.source = self.source;
        record.measurement = self.measurement;
        record.recursive = self.recursive;
        record.root = self.root;
        record.excluded = self.excluded;
        for allocation in &self.allocations {
            record.merge_allocation(allocation);
        }
        record
    }
}

impl ThreadDump {
    pub fn from_context(context: &ThreadContext) -> Self {
        let methods = context
            .methods()
            .iter()
            .map(|(_, record)| MethodDump::from_record(record))
            .collect();

        let tree = context.call_tree();
        let order = tree.walk_all();
        let positions: FnvHashMap<NodeId, usize> =
            order.iter().enumerate().map(|(pos, &id)| (id, pos)).collect();
        let nodes = order
            .iter()
            .map(|&id| {
                let node = &tree[id];
                NodeDump {
                    method: node.method.0,
                    parent: node.parent.and_then(|p| positions.get(&p).copied()),
                    measurement: node.measurement,
                    call_site: node.call_site.clone(),
                }
            })
            .collect();

        Self {
            thread_id: context.thread_id(),
            fiber_id: context.fiber_id(),
            methods,
            nodes,
        }
    }

    pub fn into_context(self) -> Result<ThreadContext> {
        let key = ContextKey::new(self.thread_id, self.fiber_id);
        let mut registry = MethodRegistry::new();
        let method_ids: Vec<MethodId> = self
            .methods
            .into_iter()
            .map(|method| registry.insert(method.into_record()))
            .collect();

        let mut tree = CallTree::new();
        let mut node_ids: Vec<NodeId> = Vec::with_capacity(self.nodes.len());
        for (pos, node) in self.nodes.into_iter().enumerate() {
            let method = *method_ids.get(node.method).ok_or_else(|| {
                ProfileError::Serialization(format!(
                    "node {} refers to unknown method {}",
                    pos, node.method
                ))
            })?;
            let parent = match node.parent {
                Some(parent) if parent < pos => Some(node_ids[parent]),
                Some(parent) => {
                    return Err(ProfileError::Serialization(format!(
                        "node {} lists parent {} out of pre-order",
                        pos, parent
                    )))
                }
                None => None,
            };
            let id = tree.attach(parent, &mut registry, method, node.call_site);
            tree[id].measurement = node.measurement;
            node_ids.push(id);
        }

        Ok(ThreadContext::from_parts(key, registry, tree))
    }
}

impl ProfileDump {
    pub fn from_session(session: &ProfileSession) -> Self {
        Self {
            version: DUMP_VERSION,
            callprof_version: env!("CARGO_PKG_VERSION").to_string(),
            measure_mode: session.measure_mode(),
            threads: session
                .threads()
                .map(|(_, context)| ThreadDump::from_context(context))
                .collect(),
        }
    }

    /// Rebuild a stopped session holding the dumped contexts
    pub fn into_session(self) -> Result<ProfileSession> {
        self.check_version()?;
        let config = ProfileConfig {
            measure_mode: self.measure_mode,
            ..ProfileConfig::default()
        };
        let contexts = self
            .threads
            .into_iter()
            .map(ThreadDump::into_context)
            .collect::<Result<Vec<_>>>()?;
        ProfileSession::from_contexts(config, contexts)
    }

    fn check_version(&self) -> Result<()> {
        if self.version != DUMP_VERSION {
            return Err(ProfileError::Serialization(format!(
                "dump version mismatch: expected {}, found {}",
                DUMP_VERSION, self.version
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ProfileError::Serialization(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProfileError::Serialization(e.to_string()))
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| ProfileError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| ProfileError::Serialization(e.to_string()))
    }

    pub fn write_to(&self, writer: impl Write, format: DumpFormat) -> Result<()> {
        let mut writer = BufWriter::new(writer);
        match format {
            DumpFormat::Json => serde_json::to_writer_pretty(&mut writer, self)
                .map_err(|e| ProfileError::Serialization(e.to_string()))?,
            DumpFormat::MessagePack => rmp_serde::encode::write_named(&mut writer, self)
                .map_err(|e| ProfileError::Serialization(e.to_string()))?,
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_from(reader: impl Read, format: DumpFormat) -> Result<Self> {
        let reader = BufReader::new(reader);
        match format {
            DumpFormat::Json => serde_json::from_reader(reader)
                .map_err(|e| ProfileError::Serialization(e.to_string())),
            DumpFormat::MessagePack => rmp_serde::from_read(reader)
                .map_err(|e| ProfileError::Serialization(e.to_string())),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>, format: DumpFormat) -> Result<()> {
        self.write_to(File::create(path)?, format)
    }

    pub fn load(path: impl AsRef<Path>, format: DumpFormat) -> Result<Self> {
        Self::read_from(File::open(path)?, format)
    }
}

impl ProfileSession {
    /// Snapshot every traced context
    pub fn dump(&self) -> ProfileDump {
        ProfileDump::from_session(self)
    }

    pub fn from_dump(dump: ProfileDump) -> Result<Self> {
        dump.into_session()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::event::ProfileEvent;

    fn sample_session() -> ProfileSession {
        let mut s = ProfileSession::new(ProfileConfig {
            track_allocations: true,
            ..ProfileConfig::default()
        })
        .unwrap();
        s.start_at(0.0).unwrap();
        let obj = Entity::Plain("Obj".into());
        for event in [
            ProfileEvent::call(obj.clone(), "main").source("main.rb", 1).at(0.0),
            ProfileEvent::line("main.rb", 4).at(1.0),
            ProfileEvent::call(obj.clone(), "parse").source("main.rb", 10).at(2.0),
            ProfileEvent::allocation("String", 24, "main.rb", 11).at(3.0),
            ProfileEvent::ret().at(6.0),
            ProfileEvent::native_call(Entity::ClassSingleton("IO".into()), "read").at(7.0),
            ProfileEvent::native_ret().at(9.0),
            ProfileEvent::ret().at(12.0),
        ] {
            s.handle_event(&event).unwrap();
        }
        s.stop_at(12.0).unwrap();
        s
    }

    #[test]
    fn test_dump_layout_is_preorder() {
        let dump = sample_session().dump();
        assert_eq!(dump.version, DUMP_VERSION);
        let thread = &dump.threads[0];
        assert_eq!(thread.methods.len(), 3);
        assert_eq!(thread.nodes.len(), 3);
        assert_eq!(thread.nodes[0].parent, None);
        assert!(thread.nodes[1..].iter().all(|n| n.parent == Some(0)));
        assert_eq!(thread.nodes[1].call_site.line, 4);
        let parse = &thread.methods[thread.nodes[1].method];
        assert_eq!(parse.member, "parse");
        assert_eq!(parse.allocations.len(), 1);
    }

    #[test]
    fn test_json_round_trip_preserves_tree() {
        let original = sample_session().dump();
        let text = original.to_json().unwrap();
        let restored = ProfileSession::from_dump(ProfileDump::from_json(&text).unwrap()).unwrap();
        assert_eq!(restored.dump(), original);
    }

    #[test]
    fn test_msgpack_round_trip_through_file() {
        let original = sample_session().dump();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.msgpack");
        original.save(&path, DumpFormat::MessagePack).unwrap();
        let loaded = ProfileDump::load(&path, DumpFormat::MessagePack).unwrap();
        assert_eq!(loaded, original);

        let session = loaded.into_session().unwrap();
        let (_, ctx) = session.threads().next().unwrap();
        assert_eq!(ctx.total_time(), 12.0);
        for (_, record) in ctx.methods().iter() {
            assert_eq!(record.call_tree_nodes().len(), 1);
        }
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut dump = sample_session().dump();
        dump.version = 99;
        let err = dump.into_session().unwrap_err();
        assert!(err.to_string().contains("expected 1, found 99"));
    }

    #[test]
    fn test_out_of_order_parent_rejected() {
        let mut dump = sample_session().dump();
        dump.threads[0].nodes[0].parent = Some(2);
        assert!(matches!(
            dump.into_session(),
            Err(ProfileError::Serialization(_))
        ));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let mut dump = sample_session().dump();
        dump.threads[0].nodes[1].method = 42;
        assert!(dump.into_session().is_err());
    }

    #[test]
    fn test_garbage_input_is_serialization_error() {
        assert!(matches!(
            ProfileDump::from_json("{not json"),
            Err(ProfileError::Serialization(_))
        ));
        assert!(matches!(
            ProfileDump::from_msgpack(&[0xc1, 0x00]),
            Err(ProfileError::Serialization(_))
        ));
    }
}
