//! The persisted execution record
//!
//! The record refers to history and threads only by id, so it stays small and
//! loads independently of the serialized program.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::DurabilityHint;
use crate::error::Failure;
use crate::flow::{FlowResult, HeadId, NodeId, StorageKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub script_name: String,
    pub script: String,
    /// sha256 of `script`, checked before a saved program is restored
    pub script_hash: String,
    /// Extra script text loaded at run time, replayed after a restart
    #[serde(default)]
    pub loaded_scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub sandbox: bool,
    pub result: Option<FlowResult>,
    #[serde(default)]
    pub done: bool,
    pub flow_start: Option<NodeId>,
    /// Open block starts, innermost last
    #[serde(default)]
    pub start_nodes: Vec<NodeId>,
    #[serde(default)]
    pub heads: BTreeMap<HeadId, NodeId>,
    pub next_node_id: u64,
    pub next_head_id: u32,
    #[serde(default)]
    pub threads_created: u32,
    #[serde(default)]
    pub internal_calls: BTreeMap<String, u64>,
    #[serde(default)]
    pub durability: DurabilityHint,
    #[serde(default)]
    pub paused: bool,
    /// Whether the last checkpoint fully succeeded
    #[serde(default)]
    pub clean: bool,
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn new(script_name: &str, script: &str, durability: DurabilityHint, sandbox: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            script_name: script_name.to_string(),
            script: script.to_string(),
            script_hash: script_hash(script),
            loaded_scripts: BTreeMap::new(),
            sandbox,
            result: None,
            done: false,
            flow_start: None,
            start_nodes: Vec::new(),
            heads: BTreeMap::new(),
            next_node_id: 1,
            next_head_id: 1,
            threads_created: 0,
            internal_calls: BTreeMap::new(),
            durability,
            paused: false,
            clean: true,
            storage: storage_for(durability),
            causes: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn allocate_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    pub fn allocate_head_id(&mut self) -> HeadId {
        let id = HeadId(self.next_head_id);
        self.next_head_id += 1;
        id
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the stored script still matches its fingerprint
    pub fn script_matches(&self) -> bool {
        script_hash(&self.script) == self.script_hash
    }
}

pub fn script_hash(script: &str) -> String {
    format!("{:x}", Sha256::digest(script.as_bytes()))
}

/// Storage layout used while an execution runs
pub(crate) fn storage_for(durability: DurabilityHint) -> StorageKind {
    match durability {
        DurabilityHint::PerformanceOptimized => StorageKind::Bulk,
        _ => StorageKind::PerNode,
    }
}
