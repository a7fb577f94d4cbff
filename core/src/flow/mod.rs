//! Flow history graph
//!
//! An append-only DAG of nodes recording what an execution did. Nodes are
//! addressed by `NodeId`; the frontier is a set of heads keyed by `HeadId`.

pub mod bulk_storage;
pub mod file_storage;
pub mod graph;
pub mod storage;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Failure;

pub use bulk_storage::BulkNodeStorage;
pub use file_storage::NodeFileStorage;
pub use storage::{FlowNodeStorage, LockedStorage, StorageKind};

/* ===================== Identifiers ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeadId(pub u32);

impl fmt::Display for HeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/* ===================== Nodes ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeKind {
    FlowStart,
    FlowEnd { start: NodeId },
    /// A step without a body
    Atom,
    BlockStart { body: bool },
    BlockEnd { start: NodeId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: NodeId,
    pub parents: Vec<NodeId>,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    pub started_at: DateTime<Utc>,
}

impl FlowNode {
    pub fn new(id: NodeId, parents: Vec<NodeId>, kind: NodeKind) -> Self {
        Self {
            id,
            parents,
            kind,
            function_name: None,
            display_name: None,
            error: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_function(mut self, function: impl Into<String>, display: impl Into<String>) -> Self {
        self.function_name = Some(function.into());
        self.display_name = Some(display.into());
        self
    }

    pub fn with_error(mut self, error: Option<Failure>) -> Self {
        self.error = error;
        self
    }

    pub fn is_block_start(&self) -> bool {
        matches!(self.kind, NodeKind::BlockStart { .. })
    }
}

/// Extra data attached to a node (log lines, arguments, timing)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAction {
    pub kind: String,
    pub data: serde_json::Value,
}

impl NodeAction {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// A node with its actions, as kept on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredNode {
    pub node: FlowNode,
    #[serde(default)]
    pub actions: Vec<NodeAction>,
}

/* ===================== Result ===================== */

/// Aggregate result, ordered from best to worst
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowResult {
    #[default]
    Success,
    Unstable,
    Failure,
    NotBuilt,
    Aborted,
}

impl FlowResult {
    /// The worse of the two
    pub fn combine(self, other: FlowResult) -> FlowResult {
        self.max(other)
    }

    pub fn is_worse_or_equal(self, other: FlowResult) -> bool {
        self >= other
    }
}

impl fmt::Display for FlowResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowResult::Success => "SUCCESS",
            FlowResult::Unstable => "UNSTABLE",
            FlowResult::Failure => "FAILURE",
            FlowResult::NotBuilt => "NOT_BUILT",
            FlowResult::Aborted => "ABORTED",
        };
        write!(f, "{}", s)
    }
}
