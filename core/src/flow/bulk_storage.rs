//! All nodes in a single file

use std::collections::BTreeMap;
use std::path::PathBuf;

use super::storage::{read_json, write_json_atomic, FlowNodeStorage, StorageKind};
use super::{FlowNode, NodeAction, NodeId, StoredNode};
use crate::error::{EngineError, EngineResult};

/// Read-optimised storage: the whole graph lives in memory and is written on `flush`
pub struct BulkNodeStorage {
    path: PathBuf,
    nodes: BTreeMap<NodeId, StoredNode>,
    dirty: bool,
}

impl BulkNodeStorage {
    /// Open, reading existing content if the file is present
    pub fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let nodes: Vec<StoredNode> = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            nodes: nodes.into_iter().map(|s| (s.node.id, s)).collect(),
            dirty: false,
        })
    }

    /// Start empty, replacing whatever the file held on the next flush
    pub fn fresh(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            nodes: BTreeMap::new(),
            dirty: true,
        }
    }
}

impl FlowNodeStorage for BulkNodeStorage {
    fn get(&self, id: NodeId) -> EngineResult<Option<FlowNode>> {
        Ok(self.nodes.get(&id).map(|s| s.node.clone()))
    }

    fn store(&mut self, node: &FlowNode, _defer_action_write: bool) -> EngineResult<()> {
        let entry = self.nodes.entry(node.id).or_insert_with(|| StoredNode {
            node: node.clone(),
            actions: Vec::new(),
        });
        entry.node = node.clone();
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> EngineResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let nodes: Vec<&StoredNode> = self.nodes.values().collect();
        write_json_atomic(&self.path, &nodes)?;
        self.dirty = false;
        Ok(())
    }

    fn load_actions(&self, id: NodeId) -> EngineResult<Vec<NodeAction>> {
        Ok(self
            .nodes
            .get(&id)
            .map(|s| s.actions.clone())
            .unwrap_or_default())
    }

    fn save_actions(&mut self, id: NodeId, actions: Vec<NodeAction>) -> EngineResult<()> {
        let stored = self.nodes.get_mut(&id).ok_or(EngineError::MissingNode(id))?;
        stored.actions = actions;
        self.dirty = true;
        Ok(())
    }

    fn autopersist(&mut self, _id: NodeId) -> EngineResult<()> {
        Ok(())
    }

    fn nodes(&self) -> EngineResult<Vec<FlowNode>> {
        Ok(self.nodes.values().map(|s| s.node.clone()).collect())
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Bulk
    }
}
