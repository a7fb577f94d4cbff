//! One JSON file per node

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::storage::{read_json, write_json_atomic, FlowNodeStorage, StorageKind};
use super::{FlowNode, NodeAction, NodeId, StoredNode};
use crate::error::EngineResult;

/// Per-node storage under `<dir>/<id>.json`
///
/// Nodes stored with deferred action writes stay in memory until
/// `autopersist` or `flush`.
pub struct NodeFileStorage {
    dir: PathBuf,
    cache: BTreeMap<NodeId, StoredNode>,
    deferred: BTreeSet<NodeId>,
}

impl NodeFileStorage {
    pub fn open(dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            cache: BTreeMap::new(),
            deferred: BTreeSet::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: NodeId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn read(&self, id: NodeId) -> EngineResult<Option<StoredNode>> {
        if let Some(stored) = self.cache.get(&id) {
            return Ok(Some(stored.clone()));
        }
        read_json(&self.path(id))
    }

    fn write(&self, id: NodeId) -> EngineResult<()> {
        if let Some(stored) = self.cache.get(&id) {
            write_json_atomic(&self.path(id), stored)?;
        }
        Ok(())
    }
}

impl FlowNodeStorage for NodeFileStorage {
    fn get(&self, id: NodeId) -> EngineResult<Option<FlowNode>> {
        Ok(self.read(id)?.map(|stored| stored.node))
    }

    fn store(&mut self, node: &FlowNode, defer_action_write: bool) -> EngineResult<()> {
        let actions = match self.read(node.id)? {
            Some(existing) => existing.actions,
            None => Vec::new(),
        };
        self.cache.insert(
            node.id,
            StoredNode {
                node: node.clone(),
                actions,
            },
        );
        if defer_action_write {
            self.deferred.insert(node.id);
            Ok(())
        } else {
            self.deferred.remove(&node.id);
            self.write(node.id)
        }
    }

    fn flush(&mut self) -> EngineResult<()> {
        let deferred = std::mem::take(&mut self.deferred);
        for id in deferred {
            self.write(id)?;
        }
        Ok(())
    }

    fn load_actions(&self, id: NodeId) -> EngineResult<Vec<NodeAction>> {
        Ok(self.read(id)?.map(|stored| stored.actions).unwrap_or_default())
    }

    fn save_actions(&mut self, id: NodeId, actions: Vec<NodeAction>) -> EngineResult<()> {
        let Some(mut stored) = self.read(id)? else {
            return Err(crate::error::EngineError::MissingNode(id));
        };
        stored.actions = actions;
        self.cache.insert(id, stored);
        if self.deferred.contains(&id) {
            return Ok(());
        }
        self.write(id)
    }

    fn autopersist(&mut self, id: NodeId) -> EngineResult<()> {
        if self.deferred.remove(&id) {
            self.write(id)?;
        }
        Ok(())
    }

    fn nodes(&self) -> EngineResult<Vec<FlowNode>> {
        let mut ids: BTreeSet<NodeId> = self.cache.keys().copied().collect();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.insert(NodeId(id));
            }
        }
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.get(id)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    fn kind(&self) -> StorageKind {
        StorageKind::PerNode
    }
}
