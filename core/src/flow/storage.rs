//! Node storage contract and the lock shared with readers outside the lane

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::{FlowNode, NodeAction, NodeId};
use crate::error::{EngineError, EngineResult};

/// On-disk layout of the history graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// One file per node, durable after every step
    #[default]
    PerNode,
    /// Single file written on flush
    Bulk,
}

pub trait FlowNodeStorage: Send + Sync {
    fn get(&self, id: NodeId) -> EngineResult<Option<FlowNode>>;

    /// Store a node; with `defer_action_write` the write waits for `autopersist` or `flush`
    fn store(&mut self, node: &FlowNode, defer_action_write: bool) -> EngineResult<()>;

    fn flush(&mut self) -> EngineResult<()>;

    fn load_actions(&self, id: NodeId) -> EngineResult<Vec<NodeAction>>;

    fn save_actions(&mut self, id: NodeId, actions: Vec<NodeAction>) -> EngineResult<()>;

    /// Write a node stored with deferred action writes
    fn autopersist(&mut self, id: NodeId) -> EngineResult<()>;

    /// All nodes, in id order
    fn nodes(&self) -> EngineResult<Vec<FlowNode>>;

    fn kind(&self) -> StorageKind;
}

/* ===================== Locked Storage ===================== */

/// Reader/writer lock around the active storage
///
/// Reads may come from any thread while the lane writes; the storage itself
/// can be replaced wholesale (format migration) under the write lock.
pub struct LockedStorage {
    inner: RwLock<Box<dyn FlowNodeStorage>>,
}

impl LockedStorage {
    pub fn new(storage: Box<dyn FlowNodeStorage>) -> Self {
        Self {
            inner: RwLock::new(storage),
        }
    }

    pub fn get(&self, id: NodeId) -> EngineResult<Option<FlowNode>> {
        self.inner.read().get(id)
    }

    /// Like `get`, but a missing node is an error
    pub fn node(&self, id: NodeId) -> EngineResult<FlowNode> {
        self.get(id)?.ok_or(EngineError::MissingNode(id))
    }

    pub fn store(&self, node: &FlowNode, defer_action_write: bool) -> EngineResult<()> {
        self.inner.write().store(node, defer_action_write)
    }

    pub fn flush(&self) -> EngineResult<()> {
        self.inner.write().flush()
    }

    pub fn load_actions(&self, id: NodeId) -> EngineResult<Vec<NodeAction>> {
        self.inner.read().load_actions(id)
    }

    pub fn save_actions(&self, id: NodeId, actions: Vec<NodeAction>) -> EngineResult<()> {
        self.inner.write().save_actions(id, actions)
    }

    pub fn autopersist(&self, id: NodeId) -> EngineResult<()> {
        self.inner.write().autopersist(id)
    }

    pub fn nodes(&self) -> EngineResult<Vec<FlowNode>> {
        self.inner.read().nodes()
    }

    pub fn kind(&self) -> StorageKind {
        self.inner.read().kind()
    }

    /// Replace the storage, returning the previous one
    pub fn swap(&self, storage: Box<dyn FlowNodeStorage>) -> Box<dyn FlowNodeStorage> {
        std::mem::replace(&mut *self.inner.write(), storage)
    }
}

/* ===================== JSON Files ===================== */

/// Write JSON atomically (write to temp, then rename)
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);
    fs::write(tmp_path, &bytes)?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

/// Read JSON, `None` if the file does not exist
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> EngineResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
