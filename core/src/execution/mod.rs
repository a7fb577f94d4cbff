// Flow execution module
//
// This module owns the life cycle of one script run:
// - Creating and starting executions
// - Recording history (heads, block starts, node actions)
// - Checkpointing, pausing, suspending and loading after a restart
// - Interrupts and scoped cancellation
// - Introspection (heads, running steps, thread dumps)

mod interrupt;
mod lifecycle;
mod persist;
mod query;
pub mod record;

#[cfg(test)]
mod tests;

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::lane::{Job, LaneHandle};
use crate::engine::{Engine, Pickle, SandboxPolicy, ThreadId};
use crate::error::{EngineError, EngineResult};
use crate::flow::{FlowNode, HeadId, LockedStorage, NodeAction, NodeId, NodeKind};
use crate::owner::{FlowExecutionOwner, TaskListener};
use crate::script::{Closure, Val};

pub use lifecycle::StartOptions;
pub use record::ExecutionRecord;

/// Where the execution is in its life cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    /// Created but not started
    Created,
    /// Restoring a saved program
    Loading,
    Ready,
    Finished,
}

pub struct FlowExecution {
    id: Uuid,
    engine: Engine,
    owner: Arc<dyn FlowExecutionOwner>,
    record: Mutex<ExecutionRecord>,
    storage: LockedStorage,
    lane: Mutex<Option<LaneHandle>>,
    state: watch::Sender<LoadState>,
    /// Best effort: true while the lane is running a turn
    busy: AtomicBool,
    paused: AtomicBool,
    /// Set once the execution is being suspended or has failed fatally
    halted: AtomicBool,
    pending_pickles: Arc<Mutex<Vec<Pickle>>>,
    live_objects: Mutex<BTreeMap<Pickle, Val>>,
    load_cancel: CancellationToken,
    runtime: Handle,
}

impl FlowExecution {
    fn new(
        engine: Engine,
        owner: Arc<dyn FlowExecutionOwner>,
        record: ExecutionRecord,
        storage: LockedStorage,
        state: LoadState,
    ) -> EngineResult<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|e| EngineError::NoRuntime(e.to_string()))?;
        let (state, _) = watch::channel(state);
        Ok(Arc::new(Self {
            id: record.id,
            engine,
            owner,
            paused: AtomicBool::new(record.paused),
            record: Mutex::new(record),
            storage,
            lane: Mutex::new(None),
            state,
            busy: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            pending_pickles: Arc::new(Mutex::new(Vec::new())),
            live_objects: Mutex::new(BTreeMap::new()),
            load_cancel: CancellationToken::new(),
            runtime,
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn owner(&self) -> &Arc<dyn FlowExecutionOwner> {
        &self.owner
    }

    pub fn storage(&self) -> &LockedStorage {
        &self.storage
    }

    pub fn listener(&self) -> Arc<dyn TaskListener> {
        self.owner.listener()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    /// Checked by the scheduler between thread advances
    pub(crate) fn should_yield(&self) -> bool {
        self.paused.load(Ordering::Acquire) || self.halted.load(Ordering::Acquire)
    }

    fn lane(&self) -> Option<LaneHandle> {
        self.lane.lock().clone()
    }

    /// Queue work on the lane
    pub(crate) fn submit(&self, job: Job) {
        match self.lane() {
            Some(lane) => {
                if lane.submit(job).is_err() {
                    tracing::warn!(execution = %self.id, "Lane closed; dropping job");
                }
            }
            None => tracing::warn!(execution = %self.id, "No lane; dropping job"),
        }
    }

    pub(crate) fn sandbox_policy(&self) -> Option<Arc<dyn SandboxPolicy>> {
        if self.record.lock().sandbox {
            self.engine.sandbox()
        } else {
            None
        }
    }

    /* ===================== Counters ===================== */

    pub(crate) fn allocate_thread_id(&self) -> ThreadId {
        let mut record = self.record.lock();
        record.threads_created += 1;
        ThreadId(record.threads_created)
    }

    pub(crate) fn record_internal_call(&self, function: &str) {
        *self
            .record
            .lock()
            .internal_calls
            .entry(function.to_string())
            .or_insert(0) += 1;
    }

    /* ===================== History ===================== */

    /// Append a node after the tip of `head` and advance the head
    pub(crate) fn append_node(
        &self,
        head: HeadId,
        kind: NodeKind,
        function: Option<(&str, String)>,
    ) -> EngineResult<NodeId> {
        let mut record = self.record.lock();
        if record.done {
            return Err(EngineError::AlreadyComplete);
        }
        let parent = *record.heads.get(&head).ok_or(EngineError::MissingHead(head))?;
        let id = record.allocate_node_id();
        let mut node = FlowNode::new(id, vec![parent], kind);
        if let Some((function, display)) = function {
            node = node.with_function(function, display);
        }
        self.storage
            .store(&node, record.durability.defers_action_writes())?;
        record.heads.insert(head, id);
        if node.is_block_start() {
            record.start_nodes.push(id);
        }
        record.touch();
        Ok(id)
    }

    /// New head starting at the current tip of `head`
    pub(crate) fn fork_head(&self, head: HeadId) -> EngineResult<HeadId> {
        let mut record = self.record.lock();
        let tip = *record.heads.get(&head).ok_or(EngineError::MissingHead(head))?;
        let forked = record.allocate_head_id();
        record.heads.insert(forked, tip);
        Ok(forked)
    }

    /// Remove a head, returning its tip
    pub(crate) fn close_branch(&self, head: HeadId) -> EngineResult<NodeId> {
        self.record
            .lock()
            .heads
            .remove(&head)
            .ok_or(EngineError::MissingHead(head))
    }

    pub fn head_tip(&self, head: HeadId) -> Option<NodeId> {
        self.record.lock().heads.get(&head).copied()
    }

    /// Close the block opened at `start`
    ///
    /// The end node joins `tips` when branches were merged, otherwise it
    /// follows the tip of `head`.
    pub(crate) fn close_block(
        &self,
        head: HeadId,
        start: NodeId,
        tips: Vec<NodeId>,
        error: Option<crate::error::Failure>,
    ) -> EngineResult<NodeId> {
        let mut record = self.record.lock();
        if record.done {
            return Err(EngineError::AlreadyComplete);
        }
        let parents = if tips.is_empty() {
            vec![*record.heads.get(&head).ok_or(EngineError::MissingHead(head))?]
        } else {
            tips
        };
        let defer = record.durability.defers_action_writes();

        let mut start_node = self.storage.node(start)?;
        if error.is_some() {
            start_node.error = error.clone();
            self.storage.store(&start_node, defer)?;
        }

        let id = record.allocate_node_id();
        let mut end = FlowNode::new(id, parents, NodeKind::BlockEnd { start }).with_error(error);
        end.function_name = start_node.function_name.clone();
        end.display_name = start_node.display_name.clone();
        self.storage.store(&end, defer)?;
        self.storage.autopersist(start)?;
        self.storage.autopersist(id)?;

        record.heads.insert(head, id);
        if let Some(pos) = record.start_nodes.iter().rposition(|n| *n == start) {
            record.start_nodes.remove(pos);
        }
        record.touch();
        Ok(id)
    }

    /// Record the outcome of a step without a block
    pub(crate) fn close_atom(
        &self,
        node: NodeId,
        error: Option<crate::error::Failure>,
    ) -> EngineResult<()> {
        let defer = self.record.lock().durability.defers_action_writes();
        if error.is_some() {
            let updated = self.storage.node(node)?.with_error(error);
            self.storage.store(&updated, defer)?;
        }
        self.storage.autopersist(node)
    }

    pub fn add_node_action(&self, node: NodeId, action: NodeAction) -> EngineResult<()> {
        let mut actions = self.storage.load_actions(node)?;
        actions.push(action);
        self.storage.save_actions(node, actions)
    }

    /* ===================== Scripts & Live Objects ===================== */

    /// Compile extra script text as a body, remembering it for replay
    pub(crate) fn load_script(&self, name: &str, source: &str) -> EngineResult<Closure> {
        let closure = self.engine.runtime().load_body(name, source)?;
        let mut record = self.record.lock();
        record
            .loaded_scripts
            .insert(name.to_string(), source.to_string());
        record.touch();
        Ok(closure)
    }

    pub(crate) fn live_object(&self, pickle: &Pickle) -> Option<Val> {
        self.live_objects.lock().get(pickle).cloned()
    }

    pub(crate) fn bind_live_object(&self, pickle: Pickle, value: Val) {
        self.live_objects.lock().insert(pickle, value);
    }

    fn save_record(&self) -> EngineResult<()> {
        let record = {
            let mut record = self.record.lock();
            record.touch();
            record.clone()
        };
        self.owner.save(&record)
    }
}
