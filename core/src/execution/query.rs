use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use tracing::warn;

use super::{ExecutionRecord, FlowExecution, LoadState};
use crate::engine::{StepExecutionInfo, ThreadDump};
use crate::error::{EngineError, EngineResult, Failure};
use crate::flow::{FlowNode, FlowResult};

impl FlowExecution {
    pub fn is_complete(&self) -> bool {
        self.record.lock().done
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Whether the execution could carry on after a process restart
    pub fn is_resumable(&self) -> bool {
        let record = self.record.lock();
        !record.done && (record.durability.persists_when_idle() || record.clean)
    }

    pub fn is_loading(&self) -> bool {
        *self.state.borrow() == LoadState::Loading
    }

    pub fn load_state(&self) -> LoadState {
        self.state.borrow().clone()
    }

    pub fn result(&self) -> Option<FlowResult> {
        self.record.lock().result
    }

    /// Failure carried by the end node, if the program failed
    pub fn error(&self) -> Option<Failure> {
        self.record.lock().error.clone()
    }

    pub fn threads_created(&self) -> u32 {
        self.record.lock().threads_created
    }

    /// Step calls made so far, by function name
    pub fn internal_calls(&self) -> BTreeMap<String, u64> {
        self.record.lock().internal_calls.clone()
    }

    pub fn loaded_scripts(&self) -> BTreeMap<String, String> {
        self.record.lock().loaded_scripts.clone()
    }

    pub fn record(&self) -> ExecutionRecord {
        self.record.lock().clone()
    }

    /// Tips of the history graph, in head order
    pub fn current_heads(&self) -> Vec<FlowNode> {
        let tips: Vec<_> = self.record.lock().heads.values().copied().collect();
        tips.into_iter()
            .filter_map(|tip| match self.storage.node(tip) {
                Ok(node) => Some(node),
                Err(err) => {
                    warn!(execution = %self.id, node = %tip, error = %err, "Head node is unreadable");
                    None
                }
            })
            .collect()
    }

    pub fn nodes(&self) -> EngineResult<Vec<FlowNode>> {
        self.storage.nodes()
    }

    /// Running steps; with `innermost_only`, leave out steps whose blocks
    /// contain another running step
    pub async fn current_executions(&self, innermost_only: bool) -> EngineResult<Vec<StepExecutionInfo>> {
        if self.is_complete() {
            return Ok(Vec::new());
        }
        let lane = self.lane().ok_or(EngineError::ProgramNotReady)?;
        lane.query(move |group| group.step_infos(innermost_only)).await
    }

    /// Point-in-time view of every thread
    ///
    /// While loading, reports the pickles still being resolved. Bounded by the
    /// thread dump timeout.
    pub async fn thread_dump(&self) -> EngineResult<ThreadDump> {
        match self.load_state() {
            LoadState::Loading => return Ok(ThreadDump::loading(self.pending_pickles.lock().clone())),
            LoadState::Finished | LoadState::Created => return Ok(ThreadDump::default()),
            LoadState::Ready => {}
        }
        let lane = self.lane().ok_or(EngineError::ProgramNotReady)?;
        let timeout = self.engine.config().thread_dump_timeout();
        tokio::time::timeout(timeout, lane.query(|group| group.dump()))
            .await
            .map_err(|_| EngineError::Timeout("thread dump".to_string()))?
    }

    /// Wait until the execution is finished and return its result
    pub async fn wait_for_completion(&self) -> FlowResult {
        let mut state = self.state.subscribe();
        if state.wait_for(|s| *s == LoadState::Finished).await.is_err() {
            warn!(execution = %self.id, "State channel closed before completion");
        }
        self.result().unwrap_or(FlowResult::Failure)
    }
}
