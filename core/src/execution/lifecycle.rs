use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::record::ExecutionRecord;
use super::{FlowExecution, LoadState};
use crate::config::DurabilityHint;
use crate::engine::continuation::Outcome;
use crate::engine::{lane, Engine, ThreadGroup};
use crate::error::{codes, EngineResult, Failure};
use crate::flow::{FlowNode, FlowNodeStorage, FlowResult, LockedStorage, NodeKind, StorageKind};
use crate::owner::FlowExecutionOwner;

/// Options for a new execution; unset fields fall back to the engine config
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub script_name: Option<String>,
    pub durability: Option<DurabilityHint>,
    pub sandbox: Option<bool>,
}

impl FlowExecution {
    /// Create an execution for `script` without running anything
    pub fn create(
        engine: Engine,
        owner: Arc<dyn FlowExecutionOwner>,
        script: &str,
        options: StartOptions,
    ) -> EngineResult<Arc<Self>> {
        let config = engine.config();
        let durability = options.durability.unwrap_or(config.durability);
        let sandbox = options.sandbox.unwrap_or(config.sandbox);
        let script_name = options.script_name.unwrap_or_else(|| "Script1".to_string());

        let record = ExecutionRecord::new(&script_name, script, durability, sandbox);
        let storage = LockedStorage::new(owner.open_storage(record.storage)?);
        Self::new(engine, owner, record, storage, LoadState::Created)
    }

    /// Compile the script, write the first node and schedule the root thread
    ///
    /// Returns once the work is scheduled. A script that does not compile ends
    /// the execution with a failure instead of an error here.
    pub fn start(self: &Arc<Self>) -> EngineResult<()> {
        let (name, script) = {
            let record = self.record.lock();
            if record.done || record.flow_start.is_some() {
                return Err(crate::error::EngineError::AlreadyComplete);
            }
            (record.script_name.clone(), record.script.clone())
        };
        let compiled = self.engine.runtime().compile(&name, &script);

        let head = {
            let mut record = self.record.lock();
            let head = record.allocate_head_id();
            let id = record.allocate_node_id();
            self.storage
                .store(&FlowNode::new(id, Vec::new(), NodeKind::FlowStart), false)?;
            record.flow_start = Some(id);
            record.heads.insert(head, id);
            head
        };
        self.listener().log(&format!("Started {}", self.owner.executable()));
        info!(execution = %self.id, script = %name, "Starting execution");

        let continuation = match compiled {
            Ok(continuation) => continuation,
            Err(err) => {
                warn!(execution = %self.id, error = %err, "Script failed to compile");
                self.listener().log(&err.to_string());
                self.finish(Err(Failure::new(codes::SCRIPT_ERROR, err.to_string())));
                return Ok(());
            }
        };

        let (handle, inbox) = lane::channel();
        let mut group = ThreadGroup::new(Arc::clone(self));
        group.start_root(continuation, head)?;
        *self.lane.lock() = Some(handle.clone());
        self.storage.flush()?;
        self.save_record()?;

        self.state.send_replace(LoadState::Ready);
        lane::spawn(self, group, inbox);
        if !self.is_paused() {
            handle.schedule_run()?;
        }
        Ok(())
    }

    /// Called by the thread group once the last thread is gone
    pub(crate) fn on_program_end(&self, outcome: Outcome) {
        self.finish(outcome);
    }

    /// Fatal path: end the execution with `failure` over whatever history exists
    ///
    /// Never fails; problems are logged.
    pub(crate) fn croak(&self, failure: Failure) {
        error!(execution = %self.id, failure = %failure, "Execution failed");
        self.halted.store(true, Ordering::Release);
        self.load_cancel.cancel();
        self.finish(Err(failure));
    }

    /// Collapse the heads into the end node, persist, and mark the execution done
    pub(crate) fn finish(&self, outcome: Outcome) {
        let error = outcome.err();
        let result = match &error {
            None => FlowResult::Success,
            Some(failure) if failure.is_interrupted() => FlowResult::Aborted,
            Some(_) => FlowResult::Failure,
        };

        let result = match self.write_end(result, error) {
            Ok(Some(result)) => result,
            Ok(None) => return,
            Err(err) => {
                error!(execution = %self.id, error = %err, "Failed to record the end of the execution");
                let mut record = self.record.lock();
                record.done = true;
                let result = record.result.map_or(FlowResult::Failure, |r| r.combine(FlowResult::Failure));
                record.result = Some(result);
                result
            }
        };

        if let Some(lane) = self.lane.lock().take() {
            lane.shutdown();
        }
        self.listener().log(&format!("Finished: {}", result));
        info!(execution = %self.id, result = %result, "Execution finished");
        self.state.send_replace(LoadState::Finished);
    }

    /// Returns the final result, or `None` if the execution was already done
    fn write_end(&self, result: FlowResult, error: Option<Failure>) -> EngineResult<Option<FlowResult>> {
        let result = {
            let mut record = self.record.lock();
            if record.done {
                return Ok(None);
            }
            let result = record.result.map_or(result, |r| r.combine(result));
            record.result = Some(result);
            record.error = error.clone();

            let start = match record.flow_start {
                Some(start) => start,
                None => {
                    let id = record.allocate_node_id();
                    self.storage
                        .store(&FlowNode::new(id, Vec::new(), NodeKind::FlowStart), false)?;
                    record.flow_start = Some(id);
                    id
                }
            };
            let mut parents: Vec<_> = record.heads.values().copied().collect();
            if parents.is_empty() {
                parents.push(start);
            }
            let first_head = record.heads.keys().next().copied();
            let head = match first_head {
                Some(head) => head,
                None => record.allocate_head_id(),
            };
            let id = record.allocate_node_id();
            let end = FlowNode::new(id, parents, NodeKind::FlowEnd { start }).with_error(error);
            self.storage.store(&end, false)?;

            record.heads.clear();
            record.heads.insert(head, id);
            record.start_nodes.clear();
            record.done = true;
            record.completed_at = Some(Utc::now());
            result
        };

        self.storage.flush()?;
        if self.engine.config().migrate_storage_on_complete && self.storage.kind() == StorageKind::PerNode {
            if let Err(err) = self.migrate_to_bulk() {
                warn!(execution = %self.id, error = %err, "Storage migration failed; keeping per-node history");
            }
        }
        self.record.lock().clean = true;
        self.save_record()?;
        Ok(Some(result))
    }

    /// Copy the history into bulk storage and switch to it
    fn migrate_to_bulk(&self) -> EngineResult<()> {
        let mut bulk = self.owner.fresh_bulk_storage()?;
        for node in self.storage.nodes()? {
            bulk.store(&node, false)?;
            let actions = self.storage.load_actions(node.id)?;
            if !actions.is_empty() {
                bulk.save_actions(node.id, actions)?;
            }
        }
        bulk.flush()?;
        self.storage.swap(bulk);
        self.record.lock().storage = StorageKind::Bulk;
        tracing::debug!(execution = %self.id, "Migrated history to bulk storage");
        Ok(())
    }

    /// Minimal terminal history for a record whose history cannot be read
    pub(crate) fn placeholder_history(
        owner: &Arc<dyn FlowExecutionOwner>,
        record: &mut ExecutionRecord,
        cause: Failure,
    ) -> EngineResult<LockedStorage> {
        let mut storage: Box<dyn FlowNodeStorage> = owner.fresh_bulk_storage()?;
        record.next_node_id = 1;
        record.next_head_id = 1;
        let start = record.allocate_node_id();
        let end = record.allocate_node_id();
        let head = record.allocate_head_id();
        storage.store(&FlowNode::new(start, Vec::new(), NodeKind::FlowStart), false)?;
        storage.store(
            &FlowNode::new(end, vec![start], NodeKind::FlowEnd { start }).with_error(Some(cause.clone())),
            false,
        )?;
        storage.flush()?;

        record.flow_start = Some(start);
        record.heads.clear();
        record.heads.insert(head, end);
        record.start_nodes.clear();
        record.done = true;
        record.result = Some(
            record
                .result
                .map_or(FlowResult::Failure, |r| r.combine(FlowResult::Failure)),
        );
        record.error = Some(cause);
        record.storage = StorageKind::Bulk;
        record.completed_at = Some(Utc::now());
        record.touch();
        owner.save(record)?;
        Ok(LockedStorage::new(storage))
    }
}
