use anyhow::Context;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::record::ExecutionRecord;
use super::{FlowExecution, LoadState};
use crate::config::DurabilityHint;
use crate::engine::{lane, Engine, ProgramSnapshot, ThreadGroup};
use crate::error::{codes, EngineError, EngineResult, Failure};
use crate::flow::LockedStorage;
use crate::owner::FlowExecutionOwner;

impl FlowExecution {
    /* ===================== Checkpoints ===================== */

    /// Flush history, save the program, flush again, save the record
    ///
    /// Every part is attempted even when an earlier one fails. Returns whether
    /// all of them succeeded, which is also recorded as the clean flag.
    pub(crate) fn checkpoint_group(&self, group: &ThreadGroup) -> bool {
        let mut clean = true;

        if let Err(err) = self.storage.flush() {
            warn!(execution = %self.id, error = %err, "Failed to flush history before saving the program");
            clean = false;
        }

        let saved = group
            .snapshot()
            .and_then(|snapshot| Ok(serde_json::to_value(&snapshot)?))
            .and_then(|program| self.owner.save_program(&program));
        if let Err(err) = saved {
            warn!(execution = %self.id, error = %err, "Failed to save the program");
            clean = false;
        }

        if let Err(err) = self.storage.flush() {
            warn!(execution = %self.id, error = %err, "Failed to flush history after saving the program");
            clean = false;
        }

        self.record.lock().clean = clean;
        if let Err(err) = self.save_record() {
            warn!(execution = %self.id, error = %err, "Failed to save the execution record");
            clean = false;
        }
        debug!(execution = %self.id, clean, "Checkpoint");
        clean
    }

    /// Checkpoint from outside the lane
    pub async fn checkpoint(self: &Arc<Self>) -> EngineResult<bool> {
        let lane = self.lane().ok_or(EngineError::ProgramNotReady)?;
        let execution = Arc::clone(self);
        lane.query(move |group| execution.checkpoint_group(group)).await
    }

    /// The group ran and has nothing runnable left
    pub(crate) fn on_idle(&self, group: &ThreadGroup) {
        let durability = self.record.lock().durability;
        if durability.persists_when_idle() {
            self.checkpoint_group(group);
        }
    }

    /// About to run threads: without idle checkpoints the saved state is stale from here on
    pub(crate) fn mark_dirty(&self) {
        let record = {
            let mut record = self.record.lock();
            if record.durability.persists_when_idle() || !record.clean {
                return;
            }
            record.clean = false;
            record.touch();
            record.clone()
        };
        if let Err(err) = self.owner.save(&record) {
            warn!(execution = %self.id, error = %err, "Failed to save the execution record");
        }
    }

    /* ===================== Pause & Suspend ===================== */

    /// Pause or unpause. Pausing takes effect between thread advances and ends
    /// with a checkpoint.
    pub async fn pause(self: &Arc<Self>, paused: bool) -> EngineResult<()> {
        if self.is_complete() {
            return Err(EngineError::AlreadyComplete);
        }
        self.paused.store(paused, Ordering::Release);
        self.record.lock().paused = paused;

        let Some(lane) = self.lane() else {
            // Still loading: the load honors the flag
            return self.save_record();
        };
        if paused {
            self.listener().log("Pausing");
            info!(execution = %self.id, "Pausing");
            let execution = Arc::clone(self);
            lane.query(move |group| execution.checkpoint_group(group)).await?;
        } else {
            self.listener().log("Resuming");
            info!(execution = %self.id, "Resuming");
            self.save_record()?;
            lane.schedule_run()?;
        }
        Ok(())
    }

    /// Checkpoint every execution and stop their lanes, as on process shutdown
    pub async fn suspend_all(executions: &[Arc<FlowExecution>]) {
        for execution in executions {
            if execution.is_complete() {
                continue;
            }
            execution.halted.store(true, Ordering::Release);
            let Some(lane) = execution.lane.lock().take() else {
                execution.load_cancel.cancel();
                continue;
            };
            let target = Arc::clone(execution);
            match lane.query(move |group| target.checkpoint_group(group)).await {
                Ok(clean) => info!(execution = %execution.id, clean, "Suspended execution"),
                Err(err) => warn!(execution = %execution.id, error = %err, "Failed to checkpoint while suspending"),
            }
            lane.shutdown();
        }
    }

    /* ===================== Loading ===================== */

    /// Load a saved execution
    ///
    /// Unreadable history is replaced with a terminal placeholder, so the
    /// returned execution is always usable. The saved program is restored in
    /// the background; the execution runs once that finishes, unless paused.
    pub async fn load(
        engine: Engine,
        owner: Arc<dyn FlowExecutionOwner>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut record = owner.load().context("Failed to load execution record")?;

        let storage = match open_history(&owner, &record) {
            Ok(storage) => storage,
            Err(err) => {
                warn!(execution = %record.id, error = %err, "History is unreadable; writing a placeholder");
                let cause = Failure::new(codes::LOAD_FAILED, format!("history could not be loaded: {}", err));
                Self::placeholder_history(&owner, &mut record, cause)
                    .context("Failed to write placeholder history")?
            }
        };

        let done = record.done;
        let clean = record.clean;
        let durability = record.durability;
        let state = if done {
            LoadState::Finished
        } else {
            LoadState::Loading
        };
        let execution = Self::new(engine, owner, record, storage, state)?;
        if done {
            return Ok(execution);
        }

        if !clean {
            let err = if durability == DurabilityHint::PerformanceOptimized {
                EngineError::DurabilityTooLow(durability)
            } else {
                EngineError::NotCleanlyShutDown
            };
            execution.listener().log(&err.to_string());
            execution.croak(Failure::new(codes::NOT_RESUMABLE, err.to_string()));
            return Ok(execution);
        }

        info!(execution = %execution.id, "Loading program");
        execution
            .runtime
            .spawn(Arc::clone(&execution).restore_program());
        Ok(execution)
    }

    async fn restore_program(self: Arc<Self>) {
        match self.try_restore_program().await {
            Ok(()) => {}
            Err(EngineError::Cancelled) => {
                self.croak(Failure::interrupted("program load was cancelled"));
            }
            Err(err) => {
                self.listener().log(&format!("Failed to load program: {}", err));
                self.croak(Failure::new(codes::LOAD_FAILED, err.to_string()));
            }
        }
    }

    async fn try_restore_program(self: &Arc<Self>) -> EngineResult<()> {
        let loaded_scripts = {
            let record = self.record.lock();
            if !record.script_matches() {
                return Err(EngineError::ScriptMismatch);
            }
            record.loaded_scripts.clone()
        };
        for (name, source) in &loaded_scripts {
            self.engine.runtime().load_body(name, source)?;
        }

        let program = self.owner.load_program()?;
        let snapshot: ProgramSnapshot = serde_json::from_value(program)?;

        let resolved = self
            .engine
            .pickles()
            .resolve_all(
                snapshot.pickles.clone(),
                self.engine.config().pickle_timeout(),
                self.load_cancel.clone(),
                Arc::clone(&self.pending_pickles),
            )
            .await?;
        self.live_objects.lock().extend(resolved);

        // Restored steps may deliver outcomes right away; they queue on the lane
        let (handle, inbox) = lane::channel();
        *self.lane.lock() = Some(handle.clone());
        let group = match ThreadGroup::restore(Arc::clone(self), snapshot) {
            Ok(group) => group,
            Err(err) => {
                self.lane.lock().take();
                return Err(err);
            }
        };

        self.state.send_replace(LoadState::Ready);
        info!(execution = %self.id, threads = group.thread_count(), "Program restored");
        lane::spawn(self, group, inbox);
        if !self.is_paused() {
            handle.schedule_run()?;
        }
        Ok(())
    }
}

/// Open the recorded storage and check the nodes the record points at
fn open_history(
    owner: &Arc<dyn FlowExecutionOwner>,
    record: &ExecutionRecord,
) -> EngineResult<LockedStorage> {
    let storage = LockedStorage::new(owner.open_storage(record.storage)?);
    let start = record
        .flow_start
        .ok_or_else(|| EngineError::Storage("record has no flow start".to_string()))?;
    storage.node(start)?;
    for tip in record.heads.values() {
        storage.node(*tip)?;
    }
    for open in &record.start_nodes {
        storage.node(*open)?;
    }
    Ok(storage)
}
