use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{FlowExecution, LoadState};
use crate::engine::group::StopTarget;
use crate::error::{codes, EngineError, EngineResult, Failure};
use crate::flow::{FlowResult, NodeId};

impl FlowExecution {
    /// Interrupt the whole program
    ///
    /// `result` is folded into the final result and `causes` are recorded. Every
    /// innermost running step is stopped; threads between steps see the
    /// interruption at their next resume.
    pub async fn interrupt(self: &Arc<Self>, result: FlowResult, causes: Vec<Failure>) -> EngineResult<()> {
        {
            let mut record = self.record.lock();
            if record.done {
                return Ok(());
            }
            record.result = Some(record.result.map_or(result, |r| r.combine(result)));
            record.causes.extend(causes.iter().cloned());
            record.touch();
        }

        let mut cause = Failure::interrupted(format!("interrupted with {}", result));
        for detail in causes {
            cause.add_suppressed(detail);
        }
        self.listener().log(&format!("Interrupted: {}", cause));
        info!(execution = %self.id, result = %result, "Interrupting execution");
        self.stop_scope(None, cause).await
    }

    /// Stop the running steps inside the block started at `node`, leaving
    /// everything outside it alone
    pub async fn cancel_scope(self: &Arc<Self>, node: NodeId, cause: Failure) -> EngineResult<()> {
        if self.is_complete() {
            return Ok(());
        }
        info!(execution = %self.id, scope = %node, cause = %cause, "Cancelling scope");
        self.stop_scope(Some(node), cause).await
    }

    async fn stop_scope(self: &Arc<Self>, scope: Option<NodeId>, cause: Failure) -> EngineResult<()> {
        if *self.state.borrow() == LoadState::Loading {
            debug!(execution = %self.id, "Cancelling the program load");
            self.load_cancel.cancel();
            return Ok(());
        }
        let lane = self.lane().ok_or(EngineError::ProgramNotReady)?;

        let injected = cause.clone();
        let targets = lane
            .query(move |group| group.stop_targets(scope, &injected))
            .await?;
        for target in targets {
            self.stop_step(target, &cause).await;
        }
        Ok(())
    }

    /// Run a step's stop hook off the lane, bounded by the stop timeout
    async fn stop_step(&self, target: StopTarget, cause: &Failure) {
        let StopTarget {
            node,
            context,
            execution,
        } = target;
        debug!(execution = %self.id, node = %node, "Stopping step");

        let timeout = self.engine.config().stop_timeout();
        let hook_context = context.clone();
        let hook_cause = cause.clone();
        let hook = self
            .runtime
            .spawn_blocking(move || execution.lock().stop(&hook_context, &hook_cause));

        let problem = match tokio::time::timeout(timeout, hook).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(failure))) => Some(failure),
            Ok(Err(join)) => Some(Failure::internal(format!("stop hook panicked: {}", join))),
            Err(_) => Some(Failure::new(
                codes::STOP_TIMEOUT,
                format!("step at node {} did not stop within {:?}", node, timeout),
            )),
        };
        if let Some(problem) = problem {
            warn!(execution = %self.id, node = %node, problem = %problem, "Step did not stop cleanly");
            context.on_failure(cause.clone().with_suppressed(problem));
        }
    }
}
