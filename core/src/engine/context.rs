//! Step context and body invocation
//!
//! A `StepContext` is the handle a step uses to report back. It starts in
//! synchronous mode: an outcome delivered before `start` returns is consumed
//! in place. After `start` returns without one, the context switches to
//! asynchronous mode and every later delivery re-enters the scheduler lane.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use super::continuation::Outcome;
use super::pickle::Pickle;
use super::thread::ThreadId;
use crate::error::{codes, EngineError, EngineResult, Failure};
use crate::execution::FlowExecution;
use crate::flow::{NodeAction, NodeId};
use crate::owner::{NullListener, TaskListener};
use crate::script::{Closure, Val};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ContextMode {
    #[default]
    Sync,
    Async,
}

/// Where a body comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BodySource {
    /// The trailing block of the step call, exported by the thread group
    Exported(u64),
    Inline(Closure),
}

/// A body waiting to be started by the lane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingBody {
    pub index: usize,
    pub source: BodySource,
    pub overrides: BTreeMap<String, Val>,
    pub branch: Option<String>,
}

#[derive(Default)]
struct OutcomeCell {
    outcome: Option<Outcome>,
    mode: ContextMode,
    suppressed: Vec<Failure>,
    bodies: Vec<PendingBody>,
    next_body: usize,
}

struct ContextInner {
    node: NodeId,
    thread: ThreadId,
    function: String,
    body: Option<u64>,
    variables: BTreeMap<String, Val>,
    execution: Weak<FlowExecution>,
    cell: Mutex<OutcomeCell>,
}

/// Handle given to a step execution
#[derive(Clone)]
pub struct StepContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("node", &self.inner.node)
            .field("thread", &self.inner.thread)
            .field("function", &self.inner.function)
            .finish()
    }
}

impl StepContext {
    pub(crate) fn new(
        node: NodeId,
        thread: ThreadId,
        function: impl Into<String>,
        body: Option<u64>,
        variables: BTreeMap<String, Val>,
        execution: Weak<FlowExecution>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                node,
                thread,
                function: function.into(),
                body,
                variables,
                execution,
                cell: Mutex::new(OutcomeCell::default()),
            }),
        }
    }

    /// Context rebuilt from a saved program; always asynchronous
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restored(
        node: NodeId,
        thread: ThreadId,
        function: impl Into<String>,
        body: Option<u64>,
        variables: BTreeMap<String, Val>,
        execution: Weak<FlowExecution>,
        outcome: Option<Outcome>,
        next_body: usize,
        bodies: Vec<PendingBody>,
    ) -> Self {
        let ctx = Self::new(node, thread, function, body, variables, execution);
        {
            let mut cell = ctx.inner.cell.lock();
            cell.mode = ContextMode::Async;
            cell.outcome = outcome;
            cell.next_body = next_body;
            cell.bodies = bodies;
        }
        ctx
    }

    /// Context with no execution behind it
    #[cfg(test)]
    pub(crate) fn detached(function: &str, body: Option<u64>) -> Self {
        Self::new(
            NodeId(1),
            ThreadId(1),
            function,
            body,
            BTreeMap::new(),
            Weak::new(),
        )
    }

    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    pub fn thread(&self) -> ThreadId {
        self.inner.thread
    }

    pub fn function(&self) -> &str {
        &self.inner.function
    }

    pub fn has_body(&self) -> bool {
        self.inner.body.is_some()
    }

    pub(crate) fn body_handle(&self) -> Option<u64> {
        self.inner.body
    }

    pub(crate) fn variables(&self) -> &BTreeMap<String, Val> {
        &self.inner.variables
    }

    fn execution(&self) -> Option<Arc<FlowExecution>> {
        self.inner.execution.upgrade()
    }

    /* ----- outcome ----- */

    pub fn on_success(&self, value: Val) {
        self.complete(Ok(value));
    }

    pub fn on_failure(&self, failure: Failure) {
        self.complete(Err(failure));
    }

    /// Deliver an outcome. The first one wins; later ones become suppressed detail.
    pub fn complete(&self, outcome: Outcome) {
        if matches!(&outcome, Err(f) if f.is_already_completed()) {
            return;
        }

        let schedule = {
            let mut cell = self.inner.cell.lock();
            if let Some(existing) = cell.outcome.as_mut() {
                let duplicate = match outcome {
                    Ok(value) => Failure::new(
                        codes::DUPLICATE_OUTCOME,
                        format!("step already completed; ignoring result {}", value),
                    ),
                    Err(failure) => failure,
                };
                tracing::warn!(
                    node = %self.inner.node,
                    function = %self.inner.function,
                    duplicate = %duplicate,
                    "Duplicate step outcome"
                );
                if let Err(first) = existing {
                    if !first.is_already_completed() {
                        first.add_suppressed(duplicate.clone());
                    }
                }
                cell.suppressed.push(duplicate);
                false
            } else {
                cell.outcome = Some(outcome);
                cell.mode == ContextMode::Async
            }
        };

        if schedule {
            let node = self.inner.node;
            self.submit(move |group| group.complete_step(node));
        }
    }

    /// The delivered outcome, if any and not yet consumed
    pub fn outcome(&self) -> Option<Outcome> {
        match &self.inner.cell.lock().outcome {
            Some(Err(f)) if f.is_already_completed() => None,
            other => other.clone(),
        }
    }

    /// Outcomes delivered after the first
    pub fn suppressed(&self) -> Vec<Failure> {
        self.inner.cell.lock().suppressed.clone()
    }

    pub fn is_async(&self) -> bool {
        self.inner.cell.lock().mode == ContextMode::Async
    }

    /// Switch to asynchronous mode unless an outcome is already present
    ///
    /// Returns true if the context is now asynchronous.
    pub(crate) fn switch_to_async(&self) -> bool {
        let mut cell = self.inner.cell.lock();
        if cell.outcome.is_some() {
            return false;
        }
        cell.mode = ContextMode::Async;
        true
    }

    /// Take the outcome for the scheduler, leaving the consumed marker behind
    pub(crate) fn take_outcome_for_delivery(&self) -> Option<Outcome> {
        let mut cell = self.inner.cell.lock();
        match cell.outcome.take() {
            Some(Err(f)) if f.is_already_completed() => {
                cell.outcome = Some(Err(f));
                None
            }
            Some(outcome) => {
                cell.outcome = Some(Err(Failure::already_completed()));
                Some(outcome)
            }
            None => None,
        }
    }

    /// Outcome to persist: delivered but not yet consumed
    pub(crate) fn saved_outcome(&self) -> Option<Outcome> {
        self.outcome()
    }

    pub(crate) fn next_body(&self) -> usize {
        self.inner.cell.lock().next_body
    }

    /* ----- bodies ----- */

    /// Invoker for the step's trailing block
    pub fn new_body_invoker(&self) -> EngineResult<BodyInvoker> {
        let handle = self
            .inner
            .body
            .ok_or_else(|| EngineError::MissingBody(self.inner.function.clone()))?;
        Ok(BodyInvoker::new(self.clone(), BodySource::Exported(handle)))
    }

    /// Invoker for a closure passed as an argument
    pub fn body_invoker_for(&self, closure: Closure) -> BodyInvoker {
        BodyInvoker::new(self.clone(), BodySource::Inline(closure))
    }

    fn queue_body(&self, mut body: PendingBody) -> usize {
        let schedule = {
            let mut cell = self.inner.cell.lock();
            body.index = cell.next_body;
            cell.next_body += 1;
            cell.bodies.push(body.clone());
            cell.mode == ContextMode::Async
        };
        if schedule {
            let node = self.inner.node;
            self.submit(move |group| group.start_pending_bodies(node));
        }
        body.index
    }

    /// Bodies queued but not yet started by the lane
    pub(crate) fn pending_bodies(&self) -> Vec<PendingBody> {
        self.inner.cell.lock().bodies.clone()
    }

    pub(crate) fn drain_bodies(&self) -> Vec<PendingBody> {
        std::mem::take(&mut self.inner.cell.lock().bodies)
    }

    /* ----- environment ----- */

    /// Contextual variable set by an enclosing `with_context`
    pub fn get_context(&self, key: &str) -> Option<Val> {
        self.inner.variables.get(key).cloned()
    }

    pub fn listener(&self) -> Arc<dyn TaskListener> {
        match self.execution() {
            Some(execution) => execution.listener(),
            None => Arc::new(NullListener),
        }
    }

    /// Attach an action to this step's history node
    pub fn add_action(&self, action: NodeAction) {
        if let Some(execution) = self.execution() {
            if let Err(err) = execution.add_node_action(self.inner.node, action) {
                tracing::warn!(node = %self.inner.node, error = %err, "Failed to save node action");
            }
        }
    }

    /// Compile extra script text and remember it for replay after a restart
    pub fn load_script(&self, name: &str, source: &str) -> Result<Closure, Failure> {
        let execution = self
            .execution()
            .ok_or_else(|| Failure::internal("execution is gone"))?;
        execution.load_script(name, source).map_err(Failure::from)
    }

    /// Live object for a handle, as bound or resolved after a reload
    pub fn live_object(&self, pickle: &Pickle) -> Option<Val> {
        self.execution()?.live_object(pickle)
    }

    pub fn bind_live_object(&self, pickle: Pickle, value: Val) {
        if let Some(execution) = self.execution() {
            execution.bind_live_object(pickle, value);
        }
    }

    fn submit<F>(&self, job: F)
    where
        F: FnOnce(&mut super::group::ThreadGroup) + Send + 'static,
    {
        match self.execution() {
            Some(execution) => execution.submit(Box::new(job)),
            None => tracing::debug!(node = %self.inner.node, "No execution to notify"),
        }
    }
}

/* ===================== Body Invoker ===================== */

/// Builder for starting a body
pub struct BodyInvoker {
    context: StepContext,
    source: BodySource,
    overrides: BTreeMap<String, Val>,
    branch: Option<String>,
}

impl BodyInvoker {
    fn new(context: StepContext, source: BodySource) -> Self {
        Self {
            context,
            source,
            overrides: BTreeMap::new(),
            branch: None,
        }
    }

    /// Contextual variable visible to the body and everything it calls
    pub fn with_context(mut self, key: impl Into<String>, value: Val) -> Self {
        self.overrides.insert(key.into(), value);
        self
    }

    /// Run the body on its own head, as a named branch
    pub fn branch(mut self, name: impl Into<String>) -> Self {
        self.branch = Some(name.into());
        self
    }

    /// Queue the body; returns the index reported to `on_body_complete`
    pub fn start(self) -> usize {
        let body = PendingBody {
            index: 0,
            source: self.source,
            overrides: self.overrides,
            branch: self.branch,
        };
        self.context.queue_body(body)
    }
}
