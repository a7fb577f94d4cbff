//! Thread group: the scheduler for one execution
//!
//! The group owns every thread, every running step and the closures exported
//! to bodies. It lives on the execution's lane, so nothing here is shared.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use super::context::{BodySource, PendingBody, StepContext};
use super::continuation::{BodyCall, Continuable, Outcome, StepRequest, Yield};
use super::dump::{StepExecutionInfo, ThreadDump, ThreadInfo};
use super::lane::{self, LaneReceiver};
use super::pickle::Pickle;
use super::sandbox::SandboxedContinuable;
use super::step::{StepDescriptor, StepExecution};
use super::thread::{Branch, ExecThread, ThreadCompletion, ThreadId, ThreadSnapshot};
use crate::error::{codes, EngineError, EngineResult, Failure};
use crate::execution::FlowExecution;
use crate::flow::{graph, HeadId, NodeId, NodeKind};
use crate::script::{Closure, Val};

/// A step that has started and not yet delivered its outcome
struct LiveStep {
    context: StepContext,
    execution: Arc<Mutex<Box<dyn StepExecution>>>,
    descriptor: Arc<dyn StepDescriptor>,
    args: Vec<Val>,
    display_name: String,
    closure: Option<u64>,
    head: HeadId,
    is_block: bool,
    branch_tips: Vec<NodeId>,
    children: BTreeSet<ThreadId>,
}

/// Persisted form of a running step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub node: NodeId,
    pub thread: ThreadId,
    pub function: String,
    pub args: Vec<Val>,
    pub state: Option<serde_json::Value>,
    pub closure: Option<u64>,
    pub head: HeadId,
    pub is_block: bool,
    #[serde(default)]
    pub branch_tips: Vec<NodeId>,
    #[serde(default)]
    pub children: BTreeSet<ThreadId>,
    #[serde(default)]
    pub variables: BTreeMap<String, Val>,
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub next_body: usize,
    /// Bodies queued from asynchronous mode that the lane has not started yet
    #[serde(default)]
    pub bodies: Vec<PendingBody>,
}

/// Everything needed to rebuild a thread group after a restart
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramSnapshot {
    pub threads: Vec<ThreadSnapshot>,
    pub closures: BTreeMap<u64, Closure>,
    pub next_closure: u64,
    pub steps: Vec<StepSnapshot>,
    pub root_outcome: Option<Outcome>,
    /// Handles that must be resolved before the threads can be restored
    pub pickles: Vec<Pickle>,
}

/// A step chosen to be stopped by an interrupt
pub(crate) struct StopTarget {
    pub node: NodeId,
    pub context: StepContext,
    pub execution: Arc<Mutex<Box<dyn StepExecution>>>,
}

pub struct ThreadGroup {
    execution: Arc<FlowExecution>,
    threads: BTreeMap<ThreadId, ExecThread>,
    closures: BTreeMap<u64, Closure>,
    next_closure: u64,
    steps: BTreeMap<NodeId, LiveStep>,
    root_outcome: Option<Outcome>,
    last_run: Option<ThreadId>,
    finished: bool,
}

impl ThreadGroup {
    pub(crate) fn new(execution: Arc<FlowExecution>) -> Self {
        Self {
            execution,
            threads: BTreeMap::new(),
            closures: BTreeMap::new(),
            next_closure: 1,
            steps: BTreeMap::new(),
            root_outcome: None,
            last_run: None,
            finished: false,
        }
    }

    pub(crate) fn execution(&self) -> Arc<FlowExecution> {
        Arc::clone(&self.execution)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /* ===================== Threads ===================== */

    fn add_thread(
        &mut self,
        continuation: Box<dyn Continuable>,
        head: HeadId,
        variables: BTreeMap<String, Val>,
        completion: ThreadCompletion,
    ) -> ThreadId {
        let continuation = self.sandboxed(continuation);
        let id = self.execution.allocate_thread_id();
        let mut thread = ExecThread::new(id, continuation, head, variables);
        thread.completions.push(completion);
        self.threads.insert(id, thread);
        debug!(thread = %id, head = %head, "Added thread");
        id
    }

    fn sandboxed(&self, continuation: Box<dyn Continuable>) -> Box<dyn Continuable> {
        match self.execution.sandbox_policy() {
            Some(policy) => Box::new(SandboxedContinuable::new(continuation, policy)),
            None => continuation,
        }
    }

    /// Add the script's root thread and make it runnable
    pub(crate) fn start_root(
        &mut self,
        continuation: Box<dyn Continuable>,
        head: HeadId,
    ) -> EngineResult<ThreadId> {
        let id = self.add_thread(continuation, head, BTreeMap::new(), ThreadCompletion::Root);
        self.resume_thread(id, Ok(Val::Null))?;
        Ok(id)
    }

    /// Give a thread its resume value
    pub(crate) fn resume_thread(
        &mut self,
        id: ThreadId,
        outcome: Outcome,
    ) -> EngineResult<tokio::sync::oneshot::Receiver<()>> {
        self.threads
            .get_mut(&id)
            .ok_or(EngineError::NoSuchThread(id))?
            .resume(outcome)
    }

    /* ===================== Scheduler Loop ===================== */

    /// Run runnable threads until none are left, the execution pauses, or
    /// the lane shuts down. Returns false on shutdown.
    pub(crate) fn run(
        &mut self,
        inbox: &mut LaneReceiver,
        waiters: &mut Vec<tokio::sync::oneshot::Sender<()>>,
    ) -> bool {
        let mut advanced = false;
        loop {
            if !lane::drain(self, inbox, waiters) {
                return false;
            }
            if self.finished || self.execution.should_yield() {
                break;
            }
            let Some(id) = self.next_runnable() else {
                break;
            };
            if !advanced {
                self.execution.mark_dirty();
                advanced = true;
            }
            self.run_thread(id);
        }

        if self.finished {
            return true;
        }
        if self.threads.is_empty() && self.steps.is_empty() {
            self.finish();
        } else if advanced && !self.execution.should_yield() {
            let execution = self.execution();
            execution.on_idle(self);
        }
        true
    }

    /// Round robin in id order, starting after the thread that ran last
    fn next_runnable(&self) -> Option<ThreadId> {
        let after = self
            .last_run
            .map(|last| (Bound::Excluded(last), Bound::Unbounded))
            .unwrap_or((Bound::Unbounded, Bound::Unbounded));
        self.threads
            .range(after)
            .map(|(_, thread)| thread)
            .chain(self.threads.values())
            .find(|thread| thread.is_runnable())
            .map(|thread| thread.id())
    }

    fn run_thread(&mut self, id: ThreadId) {
        self.last_run = Some(id);
        let Some(mut thread) = self.threads.remove(&id) else {
            return;
        };
        let span = tracing::debug_span!("thread", id = %id);
        let _enter = span.enter();

        let mut yielded = thread.advance();
        loop {
            match yielded {
                None => break,
                Some(Yield::Safepoint) => {
                    thread.park_at_safepoint();
                    break;
                }
                Some(Yield::Step(request)) => {
                    yielded = match self.start_step(&mut thread, request) {
                        Some(outcome) => thread.drive(outcome),
                        None => None,
                    };
                }
                Some(Yield::Completed(outcome)) => {
                    self.end_thread(&mut thread, outcome);
                    return;
                }
            }
        }
        self.threads.insert(id, thread);
    }

    /* ===================== Steps ===================== */

    /// Start a step for a thread
    ///
    /// Returns the outcome when the step completed synchronously; otherwise the
    /// thread waits for `complete_step`.
    fn start_step(&mut self, thread: &mut ExecThread, request: StepRequest) -> Option<Outcome> {
        let StepRequest {
            function,
            args,
            body,
        } = request;
        self.execution.record_internal_call(&function);

        let Some(descriptor) = self.execution.engine().steps().get(&function) else {
            return Some(Err(Failure::new(
                codes::NO_SUCH_STEP,
                format!("no step named '{}'", function),
            )));
        };
        if descriptor.takes_body() && body.is_none() {
            return Some(Err(Failure::new(
                codes::MISSING_BODY,
                format!("'{}' must be called with a block", function),
            )));
        }

        let step_execution = match descriptor.create(&args) {
            Ok(step_execution) => step_execution,
            Err(failure) => return Some(Err(failure)),
        };

        let is_block = descriptor.is_block();
        let display_name = descriptor.display_name(&args);
        let kind = if is_block {
            NodeKind::BlockStart { body: false }
        } else {
            NodeKind::Atom
        };
        let node = match self.execution.append_node(
            thread.head,
            kind,
            Some((function.as_str(), display_name.clone())),
        ) {
            Ok(node) => node,
            Err(err) => return Some(Err(Failure::from(err))),
        };

        let closure = body.map(|body| self.export(body));
        let context = StepContext::new(
            node,
            thread.id(),
            function.clone(),
            closure,
            thread.variables.clone(),
            Arc::downgrade(&self.execution),
        );
        let step_execution = Arc::new(Mutex::new(step_execution));
        self.steps.insert(
            node,
            LiveStep {
                context: context.clone(),
                execution: Arc::clone(&step_execution),
                descriptor,
                args,
                display_name,
                closure,
                head: thread.head,
                is_block,
                branch_tips: Vec::new(),
                children: BTreeSet::new(),
            },
        );
        thread.step = Some(node);
        debug!(node = %node, function = %function, "Starting step");

        let started = std::panic::catch_unwind(AssertUnwindSafe(|| {
            step_execution.lock().start(&context)
        }));
        match started {
            Ok(Ok(true)) if context.outcome().is_none() => {
                context.on_failure(Failure::internal(format!(
                    "step '{}' reported synchronous completion without an outcome",
                    function
                )));
            }
            Ok(Ok(_)) => {}
            Ok(Err(failure)) => context.on_failure(failure),
            Err(panic) => {
                let message = lane::panic_message(&*panic);
                warn!(node = %node, function = %function, panic = %message, "Step panicked while starting");
                context.on_failure(Failure::new(
                    codes::STEP_FAILED,
                    format!("{} panicked: {}", function, message),
                ));
            }
        }
        self.start_pending_bodies(node);

        if context.switch_to_async() {
            return None;
        }
        let outcome = context.take_outcome_for_delivery()?;
        self.finish_step(node, &outcome);
        thread.step = None;
        Some(outcome)
    }

    /// Deliver an asynchronously completed step's outcome to its thread
    pub(crate) fn complete_step(&mut self, node: NodeId) {
        let Some(live) = self.steps.get(&node) else {
            debug!(node = %node, "Outcome for a step that already finished");
            return;
        };
        let Some(outcome) = live.context.take_outcome_for_delivery() else {
            return;
        };
        let thread_id = live.context.thread();
        self.finish_step(node, &outcome);

        let Some(thread) = self.threads.get_mut(&thread_id) else {
            warn!(node = %node, thread = %thread_id, "Step finished after its thread");
            return;
        };
        thread.step = None;
        if let Err(err) = thread.resume(outcome) {
            warn!(node = %node, error = %err, "Dropped step outcome");
        }
    }

    /// Remove a finished step and close its history node
    fn finish_step(&mut self, node: NodeId, outcome: &Outcome) {
        let Some(live) = self.steps.remove(&node) else {
            return;
        };
        if let Some(handle) = live.closure {
            self.closures.remove(&handle);
        }
        let error = outcome.as_ref().err().cloned();
        let closed = if live.is_block {
            self.execution
                .close_block(live.head, node, live.branch_tips, error)
                .map(|_| ())
        } else {
            self.execution.close_atom(node, error)
        };
        if let Err(err) = closed {
            warn!(node = %node, error = %err, "Failed to close step node");
        }
        debug!(node = %node, ok = outcome.is_ok(), "Step finished");
    }

    fn export(&mut self, closure: Closure) -> u64 {
        let handle = self.next_closure;
        self.next_closure += 1;
        self.closures.insert(handle, closure);
        handle
    }

    /* ===================== Bodies ===================== */

    /// Start every body the step at `node` has queued
    pub(crate) fn start_pending_bodies(&mut self, node: NodeId) {
        let Some(live) = self.steps.get(&node) else {
            return;
        };
        for body in live.context.drain_bodies() {
            self.start_body(node, body);
        }
    }

    fn start_body(&mut self, step: NodeId, body: PendingBody) {
        let Some(live) = self.steps.get(&step) else {
            return;
        };
        let context = live.context.clone();
        let head = live.head;
        let closure = match &body.source {
            BodySource::Exported(handle) => self.closures.get(handle).cloned(),
            BodySource::Inline(closure) => Some(closure.clone()),
        };
        let Some(closure) = closure else {
            self.deliver_body_result(
                step,
                body.index,
                Err(Failure::internal("body closure is no longer available")),
            );
            return;
        };

        let branch = match &body.branch {
            Some(name) => match self.open_branch(head, name) {
                Ok(branch) => Some(branch),
                Err(err) => {
                    self.deliver_body_result(step, body.index, Err(Failure::from(err)));
                    return;
                }
            },
            None => None,
        };

        let runtime = self.execution.engine().runtime();
        match runtime.invoke_body(&closure) {
            BodyCall::Completed(outcome) => {
                if let Some(branch) = branch {
                    self.close_branch(step, branch, outcome.as_ref().err().cloned());
                }
                self.deliver_body_result(step, body.index, outcome);
            }
            BodyCall::Deferred(continuation) => {
                let mut variables = context.variables().clone();
                variables.extend(body.overrides);
                let thread_head = branch.map(|b| b.head).unwrap_or(head);
                let id = self.add_thread(
                    continuation,
                    thread_head,
                    variables,
                    ThreadCompletion::Body {
                        step,
                        index: body.index,
                        branch,
                    },
                );
                if let Some(live) = self.steps.get_mut(&step) {
                    live.children.insert(id);
                }
                if let Err(err) = self.resume_thread(id, Ok(Val::Null)) {
                    warn!(thread = %id, error = %err, "Failed to start body thread");
                }
            }
        }
    }

    fn open_branch(&mut self, head: HeadId, name: &str) -> EngineResult<Branch> {
        let branch_head = self.execution.fork_head(head)?;
        let start = self.execution.append_node(
            branch_head,
            NodeKind::BlockStart { body: true },
            Some(("branch", name.to_string())),
        )?;
        Ok(Branch {
            head: branch_head,
            start,
        })
    }

    fn close_branch(&mut self, step: NodeId, branch: Branch, error: Option<Failure>) {
        let closed = self
            .execution
            .close_block(branch.head, branch.start, Vec::new(), error)
            .and_then(|_| self.execution.close_branch(branch.head));
        match closed {
            Ok(tip) => {
                if let Some(live) = self.steps.get_mut(&step) {
                    live.branch_tips.push(tip);
                }
            }
            Err(err) => warn!(branch = %branch.start, error = %err, "Failed to close branch"),
        }
    }

    fn deliver_body_result(&mut self, step: NodeId, index: usize, outcome: Outcome) {
        let Some(live) = self.steps.get(&step) else {
            debug!(node = %step, "Body finished after its step");
            return;
        };
        let context = live.context.clone();
        let step_execution = Arc::clone(&live.execution);
        step_execution.lock().on_body_complete(&context, index, outcome);
        self.start_pending_bodies(step);
        if !context.is_async() {
            return;
        }
        // Outcomes delivered from a body completion are picked up right away
        if context.outcome().is_some() {
            self.complete_step(step);
        }
    }

    /* ===================== Thread Completion ===================== */

    fn end_thread(&mut self, thread: &mut ExecThread, outcome: Outcome) {
        debug!(thread = %thread.id(), ok = outcome.is_ok(), "Thread completed");
        let completions = std::mem::take(&mut thread.completions);
        thread.retire();
        for completion in completions {
            match completion {
                ThreadCompletion::Root => {
                    self.root_outcome = Some(outcome.clone());
                }
                ThreadCompletion::Body {
                    step,
                    index,
                    branch,
                } => {
                    if let Some(live) = self.steps.get_mut(&step) {
                        live.children.remove(&thread.id());
                    }
                    if let Some(branch) = branch {
                        self.close_branch(step, branch, outcome.as_ref().err().cloned());
                    }
                    self.deliver_body_result(step, index, outcome.clone());
                }
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        let outcome = self
            .root_outcome
            .take()
            .unwrap_or_else(|| Err(Failure::internal("program ended without a result")));
        let execution = self.execution();
        execution.on_program_end(outcome);
    }

    /* ===================== Interrupts ===================== */

    /// Pick the steps to stop for an interrupt scoped to `scope`
    ///
    /// Only innermost steps are chosen: a step with live body threads, or one
    /// that encloses another running step, is left to fail through its body.
    /// Threads inside the scope that are not in a step get the cause injected.
    pub(crate) fn stop_targets(&mut self, scope: Option<NodeId>, cause: &Failure) -> Vec<StopTarget> {
        let storage = self.execution.storage();
        let chains: BTreeMap<NodeId, Vec<NodeId>> = self
            .steps
            .keys()
            .map(|node| {
                let chain = graph::enclosing_blocks(storage, *node).unwrap_or_else(|err| {
                    warn!(node = %node, error = %err, "Could not walk enclosing blocks");
                    Vec::new()
                });
                (*node, chain)
            })
            .collect();

        let mut targets = Vec::new();
        for (node, chain) in &chains {
            let in_scope = scope.map_or(true, |s| *node == s || chain.contains(&s));
            if !in_scope {
                continue;
            }
            let live = &self.steps[node];
            let has_children = live
                .children
                .iter()
                .any(|child| self.threads.contains_key(child));
            let encloses_other = chains
                .iter()
                .any(|(other, other_chain)| other != node && other_chain.contains(node));
            if has_children || encloses_other {
                continue;
            }
            targets.push(StopTarget {
                node: *node,
                context: live.context.clone(),
                execution: Arc::clone(&live.execution),
            });
        }
        targets.sort_by(|a, b| b.node.cmp(&a.node));

        let idle: Vec<ThreadId> = self
            .threads
            .values()
            .filter(|thread| thread.step.is_none() && thread.is_alive())
            .filter(|thread| match scope {
                None => true,
                Some(scope) => self
                    .execution
                    .head_tip(thread.head)
                    .map(|tip| graph::is_within(storage, tip, scope).unwrap_or(false))
                    .unwrap_or(false),
            })
            .map(|thread| thread.id())
            .collect();
        for id in idle {
            if let Some(thread) = self.threads.get_mut(&id) {
                debug!(thread = %id, "Injecting interrupt");
                thread.inject(cause.clone());
            }
        }
        targets
    }

    /* ===================== Introspection ===================== */

    fn step_info(&self, node: NodeId, live: &LiveStep) -> StepExecutionInfo {
        StepExecutionInfo {
            node,
            thread: live.context.thread(),
            function: live.context.function().to_string(),
            display_name: live.display_name.clone(),
            status: live.execution.lock().status(),
        }
    }

    pub(crate) fn dump(&self) -> ThreadDump {
        let threads = self
            .threads
            .values()
            .map(|thread| ThreadInfo {
                id: thread.id(),
                head: thread.head,
                runnable: thread.is_runnable(),
                alive: thread.is_alive(),
                step: thread
                    .step
                    .and_then(|node| self.steps.get(&node).map(|live| self.step_info(node, live))),
                frames: thread.stack_trace(),
            })
            .collect();
        ThreadDump {
            threads,
            pending_pickles: Vec::new(),
        }
    }

    /// Running steps; with `innermost_only`, those that enclose no other running step
    pub(crate) fn step_infos(&self, innermost_only: bool) -> Vec<StepExecutionInfo> {
        let enclosing: BTreeSet<NodeId> = if innermost_only {
            let storage = self.execution.storage();
            self.steps
                .keys()
                .filter_map(|node| graph::enclosing_blocks(storage, *node).ok())
                .flatten()
                .collect()
        } else {
            BTreeSet::new()
        };
        self.steps
            .iter()
            .filter(|(node, _)| !enclosing.contains(node))
            .map(|(node, live)| self.step_info(*node, live))
            .collect()
    }

    /* ===================== Persistence ===================== */

    pub(crate) fn snapshot(&self) -> EngineResult<ProgramSnapshot> {
        let mut pickles = Vec::new();
        let mut threads = Vec::new();
        for thread in self.threads.values() {
            pickles.extend(thread.pickles());
            if let Some(snapshot) = thread.snapshot()? {
                threads.push(snapshot);
            }
        }
        for closure in self.closures.values() {
            for value in closure.captured.values() {
                value.collect_handles(&mut pickles);
            }
        }

        let mut steps = Vec::new();
        for (node, live) in &self.steps {
            for arg in &live.args {
                arg.collect_handles(&mut pickles);
            }
            let bodies = live.context.pending_bodies();
            for body in &bodies {
                if let BodySource::Inline(closure) = &body.source {
                    for value in closure.captured.values() {
                        value.collect_handles(&mut pickles);
                    }
                }
                for value in body.overrides.values() {
                    value.collect_handles(&mut pickles);
                }
            }
            steps.push(StepSnapshot {
                node: *node,
                thread: live.context.thread(),
                function: live.context.function().to_string(),
                args: live.args.clone(),
                state: live.execution.lock().save_state(),
                closure: live.closure,
                head: live.head,
                is_block: live.is_block,
                branch_tips: live.branch_tips.clone(),
                children: live.children.clone(),
                variables: live.context.variables().clone(),
                outcome: live.context.saved_outcome(),
                next_body: live.context.next_body(),
                bodies,
            });
        }
        pickles.sort();
        pickles.dedup();

        Ok(ProgramSnapshot {
            threads,
            closures: self.closures.clone(),
            next_closure: self.next_closure,
            steps,
            root_outcome: self.root_outcome.clone(),
            pickles,
        })
    }

    /// Rebuild a group from a snapshot and give each step its `on_resume` call
    pub(crate) fn restore(
        execution: Arc<FlowExecution>,
        snapshot: ProgramSnapshot,
    ) -> EngineResult<Self> {
        let engine = execution.engine().clone();
        let mut group = Self::new(Arc::clone(&execution));
        group.closures = snapshot.closures;
        group.next_closure = snapshot.next_closure.max(1);
        group.root_outcome = snapshot.root_outcome;

        for thread in snapshot.threads {
            let continuation = engine.runtime().restore(thread.continuation.clone())?;
            let continuation = group.sandboxed(continuation);
            let id = thread.id;
            group.threads.insert(id, ExecThread::restore(thread, continuation));
        }

        let mut restored = Vec::new();
        for step in snapshot.steps {
            let descriptor = engine.steps().get(&step.function).ok_or_else(|| {
                EngineError::StepRestore(step.function.clone(), "no longer registered".into())
            })?;
            let step_execution = descriptor
                .resume(&step.args, step.state.clone())
                .map_err(|failure| {
                    EngineError::StepRestore(step.function.clone(), failure.to_string())
                })?;
            let has_outcome = step.outcome.is_some();
            let has_bodies = !step.bodies.is_empty();
            let context = StepContext::restored(
                step.node,
                step.thread,
                step.function.clone(),
                step.closure,
                step.variables,
                Arc::downgrade(&execution),
                step.outcome,
                step.next_body,
                step.bodies,
            );
            group.steps.insert(
                step.node,
                LiveStep {
                    context,
                    execution: Arc::new(Mutex::new(step_execution)),
                    display_name: descriptor.display_name(&step.args),
                    descriptor,
                    args: step.args,
                    closure: step.closure,
                    head: step.head,
                    is_block: step.is_block,
                    branch_tips: step.branch_tips,
                    children: step.children,
                },
            );
            restored.push((step.node, has_outcome, has_bodies));
        }

        for (node, has_outcome, has_bodies) in restored {
            if has_bodies {
                execution.submit(Box::new(move |group: &mut ThreadGroup| {
                    group.start_pending_bodies(node)
                }));
            }
            if has_outcome {
                execution.submit(Box::new(move |group: &mut ThreadGroup| {
                    group.complete_step(node)
                }));
                continue;
            }
            let live = &group.steps[&node];
            debug!(node = %node, step = %live.descriptor.function_name(), "Resuming step");
            live.execution.lock().on_resume(&live.context);
        }
        Ok(group)
    }
}
