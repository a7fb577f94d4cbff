//! Execution thread: one continuation and its pending resume value

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::oneshot;

use super::continuation::{Continuable, Outcome, StackFrame, Yield};
use crate::error::{EngineError, EngineResult, Failure};
use crate::flow::{HeadId, NodeId};
use crate::script::Val;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A branch head opened for a body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub head: HeadId,
    pub start: NodeId,
}

/// What to do when a thread's continuation completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ThreadCompletion {
    /// The script itself: its outcome is the program's outcome
    Root,
    /// A body started by the step at `step`
    Body {
        step: NodeId,
        index: usize,
        branch: Option<Branch>,
    },
}

/// Persisted form of a thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub continuation: serde_json::Value,
    pub resume_value: Option<Outcome>,
    pub head: HeadId,
    pub step: Option<NodeId>,
    pub completions: Vec<ThreadCompletion>,
    #[serde(default)]
    pub variables: BTreeMap<String, Val>,
}

pub struct ExecThread {
    pub(crate) id: ThreadId,
    continuation: Option<Box<dyn Continuable>>,
    resume_value: Option<Outcome>,
    resume_ack: Option<oneshot::Sender<()>>,
    /// Head this thread extends
    pub(crate) head: HeadId,
    /// Step this thread is waiting on
    pub(crate) step: Option<NodeId>,
    pub(crate) completions: Vec<ThreadCompletion>,
    pub(crate) variables: BTreeMap<String, Val>,
}

impl fmt::Debug for ExecThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecThread")
            .field("id", &self.id)
            .field("head", &self.head)
            .field("step", &self.step)
            .field("runnable", &self.is_runnable())
            .finish()
    }
}

impl ExecThread {
    pub(crate) fn new(
        id: ThreadId,
        continuation: Box<dyn Continuable>,
        head: HeadId,
        variables: BTreeMap<String, Val>,
    ) -> Self {
        Self {
            id,
            continuation: Some(continuation),
            resume_value: None,
            resume_ack: None,
            head,
            step: None,
            completions: Vec::new(),
            variables,
        }
    }

    pub(crate) fn restore(snapshot: ThreadSnapshot, continuation: Box<dyn Continuable>) -> Self {
        Self {
            id: snapshot.id,
            continuation: Some(continuation),
            resume_value: snapshot.resume_value,
            resume_ack: None,
            head: snapshot.head,
            step: snapshot.step,
            completions: snapshot.completions,
            variables: snapshot.variables,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Runnable iff a resume value is pending
    pub fn is_runnable(&self) -> bool {
        self.resume_value.is_some() && self.continuation.is_some()
    }

    pub fn is_alive(&self) -> bool {
        self.continuation
            .as_ref()
            .map(|c| c.is_resumable())
            .unwrap_or(false)
    }

    pub fn stack_trace(&self) -> Vec<StackFrame> {
        match &self.continuation {
            Some(continuation) => continuation.stack_trace(),
            None => vec![StackFrame {
                function: "<retired>".to_string(),
                line: 0,
            }],
        }
    }

    /// Record a resume value
    ///
    /// Fails if one is already pending. The receiver fires once `advance`
    /// consumes the value.
    pub(crate) fn resume(&mut self, outcome: Outcome) -> EngineResult<oneshot::Receiver<()>> {
        if self.resume_value.is_some() {
            return Err(EngineError::ResumeAlreadyPending(self.id));
        }
        let (tx, rx) = oneshot::channel();
        self.resume_value = Some(outcome);
        self.resume_ack = Some(tx);
        Ok(rx)
    }

    /// Supply a failure as the resume value, replacing an unconsumed one
    ///
    /// Last writer wins against a racing `resume`.
    pub(crate) fn inject(&mut self, failure: Failure) {
        self.resume_value = Some(Err(failure));
    }

    /// Park at a safepoint: runnable again with a null resume value
    pub(crate) fn park_at_safepoint(&mut self) {
        if self.resume_value.is_none() {
            self.resume_value = Some(Ok(Val::Null));
        }
    }

    /// Consume the pending resume value and drive the continuation
    pub(crate) fn advance(&mut self) -> Option<Yield> {
        let input = self.resume_value.take()?;
        if let Some(ack) = self.resume_ack.take() {
            let _ = ack.send(());
        }
        self.drive(input)
    }

    /// Drive with an outcome produced within the same scheduler turn
    pub(crate) fn drive(&mut self, input: Outcome) -> Option<Yield> {
        let continuation = self.continuation.as_mut()?;
        Some(continuation.drive(input))
    }

    /// Drop the continuation; the thread can never run again
    pub(crate) fn retire(&mut self) {
        self.continuation = None;
        self.resume_value = None;
        self.resume_ack = None;
    }

    pub(crate) fn pickles(&self) -> Vec<super::pickle::Pickle> {
        let mut out = self
            .continuation
            .as_ref()
            .map(|c| c.pickles())
            .unwrap_or_default();
        for value in self.variables.values() {
            value.collect_handles(&mut out);
        }
        if let Some(Ok(value)) = &self.resume_value {
            value.collect_handles(&mut out);
        }
        out
    }

    pub(crate) fn snapshot(&self) -> EngineResult<Option<ThreadSnapshot>> {
        let Some(continuation) = &self.continuation else {
            return Ok(None);
        };
        Ok(Some(ThreadSnapshot {
            id: self.id,
            continuation: continuation.snapshot()?,
            resume_value: self.resume_value.clone(),
            head: self.head,
            step: self.step,
            completions: self.completions.clone(),
            variables: self.variables.clone(),
        }))
    }
}
