//! The continuation contract consumed by the scheduler

use serde::{Deserialize, Serialize};
use std::fmt;

use super::pickle::Pickle;
use crate::error::{EngineResult, Failure};
use crate::script::{Closure, Val};

/// Result of a completed computation
pub type Outcome = Result<Val, Failure>;

/// A call out to a step, produced when a continuation suspends
#[derive(Debug, Clone, PartialEq)]
pub struct StepRequest {
    pub function: String,
    pub args: Vec<Val>,
    /// Trailing block, when the call has one
    pub body: Option<Closure>,
}

/// Why a continuation stopped running
#[derive(Debug, Clone, PartialEq)]
pub enum Yield {
    Completed(Outcome),
    Step(StepRequest),
    /// Voluntary yield; resume with `Ok(Null)` to carry on
    Safepoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: String,
    pub line: usize,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}:{}", self.function, self.line)
    }
}

/// A resumable computation
///
/// `drive` runs until completion or the next suspension. A failure given as
/// input is raised at the suspension point.
pub trait Continuable: Send {
    fn drive(&mut self, input: Outcome) -> Yield;

    fn is_resumable(&self) -> bool;

    fn stack_trace(&self) -> Vec<StackFrame>;

    /// Serialized state, restorable through `ScriptRuntime::restore`
    fn snapshot(&self) -> EngineResult<serde_json::Value>;

    /// Durable references held by the suspended state
    fn pickles(&self) -> Vec<Pickle>;
}

/// Result of asking the runtime to run a body closure
pub enum BodyCall {
    /// Ran to completion in place
    Completed(Outcome),
    /// Must run as its own thread
    Deferred(Box<dyn Continuable>),
}

impl fmt::Debug for BodyCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyCall::Completed(outcome) => f.debug_tuple("Completed").field(outcome).finish(),
            BodyCall::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Compiles scripts and produces continuations
pub trait ScriptRuntime: Send + Sync {
    /// Continuation for a whole script
    fn compile(&self, name: &str, source: &str) -> EngineResult<Box<dyn Continuable>>;

    /// Compile a script into a closure that can be run as a body
    fn load_body(&self, name: &str, source: &str) -> EngineResult<Closure>;

    fn invoke_body(&self, body: &Closure) -> BodyCall;

    fn restore(&self, snapshot: serde_json::Value) -> EngineResult<Box<dyn Continuable>>;
}
