//! Error types
//!
//! Two families live here:
//! - `Failure`: a serializable failure value. It flows through scripts (catchable),
//!   step outcomes and history nodes, and survives persistence.
//! - `EngineError`: typed errors raised by the engine machinery itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::DurabilityHint;
use crate::engine::ThreadId;
use crate::flow::{HeadId, NodeId};
use crate::parser::ParseError;
use crate::script::compiler::CompileError;

/* ===================== Failure Codes ===================== */

/// Failure codes
pub mod codes {
    pub const SCRIPT_ERROR: &str = "ScriptError";
    pub const TYPE_ERROR: &str = "TypeError";
    pub const UNDEFINED_VARIABLE: &str = "UndefinedVariable";
    pub const DIVISION_BY_ZERO: &str = "DivisionByZero";
    pub const STEP_FAILED: &str = "StepFailed";
    pub const NO_SUCH_STEP: &str = "NoSuchStep";
    pub const MISSING_BODY: &str = "MissingBody";
    pub const WRONG_ARG_COUNT: &str = "WrongArgumentCount";
    pub const WRONG_ARG_TYPE: &str = "WrongArgumentType";
    pub const INTERRUPTED: &str = "Interrupted";
    pub const STOP_TIMEOUT: &str = "StopTimeout";
    pub const DUPLICATE_OUTCOME: &str = "DuplicateOutcome";
    pub const SANDBOX_REJECTED: &str = "SandboxRejected";
    pub const NOT_RESUMABLE: &str = "NotResumable";
    pub const LOAD_FAILED: &str = "LoadFailed";
    pub const INTERNAL: &str = "InternalError";
    /// Reserved for releasing consumed outcomes; never shown to scripts
    pub const ALREADY_COMPLETED: &str = "AlreadyCompleted";
}

/* ===================== Failure ===================== */

/// A failure delivered to a script or recorded on a history node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub code: String,
    pub message: String,
    /// Later failures merged into this one without replacing it
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppressed: Vec<Failure>,
}

impl Failure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            suppressed: Vec::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, message)
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(codes::INTERRUPTED, message)
    }

    pub(crate) fn already_completed() -> Self {
        Self::new(codes::ALREADY_COMPLETED, "outcome already consumed")
    }

    pub fn is_already_completed(&self) -> bool {
        self.code == codes::ALREADY_COMPLETED
    }

    pub fn is_interrupted(&self) -> bool {
        self.code == codes::INTERRUPTED
    }

    /// Chain another failure as suppressed detail
    pub fn add_suppressed(&mut self, other: Failure) {
        self.suppressed.push(other);
    }

    pub fn with_suppressed(mut self, other: Failure) -> Self {
        self.add_suppressed(other);
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        for suppressed in &self.suppressed {
            write!(f, " (suppressed {})", suppressed)?;
        }
        Ok(())
    }
}

impl std::error::Error for Failure {}

impl From<EngineError> for Failure {
    fn from(err: EngineError) -> Self {
        Failure::internal(err.to_string())
    }
}

/* ===================== Engine Errors ===================== */

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("history node {0} not found")]
    MissingNode(NodeId),

    #[error("flow head {0} not found")]
    MissingHead(HeadId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("thread {0} already has a pending resume value")]
    ResumeAlreadyPending(ThreadId),

    #[error("thread {0} not found")]
    NoSuchThread(ThreadId),

    #[error("step {0} was not given a body")]
    MissingBody(String),

    #[error("scheduler lane is closed")]
    LaneClosed,

    #[error("program is not loaded")]
    ProgramNotReady,

    #[error("execution was not cleanly shut down and cannot be resumed")]
    NotCleanlyShutDown,

    #[error("durability level {0} is too low to resume after a restart")]
    DurabilityTooLow(DurabilityHint),

    #[error("script text does not match the saved fingerprint")]
    ScriptMismatch,

    #[error("step {0} could not be restored: {1}")]
    StepRestore(String, String),

    #[error("pickle {0} could not be resolved: {1}")]
    Pickle(String, String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("execution is already complete")]
    AlreadyComplete,

    #[error("no async runtime available: {0}")]
    NoRuntime(String),

    #[error("program load was cancelled")]
    Cancelled,
}

pub type EngineResult<T> = Result<T, EngineError>;
