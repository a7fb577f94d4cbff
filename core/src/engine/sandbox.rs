//! Sandboxed continuations

use std::collections::BTreeSet;
use std::sync::Arc;

use super::continuation::{Continuable, Outcome, StackFrame, Yield};
use super::pickle::Pickle;
use crate::error::{codes, EngineResult, Failure};

/// Decides which steps a sandboxed script may call
pub trait SandboxPolicy: Send + Sync {
    fn permits(&self, function: &str) -> bool;
}

/// Policy that permits a fixed set of steps
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    allowed: BTreeSet<String>,
}

impl AllowList {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

impl SandboxPolicy for AllowList {
    fn permits(&self, function: &str) -> bool {
        self.allowed.contains(function)
    }
}

/// Continuation wrapper that vets every step request
///
/// A rejected call is answered with a `SandboxRejected` failure at the call
/// site, which the script may catch.
pub struct SandboxedContinuable {
    inner: Box<dyn Continuable>,
    policy: Arc<dyn SandboxPolicy>,
}

impl SandboxedContinuable {
    pub fn new(inner: Box<dyn Continuable>, policy: Arc<dyn SandboxPolicy>) -> Self {
        Self { inner, policy }
    }
}

impl Continuable for SandboxedContinuable {
    fn drive(&mut self, input: Outcome) -> Yield {
        let mut yielded = self.inner.drive(input);
        loop {
            match yielded {
                Yield::Step(ref request) if !self.policy.permits(&request.function) => {
                    tracing::warn!(function = %request.function, "Sandbox rejected step call");
                    let failure = Failure::new(
                        codes::SANDBOX_REJECTED,
                        format!("'{}' is not permitted in the sandbox", request.function),
                    );
                    yielded = self.inner.drive(Err(failure));
                }
                other => return other,
            }
        }
    }

    fn is_resumable(&self) -> bool {
        self.inner.is_resumable()
    }

    fn stack_trace(&self) -> Vec<StackFrame> {
        self.inner.stack_trace()
    }

    fn snapshot(&self) -> EngineResult<serde_json::Value> {
        self.inner.snapshot()
    }

    fn pickles(&self) -> Vec<Pickle> {
        self.inner.pickles()
    }
}
