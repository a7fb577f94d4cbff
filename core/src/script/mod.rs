//! Script runtime: AST, compiler, values and the resumable VM
//!
//! `ScriptEngine` is the concrete `ScriptRuntime` the engine uses by default.

pub mod ast;
pub mod compiler;
pub mod values;
pub mod vm;


use std::sync::Arc;

pub use compiler::{compile, CompileError, Program};
pub use values::{Closure, Val};
pub use vm::{Vm, VmState};

use crate::engine::{BodyCall, Continuable, ScriptRuntime, Yield};
use crate::error::{EngineResult, Failure};
use crate::parser::parse_script;

/// Parses, compiles and runs scripts on the resumable VM
#[derive(Debug, Clone)]
pub struct ScriptEngine {
    budget: usize,
}

impl ScriptEngine {
    pub fn new(budget: usize) -> Self {
        Self {
            budget: budget.max(1),
        }
    }

    pub fn program(&self, name: &str, source: &str) -> EngineResult<Arc<Program>> {
        let script = parse_script(source)?;
        let program = compile(name, &script)?;
        Ok(Arc::new(program))
    }
}

impl ScriptRuntime for ScriptEngine {
    fn compile(&self, name: &str, source: &str) -> EngineResult<Box<dyn Continuable>> {
        let program = self.program(name, source)?;
        Ok(Box::new(Vm::new(program, self.budget)))
    }

    fn load_body(&self, name: &str, source: &str) -> EngineResult<Closure> {
        let program = self.program(name, source)?;
        Ok(Closure {
            program,
            chunk: 0,
            captured: Default::default(),
        })
    }

    fn invoke_body(&self, body: &Closure) -> BodyCall {
        let mut vm = Vm::for_closure(body, self.budget);
        if vm.calls_steps() {
            return BodyCall::Deferred(Box::new(vm));
        }
        match vm.run(Ok(Val::Null)) {
            Yield::Completed(outcome) => BodyCall::Completed(outcome),
            // Still running after its budget: finish it as a thread
            Yield::Safepoint => BodyCall::Deferred(Box::new(vm)),
            Yield::Step(request) => BodyCall::Completed(Err(Failure::internal(format!(
                "body without step calls requested '{}'",
                request.function
            )))),
        }
    }

    fn restore(&self, snapshot: serde_json::Value) -> EngineResult<Box<dyn Continuable>> {
        let vm: Vm = serde_json::from_value(snapshot)?;
        Ok(Box::new(vm))
    }
}
