//! Resumable virtual machine
//!
//! The VM holds all execution state:
//! - chunk/pc: where execution continues
//! - stack: operand stack
//! - scopes: variable scopes, innermost last
//! - handlers: active try blocks
//!
//! All of it serializes, which is what makes a suspended script durable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::compiler::{Instr, Program};
use super::values::{self, Closure, Val};
use crate::engine::{Continuable, Outcome, Pickle, StackFrame, StepRequest, Yield};
use crate::error::{codes, EngineResult, Failure};

/* ===================== VM ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    /// Runnable; a failure input is raised at the current pc
    Ready,
    /// Suspended on a step call; the input is that call's result
    AwaitingStep,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Handler {
    catch_pc: usize,
    stack_len: usize,
    scope_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    program: Arc<Program>,
    chunk: usize,
    pc: usize,
    stack: Vec<Val>,
    scopes: Vec<BTreeMap<String, Val>>,
    handlers: Vec<Handler>,
    state: VmState,
    /// Instructions per `run` before yielding at a safepoint
    budget: usize,
}

type Step = Result<Option<Yield>, Failure>;

impl Vm {
    /// VM for a program's main chunk
    pub fn new(program: Arc<Program>, budget: usize) -> Self {
        Vm {
            program,
            chunk: 0,
            pc: 0,
            stack: Vec::new(),
            scopes: vec![BTreeMap::new()],
            handlers: Vec::new(),
            state: VmState::Ready,
            budget: budget.max(1),
        }
    }

    /// VM that runs a closure body with its captured variables
    pub fn for_closure(closure: &Closure, budget: usize) -> Self {
        Vm {
            program: Arc::clone(&closure.program),
            chunk: closure.chunk,
            pc: 0,
            stack: Vec::new(),
            scopes: vec![closure.captured.clone()],
            handlers: Vec::new(),
            state: VmState::Ready,
            budget: budget.max(1),
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn calls_steps(&self) -> bool {
        self.program
            .chunks
            .get(self.chunk)
            .map(|c| c.calls_steps)
            .unwrap_or(true)
    }

    /// Drive until completion, a step call, or the instruction budget runs out
    pub fn run(&mut self, input: Outcome) -> Yield {
        match self.state {
            VmState::Done => {
                return Yield::Completed(Err(Failure::new(
                    codes::NOT_RESUMABLE,
                    "script has already completed",
                )))
            }
            VmState::AwaitingStep => {
                self.state = VmState::Ready;
                match input {
                    Ok(value) => self.stack.push(value),
                    Err(failure) => {
                        if let Some(done) = self.throw(failure) {
                            return done;
                        }
                    }
                }
            }
            VmState::Ready => {
                if let Err(failure) = input {
                    if let Some(done) = self.throw(failure) {
                        return done;
                    }
                }
            }
        }

        for _ in 0..self.budget {
            match self.step() {
                Ok(None) => {}
                Ok(Some(yielded)) => return yielded,
                Err(failure) => {
                    if let Some(done) = self.throw(failure) {
                        return done;
                    }
                }
            }
        }
        Yield::Safepoint
    }

    /// Unwind to the innermost handler, or complete with the failure
    fn throw(&mut self, failure: Failure) -> Option<Yield> {
        match self.handlers.pop() {
            Some(handler) => {
                self.stack.truncate(handler.stack_len);
                self.scopes.truncate(handler.scope_len);
                self.stack.push(Val::Error(failure));
                self.pc = handler.catch_pc;
                None
            }
            None => {
                self.state = VmState::Done;
                self.stack.clear();
                Some(Yield::Completed(Err(failure)))
            }
        }
    }

    fn pop(&mut self) -> Result<Val, Failure> {
        self.stack
            .pop()
            .ok_or_else(|| Failure::internal("operand stack underflow"))
    }

    fn peek(&self) -> Result<&Val, Failure> {
        self.stack
            .last()
            .ok_or_else(|| Failure::internal("operand stack underflow"))
    }

    fn lookup(&self, name: &str) -> Result<Val, Failure> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .cloned()
            .ok_or_else(|| {
                Failure::new(
                    codes::UNDEFINED_VARIABLE,
                    format!("'{}' is not defined", name),
                )
            })
    }

    fn assign(&mut self, name: &str, value: Val) {
        if let Some(slot) = self
            .scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
        {
            *slot = value;
            return;
        }
        // Undeclared names become script-level bindings
        if self.scopes.is_empty() {
            self.scopes.push(BTreeMap::new());
        }
        self.scopes[0].insert(name.to_string(), value);
    }

    /// Visible variables, inner scopes shadowing outer ones
    fn visible(&self) -> BTreeMap<String, Val> {
        let mut out = BTreeMap::new();
        for scope in &self.scopes {
            for (k, v) in scope {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }

    fn step(&mut self) -> Step {
        let program = Arc::clone(&self.program);
        let chunk = program
            .chunks
            .get(self.chunk)
            .ok_or_else(|| Failure::internal(format!("no chunk {}", self.chunk)))?;

        let Some(instr) = chunk.code.get(self.pc) else {
            self.state = VmState::Done;
            return Ok(Some(Yield::Completed(Ok(Val::Null))));
        };
        self.pc += 1;

        match instr {
            Instr::Const(value) => self.stack.push(value.clone()),
            Instr::Load(name) => {
                let value = self.lookup(name)?;
                self.stack.push(value);
            }
            Instr::Declare(name) => {
                let value = self.pop()?;
                if self.scopes.is_empty() {
                    self.scopes.push(BTreeMap::new());
                }
                if let Some(scope) = self.scopes.last_mut() {
                    scope.insert(name.clone(), value);
                }
            }
            Instr::Store(name) => {
                let value = self.pop()?;
                self.assign(name, value);
            }
            Instr::Pop => {
                self.pop()?;
            }
            Instr::Binary(op) => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.stack.push(values::binary(*op, left, right)?);
            }
            Instr::Unary(op) => {
                let operand = self.pop()?;
                self.stack.push(values::unary(*op, operand)?);
            }
            Instr::MakeList(n) => {
                if *n > self.stack.len() {
                    return Err(Failure::internal("operand stack underflow"));
                }
                let items = self.stack.split_off(self.stack.len() - n);
                self.stack.push(Val::List(items));
            }
            Instr::MakeClosure(index) => {
                let closure = Closure {
                    program: Arc::clone(&program),
                    chunk: *index,
                    captured: self.visible(),
                };
                self.stack.push(Val::Closure(closure));
            }
            Instr::Call {
                function,
                argc,
                body,
            } => {
                let body = if *body {
                    match self.pop()? {
                        Val::Closure(closure) => Some(closure),
                        other => {
                            return Err(Failure::internal(format!(
                                "expected closure body, found {}",
                                other.type_name()
                            )))
                        }
                    }
                } else {
                    None
                };
                if *argc > self.stack.len() {
                    return Err(Failure::internal("operand stack underflow"));
                }
                let args = self.stack.split_off(self.stack.len() - argc);
                self.state = VmState::AwaitingStep;
                return Ok(Some(Yield::Step(StepRequest {
                    function: function.clone(),
                    args,
                    body,
                })));
            }
            Instr::Jump(target) => self.pc = *target,
            Instr::JumpIfFalse(target) => {
                if !self.pop()?.is_truthy() {
                    self.pc = *target;
                }
            }
            Instr::JumpIfFalseKeep(target) => {
                if !self.peek()?.is_truthy() {
                    self.pc = *target;
                }
            }
            Instr::JumpIfTrueKeep(target) => {
                if self.peek()?.is_truthy() {
                    self.pc = *target;
                }
            }
            Instr::EnterScope => self.scopes.push(BTreeMap::new()),
            Instr::ExitScope => {
                self.scopes.pop();
            }
            Instr::PushHandler(catch_pc) => self.handlers.push(Handler {
                catch_pc: *catch_pc,
                stack_len: self.stack.len(),
                scope_len: self.scopes.len(),
            }),
            Instr::PopHandler => {
                self.handlers.pop();
            }
            Instr::Throw => {
                let value = self.pop()?;
                return Err(value.into_failure());
            }
            Instr::Return => {
                let value = self.stack.pop().unwrap_or(Val::Null);
                self.state = VmState::Done;
                self.stack.clear();
                self.handlers.clear();
                return Ok(Some(Yield::Completed(Ok(value))));
            }
        }
        Ok(None)
    }
}

impl Continuable for Vm {
    fn drive(&mut self, input: Outcome) -> Yield {
        self.run(input)
    }

    fn is_resumable(&self) -> bool {
        self.state != VmState::Done
    }

    fn stack_trace(&self) -> Vec<StackFrame> {
        let Some(chunk) = self.program.chunks.get(self.chunk) else {
            return Vec::new();
        };
        vec![StackFrame {
            function: chunk.name.clone(),
            line: chunk.line_at(self.pc.saturating_sub(1)),
        }]
    }

    fn snapshot(&self) -> EngineResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn pickles(&self) -> Vec<Pickle> {
        let mut out = Vec::new();
        for value in &self.stack {
            value.collect_handles(&mut out);
        }
        for scope in &self.scopes {
            for value in scope.values() {
                value.collect_handles(&mut out);
            }
        }
        out.sort();
        out.dedup();
        out
    }
}
