//! AST to flat instruction lists
//!
//! Each chunk is a straight-line list of instructions with explicit jumps, so a
//! suspended VM only has to remember a chunk index and a program counter.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ast::{BinaryOp, Expr, Stmt, UnaryOp};
use super::values::Val;
use crate::parser::ScriptDef;

/* ===================== Program ===================== */

/// A compiled script: chunk 0 is the script body, the rest are closures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub name: String,
    pub code: Vec<Instr>,
    /// Source line (1-indexed) for each instruction
    pub lines: Vec<usize>,
    /// True if the chunk contains a step call
    pub calls_steps: bool,
}

impl Chunk {
    pub fn line_at(&self, pc: usize) -> usize {
        self.lines
            .get(pc)
            .or_else(|| self.lines.last())
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg")]
pub enum Instr {
    Const(Val),
    Load(String),
    /// Pop and bind in the innermost scope
    Declare(String),
    /// Pop and assign to the nearest binding
    Store(String),
    Pop,
    Binary(BinaryOp),
    Unary(UnaryOp),
    MakeList(usize),
    MakeClosure(usize),
    /// Pop arguments (and the body closure when `body`) and yield to the engine
    Call {
        function: String,
        argc: usize,
        body: bool,
    },
    Jump(usize),
    JumpIfFalse(usize),
    /// Jump leaving the tested value on the stack
    JumpIfFalseKeep(usize),
    JumpIfTrueKeep(usize),
    EnterScope,
    ExitScope,
    PushHandler(usize),
    PopHandler,
    Throw,
    Return,
}

/* ===================== Errors ===================== */

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("line {line}: '{keyword}' outside of a loop")]
    OutsideLoop { keyword: &'static str, line: usize },
}

/* ===================== Compiler ===================== */

/// Compile a parsed script into a program named `name`
pub fn compile(name: &str, script: &ScriptDef) -> Result<Program, CompileError> {
    let mut compiler = Compiler {
        name: name.to_string(),
        chunks: Vec::new(),
        closures: 0,
    };
    let main = compiler.reserve(name.to_string());
    let mut builder = ChunkBuilder::default();
    compiler.stmt(&mut builder, &script.body)?;
    compiler.finish(main, builder);
    Ok(Program {
        name: compiler.name,
        chunks: compiler.chunks,
    })
}

struct Compiler {
    name: String,
    chunks: Vec<Chunk>,
    closures: usize,
}

#[derive(Default)]
struct ChunkBuilder {
    code: Vec<Instr>,
    lines: Vec<usize>,
    calls_steps: bool,
    line: usize,
    scope_depth: usize,
    handler_depth: usize,
    loops: Vec<LoopFrame>,
}

struct LoopFrame {
    start: usize,
    breaks: Vec<usize>,
    scope_depth: usize,
    handler_depth: usize,
}

impl ChunkBuilder {
    fn emit(&mut self, instr: Instr) -> usize {
        if matches!(instr, Instr::Call { .. }) {
            self.calls_steps = true;
        }
        self.code.push(instr);
        self.lines.push(self.line);
        self.code.len() - 1
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    /// Point the jump at `at` to `target`
    fn patch(&mut self, at: usize, target: usize) {
        match &mut self.code[at] {
            Instr::Jump(t)
            | Instr::JumpIfFalse(t)
            | Instr::JumpIfFalseKeep(t)
            | Instr::JumpIfTrueKeep(t)
            | Instr::PushHandler(t) => *t = target,
            _ => {}
        }
    }

    /// Emit the scope and handler exits needed to leave the innermost loop
    fn unwind_to_loop(&mut self, keyword: &'static str) -> Result<(), CompileError> {
        let (scope_depth, handler_depth) = match self.loops.last() {
            Some(frame) => (frame.scope_depth, frame.handler_depth),
            None => {
                return Err(CompileError::OutsideLoop {
                    keyword,
                    line: self.line,
                })
            }
        };
        for _ in handler_depth..self.handler_depth {
            self.emit(Instr::PopHandler);
        }
        for _ in scope_depth..self.scope_depth {
            self.emit(Instr::ExitScope);
        }
        Ok(())
    }
}

impl Compiler {
    fn reserve(&mut self, name: String) -> usize {
        self.chunks.push(Chunk {
            name,
            code: Vec::new(),
            lines: Vec::new(),
            calls_steps: false,
        });
        self.chunks.len() - 1
    }

    fn finish(&mut self, index: usize, mut builder: ChunkBuilder) {
        builder.emit(Instr::Const(Val::Null));
        builder.emit(Instr::Return);
        let chunk = &mut self.chunks[index];
        chunk.code = builder.code;
        chunk.lines = builder.lines;
        chunk.calls_steps = builder.calls_steps;
    }

    fn stmt(&mut self, b: &mut ChunkBuilder, stmt: &Stmt) -> Result<(), CompileError> {
        b.line = stmt.span().line();
        match stmt {
            Stmt::Block { body, .. } => {
                b.emit(Instr::EnterScope);
                b.scope_depth += 1;
                for s in body {
                    self.stmt(b, s)?;
                }
                b.scope_depth -= 1;
                b.emit(Instr::ExitScope);
            }
            Stmt::Let { name, init, .. } => {
                match init {
                    Some(expr) => self.expr(b, expr)?,
                    None => {
                        b.emit(Instr::Const(Val::Null));
                    }
                }
                b.emit(Instr::Declare(name.clone()));
            }
            Stmt::Assign { name, value, .. } => {
                self.expr(b, value)?;
                b.emit(Instr::Store(name.clone()));
            }
            Stmt::If {
                test,
                then_s,
                else_s,
                ..
            } => {
                self.expr(b, test)?;
                let to_else = b.emit(Instr::JumpIfFalse(0));
                self.stmt(b, then_s)?;
                match else_s {
                    Some(else_s) => {
                        let to_end = b.emit(Instr::Jump(0));
                        let else_start = b.here();
                        b.patch(to_else, else_start);
                        self.stmt(b, else_s)?;
                        let end = b.here();
                        b.patch(to_end, end);
                    }
                    None => {
                        let end = b.here();
                        b.patch(to_else, end);
                    }
                }
            }
            Stmt::While { test, body, .. } => {
                let start = b.here();
                self.expr(b, test)?;
                let to_end = b.emit(Instr::JumpIfFalse(0));
                b.loops.push(LoopFrame {
                    start,
                    breaks: Vec::new(),
                    scope_depth: b.scope_depth,
                    handler_depth: b.handler_depth,
                });
                self.stmt(b, body)?;
                b.emit(Instr::Jump(start));
                let end = b.here();
                b.patch(to_end, end);
                if let Some(frame) = b.loops.pop() {
                    for at in frame.breaks {
                        b.patch(at, end);
                    }
                }
            }
            Stmt::Try {
                body,
                catch_var,
                catch_body,
                ..
            } => {
                let handler = b.emit(Instr::PushHandler(0));
                b.handler_depth += 1;
                self.stmt(b, body)?;
                b.handler_depth -= 1;
                b.emit(Instr::PopHandler);
                let to_end = b.emit(Instr::Jump(0));

                let catch_start = b.here();
                b.patch(handler, catch_start);
                b.emit(Instr::EnterScope);
                b.scope_depth += 1;
                b.emit(Instr::Declare(catch_var.clone()));
                self.stmt(b, catch_body)?;
                b.scope_depth -= 1;
                b.emit(Instr::ExitScope);

                let end = b.here();
                b.patch(to_end, end);
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(expr) => self.expr(b, expr)?,
                    None => {
                        b.emit(Instr::Const(Val::Null));
                    }
                }
                b.emit(Instr::Return);
            }
            Stmt::Throw { value, .. } => {
                self.expr(b, value)?;
                b.emit(Instr::Throw);
            }
            Stmt::Expr { expr, .. } => {
                self.expr(b, expr)?;
                b.emit(Instr::Pop);
            }
            Stmt::Break { .. } => {
                b.unwind_to_loop("break")?;
                let at = b.emit(Instr::Jump(0));
                if let Some(frame) = b.loops.last_mut() {
                    frame.breaks.push(at);
                }
            }
            Stmt::Continue { .. } => {
                b.unwind_to_loop("continue")?;
                let start = b.loops.last().map(|f| f.start).unwrap_or(0);
                b.emit(Instr::Jump(start));
            }
        }
        Ok(())
    }

    fn expr(&mut self, b: &mut ChunkBuilder, expr: &Expr) -> Result<(), CompileError> {
        let span = expr.span();
        if span.end > 0 {
            b.line = span.line();
        }
        match expr {
            Expr::LitNull { .. } => {
                b.emit(Instr::Const(Val::Null));
            }
            Expr::LitBool { v, .. } => {
                b.emit(Instr::Const(Val::Bool(*v)));
            }
            Expr::LitNum { v, .. } => {
                b.emit(Instr::Const(Val::Num(*v)));
            }
            Expr::LitStr { v, .. } => {
                b.emit(Instr::Const(Val::Str(v.clone())));
            }
            Expr::LitList { elements, .. } => {
                for element in elements {
                    self.expr(b, element)?;
                }
                b.emit(Instr::MakeList(elements.len()));
            }
            Expr::Ident { name, .. } => {
                b.emit(Instr::Load(name.clone()));
            }
            Expr::Call {
                callee, args, body, ..
            } => {
                for arg in args {
                    self.expr(b, arg)?;
                }
                if let Some(body) = body {
                    let chunk = self.closure_chunk(body)?;
                    b.emit(Instr::MakeClosure(chunk));
                }
                b.line = span.line();
                b.emit(Instr::Call {
                    function: callee.clone(),
                    argc: args.len(),
                    body: body.is_some(),
                });
            }
            Expr::Closure { body, .. } => {
                let chunk = self.closure_chunk(body)?;
                b.emit(Instr::MakeClosure(chunk));
            }
            Expr::Unary { op, operand, .. } => {
                self.expr(b, operand)?;
                b.emit(Instr::Unary(*op));
            }
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
                ..
            } => {
                self.expr(b, left)?;
                let to_end = b.emit(Instr::JumpIfFalseKeep(0));
                b.emit(Instr::Pop);
                self.expr(b, right)?;
                let end = b.here();
                b.patch(to_end, end);
            }
            Expr::Binary {
                op: BinaryOp::Or,
                left,
                right,
                ..
            } => {
                self.expr(b, left)?;
                let to_end = b.emit(Instr::JumpIfTrueKeep(0));
                b.emit(Instr::Pop);
                self.expr(b, right)?;
                let end = b.here();
                b.patch(to_end, end);
            }
            Expr::Binary {
                op, left, right, ..
            } => {
                self.expr(b, left)?;
                self.expr(b, right)?;
                b.emit(Instr::Binary(*op));
            }
        }
        Ok(())
    }

    /// Compile a closure body into its own chunk
    fn closure_chunk(&mut self, body: &Stmt) -> Result<usize, CompileError> {
        self.closures += 1;
        let index = self.reserve(format!("{}#closure{}", self.name, self.closures));
        let mut builder = ChunkBuilder {
            line: body.span().line(),
            ..ChunkBuilder::default()
        };
        self.stmt(&mut builder, body)?;
        self.finish(index, builder);
        Ok(index)
    }
}
