//! Runtime values

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::ast::{BinaryOp, UnaryOp};
use super::compiler::Program;
use crate::engine::Pickle;
use crate::error::{codes, Failure};

/// A script value
///
/// Everything a suspended script holds is one of these, so the whole
/// program state serializes with serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Val {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Val>),
    Map(BTreeMap<String, Val>),
    Closure(Closure),
    Error(Failure),
    /// Durable reference to an object living outside the script
    Handle(Pickle),
}

/// A closure literal together with the variables visible where it was created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    pub program: Arc<Program>,
    pub chunk: usize,
    pub captured: BTreeMap<String, Val>,
}

impl Closure {
    pub fn name(&self) -> &str {
        self.program
            .chunks
            .get(self.chunk)
            .map(|c| c.name.as_str())
            .unwrap_or("<closure>")
    }

    /// Whether running the closure can reach a step call
    pub fn calls_steps(&self) -> bool {
        self.program
            .chunks
            .get(self.chunk)
            .map(|c| c.calls_steps)
            .unwrap_or(true)
    }
}

impl Val {
    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Null => "null",
            Val::Bool(_) => "bool",
            Val::Num(_) => "number",
            Val::Str(_) => "string",
            Val::List(_) => "list",
            Val::Map(_) => "map",
            Val::Closure(_) => "closure",
            Val::Error(_) => "error",
            Val::Handle(_) => "handle",
        }
    }

    /// Only `false` and `null` are falsy
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Val::Null | Val::Bool(false))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Val::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Val::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Closure> {
        match self {
            Val::Closure(c) => Some(c),
            _ => None,
        }
    }

    /// Turn a thrown value into the failure it represents
    pub fn into_failure(self) -> Failure {
        match self {
            Val::Error(failure) => failure,
            other => Failure::new(codes::SCRIPT_ERROR, other.to_string()),
        }
    }

    /// Collect every handle reachable from this value
    pub fn collect_handles(&self, out: &mut Vec<Pickle>) {
        match self {
            Val::Handle(p) => out.push(p.clone()),
            Val::List(items) => items.iter().for_each(|v| v.collect_handles(out)),
            Val::Map(map) => map.values().for_each(|v| v.collect_handles(out)),
            Val::Closure(c) => c.captured.values().for_each(|v| v.collect_handles(out)),
            _ => {}
        }
    }
}

impl From<&str> for Val {
    fn from(s: &str) -> Self {
        Val::Str(s.to_string())
    }
}

impl From<String> for Val {
    fn from(s: String) -> Self {
        Val::Str(s)
    }
}

impl From<f64> for Val {
    fn from(n: f64) -> Self {
        Val::Num(n)
    }
}

impl From<bool> for Val {
    fn from(b: bool) -> Self {
        Val::Bool(b)
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Null => write!(f, "null"),
            Val::Bool(b) => write!(f, "{}", b),
            Val::Num(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Val::Str(s) => write!(f, "{}", s),
            Val::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Val::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Val::Closure(c) => write!(f, "<{}>", c.name()),
            Val::Error(failure) => write!(f, "{}", failure.message),
            Val::Handle(p) => write!(f, "<{}:{}>", p.kind, p.key),
        }
    }
}

/* ===================== Operators ===================== */

fn type_error(op: &str, left: &Val, right: &Val) -> Failure {
    Failure::new(
        codes::TYPE_ERROR,
        format!(
            "cannot apply '{}' to {} and {}",
            op,
            left.type_name(),
            right.type_name()
        ),
    )
}

/// Evaluate a non-short-circuit binary operator
pub fn binary(op: BinaryOp, left: Val, right: Val) -> Result<Val, Failure> {
    use BinaryOp::*;
    match op {
        Eq => Ok(Val::Bool(left == right)),
        Ne => Ok(Val::Bool(left != right)),
        Add => match (&left, &right) {
            (Val::Num(a), Val::Num(b)) => Ok(Val::Num(a + b)),
            (Val::Str(_), _) | (_, Val::Str(_)) => Ok(Val::Str(format!("{}{}", left, right))),
            (Val::List(a), Val::List(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Val::List(out))
            }
            _ => Err(type_error("+", &left, &right)),
        },
        Sub | Mul | Div | Mod => {
            let (Val::Num(a), Val::Num(b)) = (&left, &right) else {
                return Err(type_error(op_symbol(op), &left, &right));
            };
            let (a, b) = (*a, *b);
            match op {
                Sub => Ok(Val::Num(a - b)),
                Mul => Ok(Val::Num(a * b)),
                Div | Mod if b == 0.0 => {
                    Err(Failure::new(codes::DIVISION_BY_ZERO, "division by zero"))
                }
                Div => Ok(Val::Num(a / b)),
                _ => Ok(Val::Num(a % b)),
            }
        }
        Lt | Lte | Gt | Gte => {
            let ordering = match (&left, &right) {
                (Val::Num(a), Val::Num(b)) => a.partial_cmp(b),
                (Val::Str(a), Val::Str(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let ordering = ordering.ok_or_else(|| type_error(op_symbol(op), &left, &right))?;
            Ok(Val::Bool(match op {
                Lt => ordering.is_lt(),
                Lte => ordering.is_le(),
                Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        And | Or => Err(Failure::internal("short-circuit operator evaluated eagerly")),
    }
}

pub fn unary(op: UnaryOp, operand: Val) -> Result<Val, Failure> {
    match op {
        UnaryOp::Not => Ok(Val::Bool(!operand.is_truthy())),
        UnaryOp::Neg => match operand {
            Val::Num(n) => Ok(Val::Num(-n)),
            other => Err(Failure::new(
                codes::TYPE_ERROR,
                format!("cannot negate {}", other.type_name()),
            )),
        },
    }
}

fn op_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
        BinaryOp::Eq => "==",
        BinaryOp::Ne => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Lte => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Gte => ">=",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
    }
}
