//! PEST-based parser for workflow scripts
//!
//! Produces the AST in `script::ast`, with span information for error reporting
//! and for the line numbers shown in thread dumps.

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};

use crate::script::ast::{BinaryOp, Expr, Span, Stmt, UnaryOp};


/* ===================== Script Definition ===================== */

/// A parsed script: its top-level statements wrapped in one block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDef {
    pub body: Stmt,
    #[serde(default)]
    pub span: Span,
}

/* ===================== PEST Parser ===================== */

#[derive(Parser)]
#[grammar = "parser/flow.pest"]
struct FlowParser;

/* ===================== Error Types ===================== */

#[derive(Debug)]
pub enum ParseError {
    PestError(String, Option<Span>),
    BuildError(String, Option<Span>),
}

impl ParseError {
    pub fn span(&self) -> Option<Span> {
        match self {
            ParseError::PestError(_, span) => *span,
            ParseError::BuildError(_, span) => *span,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ParseError::PestError(msg, _) => msg,
            ParseError::BuildError(msg, _) => msg,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ParseError {}

impl From<pest::error::Error<Rule>> for ParseError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        let span = match err.line_col {
            pest::error::LineColLocation::Pos((line, col)) => Some(Span {
                start: 0,
                end: 0,
                start_line: line.saturating_sub(1),
                start_col: col.saturating_sub(1),
                end_line: line.saturating_sub(1),
                end_col: col,
            }),
            pest::error::LineColLocation::Span((start_line, start_col), (end_line, end_col)) => {
                Some(Span {
                    start: 0,
                    end: 0,
                    start_line: start_line.saturating_sub(1),
                    start_col: start_col.saturating_sub(1),
                    end_line: end_line.saturating_sub(1),
                    end_col: end_col.saturating_sub(1),
                })
            }
        };
        ParseError::PestError(err.to_string(), span)
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/* ===================== Span Helpers ===================== */

/// Convert a PEST pair's span to our Span type
fn pair_to_span(pair: &Pair<Rule>, source: &str) -> Span {
    let pest_span = pair.as_span();
    let start = pest_span.start();
    let end = pest_span.end();

    let (start_line, start_col) = offset_to_line_col(source, start);
    let (end_line, end_col) = offset_to_line_col(source, end);

    Span::new(start, end, start_line, start_col, end_line, end_col)
}

/// Convert byte offset to (line, column) - 0-indexed
fn offset_to_line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 0;
    let mut col = 0;
    let mut current_offset = 0;

    for ch in source.chars() {
        if current_offset >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 0;
        } else {
            col += 1;
        }
        current_offset += ch.len_utf8();
    }

    (line, col)
}

/// Next child of a pair the grammar guarantees to exist
fn expect_child<'a>(
    inner: &mut pest::iterators::Pairs<'a, Rule>,
    what: &str,
    span: Span,
) -> ParseResult<Pair<'a, Rule>> {
    inner
        .next()
        .ok_or_else(|| ParseError::BuildError(format!("Expected {}", what), Some(span)))
}

/* ===================== Public API ===================== */

/// Parse a script into its definition
pub fn parse_script(source: &str) -> ParseResult<ScriptDef> {
    let mut pairs = FlowParser::parse(Rule::program, source)?;
    let program = pairs
        .next()
        .ok_or_else(|| ParseError::BuildError("Empty parse result".to_string(), None))?;
    let span = pair_to_span(&program, source);

    let mut statements = Vec::new();
    for pair in program.into_inner() {
        match pair.as_rule() {
            Rule::statement => statements.push(build_statement(pair, source)?),
            Rule::EOI => {}
            other => {
                return Err(ParseError::BuildError(
                    format!("Unexpected program content: {:?}", other),
                    Some(span),
                ))
            }
        }
    }

    Ok(ScriptDef {
        body: Stmt::Block {
            body: statements,
            span,
        },
        span,
    })
}

/// Parse a single statement (testing API)
pub fn parse(source: &str) -> ParseResult<Stmt> {
    let script = parse_script(source)?;
    match script.body {
        Stmt::Block { mut body, .. } if body.len() == 1 => Ok(body.remove(0)),
        other => Ok(other),
    }
}

/* ===================== Statement Builder ===================== */

fn build_statement(pair: Pair<Rule>, source: &str) -> ParseResult<Stmt> {
    let span = pair_to_span(&pair, source);
    match pair.as_rule() {
        Rule::statement => {
            let mut inner = pair.into_inner();
            let stmt = expect_child(&mut inner, "statement body", span)?;
            build_statement(stmt, source)
        }
        Rule::block => build_block(pair, source),
        Rule::assign_stmt => {
            let mut inner = pair.into_inner();
            let name = expect_child(&mut inner, "assignment target", span)?;
            let value = expect_child(&mut inner, "assignment value", span)?;
            Ok(Stmt::Assign {
                name: name.as_str().to_string(),
                value: build_expression(value, source)?,
                span,
            })
        }
        Rule::expr_stmt => {
            let mut inner = pair.into_inner();
            let expr = expect_child(&mut inner, "expression", span)?;
            Ok(Stmt::Expr {
                expr: build_expression(expr, source)?,
                span,
            })
        }
        Rule::let_stmt => {
            let mut inner = pair.into_inner();
            let name = expect_child(&mut inner, "variable name", span)?;
            let init = inner
                .next()
                .map(|expr| build_expression(expr, source))
                .transpose()?;
            Ok(Stmt::Let {
                name: name.as_str().to_string(),
                init,
                span,
            })
        }
        Rule::if_stmt => build_if_stmt(pair, source),
        Rule::while_stmt => {
            let mut inner = pair.into_inner();
            let test = expect_child(&mut inner, "loop condition", span)?;
            let body = expect_child(&mut inner, "loop body", span)?;
            Ok(Stmt::While {
                test: build_expression(test, source)?,
                body: Box::new(build_block(body, source)?),
                span,
            })
        }
        Rule::try_stmt => {
            let mut inner = pair.into_inner();
            let body = expect_child(&mut inner, "try block", span)?;
            let catch_var = expect_child(&mut inner, "catch variable", span)?;
            let catch_body = expect_child(&mut inner, "catch block", span)?;
            Ok(Stmt::Try {
                body: Box::new(build_block(body, source)?),
                catch_var: catch_var.as_str().to_string(),
                catch_body: Box::new(build_block(catch_body, source)?),
                span,
            })
        }
        Rule::return_stmt => {
            let value = pair
                .into_inner()
                .next()
                .map(|expr| build_expression(expr, source))
                .transpose()?;
            Ok(Stmt::Return { value, span })
        }
        Rule::throw_stmt => {
            let mut inner = pair.into_inner();
            let value = expect_child(&mut inner, "thrown value", span)?;
            Ok(Stmt::Throw {
                value: build_expression(value, source)?,
                span,
            })
        }
        Rule::break_stmt => Ok(Stmt::Break { span }),
        Rule::continue_stmt => Ok(Stmt::Continue { span }),
        other => Err(ParseError::BuildError(
            format!("Unexpected statement rule: {:?}", other),
            Some(span),
        )),
    }
}

fn build_block(pair: Pair<Rule>, source: &str) -> ParseResult<Stmt> {
    let span = pair_to_span(&pair, source);
    let body = pair
        .into_inner()
        .map(|stmt| build_statement(stmt, source))
        .collect::<ParseResult<Vec<_>>>()?;
    Ok(Stmt::Block { body, span })
}

fn build_if_stmt(pair: Pair<Rule>, source: &str) -> ParseResult<Stmt> {
    let span = pair_to_span(&pair, source);
    let mut inner = pair.into_inner();

    let test = expect_child(&mut inner, "if condition", span)?;
    let then_s = expect_child(&mut inner, "if block", span)?;

    let else_s = match inner.next() {
        Some(else_clause) => {
            let else_span = pair_to_span(&else_clause, source);
            let mut else_inner = else_clause.into_inner();
            let branch = expect_child(&mut else_inner, "else branch", else_span)?;
            let stmt = match branch.as_rule() {
                Rule::if_stmt => build_if_stmt(branch, source)?,
                _ => build_block(branch, source)?,
            };
            Some(Box::new(stmt))
        }
        None => None,
    };

    Ok(Stmt::If {
        test: build_expression(test, source)?,
        then_s: Box::new(build_block(then_s, source)?),
        else_s,
        span,
    })
}

/* ===================== Expression Builder ===================== */

fn build_expression(pair: Pair<Rule>, source: &str) -> ParseResult<Expr> {
    let span = pair_to_span(&pair, source);
    match pair.as_rule() {
        Rule::expression => {
            let mut inner = pair.into_inner();
            let expr = expect_child(&mut inner, "expression", span)?;
            build_expression(expr, source)
        }
        Rule::or_expr
        | Rule::and_expr
        | Rule::equality_expr
        | Rule::comparison_expr
        | Rule::additive_expr
        | Rule::multiplicative_expr => build_binary_chain(pair, source),
        Rule::unary_expr => build_unary(pair, source),
        Rule::call_expr => {
            let mut inner = pair.into_inner();
            let callee = expect_child(&mut inner, "step name", span)?;
            let mut args = Vec::new();
            let mut body = None;
            for part in inner {
                match part.as_rule() {
                    Rule::arg_list => {
                        for arg in part.into_inner() {
                            args.push(build_expression(arg, source)?);
                        }
                    }
                    Rule::closure => {
                        body = Some(Box::new(build_closure_body(part, source)?));
                    }
                    other => {
                        return Err(ParseError::BuildError(
                            format!("Unexpected call content: {:?}", other),
                            Some(span),
                        ))
                    }
                }
            }
            Ok(Expr::Call {
                callee: callee.as_str().to_string(),
                args,
                body,
                span,
            })
        }
        Rule::closure => Ok(Expr::Closure {
            body: Box::new(build_closure_body(pair, source)?),
            span,
        }),
        Rule::list_lit => {
            let elements = pair
                .into_inner()
                .map(|element| build_expression(element, source))
                .collect::<ParseResult<Vec<_>>>()?;
            Ok(Expr::LitList { elements, span })
        }
        Rule::identifier => Ok(Expr::Ident {
            name: pair.as_str().to_string(),
            span,
        }),
        Rule::null_lit => Ok(Expr::LitNull { span }),
        Rule::bool_lit => Ok(Expr::LitBool {
            v: pair.as_str() == "true",
            span,
        }),
        Rule::number => {
            let v = pair.as_str().parse::<f64>().map_err(|e| {
                ParseError::BuildError(format!("Invalid number: {}", e), Some(span))
            })?;
            Ok(Expr::LitNum { v, span })
        }
        Rule::string => {
            let raw = pair.into_inner().next().map(|p| p.as_str()).unwrap_or("");
            Ok(Expr::LitStr {
                v: unescape(raw),
                span,
            })
        }
        other => Err(ParseError::BuildError(
            format!("Unexpected expression rule: {:?}", other),
            Some(span),
        )),
    }
}

/// Left-associative chain: operand (op operand)*
fn build_binary_chain(pair: Pair<Rule>, source: &str) -> ParseResult<Expr> {
    let span = pair_to_span(&pair, source);
    let mut inner = pair.into_inner();
    let first = expect_child(&mut inner, "operand", span)?;
    let mut expr = build_expression(first, source)?;

    while let Some(op_pair) = inner.next() {
        let op = binary_op(&op_pair, source)?;
        let right_pair = expect_child(&mut inner, "right operand", span)?;
        let right = build_expression(right_pair, source)?;
        let merged = expr.span().merge(&right.span());
        expr = Expr::Binary {
            op,
            left: Box::new(expr),
            right: Box::new(right),
            span: merged,
        };
    }

    Ok(expr)
}

fn binary_op(pair: &Pair<Rule>, source: &str) -> ParseResult<BinaryOp> {
    let op = match pair.as_rule() {
        Rule::op_or => BinaryOp::Or,
        Rule::op_and => BinaryOp::And,
        Rule::op_eq => BinaryOp::Eq,
        Rule::op_ne => BinaryOp::Ne,
        Rule::op_lt => BinaryOp::Lt,
        Rule::op_lte => BinaryOp::Lte,
        Rule::op_gt => BinaryOp::Gt,
        Rule::op_gte => BinaryOp::Gte,
        Rule::op_add => BinaryOp::Add,
        Rule::op_sub => BinaryOp::Sub,
        Rule::op_mul => BinaryOp::Mul,
        Rule::op_div => BinaryOp::Div,
        Rule::op_mod => BinaryOp::Mod,
        other => {
            return Err(ParseError::BuildError(
                format!("Unexpected operator: {:?}", other),
                Some(pair_to_span(pair, source)),
            ))
        }
    };
    Ok(op)
}

fn build_unary(pair: Pair<Rule>, source: &str) -> ParseResult<Expr> {
    let span = pair_to_span(&pair, source);
    let mut ops = Vec::new();
    let mut operand = None;

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::op_not => ops.push(UnaryOp::Not),
            Rule::op_neg => ops.push(UnaryOp::Neg),
            _ => operand = Some(build_expression(part, source)?),
        }
    }

    let mut expr = operand
        .ok_or_else(|| ParseError::BuildError("Expected operand".to_string(), Some(span)))?;

    // Innermost operator applies first
    for op in ops.into_iter().rev() {
        expr = match (op, expr) {
            (UnaryOp::Neg, Expr::LitNum { v, .. }) => Expr::LitNum { v: -v, span },
            (op, operand) => Expr::Unary {
                op,
                operand: Box::new(operand),
                span,
            },
        };
    }

    Ok(expr)
}

fn build_closure_body(pair: Pair<Rule>, source: &str) -> ParseResult<Stmt> {
    let span = pair_to_span(&pair, source);
    let body = pair
        .into_inner()
        .map(|stmt| build_statement(stmt, source))
        .collect::<ParseResult<Vec<_>>>()?;
    Ok(Stmt::Block { body, span })
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
