//! The syntax tree handed to us by the script engine.
//!
//! The engine owns parsing. We only need a typed view of the constructs that
//! matter for coverage: where statements start, where decisions are made, and
//! where functions are defined. Everything else is kept as an opaque node with
//! its children so nested functions and statements are still reachable.
pub mod estree;

pub use estree::{parse_json, ReflectEngine};

use thiserror::Error;

/// Parse failure reported by the script engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{filename}:{}: {message}", .line.map_or_else(|| "?".to_string(), |l| l.to_string()))]
pub struct SyntaxError {
    pub filename: String,
    pub line: Option<u32>,
    pub message: String,
}

impl SyntaxError {
    pub fn new(filename: impl Into<String>, line: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            line,
            message: message.into(),
        }
    }
}

/// Every script engine we host implements this trait.
pub trait ScriptEngine {
    /// Parse `source` (loaded from `filename`) into a syntax tree.
    fn parse(&self, source: &str, filename: &str) -> Result<Program, SyntaxError>;
}

/// Root of a parsed script.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub body: Vec<Node>,
}

/// A syntax node with its source span (1-based lines).
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub line: u32,
    pub end_line: u32,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Function declaration, function expression or arrow function.
    Function(Function),
    If {
        test: Box<Node>,
        consequent: Box<Node>,
        alternate: Option<Box<Node>>,
    },
    Switch {
        discriminant: Box<Node>,
        cases: Vec<SwitchCase>,
    },
    Loop {
        kind: LoopKind,
        /// Init/test/update or left/right expressions.
        head: Vec<Node>,
        body: Box<Node>,
    },
    /// Non-executable container of statements (block, `try`, label, empty).
    Block(Vec<Node>),
    /// Any other statement; runs when its line runs.
    Statement(Vec<Node>),
    /// Any expression or auxiliary node.
    Expression(Vec<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Declaration,
    Expression,
    Arrow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub kind: FunctionKind,
    /// `None` for anonymous functions.
    pub name: Option<String>,
    pub params: Vec<Node>,
    /// A block, or an expression for concise arrow bodies.
    pub body: Box<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    For,
    ForIn,
    ForOf,
    While,
    DoWhile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub line: u32,
    /// `None` for `default:`.
    pub test: Option<Node>,
    pub consequent: Vec<Node>,
}

impl Node {
    pub fn new(line: u32, end_line: u32, kind: NodeKind) -> Self {
        Self {
            line,
            end_line: end_line.max(line),
            kind,
        }
    }

    /// Direct children, in source order.
    pub fn children(&self) -> Vec<&Node> {
        match &self.kind {
            NodeKind::Function(func) => func
                .params
                .iter()
                .chain(std::iter::once(func.body.as_ref()))
                .collect(),
            NodeKind::If {
                test,
                consequent,
                alternate,
            } => {
                let mut out = vec![test.as_ref(), consequent.as_ref()];
                if let Some(alt) = alternate {
                    out.push(alt);
                }
                out
            }
            NodeKind::Switch {
                discriminant,
                cases,
            } => {
                let mut out = vec![discriminant.as_ref()];
                for case in cases {
                    out.extend(case.test.iter());
                    out.extend(case.consequent.iter());
                }
                out
            }
            NodeKind::Loop { kind, head, body } => {
                if *kind == LoopKind::DoWhile {
                    std::iter::once(body.as_ref()).chain(head.iter()).collect()
                } else {
                    head.iter().chain(std::iter::once(body.as_ref())).collect()
                }
            }
            NodeKind::Block(nodes) | NodeKind::Statement(nodes) | NodeKind::Expression(nodes) => {
                nodes.iter().collect()
            }
        }
    }
}
