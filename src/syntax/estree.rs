/// Adapter for ESTree-shaped JSON, as produced by SpiderMonkey's
/// `Reflect.parse(source, { loc: true })` and most JavaScript parsers.
///
/// Only `type` and `loc` are interpreted generically; the handful of node
/// types that carry coverage meaning (functions, `if`, `switch`, loops) are
/// mapped to dedicated variants. Unknown node types are kept as generic
/// statements or expressions so their nested code is still visited.
///
/// Reference: https://github.com/estree/estree
use serde_json::{Map, Value};

use super::{
    Function, FunctionKind, LoopKind, Node, NodeKind, Program, ScriptEngine, SwitchCase,
    SyntaxError,
};

/// Keys that never hold child nodes.
const SKIPPED_KEYS: &[&str] = &["type", "loc", "range", "start", "end"];

/// A `ScriptEngine` backed by any callable that returns ESTree JSON.
///
/// This is how a host exposes its engine's own parser (e.g. `Reflect.parse`
/// evaluated inside the engine) without this crate knowing about the engine.
pub struct ReflectEngine<F> {
    reflect: F,
}

impl<F> ReflectEngine<F>
where
    F: Fn(&str, &str) -> Result<String, SyntaxError>,
{
    pub fn new(reflect: F) -> Self {
        Self { reflect }
    }
}

impl<F> ScriptEngine for ReflectEngine<F>
where
    F: Fn(&str, &str) -> Result<String, SyntaxError>,
{
    fn parse(&self, source: &str, filename: &str) -> Result<Program, SyntaxError> {
        let json = (self.reflect)(source, filename)?;
        parse_json(&json, filename)
    }
}

/// Parse an ESTree `Program` from its JSON text.
pub fn parse_json(json: &str, filename: &str) -> Result<Program, SyntaxError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| SyntaxError::new(filename, None, format!("invalid syntax tree JSON: {e}")))?;
    program_from_value(&value, filename)
}

/// Convert an already-decoded ESTree `Program` value.
pub fn program_from_value(value: &Value, filename: &str) -> Result<Program, SyntaxError> {
    let obj = value
        .as_object()
        .filter(|o| o.get("type").and_then(Value::as_str) == Some("Program"))
        .ok_or_else(|| SyntaxError::new(filename, None, "root node is not a Program"))?;

    let body = obj
        .get("body")
        .and_then(Value::as_array)
        .ok_or_else(|| SyntaxError::new(filename, None, "Program has no body"))?;

    let line = start_line(obj).unwrap_or(1);
    Ok(Program {
        body: node_list(body, line),
    })
}

fn start_line(obj: &Map<String, Value>) -> Option<u32> {
    position(obj, "start", "line").filter(|&l| l > 0)
}

fn end_line(obj: &Map<String, Value>) -> Option<u32> {
    position(obj, "end", "line").filter(|&l| l > 0)
}

fn start_column(obj: &Map<String, Value>) -> u32 {
    position(obj, "start", "column").unwrap_or(0)
}

fn position(obj: &Map<String, Value>, edge: &str, field: &str) -> Option<u32> {
    obj.get("loc")?
        .get(edge)?
        .get(field)?
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
}

fn node_list(values: &[Value], parent_line: u32) -> Vec<Node> {
    values
        .iter()
        .filter_map(|v| convert(v, parent_line))
        .collect()
}

fn child(obj: &Map<String, Value>, key: &str, line: u32) -> Option<Node> {
    obj.get(key).and_then(|v| convert(v, line))
}

fn boxed_or_empty(obj: &Map<String, Value>, key: &str, line: u32) -> Box<Node> {
    Box::new(child(obj, key, line).unwrap_or_else(|| Node::new(line, line, NodeKind::Block(vec![]))))
}

fn convert(value: &Value, parent_line: u32) -> Option<Node> {
    let obj = value.as_object()?;
    let ty = obj.get("type")?.as_str()?;
    let line = start_line(obj).unwrap_or(parent_line);
    let end = end_line(obj).unwrap_or(line);

    let kind = match ty {
        "FunctionDeclaration" | "FunctionExpression" | "ArrowFunctionExpression" => {
            let kind = match ty {
                "FunctionDeclaration" => FunctionKind::Declaration,
                "FunctionExpression" => FunctionKind::Expression,
                _ => FunctionKind::Arrow,
            };
            let name = obj
                .get("id")
                .and_then(|id| id.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let mut params = Vec::new();
            // Older SpiderMonkey trees keep default values in a separate array.
            for key in ["params", "defaults", "rest"] {
                match obj.get(key) {
                    Some(Value::Array(items)) => params.extend(node_list(items, line)),
                    Some(other) => params.extend(convert(other, line)),
                    None => {}
                }
            }
            NodeKind::Function(Function {
                kind,
                name,
                params,
                body: boxed_or_empty(obj, "body", line),
            })
        }
        "IfStatement" => NodeKind::If {
            test: boxed_or_empty(obj, "test", line),
            consequent: boxed_or_empty(obj, "consequent", line),
            alternate: child(obj, "alternate", line).map(Box::new),
        },
        "SwitchStatement" => {
            let cases = obj
                .get("cases")
                .and_then(Value::as_array)
                .map(|cases| {
                    cases
                        .iter()
                        .filter_map(Value::as_object)
                        .map(|case| {
                            let case_line = start_line(case).unwrap_or(line);
                            SwitchCase {
                                line: case_line,
                                test: child(case, "test", case_line),
                                consequent: case
                                    .get("consequent")
                                    .and_then(Value::as_array)
                                    .map(|c| node_list(c, case_line))
                                    .unwrap_or_default(),
                            }
                        })
                        .collect()
                })
                .unwrap_or_default();
            NodeKind::Switch {
                discriminant: boxed_or_empty(obj, "discriminant", line),
                cases,
            }
        }
        "ForStatement" => loop_node(obj, LoopKind::For, &["init", "test", "update"], line),
        "ForInStatement" => loop_node(obj, LoopKind::ForIn, &["left", "right"], line),
        "ForOfStatement" => loop_node(obj, LoopKind::ForOf, &["left", "right"], line),
        "WhileStatement" => loop_node(obj, LoopKind::While, &["test"], line),
        "DoWhileStatement" => loop_node(obj, LoopKind::DoWhile, &["test"], line),
        "BlockStatement" | "EmptyStatement" | "TryStatement" | "LabeledStatement"
        | "StaticBlock" => NodeKind::Block(generic_children(obj, line)),
        _ if ty.ends_with("Statement") || ty.ends_with("Declaration") => {
            NodeKind::Statement(generic_children(obj, line))
        }
        _ => NodeKind::Expression(generic_children(obj, line)),
    };

    Some(Node::new(line, end, kind))
}

fn loop_node(obj: &Map<String, Value>, kind: LoopKind, head_keys: &[&str], line: u32) -> NodeKind {
    NodeKind::Loop {
        kind,
        head: head_keys
            .iter()
            .filter_map(|key| child(obj, key, line))
            .collect(),
        body: boxed_or_empty(obj, "body", line),
    }
}

/// All child nodes of an arbitrary node, ordered by source position.
///
/// JSON object key order is not source order, so children are sorted by
/// their start position before conversion.
fn generic_children(obj: &Map<String, Value>, line: u32) -> Vec<Node> {
    let mut found: Vec<(u32, u32, &Value)> = Vec::new();
    for (key, value) in obj {
        if SKIPPED_KEYS.contains(&key.as_str()) {
            continue;
        }
        match value {
            Value::Object(inner) if inner.contains_key("type") => {
                found.push((start_line(inner).unwrap_or(line), start_column(inner), value));
            }
            Value::Array(items) => {
                for item in items {
                    if let Some(inner) = item.as_object().filter(|o| o.contains_key("type")) {
                        found.push((start_line(inner).unwrap_or(line), start_column(inner), item));
                    }
                }
            }
            _ => {}
        }
    }
    found.sort_by_key(|&(l, c, _)| (l, c));
    found
        .into_iter()
        .filter_map(|(_, _, v)| convert(v, line))
        .collect()
}
