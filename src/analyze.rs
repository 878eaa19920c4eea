//! Static discovery of executable lines, branch sites and functions.
//!
//! One pass over the tree, no side effects. The result depends only on the
//! tree, so identical source always yields an identical `CoverageMap`.
use std::collections::{BTreeSet, HashMap};

use crate::model::{BranchSite, CoverageMap, FunctionSite};
use crate::syntax::{LoopKind, Node, NodeKind, Program};

/// Analyze a parsed program.
pub fn analyze(program: &Program) -> CoverageMap {
    let mut analyzer = Analyzer::default();
    let mut lines = BTreeSet::new();
    let body: Vec<&Node> = program.body.iter().collect();
    for node in &body {
        executable_lines(node, &mut lines, true);
    }
    analyzer.visit_all(&body, true);

    let mut map = CoverageMap {
        executable_lines: lines.into_iter().collect(),
        branches: analyzer.branches,
        functions: analyzer.functions,
    };
    map.canonicalize();
    map
}

#[derive(Default)]
struct Analyzer {
    branches: Vec<BranchSite>,
    next_branch_id: HashMap<u32, u32>,
    functions: Vec<FunctionSite>,
    nesting: HashMap<(Option<String>, u32), u32>,
}

impl Analyzer {
    /// Visit sibling nodes in source order. `sequential` siblings are
    /// statements of one block that run one after another.
    fn visit_all(&mut self, nodes: &[&Node], sequential: bool) {
        for (i, node) in nodes.iter().enumerate() {
            let after = match &node.kind {
                NodeKind::Loop {
                    kind: LoopKind::DoWhile,
                    ..
                } if sequential => first_line_of(&nodes[i + 1..]),
                _ => None,
            };
            self.visit(node, after);
        }
    }

    /// `after` is the first executable line following `node` among its
    /// siblings; only do-while loops use it.
    fn visit(&mut self, node: &Node, after: Option<u32>) {
        match &node.kind {
            NodeKind::Function(func) => {
                let slot = self
                    .nesting
                    .entry((func.name.clone(), node.line))
                    .or_insert(0);
                let site = FunctionSite::new(func.name.as_deref(), node.line, *slot)
                    .with_body(node.end_line, body_line(&func.body));
                self.functions.push(site);
                *slot += 1;
            }
            NodeKind::If {
                consequent,
                alternate,
                ..
            } => {
                let mut exits = vec![exit_lines(consequent, node.line)];
                if let Some(alternate) = alternate {
                    exits.push(exit_lines(alternate, node.line));
                }
                self.add_branches(node.line, exits);
            }
            NodeKind::Switch { cases, .. } => {
                // Labels without a body fall through to the next body, but
                // still count as their own decision.
                let mut exits = vec![Vec::new(); cases.len()];
                let mut shared = Vec::new();
                for (i, case) in cases.iter().enumerate().rev() {
                    if !case.consequent.is_empty() {
                        let mut lines = BTreeSet::new();
                        for stmt in &case.consequent {
                            executable_lines(stmt, &mut lines, false);
                        }
                        lines.remove(&node.line);
                        shared = lines.into_iter().collect();
                    }
                    exits[i] = shared.clone();
                }
                self.add_branches(node.line, exits);
            }
            NodeKind::Loop {
                kind: LoopKind::DoWhile,
                head,
                body,
            } => {
                // Decided at the trailing `while`: exit 0 runs the body again,
                // exit 1 leaves the loop.
                let line = do_while_test_line(node, head);
                let repeat = exit_lines(body, line);
                let leave: Vec<u32> = after.into_iter().filter(|&l| l != line).collect();
                self.add_branches(line, vec![repeat, leave]);
            }
            NodeKind::Loop { body, .. } => {
                self.add_branches(node.line, vec![exit_lines(body, node.line)]);
            }
            _ => {}
        }

        let sequential = matches!(node.kind, NodeKind::Block(_));
        self.visit_all(&node.children(), sequential);
    }

    fn add_branches(&mut self, line: u32, exits: Vec<Vec<u32>>) {
        let next = self.next_branch_id.entry(line).or_insert(0);
        for exit_lines in exits {
            self.branches.push(BranchSite {
                line,
                branch_id: *next,
                exit_lines,
            });
            *next += 1;
        }
    }
}

/// Executable lines of one branch exit, not counting nested function bodies
/// or the decision line itself.
fn exit_lines(body: &Node, decision_line: u32) -> Vec<u32> {
    let mut lines = BTreeSet::new();
    executable_lines(body, &mut lines, false);
    lines.remove(&decision_line);
    lines.into_iter().collect()
}

/// First executable line of a function body. A concise arrow body is one
/// expression and runs on its own line.
fn body_line(body: &Node) -> Option<u32> {
    if !matches!(body.kind, NodeKind::Block(_)) {
        return Some(body.line);
    }
    let mut lines = BTreeSet::new();
    executable_lines(body, &mut lines, false);
    lines.first().copied()
}

/// First executable line among `nodes`, skipping nested function bodies.
fn first_line_of(nodes: &[&Node]) -> Option<u32> {
    nodes.iter().find_map(|node| {
        let mut lines = BTreeSet::new();
        executable_lines(node, &mut lines, false);
        lines.first().copied()
    })
}

fn do_while_test_line(node: &Node, head: &[Node]) -> u32 {
    head.first().map_or(node.end_line, |test| test.line)
}

fn executable_lines(node: &Node, out: &mut BTreeSet<u32>, into_functions: bool) {
    match &node.kind {
        NodeKind::Function(func) => {
            if !into_functions {
                return;
            }
            // Concise arrow bodies run as a statement of their own.
            if !matches!(func.body.kind, NodeKind::Block(_)) {
                out.insert(func.body.line);
            }
        }
        NodeKind::Loop {
            kind: LoopKind::DoWhile,
            head,
            ..
        } => {
            out.insert(node.line);
            out.insert(do_while_test_line(node, head));
        }
        NodeKind::If { .. }
        | NodeKind::Switch { .. }
        | NodeKind::Loop { .. }
        | NodeKind::Statement(_) => {
            out.insert(node.line);
        }
        NodeKind::Block(_) | NodeKind::Expression(_) => {}
    }
    for child in node.children() {
        executable_lines(child, out, into_functions);
    }
}
