//! Static and runtime coverage model, independent of how it is stored or
//! rendered. The analyzer produces a `CoverageMap`, the cache persists it, and
//! the report serializer pairs it with the tracker's hit counts.
use serde::Serialize;

/// Function name used in keys for functions without one.
pub const ANONYMOUS: &str = "(anonymous)";

/// Compute a coverage rate, returning 0.0 when the total is zero.
#[must_use]
pub fn rate(covered: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        covered as f64 / total as f64
    }
}

/// One exit of a decision point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchSite {
    /// Line of the controlling keyword.
    pub line: u32,
    /// Zero-based, unique within `line`, in discovery order.
    pub branch_id: u32,
    /// Executable lines inside this exit's body; hitting any of them means
    /// the exit was taken.
    pub exit_lines: Vec<u32>,
}

/// A function declaration or expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionSite {
    /// `<name-or-(anonymous)>:<line>:<nesting-index>`
    pub key: String,
    pub line: u32,
    /// Last line of the function, body included.
    pub end_line: u32,
    /// First executable line of the body, not counting nested functions.
    /// This is where the runtime reports the function as entered.
    pub body_line: Option<u32>,
}

impl FunctionSite {
    /// A site spanning only its declaration line with no known body line.
    pub fn new(name: Option<&str>, line: u32, nesting_index: u32) -> Self {
        Self {
            key: function_key(name, line, nesting_index),
            line,
            end_line: line,
            body_line: None,
        }
    }

    #[must_use]
    pub fn with_body(mut self, end_line: u32, body_line: Option<u32>) -> Self {
        self.end_line = end_line.max(self.line);
        self.body_line = body_line;
        self
    }

    /// Whether `line` falls between the declaration and the closing line.
    pub fn contains(&self, line: u32) -> bool {
        self.line <= line && line <= self.end_line
    }

    /// The declared name, or `None` for anonymous functions.
    pub fn name(&self) -> Option<&str> {
        let mut parts = self.key.rsplitn(3, ':');
        let _index = parts.next();
        let _line = parts.next();
        parts.next().filter(|name| *name != ANONYMOUS)
    }

    /// Position among same-named functions declared on the same line.
    pub fn nesting_index(&self) -> u32 {
        self.key
            .rsplit(':')
            .next()
            .and_then(|index| index.parse().ok())
            .unwrap_or(0)
    }
}

#[must_use]
pub fn function_key(name: Option<&str>, line: u32, nesting_index: u32) -> String {
    format!("{}:{}:{}", name.unwrap_or(ANONYMOUS), line, nesting_index)
}

/// Static analysis result for one source file.
///
/// Contents are canonical: `executable_lines` ascending and deduplicated,
/// `branches` ordered by `(line, branch_id)`, `functions` ordered by `key`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CoverageMap {
    pub executable_lines: Vec<u32>,
    pub branches: Vec<BranchSite>,
    pub functions: Vec<FunctionSite>,
}

impl CoverageMap {
    /// Restore the canonical ordering. Safe to call on an already-canonical map.
    pub fn canonicalize(&mut self) {
        self.executable_lines.sort_unstable();
        self.executable_lines.dedup();
        self.branches.sort_by_key(|b| (b.line, b.branch_id));
        for branch in &mut self.branches {
            branch.exit_lines.sort_unstable();
            branch.exit_lines.dedup();
        }
        self.functions.sort_by(|a, b| a.key.cmp(&b.key));
    }

    pub fn function_index(&self, key: &str) -> Option<usize> {
        self.functions
            .binary_search_by(|f| f.key.as_str().cmp(key))
            .ok()
    }

    /// Highest line mentioned anywhere in the map.
    pub fn max_line(&self) -> u32 {
        let lines = self.executable_lines.last().copied().unwrap_or(0);
        let branches = self
            .branches
            .iter()
            .flat_map(|b| std::iter::once(b.line).chain(b.exit_lines.iter().copied()))
            .max()
            .unwrap_or(0);
        let functions = self.functions.iter().map(|f| f.end_line).max().unwrap_or(0);
        lines.max(branches).max(functions)
    }
}

/// Runtime state of one branch exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchHit {
    /// The decision line itself never executed.
    NotReached,
    /// The decision line executed; this exit never did.
    NotTaken,
    /// Taken this many times (always > 0).
    Taken(u64),
}

impl BranchHit {
    /// `-1` for not reached, otherwise the taken count.
    #[must_use]
    pub fn as_count(self) -> i64 {
        match self {
            BranchHit::NotReached => -1,
            BranchHit::NotTaken => 0,
            BranchHit::Taken(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }

    #[must_use]
    pub fn is_taken(self) -> bool {
        matches!(self, BranchHit::Taken(_))
    }
}

/// Found/hit totals for one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub found: u64,
    pub hit: u64,
}

impl Tally {
    pub fn add(&mut self, hit: bool) {
        self.found += 1;
        if hit {
            self.hit += 1;
        }
    }

    #[must_use]
    pub fn rate(&self) -> f64 {
        rate(self.hit, self.found)
    }
}

impl std::ops::AddAssign for Tally {
    fn add_assign(&mut self, other: Self) {
        self.found += other.found;
        self.hit += other.hit;
    }
}

/// Per-file (or aggregated) totals as written in the trace summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoverageSummary {
    pub lines: Tally,
    pub branches: Tally,
    pub functions: Tally,
}

impl std::ops::AddAssign for CoverageSummary {
    fn add_assign(&mut self, other: Self) {
        self.lines += other.lines;
        self.branches += other.branches;
        self.functions += other.functions;
    }
}
