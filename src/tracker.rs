//! Runtime hit counters for one tracked file.
//!
//! Recording is on the hot path (every executed statement), so counters are
//! plain vectors indexed by line or function slot. Correlation with the
//! static `CoverageMap` happens when results are read.
use std::collections::HashMap;

use tracing::debug;

use crate::model::{BranchHit, BranchSite, CoverageMap};

#[derive(Debug, Clone, Default)]
pub struct HitCounts {
    /// Indexed by line number up to the map's last line; index 0 is unused.
    lines: Vec<u64>,
    /// Lines past the end of the map, which a well-behaved engine never reports.
    stray_lines: HashMap<u32, u64>,
    /// Counts reported directly by the engine, keyed by `(line, branch_id)`.
    branches: HashMap<(u32, u32), u64>,
    /// Parallel to `CoverageMap::functions`.
    functions: Vec<u64>,
    function_slots: HashMap<String, usize>,
    /// Function slots keyed by the first executable line of their body.
    entry_slots: HashMap<u32, Vec<usize>>,
}

impl HitCounts {
    pub fn new(map: &CoverageMap) -> Self {
        let mut entry_slots: HashMap<u32, Vec<usize>> = HashMap::new();
        for (slot, function) in map.functions.iter().enumerate() {
            if let Some(line) = function.body_line {
                entry_slots.entry(line).or_default().push(slot);
            }
        }
        Self {
            lines: vec![0; map.max_line() as usize + 1],
            stray_lines: HashMap::new(),
            branches: HashMap::new(),
            functions: vec![0; map.functions.len()],
            function_slots: map
                .functions
                .iter()
                .enumerate()
                .map(|(i, f)| (f.key.clone(), i))
                .collect(),
            entry_slots,
        }
    }

    pub fn record_line(&mut self, line: u32) {
        match self.lines.get_mut(line as usize) {
            Some(count) => *count += 1,
            None => {
                if !self.stray_lines.contains_key(&line) {
                    debug!(line, "line past the end of the coverage map");
                }
                *self.stray_lines.entry(line).or_insert(0) += 1;
            }
        }
    }

    pub fn record_branch(&mut self, line: u32, branch_id: u32) {
        *self.branches.entry((line, branch_id)).or_insert(0) += 1;
    }

    /// Credit one call to the function with `key`. Unknown keys are ignored.
    pub fn record_function_call(&mut self, key: &str) -> bool {
        match self.function_slots.get(key) {
            Some(&slot) => {
                self.functions[slot] += 1;
                true
            }
            None => {
                debug!(key, "call to unknown function ignored");
                false
            }
        }
    }

    /// Credit a call reported by the runtime as "entered at `line`".
    ///
    /// The runtime reports the first line it executes, which can come after
    /// the declaration (blank lines, comments, a wrapped signature, hoisted
    /// inner declarations). The call goes to a function whose body starts on
    /// `line`; if none does, to the innermost function whose span contains
    /// `line`. Either way a function named `name` is preferred. Returns the
    /// key that was credited.
    pub fn function_entered(
        &mut self,
        map: &CoverageMap,
        name: Option<&str>,
        line: u32,
    ) -> Option<String> {
        let slot = self.resolve_function(map, name, line)?;
        self.functions[slot] += 1;
        Some(map.functions[slot].key.clone())
    }

    fn resolve_function(&self, map: &CoverageMap, name: Option<&str>, line: u32) -> Option<usize> {
        let functions = &map.functions;
        let named = |slot: &usize| name.is_some() && functions[*slot].name() == name;

        // Functions whose body starts on the same line nest inside each
        // other; the outermost is the one entered first.
        if let Some(starting) = self.entry_slots.get(&line) {
            let outermost = |&slot: &usize| {
                let f = &functions[slot];
                (f.line, std::cmp::Reverse(f.end_line), f.nesting_index())
            };
            let found = starting
                .iter()
                .copied()
                .filter(named)
                .min_by_key(outermost)
                .or_else(|| starting.iter().copied().min_by_key(outermost));
            if found.is_some() {
                return found;
            }
        }

        let innermost = |&slot: &usize| {
            let f = &functions[slot];
            (f.line, std::cmp::Reverse(f.end_line), std::cmp::Reverse(f.nesting_index()))
        };
        let containing =
            move || (0..functions.len()).filter(move |&slot| functions[slot].contains(line));
        containing()
            .filter(named)
            .max_by_key(innermost)
            .or_else(|| containing().max_by_key(innermost))
    }

    pub fn line_hits(&self, line: u32) -> u64 {
        match self.lines.get(line as usize) {
            Some(&count) => count,
            None => self.stray_lines.get(&line).copied().unwrap_or(0),
        }
    }

    /// Calls credited to `map.functions[slot]`.
    pub fn function_hits(&self, slot: usize) -> u64 {
        self.functions.get(slot).copied().unwrap_or(0)
    }

    /// State of one branch exit.
    ///
    /// Counts reported directly by the engine win. Otherwise an exit is taken
    /// as often as the first of its exit lines that ran, not taken when only
    /// the decision line ran, and not reached when the decision line never ran.
    pub fn branch_state(&self, site: &BranchSite) -> BranchHit {
        if let Some(&count) = self.branches.get(&(site.line, site.branch_id)) {
            if count > 0 {
                return BranchHit::Taken(count);
            }
        }
        if self.line_hits(site.line) == 0 {
            return BranchHit::NotReached;
        }
        match site
            .exit_lines
            .iter()
            .map(|&l| self.line_hits(l))
            .find(|&hits| hits > 0)
        {
            Some(hits) => BranchHit::Taken(hits),
            None => BranchHit::NotTaken,
        }
    }

    /// Whether anything in the file ran at all.
    pub fn has_executions(&self) -> bool {
        self.lines.iter().any(|&n| n > 0)
            || !self.stray_lines.is_empty()
            || self.functions.iter().any(|&n| n > 0)
            || self.branches.values().any(|&n| n > 0)
    }
}
