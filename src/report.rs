//! LCOV trace output.
//!
//! Reference: https://ltp.sourceforge.net/coverage/lcov/geninfo.1.php
//!
//! One section per tracked file that ran, in registration order:
//!   SF:<path>
//!   FN:<line>,<key>            one per function, sorted by key
//!   FNDA:<count>,<key>
//!   FNF / FNH
//!   BRDA:<line>,0,<branch>,<taken>   ("-" when the decision never ran)
//!   BRF / BRH
//!   DA:<line>,<count>
//!   LF / LH
//!   end_of_record
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;
use crate::model::{BranchHit, CoverageMap, CoverageSummary};
use crate::session::{Session, TrackedFile};
use crate::tracker::HitCounts;

/// Name of the trace file inside the output directory.
pub const TRACE_FILE_NAME: &str = "coverage.lcov";

/// Found/hit totals for one file.
pub fn summarize(map: &CoverageMap, hits: &HitCounts) -> CoverageSummary {
    let mut summary = CoverageSummary::default();
    for slot in 0..map.functions.len() {
        summary.functions.add(hits.function_hits(slot) > 0);
    }
    for site in &map.branches {
        summary.branches.add(hits.branch_state(site).is_taken());
    }
    for &line in &map.executable_lines {
        summary.lines.add(hits.line_hits(line) > 0);
    }
    summary
}

/// Render one file's section, or `None` when nothing in it ran.
pub fn render_section(path: &str, map: &CoverageMap, hits: &HitCounts) -> Option<String> {
    if !hits.has_executions() {
        return None;
    }
    let summary = summarize(map, hits);
    let mut out = String::new();

    let _ = writeln!(out, "SF:{path}");

    for func in &map.functions {
        let _ = writeln!(out, "FN:{},{}", func.line, func.key);
    }
    for (slot, func) in map.functions.iter().enumerate() {
        let _ = writeln!(out, "FNDA:{},{}", hits.function_hits(slot), func.key);
    }
    let _ = writeln!(out, "FNF:{}", summary.functions.found);
    let _ = writeln!(out, "FNH:{}", summary.functions.hit);

    for site in &map.branches {
        let taken = match hits.branch_state(site) {
            BranchHit::NotReached => "-".to_string(),
            state => state.as_count().to_string(),
        };
        let _ = writeln!(out, "BRDA:{},0,{},{}", site.line, site.branch_id, taken);
    }
    let _ = writeln!(out, "BRF:{}", summary.branches.found);
    let _ = writeln!(out, "BRH:{}", summary.branches.hit);

    for &line in &map.executable_lines {
        let _ = writeln!(out, "DA:{},{}", line, hits.line_hits(line));
    }
    let _ = writeln!(out, "LF:{}", summary.lines.found);
    let _ = writeln!(out, "LH:{}", summary.lines.hit);

    out.push_str("end_of_record\n");
    Some(out)
}

/// The full trace, with each section's `SF:` naming the file's identity.
pub fn serialize(session: &Session) -> String {
    session
        .files()
        .iter()
        .filter_map(|file| render_section(&file.identity().to_string(), &file.map, &file.hits))
        .collect()
}

/// Append the trace to `<output_dir>/coverage.lcov` and snapshot every
/// tracked file's source under `output_dir`.
///
/// Existing content of the trace file is kept; new sections go after it.
/// Each `SF:` names the snapshot, so the trace stays resolvable after the
/// original changes or its archive is unloaded. When a snapshot cannot be
/// written the section falls back to the original identity.
pub fn write_report(session: &Session, output_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    let mut trace = String::new();
    for file in session.files() {
        let path = match mirror_source(file, output_dir) {
            Ok(mirrored) => mirrored.display().to_string(),
            Err(err) => {
                warn!(identity = %file.identity(), "could not snapshot source: {err}");
                file.identity().to_string()
            }
        };
        if let Some(section) = render_section(&path, &file.map, &file.hits) {
            trace.push_str(&section);
        }
    }

    let trace_path = output_dir.join(TRACE_FILE_NAME);
    let mut out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&trace_path)?;
    out.write_all(trace.as_bytes())?;
    out.flush()?;
    Ok(trace_path)
}

fn mirror_source(file: &TrackedFile, output_dir: &Path) -> Result<PathBuf> {
    let target = output_dir.join(file.identity().mirror_path());
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, &file.bytes)?;
    Ok(target)
}
