//! Command handler functions for the scriptcov CLI.
//!
//! Each `cmd_*` function returns its output as a `String`, making them easy
//! to test without capturing stdout.

use std::fmt::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::analyze::analyze;
use crate::cache::CacheStore;
use crate::fingerprint::Validity;
use crate::model::CoverageSummary;
use crate::syntax::parse_json;
use crate::trace;

/// Static analysis of an ESTree JSON dump, printed as JSON.
pub fn cmd_analyze(tree: &Path) -> Result<String> {
    let json = std::fs::read_to_string(tree)
        .with_context(|| format!("Failed to read {}", tree.display()))?;
    let program = parse_json(&json, &tree.display().to_string())?;
    let map = analyze(&program);
    let mut out = serde_json::to_string_pretty(&map)?;
    out.push('\n');
    Ok(out)
}

/// Export the cache. With `output`, the blob is written there and a
/// confirmation returned; otherwise the blob itself is returned.
pub fn cmd_cache_export(store: &CacheStore, output: Option<&Path>) -> Result<String> {
    let blob = store.export()?;
    match output {
        Some(path) => {
            std::fs::write(path, &blob)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            let count = store.entries()?.len();
            Ok(format!("Exported {} entries to {}\n", count, path.display()))
        }
        None => Ok(String::from_utf8(blob)?),
    }
}

pub fn cmd_cache_import(store: &mut CacheStore, blob: &Path) -> Result<String> {
    let bytes =
        std::fs::read(blob).with_context(|| format!("Failed to read {}", blob.display()))?;
    let count = store.import(&bytes)?;
    Ok(format!("Imported {} entries from {}\n", count, blob.display()))
}

pub fn cmd_cache_list(store: &CacheStore) -> Result<String> {
    let entries = store.entries()?;
    if entries.is_empty() {
        return Ok("No entries in cache.\n".to_string());
    }
    let mut out = String::new();
    writeln!(out, "{:<60} {:<24} UPDATED", "IDENTITY", "VALIDITY").unwrap();
    writeln!(out, "{}", "-".repeat(110)).unwrap();
    for entry in &entries {
        let validity = match &entry.validity {
            Validity::Mtime { secs, usecs } => format!("mtime {secs}.{usecs:06}"),
            Validity::Checksum(sum) => {
                format!("blake3 {}", sum.chars().take(16).collect::<String>())
            }
        };
        writeln!(out, "{:<60} {:<24} {}", entry.identity, validity, entry.updated_at).unwrap();
    }
    Ok(out)
}

pub fn cmd_cache_clear(store: &mut CacheStore) -> Result<String> {
    let removed = store.clear()?;
    Ok(format!("Removed {} entries\n", removed))
}

/// Totals of an LCOV trace file.
pub fn cmd_summary(trace_path: &Path) -> Result<String> {
    let bytes = std::fs::read(trace_path)
        .with_context(|| format!("Failed to read {}", trace_path.display()))?;
    let sections = trace::parse(&bytes)?;
    let summary = trace::total(&sections);

    let mut out = String::new();
    writeln!(out, "Files:      {}", sections.len()).unwrap();
    write_summary(&mut out, &summary);
    Ok(out)
}

fn write_summary(out: &mut String, summary: &CoverageSummary) {
    writeln!(
        out,
        "Lines:      {}/{} ({:.1}%)",
        summary.lines.hit,
        summary.lines.found,
        summary.lines.rate() * 100.0
    )
    .unwrap();
    if summary.branches.found > 0 {
        writeln!(
            out,
            "Branches:   {}/{} ({:.1}%)",
            summary.branches.hit,
            summary.branches.found,
            summary.branches.rate() * 100.0
        )
        .unwrap();
    }
    if summary.functions.found > 0 {
        writeln!(
            out,
            "Functions:  {}/{} ({:.1}%)",
            summary.functions.hit,
            summary.functions.found,
            summary.functions.rate() * 100.0
        )
        .unwrap();
    }
}
