/// Reader for LCOV traces, including the ones this crate writes.
///
/// Records understood:
///   SF:<path>
///   FN:<line>,<name>
///   FNDA:<count>,<name>
///   DA:<line>,<count>[,<checksum>]
///   BRDA:<line>,<block>,<branch>,<taken>   ("-" means the decision never ran)
///   end_of_record
///
/// Summary records (FNF, FNH, BRF, BRH, LF, LH) are recomputed from the data.
use std::collections::HashMap;
use std::io::BufRead;

use crate::error::Result;
use crate::model::CoverageSummary;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFunction {
    pub name: String,
    pub line: Option<u32>,
    pub hits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceBranch {
    pub line: u32,
    pub block: u32,
    pub branch: u32,
    /// `None` when the decision was never reached.
    pub taken: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLine {
    pub line: u32,
    pub hits: u64,
}

/// One `SF:` .. `end_of_record` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSection {
    pub path: String,
    pub functions: Vec<TraceFunction>,
    pub branches: Vec<TraceBranch>,
    pub lines: Vec<TraceLine>,
}

impl TraceSection {
    fn new(path: String) -> Self {
        Self {
            path,
            functions: Vec::new(),
            branches: Vec::new(),
            lines: Vec::new(),
        }
    }

    pub fn summary(&self) -> CoverageSummary {
        let mut summary = CoverageSummary::default();
        for func in &self.functions {
            summary.functions.add(func.hits > 0);
        }
        for branch in &self.branches {
            summary.branches.add(branch.taken.is_some_and(|n| n > 0));
        }
        for line in &self.lines {
            summary.lines.add(line.hits > 0);
        }
        summary
    }
}

/// Parse every section of a trace. A trailing section without
/// `end_of_record` is kept.
pub fn parse(input: &[u8]) -> Result<Vec<TraceSection>> {
    let mut sections = Vec::new();
    parse_reader(&mut &*input, &mut |section| sections.push(section))?;
    Ok(sections)
}

fn parse_reader(reader: &mut dyn BufRead, emit: &mut dyn FnMut(TraceSection)) -> Result<()> {
    let mut current: Option<TraceSection> = None;
    // FN records come before their FNDA counterparts.
    let mut fn_lines: HashMap<String, u32> = HashMap::new();

    let mut raw_line = String::new();
    loop {
        raw_line.clear();
        if reader.read_line(&mut raw_line)? == 0 {
            break;
        }

        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "end_of_record" {
            if let Some(section) = current.take() {
                emit(section);
            }
            fn_lines.clear();
            continue;
        }

        let Some((tag, value)) = line.split_once(':') else {
            continue;
        };

        match tag {
            "SF" => {
                if let Some(section) = current.replace(TraceSection::new(value.to_string())) {
                    emit(section);
                }
                fn_lines.clear();
            }
            "FN" => {
                if let Some((line_str, name)) = value.split_once(',') {
                    if let Ok(start) = line_str.parse::<u32>() {
                        fn_lines.insert(name.to_string(), start);
                    }
                }
            }
            "FNDA" => {
                if let (Some(section), Some((count, name))) = (current.as_mut(), value.split_once(','))
                {
                    section.functions.push(TraceFunction {
                        name: name.to_string(),
                        line: fn_lines.get(name).copied(),
                        hits: count.parse().unwrap_or(0),
                    });
                }
            }
            "DA" => {
                let Some(section) = current.as_mut() else { continue };
                let mut parts = value.splitn(3, ',');
                let (Some(line_str), Some(count)) = (parts.next(), parts.next()) else {
                    continue;
                };
                // Negative counts mark non-instrumentable lines in some tools.
                if let (Ok(line), Ok(count)) = (line_str.parse::<u32>(), count.parse::<i64>()) {
                    if let Ok(hits) = u64::try_from(count) {
                        section.lines.push(TraceLine { line, hits });
                    }
                }
            }
            "BRDA" => {
                let Some(section) = current.as_mut() else { continue };
                let parts: Vec<&str> = value.splitn(4, ',').collect();
                if let [line, block, branch, taken] = parts.as_slice() {
                    if let (Ok(line), Ok(block), Ok(branch)) =
                        (line.parse(), block.parse(), branch.parse())
                    {
                        let taken = match *taken {
                            "-" => None,
                            n => Some(n.parse().unwrap_or(0)),
                        };
                        section.branches.push(TraceBranch { line, block, branch, taken });
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(section) = current.take() {
        emit(section);
    }
    Ok(())
}

/// Combined totals across all sections.
pub fn total(sections: &[TraceSection]) -> CoverageSummary {
    let mut summary = CoverageSummary::default();
    for section in sections {
        summary += section.summary();
    }
    summary
}
