//! Self-describing export format for a set of cache entries.
//!
//! ```text
//! {
//!   "<file identity>": {
//!     "mtime": [<sec>, <usec>] | null,
//!     "checksum": "<hex>" | null,
//!     "lines": [<line>, ...],
//!     "branches": [{ "point": <line>, "exits": [[<line>, ...], ...] }, ...],
//!     "functions": [{ "key": "<name>:<line>:<index>", "line": <line>,
//!                     "end_line": <line>, "body_line": <line> | null }, ...]
//!   }
//! }
//! ```
//!
//! Exactly one of `mtime` (regular files) and `checksum` (archive resources)
//! is set. Entries are keyed and ordered by identity, and every list is in
//! canonical order, so encoding the result of decoding a blob reproduces it
//! byte for byte.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoverageError, Result};
use crate::fingerprint::{Fingerprint, Validity};
use crate::model::{BranchSite, CoverageMap, FunctionSite};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub mtime: Option<(i64, u32)>,
    pub checksum: Option<String>,
    pub lines: Vec<u32>,
    pub branches: Vec<BranchPoint>,
    pub functions: Vec<FunctionRecord>,
}

/// All exits of the decision points on one line; `exits[i]` is branch id `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchPoint {
    pub point: u32,
    pub exits: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub key: String,
    pub line: u32,
    pub end_line: u32,
    pub body_line: Option<u32>,
}

impl CacheRecord {
    pub fn new(validity: &Validity, map: &CoverageMap) -> Self {
        let (mtime, checksum) = match validity {
            Validity::Mtime { secs, usecs } => (Some((*secs, *usecs)), None),
            Validity::Checksum(sum) => (None, Some(sum.clone())),
        };

        let mut branches: Vec<BranchPoint> = Vec::new();
        for site in &map.branches {
            match branches.last_mut() {
                Some(point) if point.point == site.line => point.exits.push(site.exit_lines.clone()),
                _ => branches.push(BranchPoint {
                    point: site.line,
                    exits: vec![site.exit_lines.clone()],
                }),
            }
        }

        Self {
            mtime,
            checksum,
            lines: map.executable_lines.clone(),
            branches,
            functions: map
                .functions
                .iter()
                .map(|f| FunctionRecord {
                    key: f.key.clone(),
                    line: f.line,
                    end_line: f.end_line,
                    body_line: f.body_line,
                })
                .collect(),
        }
    }

    pub fn validity(&self, identity: &str) -> Result<Validity> {
        match (&self.mtime, &self.checksum) {
            (Some((secs, usecs)), None) => Ok(Validity::Mtime {
                secs: *secs,
                usecs: *usecs,
            }),
            (None, Some(sum)) if !sum.is_empty() && sum.bytes().all(|b| b.is_ascii_hexdigit()) => {
                Ok(Validity::Checksum(sum.clone()))
            }
            (None, Some(_)) => Err(CoverageError::InvalidBlob(format!(
                "entry '{identity}' has a checksum that is not hex"
            ))),
            _ => Err(CoverageError::InvalidBlob(format!(
                "entry '{identity}' must have exactly one of mtime and checksum"
            ))),
        }
    }

    pub fn coverage_map(&self) -> CoverageMap {
        let branches = self
            .branches
            .iter()
            .flat_map(|point| {
                point.exits.iter().zip(0u32..).map(|(exits, id)| BranchSite {
                    line: point.point,
                    branch_id: id,
                    exit_lines: exits.clone(),
                })
            })
            .collect();
        let mut map = CoverageMap {
            executable_lines: self.lines.clone(),
            branches,
            functions: self
                .functions
                .iter()
                .map(|f| FunctionSite {
                    key: f.key.clone(),
                    line: f.line,
                    end_line: f.end_line.max(f.line),
                    body_line: f.body_line,
                })
                .collect(),
        };
        map.canonicalize();
        map
    }
}

/// Encode entries into one blob.
pub fn encode<'a, I>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a Fingerprint, &'a CoverageMap)>,
{
    let records: BTreeMap<String, CacheRecord> = entries
        .into_iter()
        .map(|(fp, map)| (fp.identity.as_key(), CacheRecord::new(&fp.validity, map)))
        .collect();
    let mut bytes = serde_json::to_vec_pretty(&records)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode a blob into `(fingerprint, map)` pairs, ordered by identity.
pub fn decode(bytes: &[u8]) -> Result<Vec<(Fingerprint, CoverageMap)>> {
    let records: BTreeMap<String, CacheRecord> = serde_json::from_slice(bytes)
        .map_err(|e| CoverageError::InvalidBlob(e.to_string()))?;

    records
        .into_iter()
        .map(|(key, record)| -> Result<(Fingerprint, CoverageMap)> {
            let identity = key.parse()?;
            let validity = record.validity(&key)?;
            Ok((Fingerprint { identity, validity }, record.coverage_map()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FileIdentity;
    use std::path::PathBuf;

    fn sample() -> (Fingerprint, CoverageMap) {
        let fp = Fingerprint {
            identity: FileIdentity::File(PathBuf::from("/src/a.js")),
            validity: Validity::Mtime { secs: 1_700_000_000, usecs: 250 },
        };
        let map = CoverageMap {
            executable_lines: vec![1, 2, 4],
            branches: vec![
                BranchSite { line: 1, branch_id: 0, exit_lines: vec![2] },
                BranchSite { line: 1, branch_id: 1, exit_lines: vec![4] },
            ],
            functions: vec![FunctionSite::new(Some("f"), 3, 0).with_body(5, Some(4))],
        };
        (fp, map)
    }

    #[test]
    fn test_layout() {
        let (fp, map) = sample();
        let bytes = encode([(&fp, &map)]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let entry = &value["/src/a.js"];
        assert_eq!(entry["mtime"], serde_json::json!([1_700_000_000, 250]));
        assert!(entry["checksum"].is_null());
        assert_eq!(entry["lines"], serde_json::json!([1, 2, 4]));
        assert_eq!(entry["branches"], serde_json::json!([{ "point": 1, "exits": [[2], [4]] }]));
        assert_eq!(
            entry["functions"],
            serde_json::json!([{ "key": "f:3:0", "line": 3, "end_line": 5, "body_line": 4 }])
        );
    }

    #[test]
    fn test_decode_restores_entries() {
        let (fp, map) = sample();
        let bytes = encode([(&fp, &map)]).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, vec![(fp, map)]);
        let again = encode(decoded.iter().map(|(f, m)| (f, m))).unwrap();
        assert_eq!(again, bytes);
    }

    #[test]
    fn test_rejects_ambiguous_validity() {
        let blob = br#"{"/a.js": {"mtime": [1, 2], "checksum": "ab", "lines": [], "branches": [], "functions": []}}"#;
        assert!(matches!(decode(blob), Err(CoverageError::InvalidBlob(_))));
        let blob = br#"{"/a.js": {"mtime": null, "checksum": null, "lines": [], "branches": [], "functions": []}}"#;
        assert!(matches!(decode(blob), Err(CoverageError::InvalidBlob(_))));
    }

    #[test]
    fn test_rejects_non_hex_checksum() {
        let blob = r#"{"resource:///a.js": {"mtime": null, "checksum": "aééééééééé", "lines": [], "branches": [], "functions": []}}"#;
        assert!(matches!(decode(blob.as_bytes()), Err(CoverageError::InvalidBlob(_))));
        let blob = br#"{"resource:///a.js": {"mtime": null, "checksum": "09afAF", "lines": [], "branches": [], "functions": []}}"#;
        assert_eq!(decode(blob).unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(decode(b"\x00\x01garbage"), Err(CoverageError::InvalidBlob(_))));
    }
}
