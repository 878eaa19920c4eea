//! File identity and freshness tokens.
//!
//! Regular files are versioned by modification time, resource-archive entries
//! by a checksum of their bytes (archive entries carry no useful mtime, and may
//! be swapped in place under the same URI).
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CoverageError, Result};

/// URI scheme used for resource-archive entries.
pub const RESOURCE_SCHEME: &str = "resource://";

/// Where a tracked script lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileIdentity {
    File(PathBuf),
    /// Full URI, including the `resource://` scheme.
    Resource(String),
}

impl FileIdentity {
    /// The string used in cache keys, prefix matching and the trace.
    pub fn as_key(&self) -> String {
        self.to_string()
    }

    /// Relative path under which a snapshot of this file is mirrored.
    ///
    /// Resources go under `resource/`, absolute files under `file/` and
    /// relative files under `relative/`, so no two kinds share a snapshot.
    pub fn mirror_path(&self) -> PathBuf {
        match self {
            FileIdentity::Resource(uri) => {
                let mut out = PathBuf::from("resource");
                out.extend(
                    uri.strip_prefix(RESOURCE_SCHEME)
                        .unwrap_or(uri)
                        .split('/')
                        .filter(|part| !part.is_empty() && *part != "." && *part != ".."),
                );
                out
            }
            FileIdentity::File(path) => {
                let mut out = PathBuf::from(if path.has_root() { "file" } else { "relative" });
                out.extend(path.components().filter_map(|c| match c {
                    std::path::Component::Normal(part) => Some(part),
                    _ => None,
                }));
                out
            }
        }
    }
}

impl std::str::FromStr for FileIdentity {
    type Err = CoverageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(CoverageError::NotFound(String::new()));
        }
        if s.starts_with(RESOURCE_SCHEME) {
            Ok(FileIdentity::Resource(s.to_string()))
        } else {
            Ok(FileIdentity::File(PathBuf::from(s)))
        }
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileIdentity::File(path) => write!(f, "{}", path.display()),
            FileIdentity::Resource(uri) => f.write_str(uri),
        }
    }
}

/// Freshness token: one validity rule per identity kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Validity {
    Mtime { secs: i64, usecs: u32 },
    Checksum(String),
}

/// Identity plus freshness token. Two fingerprints are equal iff both parts are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub identity: FileIdentity,
    pub validity: Validity,
}

/// Read access to packaged, immutable resources.
pub trait ResourceArchive {
    /// Bytes registered under `uri`, if any.
    fn lookup(&self, uri: &str) -> Option<Arc<[u8]>>;
}

/// In-memory archive. Clones share the same registry, so a host can register
/// or unregister resources while a session holds its own handle.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    entries: Arc<RwLock<HashMap<String, Arc<[u8]>>>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, uri: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        let bytes: Vec<u8> = bytes.into();
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri.into(), Arc::from(bytes));
    }

    pub fn unregister(&self, uri: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uri)
            .is_some()
    }
}

impl ResourceArchive for MemoryArchive {
    fn lookup(&self, uri: &str) -> Option<Arc<[u8]>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .cloned()
    }
}

/// Checksum of archive content: blake3, hex encoded.
#[must_use]
pub fn checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Turns identities into fingerprints and source bytes.
pub struct Resolver {
    archive: Arc<dyn ResourceArchive>,
}

impl Resolver {
    pub fn new(archive: Arc<dyn ResourceArchive>) -> Self {
        Self { archive }
    }

    /// Fingerprint of `identity` as it is right now.
    pub fn resolve(&self, identity: &FileIdentity) -> Result<Fingerprint> {
        self.resolve_with_source(identity).map(|(fp, _)| fp)
    }

    /// Fingerprint plus the bytes it was computed from.
    ///
    /// Both come from the same read, so an archive entry swapped in between
    /// cannot produce a checksum that does not match the returned bytes.
    pub fn resolve_with_source(&self, identity: &FileIdentity) -> Result<(Fingerprint, Vec<u8>)> {
        match identity {
            FileIdentity::File(path) => {
                let validity = file_mtime(path)?;
                let bytes = std::fs::read(path).map_err(|e| not_found(identity, e))?;
                Ok((
                    Fingerprint {
                        identity: identity.clone(),
                        validity,
                    },
                    bytes,
                ))
            }
            FileIdentity::Resource(uri) => {
                let bytes = self
                    .archive
                    .lookup(uri)
                    .ok_or_else(|| CoverageError::NotFound(uri.clone()))?;
                Ok((
                    Fingerprint {
                        identity: identity.clone(),
                        validity: Validity::Checksum(checksum(&bytes)),
                    },
                    bytes.to_vec(),
                ))
            }
        }
    }
}

fn file_mtime(path: &Path) -> Result<Validity> {
    let identity = FileIdentity::File(path.to_path_buf());
    let modified = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| not_found(&identity, e))?;
    Ok(mtime_validity(modified))
}

/// Split a timestamp into whole seconds and microseconds since the epoch.
/// Seconds round toward negative infinity, so `usecs` is never negative and
/// times before the epoch stay distinct from their mirror images after it.
fn mtime_validity(modified: SystemTime) -> Validity {
    let (secs, usecs) = match modified.duration_since(UNIX_EPOCH) {
        Ok(since) => (
            i64::try_from(since.as_secs()).unwrap_or(i64::MAX),
            since.subsec_micros(),
        ),
        Err(before) => {
            let d = before.duration();
            let whole = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
            match d.subsec_micros() {
                0 => (-whole, 0),
                micros => (-whole - 1, 1_000_000 - micros),
            }
        }
    };
    Validity::Mtime { secs, usecs }
}

fn not_found(identity: &FileIdentity, err: std::io::Error) -> CoverageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        CoverageError::NotFound(identity.to_string())
    } else {
        CoverageError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn resolver(archive: &MemoryArchive) -> Resolver {
        Resolver::new(Arc::new(archive.clone()))
    }

    #[test]
    fn test_identity_from_str() {
        let res: FileIdentity = "resource:///org/app/main.js".parse().unwrap();
        assert_eq!(res, FileIdentity::Resource("resource:///org/app/main.js".into()));
        let file: FileIdentity = "/tmp/main.js".parse().unwrap();
        assert_eq!(file, FileIdentity::File(PathBuf::from("/tmp/main.js")));
        assert_eq!(file.to_string(), "/tmp/main.js");
        assert!("".parse::<FileIdentity>().is_err());
    }

    #[test]
    fn test_mirror_paths() {
        let res = FileIdentity::Resource("resource:///org/app/../main.js".into());
        assert_eq!(res.mirror_path(), PathBuf::from("resource/org/app/main.js"));
        let file = FileIdentity::File(PathBuf::from("/home/me/src/a.js"));
        assert_eq!(file.mirror_path(), PathBuf::from("file/home/me/src/a.js"));
    }

    #[test]
    fn test_mirror_paths_keep_kinds_apart() {
        let paths = [
            FileIdentity::File(PathBuf::from("/org/x.js")).mirror_path(),
            FileIdentity::File(PathBuf::from("org/x.js")).mirror_path(),
            FileIdentity::Resource("resource:///org/x.js".into()).mirror_path(),
        ];
        assert_eq!(paths[0], PathBuf::from("file/org/x.js"));
        assert_eq!(paths[1], PathBuf::from("relative/org/x.js"));
        assert_eq!(paths[2], PathBuf::from("resource/org/x.js"));
    }

    #[test]
    fn test_pre_epoch_mtimes_round_down() {
        let before = UNIX_EPOCH - Duration::from_millis(500);
        let after = UNIX_EPOCH + Duration::from_millis(500);
        assert_eq!(mtime_validity(before), Validity::Mtime { secs: -1, usecs: 500_000 });
        assert_eq!(mtime_validity(after), Validity::Mtime { secs: 0, usecs: 500_000 });
        assert_eq!(
            mtime_validity(UNIX_EPOCH - Duration::from_secs(2)),
            Validity::Mtime { secs: -2, usecs: 0 }
        );
        assert_eq!(
            mtime_validity(UNIX_EPOCH - Duration::from_micros(2_250_001)),
            Validity::Mtime { secs: -3, usecs: 749_999 }
        );
    }

    #[test]
    fn test_missing_entries_are_not_found() {
        let archive = MemoryArchive::new();
        let r = resolver(&archive);
        let err = r
            .resolve(&FileIdentity::Resource("resource:///nope.js".into()))
            .unwrap_err();
        assert!(matches!(err, CoverageError::NotFound(_)));

        let dir = tempfile::tempdir().unwrap();
        let err = r
            .resolve(&FileIdentity::File(dir.path().join("nope.js")))
            .unwrap_err();
        assert!(matches!(err, CoverageError::NotFound(_)));
    }

    #[test]
    fn test_file_fingerprint_follows_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.js");
        std::fs::write(&path, "x();\n").unwrap();
        let identity = FileIdentity::File(path.clone());
        let r = resolver(&MemoryArchive::new());

        let first = r.resolve(&identity).unwrap();
        assert_eq!(first, r.resolve(&identity).unwrap());

        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
        let second = r.resolve(&identity).unwrap();
        assert_ne!(first, second);
        assert_eq!(first.identity, second.identity);
    }

    #[test]
    fn test_resource_fingerprint_follows_content() {
        let archive = MemoryArchive::new();
        let uri = "resource:///org/app/main.js";
        archive.register(uri, b"a();\n".to_vec());
        let identity = FileIdentity::Resource(uri.into());
        let r = resolver(&archive);

        let (first, bytes) = r.resolve_with_source(&identity).unwrap();
        assert_eq!(bytes, b"a();\n");
        assert_eq!(first.validity, Validity::Checksum(checksum(b"a();\n")));

        archive.register(uri, b"b();\n".to_vec());
        let second = r.resolve(&identity).unwrap();
        assert_ne!(first, second);

        assert!(archive.unregister(uri));
        assert!(r.resolve(&identity).is_err());
    }
}
