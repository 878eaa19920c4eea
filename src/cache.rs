use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use tracing::{debug, warn};

use crate::blob;
use crate::error::{CoverageError, Result};
use crate::fingerprint::{FileIdentity, Fingerprint, Validity};
use crate::model::{BranchSite, CoverageMap, FunctionSite};

pub const SCHEMA_VERSION: u32 = 2;

const SCHEMA: &str = include_str!("../schema.sql");

const DROP_ALL: &str = "
    DROP TABLE IF EXISTS cached_branch_exit;
    DROP TABLE IF EXISTS cached_branch;
    DROP TABLE IF EXISTS cached_function;
    DROP TABLE IF EXISTS cached_line;
    DROP TABLE IF EXISTS cache_entry;
    DROP TABLE IF EXISTS schema_version;
";

/// One row of `cache_entry`, without its coverage map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
    pub identity: String,
    pub validity: Validity,
    pub updated_at: String,
}

/// Persistent mapping from fingerprint to coverage map.
///
/// A lookup only hits when both the identity and the validity token match;
/// an entry whose token differs is stale and reported as a miss.
pub struct CacheStore {
    conn: Connection,
}

impl CacheStore {
    /// Open (or create) the cache database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    /// A cache that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// A fresh in-memory cache seeded from an exported blob.
    pub fn from_blob(bytes: &[u8]) -> Result<Self> {
        let mut store = Self::open_in_memory()?;
        store.import(bytes)?;
        Ok(store)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Cached map for `fingerprint`, or `None` on a miss or stale entry.
    pub fn load(&self, fingerprint: &Fingerprint) -> Result<Option<CoverageMap>> {
        let identity = fingerprint.identity.as_key();
        let Some((entry_id, stored)) = self.find_entry(&identity)? else {
            debug!(identity = %identity, "cache miss");
            return Ok(None);
        };
        if stored != fingerprint.validity {
            debug!(identity = %identity, "stale cache entry");
            return Ok(None);
        }
        self.read_map(entry_id).map(Some)
    }

    /// Store `map` for `fingerprint`, replacing any entry for the same identity.
    pub fn save(&mut self, fingerprint: &Fingerprint, map: &CoverageMap) -> Result<()> {
        let tx = self.conn.transaction()?;
        save_tx(&tx, fingerprint, map)?;
        tx.commit()?;
        Ok(())
    }

    /// Remove the entry for `identity`. Returns whether one existed.
    pub fn remove(&mut self, identity: &FileIdentity) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM cache_entry WHERE identity = ?1",
            params![identity.as_key()],
        )?;
        Ok(removed > 0)
    }

    /// Remove every entry.
    pub fn clear(&mut self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM cache_entry", [])?)
    }

    /// All entries, ordered by identity.
    pub fn entries(&self) -> Result<Vec<CacheEntryInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT identity, mtime_sec, mtime_usec, checksum, updated_at
             FROM cache_entry ORDER BY identity",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, Option<u32>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (identity, secs, usecs, checksum, updated_at) = row?;
            let validity = validity_from_columns(&identity, secs, usecs, checksum)?;
            result.push(CacheEntryInfo {
                identity,
                validity,
                updated_at,
            });
        }
        Ok(result)
    }

    /// Serialize every entry into one blob (see [`crate::blob`]).
    pub fn export(&self) -> Result<Vec<u8>> {
        let mut pairs = Vec::new();
        for info in self.entries()? {
            let identity: FileIdentity = info.identity.parse()?;
            let Some((entry_id, _)) = self.find_entry(&info.identity)? else {
                continue;
            };
            let map = self.read_map(entry_id)?;
            pairs.push((
                Fingerprint {
                    identity,
                    validity: info.validity,
                },
                map,
            ));
        }
        blob::encode(pairs.iter().map(|(fp, map)| (fp, map)))
    }

    /// Merge the entries of an exported blob into this store, overwriting
    /// entries with the same identity. Returns the number of entries read.
    ///
    /// The blob is applied atomically: a malformed blob changes nothing.
    pub fn import(&mut self, bytes: &[u8]) -> Result<usize> {
        let entries = blob::decode(bytes)?;
        let tx = self.conn.transaction()?;
        for (fingerprint, map) in &entries {
            save_tx(&tx, fingerprint, map)?;
        }
        tx.commit()?;
        Ok(entries.len())
    }

    fn find_entry(&self, identity: &str) -> Result<Option<(i64, Validity)>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, mtime_sec, mtime_usec, checksum FROM cache_entry WHERE identity = ?1",
                params![identity],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<u32>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, secs, usecs, checksum)) => Ok(Some((
                id,
                validity_from_columns(identity, secs, usecs, checksum)?,
            ))),
            None => Ok(None),
        }
    }

    fn read_map(&self, entry_id: i64) -> Result<CoverageMap> {
        let mut map = CoverageMap::default();

        let mut stmt = self.conn.prepare_cached(
            "SELECT line_number FROM cached_line WHERE entry_id = ?1 ORDER BY line_number",
        )?;
        for line in stmt.query_map(params![entry_id], |row| row.get::<_, u32>(0))? {
            map.executable_lines.push(line?);
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT b.line_number, b.branch_index, e.exit_line
             FROM cached_branch b
             LEFT JOIN cached_branch_exit e
               ON e.entry_id = b.entry_id
              AND e.line_number = b.line_number
              AND e.branch_index = b.branch_index
             WHERE b.entry_id = ?1
             ORDER BY b.line_number, b.branch_index, e.exit_line",
        )?;
        let rows = stmt.query_map(params![entry_id], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, Option<u32>>(2)?,
            ))
        })?;
        for row in rows {
            let (line, branch_id, exit_line) = row?;
            let same = map
                .branches
                .last()
                .is_some_and(|b| b.line == line && b.branch_id == branch_id);
            if !same {
                map.branches.push(BranchSite {
                    line,
                    branch_id,
                    exit_lines: Vec::new(),
                });
            }
            if let (Some(exit), Some(branch)) = (exit_line, map.branches.last_mut()) {
                branch.exit_lines.push(exit);
            }
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT key, line_number, end_line, body_line
             FROM cached_function WHERE entry_id = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![entry_id], |row| {
            Ok(FunctionSite {
                key: row.get(0)?,
                line: row.get(1)?,
                end_line: row.get(2)?,
                body_line: row.get(3)?,
            })
        })?;
        for row in rows {
            map.functions.push(row?);
        }

        // SQLite orders text by bytes, which is also `String`'s order; this
        // only guards against hand-edited databases.
        map.canonicalize();
        Ok(map)
    }
}

/// Ensure the schema is initialized. A cache written by a different schema
/// version is discarded and recreated; cached analysis can always be redone.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    match version {
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => {
            warn!(
                found = v,
                expected = SCHEMA_VERSION,
                "discarding coverage cache written by a different schema version"
            );
            conn.execute_batch(DROP_ALL)?;
            conn.execute_batch(SCHEMA)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
    }
    Ok(())
}

fn save_tx(tx: &Transaction, fingerprint: &Fingerprint, map: &CoverageMap) -> Result<()> {
    let identity = fingerprint.identity.as_key();
    let (secs, usecs, checksum) = match &fingerprint.validity {
        Validity::Mtime { secs, usecs } => (Some(*secs), Some(*usecs), None),
        Validity::Checksum(sum) => (None, None, Some(sum.as_str())),
    };

    tx.execute(
        "DELETE FROM cache_entry WHERE identity = ?1",
        params![identity],
    )?;
    tx.execute(
        "INSERT INTO cache_entry (identity, mtime_sec, mtime_usec, checksum, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![identity, secs, usecs, checksum, Utc::now().to_rfc3339()],
    )?;
    let entry_id = tx.last_insert_rowid();

    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO cached_line (entry_id, line_number) VALUES (?1, ?2)",
        )?;
        for line in &map.executable_lines {
            stmt.execute(params![entry_id, line])?;
        }
    }

    {
        let mut branch_stmt = tx.prepare_cached(
            "INSERT INTO cached_branch (entry_id, line_number, branch_index) VALUES (?1, ?2, ?3)",
        )?;
        let mut exit_stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO cached_branch_exit (entry_id, line_number, branch_index, exit_line) \
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for branch in &map.branches {
            branch_stmt.execute(params![entry_id, branch.line, branch.branch_id])?;
            for exit in &branch.exit_lines {
                exit_stmt.execute(params![entry_id, branch.line, branch.branch_id, exit])?;
            }
        }
    }

    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO cached_function (entry_id, key, line_number, end_line, body_line)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for func in &map.functions {
            stmt.execute(params![entry_id, func.key, func.line, func.end_line, func.body_line])?;
        }
    }

    Ok(())
}

fn validity_from_columns(
    identity: &str,
    secs: Option<i64>,
    usecs: Option<u32>,
    checksum: Option<String>,
) -> Result<Validity> {
    match (secs, usecs, checksum) {
        (Some(secs), Some(usecs), None) => Ok(Validity::Mtime { secs, usecs }),
        (None, None, Some(sum)) => Ok(Validity::Checksum(sum)),
        _ => Err(CoverageError::Other(format!(
            "corrupt cache entry for '{identity}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file_fp(path: &str, secs: i64) -> Fingerprint {
        Fingerprint {
            identity: FileIdentity::File(PathBuf::from(path)),
            validity: Validity::Mtime { secs, usecs: 0 },
        }
    }

    fn sample_map() -> CoverageMap {
        CoverageMap {
            executable_lines: vec![1, 2, 4, 6],
            branches: vec![
                BranchSite { line: 1, branch_id: 0, exit_lines: vec![2] },
                BranchSite { line: 1, branch_id: 1, exit_lines: vec![4] },
                BranchSite { line: 6, branch_id: 0, exit_lines: vec![] },
            ],
            functions: vec![
                FunctionSite::new(None, 5, 0).with_body(5, None),
                FunctionSite::new(Some("main"), 3, 0).with_body(7, Some(4)),
            ],
        }
    }

    #[test]
    fn test_save_then_load() {
        let mut store = CacheStore::open_in_memory().unwrap();
        let fp = file_fp("/src/a.js", 100);
        store.save(&fp, &sample_map()).unwrap();
        assert_eq!(store.load(&fp).unwrap(), Some(sample_map()));
    }

    #[test]
    fn test_stale_entry_is_a_miss() {
        let mut store = CacheStore::open_in_memory().unwrap();
        store.save(&file_fp("/src/a.js", 100), &sample_map()).unwrap();
        assert_eq!(store.load(&file_fp("/src/a.js", 101)).unwrap(), None);
        assert_eq!(store.load(&file_fp("/src/b.js", 100)).unwrap(), None);
    }

    #[test]
    fn test_checksum_entries() {
        let mut store = CacheStore::open_in_memory().unwrap();
        let fp = Fingerprint {
            identity: FileIdentity::Resource("resource:///org/app/main.js".into()),
            validity: Validity::Checksum("abc".into()),
        };
        store.save(&fp, &sample_map()).unwrap();
        assert!(store.load(&fp).unwrap().is_some());

        let swapped = Fingerprint {
            validity: Validity::Checksum("def".into()),
            ..fp
        };
        assert!(store.load(&swapped).unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_identity() {
        let mut store = CacheStore::open_in_memory().unwrap();
        store.save(&file_fp("/src/a.js", 100), &sample_map()).unwrap();
        let newer = CoverageMap {
            executable_lines: vec![1],
            ..CoverageMap::default()
        };
        store.save(&file_fp("/src/a.js", 200), &newer).unwrap();
        store.save(&file_fp("/src/a.js", 200), &newer).unwrap();

        let entries = store.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].validity, Validity::Mtime { secs: 200, usecs: 0 });
        assert_eq!(store.load(&file_fp("/src/a.js", 200)).unwrap(), Some(newer));
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut store = CacheStore::open_in_memory().unwrap();
        store.save(&file_fp("/src/b.js", 7), &sample_map()).unwrap();
        store.save(&file_fp("/src/a.js", 9), &CoverageMap::default()).unwrap();

        let exported = store.export().unwrap();
        let reimported = CacheStore::from_blob(&exported).unwrap();
        assert_eq!(reimported.export().unwrap(), exported);
        assert_eq!(
            reimported.load(&file_fp("/src/b.js", 7)).unwrap(),
            Some(sample_map())
        );
    }

    #[test]
    fn test_bad_import_changes_nothing() {
        let mut store = CacheStore::open_in_memory().unwrap();
        store.save(&file_fp("/src/a.js", 1), &sample_map()).unwrap();
        assert!(store.import(b"not json").is_err());
        assert_eq!(store.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut store = CacheStore::open_in_memory().unwrap();
        store.save(&file_fp("/src/a.js", 1), &sample_map()).unwrap();
        store.save(&file_fp("/src/b.js", 1), &sample_map()).unwrap();

        assert!(store.remove(&FileIdentity::File(PathBuf::from("/src/a.js"))).unwrap());
        assert!(!store.remove(&FileIdentity::File(PathBuf::from("/src/a.js"))).unwrap());
        assert_eq!(store.clear().unwrap(), 1);
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn test_schema_version_mismatch_discards_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let mut store = CacheStore::open(&path).unwrap();
            store.save(&file_fp("/src/a.js", 1), &sample_map()).unwrap();
            store
                .conn
                .execute("UPDATE schema_version SET version = 99", [])
                .unwrap();
        }
        let store = CacheStore::open(&path).unwrap();
        assert!(store.entries().unwrap().is_empty());
    }
}
