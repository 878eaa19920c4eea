#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use scriptcov::cache::CacheStore;
use scriptcov::fingerprint::{FileIdentity, MemoryArchive};
use scriptcov::session::{Session, SessionConfig};
use scriptcov::syntax::{ReflectEngine, ScriptEngine, SyntaxError};

/// Script sources paired with the syntax tree an engine would produce for them.
pub const FIXTURES: &[(&str, &str, &str)] = &[
    (
        "functions",
        include_str!("../fixtures/functions.js"),
        include_str!("../fixtures/functions.json"),
    ),
    (
        "if_else",
        include_str!("../fixtures/if_else.js"),
        include_str!("../fixtures/if_else.json"),
    ),
    (
        "switch",
        include_str!("../fixtures/switch.js"),
        include_str!("../fixtures/switch.json"),
    ),
    (
        "grow_v1",
        include_str!("../fixtures/grow_v1.js"),
        include_str!("../fixtures/grow_v1.json"),
    ),
    (
        "grow_v2",
        include_str!("../fixtures/grow_v2.js"),
        include_str!("../fixtures/grow_v2.json"),
    ),
    (
        "nested",
        include_str!("../fixtures/nested.js"),
        include_str!("../fixtures/nested.json"),
    ),
];

/// Source text of a fixture script.
pub fn source(name: &str) -> &'static str {
    FIXTURES
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, src, _)| *src)
        .unwrap()
}

/// An engine that knows the trees of every fixture and rejects anything else
/// as a syntax error.
pub fn fixture_engine() -> Box<dyn ScriptEngine> {
    let trees: HashMap<&'static str, &'static str> =
        FIXTURES.iter().map(|(_, src, tree)| (*src, *tree)).collect();
    Box::new(ReflectEngine::new(move |source: &str, filename: &str| {
        trees
            .get(source)
            .map(|tree| tree.to_string())
            .ok_or_else(|| SyntaxError::new(filename, Some(1), "unexpected token"))
    }))
}

/// Write fixture `name` to `dir/file_name` with a fixed mtime.
pub fn write_script(dir: &Path, file_name: &str, name: &str, mtime_secs: u64) -> FileIdentity {
    let path = dir.join(file_name);
    std::fs::write(&path, source(name)).unwrap();
    set_mtime(&path, mtime_secs);
    FileIdentity::File(path)
}

pub fn set_mtime(path: &Path, secs: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// A session over the fixture engine with an in-memory cache.
pub fn session(config: SessionConfig) -> Session {
    session_with(config, MemoryArchive::new(), CacheStore::open_in_memory().unwrap())
}

pub fn session_with(config: SessionConfig, archive: MemoryArchive, cache: CacheStore) -> Session {
    Session::new(config, fixture_engine(), Arc::new(archive), cache)
}

/// Replay one call of a function: the caller's line, the function entry as
/// the runtime reports it, and the lines run inside the body.
pub fn call(
    session: &mut Session,
    identity: &FileIdentity,
    call_line: u32,
    name: Option<&str>,
    entry_line: u32,
    body_lines: &[u32],
) {
    session.on_line_executed(identity, call_line);
    session.on_function_entered(identity, name, entry_line);
    for &line in body_lines {
        session.on_line_executed(identity, line);
    }
}

/// Create a fresh temporary cache database, returning the store, dir handle, and db path.
/// The caller must hold onto `TempDir` to keep the temp directory alive.
pub fn setup_cache() -> (CacheStore, tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("cache.db");
    let store = CacheStore::open(&db_path).unwrap();
    (store, dir, db_path)
}
