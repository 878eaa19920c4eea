//! A coverage session: the set of tracked files, their static maps and their
//! hit counts, plus the cache used to avoid re-analysis.
//!
//! All failures are scoped to one file. A file that cannot be read, parsed or
//! cached is logged and left out; the rest of the session carries on.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::analyze::analyze;
use crate::blob;
use crate::cache::CacheStore;
use crate::error::{CoverageError, Result};
use crate::fingerprint::{FileIdentity, Fingerprint, ResourceArchive, Resolver};
use crate::model::CoverageMap;
use crate::report;
use crate::syntax::ScriptEngine;
use crate::tracker::HitCounts;

/// Settings fixed for the lifetime of a session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Coverage path set: an identity is tracked when its string form starts
    /// with one of these. Empty means every file is tracked.
    pub prefixes: Vec<String>,
    /// Where `finish` writes the trace and source snapshots.
    pub output_dir: Option<PathBuf>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

/// Counters describing how the cache was used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_writes: u64,
    /// Cache reads or writes that failed and were skipped.
    pub cache_errors: u64,
    /// Files that failed to parse.
    pub analysis_failures: u64,
}

/// Handle to a registered file, valid for the session that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(usize);

#[derive(Debug)]
pub struct TrackedFile {
    pub fingerprint: Fingerprint,
    /// Source text as handed to the engine.
    pub source: String,
    /// File contents byte for byte; source snapshots are written from these.
    pub bytes: Vec<u8>,
    pub map: CoverageMap,
    pub hits: HitCounts,
}

impl TrackedFile {
    pub fn identity(&self) -> &FileIdentity {
        &self.fingerprint.identity
    }
}

pub struct Session {
    config: SessionConfig,
    engine: Box<dyn ScriptEngine>,
    resolver: Resolver,
    cache: CacheStore,
    files: Vec<TrackedFile>,
    index: HashMap<FileIdentity, FileId>,
    failed: HashSet<FileIdentity>,
    stats: SessionStats,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        engine: Box<dyn ScriptEngine>,
        archive: Arc<dyn ResourceArchive>,
        cache: CacheStore,
    ) -> Self {
        Self {
            config,
            engine,
            resolver: Resolver::new(archive),
            cache,
            files: Vec::new(),
            index: HashMap::new(),
            failed: HashSet::new(),
            stats: SessionStats::default(),
        }
    }

    /// Open the on-disk cache at `path`, falling back to an in-memory cache
    /// (with a warning) when it cannot be opened.
    pub fn open_cache(path: &Path) -> Result<CacheStore> {
        match CacheStore::open(path) {
            Ok(store) => Ok(store),
            Err(err) => {
                warn!(path = %path.display(), "coverage cache unavailable, using memory: {err}");
                CacheStore::open_in_memory()
            }
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn is_tracked(&self, identity: &FileIdentity) -> bool {
        if self.config.prefixes.is_empty() {
            return true;
        }
        let key = identity.as_key();
        self.config.prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Start tracking `identity`, reusing a cached analysis when its
    /// fingerprint still matches. Registering twice returns the same id.
    pub fn register(&mut self, identity: &FileIdentity) -> Result<FileId> {
        if let Some(&id) = self.index.get(identity) {
            return Ok(id);
        }
        if !self.is_tracked(identity) {
            return Err(CoverageError::NotTracked(identity.to_string()));
        }

        let (fingerprint, bytes) = self.resolver.resolve_with_source(identity).map_err(|err| {
            warn!(identity = %identity, "skipping unreadable file: {err}");
            err
        })?;
        let source = String::from_utf8_lossy(&bytes).into_owned();

        let map = match self.cache.load(&fingerprint) {
            Ok(Some(map)) => {
                debug!(identity = %identity, "using cached analysis");
                self.stats.cache_hits += 1;
                map
            }
            Ok(None) => {
                self.stats.cache_misses += 1;
                self.analyze_and_store(&fingerprint, &source)?
            }
            Err(err) => {
                warn!(identity = %identity, "coverage cache unreadable, analyzing from source: {err}");
                self.stats.cache_errors += 1;
                self.stats.cache_misses += 1;
                self.analyze_and_store(&fingerprint, &source)?
            }
        };

        let id = FileId(self.files.len());
        self.files.push(TrackedFile {
            hits: HitCounts::new(&map),
            fingerprint,
            source,
            bytes,
            map,
        });
        self.index.insert(identity.clone(), id);
        Ok(id)
    }

    fn analyze_and_store(&mut self, fingerprint: &Fingerprint, source: &str) -> Result<CoverageMap> {
        let filename = fingerprint.identity.to_string();
        let program = self.engine.parse(source, &filename).map_err(|err| {
            warn!(identity = %filename, "skipping file with syntax error: {err}");
            self.stats.analysis_failures += 1;
            CoverageError::from(err)
        })?;
        let map = analyze(&program);
        debug!(
            identity = %filename,
            lines = map.executable_lines.len(),
            branches = map.branches.len(),
            functions = map.functions.len(),
            "analyzed"
        );

        match self.cache.save(fingerprint, &map) {
            Ok(()) => self.stats.cache_writes += 1,
            Err(err) => {
                warn!(identity = %filename, "could not write coverage cache: {err}");
                self.stats.cache_errors += 1;
            }
        }
        Ok(map)
    }

    pub fn file_id(&self, identity: &FileIdentity) -> Option<FileId> {
        self.index.get(identity).copied()
    }

    pub fn file(&self, id: FileId) -> Option<&TrackedFile> {
        self.files.get(id.0)
    }

    /// Tracked files in registration order.
    pub fn files(&self) -> &[TrackedFile] {
        &self.files
    }

    pub fn record_line_hit(&mut self, file: FileId, line: u32) {
        if let Some(tracked) = self.files.get_mut(file.0) {
            tracked.hits.record_line(line);
        }
    }

    pub fn record_branch_hit(&mut self, file: FileId, line: u32, branch_id: u32) {
        if let Some(tracked) = self.files.get_mut(file.0) {
            tracked.hits.record_branch(line, branch_id);
        }
    }

    pub fn record_function_call(&mut self, file: FileId, key: &str) -> bool {
        self.files
            .get_mut(file.0)
            .is_some_and(|tracked| tracked.hits.record_function_call(key))
    }

    /// Credit a call the runtime reported as entering at `line`; see
    /// [`HitCounts::function_entered`]. Returns the credited key.
    pub fn function_entered(&mut self, file: FileId, name: Option<&str>, line: u32) -> Option<String> {
        let tracked = self.files.get_mut(file.0)?;
        tracked.hits.function_entered(&tracked.map, name, line)
    }

    /// Engine callback: `line` of `identity` is about to run. Registers the
    /// file on first execution; files outside the path set or that failed to
    /// register are ignored.
    pub fn on_line_executed(&mut self, identity: &FileIdentity, line: u32) {
        if let Some(id) = self.ensure_registered(identity) {
            self.record_line_hit(id, line);
        }
    }

    /// Engine callback: a function of `identity` was entered at `line`.
    pub fn on_function_entered(&mut self, identity: &FileIdentity, name: Option<&str>, line: u32) {
        if let Some(id) = self.ensure_registered(identity) {
            self.function_entered(id, name, line);
        }
    }

    fn ensure_registered(&mut self, identity: &FileIdentity) -> Option<FileId> {
        if let Some(id) = self.file_id(identity) {
            return Some(id);
        }
        if self.failed.contains(identity) || !self.is_tracked(identity) {
            return None;
        }
        match self.register(identity) {
            Ok(id) => Some(id),
            Err(_) => {
                self.failed.insert(identity.clone());
                None
            }
        }
    }

    /// Fingerprints and maps of every tracked file as one blob.
    pub fn export_cache(&self) -> Result<Vec<u8>> {
        blob::encode(self.files.iter().map(|f| (&f.fingerprint, &f.map)))
    }

    /// Trace text for every tracked file that ran, without writing anything.
    pub fn serialize(&self) -> String {
        report::serialize(self)
    }

    /// Write the trace and source snapshots into `output_dir`.
    pub fn write_report(&self, output_dir: &Path) -> Result<PathBuf> {
        report::write_report(self, output_dir)
    }

    /// End the session, writing the report when an output directory is
    /// configured. Returns the cache so a later session can reuse it.
    pub fn finish(self) -> Result<CacheStore> {
        if let Some(dir) = &self.config.output_dir {
            let path = self.write_report(dir)?;
            debug!(path = %path.display(), "coverage report written");
        }
        Ok(self.cache)
    }
}
