//! Run configuration and execution mode.
//!
//! `Config` is an immutable ordered string map. It is half of every
//! memoization key, so all updates are functional: combinators receive a
//! new value and the old one stays valid for cache lookups. Planner fields
//! the engine does not understand pass through untouched.

use crate::writer::{FlowSubmitter, FlowWriter, Writer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

const RUN_ID_KEY: &str = "conflux.run.id";
const UNIQUE_ID_KEY: &str = "conflux.unique.id";
const OPTIMIZATION_KEY: &str = "conflux.execution.optimization";
const CACHED_FILES_KEY: &str = "conflux.cached.files";

/// A fresh token inserted into config for sub-trees that need
/// identity-dependent configuration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UniqueId(String);

impl UniqueId {
    fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A file registered for distribution alongside the job.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CachedFile {
    path: String,
}

impl CachedFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Immutable run configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Config {
    entries: BTreeMap<String, String>,
}

impl Config {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Functional update; the receiver is untouched.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Config {
        let mut entries = self.entries.clone();
        entries.insert(key.into(), value.into());
        Config { entries }
    }

    /// Stamp the identity of one `run` invocation.
    pub fn with_run_id(&self, id: Uuid) -> Config {
        self.set(RUN_ID_KEY, id.to_string())
    }

    pub fn run_id(&self) -> Option<Uuid> {
        self.get(RUN_ID_KEY).and_then(|v| v.parse().ok())
    }

    /// Reuse the token already present, or mint one and return the config
    /// that carries it.
    pub fn ensure_unique_id(&self) -> (UniqueId, Config) {
        match self.get(UNIQUE_ID_KEY) {
            Some(token) => (UniqueId(token.to_string()), self.clone()),
            None => {
                let id = UniqueId::fresh();
                let conf = self.set(UNIQUE_ID_KEY, id.as_str());
                (id, conf)
            }
        }
    }

    /// IR optimization is on unless explicitly disabled.
    pub fn optimization_enabled(&self) -> bool {
        self.get(OPTIMIZATION_KEY) != Some("false")
    }

    pub fn with_optimization(&self, enabled: bool) -> Config {
        self.set(OPTIMIZATION_KEY, if enabled { "true" } else { "false" })
    }

    // The file list is stored JSON-encoded: paths may contain any
    // character a separator could collide with.
    pub fn add_cached_file(&self, file: &CachedFile) -> Config {
        let mut paths: Vec<String> = self
            .get(CACHED_FILES_KEY)
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        paths.push(file.path().to_string());
        let encoded =
            serde_json::to_string(&paths).expect("a list of strings always encodes");
        self.set(CACHED_FILES_KEY, encoded)
    }

    pub fn cached_files(&self) -> Vec<CachedFile> {
        self.get(CACHED_FILES_KEY)
            .and_then(|v| serde_json::from_str::<Vec<String>>(v).ok())
            .map(|paths| paths.into_iter().map(CachedFile::new).collect())
            .unwrap_or_default()
    }
}

/// Where a run executes, carrying the flow submitter the run will write
/// through.
#[derive(Clone)]
pub enum Mode {
    Local {
        submitter: Arc<dyn FlowSubmitter>,
    },
    Cluster {
        name: String,
        submitter: Arc<dyn FlowSubmitter>,
    },
}

impl Mode {
    pub fn local(submitter: Arc<dyn FlowSubmitter>) -> Self {
        Mode::Local { submitter }
    }

    pub fn cluster(name: impl Into<String>, submitter: Arc<dyn FlowSubmitter>) -> Self {
        Mode::Cluster {
            name: name.into(),
            submitter,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Mode::Local { .. })
    }

    pub fn submitter(&self) -> &Arc<dyn FlowSubmitter> {
        match self {
            Mode::Local { submitter } | Mode::Cluster { submitter, .. } => submitter,
        }
    }

    /// A fresh writer for one run.
    pub(crate) fn new_writer(&self) -> Arc<dyn Writer> {
        Arc::new(FlowWriter::new(self.submitter().clone()))
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Local { .. } => f.write_str("Mode::Local"),
            Mode::Cluster { name, .. } => write!(f, "Mode::Cluster({name})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_functional() {
        let base = Config::empty();
        let updated = base.set("planner.reducers", "16");
        assert_eq!(base.get("planner.reducers"), None);
        assert_eq!(updated.get("planner.reducers"), Some("16"));
    }

    #[test]
    fn ensure_unique_id_is_stable_once_minted() {
        let (first, conf) = Config::empty().ensure_unique_id();
        let (second, conf2) = conf.ensure_unique_id();
        assert_eq!(first, second);
        assert_eq!(conf, conf2);
    }

    #[test]
    fn distinct_configs_mint_distinct_tokens() {
        let (a, _) = Config::empty().ensure_unique_id();
        let (b, _) = Config::empty().ensure_unique_id();
        assert_ne!(a, b);
    }

    #[test]
    fn optimization_defaults_on() {
        let conf = Config::empty();
        assert!(conf.optimization_enabled());
        assert!(!conf.with_optimization(false).optimization_enabled());
    }

    #[test]
    fn run_id_round_trips() {
        let id = Uuid::new_v4();
        assert_eq!(Config::empty().with_run_id(id).run_id(), Some(id));
    }

    #[test]
    fn cached_files_accumulate() {
        let conf = Config::empty()
            .add_cached_file(&CachedFile::new("/data/lookup.tsv"))
            .add_cached_file(&CachedFile::new("/data/dict.bin"));
        let files = conf.cached_files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].file_name(), "dict.bin");
    }

    #[test]
    fn cached_file_paths_round_trip_commas() {
        let conf = Config::empty()
            .add_cached_file(&CachedFile::new("/data/a,b.tsv"))
            .add_cached_file(&CachedFile::new("/data/plain.bin"));
        let files = conf.cached_files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path(), "/data/a,b.tsv");
        assert_eq!(files[1].path(), "/data/plain.bin");
    }
}
