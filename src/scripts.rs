//! Script bundle: resolves the scripts directory, reads the Lua sources,
//! and pre-registers them with the store.
//!
//! The scripts themselves are an opaque, versioned asset set shipped under
//! `dist/core/scripts`; the client only cares about their names and reply
//! contracts. Each bundle entry keeps both the SHA (for `EVALSHA`) and the
//! source (for the `NOSCRIPT` recovery `EVAL`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::SCRIPTS_DIR_ENV;
use crate::error::{OmniqError, Result};
use crate::store::Store;

/// The scripts every client must be able to load. Missing any of them fails
/// client creation.
pub const SCRIPT_NAMES: [&str; 15] = [
    "enqueue",
    "reserve",
    "heartbeat",
    "ack_success",
    "ack_fail",
    "promote_delayed",
    "reap_expired",
    "pause",
    "resume",
    "retry_failed",
    "retry_failed_batch",
    "remove_job",
    "remove_jobs_batch",
    "childs_init",
    "child_ack",
];

const DEFAULT_SCRIPTS_SUBDIR: &str = "dist/core/scripts";

/// One registered script.
#[derive(Debug, Clone)]
pub struct LoadedScript {
    /// SHA returned by `SCRIPT LOAD`.
    pub sha: String,
    /// Full source text, for the recovery `EVAL`.
    pub source: String,
}

/// The full set of registered scripts. Immutable after load.
#[derive(Debug)]
pub struct ScriptBundle {
    scripts: HashMap<&'static str, LoadedScript>,
}

impl ScriptBundle {
    /// Read every script in [`SCRIPT_NAMES`] from `dir` and register it
    /// with the store.
    pub async fn load(store: &dyn Store, dir: &Path) -> Result<Self> {
        let mut sources = Vec::with_capacity(SCRIPT_NAMES.len());
        for name in SCRIPT_NAMES {
            let path = dir.join(format!("{name}.lua"));
            let source = std::fs::read_to_string(&path).map_err(|e| {
                OmniqError::Config(format!("cannot read script {}: {e}", path.display()))
            })?;
            sources.push((name, source));
        }
        Self::from_sources(store, sources).await
    }

    /// Register an explicit set of script sources. Useful for embedded
    /// deployments (`include_str!`) and for tests; every name in
    /// [`SCRIPT_NAMES`] must be present.
    pub async fn from_sources(
        store: &dyn Store,
        sources: impl IntoIterator<Item = (&'static str, String)>,
    ) -> Result<Self> {
        let mut scripts = HashMap::with_capacity(SCRIPT_NAMES.len());
        for (name, source) in sources {
            let sha = store.script_load(&source).await?;
            scripts.insert(name, LoadedScript { sha, source });
        }
        for name in SCRIPT_NAMES {
            if !scripts.contains_key(name) {
                return Err(OmniqError::Config(format!("missing script source: {name}")));
            }
        }
        Ok(Self { scripts })
    }

    /// Look up a script by name.
    pub fn get(&self, name: &str) -> Option<&LoadedScript> {
        self.scripts.get(name)
    }

    /// Number of registered scripts.
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    /// Whether the bundle is empty.
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// Resolve the scripts directory.
///
/// The [`SCRIPTS_DIR_ENV`] environment variable wins outright; it must name
/// an existing directory. Otherwise the search walks upward from the running
/// executable's directory and from the current working directory looking for
/// `dist/core/scripts`.
pub fn resolve_scripts_dir() -> Result<PathBuf> {
    let env_override = std::env::var(SCRIPTS_DIR_ENV).ok();
    let mut starts = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            starts.push(dir.to_path_buf());
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        starts.push(cwd);
    }
    resolve_scripts_dir_from(env_override.as_deref(), &starts)
}

fn resolve_scripts_dir_from(env_override: Option<&str>, starts: &[PathBuf]) -> Result<PathBuf> {
    if let Some(dir) = env_override {
        let path = PathBuf::from(dir);
        if path.is_dir() {
            return Ok(path);
        }
        return Err(OmniqError::Config(format!(
            "{SCRIPTS_DIR_ENV} points to a missing directory: {dir}"
        )));
    }
    for start in starts {
        let mut current = Some(start.as_path());
        while let Some(dir) = current {
            let candidate = dir.join(DEFAULT_SCRIPTS_SUBDIR);
            if candidate.is_dir() {
                return Ok(candidate);
            }
            current = dir.parent();
        }
    }
    Err(OmniqError::Config(format!(
        "scripts directory not found; set {SCRIPTS_DIR_ENV} or ship {DEFAULT_SCRIPTS_SUBDIR}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStore;

    fn write_scripts(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(format!("{name}.lua")), "return redis.status_reply('OK')")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_bundle_loads_all_scripts() {
        let tmp = tempfile::tempdir().unwrap();
        write_scripts(tmp.path(), &SCRIPT_NAMES);

        let store = MockStore::new();
        let bundle = ScriptBundle::load(&store, tmp.path()).await.unwrap();

        assert_eq!(bundle.len(), SCRIPT_NAMES.len());
        assert_eq!(store.script_load_count(), SCRIPT_NAMES.len());
        let reserve = bundle.get("reserve").unwrap();
        assert!(!reserve.sha.is_empty());
        assert!(!reserve.source.is_empty());
    }

    #[tokio::test]
    async fn test_missing_script_fails_load() {
        let tmp = tempfile::tempdir().unwrap();
        // Everything except ack_fail.
        let partial: Vec<&str> = SCRIPT_NAMES
            .iter()
            .copied()
            .filter(|n| *n != "ack_fail")
            .collect();
        write_scripts(tmp.path(), &partial);

        let store = MockStore::new();
        let err = ScriptBundle::load(&store, tmp.path()).await.unwrap_err();
        assert!(matches!(err, OmniqError::Config(_)));
        assert!(err.to_string().contains("ack_fail"));
    }

    #[test]
    fn test_env_override_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let resolved =
            resolve_scripts_dir_from(Some(tmp.path().to_str().unwrap()), &[]).unwrap();
        assert_eq!(resolved, tmp.path());
    }

    #[test]
    fn test_env_override_must_exist() {
        let err = resolve_scripts_dir_from(Some("/nonexistent/omniq-scripts"), &[]).unwrap_err();
        assert!(matches!(err, OmniqError::Config(_)));
    }

    #[test]
    fn test_upward_walk_finds_dist() {
        let tmp = tempfile::tempdir().unwrap();
        let scripts = tmp.path().join(DEFAULT_SCRIPTS_SUBDIR);
        std::fs::create_dir_all(&scripts).unwrap();
        let nested = tmp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let resolved = resolve_scripts_dir_from(None, &[nested]).unwrap();
        assert_eq!(resolved, scripts);
    }

    #[test]
    fn test_no_dir_anywhere_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_scripts_dir_from(None, &[tmp.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, OmniqError::Config(_)));
    }
}
