use std::path::{Path, PathBuf};

use crate::config::StorageSettings;

/// Resolve the state directory holding the registry, database and logs.
///
/// An explicit `storage.state_dir` wins; otherwise `.drover/` under the
/// base directory is used, whether or not it exists yet.
pub fn resolve_state_dir(base: &Path, storage: &StorageSettings) -> PathBuf {
    match &storage.state_dir {
        Some(dir) => dir.clone(),
        None => base.join(".drover"),
    }
}

/// Crash-recovery registry of live child pids.
pub fn registry_file(state_dir: &Path) -> PathBuf {
    state_dir.join("registry.json")
}

/// SQLite database of run records.
pub fn database_file(state_dir: &Path) -> PathBuf {
    state_dir.join("runs.db")
}

/// Directory of per-run transcript logs.
pub fn log_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_state_dir_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageSettings {
            state_dir: Some(tmp.path().join("elsewhere")),
        };

        let result = resolve_state_dir(Path::new("/proj"), &storage);
        assert_eq!(result, tmp.path().join("elsewhere"));
    }

    #[test]
    fn defaults_to_dot_drover_under_base() {
        let result = resolve_state_dir(Path::new("/proj"), &StorageSettings::default());
        assert_eq!(result, Path::new("/proj/.drover"));
    }

    #[test]
    fn derived_files_live_under_state_dir() {
        let state = Path::new("/proj/.drover");
        assert_eq!(registry_file(state), Path::new("/proj/.drover/registry.json"));
        assert_eq!(database_file(state), Path::new("/proj/.drover/runs.db"));
        assert_eq!(log_dir(state), Path::new("/proj/.drover/logs"));
    }
}
