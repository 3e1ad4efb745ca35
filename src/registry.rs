//! Crash-recovery registry of live child pids.
//!
//! Every mutation is persisted synchronously so a crashed bridge leaves an
//! accurate map behind. At the next startup the map is swept: entries whose
//! pid is still alive are terminated, then the file is removed. Persistence
//! failures are logged and never block admission.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

pub struct PidRegistry {
    path: PathBuf,
    pids: Mutex<HashMap<String, u32>>,
}

impl PidRegistry {
    /// Open the registry at `path`, loading any previous contents. A corrupt
    /// file is logged and treated as empty.
    pub fn open(path: PathBuf) -> Self {
        let pids = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(pids) => pids,
                Err(err) => {
                    warn!(path = %path.display(), %err, "ignoring corrupt pid registry");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            pids: Mutex::new(pids),
        }
    }

    pub fn register(&self, run_id: &str, pid: u32) {
        let mut pids = self.pids.lock().unwrap_or_else(|e| e.into_inner());
        pids.insert(run_id.to_string(), pid);
        self.persist(&pids);
    }

    pub fn unregister(&self, run_id: &str) {
        let mut pids = self.pids.lock().unwrap_or_else(|e| e.into_inner());
        if pids.remove(run_id).is_some() {
            self.persist(&pids);
        }
    }

    pub fn pid_of(&self, run_id: &str) -> Option<u32> {
        let pids = self.pids.lock().unwrap_or_else(|e| e.into_inner());
        pids.get(run_id).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, u32> {
        let pids = self.pids.lock().unwrap_or_else(|e| e.into_inner());
        pids.clone()
    }

    /// Kill children left over from a previous bridge instance and remove the
    /// registry file. Returns the entries that were still alive.
    pub fn recover(&self) -> Vec<(String, u32)> {
        let mut pids = self.pids.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<(String, u32)> = pids
            .drain()
            .filter(|(_, pid)| process_alive(*pid))
            .collect();
        for (run_id, pid) in &stale {
            warn!(run_id, pid, "terminating orphaned child");
            terminate(*pid);
        }
        if !stale.is_empty() {
            std::thread::sleep(Duration::from_millis(500));
            for (_, pid) in &stale {
                if process_alive(*pid) {
                    kill(*pid);
                }
            }
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "failed to remove pid registry");
            }
        }
        stale
    }

    fn persist(&self, pids: &HashMap<String, u32>) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(pids)?;
            std::fs::write(&self.path, contents)
        };
        if let Err(err) = write() {
            warn!(path = %self.path.display(), %err, "failed to persist pid registry");
        }
    }
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(unix)]
pub fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(unix)]
pub fn kill(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) {}

#[cfg(not(unix))]
pub fn kill(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    // Far above any real pid_max, so sweep tests never signal a live process.
    const DEAD_PID: u32 = 4_000_000;

    #[test]
    fn register_persists_to_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("registry.json");
        let registry = PidRegistry::open(path.clone());
        registry.register("run-1", 1234);

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: HashMap<String, u32> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.get("run-1"), Some(&1234));
    }

    #[test]
    fn reopen_loads_existing_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("registry.json");
        PidRegistry::open(path.clone()).register("run-1", 42);

        let registry = PidRegistry::open(path);
        assert_eq!(registry.pid_of("run-1"), Some(42));
    }

    #[test]
    fn unregister_removes_entry_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("registry.json");
        let registry = PidRegistry::open(path.clone());
        registry.register("run-1", 42);
        registry.unregister("run-1");

        assert_eq!(registry.pid_of("run-1"), None);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), "{}");
    }

    #[test]
    fn recover_sweeps_dead_entries_and_removes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("registry.json");
        let registry = PidRegistry::open(path.clone());
        registry.register("run-1", DEAD_PID);

        let stale = registry.recover();
        assert!(stale.is_empty());
        assert!(registry.snapshot().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("registry.json");
        std::fs::write(&path, "not json").unwrap();

        let registry = PidRegistry::open(path);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
