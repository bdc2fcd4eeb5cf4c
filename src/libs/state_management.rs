// Persistent state store.
// The aggregate `UserState` lives in `data/state.json`, guarded by an
// advisory lock on the sibling `state.json.lock` file. The engine holds
// the lock for the whole apply; every save is a whole-file atomic write
// (temp + rename) so a crash between two resources never leaves a
// partially written state file. Read-only consumers (`plan`) bypass the
// lock entirely.

use crate::libs::errors::EnvboxError;
use crate::libs::utilities::file_operations::atomic_write;
use crate::schemas::state_file::UserState;
use crate::{log_debug, log_info};
use colored::Colorize;
use fs4::fs_std::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long one lock acquisition attempt waits before retrying.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Default bound on lock retries: 60 attempts at 500 ms is 30 seconds.
const DEFAULT_LOCK_RETRIES: u32 = 60;

pub struct StateStore {
    state_path: PathBuf,
    lock_path: PathBuf,
    lock_file: Option<File>,
    lock_retries: u32,
}

impl StateStore {
    /// Creates a store rooted in `data_dir`. Nothing is touched on disk
    /// until `lock`, `load` or `save` is called.
    pub fn new(data_dir: &Path) -> StateStore {
        let state_path = data_dir.join("state.json");
        StateStore {
            lock_path: data_dir.join("state.json.lock"),
            state_path,
            lock_file: None,
            lock_retries: DEFAULT_LOCK_RETRIES,
        }
    }

    /// Overrides the bounded retry policy for lock acquisition.
    pub fn with_lock_retries(mut self, retries: u32) -> StateStore {
        self.lock_retries = retries;
        self
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Acquires the advisory lock, blocking with bounded retries.
    /// Exhausting the retry budget means another apply is running.
    pub fn lock(&mut self) -> Result<(), EnvboxError> {
        if self.lock_file.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(EnvboxError::from)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(EnvboxError::from)?;

        for attempt in 0..=self.lock_retries {
            let acquired = file
                .try_lock_exclusive()
                .map_err(|err| EnvboxError::Lock(format!("locking {:?}: {err}", self.lock_path)))?;
            if acquired {
                log_debug!(
                    "[StateStore] Acquired lock {:?} (attempt {})",
                    self.lock_path.display().to_string().dimmed(),
                    attempt + 1
                );
                self.lock_file = Some(file);
                return Ok(());
            }
            if attempt < self.lock_retries {
                std::thread::sleep(LOCK_RETRY_DELAY);
            }
        }
        Err(EnvboxError::Lock(format!(
            "another apply is in progress (could not lock {:?})",
            self.lock_path
        )))
    }

    /// Releases the lock. Safe to call when the lock is not held;
    /// also runs on drop so every exit path unlocks.
    pub fn unlock(&mut self) {
        if let Some(file) = self.lock_file.take() {
            if let Err(err) = FileExt::unlock(&file) {
                log_debug!("[StateStore] Unlock of {:?} failed: {err}", self.lock_path);
            }
        }
    }

    /// Loads the persisted state; a missing file is an empty state.
    pub fn load(&self) -> Result<UserState, EnvboxError> {
        load_state_file(&self.state_path)
    }

    /// Reads state without taking the lock. Readers see whole files
    /// because every writer goes through temp + rename.
    pub fn load_read_only(data_dir: &Path) -> Result<UserState, EnvboxError> {
        load_state_file(&data_dir.join("state.json"))
    }

    /// Persists `state` atomically.
    pub fn save(&self, state: &UserState) -> Result<(), EnvboxError> {
        let serialized = serde_json::to_string_pretty(state)
            .map_err(|err| EnvboxError::State(format!("serializing state: {err}")))?;
        atomic_write(&self.state_path, serialized.as_bytes())
            .map_err(|err| EnvboxError::State(format!("writing {:?}: {err}", self.state_path)))?;
        log_debug!(
            "[StateStore] State saved to {}",
            self.state_path.display().to_string().cyan()
        );
        Ok(())
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        self.unlock();
    }
}

fn load_state_file(path: &Path) -> Result<UserState, EnvboxError> {
    if !path.exists() {
        log_info!(
            "[StateStore] No state file at {}; starting from an empty state",
            path.display().to_string().yellow()
        );
        return Ok(UserState::default());
    }
    let contents = fs::read_to_string(path)
        .map_err(|err| EnvboxError::State(format!("reading {:?}: {err}", path)))?;
    serde_json::from_str(&contents)
        .map_err(|err| EnvboxError::State(format!("parsing {:?}: {err}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::state_file::{ToolState, VersionKind};

    fn sample_state() -> UserState {
        let mut state = UserState::default();
        state.tools.insert(
            "jq".into(),
            ToolState {
                version: "1.7".into(),
                version_kind: VersionKind::Exact,
                spec_version: "1.7".into(),
                digest: None,
                install_path: None,
                binaries: vec!["jq".into()],
                runtime_ref: None,
                installer_ref: Some("download".into()),
                package: None,
                source_url: None,
                remove_command: None,
                taint_reason: None,
                updated_at: "2025-01-01T00:00:00+00:00".into(),
            },
        );
        state
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path());
        store.lock().unwrap();
        store.save(&sample_state()).unwrap();
        store.unlock();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.tools["jq"].version, "1.7");
        // Writes are temp + rename: no .tmp residue.
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn missing_state_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn second_locker_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = StateStore::new(dir.path());
        first.lock().unwrap();

        let mut second = StateStore::new(dir.path()).with_lock_retries(1);
        let err = second.lock().unwrap_err();
        assert!(matches!(err, EnvboxError::Lock(_)));
        assert!(err.to_string().contains("another apply is in progress"));
    }

    #[test]
    fn read_only_load_bypasses_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path());
        store.lock().unwrap();
        store.save(&sample_state()).unwrap();

        // The lock is still held; a read-only load must succeed anyway.
        let loaded = StateStore::load_read_only(dir.path()).unwrap();
        assert_eq!(loaded.tools["jq"].version, "1.7");
    }
}
