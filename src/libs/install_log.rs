// Per-resource install logs.
// Every apply gets a session directory `cache/logs/<session-id>/`, and
// every resource touched during the apply gets a `<kind>-<name>.log` file
// with timestamped lines mirroring its event stream. Old sessions are
// pruned so the cache does not grow without bound.

use crate::libs::errors::EnvboxError;
use crate::libs::events::{Event, EventSink};
use crate::libs::plan::Action;
use crate::libs::utilities::timestamps::{current_timestamp, session_timestamp};
use crate::log_debug;
use crate::schemas::resource::Kind;
use colored::Colorize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Sessions kept on disk; the oldest beyond this count are removed.
const RETAINED_SESSIONS: usize = 10;

pub struct SessionLogger {
    session_dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
}

impl SessionLogger {
    /// Creates the session directory under `logs_dir` and prunes old
    /// sessions. The session id combines a timestamp with the pid so two
    /// applies started in the same second stay distinguishable.
    pub fn create(logs_dir: &Path) -> Result<Arc<SessionLogger>, EnvboxError> {
        let session_id = format!("{}-{}", session_timestamp(), std::process::id());
        let session_dir = logs_dir.join(&session_id);
        fs::create_dir_all(&session_dir).map_err(EnvboxError::from)?;
        log_debug!(
            "[Logs] Session {} logging to {}",
            session_id.yellow(),
            session_dir.display().to_string().dimmed()
        );
        prune_old_sessions(logs_dir, RETAINED_SESSIONS)?;
        Ok(Arc::new(SessionLogger {
            session_dir,
            files: Mutex::new(HashMap::new()),
        }))
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Appends one timestamped line to the resource's log file.
    pub fn log_line(&self, kind: Kind, name: &str, line: &str) {
        let file_name = format!("{kind}-{name}.log");
        let mut files = self.files.lock().unwrap();
        if !files.contains_key(&file_name) {
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.session_dir.join(&file_name))
            {
                Ok(file) => {
                    files.insert(file_name.clone(), file);
                }
                // Logging must never fail an install.
                Err(_) => return,
            }
        }
        if let Some(file) = files.get_mut(&file_name) {
            let _ = writeln!(file, "{} {}", current_timestamp(), line);
        }
    }

    /// Mirrors an engine event into the owning resource's log file.
    pub fn record(&self, event: &Event) {
        match event {
            Event::Start { kind, name, version, action, method } => {
                self.log_line(*kind, name, &format!("start action={action} version={version} method={method}"));
            }
            Event::Output { kind, name, line } => {
                self.log_line(*kind, name, line);
            }
            Event::DownloadProgress { .. } => {
                // Progress is terminal chrome, not log material.
            }
            Event::Error { kind, name, message } => {
                self.log_line(*kind, name, &format!("error: {message}"));
            }
            Event::Complete { kind, name, version, action } => {
                self.log_line(*kind, name, &format!("complete action={action} version={version}"));
            }
        }
    }

    /// An event sink that mirrors everything into the session log.
    pub fn sink(self: &Arc<Self>) -> EventSink {
        let logger = Arc::clone(self);
        EventSink::new(move |event| logger.record(event))
    }

    /// Writes a summary line for a resource outside the event flow
    /// (removals executed without a Start event, for instance).
    pub fn note(&self, kind: Kind, name: &str, action: Action, message: &str) {
        self.log_line(kind, name, &format!("{action}: {message}"));
    }
}

/// Removes the oldest session directories beyond `keep`. Session ids sort
/// chronologically by construction, so lexicographic order is age order.
fn prune_old_sessions(logs_dir: &Path, keep: usize) -> Result<(), EnvboxError> {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return Ok(());
    };
    let mut sessions: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    sessions.sort();
    let excess = sessions.len().saturating_sub(keep);
    for old in sessions.into_iter().take(excess) {
        log_debug!("[Logs] Pruning old session {}", old.display().to_string().dimmed());
        let _ = fs::remove_dir_all(&old);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_land_in_per_resource_files() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::create(dir.path()).unwrap();
        logger.record(&Event::Output {
            kind: Kind::Tool,
            name: "jq".into(),
            line: "installing".into(),
        });
        logger.record(&Event::Error {
            kind: Kind::Runtime,
            name: "go".into(),
            message: "boom".into(),
        });

        let tool_log = fs::read_to_string(logger.session_dir().join("tool-jq.log")).unwrap();
        assert!(tool_log.contains("installing"));
        let runtime_log = fs::read_to_string(logger.session_dir().join("runtime-go.log")).unwrap();
        assert!(runtime_log.contains("error: boom"));
    }

    #[test]
    fn old_sessions_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..(RETAINED_SESSIONS + 3) {
            fs::create_dir_all(dir.path().join(format!("20250101-00000{i}-1"))).unwrap();
        }
        prune_old_sessions(dir.path(), RETAINED_SESSIONS).unwrap();
        let remaining = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, RETAINED_SESSIONS);
    }
}
