// Per-resource installers.
// Each installer turns one planned action into filesystem reality and
// returns the state entry the engine commits. Installers never touch the
// state store themselves: they receive a read-only snapshot of the state
// (for cross-resource lookups like a tool's runtime) and hand back a
// `StateDelta` the engine applies under its lock.

pub mod repository;
pub mod runtime;
pub mod shell;
pub mod tool;

use crate::libs::errors::EnvboxError;
use crate::libs::events::{Event, EventSink};
use crate::libs::plan::{Action, PlannedAction};
use crate::libs::utilities::paths::EnvPaths;
use crate::schemas::resource::{Kind, Ref, Resource};
use crate::schemas::state_file::{
    InstallerRepositoryState, InstallerState, RuntimeState, ToolState, UserState,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Everything a worker needs to execute one resource: shared services,
/// the cancellation flag, and an immutable snapshot of the state as it
/// was when the current layer started. Layer barriers guarantee the
/// snapshot already contains every dependency's entry.
pub struct InstallContext {
    pub paths: EnvPaths,
    pub agent: ureq::Agent,
    pub sink: EventSink,
    pub cancel: Arc<AtomicBool>,
    pub state: Arc<UserState>,
    /// The registry ref used for package resolution (e.g. `v4.465.0`).
    pub registry_ref: String,
    pub registry_base_url: String,
}

impl InstallContext {
    /// An output callback that forwards delegation command lines as
    /// Output events for the given resource.
    pub fn output_sink(&self, kind: Kind, name: &str) -> impl Fn(&str) + Send + Sync + 'static {
        let sink = self.sink.clone();
        let name = name.to_string();
        move |line: &str| {
            sink.emit(&Event::Output { kind, name: name.clone(), line: line.to_string() });
        }
    }

    /// A progress callback reporting download bytes for the resource.
    pub fn progress_sink(&self, kind: Kind, name: &str) -> impl Fn(u64, Option<u64>) + Send + Sync + 'static {
        let sink = self.sink.clone();
        let name = name.to_string();
        move |downloaded: u64, total: Option<u64>| {
            sink.emit(&Event::DownloadProgress { kind, name: name.clone(), downloaded, total });
        }
    }
}

/// The state mutation an installer hands back to the engine.
#[derive(Debug, Clone)]
pub enum StateDelta {
    Runtime { name: String, state: RuntimeState },
    Tool { name: String, state: ToolState },
    Installer { name: String, state: InstallerState },
    Repository { name: String, state: InstallerRepositoryState },
    Removed { reference: Ref },
}

/// Executes an install/upgrade/downgrade/reinstall for one resource.
pub fn execute(
    ctx: &InstallContext,
    resource: &Resource,
    planned: &PlannedAction,
) -> Result<StateDelta, EnvboxError> {
    let reference = resource.reference();
    debug_assert!(matches!(
        planned.action,
        Action::Install | Action::Upgrade | Action::Downgrade | Action::Reinstall
    ));

    match resource {
        Resource::Runtime { name, spec, .. } => {
            let state = runtime::install_runtime(ctx, name, spec, planned)
                .map_err(|err| err.for_resource(&reference))?;
            Ok(StateDelta::Runtime { name: name.clone(), state })
        }
        Resource::Installer { name, spec, .. } => {
            let state = runtime::install_installer(ctx, name, spec, planned)
                .map_err(|err| err.for_resource(&reference))?;
            Ok(StateDelta::Installer { name: name.clone(), state })
        }
        Resource::Tool { name, spec, .. } => {
            let state = tool::install_tool(ctx, name, spec, planned)
                .map_err(|err| err.for_resource(&reference))?;
            Ok(StateDelta::Tool { name: name.clone(), state })
        }
        Resource::InstallerRepository { name, spec, .. } => {
            let state = repository::install_repository(ctx, name, spec)
                .map_err(|err| err.for_resource(&reference))?;
            Ok(StateDelta::Repository { name: name.clone(), state })
        }
        Resource::ToolSet { .. } => Err(EnvboxError::Configuration(format!(
            "{reference}: tool sets must be expanded before execution"
        ))),
    }
}

/// Executes a removal for a state entry. Removal order within a resource
/// is symlinks, then artifacts, then the state entry (which the engine
/// deletes after this returns).
pub fn execute_remove(
    ctx: &InstallContext,
    reference: &Ref,
    state: &UserState,
) -> Result<StateDelta, EnvboxError> {
    match reference.kind {
        Kind::Runtime => {
            let entry = state.runtimes.get(&reference.name).ok_or_else(|| {
                EnvboxError::State(format!("{reference}: no state entry to remove"))
            })?;
            runtime::remove_runtime(ctx, Kind::Runtime, &reference.name, entry)
                .map_err(|err| err.for_resource(reference))?;
        }
        Kind::Installer => {
            let entry = state.installers.get(&reference.name).ok_or_else(|| {
                EnvboxError::State(format!("{reference}: no state entry to remove"))
            })?;
            runtime::remove_runtime(ctx, Kind::Installer, &reference.name, entry)
                .map_err(|err| err.for_resource(reference))?;
        }
        Kind::Tool => {
            let entry = state.tools.get(&reference.name).ok_or_else(|| {
                EnvboxError::State(format!("{reference}: no state entry to remove"))
            })?;
            tool::remove_tool(ctx, &reference.name, entry)
                .map_err(|err| err.for_resource(reference))?;
        }
        Kind::InstallerRepository => {
            let entry = state.repositories.get(&reference.name).ok_or_else(|| {
                EnvboxError::State(format!("{reference}: no state entry to remove"))
            })?;
            repository::remove_repository(ctx, &reference.name, entry)
                .map_err(|err| err.for_resource(reference))?;
        }
        Kind::ToolSet => {}
    }
    Ok(StateDelta::Removed { reference: reference.clone() })
}

/// Composes the environment for a delegation command: the resource's
/// configured env plus the `ENVBOX_*` context variables. The process
/// environment is inherited by the shell on top of this map.
pub fn compose_env(
    configured: &BTreeMap<String, String>,
    tool_bin_path: &str,
    install_path: Option<&str>,
) -> BTreeMap<String, String> {
    let mut env = configured.clone();
    env.insert("ENVBOX_TOOL_BIN_PATH".to_string(), tool_bin_path.to_string());
    if let Some(path) = install_path {
        env.insert("ENVBOX_INSTALL_PATH".to_string(), path.to_string());
    }
    env
}
