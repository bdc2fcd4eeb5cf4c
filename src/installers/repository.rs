// Installer repository materialization.
// A repository feeds packages to an installer. Git sources are cloned
// into `data/repositories/<name>` (and pulled when already present);
// delegation sources run their configured install command and own their
// layout themselves.

use crate::installers::{InstallContext, shell};
use crate::libs::errors::EnvboxError;
use crate::libs::utilities::file_operations::remove_path_if_exists;
use crate::libs::utilities::timestamps::current_timestamp;
use crate::log_info;
use crate::schemas::resource::{InstallerRepositorySpec, Kind, RepositorySourceType};
use crate::schemas::state_file::InstallerRepositoryState;
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::Path;

pub fn install_repository(
    ctx: &InstallContext,
    name: &str,
    spec: &InstallerRepositorySpec,
) -> Result<InstallerRepositoryState, EnvboxError> {
    let on_line = ctx.output_sink(Kind::InstallerRepository, name);
    let env = BTreeMap::new();

    let (url, local_path, remove_command) = match spec.source.source_type {
        RepositorySourceType::Git => {
            let url = spec.source.url.clone().ok_or_else(|| {
                EnvboxError::Configuration("git source requires 'url'".to_string())
            })?;
            let local_path = ctx.paths.repository_path(name);
            if let Some(parent) = local_path.parent() {
                std::fs::create_dir_all(parent).map_err(EnvboxError::from)?;
            }
            if local_path.join(".git").is_dir() {
                log_info!("[Repository] Updating {} via git pull", name.bold());
                let command = format!("git -C '{}' pull --ff-only", local_path.display());
                shell::run_shell(&command, &env, None, &on_line, Some(&ctx.cancel))?;
            } else {
                log_info!("[Repository] Cloning {} from {}", name.bold(), url.cyan());
                let command = format!("git clone '{}' '{}'", url, local_path.display());
                shell::run_shell(&command, &env, None, &on_line, Some(&ctx.cancel))?;
            }
            (
                Some(url),
                Some(local_path.to_string_lossy().into_owned()),
                None,
            )
        }
        RepositorySourceType::Delegation => {
            let commands = spec.source.commands.as_ref().ok_or_else(|| {
                EnvboxError::Configuration("delegation source requires 'commands'".to_string())
            })?;
            log_info!("[Repository] Installing {} via delegation", name.bold());
            shell::run_shell(&commands.install, &env, None, &on_line, Some(&ctx.cancel))?;
            (spec.source.url.clone(), None, commands.remove.clone())
        }
    };

    Ok(InstallerRepositoryState {
        installer_ref: spec.installer_ref.clone(),
        source_type: spec.source.source_type,
        url,
        local_path,
        remove_command,
        updated_at: current_timestamp(),
    })
}

/// Removes a repository: delegation sources run their remove command,
/// git clones are deleted from disk.
pub fn remove_repository(
    ctx: &InstallContext,
    name: &str,
    state: &InstallerRepositoryState,
) -> Result<(), EnvboxError> {
    match state.source_type {
        RepositorySourceType::Git => {
            if let Some(local_path) = &state.local_path {
                remove_path_if_exists(Path::new(local_path)).map_err(EnvboxError::from)?;
            }
        }
        RepositorySourceType::Delegation => {
            if let Some(command) = &state.remove_command {
                let on_line = ctx.output_sink(Kind::InstallerRepository, name);
                shell::run_shell(command, &BTreeMap::new(), None, &on_line, Some(&ctx.cancel))?;
            } else {
                log_info!(
                    "[Repository] {} has no remove command; leaving its content in place",
                    name.bold()
                );
            }
        }
    }
    Ok(())
}
