// Runtime (and installer) installation.
// Two patterns, selected by the spec's type:
//
// Download: resolve the version, render the source URL, download into a
// staging directory next to the final location, verify the checksum,
// extract, move the extracted root into `runtimes/<name>/<version>` and
// link the binaries into the bin directory. Upgrades stage the new
// version completely before the old version's artifacts are deleted.
//
// Delegation: render and run the bootstrap install (or update) command,
// then the check command; envbox records the remove command but does not
// own the artifact layout.

use crate::installers::{InstallContext, compose_env, shell};
use crate::libs::download;
use crate::libs::errors::EnvboxError;
use crate::libs::plan::{Action, PlannedAction};
use crate::libs::template::{TemplateVars, render};
use crate::libs::utilities::binary::{binary_dir, detect_binaries};
use crate::libs::utilities::checksum;
use crate::libs::utilities::compression::{detect_extracted_root, extract_archive};
use crate::libs::utilities::file_operations::{
    remove_path_if_exists, rename_or_copy, replace_symlink,
};
use crate::libs::utilities::paths::{expand_tilde, resolve_dir};
use crate::libs::utilities::platform;
use crate::libs::utilities::timestamps::current_timestamp;
use crate::libs::version_resolver::{classify_version, resolve_version};
use crate::schemas::resource::{BootstrapSpec, InstallType, InstallerSpec, Kind, RuntimeSpec, SourceSpec};
use crate::schemas::state_file::{InstallerState, RuntimeState, VersionKind};
use crate::{log_debug, log_info};
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Installs (or upgrades/reinstalls) a runtime, returning its new state.
pub fn install_runtime(
    ctx: &InstallContext,
    name: &str,
    spec: &RuntimeSpec,
    planned: &PlannedAction,
) -> Result<RuntimeState, EnvboxError> {
    let previous = ctx.state.runtimes.get(name);
    install_like_runtime(
        ctx,
        Kind::Runtime,
        name,
        &RuntimeLikeSpec {
            install_type: spec.install_type,
            version: &spec.version,
            source: spec.source.as_ref(),
            bootstrap: spec.bootstrap.as_ref(),
            binaries: &spec.binaries,
            bin_dir: spec.bin_dir.as_deref(),
            tool_bin_path: &spec.tool_bin_path,
            commands: spec.commands.clone(),
            env: &spec.env,
            taint_on_upgrade: spec.taint_on_upgrade,
            resolve_version: &spec.resolve_version,
        },
        planned,
        previous,
    )
}

/// Installers install exactly like runtimes; only defaults differ:
/// a missing `tool_bin_path` falls back to the user bin directory.
pub fn install_installer(
    ctx: &InstallContext,
    name: &str,
    spec: &InstallerSpec,
    planned: &PlannedAction,
) -> Result<InstallerState, EnvboxError> {
    let default_bin = ctx.paths.bin_dir.to_string_lossy().into_owned();
    let previous = ctx.state.installers.get(name);
    install_like_runtime(
        ctx,
        Kind::Installer,
        name,
        &RuntimeLikeSpec {
            install_type: spec.install_type,
            version: &spec.version,
            source: spec.source.as_ref(),
            bootstrap: spec.bootstrap.as_ref(),
            binaries: &spec.binaries,
            bin_dir: spec.bin_dir.as_deref(),
            tool_bin_path: spec.tool_bin_path.as_deref().unwrap_or(&default_bin),
            commands: spec.commands.clone(),
            env: &spec.env,
            taint_on_upgrade: false,
            resolve_version: &spec.resolve_version,
        },
        planned,
        previous,
    )
}

/// The shared shape of runtimes and installers.
struct RuntimeLikeSpec<'a> {
    install_type: InstallType,
    version: &'a str,
    source: Option<&'a SourceSpec>,
    bootstrap: Option<&'a BootstrapSpec>,
    binaries: &'a [String],
    bin_dir: Option<&'a str>,
    tool_bin_path: &'a str,
    commands: Option<crate::schemas::resource::ToolCommands>,
    env: &'a BTreeMap<String, String>,
    taint_on_upgrade: bool,
    resolve_version: &'a [String],
}

fn install_like_runtime(
    ctx: &InstallContext,
    kind: Kind,
    name: &str,
    spec: &RuntimeLikeSpec<'_>,
    planned: &PlannedAction,
    previous: Option<&RuntimeState>,
) -> Result<RuntimeState, EnvboxError> {
    // Version resolution runs before any URL expansion. The planner may
    // already have resolved (update-flag path); reuse that answer.
    let resolved = match &planned.resolved_version {
        Some(version) => crate::libs::version_resolver::ResolvedVersion {
            version: version.clone(),
            kind: classify_version(spec.version),
        },
        None => {
            let resolvers: Vec<String> = if !spec.resolve_version.is_empty() {
                spec.resolve_version.to_vec()
            } else if let Some(bootstrap) = spec.bootstrap {
                bootstrap.resolve_version.clone()
            } else {
                Vec::new()
            };
            resolve_version(&ctx.agent, spec.version, &resolvers)?
        }
    };

    match spec.install_type {
        InstallType::Download => {
            install_download(ctx, kind, name, spec, planned, previous, resolved)
        }
        InstallType::Delegation => install_delegation(ctx, kind, name, spec, planned, resolved),
    }
}

fn install_download(
    ctx: &InstallContext,
    kind: Kind,
    name: &str,
    spec: &RuntimeLikeSpec<'_>,
    planned: &PlannedAction,
    previous: Option<&RuntimeState>,
    resolved: crate::libs::version_resolver::ResolvedVersion,
) -> Result<RuntimeState, EnvboxError> {
    let source = spec.source.ok_or_else(|| {
        EnvboxError::Configuration("download type requires 'source'".to_string())
    })?;
    if resolved.kind != VersionKind::Exact && resolved.version == spec.version {
        return Err(EnvboxError::Resolution(format!(
            "cannot install '{}' without resolving it to a concrete version; configure resolve_version",
            spec.version
        )));
    }
    let version = resolved.version.as_str();

    let install_path = match kind {
        Kind::Installer => ctx.paths.installers_dir.join(name).join(version),
        _ => ctx.paths.runtime_install_path(name, version),
    };

    // Reinstalls start from a clean slate; plain installs of an already
    // materialized version only rebuild the symlinks.
    if planned.action == Action::Reinstall {
        remove_path_if_exists(&install_path).map_err(EnvboxError::from)?;
    }

    let mut digest = previous.and_then(|p| p.digest.clone());
    if !install_path.is_dir() {
        digest = Some(materialize_download(ctx, kind, name, source, version, &install_path)?);
    } else {
        log_info!(
            "[Runtime] {} {} already present at {}; rebuilding links",
            name.bold(),
            version.yellow(),
            install_path.display().to_string().dimmed()
        );
    }

    // Binaries: the spec's list, or executables discovered under bin/.
    let binaries = if spec.binaries.is_empty() {
        detect_binaries(&binary_dir(&install_path))
    } else {
        spec.binaries.to_vec()
    };

    let tool_bin_path = expand_tilde(spec.tool_bin_path);
    let bin_dir = resolve_dir(spec.bin_dir, &tool_bin_path);
    let link_source_dir = binary_dir(&install_path);
    for binary in &binaries {
        let target = link_source_dir.join(binary);
        let link = bin_dir.join(binary);
        replace_symlink(&target, &link).map_err(EnvboxError::from)?;
        log_debug!(
            "[Runtime] Linked {} -> {}",
            link.display().to_string().green(),
            target.display().to_string().dimmed()
        );
    }

    // With the new version fully linked, an upgrade may drop the old
    // version's artifacts.
    if let Some(old) = previous {
        if let Some(old_path) = &old.install_path {
            let old_path = PathBuf::from(old_path);
            if old_path != install_path && old_path.exists() {
                log_debug!(
                    "[Runtime] Removing superseded artifacts at {}",
                    old_path.display().to_string().dimmed()
                );
                remove_path_if_exists(&old_path).map_err(EnvboxError::from)?;
            }
        }
    }

    Ok(RuntimeState {
        install_type: InstallType::Download,
        version: version.to_string(),
        version_kind: resolved.kind,
        spec_version: spec.version.to_string(),
        digest,
        install_path: Some(install_path.to_string_lossy().into_owned()),
        binaries,
        bin_dir: bin_dir.to_string_lossy().into_owned(),
        tool_bin_path: tool_bin_path.to_string_lossy().into_owned(),
        commands: spec.commands.clone(),
        env: spec.env.clone(),
        remove_command: None,
        taint_on_upgrade: spec.taint_on_upgrade,
        taint_reason: None,
        updated_at: current_timestamp(),
    })
}

/// Downloads, verifies and extracts one artifact, staging next to the
/// final location so the last move is a rename. Returns the archive's
/// SHA-256 digest.
fn materialize_download(
    ctx: &InstallContext,
    kind: Kind,
    name: &str,
    source: &SourceSpec,
    version: &str,
    install_path: &Path,
) -> Result<String, EnvboxError> {
    let vars = TemplateVars::for_artifact(version, &platform::current_os(), &platform::current_arch());
    let url = render(&source.url, &vars)?;

    let stage_parent = install_path
        .parent()
        .ok_or_else(|| EnvboxError::Filesystem(format!("{install_path:?} has no parent")))?;
    std::fs::create_dir_all(stage_parent).map_err(EnvboxError::from)?;
    let stage = tempfile::Builder::new()
        .prefix(".stage-")
        .tempdir_in(stage_parent)
        .map_err(EnvboxError::from)?;

    let file_name = url
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("artifact")
        .to_string();
    let archive_path = stage.path().join(&file_name);

    log_info!("[Runtime] Downloading {} {} from {}", name.bold(), version.yellow(), url.cyan());
    let progress = ctx.progress_sink(kind, name);
    download::download_file(&ctx.agent, &url, &archive_path, Some(&progress), Some(&ctx.cancel))?;

    verify_source_checksum(ctx, source, &archive_path, &file_name, version, &vars)?;
    let digest = checksum::sha256_file(&archive_path).map_err(EnvboxError::from)?;

    let extract_dir = stage.path().join("extracted");
    extract_archive(&archive_path, &extract_dir, source.archive_type.as_deref())?;
    let root = detect_extracted_root(&extract_dir)?;
    rename_or_copy(&root, install_path).map_err(EnvboxError::from)?;
    Ok(digest)
}

/// Applies the spec's checksum when one is configured: a direct
/// `algo:hex` value wins over a URL pointing at a checksum file.
pub fn verify_source_checksum(
    ctx: &InstallContext,
    source: &SourceSpec,
    archive_path: &Path,
    file_name: &str,
    version: &str,
    vars: &TemplateVars,
) -> Result<(), EnvboxError> {
    let Some(spec) = &source.checksum else {
        return Ok(());
    };
    let rendered = render(spec, vars)?;

    if let Some((algorithm, expected)) = checksum::parse_direct(&rendered) {
        return checksum::verify_file(archive_path, algorithm, &expected);
    }

    // Not a direct value: treat it as a URL to a checksum document.
    let body = download::get_text(&ctx.agent, &rendered, 1024 * 1024)?;
    let Some(expected) = checksum::find_digest(&body, version, file_name) else {
        return Err(EnvboxError::Integrity(format!(
            "checksum file {rendered} has no entry for {file_name}"
        )));
    };
    let algorithm = checksum::ChecksumAlgorithm::infer_from_digest(&expected).ok_or_else(|| {
        EnvboxError::Integrity(format!("cannot infer checksum algorithm for digest '{expected}'"))
    })?;
    checksum::verify_file(archive_path, algorithm, &expected)
}

fn install_delegation(
    ctx: &InstallContext,
    kind: Kind,
    name: &str,
    spec: &RuntimeLikeSpec<'_>,
    planned: &PlannedAction,
    resolved: crate::libs::version_resolver::ResolvedVersion,
) -> Result<RuntimeState, EnvboxError> {
    let bootstrap = spec.bootstrap.ok_or_else(|| {
        EnvboxError::Configuration("delegation type requires 'bootstrap'".to_string())
    })?;
    let version = resolved.version.as_str();
    let vars = TemplateVars::new().set("Version", version);

    let tool_bin_path = expand_tilde(spec.tool_bin_path);
    let env = compose_env(spec.env, &tool_bin_path.to_string_lossy(), None);
    let on_line = ctx.output_sink(kind, name);

    // Upgrades and reinstalls prefer the dedicated update command.
    let command_template = match planned.action {
        Action::Upgrade | Action::Reinstall => {
            bootstrap.update.as_deref().unwrap_or(&bootstrap.install)
        }
        _ => &bootstrap.install,
    };
    let install_command = render(command_template, &vars)?;
    log_info!("[Runtime] Bootstrapping {} {} via delegation", name.bold(), version.yellow());
    shell::run_shell(&install_command, &env, None, &on_line, Some(&ctx.cancel))?;

    let check_command = render(&bootstrap.check, &vars)?;
    shell::run_shell(&check_command, &env, None, &on_line, Some(&ctx.cancel))?;

    let remove_command = match &bootstrap.remove {
        Some(template) => Some(render(template, &vars)?),
        None => None,
    };

    Ok(RuntimeState {
        install_type: InstallType::Delegation,
        version: version.to_string(),
        version_kind: resolved.kind,
        spec_version: spec.version.to_string(),
        digest: None,
        install_path: None,
        binaries: Vec::new(),
        bin_dir: tool_bin_path.to_string_lossy().into_owned(),
        tool_bin_path: tool_bin_path.to_string_lossy().into_owned(),
        commands: spec.commands.clone(),
        env: spec.env.clone(),
        remove_command,
        taint_on_upgrade: spec.taint_on_upgrade,
        taint_reason: None,
        updated_at: current_timestamp(),
    })
}

/// Removes a runtime (or installer): symlinks first, then artifacts.
/// Delegation installs run their recorded remove command instead of
/// touching an artifact layout envbox does not own.
pub fn remove_runtime(
    ctx: &InstallContext,
    kind: Kind,
    name: &str,
    state: &RuntimeState,
) -> Result<(), EnvboxError> {
    match state.install_type {
        InstallType::Download => {
            let bin_dir = PathBuf::from(&state.bin_dir);
            for binary in &state.binaries {
                let link = bin_dir.join(binary);
                log_debug!("[Runtime] Removing link {}", link.display().to_string().dimmed());
                remove_path_if_exists(&link).map_err(EnvboxError::from)?;
            }
            if let Some(install_path) = &state.install_path {
                remove_path_if_exists(Path::new(install_path)).map_err(EnvboxError::from)?;
                // Drop the now-empty per-name directory when possible.
                if let Some(parent) = Path::new(install_path).parent() {
                    let _ = std::fs::remove_dir(parent);
                }
            }
        }
        InstallType::Delegation => {
            if let Some(command) = &state.remove_command {
                let env = compose_env(&state.env, &state.tool_bin_path, None);
                let on_line = ctx.output_sink(kind, name);
                shell::run_shell(command, &env, None, &on_line, Some(&ctx.cancel))?;
            } else {
                log_info!(
                    "[Runtime] {} is delegation-managed with no remove command; leaving artifacts in place",
                    name.bold()
                );
            }
        }
    }
    Ok(())
}
