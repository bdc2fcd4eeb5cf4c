// Tool installation.
// Two paths, selected by which reference the spec carries:
//
// runtime_ref: the tool is installed by the referenced runtime's install
// command template (`cargo install`, `go install`, ...), expanded with
// `{{.Version}}`, `{{.Package}}` and `{{.ToolBinPath}}` and executed with
// the runtime's environment injected. The rendered remove command is
// recorded in state for uninstall.
//
// installer_ref: the tool is an artifact download. A direct `source`
// wins; otherwise the package registry resolves `package` + version into
// a URL and optional checksum. The archive is downloaded, verified,
// extracted into `tools/<name>/<version>` and its binaries linked into
// the user bin directory. The archive's SHA-256 is stored as the digest.

use crate::installers::{InstallContext, compose_env, shell};
use crate::libs::download;
use crate::libs::errors::EnvboxError;
use crate::libs::plan::{Action, PlannedAction};
use crate::libs::registry_resolver::RegistryResolver;
use crate::libs::template::{TemplateVars, render};
use crate::libs::utilities::binary::{
    binary_dir, detect_binaries, find_executables, is_executable_file,
};
use crate::libs::utilities::checksum;
use crate::libs::utilities::compression::{detect_extracted_root, extract_archive};
use crate::libs::utilities::file_operations::{
    make_executable, remove_path_if_exists, rename_or_copy, replace_symlink,
};
use crate::libs::utilities::platform;
use crate::libs::utilities::timestamps::current_timestamp;
use crate::libs::version_resolver::{classify_version, resolve_version};
use crate::schemas::resource::{BUILTIN_INSTALLERS, Kind, ToolCommands, ToolSpec};
use crate::schemas::state_file::{ToolState, VersionKind};
use crate::{log_debug, log_info};
use colored::Colorize;
use std::path::{Path, PathBuf};

pub fn install_tool(
    ctx: &InstallContext,
    name: &str,
    spec: &ToolSpec,
    planned: &PlannedAction,
) -> Result<ToolState, EnvboxError> {
    if let Some(runtime_name) = &spec.runtime_ref {
        let runtime = ctx.state.runtimes.get(runtime_name).ok_or_else(|| {
            EnvboxError::Resolution(format!(
                "runtime/{runtime_name} is not installed; cannot install through it"
            ))
        })?;
        return install_via_commands(ctx, name, spec, planned, Provider::Runtime(runtime_name), runtime);
    }

    // A manifest-defined delegation installer that publishes tool install
    // commands takes the command path; everything else is a download.
    if let Some(installer_name) = &spec.installer_ref {
        if !BUILTIN_INSTALLERS.contains(&installer_name.as_str()) {
            if let Some(installer) = ctx.state.installers.get(installer_name) {
                if installer.commands.is_some() {
                    return install_via_commands(
                        ctx,
                        name,
                        spec,
                        planned,
                        Provider::Installer(installer_name),
                        installer,
                    );
                }
            }
        }
    }
    install_via_download(ctx, name, spec, planned)
}

/// Who provides the install commands for a delegated tool install.
enum Provider<'a> {
    Runtime(&'a str),
    Installer(&'a str),
}

/// Delegated install through the provider's command templates.
/// Layering guarantees the provider ran in an earlier layer, so its
/// state entry is present and durable by the time we execute.
fn install_via_commands(
    ctx: &InstallContext,
    name: &str,
    spec: &ToolSpec,
    planned: &PlannedAction,
    provider: Provider<'_>,
    provider_state: &crate::schemas::state_file::RuntimeState,
) -> Result<ToolState, EnvboxError> {
    let provider_label = match &provider {
        Provider::Runtime(runtime) => format!("runtime/{runtime}"),
        Provider::Installer(installer) => format!("installer/{installer}"),
    };
    let commands: &ToolCommands = spec
        .commands
        .as_ref()
        .or(provider_state.commands.as_ref())
        .ok_or_else(|| {
            EnvboxError::Configuration(format!(
                "{provider_label} defines no tool install commands"
            ))
        })?;

    let version = planned
        .resolved_version
        .clone()
        .unwrap_or_else(|| spec.version.clone());
    let mut vars = TemplateVars::new()
        .set("Version", version.as_str())
        .set("ToolBinPath", provider_state.tool_bin_path.as_str())
        .set("OS", platform::current_os())
        .set("Arch", platform::current_arch());
    if let Some(package) = &spec.package {
        vars = vars.set("Package", package.as_str());
    }

    let env = compose_env(
        &provider_state.env,
        &provider_state.tool_bin_path,
        provider_state.install_path.as_deref(),
    );
    let on_line = ctx.output_sink(Kind::Tool, name);

    let install_command = render(&commands.install, &vars)?;
    log_info!(
        "[Tool] Installing {} {} via {}",
        name.bold(),
        version.yellow(),
        provider_label
    );
    shell::run_shell(&install_command, &env, None, &on_line, Some(&ctx.cancel))?;

    if let Some(check_template) = &commands.check {
        let check_command = render(check_template, &vars)?;
        shell::run_shell(&check_command, &env, None, &on_line, Some(&ctx.cancel))?;
    }

    let remove_command = match &commands.remove {
        Some(template) => Some(render(template, &vars)?),
        None => None,
    };

    let (runtime_ref, installer_ref) = match provider {
        Provider::Runtime(runtime) => (Some(runtime.to_string()), None),
        Provider::Installer(installer) => (None, Some(installer.to_string())),
    };
    Ok(ToolState {
        version: version.clone(),
        version_kind: classify_version(&spec.version),
        spec_version: spec.version.clone(),
        digest: None,
        install_path: None,
        binaries: Vec::new(),
        runtime_ref,
        installer_ref,
        package: spec.package.clone(),
        source_url: None,
        remove_command,
        taint_reason: None,
        updated_at: current_timestamp(),
    })
}

/// Download install: direct source or registry-resolved package.
fn install_via_download(
    ctx: &InstallContext,
    name: &str,
    spec: &ToolSpec,
    planned: &PlannedAction,
) -> Result<ToolState, EnvboxError> {
    let installer_ref = spec.installer_ref.clone().unwrap_or_default();

    // Resolve the version first; URL construction needs it concrete.
    let version = match &planned.resolved_version {
        Some(version) => version.clone(),
        None => {
            let kind = classify_version(&spec.version);
            if kind == VersionKind::Exact {
                spec.version.clone()
            } else {
                let resolvers = crate::libs::plan::effective_resolvers(
                    &crate::schemas::resource::Resource::Tool {
                        api_version: String::new(),
                        name: name.to_string(),
                        spec: spec.clone(),
                    },
                );
                let resolved = resolve_version(&ctx.agent, &spec.version, &resolvers)?;
                if resolved.version == spec.version {
                    return Err(EnvboxError::Resolution(format!(
                        "cannot resolve version '{}' for {name}; set 'package' or pin a version",
                        spec.version
                    )));
                }
                resolved.version
            }
        }
    };

    // Where the artifact comes from: an explicit source template wins,
    // otherwise the registry resolves the package.
    let vars = TemplateVars::for_artifact(&version, &platform::current_os(), &platform::current_arch());
    let (url, checksum_source, format, mut binaries) = match &spec.source {
        Some(source) => {
            let checksum_rendered = match &source.checksum {
                Some(template) => Some(render(template, &vars)?),
                None => None,
            };
            (
                render(&source.url, &vars)?,
                checksum_rendered,
                source.archive_type.clone(),
                Vec::new(),
            )
        }
        None => {
            let package = spec.package.as_deref().ok_or_else(|| {
                EnvboxError::Configuration(
                    "download install needs either 'source' or 'package'".to_string(),
                )
            })?;
            let resolver = RegistryResolver::new(
                ctx.agent.clone(),
                &ctx.paths.registry_cache_dir,
                &ctx.registry_ref,
            )
            .with_base_url(&ctx.registry_base_url);
            let resolved = resolver.resolve(package, &version)?;
            if !resolved.errors.is_empty() {
                return Err(EnvboxError::Resolution(resolved.errors.join("; ")));
            }
            (resolved.url, resolved.checksum_url, resolved.format, resolved.binaries)
        }
    };

    let install_path = ctx.paths.tool_install_path(name, &version);
    if planned.action == Action::Reinstall {
        remove_path_if_exists(&install_path).map_err(EnvboxError::from)?;
    }

    let mut digest = ctx.state.tools.get(name).and_then(|t| t.digest.clone());
    if !install_path.is_dir() {
        let outcome = fetch_and_extract(
            ctx,
            name,
            &url,
            checksum_source.as_deref(),
            format.as_deref(),
            &version,
            &install_path,
        )?;
        digest = Some(outcome);
    } else {
        log_info!(
            "[Tool] {} {} already present; rebuilding links",
            name.bold(),
            version.yellow()
        );
    }

    // Pair every binary name with the path the symlink must point at.
    let link_source_dir = binary_dir(&install_path);
    let mut links: Vec<(String, PathBuf)> = binaries
        .iter()
        .map(|binary| (binary.clone(), link_source_dir.join(binary)))
        .collect();
    if links.is_empty() {
        links = detect_binaries(&link_source_dir)
            .into_iter()
            .map(|binary| {
                let target = link_source_dir.join(&binary);
                (binary, target)
            })
            .collect();
    }
    if links.is_empty() {
        // Some archives bury the binary a directory or two deep.
        links = binary_links_from_paths(find_executables(&install_path, 4));
    }
    if links.is_empty() {
        // Raw single-binary downloads ship one file without the
        // executable bit; when exactly one regular file exists, that file
        // is the tool.
        links = binary_links_from_paths(single_file_fallback(&install_path)?);
    }
    if links.is_empty() {
        return Err(EnvboxError::Integrity(format!(
            "no executable found in the extracted artifact for {name}"
        )));
    }

    for (binary, target) in &links {
        // Single-file raw artifacts may need their executable bit set.
        if target.is_file() && !is_executable_file(target) {
            make_executable(target).map_err(EnvboxError::from)?;
        }
        let link = ctx.paths.bin_dir.join(binary);
        replace_symlink(target, &link).map_err(EnvboxError::from)?;
        log_debug!(
            "[Tool] Linked {} -> {}",
            link.display().to_string().green(),
            target.display().to_string().dimmed()
        );
    }
    binaries = links.iter().map(|(binary, _)| binary.clone()).collect();

    // Stage-then-swap: the old version's directory goes away only after
    // the new one is fully linked.
    if let Some(previous) = ctx.state.tools.get(name) {
        if let Some(old_path) = &previous.install_path {
            let old_path = PathBuf::from(old_path);
            if old_path != install_path && old_path.exists() {
                remove_path_if_exists(&old_path).map_err(EnvboxError::from)?;
            }
        }
    }

    Ok(ToolState {
        version: version.clone(),
        version_kind: classify_version(&spec.version),
        spec_version: spec.version.clone(),
        digest,
        install_path: Some(install_path.to_string_lossy().into_owned()),
        binaries,
        runtime_ref: None,
        installer_ref: Some(installer_ref),
        package: spec.package.clone(),
        source_url: Some(url),
        remove_command: None,
        taint_reason: None,
        updated_at: current_timestamp(),
    })
}

/// The sole regular file in an install root, made executable; empty when
/// the root holds anything but exactly one file.
fn single_file_fallback(install_path: &Path) -> Result<Vec<PathBuf>, EnvboxError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(install_path)
        .map_err(EnvboxError::from)?
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    if files.len() != 1 {
        return Ok(Vec::new());
    }
    let file = files.remove(0);
    make_executable(&file).map_err(EnvboxError::from)?;
    Ok(vec![file])
}

/// Turns discovered executable paths into (link name, target) pairs,
/// keyed by file name.
fn binary_links_from_paths(paths: Vec<PathBuf>) -> Vec<(String, PathBuf)> {
    paths
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            Some((name, path))
        })
        .collect()
}

/// Download, verify, extract, move into place. Returns the archive digest.
fn fetch_and_extract(
    ctx: &InstallContext,
    name: &str,
    url: &str,
    checksum_source: Option<&str>,
    format: Option<&str>,
    version: &str,
    install_path: &Path,
) -> Result<String, EnvboxError> {
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

    log_info!("[Tool] Downloading {} from {}", name.bold(), url.cyan());
    let progress = ctx.progress_sink(Kind::Tool, name);
    download::download_file(&ctx.agent, url, &archive_path, Some(&progress), Some(&ctx.cancel))?;

    if let Some(source) = checksum_source {
        verify_checksum_source(ctx, source, &archive_path, &file_name, version)?;
    }
    let digest = checksum::sha256_file(&archive_path).map_err(EnvboxError::from)?;

    let extract_dir = stage.path().join("extracted");
    extract_archive(&archive_path, &extract_dir, format)?;
    let root = detect_extracted_root(&extract_dir)?;
    rename_or_copy(&root, install_path).map_err(EnvboxError::from)?;
    Ok(digest)
}

/// Verifies an archive against a checksum source that is either a direct
/// `algo:hex` value or a URL to a GNU/JSON checksum document.
fn verify_checksum_source(
    ctx: &InstallContext,
    source: &str,
    archive_path: &Path,
    file_name: &str,
    version: &str,
) -> Result<(), EnvboxError> {
    if let Some((algorithm, expected)) = checksum::parse_direct(source) {
        return checksum::verify_file(archive_path, algorithm, &expected);
    }
    let body = download::get_text(&ctx.agent, source, 1024 * 1024)?;
    let Some(expected) = checksum::find_digest(&body, version, file_name) else {
        return Err(EnvboxError::Integrity(format!(
            "checksum document {source} has no entry for {file_name}"
        )));
    };
    let algorithm = checksum::ChecksumAlgorithm::infer_from_digest(&expected).ok_or_else(|| {
        EnvboxError::Integrity(format!("cannot infer checksum algorithm for digest '{expected}'"))
    })?;
    checksum::verify_file(archive_path, algorithm, &expected)
}

/// Removes a tool: symlinks first, then artifacts. Command-delegated
/// tools run their recorded remove command instead.
pub fn remove_tool(ctx: &InstallContext, name: &str, state: &ToolState) -> Result<(), EnvboxError> {
    // Command-delegated installs own no artifact layout here; the stored
    // remove command is the whole uninstall.
    if state.install_path.is_none() {
        if let Some(command) = &state.remove_command {
            let env = state
                .runtime_ref
                .as_deref()
                .and_then(|runtime| ctx.state.runtimes.get(runtime))
                .or_else(|| {
                    state
                        .installer_ref
                        .as_deref()
                        .and_then(|installer| ctx.state.installers.get(installer))
                })
                .map(|provider| {
                    compose_env(&provider.env, &provider.tool_bin_path, None)
                })
                .unwrap_or_default();
            let on_line = ctx.output_sink(Kind::Tool, name);
            shell::run_shell(command, &env, None, &on_line, Some(&ctx.cancel))?;
        } else if state.binaries.is_empty() {
            log_info!(
                "[Tool] {} was installed by delegation with no remove command; leaving it in place",
                name.bold()
            );
        }
        return Ok(());
    }

    for binary in &state.binaries {
        let link = ctx.paths.bin_dir.join(binary);
        log_debug!("[Tool] Removing link {}", link.display().to_string().dimmed());
        remove_path_if_exists(&link).map_err(EnvboxError::from)?;
    }
    if let Some(install_path) = &state.install_path {
        remove_path_if_exists(Path::new(install_path)).map_err(EnvboxError::from)?;
        if let Some(parent) = Path::new(install_path).parent() {
            let _ = std::fs::remove_dir(parent);
        }
    }
    Ok(())
}
