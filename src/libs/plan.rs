// Action computation and taint propagation.
// The planner diffs the desired manifest set against the persisted state
// and decides, per resource, what this apply must do. Versions pinned
// exactly compare by semver (with a string-inequality fallback when a
// version does not parse); latest/alias versions are sticky and only
// re-resolve when the update flag is set. A second pass propagates taints:
// upgrading a runtime with `taint_on_upgrade` forces every tool installed
// through it to reinstall.

use crate::libs::errors::EnvboxError;
use crate::libs::graph::{DependencyGraph, Layer};
use crate::libs::version_resolver::{classify_version, parse_semver_lenient, resolve_version};
use crate::log_debug;
use crate::schemas::resource::{Kind, Ref, Resource};
use crate::schemas::state_file::{TAINT_RUNTIME_UPGRADED, UserState, VersionKind};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// The engine's decision for one resource in this apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    None,
    Install,
    Upgrade,
    Downgrade,
    Reinstall,
    Remove,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::None => "none",
            Action::Install => "install",
            Action::Upgrade => "upgrade",
            Action::Downgrade => "downgrade",
            Action::Reinstall => "reinstall",
            Action::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// One planned action, with enough context to display and to execute.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub reference: Ref,
    pub action: Action,
    /// Why the planner chose this action, for the plan display.
    pub reason: String,
    /// Taint reason attached by propagation (or carried from state).
    pub taint_reason: Option<String>,
    /// Version already resolved during planning (update-flag path);
    /// installers reuse it instead of resolving again.
    pub resolved_version: Option<String>,
}

/// The complete plan: per-resource actions for manifest resources, the
/// execution layers, and the removals for state entries with no manifest.
#[derive(Debug)]
pub struct Plan {
    pub actions: BTreeMap<Ref, PlannedAction>,
    pub layers: Vec<Layer>,
    pub removals: Vec<PlannedAction>,
}

impl Plan {
    pub fn action_for(&self, reference: &Ref) -> Action {
        self.actions
            .get(reference)
            .map(|p| p.action)
            .unwrap_or(Action::None)
    }

    /// True when nothing would change.
    pub fn is_noop(&self) -> bool {
        self.removals.is_empty()
            && self.actions.values().all(|p| p.action == Action::None)
    }
}

pub struct PlanOptions {
    /// Forces re-resolution of latest/alias versions.
    pub update_latest: bool,
}

/// Computes the plan for a manifest set against the current state.
///
/// Tool sets must be expanded before calling. The graph is built and
/// resolved here so configuration and graph errors surface before any
/// network traffic or execution.
pub fn compute_plan(
    agent: &ureq::Agent,
    resources: &[Resource],
    state: &UserState,
    options: &PlanOptions,
) -> Result<Plan, EnvboxError> {
    for resource in resources {
        resource.validate()?;
    }

    let graph = DependencyGraph::from_resources(resources);
    let layers = graph.resolve()?;

    let mut actions: BTreeMap<Ref, PlannedAction> = BTreeMap::new();
    for resource in resources {
        let planned = plan_resource(agent, resource, state, options)?;
        actions.insert(planned.reference.clone(), planned);
    }

    // Builtin installers materialized by the graph have nothing to
    // install; give them explicit no-op entries so layers render fully.
    for layer in &layers {
        for node in &layer.nodes {
            if graph.is_builtin_node(node) {
                actions.entry(node.clone()).or_insert_with(|| PlannedAction {
                    reference: node.clone(),
                    action: Action::None,
                    reason: "builtin installer".to_string(),
                    taint_reason: None,
                    resolved_version: None,
                });
            }
        }
    }

    propagate_taints(resources, &mut actions);

    // State entries whose manifest disappeared (or was disabled) are
    // removed. Disabled tools are planned in plan_resource; this pass
    // catches entries with no manifest at all.
    let manifest_refs: std::collections::BTreeSet<Ref> =
        resources.iter().map(|r| r.reference()).collect();
    let mut removals = Vec::new();
    for reference in state.references() {
        if !manifest_refs.contains(&reference) {
            log_debug!(
                "[Plan] {} is in state but not in the manifest set; scheduling removal",
                reference.to_string().yellow()
            );
            removals.push(PlannedAction {
                reference,
                action: Action::Remove,
                reason: "no longer present in manifests".to_string(),
                taint_reason: None,
                resolved_version: None,
            });
        }
    }
    // Disabled-but-installed resources also remove.
    for planned in actions.values() {
        if planned.action == Action::Remove {
            removals.push(planned.clone());
        }
    }

    Ok(Plan { actions, layers, removals })
}

/// Decides the action for one manifest resource.
fn plan_resource(
    agent: &ureq::Agent,
    resource: &Resource,
    state: &UserState,
    options: &PlanOptions,
) -> Result<PlannedAction, EnvboxError> {
    let reference = resource.reference();
    let mut planned = PlannedAction {
        reference: reference.clone(),
        action: Action::None,
        reason: String::new(),
        taint_reason: None,
        resolved_version: None,
    };

    // Disabled tools: remove when installed, ignore otherwise.
    if let Resource::Tool { spec, .. } = resource {
        if !spec.is_enabled() {
            if state.contains(&reference) {
                planned.action = Action::Remove;
                planned.reason = "disabled in manifest".to_string();
            } else {
                planned.reason = "disabled".to_string();
            }
            return Ok(planned);
        }
    }

    let Some(current) = current_version_info(resource, state) else {
        planned.action = Action::Install;
        planned.reason = "not installed".to_string();
        return Ok(planned);
    };

    // A taint recorded in state forces a reinstall before anything else.
    if let Some(taint) = current.taint_reason {
        planned.action = Action::Reinstall;
        planned.reason = format!("tainted: {taint}");
        planned.taint_reason = Some(taint);
        return Ok(planned);
    }

    let spec_version = spec_version_of(resource);
    let spec_kind = classify_version(spec_version);

    match spec_kind {
        VersionKind::Exact => {
            if spec_version != current.version {
                let (action, reason) = compare_exact(spec_version, &current.version);
                planned.action = action;
                planned.reason = reason;
            } else {
                planned.reason = "up to date".to_string();
            }
        }
        VersionKind::Latest | VersionKind::Alias => {
            if options.update_latest {
                let resolvers = effective_resolvers(resource);
                let resolved = resolve_version(agent, spec_version, &resolvers)
                    .map_err(|err| err.for_resource(&reference))?;
                if resolved.version != spec_version && resolved.version != current.version {
                    planned.action = Action::Upgrade;
                    planned.reason = format!(
                        "update requested: {} -> {}",
                        current.version, resolved.version
                    );
                    planned.resolved_version = Some(resolved.version);
                } else {
                    planned.reason = "already at the resolved version".to_string();
                }
            } else if material_change(resource, state) {
                planned.action = Action::Reinstall;
                planned.reason = "spec changed materially".to_string();
            } else {
                // Sticky: latest/alias stays put until an update is asked for.
                planned.reason = "sticky version (pass --update-latest to re-resolve)".to_string();
            }
        }
    }
    Ok(planned)
}

struct CurrentVersionInfo {
    version: String,
    taint_reason: Option<String>,
}

fn current_version_info(resource: &Resource, state: &UserState) -> Option<CurrentVersionInfo> {
    let reference = resource.reference();
    match reference.kind {
        Kind::Runtime => state.runtimes.get(&reference.name).map(|s| CurrentVersionInfo {
            version: s.version.clone(),
            taint_reason: s.taint_reason.clone(),
        }),
        Kind::Tool => state.tools.get(&reference.name).map(|s| CurrentVersionInfo {
            version: s.version.clone(),
            taint_reason: s.taint_reason.clone(),
        }),
        Kind::Installer => state.installers.get(&reference.name).map(|s| CurrentVersionInfo {
            version: s.version.clone(),
            taint_reason: s.taint_reason.clone(),
        }),
        // Repositories are versionless; presence alone decides.
        Kind::InstallerRepository => {
            state.repositories.get(&reference.name).map(|_| CurrentVersionInfo {
                version: String::new(),
                taint_reason: None,
            })
        }
        Kind::ToolSet => None,
    }
}

fn spec_version_of(resource: &Resource) -> &str {
    match resource {
        Resource::Runtime { spec, .. } => &spec.version,
        Resource::Tool { spec, .. } => &spec.version,
        Resource::Installer { spec, .. } => &spec.version,
        Resource::InstallerRepository { .. } | Resource::ToolSet { .. } => "",
    }
}

/// The resolver command list for a resource. Tools backed by an
/// `owner/repo` package default to that repository's latest GitHub
/// release when they configure nothing themselves.
pub fn effective_resolvers(resource: &Resource) -> Vec<String> {
    match resource {
        Resource::Runtime { spec, .. } => {
            if !spec.resolve_version.is_empty() {
                spec.resolve_version.clone()
            } else if let Some(bootstrap) = &spec.bootstrap {
                bootstrap.resolve_version.clone()
            } else {
                Vec::new()
            }
        }
        Resource::Installer { spec, .. } => spec.resolve_version.clone(),
        Resource::Tool { spec, .. } => match &spec.package {
            Some(package) if package.split('/').count() == 2 => {
                vec![format!("github-release:{package}")]
            }
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Semver comparison of two exact versions. Unparseable versions fall
/// back to string inequality, which always reads as an upgrade.
fn compare_exact(desired: &str, current: &str) -> (Action, String) {
    match (parse_semver_lenient(desired), parse_semver_lenient(current)) {
        (Some(want), Some(have)) => match want.cmp(&have) {
            Ordering::Greater => (Action::Upgrade, format!("{current} -> {desired}")),
            Ordering::Less => (Action::Downgrade, format!("{current} -> {desired}")),
            Ordering::Equal => (Action::None, "up to date".to_string()),
        },
        _ => (
            Action::Upgrade,
            format!("{current} -> {desired} (not semver; treated as upgrade)"),
        ),
    }
}

/// Detects material spec changes for sticky latest/alias resources:
/// a different install type, source URL, binaries list or environment
/// warrants a reinstall even without a version change.
fn material_change(resource: &Resource, state: &UserState) -> bool {
    match resource {
        Resource::Runtime { name, spec, .. } => {
            let Some(current) = state.runtimes.get(name) else {
                return false;
            };
            if current.install_type != spec.install_type {
                return true;
            }
            if !spec.binaries.is_empty() && spec.binaries != current.binaries {
                return true;
            }
            spec.env != current.env
        }
        Resource::Tool { name, spec, .. } => {
            let Some(current) = state.tools.get(name) else {
                return false;
            };
            spec.installer_ref != current.installer_ref
                || spec.runtime_ref != current.runtime_ref
                || spec.package != current.package
                || spec
                    .source
                    .as_ref()
                    .map(|s| Some(&s.url) != current.source_url.as_ref())
                    .unwrap_or(false)
        }
        Resource::Installer { name, spec, .. } => {
            let Some(current) = state.installers.get(name) else {
                return false;
            };
            current.install_type != spec.install_type || spec.env != current.env
        }
        _ => false,
    }
}

/// Taint propagation: a runtime with `taint_on_upgrade` scheduled for
/// Upgrade or Reinstall marks every tool with `runtime_ref` pointing at it
/// and action None as Reinstall with reason `runtime_upgraded`. One pass
/// over the action table; layer structure is untouched.
fn propagate_taints(resources: &[Resource], actions: &mut BTreeMap<Ref, PlannedAction>) {
    let tainting_runtimes: Vec<&str> = resources
        .iter()
        .filter_map(|resource| match resource {
            Resource::Runtime { name, spec, .. } if spec.taint_on_upgrade => {
                let action = actions.get(&Ref::runtime(name.clone()))?.action;
                matches!(action, Action::Upgrade | Action::Reinstall).then_some(name.as_str())
            }
            _ => None,
        })
        .collect();
    if tainting_runtimes.is_empty() {
        return;
    }

    for resource in resources {
        let Resource::Tool { name, spec, .. } = resource else {
            continue;
        };
        let Some(runtime) = spec.runtime_ref.as_deref() else {
            continue;
        };
        if !tainting_runtimes.contains(&runtime) {
            continue;
        }
        let reference = Ref::tool(name.clone());
        if let Some(planned) = actions.get_mut(&reference) {
            if planned.action == Action::None {
                log_debug!(
                    "[Plan] Tainting {} because runtime/{} is upgrading",
                    reference.to_string().yellow(),
                    runtime
                );
                planned.action = Action::Reinstall;
                planned.reason = format!("runtime/{runtime} upgraded");
                planned.taint_reason = Some(TAINT_RUNTIME_UPGRADED.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::download::http_agent;
    use crate::schemas::resource::{InstallType, RuntimeSpec, SourceSpec, ToolSpec};
    use crate::schemas::state_file::{RuntimeState, ToolState};
    use std::collections::BTreeMap as Map;

    fn download_runtime(name: &str, version: &str, taint_on_upgrade: bool) -> Resource {
        Resource::Runtime {
            api_version: "v1".into(),
            name: name.into(),
            spec: RuntimeSpec {
                install_type: InstallType::Download,
                version: version.into(),
                source: Some(SourceSpec {
                    url: "https://example.com/{{.Version}}.tar.gz".into(),
                    checksum: None,
                    archive_type: None,
                }),
                bootstrap: None,
                binaries: vec![],
                bin_dir: None,
                tool_bin_path: "~/.envbox/bin".into(),
                commands: None,
                env: Map::new(),
                taint_on_upgrade,
                resolve_version: vec![],
            },
        }
    }

    fn runtime_tool(name: &str, runtime: &str, version: &str) -> Resource {
        Resource::Tool {
            api_version: "v1".into(),
            name: name.into(),
            spec: ToolSpec {
                version: version.into(),
                installer_ref: None,
                runtime_ref: Some(runtime.into()),
                package: Some(name.into()),
                source: None,
                enabled: None,
                commands: None,
            },
        }
    }

    fn runtime_state(version: &str, taint_on_upgrade: bool) -> RuntimeState {
        RuntimeState {
            install_type: InstallType::Download,
            version: version.into(),
            version_kind: VersionKind::Exact,
            spec_version: version.into(),
            digest: None,
            install_path: None,
            binaries: vec![],
            bin_dir: "~/.envbox/bin".into(),
            tool_bin_path: "~/.envbox/bin".into(),
            commands: None,
            env: Map::new(),
            remove_command: None,
            taint_on_upgrade,
            taint_reason: None,
            updated_at: "2025-01-01T00:00:00+00:00".into(),
        }
    }

    fn tool_state(version: &str, runtime: Option<&str>) -> ToolState {
        ToolState {
            version: version.into(),
            version_kind: VersionKind::Exact,
            spec_version: version.into(),
            digest: None,
            install_path: None,
            binaries: vec![],
            runtime_ref: runtime.map(|r| r.to_string()),
            installer_ref: runtime.is_none().then(|| "download".to_string()),
            package: None,
            source_url: None,
            remove_command: None,
            taint_reason: None,
            updated_at: "2025-01-01T00:00:00+00:00".into(),
        }
    }

    fn options() -> PlanOptions {
        PlanOptions { update_latest: false }
    }

    #[test]
    fn missing_resource_installs() {
        let resources = vec![download_runtime("go", "1.25.1", false)];
        let plan =
            compute_plan(&http_agent(), &resources, &UserState::default(), &options()).unwrap();
        assert_eq!(plan.action_for(&Ref::runtime("go")), Action::Install);
    }

    #[test]
    fn exact_version_bump_upgrades_and_drop_downgrades() {
        let mut state = UserState::default();
        state.runtimes.insert("go".into(), runtime_state("1.25.0", false));

        let up = vec![download_runtime("go", "1.25.1", false)];
        let plan = compute_plan(&http_agent(), &up, &state, &options()).unwrap();
        assert_eq!(plan.action_for(&Ref::runtime("go")), Action::Upgrade);

        let down = vec![download_runtime("go", "1.24.0", false)];
        let plan = compute_plan(&http_agent(), &down, &state, &options()).unwrap();
        assert_eq!(plan.action_for(&Ref::runtime("go")), Action::Downgrade);
    }

    #[test]
    fn equal_versions_do_nothing() {
        let mut state = UserState::default();
        state.runtimes.insert("go".into(), runtime_state("1.25.1", false));
        let resources = vec![download_runtime("go", "1.25.1", false)];
        let plan = compute_plan(&http_agent(), &resources, &state, &options()).unwrap();
        assert_eq!(plan.action_for(&Ref::runtime("go")), Action::None);
        assert!(plan.is_noop());
    }

    #[test]
    fn latest_is_sticky_without_update_flag() {
        let mut state = UserState::default();
        let mut installed = runtime_state("1.25.0", false);
        installed.version_kind = VersionKind::Latest;
        installed.spec_version = "latest".into();
        state.runtimes.insert("go".into(), installed);

        let resources = vec![download_runtime("go", "latest", false)];
        let plan = compute_plan(&http_agent(), &resources, &state, &options()).unwrap();
        assert_eq!(plan.action_for(&Ref::runtime("go")), Action::None);
    }

    #[test]
    fn state_taint_forces_reinstall() {
        let mut state = UserState::default();
        let mut installed = tool_state("0.16.0", Some("go"));
        installed.taint_reason = Some(TAINT_RUNTIME_UPGRADED.to_string());
        state.tools.insert("gopls".into(), installed);
        state.runtimes.insert("go".into(), runtime_state("1.25.1", true));

        let resources = vec![
            download_runtime("go", "1.25.1", true),
            runtime_tool("gopls", "go", "0.16.0"),
        ];
        let plan = compute_plan(&http_agent(), &resources, &state, &options()).unwrap();
        assert_eq!(plan.action_for(&Ref::tool("gopls")), Action::Reinstall);
    }

    #[test]
    fn runtime_upgrade_taints_dependent_tools() {
        let mut state = UserState::default();
        state.runtimes.insert("go".into(), runtime_state("1.25.0", true));
        state.tools.insert("gopls".into(), tool_state("0.16.0", Some("go")));

        let resources = vec![
            download_runtime("go", "1.25.1", true),
            runtime_tool("gopls", "go", "0.16.0"),
        ];
        let plan = compute_plan(&http_agent(), &resources, &state, &options()).unwrap();
        assert_eq!(plan.action_for(&Ref::runtime("go")), Action::Upgrade);

        let gopls = &plan.actions[&Ref::tool("gopls")];
        assert_eq!(gopls.action, Action::Reinstall);
        assert_eq!(gopls.taint_reason.as_deref(), Some(TAINT_RUNTIME_UPGRADED));
    }

    #[test]
    fn runtime_without_taint_flag_does_not_taint() {
        let mut state = UserState::default();
        state.runtimes.insert("go".into(), runtime_state("1.25.0", false));
        state.tools.insert("gopls".into(), tool_state("0.16.0", Some("go")));

        let resources = vec![
            download_runtime("go", "1.25.1", false),
            runtime_tool("gopls", "go", "0.16.0"),
        ];
        let plan = compute_plan(&http_agent(), &resources, &state, &options()).unwrap();
        assert_eq!(plan.action_for(&Ref::tool("gopls")), Action::None);
    }

    #[test]
    fn vanished_state_entries_schedule_removal() {
        let mut state = UserState::default();
        state.tools.insert("jq".into(), tool_state("1.7", None));

        let plan = compute_plan(&http_agent(), &[], &state, &options()).unwrap();
        assert_eq!(plan.removals.len(), 1);
        assert_eq!(plan.removals[0].reference, Ref::tool("jq"));
        assert_eq!(plan.removals[0].action, Action::Remove);
    }

    #[test]
    fn disabled_tool_with_state_removes() {
        let mut state = UserState::default();
        state.tools.insert("jq".into(), tool_state("1.7", None));

        let mut tool = runtime_tool("jq", "go", "1.7");
        if let Resource::Tool { spec, .. } = &mut tool {
            spec.enabled = Some(false);
            spec.runtime_ref = None;
            spec.installer_ref = Some("download".into());
        }
        let plan = compute_plan(&http_agent(), &[tool], &state, &options()).unwrap();
        assert_eq!(plan.action_for(&Ref::tool("jq")), Action::Remove);
        assert_eq!(plan.removals.len(), 1);
    }

    #[test]
    fn unparseable_versions_fall_back_to_string_inequality() {
        let (action, _) = compare_exact("build-7", "build-5");
        assert_eq!(action, Action::Upgrade);
    }

    #[test]
    fn builtin_installer_tool_plans_install_in_two_layers() {
        let ripgrep = Resource::Tool {
            api_version: "v1".into(),
            name: "ripgrep".into(),
            spec: ToolSpec {
                version: "v14.0.0".into(),
                installer_ref: Some("download".into()),
                runtime_ref: None,
                package: Some("BurntSushi/ripgrep".into()),
                source: None,
                enabled: None,
                commands: None,
            },
        };
        let plan =
            compute_plan(&http_agent(), &[ripgrep], &UserState::default(), &options()).unwrap();

        assert_eq!(plan.action_for(&Ref::tool("ripgrep")), Action::Install);
        assert_eq!(plan.layers.len(), 2);
        assert_eq!(plan.layers[0].nodes, vec![Ref::installer("download")]);
        assert_eq!(plan.layers[1].nodes, vec![Ref::tool("ripgrep")]);
        // The builtin has an explicit no-op entry.
        assert_eq!(plan.action_for(&Ref::installer("download")), Action::None);
    }
}
