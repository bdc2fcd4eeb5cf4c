// Resource Model
// Defines the typed manifest resources envbox reconciles: runtimes, tools,
// installers, installer repositories and tool sets. Every resource exposes a
// uniform (kind, name) identity plus the dependency references the graph
// resolver consumes. Tool sets are a manifest convenience and are expanded
// into plain tools before planning.

use crate::libs::errors::EnvboxError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Names of the installers envbox provides without a manifest entry.
/// Dependencies on these resolve even when no `Installer` resource with
/// the name exists in the manifest set.
pub const BUILTIN_INSTALLERS: &[&str] = &["download", "registry"];

/// The kind of a manifest resource. Keys in the state file and dependency
/// references both carry a kind, so normalization accepts case-insensitive
/// input (`tool`, `Tool`, `TOOL` all parse).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Runtime,
    Tool,
    Installer,
    InstallerRepository,
    ToolSet,
}

impl Kind {
    /// Parses a kind name, ignoring case and the `-`/`_` separator style.
    pub fn parse(input: &str) -> Option<Kind> {
        let normalized: String = input
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "runtime" => Some(Kind::Runtime),
            "tool" => Some(Kind::Tool),
            "installer" => Some(Kind::Installer),
            "installerrepository" => Some(Kind::InstallerRepository),
            "toolset" => Some(Kind::ToolSet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Runtime => "runtime",
            Kind::Tool => "tool",
            Kind::Installer => "installer",
            Kind::InstallerRepository => "installer_repository",
            Kind::ToolSet => "tool_set",
        }
    }

    /// Ordering weight used inside a dependency layer: runtimes first, then
    /// installers, installer repositories, tools, everything else last.
    pub fn priority(&self) -> u32 {
        match self {
            Kind::Runtime => 100,
            Kind::Installer => 200,
            Kind::InstallerRepository => 250,
            Kind::Tool => 300,
            Kind::ToolSet => 1000,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (kind, name) pair identifying one resource. Used as a dependency edge
/// target, a state key, and the identity the engine reports events under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ref {
    pub kind: Kind,
    pub name: String,
}

impl Ref {
    pub fn new(kind: Kind, name: impl Into<String>) -> Ref {
        Ref { kind, name: name.into() }
    }

    pub fn runtime(name: impl Into<String>) -> Ref {
        Ref::new(Kind::Runtime, name)
    }

    pub fn tool(name: impl Into<String>) -> Ref {
        Ref::new(Kind::Tool, name)
    }

    pub fn installer(name: impl Into<String>) -> Ref {
        Ref::new(Kind::Installer, name)
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for Ref {
    type Err = EnvboxError;

    /// Parses `kind/name`. Both `tool/jq` and `Tool/jq` are accepted.
    fn from_str(input: &str) -> Result<Ref, EnvboxError> {
        let (kind_part, name_part) = input.split_once('/').ok_or_else(|| {
            EnvboxError::Configuration(format!("invalid reference '{input}': expected kind/name"))
        })?;
        let kind = Kind::parse(kind_part).ok_or_else(|| {
            EnvboxError::Configuration(format!("invalid reference '{input}': unknown kind '{kind_part}'"))
        })?;
        if name_part.is_empty() {
            return Err(EnvboxError::Configuration(format!(
                "invalid reference '{input}': empty name"
            )));
        }
        Ok(Ref::new(kind, name_part))
    }
}

/// How a runtime or installer is put on disk: either envbox downloads and
/// manages the artifact itself, or it delegates to an external bootstrap
/// script that owns the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallType {
    Download,
    Delegation,
}

impl fmt::Display for InstallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallType::Download => f.write_str("download"),
            InstallType::Delegation => f.write_str("delegation"),
        }
    }
}

/// Where a download-type resource fetches its archive from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Download URL; may contain template variables like `{{.Version}}`.
    pub url: String,
    /// Checksum specification: either `algo:hex` or a URL to a checksum file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Declared archive type (`tar.gz`, `tar.xz`, `zip`, `raw`). Inferred
    /// from the URL suffix when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_type: Option<String>,
}

/// Delegation scripts for a runtime or installer that manages itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSpec {
    /// Installs the runtime. `{{.Version}}` is expanded before execution.
    pub install: String,
    /// Verifies the installation; non-zero exit fails the resource.
    pub check: String,
    /// Removes the runtime. Recorded in state for later use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove: Option<String>,
    /// Used instead of `install` when the action is Upgrade or Reinstall.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
    /// Version alias resolution commands, tried before installation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolve_version: Vec<String>,
}

/// Command templates a runtime (or delegation installer) provides for
/// installing tools through it. Templates see `{{.Version}}`,
/// `{{.Package}}` and `{{.ToolBinPath}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommands {
    pub install: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove: Option<String>,
}

/// Specification of a language runtime (go, node, python toolchains...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSpec {
    #[serde(rename = "type")]
    pub install_type: InstallType,
    /// Exact version, `latest`, or an alias resolved via `resolve_version`.
    #[serde(default)]
    pub version: String,
    /// Download source; required for download-type runtimes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,
    /// Delegation scripts; required for delegation-type runtimes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapSpec>,
    /// Binaries to link into the bin directory. Auto-detected under
    /// `<install_path>/bin/` when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binaries: Vec<String>,
    /// Directory the runtime's binaries are linked into. Defaults to
    /// `tool_bin_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<String>,
    /// Directory tools installed through this runtime place binaries in.
    pub tool_bin_path: String,
    /// Command templates for installing tools through this runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<ToolCommands>,
    /// Environment injected into every delegation command of this runtime
    /// and of tools installed through it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// When true, upgrading or reinstalling this runtime taints every tool
    /// installed through it.
    #[serde(default)]
    pub taint_on_upgrade: bool,
    /// Version alias resolution commands.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolve_version: Vec<String>,
}

/// Specification of a single tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(default)]
    pub version: String,
    /// Exactly one of `installer_ref` / `runtime_ref` must be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_ref: Option<String>,
    /// Package identity. For registry-backed installs this is `owner/repo`;
    /// for runtime installs it is whatever the runtime's install command
    /// expects as `{{.Package}}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    /// Direct download source, overriding registry resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,
    /// Disabled tools are removed if currently installed and otherwise
    /// ignored. Defaults to enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Per-tool command overrides for runtime-delegated installs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<ToolCommands>,
}

impl ToolSpec {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Specification of an installer. Structurally a runtime that exists to
/// install tools rather than to be used directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerSpec {
    #[serde(rename = "type")]
    pub install_type: InstallType,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binaries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_bin_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<ToolCommands>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolve_version: Vec<String>,
}

/// How an installer repository is materialized on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositorySourceType {
    Delegation,
    Git,
}

impl fmt::Display for RepositorySourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositorySourceType::Delegation => f.write_str("delegation"),
            RepositorySourceType::Git => f.write_str("git"),
        }
    }
}

/// Commands a delegation-sourced installer repository runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryCommands {
    pub install: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySource {
    #[serde(rename = "type")]
    pub source_type: RepositorySourceType,
    /// Clone URL; required for git sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Delegation commands; `install` is required for delegation sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<RepositoryCommands>,
}

/// A repository of packages consumed by a specific installer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerRepositorySpec {
    pub installer_ref: String,
    pub source: RepositorySource,
}

/// One entry of a tool set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolItem {
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

/// A manifest convenience: a named map of tools sharing one inherited
/// installer or runtime reference. Expanded into plain `Tool` resources
/// before graph construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_ref: Option<String>,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolItem>,
}

/// A fully parsed manifest resource: shared metadata plus the kind-specific
/// specification.
#[derive(Debug, Clone)]
pub enum Resource {
    Runtime { api_version: String, name: String, spec: RuntimeSpec },
    Tool { api_version: String, name: String, spec: ToolSpec },
    Installer { api_version: String, name: String, spec: InstallerSpec },
    InstallerRepository { api_version: String, name: String, spec: InstallerRepositorySpec },
    ToolSet { api_version: String, name: String, spec: ToolSetSpec },
}

impl Resource {
    pub fn kind(&self) -> Kind {
        match self {
            Resource::Runtime { .. } => Kind::Runtime,
            Resource::Tool { .. } => Kind::Tool,
            Resource::Installer { .. } => Kind::Installer,
            Resource::InstallerRepository { .. } => Kind::InstallerRepository,
            Resource::ToolSet { .. } => Kind::ToolSet,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Resource::Runtime { name, .. }
            | Resource::Tool { name, .. }
            | Resource::Installer { name, .. }
            | Resource::InstallerRepository { name, .. }
            | Resource::ToolSet { name, .. } => name,
        }
    }

    pub fn reference(&self) -> Ref {
        Ref::new(self.kind(), self.name())
    }

    /// The dependency edges this resource contributes to the graph.
    /// Runtimes and download/delegation installers are leaves; tools point
    /// at their installer or runtime; installer repositories point at the
    /// installer they serve.
    pub fn dependencies(&self) -> Vec<Ref> {
        match self {
            Resource::Runtime { .. } | Resource::Installer { .. } => Vec::new(),
            Resource::Tool { spec, .. } => {
                let mut deps = Vec::new();
                if let Some(installer) = &spec.installer_ref {
                    deps.push(Ref::installer(installer.clone()));
                }
                if let Some(runtime) = &spec.runtime_ref {
                    deps.push(Ref::runtime(runtime.clone()));
                }
                deps
            }
            Resource::InstallerRepository { spec, .. } => {
                vec![Ref::installer(spec.installer_ref.clone())]
            }
            Resource::ToolSet { spec, .. } => {
                let mut deps = Vec::new();
                if let Some(installer) = &spec.installer_ref {
                    deps.push(Ref::installer(installer.clone()));
                }
                if let Some(runtime) = &spec.runtime_ref {
                    deps.push(Ref::runtime(runtime.clone()));
                }
                deps
            }
        }
    }

    /// Validates required spec fields. Failures are configuration errors
    /// surfaced at plan time, before any execution.
    pub fn validate(&self) -> Result<(), EnvboxError> {
        let reference = self.reference();
        match self {
            Resource::Runtime { spec, .. } => {
                validate_install_fields(
                    &reference,
                    spec.install_type,
                    spec.source.as_ref(),
                    spec.bootstrap.as_ref(),
                )?;
                if spec.tool_bin_path.is_empty() {
                    return Err(EnvboxError::Configuration(format!(
                        "{reference}: 'tool_bin_path' is required"
                    )));
                }
                Ok(())
            }
            Resource::Installer { spec, .. } => validate_install_fields(
                &reference,
                spec.install_type,
                spec.source.as_ref(),
                spec.bootstrap.as_ref(),
            ),
            Resource::Tool { spec, .. } => {
                match (&spec.installer_ref, &spec.runtime_ref) {
                    (Some(_), Some(_)) => Err(EnvboxError::Configuration(format!(
                        "{reference}: 'installer_ref' and 'runtime_ref' are mutually exclusive"
                    ))),
                    (None, None) => Err(EnvboxError::Configuration(format!(
                        "{reference}: one of 'installer_ref' or 'runtime_ref' is required"
                    ))),
                    _ => Ok(()),
                }
            }
            Resource::InstallerRepository { spec, .. } => match spec.source.source_type {
                RepositorySourceType::Git => {
                    if spec.source.url.as_deref().unwrap_or("").is_empty() {
                        return Err(EnvboxError::Configuration(format!(
                            "{reference}: git source requires 'url'"
                        )));
                    }
                    Ok(())
                }
                RepositorySourceType::Delegation => {
                    let has_install = spec
                        .source
                        .commands
                        .as_ref()
                        .map(|c| !c.install.is_empty())
                        .unwrap_or(false);
                    if !has_install {
                        return Err(EnvboxError::Configuration(format!(
                            "{reference}: delegation source requires 'commands.install'"
                        )));
                    }
                    Ok(())
                }
            },
            Resource::ToolSet { spec, .. } => {
                if spec.installer_ref.is_some() && spec.runtime_ref.is_some() {
                    return Err(EnvboxError::Configuration(format!(
                        "{reference}: 'installer_ref' and 'runtime_ref' are mutually exclusive"
                    )));
                }
                if spec.installer_ref.is_none() && spec.runtime_ref.is_none() {
                    return Err(EnvboxError::Configuration(format!(
                        "{reference}: one of 'installer_ref' or 'runtime_ref' is required"
                    )));
                }
                Ok(())
            }
        }
    }
}

fn validate_install_fields(
    reference: &Ref,
    install_type: InstallType,
    source: Option<&SourceSpec>,
    bootstrap: Option<&BootstrapSpec>,
) -> Result<(), EnvboxError> {
    match install_type {
        InstallType::Download => {
            if source.is_none() {
                return Err(EnvboxError::Configuration(format!(
                    "{reference}: download type requires 'source'"
                )));
            }
        }
        InstallType::Delegation => {
            if bootstrap.is_none() {
                return Err(EnvboxError::Configuration(format!(
                    "{reference}: delegation type requires 'bootstrap'"
                )));
            }
        }
    }
    Ok(())
}

/// Expands every tool set into plain tools carrying the inherited
/// installer/runtime reference, then checks the whole set for duplicate
/// (kind, name) identities. Conflicts abort before reconciliation.
pub fn expand_tool_sets(resources: Vec<Resource>) -> Result<Vec<Resource>, EnvboxError> {
    let mut expanded: Vec<Resource> = Vec::with_capacity(resources.len());

    for resource in resources {
        match resource {
            Resource::ToolSet { api_version, spec, .. } => {
                for (tool_name, item) in spec.tools {
                    expanded.push(Resource::Tool {
                        api_version: api_version.clone(),
                        name: tool_name,
                        spec: ToolSpec {
                            version: item.version,
                            installer_ref: spec.installer_ref.clone(),
                            runtime_ref: spec.runtime_ref.clone(),
                            package: item.package,
                            source: item.source,
                            enabled: item.enabled,
                            commands: None,
                        },
                    });
                }
            }
            other => expanded.push(other),
        }
    }

    let mut seen: std::collections::BTreeSet<Ref> = std::collections::BTreeSet::new();
    for resource in &expanded {
        if !seen.insert(resource.reference()) {
            return Err(EnvboxError::Configuration(format!(
                "duplicate resource '{}': every (kind, name) pair must be unique",
                resource.reference()
            )));
        }
    }

    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing_is_case_insensitive() {
        assert_eq!(Kind::parse("tool"), Some(Kind::Tool));
        assert_eq!(Kind::parse("Tool"), Some(Kind::Tool));
        assert_eq!(Kind::parse("RUNTIME"), Some(Kind::Runtime));
        assert_eq!(Kind::parse("InstallerRepository"), Some(Kind::InstallerRepository));
        assert_eq!(Kind::parse("installer_repository"), Some(Kind::InstallerRepository));
        assert_eq!(Kind::parse("nonsense"), None);
    }

    #[test]
    fn ref_parses_both_string_forms() {
        let lower: Ref = "tool/jq".parse().unwrap();
        let upper: Ref = "Tool/jq".parse().unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.kind, Kind::Tool);
        assert_eq!(lower.name, "jq");
        assert!("jq".parse::<Ref>().is_err());
        assert!("widget/jq".parse::<Ref>().is_err());
    }

    #[test]
    fn tool_set_expansion_inherits_ref() {
        let set = Resource::ToolSet {
            api_version: "v1".into(),
            name: "cli-tools".into(),
            spec: ToolSetSpec {
                installer_ref: Some("download".into()),
                runtime_ref: None,
                tools: BTreeMap::from([
                    (
                        "ripgrep".to_string(),
                        ToolItem {
                            version: "v14.0.0".into(),
                            enabled: None,
                            source: None,
                            package: Some("BurntSushi/ripgrep".into()),
                        },
                    ),
                    (
                        "jq".to_string(),
                        ToolItem {
                            version: "1.7".into(),
                            enabled: Some(false),
                            source: None,
                            package: Some("jqlang/jq".into()),
                        },
                    ),
                ]),
            },
        };

        let expanded = expand_tool_sets(vec![set]).unwrap();
        assert_eq!(expanded.len(), 2);
        for resource in &expanded {
            let Resource::Tool { spec, .. } = resource else {
                panic!("expected tools after expansion");
            };
            assert_eq!(spec.installer_ref.as_deref(), Some("download"));
        }
    }

    #[test]
    fn expansion_detects_conflicting_names() {
        let set = Resource::ToolSet {
            api_version: "v1".into(),
            name: "set".into(),
            spec: ToolSetSpec {
                installer_ref: Some("download".into()),
                runtime_ref: None,
                tools: BTreeMap::from([(
                    "jq".to_string(),
                    ToolItem {
                        version: "1.7".into(),
                        enabled: None,
                        source: None,
                        package: None,
                    },
                )]),
            },
        };
        let standalone = Resource::Tool {
            api_version: "v1".into(),
            name: "jq".into(),
            spec: ToolSpec {
                version: "1.7".into(),
                installer_ref: Some("download".into()),
                runtime_ref: None,
                package: None,
                source: None,
                enabled: None,
                commands: None,
            },
        };

        let err = expand_tool_sets(vec![set, standalone]).unwrap_err();
        assert!(matches!(err, EnvboxError::Configuration(_)));
        assert!(err.to_string().contains("duplicate resource"));
    }

    #[test]
    fn tool_requires_exactly_one_ref() {
        let both = Resource::Tool {
            api_version: "v1".into(),
            name: "jq".into(),
            spec: ToolSpec {
                version: "1.7".into(),
                installer_ref: Some("download".into()),
                runtime_ref: Some("go".into()),
                package: None,
                source: None,
                enabled: None,
                commands: None,
            },
        };
        assert!(both.validate().is_err());

        let neither = Resource::Tool {
            api_version: "v1".into(),
            name: "jq".into(),
            spec: ToolSpec {
                version: "1.7".into(),
                installer_ref: None,
                runtime_ref: None,
                package: None,
                source: None,
                enabled: None,
                commands: None,
            },
        };
        assert!(neither.validate().is_err());
    }
}
