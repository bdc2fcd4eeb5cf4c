// Application State File Schema (`state.json`)
// Defines the structure of envbox's persistent state, used to compare the
// desired manifests against what is actually installed. The file is managed
// exclusively by the reconciliation engine under a file lock and should not
// be edited by hand. Unknown fields are ignored on read so newer state files
// load in older binaries.

use crate::schemas::resource::{InstallType, Kind, Ref, RepositorySourceType, ToolCommands};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Classification of a spec version string. Recorded in state so the next
/// apply knows whether the version is pinned (`exact`) or sticky
/// (`latest` / `alias`, only re-resolved when an update is requested).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VersionKind {
    Exact,
    #[default]
    Latest,
    Alias,
}

/// Taint reason recorded when a runtime upgrade forces its tools to be
/// reinstalled.
pub const TAINT_RUNTIME_UPGRADED: &str = "runtime_upgraded";

/// State of an installed runtime (or installer, which shares the shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(rename = "type")]
    pub install_type: InstallType,
    /// The concrete version that was installed.
    pub version: String,
    #[serde(default)]
    pub version_kind: VersionKind,
    /// The version string as written in the manifest, before resolution.
    pub spec_version: String,
    /// SHA-256 of the downloaded archive, when the download pattern was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binaries: Vec<String>,
    pub bin_dir: String,
    pub tool_bin_path: String,
    /// Tool install command templates captured from the spec, consulted by
    /// tools whose `runtime_ref` points here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<ToolCommands>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Rendered removal command for delegation installs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_command: Option<String>,
    #[serde(default)]
    pub taint_on_upgrade: bool,
    /// Set when this entry must be reinstalled on the next apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taint_reason: Option<String>,
    pub updated_at: String,
}

/// Installers persist the same shape as runtimes.
pub type InstallerState = RuntimeState;

/// State of an installed tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolState {
    pub version: String,
    #[serde(default)]
    pub version_kind: VersionKind,
    pub spec_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binaries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    /// Source URL the artifact was fetched from, for download installs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Rendered removal command for runtime-delegated installs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taint_reason: Option<String>,
    pub updated_at: String,
}

/// State of a materialized installer repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerRepositoryState {
    pub installer_ref: String,
    pub source_type: RepositorySourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_command: Option<String>,
    pub updated_at: String,
}

/// Tracks which package-registry ref is currently synced into the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryState {
    #[serde(rename = "ref")]
    pub reference: String,
    pub updated_at: String,
}

/// The complete persisted state: one map per resource kind plus the
/// registry tracking entry. This is the unit the state store reads and
/// writes atomically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserState {
    #[serde(default)]
    pub runtimes: BTreeMap<String, RuntimeState>,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolState>,
    #[serde(default)]
    pub installers: BTreeMap<String, InstallerState>,
    #[serde(default)]
    pub repositories: BTreeMap<String, InstallerRepositoryState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryState>,
}

impl UserState {
    /// True when no entry of any kind is recorded.
    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
            && self.tools.is_empty()
            && self.installers.is_empty()
            && self.repositories.is_empty()
    }

    /// Returns every (kind, name) reference currently present in state.
    /// Used by the planner to detect entries whose manifest disappeared.
    pub fn references(&self) -> Vec<Ref> {
        let mut refs = Vec::new();
        refs.extend(self.runtimes.keys().map(|n| Ref::new(Kind::Runtime, n.clone())));
        refs.extend(self.tools.keys().map(|n| Ref::new(Kind::Tool, n.clone())));
        refs.extend(self.installers.keys().map(|n| Ref::new(Kind::Installer, n.clone())));
        refs.extend(
            self.repositories
                .keys()
                .map(|n| Ref::new(Kind::InstallerRepository, n.clone())),
        );
        refs
    }

    pub fn contains(&self, reference: &Ref) -> bool {
        match reference.kind {
            Kind::Runtime => self.runtimes.contains_key(&reference.name),
            Kind::Tool => self.tools.contains_key(&reference.name),
            Kind::Installer => self.installers.contains_key(&reference.name),
            Kind::InstallerRepository => self.repositories.contains_key(&reference.name),
            Kind::ToolSet => false,
        }
    }

    /// Removes the entry for `reference`, returning whether one existed.
    pub fn remove(&mut self, reference: &Ref) -> bool {
        match reference.kind {
            Kind::Runtime => self.runtimes.remove(&reference.name).is_some(),
            Kind::Tool => self.tools.remove(&reference.name).is_some(),
            Kind::Installer => self.installers.remove(&reference.name).is_some(),
            Kind::InstallerRepository => self.repositories.remove(&reference.name).is_some(),
            Kind::ToolSet => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_ignored_on_read() {
        let raw = r#"{
            "runtimes": {},
            "tools": {
                "jq": {
                    "version": "1.7",
                    "version_kind": "exact",
                    "spec_version": "1.7",
                    "installer_ref": "download",
                    "updated_at": "2025-01-01T00:00:00+00:00",
                    "some_future_field": true
                }
            },
            "future_map": {}
        }"#;
        let state: UserState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.tools["jq"].version, "1.7");
        assert!(state.runtimes.is_empty());
    }

    #[test]
    fn references_cover_every_map() {
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
        let refs = state.references();
        assert_eq!(refs, vec![Ref::tool("jq")]);
        assert!(state.contains(&Ref::tool("jq")));
        assert!(state.remove(&Ref::tool("jq")));
        assert!(state.is_empty());
    }
}
