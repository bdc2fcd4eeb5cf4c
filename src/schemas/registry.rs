// Package Registry Schema (`registry.yaml`)
// A registry describes, per package, how to turn an `owner/repo` identity
// and a version into a concrete download URL: an asset name template, an
// optional checksum asset, OS/arch spelling replacements, per-platform
// overrides and per-version-range overrides. The resolver in
// `libs/registry_resolver.rs` consumes these shapes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Checksum companion asset published next to the release artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChecksumSpec {
    /// Asset name template (e.g. `checksums.txt` or
    /// `{{.Asset}}.sha256`). Rendered with the same variables as `asset`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    /// Full URL template, for `http`-type packages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Hash algorithm; inferred from digest length when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
}

/// A per-platform override, matched against the current (os, arch) pair.
/// Empty fields fall through to the package-level values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsArchOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goos: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goarch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replacements: BTreeMap<String, String>,
}

impl OsArchOverride {
    /// Whether this override applies to the given platform. Absent fields
    /// match anything.
    pub fn matches(&self, os: &str, arch: &str) -> bool {
        self.goos.as_deref().map(|v| v == os).unwrap_or(true)
            && self.goarch.as_deref().map(|v| v == arch).unwrap_or(true)
    }
}

/// A version-range override. The first override whose constraint matches
/// the requested version replaces the corresponding package-level fields.
///
/// `version_prefix` distinguishes "absent" (keep the base value) from
/// "present but empty" (clear the base value); that is why it is an
/// `Option<String>` rather than a defaulted string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionOverride {
    #[serde(default)]
    pub version_constraint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChecksumSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacements: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Vec<OsArchOverride>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_envs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binaries: Option<Vec<String>>,
}

/// The registry entry for one package.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageInfo {
    /// Source type: `github_release` or `http`.
    #[serde(rename = "type", default)]
    pub source_type: String,
    /// Asset name template for `github_release` packages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    /// Full URL template for `http` packages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Archive format of the asset (`tar.gz`, `zip`, `raw`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Tag prefix inserted between the release path and the version
    /// (e.g. `kustomize/` for kustomize's `kustomize/v5.0.0` tags).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChecksumSpec>,
    /// Spelling replacements applied independently to the os and arch
    /// template variables (e.g. `darwin: macOS`, `amd64: x86_64`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replacements: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<OsArchOverride>,
    /// Environments the package publishes artifacts for. Entries are
    /// `all`, an os name, or `os/arch`. Empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_envs: Vec<String>,
    /// Constraint selecting versions served by the top-level fields;
    /// when it does not match, `version_overrides` are consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_constraint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub version_overrides: Vec<VersionOverride>,
    /// Binaries to place after extraction. Auto-detected when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binaries: Vec<String>,
}
