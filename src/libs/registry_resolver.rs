// Package registry resolver.
// Translates a (registry ref, owner/repo, version) triple into a concrete
// download URL plus an optional checksum URL. Resolution is cache-first:
// `<cache>/<ref>/pkgs/<owner>/<repo>/registry.yaml` is consulted before
// the remote registry, and remote fetches are written back to the cache
// atomically so concurrent resolvers never observe torn files.
//
// The resolution pipeline, in order: version-constraint override
// selection, supported-environment filtering, OS/arch override, spelling
// replacements, template rendering of the asset and URL.

use crate::libs::download;
use crate::libs::errors::EnvboxError;
use crate::libs::template::{TemplateVars, render};
use crate::libs::utilities::file_operations::atomic_write;
use crate::libs::utilities::platform;
use crate::{log_debug, log_warn};
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::schemas::registry::{ChecksumSpec, OsArchOverride, PackageInfo};

/// The default registry endpoint. Overridable for tests and mirrors.
pub const DEFAULT_REGISTRY_BASE_URL: &str = "https://registry.envbox.dev";

/// The outcome of resolving one package.
///
/// An unsupported environment is reported through `errors` with an empty
/// URL rather than as an `Err`: the caller decides whether that fails the
/// resource or is merely displayed.
#[derive(Debug, Default, Clone)]
pub struct ResolvedPackage {
    pub url: String,
    pub checksum_url: Option<String>,
    pub format: Option<String>,
    pub binaries: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

pub struct RegistryResolver {
    agent: ureq::Agent,
    cache_dir: PathBuf,
    base_url: String,
    registry_ref: String,
}

impl RegistryResolver {
    pub fn new(agent: ureq::Agent, cache_dir: &Path, registry_ref: &str) -> RegistryResolver {
        RegistryResolver {
            agent,
            cache_dir: cache_dir.to_path_buf(),
            base_url: DEFAULT_REGISTRY_BASE_URL.to_string(),
            registry_ref: registry_ref.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> RegistryResolver {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Resolves `package` (an `owner/repo` pair) at `version` for the
    /// current platform.
    pub fn resolve(&self, package: &str, version: &str) -> Result<ResolvedPackage, EnvboxError> {
        self.resolve_for(package, version, &platform::current_os(), &platform::current_arch())
    }

    /// Platform-parameterized resolution; the tests exercise foreign
    /// platforms through this entry point.
    pub fn resolve_for(
        &self,
        package: &str,
        version: &str,
        os: &str,
        arch: &str,
    ) -> Result<ResolvedPackage, EnvboxError> {
        let info = self.fetch_package_info(package)?;
        resolve_package(&info, package, version, os, arch)
    }

    /// Loads the package descriptor, cache first, remote on a miss.
    pub fn fetch_package_info(&self, package: &str) -> Result<PackageInfo, EnvboxError> {
        validate_package_id(package)?;
        validate_path_segment(&self.registry_ref)?;

        let cache_path = self
            .cache_dir
            .join(&self.registry_ref)
            .join("pkgs")
            .join(package)
            .join("registry.yaml");

        if cache_path.is_file() {
            log_debug!(
                "[Registry] Cache hit for {} at {}",
                package.cyan(),
                cache_path.display().to_string().dimmed()
            );
            let contents = std::fs::read_to_string(&cache_path).map_err(EnvboxError::from)?;
            return parse_package_info(&contents, package);
        }

        let url = format!(
            "{}/{}/pkgs/{}/registry.yaml",
            self.base_url, self.registry_ref, package
        );
        log_debug!("[Registry] Cache miss for {}; fetching {}", package.cyan(), url.dimmed());
        let response = match download::get_with_retries(&self.agent, &url) {
            Ok(response) => response,
            Err(EnvboxError::Transport(message)) if message.contains("HTTP 404") => {
                return Err(EnvboxError::Resolution(format!(
                    "package not found in registry: {package}"
                )));
            }
            Err(EnvboxError::Transport(message)) => {
                return Err(EnvboxError::Transport(format!(
                    "unexpected status fetching registry entry for {package}: {message}"
                )));
            }
            Err(other) => return Err(other),
        };

        let body = response
            .into_string()
            .map_err(|err| EnvboxError::Transport(format!("reading registry entry: {err}")))?;
        let info = parse_package_info(&body, package)?;

        // Last writer wins; readers always see whole files.
        atomic_write(&cache_path, body.as_bytes()).map_err(EnvboxError::from)?;
        Ok(info)
    }
}

fn parse_package_info(body: &str, package: &str) -> Result<PackageInfo, EnvboxError> {
    serde_yaml::from_str(body).map_err(|err| {
        EnvboxError::Resolution(format!("malformed registry entry for {package}: {err}"))
    })
}

/// Rejects package ids that could escape the cache directory: the id must
/// be exactly `owner/repo` with two plain path segments.
fn validate_package_id(package: &str) -> Result<(), EnvboxError> {
    let segments: Vec<&str> = package.split('/').collect();
    if segments.len() != 2 {
        return Err(EnvboxError::Resolution(format!(
            "invalid package id '{package}': expected owner/repo"
        )));
    }
    for segment in segments {
        validate_path_segment(segment)
            .map_err(|_| EnvboxError::Resolution(format!("invalid package id '{package}'")))?;
    }
    Ok(())
}

fn validate_path_segment(segment: &str) -> Result<(), EnvboxError> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(EnvboxError::Resolution(format!("unsafe path segment '{segment}'")));
    }
    let path = Path::new(segment);
    let mut components = path.components();
    let safe = matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none();
    if !safe {
        return Err(EnvboxError::Resolution(format!("unsafe path segment '{segment}'")));
    }
    Ok(())
}

/// The pure resolution pipeline over an already-loaded descriptor.
pub fn resolve_package(
    info: &PackageInfo,
    package: &str,
    version: &str,
    os: &str,
    arch: &str,
) -> Result<ResolvedPackage, EnvboxError> {
    let mut resolved = ResolvedPackage::default();

    // Effective descriptor after version-constraint override selection.
    let mut asset = info.asset.clone();
    let mut url = info.url.clone();
    let mut format = info.format.clone();
    let mut version_prefix = info.version_prefix.clone();
    let mut checksum = info.checksum.clone();
    let mut replacements = info.replacements.clone();
    let mut overrides = info.overrides.clone();
    let mut supported_envs = info.supported_envs.clone();
    let mut binaries = info.binaries.clone();

    let top_level_matches = match &info.version_constraint {
        Some(constraint) => constraint_matches(constraint, version)?,
        None => info.version_overrides.is_empty(),
    };
    if !top_level_matches {
        if let Some(matching) = info
            .version_overrides
            .iter()
            .map(|o| constraint_matches(&o.version_constraint, version).map(|m| (o, m)))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .find_map(|(o, m)| m.then_some(o))
        {
            if matching.asset.is_some() {
                resolved
                    .warnings
                    .push(format!("version {version} uses legacy asset format"));
            }
            if let Some(value) = &matching.asset {
                asset = Some(value.clone());
            }
            if let Some(value) = &matching.url {
                url = Some(value.clone());
            }
            if let Some(value) = &matching.format {
                format = Some(value.clone());
            }
            // `version_prefix: ""` clears the base value; an absent field
            // keeps it. The Option distinguishes the two.
            if let Some(value) = &matching.version_prefix {
                version_prefix = Some(value.clone());
            }
            if let Some(value) = &matching.checksum {
                checksum = Some(value.clone());
            }
            if let Some(value) = &matching.replacements {
                replacements = value.clone();
            }
            if let Some(value) = &matching.overrides {
                overrides = value.clone();
            }
            if let Some(value) = &matching.supported_envs {
                supported_envs = value.clone();
            }
            if let Some(value) = &matching.binaries {
                binaries = value.clone();
            }
        }
    }

    // Environment filtering happens before any template work: an
    // unsupported platform yields errors and an empty URL.
    if !supported_envs.is_empty()
        && !supported_envs
            .iter()
            .any(|entry| platform::env_entry_matches(entry, os, arch))
    {
        resolved
            .errors
            .push(format!("package {package} does not support {os}/{arch}"));
        return Ok(resolved);
    }

    // First matching OS/arch override wins.
    if let Some(matching) = overrides.iter().find(|o| o.matches(os, arch)) {
        apply_os_arch_override(matching, &mut asset, &mut url, &mut format, &mut replacements);
    }

    // Replacements respell os and arch independently.
    let os_spelled = replacements.get(os).cloned().unwrap_or_else(|| os.to_string());
    let arch_spelled = replacements.get(arch).cloned().unwrap_or_else(|| arch.to_string());

    let mut vars = TemplateVars::for_artifact(version, &os_spelled, &arch_spelled);
    if let Some(fmt) = &format {
        vars = vars.set("Format", fmt.as_str());
    }

    let rendered_asset = match &asset {
        Some(template) => {
            let rendered = render(template, &vars)?;
            vars = vars.set("Asset", rendered.as_str());
            Some(rendered)
        }
        None => None,
    };

    resolved.url = match info.source_type.as_str() {
        "github_release" => {
            let asset_name = rendered_asset.clone().ok_or_else(|| {
                EnvboxError::Resolution(format!(
                    "package {package} is github_release but defines no asset"
                ))
            })?;
            let prefix = version_prefix.as_deref().unwrap_or("");
            format!(
                "https://github.com/{package}/releases/download/{prefix}{version}/{asset_name}"
            )
        }
        "http" => {
            let template = url.as_deref().ok_or_else(|| {
                EnvboxError::Resolution(format!("package {package} is http but defines no url"))
            })?;
            render(template, &vars)?
        }
        other => {
            return Err(EnvboxError::Resolution(format!(
                "package {package} has unsupported source type '{other}'"
            )));
        }
    };

    // The checksum URL is best-effort: failures become warnings, not
    // errors, and the download simply goes unverified.
    resolved.checksum_url = match build_checksum_url(
        &checksum,
        &info.source_type,
        package,
        version,
        version_prefix.as_deref().unwrap_or(""),
        &vars,
    ) {
        Ok(value) => value,
        Err(err) => {
            resolved.warnings.push(format!("checksum url: {err}"));
            None
        }
    };

    resolved.format = format;
    resolved.binaries = binaries;
    log_debug!(
        "[Registry] Resolved {}@{} for {}/{} -> {}",
        package.cyan(),
        version.yellow(),
        os,
        arch,
        resolved.url.dimmed()
    );
    for warning in &resolved.warnings {
        log_warn!("[Registry] {}: {}", package.yellow(), warning);
    }
    Ok(resolved)
}

fn apply_os_arch_override(
    matching: &OsArchOverride,
    asset: &mut Option<String>,
    url: &mut Option<String>,
    format: &mut Option<String>,
    replacements: &mut BTreeMap<String, String>,
) {
    if let Some(value) = &matching.asset {
        *asset = Some(value.clone());
    }
    if let Some(value) = &matching.url {
        *url = Some(value.clone());
    }
    if let Some(value) = &matching.format {
        *format = Some(value.clone());
    }
    for (from, to) in &matching.replacements {
        replacements.insert(from.clone(), to.clone());
    }
}

fn build_checksum_url(
    checksum: &Option<ChecksumSpec>,
    source_type: &str,
    package: &str,
    version: &str,
    version_prefix: &str,
    vars: &TemplateVars,
) -> Result<Option<String>, EnvboxError> {
    let Some(spec) = checksum else {
        return Ok(None);
    };
    if let Some(template) = &spec.url {
        return Ok(Some(render(template, vars)?));
    }
    let Some(asset_template) = &spec.asset else {
        return Ok(None);
    };
    let asset_name = render(asset_template, vars)?;
    match source_type {
        "github_release" => Ok(Some(format!(
            "https://github.com/{package}/releases/download/{version_prefix}{version}/{asset_name}"
        ))),
        _ => Ok(None),
    }
}

/// Constraint grammar: `"true"` and the empty string match everything;
/// `semver("<expr>")` matches when the version satisfies the requirement.
fn constraint_matches(constraint: &str, version: &str) -> Result<bool, EnvboxError> {
    let trimmed = constraint.trim();
    if trimmed.is_empty() || trimmed == "true" {
        return Ok(true);
    }
    if let Some(inner) = trimmed
        .strip_prefix("semver(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let expr = inner.trim().trim_matches('"');
        let requirement = semver::VersionReq::parse(expr).map_err(|err| {
            EnvboxError::Configuration(format!("invalid version constraint '{constraint}': {err}"))
        })?;
        let Some(parsed) = crate::libs::version_resolver::parse_semver_lenient(version) else {
            return Ok(false);
        };
        return Ok(requirement.matches(&parsed));
    }
    Err(EnvboxError::Configuration(format!(
        "invalid version constraint '{constraint}': expected \"true\", \"\" or semver(\"...\")"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gh_descriptor() -> PackageInfo {
        serde_yaml::from_str(
            r#"
type: github_release
asset: "gh_{{trimV .Version}}_{{.OS}}_{{.Arch}}.tar.gz"
format: tar.gz
replacements:
  darwin: macOS
checksum:
  asset: "gh_{{trimV .Version}}_checksums.txt"
"#,
        )
        .unwrap()
    }

    #[test]
    fn github_release_resolution_end_to_end() {
        let info = gh_descriptor();
        let resolved = resolve_package(&info, "cli/cli", "v2.86.0", "darwin", "arm64").unwrap();
        assert_eq!(
            resolved.url,
            "https://github.com/cli/cli/releases/download/v2.86.0/gh_2.86.0_macOS_arm64.tar.gz"
        );
        assert_eq!(
            resolved.checksum_url.as_deref(),
            Some("https://github.com/cli/cli/releases/download/v2.86.0/gh_2.86.0_checksums.txt")
        );
        assert!(resolved.errors.is_empty());
    }

    #[test]
    fn unsupported_env_reports_error_with_empty_url() {
        let mut info = gh_descriptor();
        info.supported_envs = vec!["linux/amd64".into(), "darwin/arm64".into()];
        let resolved = resolve_package(&info, "cli/cli", "v2.86.0", "windows", "amd64").unwrap();
        assert_eq!(resolved.url, "");
        assert_eq!(resolved.errors.len(), 1);
        assert!(resolved.errors[0].contains("does not support windows/amd64"));
    }

    #[test]
    fn version_override_replaces_fields_selectively() {
        let mut info = gh_descriptor();
        info.version_constraint = Some("semver(\">= 2.0.0\")".into());
        info.version_prefix = Some("cli/".into());
        info.version_overrides = vec![serde_yaml::from_str(
            r#"
version_constraint: semver("< 2.0.0")
asset: "gh-legacy_{{trimV .Version}}_{{.OS}}_{{.Arch}}.tar.gz"
"#,
        )
        .unwrap()];

        // New versions keep the top-level asset and prefix.
        let new = resolve_package(&info, "cli/cli", "v2.86.0", "linux", "amd64").unwrap();
        assert!(new.url.contains("/cli/v2.86.0/gh_2.86.0_linux_amd64.tar.gz"));
        assert!(new.warnings.is_empty());

        // Old versions pick up the override asset; the untouched
        // version_prefix survives.
        let old = resolve_package(&info, "cli/cli", "v1.9.0", "linux", "amd64").unwrap();
        assert!(old.url.contains("/cli/v1.9.0/gh-legacy_1.9.0_linux_amd64.tar.gz"));
        assert!(old.warnings.iter().any(|w| w.contains("legacy asset format")));
    }

    #[test]
    fn version_prefix_override_distinguishes_empty_from_unset() {
        let mut info = gh_descriptor();
        info.version_constraint = Some("semver(\">= 2.0.0\")".into());
        info.version_prefix = Some("kustomize/".into());
        info.version_overrides = vec![serde_yaml::from_str(
            r#"
version_constraint: semver("< 2.0.0")
version_prefix: ""
"#,
        )
        .unwrap()];

        let kept = resolve_package(&info, "a/b", "v2.1.0", "linux", "amd64").unwrap();
        assert!(kept.url.contains("/download/kustomize/v2.1.0/"));

        let cleared = resolve_package(&info, "a/b", "v1.0.0", "linux", "amd64").unwrap();
        assert!(cleared.url.contains("/download/v1.0.0/"));
    }

    #[test]
    fn os_arch_override_takes_first_match() {
        let mut info = gh_descriptor();
        info.overrides = vec![
            serde_yaml::from_str(
                r#"
goos: windows
asset: "gh_{{trimV .Version}}_windows.zip"
format: zip
"#,
            )
            .unwrap(),
            serde_yaml::from_str(
                r#"
goos: windows
asset: "never-reached.zip"
"#,
            )
            .unwrap(),
        ];
        let resolved = resolve_package(&info, "cli/cli", "v2.86.0", "windows", "amd64").unwrap();
        assert!(resolved.url.ends_with("gh_2.86.0_windows.zip"));
        assert_eq!(resolved.format.as_deref(), Some("zip"));
    }

    #[test]
    fn http_type_renders_url_template() {
        let info: PackageInfo = serde_yaml::from_str(
            r#"
type: http
url: "https://dl.example.com/{{.SemVer}}/tool-{{.OS}}-{{.Arch}}.tar.gz"
"#,
        )
        .unwrap();
        let resolved = resolve_package(&info, "x/y", "v3.1.4", "linux", "arm64").unwrap();
        assert_eq!(resolved.url, "https://dl.example.com/3.1.4/tool-linux-arm64.tar.gz");
    }

    #[test]
    fn unknown_source_type_is_an_error() {
        let info: PackageInfo = serde_yaml::from_str("type: carrier_pigeon").unwrap();
        let err = resolve_package(&info, "x/y", "v1.0.0", "linux", "amd64").unwrap_err();
        assert!(err.to_string().contains("unsupported source type"));
    }

    #[test]
    fn package_id_path_safety() {
        assert!(validate_package_id("cli/cli").is_ok());
        assert!(validate_package_id("cli").is_err());
        assert!(validate_package_id("a/b/c").is_err());
        assert!(validate_package_id("../etc/passwd").is_err());
        assert!(validate_package_id("a/..").is_err());
        assert!(validate_package_id("/abs").is_err());
    }

    #[test]
    fn cache_first_then_remote_with_atomic_write_back() {
        let mut server = mockito::Server::new();
        let descriptor = r#"
type: github_release
asset: "rg-{{trimV .Version}}-{{.OS}}-{{.Arch}}.tar.gz"
"#;
        let mock = server
            .mock("GET", "/v4.465.0/pkgs/BurntSushi/ripgrep/registry.yaml")
            .with_status(200)
            .with_body(descriptor)
            .expect(1)
            .create();

        let cache = tempfile::tempdir().unwrap();
        let resolver = RegistryResolver::new(
            crate::libs::download::http_agent(),
            cache.path(),
            "v4.465.0",
        )
        .with_base_url(&server.url());

        let first = resolver
            .resolve_for("BurntSushi/ripgrep", "v14.0.0", "linux", "amd64")
            .unwrap();
        assert_eq!(
            first.url,
            "https://github.com/BurntSushi/ripgrep/releases/download/v14.0.0/rg-14.0.0-linux-amd64.tar.gz"
        );

        // Second resolution is served from the cache: the mock allows a
        // single hit and would fail the assertion otherwise.
        let second = resolver
            .resolve_for("BurntSushi/ripgrep", "v14.0.0", "linux", "amd64")
            .unwrap();
        assert_eq!(second.url, first.url);
        mock.assert();

        let cached = cache
            .path()
            .join("v4.465.0/pkgs/BurntSushi/ripgrep/registry.yaml");
        assert!(cached.is_file());
    }

    #[test]
    fn missing_package_is_not_found() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/v1/pkgs/no/where/registry.yaml")
            .with_status(404)
            .create();

        let cache = tempfile::tempdir().unwrap();
        let resolver =
            RegistryResolver::new(crate::libs::download::http_agent(), cache.path(), "v1")
                .with_base_url(&server.url());
        let err = resolver.fetch_package_info("no/where").unwrap_err();
        assert!(err.to_string().contains("package not found"));
    }
}
