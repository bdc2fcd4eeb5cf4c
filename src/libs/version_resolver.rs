// Version classification and alias resolution.
//
// A spec version is one of three kinds:
//   - `""` / `"latest"` (exact ASCII, case-sensitive): the latest sentinel,
//   - anything matching `v?MAJOR[.MINOR[.PATCH]][-pre][+build]`: exact,
//   - any other non-empty string: an alias.
//
// Latest and alias versions are resolved to a concrete version through the
// resource's `resolve_version` command list. Three strategies exist, picked
// by the first command's prefix:
//   github-release:owner/repo[:tagPrefix]   latest GitHub release tag
//   http-text:<url>:<regex>                 first regex match in a text body
//   <anything else>                         run as a shell command

use crate::installers::shell;
use crate::libs::download;
use crate::libs::errors::EnvboxError;
use crate::libs::template::{TemplateVars, render};
use crate::log_debug;
use crate::schemas::state_file::VersionKind;
use colored::Colorize;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

const HTTP_TEXT_BODY_CAP: u64 = 1024 * 1024;

/// The outcome of version resolution: a concrete version string plus the
/// classification of the *spec* version (so sticky latest/alias handling
/// survives into state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub version: String,
    pub kind: VersionKind,
}

fn exact_version_regex() -> &'static Regex {
    static EXACT: OnceLock<Regex> = OnceLock::new();
    EXACT.get_or_init(|| {
        Regex::new(r"^v?\d+(\.\d+){0,2}(-[A-Za-z0-9.]+)?(\+[A-Za-z0-9.]+)?$")
            .expect("exact version pattern is valid")
    })
}

/// Classifies a spec version string.
pub fn classify_version(version: &str) -> VersionKind {
    if version.is_empty() || version == "latest" {
        VersionKind::Latest
    } else if exact_version_regex().is_match(version) {
        VersionKind::Exact
    } else {
        VersionKind::Alias
    }
}

/// Parses a version leniently as semver: a leading `v` is stripped and
/// missing minor/patch components are padded with zeros. Returns `None`
/// for anything that still does not parse.
pub fn parse_semver_lenient(version: &str) -> Option<semver::Version> {
    let trimmed = version.strip_prefix('v').unwrap_or(version);
    if let Ok(parsed) = semver::Version::parse(trimmed) {
        return Some(parsed);
    }
    // Pad "1" and "1.2" style versions to three components, preserving any
    // pre-release/build suffix.
    let (core, suffix) = match trimmed.find(['-', '+']) {
        Some(at) => (&trimmed[..at], &trimmed[at..]),
        None => (trimmed, ""),
    };
    let dots = core.matches('.').count();
    let padded = match dots {
        0 => format!("{core}.0.0{suffix}"),
        1 => format!("{core}.0{suffix}"),
        _ => return None,
    };
    semver::Version::parse(&padded).ok()
}

/// Resolves a spec version to a concrete version.
///
/// Exact versions pass through untouched, even when a resolver is
/// configured. Latest/alias versions run the first command of
/// `resolvers`; an empty resolver list passes the spec version through
/// with its classification (the registry path resolves `latest` itself).
pub fn resolve_version(
    agent: &ureq::Agent,
    spec_version: &str,
    resolvers: &[String],
) -> Result<ResolvedVersion, EnvboxError> {
    let kind = classify_version(spec_version);
    if resolvers.is_empty() || kind == VersionKind::Exact {
        return Ok(ResolvedVersion { version: spec_version.to_string(), kind });
    }

    let command = resolvers[0].as_str();
    log_debug!(
        "[Version] Resolving '{}' via '{}'",
        spec_version.yellow(),
        command.cyan()
    );

    let version = if let Some(rest) = command.strip_prefix("github-release:") {
        resolve_github_release(agent, rest)?
    } else if let Some(rest) = command.strip_prefix("http-text:") {
        resolve_http_text(agent, rest)?
    } else {
        resolve_shell(command, spec_version)?
    };

    if version.is_empty() {
        return Err(EnvboxError::Resolution(format!(
            "version resolver '{command}' produced an empty version"
        )));
    }
    Ok(ResolvedVersion { version, kind })
}

#[derive(Debug, Deserialize)]
struct LatestRelease {
    tag_name: String,
}

/// `github-release:owner/repo[:tagPrefix]` — queries the repository's
/// latest release and strips the optional tag prefix.
fn resolve_github_release(agent: &ureq::Agent, spec: &str) -> Result<String, EnvboxError> {
    let (repo_part, tag_prefix) = match spec.split_once(':') {
        Some((repo, prefix)) => (repo, Some(prefix)),
        None => (spec, None),
    };
    if repo_part.split('/').count() != 2 {
        return Err(EnvboxError::Resolution(format!(
            "invalid github-release resolver '{spec}': expected owner/repo"
        )));
    }

    let url = format!("https://api.github.com/repos/{repo_part}/releases/latest");
    let response = download::get_with_retries(agent, &url)
        .map_err(|err| EnvboxError::Resolution(err.to_string()))?;
    let release: LatestRelease = response.into_json().map_err(|err| {
        EnvboxError::Resolution(format!("parsing latest release of {repo_part}: {err}"))
    })?;

    let tag = release.tag_name;
    Ok(match tag_prefix {
        Some(prefix) => tag.strip_prefix(prefix).unwrap_or(&tag).to_string(),
        None => tag,
    })
}

/// `http-text:<url>:<regex>` — fetches the URL (body capped at 1 MiB) and
/// scans lines for the first regex match, preferring the first capture
/// group. The separator between URL and pattern is the last `:` in the
/// command, so patterns must not contain a colon.
fn resolve_http_text(agent: &ureq::Agent, spec: &str) -> Result<String, EnvboxError> {
    let split_at = spec.rfind(':').ok_or_else(|| {
        EnvboxError::Resolution(format!("invalid http-text resolver '{spec}': expected url:regex"))
    })?;
    let (url, pattern) = (&spec[..split_at], &spec[split_at + 1..]);
    if url.is_empty() || pattern.is_empty() {
        return Err(EnvboxError::Resolution(format!(
            "invalid http-text resolver '{spec}': expected url:regex"
        )));
    }

    let matcher = Regex::new(pattern).map_err(|err| {
        EnvboxError::Resolution(format!("invalid http-text pattern '{pattern}': {err}"))
    })?;
    let body = download::get_text(agent, url, HTTP_TEXT_BODY_CAP)
        .map_err(|err| EnvboxError::Resolution(err.to_string()))?;

    for line in body.lines() {
        if let Some(captures) = matcher.captures(line) {
            let matched = captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            if !matched.is_empty() {
                return Ok(matched);
            }
        }
    }
    Err(EnvboxError::Resolution(format!(
        "no line of {url} matched pattern '{pattern}'"
    )))
}

/// Any other command runs through the shell with `{{.Version}}` expanded;
/// the first line of stdout is the resolved version.
fn resolve_shell(command: &str, spec_version: &str) -> Result<String, EnvboxError> {
    let vars = TemplateVars::new().set("Version", spec_version);
    let rendered = render(command, &vars)?;
    let stdout = shell::run_shell_capture(&rendered, &Default::default(), None)?;
    let first_line = stdout.lines().next().unwrap_or("").trim().to_string();
    if first_line.is_empty() {
        return Err(EnvboxError::Resolution(format!(
            "version command '{rendered}' produced no output"
        )));
    }
    Ok(first_line)
}
